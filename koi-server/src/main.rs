use anyhow::Context;
use clap::Parser;
use koi::{
    completion_client_for, embedding_client_for, EmbeddingProvider, HashEmbeddingProvider,
    MemoryOrchestrator, ModelProvider, ProviderKeys, Providers, RetryPolicy, Settings,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod models;
mod state;

use crate::state::AppState;

/// HTTP server for Koi conversational memory
#[derive(Debug, Parser)]
#[command(name = "koi-server", version)]
struct Args {
    #[arg(long, env = "KOI_ADDR", default_value = "0.0.0.0:3000")]
    addr: SocketAddr,

    #[arg(long, env = "KOI_DATA_DIR", default_value = "./koi_data")]
    data_dir: PathBuf,

    #[arg(long, env = "KOI_WINDOW_SIZE", default_value_t = 20)]
    window_size: usize,

    /// Defaults to a fraction of the generation model's context window
    #[arg(long, env = "KOI_TOKEN_BUDGET")]
    token_budget: Option<usize>,

    #[arg(long, env = "KOI_SUMMARIZATION_THRESHOLD", default_value_t = 0.7)]
    summarization_threshold: f32,

    #[arg(long, env = "KOI_LONG_TERM_MEMORY", default_value_t = false)]
    long_term_memory: bool,

    #[arg(long, env = "KOI_ENABLE_TOPIC_EXTRACTION", default_value_t = true, action = clap::ArgAction::Set)]
    enable_topic_extraction: bool,

    #[arg(long, env = "KOI_ENABLE_NER", default_value_t = true, action = clap::ArgAction::Set)]
    enable_ner: bool,

    #[arg(long, env = "KOI_ENABLE_DISCRETE_MEMORY_EXTRACTION", default_value_t = true, action = clap::ArgAction::Set)]
    enable_discrete_memory_extraction: bool,

    #[arg(long, env = "KOI_TOP_K_TOPICS", default_value_t = 3)]
    top_k_topics: usize,

    #[arg(long, env = "KOI_GENERATION_MODEL", default_value = koi::DEFAULT_GENERATION_MODEL)]
    generation_model: String,

    #[arg(long, env = "KOI_EMBEDDING_MODEL", default_value = koi::DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    #[arg(long, env = "KOI_SUMMARY_WORKERS", default_value_t = 2)]
    summary_workers: usize,

    #[arg(long, env = "KOI_LOCK_TIMEOUT_MS", default_value_t = 5_000)]
    lock_timeout_ms: u64,

    #[arg(long, env = "KOI_RETRY_ATTEMPTS", default_value_t = 3)]
    retry_attempts: u32,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL")]
    openai_base_url: Option<String>,

    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    anthropic_api_key: Option<String>,
}

impl Args {
    fn settings(&self) -> koi::Result<Settings> {
        let mut builder = Settings::builder()
            .window_size(self.window_size)
            .summarization_threshold(self.summarization_threshold)
            .long_term_memory(self.long_term_memory)
            .enable_topic_extraction(self.enable_topic_extraction)
            .enable_ner(self.enable_ner)
            .enable_discrete_memory_extraction(self.enable_discrete_memory_extraction)
            .top_k_topics(self.top_k_topics)
            .generation_model(self.generation_model.clone())
            .embedding_model(self.embedding_model.clone())
            .summary_workers(self.summary_workers)
            .lock_timeout(Duration::from_millis(self.lock_timeout_ms))
            .retry(RetryPolicy {
                max_attempts: self.retry_attempts,
                ..RetryPolicy::default()
            });
        if let Some(budget) = self.token_budget {
            builder = builder.token_budget(budget);
        }
        builder.build()
    }

    fn keys(&self) -> ProviderKeys {
        ProviderKeys {
            openai_api_key: self.openai_api_key.clone(),
            openai_base_url: self.openai_base_url.clone(),
            anthropic_api_key: self.anthropic_api_key.clone(),
        }
    }
}

fn providers(settings: &Settings, keys: &ProviderKeys) -> anyhow::Result<Providers> {
    let completion = completion_client_for(&settings.generation_profile(), keys)
        .context("no completion provider for the generation model")?;

    let embedding_profile = settings.embedding_profile();
    let embedding: Arc<dyn EmbeddingProvider> =
        if embedding_profile.provider == ModelProvider::OpenAi && keys.openai_api_key.is_some() {
            embedding_client_for(&embedding_profile, keys)?
        } else {
            tracing::warn!(
                model = %embedding_profile.name,
                "no embedding credentials, falling back to local hash embeddings"
            );
            Arc::new(HashEmbeddingProvider::default())
        };

    Ok(Providers::new(completion, embedding).with_llm_extraction(&settings.generation_model))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,koi=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let settings = args.settings()?;
    let providers = providers(&settings, &args.keys())?;

    tracing::info!(
        data_dir = %args.data_dir.display(),
        generation_model = %settings.generation_model,
        long_term_memory = settings.long_term_memory,
        "initializing Koi memory"
    );
    let memory = MemoryOrchestrator::open(settings, providers, &args.data_dir).await?;
    let state = Arc::new(AppState {
        memory: Arc::new(memory),
    });

    let app = api::router(state).layer(TraceLayer::new_for_http());

    tracing::info!("Koi server listening on {}", args.addr);
    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}
