mod common;

use common::{eventually, orchestrator, providers, Script, ScriptedCompletion, UserFacts};
use koi::{
    MemoryError, MemoryMessage, MemoryOrchestrator, MemoryType, NewMemory, Page, RetryPolicy,
    SearchFilters, Settings, SummaryState,
};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn summarizer() -> Arc<ScriptedCompletion> {
    Arc::new(ScriptedCompletion::new(Script::Summarize))
}

#[tokio::test]
async fn window_of_three_keeps_last_three_and_summarizes_the_rest() {
    let settings = Settings::builder().window_size(3).build().unwrap();
    let memory = orchestrator(
        settings,
        Arc::new(ScriptedCompletion::new(Script::Transcript)),
    )
    .await;

    for i in 1..=5 {
        memory
            .add_messages("ns", "s", &[MemoryMessage::user(format!("message {i}"))], None)
            .await
            .unwrap();
    }
    memory.wait_for_summaries().await;

    let view = memory.get_memory("ns", "s").await.unwrap();
    let contents: Vec<_> = view.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["message 3", "message 4", "message 5"]);
    let context = view.context.as_deref().unwrap_or_default();
    assert!(context.contains("user: message 1"));
    assert!(context.contains("user: message 2"));
    assert!(!context.contains("message 3"));
    assert!(!view.pending);
}

#[tokio::test]
async fn search_in_unused_namespace_is_empty() {
    let memory = orchestrator(Settings::default(), summarizer()).await;
    let results = memory
        .search("proj1", "refund policy", &SearchFilters::default(), Page::first(10))
        .await
        .unwrap();
    assert!(results.memories.is_empty());
    assert_eq!(results.total, 0);
}

#[tokio::test]
async fn invalid_role_stores_nothing() {
    let memory = orchestrator(Settings::default(), summarizer()).await;
    let err = memory
        .add_messages("ns", "s", &[MemoryMessage::new("system_x", "hello")], None)
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));

    let view = memory.get_memory("ns", "s").await.unwrap();
    assert!(view.messages.is_empty());
    assert_eq!(memory.list_sessions("ns", Page::default()).await.unwrap().total, 0);
}

#[tokio::test]
async fn permanent_completion_failure_keeps_every_message() {
    let settings = Settings::builder()
        .token_budget(40)
        .retry(RetryPolicy::immediate(3))
        .build()
        .unwrap();
    let completion = Arc::new(ScriptedCompletion::new(Script::FailPermanently));
    let memory = orchestrator(settings, completion.clone()).await;

    let messages: Vec<_> = (1..=6).map(|i| MemoryMessage::user(format!("message {i}"))).collect();
    let view = memory.add_messages("ns", "s", &messages, None).await.unwrap();
    assert_eq!(view.messages.len(), 6);

    memory.wait_for_summaries().await;

    let view = memory.get_memory("ns", "s").await.unwrap();
    assert!(!view.pending);
    assert_eq!(view.messages.len(), 6);
    assert!(view.token_count > 40);
    assert!(view.context.is_none());
    assert!(view.last_summary_error.is_some());
    assert!(matches!(memory.summary_state("ns", "s"), SummaryState::Failed(_)));
    // Permanent errors are not retried.
    assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_single_appends_both_persist() {
    let memory = orchestrator(Settings::default(), summarizer()).await;

    let from_a = [MemoryMessage::user("from a")];
    let from_b = [MemoryMessage::assistant("from b")];
    let (a, b) = tokio::join!(
        memory.add_messages("ns", "s", &from_a, None),
        memory.add_messages("ns", "s", &from_b, None),
    );
    a.unwrap();
    b.unwrap();

    let view = memory.get_memory("ns", "s").await.unwrap();
    let contents: HashSet<_> = view.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, HashSet::from(["from a", "from b"]));
    assert!(view.messages[0].ordinal < view.messages[1].ordinal);
}

#[tokio::test]
async fn concurrent_triggers_run_one_job_at_a_time() {
    let settings = Settings::builder()
        .window_size(2)
        .summary_workers(4)
        .build()
        .unwrap();
    let completion =
        Arc::new(ScriptedCompletion::new(Script::Summarize).with_delay(Duration::from_millis(25)));
    let memory = Arc::new(orchestrator(settings, completion.clone()).await);

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let memory = Arc::clone(&memory);
            tokio::spawn(async move {
                memory
                    .add_messages("ns", "s", &[MemoryMessage::user(format!("message {i}"))], None)
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    memory.wait_for_summaries().await;

    assert_eq!(completion.peak.load(Ordering::SeqCst), 1);
    let view = memory.get_memory("ns", "s").await.unwrap();
    assert_eq!(view.messages.len(), 2);
    assert!(view.context.is_some());
    assert!(!view.pending);
}

#[tokio::test]
async fn token_count_grows_until_summarized() {
    let settings = Settings::builder().window_size(4).build().unwrap();
    let memory = orchestrator(settings, summarizer()).await;

    let mut previous = 0;
    for i in 1..=4 {
        let view = memory
            .add_messages("ns", "s", &[MemoryMessage::user(format!("message number {i}"))], None)
            .await
            .unwrap();
        assert!(view.token_count > previous);
        previous = view.token_count;
    }

    memory
        .add_messages("ns", "s", &[MemoryMessage::user("one more message to overflow")], None)
        .await
        .unwrap();
    memory.wait_for_summaries().await;

    let view = memory.get_memory("ns", "s").await.unwrap();
    assert_eq!(view.messages.len(), 4);
    assert_eq!(view.context.as_deref(), Some("earlier: 1 lines"));
}

#[tokio::test]
async fn search_never_crosses_namespaces() {
    let memory = orchestrator(Settings::default(), summarizer()).await;
    memory
        .create_long_term_memories("team-a", &[NewMemory::new("refund policy is 30 days")])
        .await
        .unwrap();
    memory
        .create_long_term_memories("team-b", &[NewMemory::new("refund policy is 60 days")])
        .await
        .unwrap();

    for namespace in ["team-a", "team-b"] {
        let results = memory
            .search(namespace, "refund policy", &SearchFilters::default(), Page::first(10))
            .await
            .unwrap();
        assert_eq!(results.total, 1);
        assert!(results.memories.iter().all(|hit| hit.memory.namespace == namespace));
    }
}

#[tokio::test]
async fn delete_resets_session_but_keeps_promoted_memories() {
    let settings = Settings::builder()
        .window_size(2)
        .long_term_memory(true)
        .build()
        .unwrap();
    let memory = orchestrator(settings, summarizer()).await;

    let messages: Vec<_> = ["I need a refund for order 7", "Sure, checking", "Thanks"]
        .into_iter()
        .enumerate()
        .map(|(i, text)| {
            if i % 2 == 0 {
                MemoryMessage::user(text)
            } else {
                MemoryMessage::assistant(text)
            }
        })
        .collect();
    memory.add_messages("ns", "s", &messages, None).await.unwrap();
    memory.wait_for_summaries().await;

    let promoted = eventually(|| async {
        memory
            .search("ns", "refund order", &SearchFilters::default(), Page::first(5))
            .await
            .map(|r| r.total == 1)
            .unwrap_or(false)
    })
    .await;
    assert!(promoted);

    memory.delete_memory("ns", "s").await.unwrap();
    let view = memory.get_memory("ns", "s").await.unwrap();
    assert!(view.messages.is_empty());
    assert!(view.context.is_none());
    assert_eq!(view.token_count, 0);

    let results = memory
        .search("ns", "refund order", &SearchFilters::default(), Page::first(5))
        .await
        .unwrap();
    assert_eq!(results.total, 1);
    let hit = &results.memories[0].memory;
    assert_eq!(hit.text, "user: I need a refund for order 7");
    assert_eq!(hit.session_id.as_deref(), Some("s"));
    assert!(hit.topics.contains("refund"));
}

#[tokio::test]
async fn promoted_messages_are_distilled_into_semantic_memories() {
    let settings = Settings::builder()
        .window_size(1)
        .long_term_memory(true)
        .build()
        .unwrap();
    let memory = MemoryOrchestrator::in_memory(
        settings,
        providers(summarizer()).with_memory_extractor(Arc::new(UserFacts)),
    )
    .await
    .unwrap();

    let messages = [
        MemoryMessage::user("I need a refund for order 7"),
        MemoryMessage::assistant("Sure, checking"),
    ];
    memory.add_messages("ns", "s", &messages, None).await.unwrap();
    memory.wait_for_summaries().await;

    let semantic = SearchFilters::default().with_memory_type(MemoryType::Semantic);
    let distilled = eventually(|| async {
        memory
            .search("ns", "refund", &semantic, Page::first(5))
            .await
            .map(|r| r.total == 1)
            .unwrap_or(false)
    })
    .await;
    assert!(distilled);

    let results = memory
        .search("ns", "refund", &semantic, Page::first(5))
        .await
        .unwrap();
    let fact = &results.memories[0].memory;
    assert_eq!(fact.text, "User need a refund for order 7");
    assert_eq!(fact.session_id.as_deref(), Some("s"));

    let raw = memory
        .search(
            "ns",
            "refund",
            &SearchFilters::default().with_memory_type(MemoryType::Message),
            Page::first(5),
        )
        .await
        .unwrap();
    assert_eq!(raw.total, 1);
    assert_eq!(raw.memories[0].memory.text, "user: I need a refund for order 7");
}

#[tokio::test]
async fn delete_of_unknown_session_is_not_found() {
    let memory = orchestrator(Settings::default(), summarizer()).await;
    let err = memory.delete_memory("ns", "ghost").await.unwrap_err();
    assert!(matches!(err, MemoryError::NotFound(_)));
}

#[tokio::test]
async fn explicit_promotion_is_idempotent_and_enriched() {
    let memory = orchestrator(Settings::default(), summarizer()).await;
    let batch = [NewMemory::new("Shipping to Amsterdam takes two days").with_session_id("s1")];

    let first = memory.create_long_term_memories("ns", &batch).await.unwrap();
    let second = memory.create_long_term_memories("ns", &batch).await.unwrap();
    assert_eq!(first, second);

    let stored = memory.get_long_term_memory("ns", &first[0]).await.unwrap();
    assert!(stored.topics.contains("shipping"));
    assert!(stored.entities.iter().any(|e| e.text == "Amsterdam" && e.entity_type == "LOC"));

    let by_entity = memory
        .search(
            "ns",
            "delivery time",
            &SearchFilters::default().with_entities(["amsterdam"]),
            Page::first(10),
        )
        .await
        .unwrap();
    assert_eq!(by_entity.total, 1);

    memory.delete_long_term_memory("ns", &first[0]).await.unwrap();
    assert!(matches!(
        memory.get_long_term_memory("ns", &first[0]).await,
        Err(MemoryError::NotFound(_))
    ));
}

#[tokio::test]
async fn sessions_listed_most_recent_first() {
    let memory = orchestrator(Settings::default(), summarizer()).await;
    for session in ["a", "b", "c"] {
        memory
            .add_messages("ns", session, &[MemoryMessage::user("hi")], None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    memory
        .add_messages("other", "z", &[MemoryMessage::user("hi")], None)
        .await
        .unwrap();

    let list = memory.list_sessions("ns", Page::first(10)).await.unwrap();
    assert_eq!(list.total, 3);
    assert_eq!(list.sessions, vec!["c", "b", "a"]);
}

#[tokio::test]
async fn working_memory_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let memory = MemoryOrchestrator::open(Settings::default(), providers(summarizer()), dir.path())
            .await
            .unwrap();
        memory
            .add_messages("ns", "s", &[MemoryMessage::user("remember me")], Some("prior chat"))
            .await
            .unwrap();
    }

    let memory = MemoryOrchestrator::open(Settings::default(), providers(summarizer()), dir.path())
        .await
        .unwrap();
    let view = memory.get_memory("ns", "s").await.unwrap();
    assert_eq!(view.messages[0].content, "remember me");
    assert_eq!(view.context.as_deref(), Some("prior chat"));
}
