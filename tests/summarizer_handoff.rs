use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use taskweave::config::{SizeUnit, SummarizerConfig};
use taskweave::types::{ConversationTurn, EngineEvent, SummaryStyle, WorkflowStatus};
use taskweave::{ContextSummarizer, EngineConfig, EventBus, WorkflowEngine};
use taskweave_test_utils::{diamond_plan, MockExecutor, MockPlanner, ScriptedSummarizer};

const STRUCTURED_REPLY: &str = "The team settled on a TOML config.

KEY DECISIONS:
- Use serde for parsing
- Reject unknown keys

OPEN QUESTIONS:
- Should env vars override files?

CURRENT TASK: wire the loader into startup";

fn history() -> Vec<ConversationTurn> {
    vec![
        ConversationTurn::requester("How should we load configuration?"),
        ConversationTurn::responder("TOML via serde, unknown keys rejected."),
        ConversationTurn::requester("And environment overrides?"),
        ConversationTurn::responder("Still undecided."),
    ]
}

#[tokio::test]
async fn fork_summary_feeds_the_next_workflow() {
    let backend = Arc::new(ScriptedSummarizer::new(STRUCTURED_REPLY));
    let config = SummarizerConfig {
        size_unit: SizeUnit::Chars,
        size_budget: 1000,
        ..SummarizerConfig::default()
    };
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let summarizer = ContextSummarizer::new(backend.clone(), config).with_event_bus(bus);

    let handoff = summarizer
        .summarize_for_fork(&history(), "Implement the loader")
        .await
        .unwrap();

    assert_eq!(backend.last_request().unwrap().style, SummaryStyle::Structured);
    assert!(handoff.contains("- Use serde for parsing"));
    assert!(handoff.contains("- Should env vars override files?"));
    assert!(handoff.contains("wire the loader into startup"));
    assert!(handoff.contains("## Your Task\n\nImplement the loader"));
    assert!(matches!(
        rx.try_recv(),
        Ok(EngineEvent::SummaryProduced { truncated: false, .. })
    ));

    // The handoff travels as shared context to every unit of the next run
    let executor = Arc::new(MockExecutor::new());
    let engine = WorkflowEngine::new(
        Arc::new(MockPlanner::new(diamond_plan())),
        executor.clone(),
        &EngineConfig::default(),
    );
    let wf = engine
        .execute("Implement the loader", Some(handoff.as_str()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(wf.status, WorkflowStatus::Completed);
    for id in ["A", "B", "C", "D"] {
        let request = executor.request_for(id).unwrap();
        assert_eq!(request.context.as_deref(), Some(handoff.as_str()));
    }
}

#[tokio::test]
async fn oversized_reply_is_cut_to_budget() {
    let backend = Arc::new(ScriptedSummarizer::new("x".repeat(500)));
    let config = SummarizerConfig {
        size_unit: SizeUnit::Chars,
        ..SummarizerConfig::default()
    };
    let summarizer = ContextSummarizer::new(backend, config);

    let summary = summarizer
        .summarize(&history(), SummaryStyle::Concise, 100)
        .await
        .unwrap();

    assert!(summary.truncated);
    assert_eq!(summary.backend_size, 500);
    assert!(summary.summary_size <= 100);
    assert!(summary.over_budget(100));
    assert!(summary.text.ends_with("[summary truncated to fit size budget]"));
}
