//! Invisibility Contract Tests
//!
//! Verifies the caller-facing guarantees that make the layer "invisible":
//!
//! 1. The same request returns the same result shape in every mode
//! 2. Offline mode never spawns a tool process
//! 3. Three consecutive tool failures disable the bridge permanently
//! 4. Proof tokens are deterministic for identical decision facts
//! 5. Known fixture values for the finance domain
//!
//! ## Running
//!
//! ```bash
//! cargo test -p mentor --test invisibility_tests -- --nocapture
//! ```

use mentor::{
    CausalEdge, ConfidenceValidator, Episode, FakeInvoker, InvocationStrategy, InvokeError,
    MentorConfig, Orchestrator, ToolBridge,
};
use std::sync::Arc;

fn test_config(dir: &tempfile::TempDir) -> MentorConfig {
    MentorConfig::default()
        .with_auto_install(false)
        .with_store_path(dir.path().join("engram.db"))
        .with_tool_config_path(dir.path().join("config.json"))
}

#[tokio::test]
async fn result_shape_uniform_across_modes() {
    let dir = tempfile::tempdir().unwrap();

    // offline
    let absent = Arc::new(FakeInvoker::always_error(InvokeError::NotFound(
        "engram".into(),
    )));
    let mut offline = Orchestrator::with_invoker(test_config(&dir), absent).await;
    let from_offline = offline.enhance_creation("stock screener", None).await;

    // degraded
    let present = Arc::new(FakeInvoker::always_stdout("usage: engram"));
    let mut degraded = Orchestrator::with_invoker(test_config(&dir), present).await;
    let from_degraded = degraded.enhance_creation("stock screener", None).await;

    // simulated
    offline.enable_simulation();
    let from_simulated = offline.enhance_creation("stock screener", None).await;

    // every mode fills the same fields; only the markers differ
    for result in [&from_offline, &from_degraded, &from_simulated] {
        assert!(result.template_choice.is_some());
        assert!(result.success_probability > 0.0);
        assert!(!result.learned_improvements.is_empty());
    }
    assert!(from_offline.fallback_active && !from_offline.degraded && !from_offline.simulated);
    assert!(from_degraded.degraded && !from_degraded.fallback_active);
    assert!(from_simulated.simulated && !from_simulated.fallback_active);
}

#[tokio::test]
async fn offline_reads_spawn_no_processes() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeInvoker::always_error(InvokeError::NotFound(
        "engram".into(),
    )));
    let mut orchestrator = Orchestrator::with_invoker(test_config(&dir), fake.clone()).await;
    let after_probe = fake.call_count();

    orchestrator.enhance_creation("research articles crawler", None).await;
    orchestrator
        .enhance_template("research-data-collection", "articles")
        .await;
    orchestrator.get_learning_summary("crawler").await;

    assert_eq!(fake.call_count(), after_probe);
}

#[tokio::test]
async fn bridge_disables_after_three_failures_until_reset() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeInvoker::always_error(InvokeError::Timeout(
        std::time::Duration::from_secs(30),
        "engram reflexion store".into(),
    )));
    let bridge = ToolBridge::new(
        fake.clone(),
        InvocationStrategy::Direct,
        &test_config(&dir),
    );

    let episode = Episode::new("s", "task").with_outcome(0.9, true);
    for _ in 0..3 {
        assert!(bridge.store_episode(&episode).await.is_none());
    }
    assert!(bridge.is_disabled());

    // disabled means disabled: no retrieve, no store, no processes
    assert!(bridge.retrieve_episodes("task", 5, 0.0).await.is_empty());
    let edge = CausalEdge::new("a", "b", 0.1);
    assert!(bridge.add_causal_edge(&edge).await.is_none());
    assert_eq!(fake.call_count(), 3);

    bridge.reset();
    assert!(!bridge.is_disabled());
    // re-armed bridge invokes again
    bridge.ping().await;
    assert_eq!(fake.call_count(), 4);
}

#[tokio::test]
async fn proof_tokens_deterministic_for_same_facts() {
    let mut first = ConfidenceValidator::new(None);
    let mut second = ConfidenceValidator::new(None);

    let a = first
        .validate_template_selection("financial-analysis", "stock tracker", None)
        .await;
    let b = second
        .validate_template_selection("financial-analysis", "stock tracker", None)
        .await;
    assert_eq!(a.proof_token, b.proof_token);
    assert!(a.proof_token.starts_with("leaf:"));

    let c = second
        .validate_template_selection("financial-analysis", "different request about stocks", None)
        .await;
    assert_ne!(a.proof_token, c.proof_token);
}

#[tokio::test]
async fn finance_fixture_values() {
    let dir = tempfile::tempdir().unwrap();
    let absent = Arc::new(FakeInvoker::always_error(InvokeError::NotFound(
        "engram".into(),
    )));
    let mut orchestrator = Orchestrator::with_invoker(test_config(&dir), absent).await;

    let enhancement = orchestrator
        .enhance_creation("I need finance portfolio tracking", None)
        .await;
    assert_eq!(
        enhancement.template_choice.as_deref(),
        Some("financial-analysis")
    );
    assert_eq!(enhancement.success_probability, 0.75);
    assert!(enhancement.fallback_active);

    // a declared domain reaches the same fixture even when the text alone
    // would not route there
    let enhancement = orchestrator
        .enhance_creation("analyze my portfolio returns", Some("finance"))
        .await;
    assert_eq!(
        enhancement.template_choice.as_deref(),
        Some("financial-analysis")
    );
    assert_eq!(enhancement.success_probability, 0.75);
    assert!(enhancement.fallback_active);
    assert_eq!(
        enhancement.learned_improvements,
        vec![
            "enhanced_rsi_calculation",
            "improved_error_handling",
            "smart_data_caching"
        ]
    );
}
