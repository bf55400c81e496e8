//! Typed bridge over the engram CLI
//!
//! Each operation composes the invoker and the output parser into a typed
//! result. Process-level failures never leak: callers receive `Option` /
//! empty `Vec` and the bridge keeps a consecutive-failure counter. At the
//! configured threshold it disables itself for the rest of the process
//! lifetime, until an explicit `reset()`.

use crate::config::MentorConfig;
use crate::invoke::{InvokeRequest, Invoker};
use crate::parse::{self, Payload};
use crate::records::{CausalEdge, Episode, EpisodeHit, RecordId, Skill, StoreStats};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How the tool is reached. Fixed at construction; `Direct` is preferred
/// when the prober found both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStrategy {
    /// The `engram` binary on PATH
    Direct,
    /// Through the `npx` runner
    Runner,
}

impl InvocationStrategy {
    fn prefix(&self) -> &'static [&'static str] {
        match self {
            InvocationStrategy::Direct => &["engram"],
            InvocationStrategy::Runner => &["npx", "engram"],
        }
    }
}

/// Bridge to a detected engram installation. Shared via `Arc`; the error
/// counter and disabled flag are atomics so concurrent callers agree.
pub struct ToolBridge {
    invoker: Arc<dyn Invoker>,
    strategy: InvocationStrategy,
    store_path: String,
    op_timeout: Duration,
    max_consecutive_errors: u32,
    consecutive_errors: AtomicU32,
    disabled: AtomicBool,
}

impl ToolBridge {
    pub fn new(
        invoker: Arc<dyn Invoker>,
        strategy: InvocationStrategy,
        config: &MentorConfig,
    ) -> Self {
        Self {
            invoker,
            strategy,
            store_path: config.store_path.to_string_lossy().into_owned(),
            op_timeout: config.op_timeout(),
            max_consecutive_errors: config.max_consecutive_errors,
            consecutive_errors: AtomicU32::new(0),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn strategy(&self) -> InvocationStrategy {
        self.strategy
    }

    /// Whether the bridge has disabled itself after repeated failures
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    /// Re-arm a disabled bridge and clear the failure counter
    pub fn reset(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
        self.disabled.store(false, Ordering::SeqCst);
    }

    /// Run one tool command. A disabled bridge never spawns a process.
    /// Returns the stdout on clean exit; anything else counts one failure.
    async fn call(&self, args: &[String]) -> Option<String> {
        if self.is_disabled() {
            return None;
        }

        let mut argv: Vec<String> = self
            .strategy
            .prefix()
            .iter()
            .map(|s| s.to_string())
            .collect();
        argv.extend_from_slice(args);

        let request =
            InvokeRequest::new(argv, self.op_timeout)
                .with_env("ENGRAM_PATH", self.store_path.as_str());

        match self.invoker.run(request).await {
            Ok(invocation) if invocation.success() => {
                self.consecutive_errors.store(0, Ordering::SeqCst);
                Some(invocation.stdout)
            }
            Ok(invocation) => {
                debug!(
                    "engram exited {}: {}",
                    invocation.exit_code,
                    invocation.stderr.trim()
                );
                self.record_failure();
                None
            }
            Err(e) => {
                debug!("engram invocation failed: {}", e);
                self.record_failure();
                None
            }
        }
    }

    fn record_failure(&self) {
        let errors = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        if errors >= self.max_consecutive_errors && !self.disabled.swap(true, Ordering::SeqCst) {
            warn!(
                "bridge disabled after {} consecutive failures",
                errors
            );
        }
    }

    /// Cheap liveness check against the store
    pub async fn ping(&self) -> bool {
        self.call(&args(["db", "stats"])).await.is_some()
    }

    pub async fn store_episode(&self, episode: &Episode) -> Option<RecordId> {
        let mut command = args([
            "reflexion",
            "store",
            &episode.session_id,
            &episode.task,
            &episode.reward.to_string(),
            if episode.success { "true" } else { "false" },
        ]);
        if let Some(critique) = &episode.critique {
            command.push(critique.clone());
        }
        if let Some(input) = &episode.input {
            command.push(input.clone());
        }
        if let Some(output) = &episode.output {
            command.push(output.clone());
        }
        if let Some(latency) = episode.latency_ms {
            command.push(latency.to_string());
        }
        if let Some(tokens) = episode.tokens_used {
            command.push(tokens.to_string());
        }

        let stdout = self.call(&command).await?;
        match parse::parse_response(&stdout).payload {
            Payload::EpisodeStored(id) => Some(id),
            _ => None,
        }
    }

    pub async fn retrieve_episodes(
        &self,
        task: &str,
        k: usize,
        min_reward: f64,
    ) -> Vec<EpisodeHit> {
        let command = args([
            "reflexion",
            "retrieve",
            task,
            &k.to_string(),
            &min_reward.to_string(),
        ]);
        let Some(stdout) = self.call(&command).await else {
            return Vec::new();
        };
        match parse::parse_response(&stdout).payload {
            Payload::Episodes(episodes) => episodes,
            _ => Vec::new(),
        }
    }

    /// Aggregated critique text for a task, or `None` when the store has
    /// nothing to say
    pub async fn critique_summary(&self, task: &str) -> Option<String> {
        let command = args(["reflexion", "critique-summary", task]);
        let stdout = self.call(&command).await?;
        parse::parse_critique_summary(&stdout)
    }

    pub async fn create_skill(&self, skill: &Skill) -> Option<RecordId> {
        let mut command = args(["skill", "create", &skill.name]);
        if let Some(description) = &skill.description {
            command.push(description.clone());
        }
        if let Some(code) = &skill.code {
            command.push(code.clone());
        }

        let stdout = self.call(&command).await?;
        match parse::parse_response(&stdout).payload {
            Payload::SkillCreated(id) => Some(id),
            _ => None,
        }
    }

    pub async fn search_skills(&self, query: &str, k: usize) -> Vec<Skill> {
        let command = args(["skill", "search", query, &k.to_string()]);
        let Some(stdout) = self.call(&command).await else {
            return Vec::new();
        };
        match parse::parse_response(&stdout).payload {
            Payload::Skills(skills) => skills,
            _ => Vec::new(),
        }
    }

    /// Ask the store to fold recent episodes into skills. Returns how many
    /// skills it created.
    pub async fn consolidate_skills(
        &self,
        min_attempts: u32,
        min_reward: f64,
        time_window_days: u32,
    ) -> Option<u64> {
        let command = args([
            "skill",
            "consolidate",
            &min_attempts.to_string(),
            &min_reward.to_string(),
            &time_window_days.to_string(),
        ]);
        let stdout = self.call(&command).await?;
        Some(parse::parse_consolidation_count(&stdout))
    }

    pub async fn add_causal_edge(&self, edge: &CausalEdge) -> Option<RecordId> {
        let mut command = args([
            "causal",
            "add-edge",
            &edge.cause,
            &edge.effect,
            &edge.uplift.to_string(),
        ]);
        // 0.5 is the store's own default confidence
        if edge.confidence != 0.5 {
            command.push(edge.confidence.to_string());
        }
        if let Some(sample_size) = edge.sample_size {
            command.push(sample_size.to_string());
        }

        let stdout = self.call(&command).await?;
        match parse::parse_response(&stdout).payload {
            Payload::EdgeAdded(id) => Some(id),
            _ => None,
        }
    }

    pub async fn query_causal_edges(
        &self,
        cause: Option<&str>,
        effect: Option<&str>,
        min_confidence: f64,
        min_uplift: f64,
        limit: usize,
    ) -> Vec<CausalEdge> {
        let mut command = args(["causal", "query"]);
        if let Some(cause) = cause {
            command.push(cause.to_string());
        }
        if let Some(effect) = effect {
            command.push(effect.to_string());
        }
        command.push(min_confidence.to_string());
        command.push(min_uplift.to_string());
        command.push(limit.to_string());

        let Some(stdout) = self.call(&command).await else {
            return Vec::new();
        };
        parse::parse_causal_edges(&stdout)
    }

    /// Historical prior for a template, recalled as JSON
    pub async fn recall_template_stats(
        &self,
        template: &str,
    ) -> Option<crate::records::TemplateHistory> {
        let key = format!("template_success_rate:{}", template);
        let command = vec![
            "causal".to_string(),
            "recall".to_string(),
            key,
            "--format".to_string(),
            "json".to_string(),
        ];
        let stdout = self.call(&command).await?;
        parse::parse_template_history(&stdout)
    }

    pub async fn store_stats(&self) -> Option<StoreStats> {
        let stdout = self.call(&args(["db", "stats"])).await?;
        Some(parse::parse_stats(&stdout))
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::{ok_invocation, FakeInvoker, InvokeError};

    fn bridge_with(fake: Arc<FakeInvoker>, strategy: InvocationStrategy) -> ToolBridge {
        let config = MentorConfig::default().with_store_path("/tmp/test-engram.db");
        ToolBridge::new(fake, strategy, &config)
    }

    #[tokio::test]
    async fn test_store_episode_returns_id() {
        let fake = Arc::new(FakeInvoker::always_stdout("Stored episode #42"));
        let bridge = bridge_with(fake.clone(), InvocationStrategy::Direct);

        let episode = Episode::new("s-1", "analyze prices").with_outcome(0.9, true);
        let id = bridge.store_episode(&episode).await;
        assert_eq!(id, Some(RecordId::Numeric(42)));

        let argv = &fake.seen_argv()[0];
        assert_eq!(argv[0], "engram");
        assert_eq!(&argv[1..4], &["reflexion", "store", "s-1"]);
        assert_eq!(fake.seen_env()[0].get("ENGRAM_PATH").unwrap(), "/tmp/test-engram.db");
    }

    #[tokio::test]
    async fn test_runner_strategy_prefix() {
        let fake = Arc::new(FakeInvoker::always_stdout("episodes: 0"));
        let bridge = bridge_with(fake.clone(), InvocationStrategy::Runner);

        assert!(bridge.ping().await);
        assert_eq!(&fake.seen_argv()[0][..2], &["npx", "engram"]);
    }

    #[tokio::test]
    async fn test_three_failures_disable_bridge() {
        let fake = Arc::new(FakeInvoker::always_error(InvokeError::Timeout(
            Duration::from_secs(30),
            "engram db stats".into(),
        )));
        let bridge = bridge_with(fake.clone(), InvocationStrategy::Direct);

        for _ in 0..3 {
            assert!(!bridge.ping().await);
        }
        assert!(bridge.is_disabled());

        // no further processes are spawned once disabled
        assert!(!bridge.ping().await);
        assert_eq!(fake.call_count(), 3);
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let fake = Arc::new(FakeInvoker::new(vec![
            Err(InvokeError::NotFound("engram".into())),
            Err(InvokeError::NotFound("engram".into())),
            Ok(ok_invocation("episodes: 3")),
            Err(InvokeError::NotFound("engram".into())),
        ]));
        let bridge = bridge_with(fake, InvocationStrategy::Direct);

        bridge.ping().await;
        bridge.ping().await;
        assert_eq!(bridge.consecutive_errors(), 2);

        assert!(bridge.ping().await);
        assert_eq!(bridge.consecutive_errors(), 0);

        bridge.ping().await;
        assert!(!bridge.is_disabled());
    }

    #[tokio::test]
    async fn test_reset_rearms_disabled_bridge() {
        let fake = Arc::new(FakeInvoker::new(vec![
            Err(InvokeError::NotFound("engram".into())),
            Err(InvokeError::NotFound("engram".into())),
            Err(InvokeError::NotFound("engram".into())),
            Ok(ok_invocation("episodes: 1")),
        ]));
        let bridge = bridge_with(fake, InvocationStrategy::Direct);

        for _ in 0..3 {
            bridge.ping().await;
        }
        assert!(bridge.is_disabled());

        bridge.reset();
        assert!(!bridge.is_disabled());
        assert!(bridge.ping().await);
    }

    #[tokio::test]
    async fn test_nonzero_exit_counts_as_failure() {
        let fake = Arc::new(FakeInvoker::always_nonzero(2, "store locked"));
        let bridge = bridge_with(fake, InvocationStrategy::Direct);

        assert!(bridge.store_stats().await.is_none());
        assert_eq!(bridge.consecutive_errors(), 1);
    }

    #[tokio::test]
    async fn test_retrieve_parses_blocks() {
        let stdout = "\
Retrieved 1 relevant episodes
#5: Episode
  Task: fetch tickers
  Reward: 0.8
  Success: Yes
";
        let fake = Arc::new(FakeInvoker::always_stdout(stdout));
        let bridge = bridge_with(fake, InvocationStrategy::Direct);

        let hits = bridge.retrieve_episodes("fetch tickers", 5, 0.0).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].task.as_deref(), Some("fetch tickers"));
    }

    #[tokio::test]
    async fn test_causal_edge_roundtrip_args() {
        let fake = Arc::new(FakeInvoker::always_stdout("Added causal edge #9"));
        let bridge = bridge_with(fake.clone(), InvocationStrategy::Direct);

        let edge = CausalEdge::new("use_template", "agent_quality", 0.25).with_confidence(0.95);
        let id = bridge.add_causal_edge(&edge).await;
        assert_eq!(id, Some(RecordId::Numeric(9)));

        let argv = &fake.seen_argv()[0];
        assert_eq!(&argv[1..3], &["causal", "add-edge"]);
        // non-default confidence is passed through
        assert!(argv.contains(&"0.95".to_string()));
    }

    #[tokio::test]
    async fn test_query_causal_edges() {
        let fake = Arc::new(FakeInvoker::always_stdout(
            "use_template → agent_quality (uplift: 0.25, confidence: 0.95)",
        ));
        let bridge = bridge_with(fake, InvocationStrategy::Direct);

        let edges = bridge
            .query_causal_edges(Some("use_template"), None, 0.0, 0.0, 10)
            .await;
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].effect, "agent_quality");
    }

    #[tokio::test]
    async fn test_consolidate_count() {
        let fake = Arc::new(FakeInvoker::always_stdout("Created 3 skills"));
        let bridge = bridge_with(fake, InvocationStrategy::Direct);
        assert_eq!(bridge.consolidate_skills(3, 0.7, 7).await, Some(3));
    }

    #[tokio::test]
    async fn test_recall_template_stats() {
        let fake = Arc::new(FakeInvoker::always_stdout(
            "{\"success_rate\": 0.9, \"usage_count\": 120}",
        ));
        let bridge = bridge_with(fake.clone(), InvocationStrategy::Direct);

        let history = bridge
            .recall_template_stats("financial-analysis")
            .await
            .unwrap();
        assert_eq!(history.success_rate, 0.9);
        assert_eq!(history.usage_count, 120);
        assert!(fake.seen_argv()[0]
            .contains(&"template_success_rate:financial-analysis".to_string()));
    }

    #[tokio::test]
    async fn test_garbage_output_yields_empty_not_error() {
        let fake = Arc::new(FakeInvoker::always_stdout("�complete garbage�"));
        let bridge = bridge_with(fake, InvocationStrategy::Direct);

        assert!(bridge.search_skills("anything", 5).await.is_empty());
        // a clean exit with odd output is not a bridge failure
        assert_eq!(bridge.consecutive_errors(), 0);
    }
}
