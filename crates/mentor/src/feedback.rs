//! Per-agent usage tracking, milestones, and the composite progress score
//!
//! Everything here is local, in-memory state about how an agent is being
//! used. The store contributes its own view through the orchestrator; this
//! module only needs what the embedding workflow reports after each run.

use crate::records::{Milestone, MilestoneKind, UsageStats};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::info;

/// Interactions kept per agent
const INTERACTION_LIMIT: usize = 100;

#[derive(Debug, Default)]
struct AgentPattern {
    queries: Vec<String>,
    successes: Vec<bool>,
    execution_times: Vec<f64>,
    first_interaction: Option<DateTime<Utc>>,
    last_interaction: Option<DateTime<Utc>>,
}

impl AgentPattern {
    fn push(&mut self, query: &str, execution_secs: f64, success: bool, now: DateTime<Utc>) {
        self.queries.push(query.to_string());
        self.successes.push(success);
        self.execution_times.push(execution_secs);
        self.first_interaction.get_or_insert(now);
        self.last_interaction = Some(now);

        if self.successes.len() > INTERACTION_LIMIT {
            let excess = self.successes.len() - INTERACTION_LIMIT;
            self.queries.drain(..excess);
            self.successes.drain(..excess);
            self.execution_times.drain(..excess);
        }
    }

    fn success_count(&self) -> usize {
        self.successes.iter().filter(|s| **s).count()
    }
}

/// Tracks per-agent usage and detects milestones
#[derive(Debug, Default)]
pub struct UsageTracker {
    patterns: HashMap<String, AgentPattern>,
    milestones: HashMap<String, Vec<Milestone>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one run of an agent. Returns a milestone when this run crossed
    /// one that has not been reached before.
    pub fn record_interaction(
        &mut self,
        agent: &str,
        query: &str,
        execution_secs: f64,
        success: bool,
    ) -> Option<Milestone> {
        self.record_interaction_at(agent, query, execution_secs, success, Utc::now())
    }

    /// Same with an explicit clock, for tenure tests
    pub fn record_interaction_at(
        &mut self,
        agent: &str,
        query: &str,
        execution_secs: f64,
        success: bool,
        now: DateTime<Utc>,
    ) -> Option<Milestone> {
        let pattern = self.patterns.entry(agent.to_string()).or_default();
        pattern.push(query, execution_secs, success, now);

        let candidate = check_milestone(pattern, success, now)?;
        let reached = self.milestones.entry(agent.to_string()).or_default();
        // each kind fires once per agent
        if reached.iter().any(|m| m.kind == candidate.kind) {
            return None;
        }
        info!("agent {} reached milestone: {}", agent, candidate.description);
        reached.push(candidate.clone());
        Some(candidate)
    }

    pub fn milestones(&self, agent: &str) -> &[Milestone] {
        self.milestones.get(agent).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn usage_stats(&self, agent: &str) -> UsageStats {
        let Some(pattern) = self.patterns.get(agent) else {
            return UsageStats::default();
        };
        let total = pattern.successes.len();
        UsageStats {
            total_runs: total,
            success_rate: if total == 0 {
                0.0
            } else {
                pattern.success_count() as f64 / total as f64
            },
            avg_execution_secs: if pattern.execution_times.is_empty() {
                0.0
            } else {
                pattern.execution_times.iter().sum::<f64>() / pattern.execution_times.len() as f64
            },
            first_interaction: pattern.first_interaction,
            last_interaction: pattern.last_interaction,
        }
    }

    /// Composite progress score: store contribution 40%, engagement 30%,
    /// milestones 20% (0.05 each), recent consistency 10%.
    pub fn progress_score(&self, agent: &str, store_success_rate: Option<f64>) -> f64 {
        let mut score = 0.0;

        if let Some(rate) = store_success_rate {
            score += f64::min(0.4, rate * 0.4);
        }

        if let Some(pattern) = self.patterns.get(agent) {
            if !pattern.successes.is_empty() {
                let engagement =
                    pattern.success_count() as f64 / pattern.successes.len() as f64;
                score += f64::min(0.3, engagement * 0.3);
            }

            if pattern.successes.len() >= 10 {
                let recent = &pattern.successes[pattern.successes.len() - 10..];
                let consistency = recent.iter().filter(|s| **s).count() as f64 / 10.0;
                score += f64::min(0.1, consistency * 0.1);
            }
        }

        let milestone_count = self.milestones(agent).len();
        score += f64::min(0.2, milestone_count as f64 * 0.05);

        f64::min(score, 1.0)
    }
}

fn check_milestone(pattern: &AgentPattern, success: bool, now: DateTime<Utc>) -> Option<Milestone> {
    if pattern.successes.len() == 1 && success {
        return Some(milestone(
            MilestoneKind::FirstSuccess,
            "First successful execution",
            0.9,
            now,
        ));
    }

    if pattern.success_count() == 10 {
        return Some(milestone(
            MilestoneKind::Consistency,
            "10 successful executions",
            0.85,
            now,
        ));
    }

    if pattern.execution_times.len() >= 10 {
        let times = &pattern.execution_times;
        let early_avg = times[..5].iter().sum::<f64>() / 5.0;
        let recent_avg = times[times.len() - 5..].iter().sum::<f64>() / 5.0;
        if early_avg > 0.0 && recent_avg < early_avg * 0.8 {
            return Some(milestone(
                MilestoneKind::SpeedImprovement,
                "20% faster execution speed",
                0.8,
                now,
            ));
        }
    }

    if let Some(first) = pattern.first_interaction {
        if (now - first).num_days() >= 30 {
            return Some(milestone(
                MilestoneKind::LongTermUsage,
                "30 days of consistent usage",
                0.95,
                now,
            ));
        }
    }

    None
}

fn milestone(
    kind: MilestoneKind,
    description: &str,
    confidence: f64,
    now: DateTime<Utc>,
) -> Milestone {
    Milestone {
        kind,
        description: description.to_string(),
        confidence,
        reached_at: now,
    }
}
