//! Domain records exchanged with the engram store
//!
//! Records are tolerant by construction: anything the tool's text output does
//! not carry stays `None` rather than failing the whole record.

use crate::validate::ValidationSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One recorded task attempt with outcome and reward.
/// Immutable once stored; the external store owns it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub session_id: String,
    pub task: String,
    pub input: Option<String>,
    pub output: Option<String>,
    pub critique: Option<String>,
    pub reward: f64,
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

impl Episode {
    pub fn new(session_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            task: task.into(),
            input: None,
            output: None,
            critique: None,
            reward: 0.0,
            success: false,
            latency_ms: None,
            tokens_used: None,
            tags: Vec::new(),
            metadata: None,
        }
    }

    pub fn with_outcome(mut self, reward: f64, success: bool) -> Self {
        self.reward = reward;
        self.success = success;
        self
    }

    pub fn with_critique(mut self, critique: impl Into<String>) -> Self {
        self.critique = Some(critique.into());
        self
    }
}

/// An episode as retrieved from the store's list output. Fields the text
/// output did not carry stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeHit {
    pub episode_id: Option<RecordId>,
    pub task: Option<String>,
    pub reward: Option<f64>,
    pub success: Option<bool>,
    pub similarity: Option<f64>,
    pub critique: Option<String>,
}

impl EpisodeHit {
    /// A hit with no populated fields carries no information
    pub fn is_empty(&self) -> bool {
        self.episode_id.is_none()
            && self.task.is_none()
            && self.reward.is_none()
            && self.success.is_none()
            && self.similarity.is_none()
            && self.critique.is_none()
    }
}

/// A named, reusable capability with aggregate performance statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub description: Option<String>,
    pub code: Option<String>,
    pub signature: Option<serde_json::Value>,
    pub success_rate: Option<f64>,
    pub uses: Option<u64>,
    pub avg_reward: Option<f64>,
    pub avg_latency_ms: Option<u64>,
}

impl Skill {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A scored cause→effect relationship.
///
/// Uplift and confidence are independent axes: a high-uplift edge with low
/// confidence is not interchangeable with one where both are high.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalEdge {
    pub cause: String,
    pub effect: String,
    pub uplift: f64,
    pub confidence: f64,
    pub sample_size: Option<u64>,
    pub mechanism: Option<String>,
}

impl CausalEdge {
    pub fn new(cause: impl Into<String>, effect: impl Into<String>, uplift: f64) -> Self {
        Self {
            cause: cause.into(),
            effect: effect.into(),
            uplift,
            confidence: 0.5,
            sample_size: None,
            mechanism: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

/// Identifier extracted from tool output. The tool prints numeric ids, but
/// the parser keeps the raw token when it does not parse as an integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Numeric(i64),
    Raw(String),
}

impl RecordId {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RecordId::Numeric(n) => Some(*n),
            RecordId::Raw(_) => None,
        }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordId::Numeric(n) => write!(f, "{}", n),
            RecordId::Raw(s) => write!(f, "{}", s),
        }
    }
}

/// Counters reported by `engram db stats`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub episodes: Option<u64>,
    pub skills: Option<u64>,
    pub causal_edges: Option<u64>,
    pub causal_experiments: Option<u64>,
}

/// Historical prior for a template, recalled from the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateHistory {
    pub success_rate: f64,
    pub usage_count: u64,
}

impl Default for TemplateHistory {
    // Defaults used when the store is unreachable: the usage count saturates
    // the capped usage weight so the historical term contributes its
    // documented default.
    fn default() -> Self {
        Self {
            success_rate: 0.8,
            usage_count: 1000,
        }
    }
}

/// What the agent-creation workflow receives from `enhance_creation`.
/// The shape is identical in every operating mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreationEnhancement {
    pub template_choice: Option<String>,
    pub success_probability: f64,
    pub learned_improvements: Vec<String>,
    pub historical_context: serde_json::Value,
    pub proof_token: Option<String>,
    /// Served from heuristics/cache without consulting the tool
    pub fallback_active: bool,
    /// Served through the tool but with partial features
    pub degraded: bool,
    /// Synthesized values, never from real history
    pub simulated: bool,
}

impl Default for CreationEnhancement {
    fn default() -> Self {
        Self {
            template_choice: None,
            success_probability: 0.0,
            learned_improvements: Vec::new(),
            historical_context: serde_json::Value::Object(Default::default()),
            proof_token: None,
            fallback_active: false,
            degraded: false,
            simulated: false,
        }
    }
}

/// What `enhance_template` returns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateEnhancement {
    pub enabled: bool,
    pub success_rate: f64,
    pub learned_improvements: Vec<String>,
    pub historical_usage: u64,
    pub fallback_active: bool,
    pub degraded: bool,
    pub simulated: bool,
}

impl Default for TemplateEnhancement {
    fn default() -> Self {
        Self {
            enabled: false,
            success_rate: 0.0,
            learned_improvements: Vec::new(),
            historical_usage: 0,
            fallback_active: false,
            degraded: false,
            simulated: false,
        }
    }
}

/// Experience reported by the workflow after a unit of agent work
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Experience {
    pub success_rate: f64,
    pub execution_time_secs: Option<f64>,
    #[serde(default)]
    pub causal_observations: HashMap<String, String>,
    #[serde(default)]
    pub successful_skills: Vec<Skill>,
}

/// A milestone reached by an agent, surfaced in the learning summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub kind: MilestoneKind,
    pub description: String,
    pub confidence: f64,
    pub reached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MilestoneKind {
    FirstSuccess,
    Consistency,
    SpeedImprovement,
    LongTermUsage,
}

/// Per-agent usage statistics tracked locally
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    pub total_runs: usize,
    pub success_rate: f64,
    pub avg_execution_secs: f64,
    pub first_interaction: Option<DateTime<Utc>>,
    pub last_interaction: Option<DateTime<Utc>>,
}

/// Merged learning summary for one agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningSummary {
    pub agent_name: String,
    pub total_sessions: usize,
    pub store_success_rate: f64,
    pub learned_skills: Vec<String>,
    pub causal_patterns: Vec<CausalEdge>,
    pub usage: UsageStats,
    pub milestones: Vec<Milestone>,
    pub validation: ValidationSummary,
    pub progress_score: f64,
}
