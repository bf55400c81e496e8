//! Confidence scoring and proof tokens for creation decisions
//!
//! Every template, data-source, and architecture decision gets a confidence
//! score, a validity verdict against a per-kind threshold, and a proof token
//! binding the decision facts. Results accumulate in a bounded in-memory
//! history and, when a bridge is attached, are also written back to the
//! store as episodes on a best-effort basis.

use crate::bridge::ToolBridge;
use crate::records::{Episode, TemplateHistory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Validity thresholds per decision kind
const TEMPLATE_THRESHOLD: f64 = 0.70;
const SOURCE_THRESHOLD: f64 = 0.60;
const ARCHITECTURE_THRESHOLD: f64 = 0.75;

/// Rolling history cap
const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationKind {
    TemplateSelection,
    SourceSelection,
    Architecture,
}

impl std::fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValidationKind::TemplateSelection => "template_selection",
            ValidationKind::SourceSelection => "source_selection",
            ValidationKind::Architecture => "architecture",
        };
        write!(f, "{}", name)
    }
}

/// One scored decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// Clamped to 0..=1
    pub confidence: f64,
    /// `leaf:<sha256>` over the sorted-key JSON of the decision facts,
    /// or `"fallback"` when scoring could not complete
    pub proof_token: String,
    pub kind: ValidationKind,
    pub details: serde_json::Value,
    pub recommendations: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

/// A candidate external data source under consideration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceCandidate {
    pub name: String,
    /// e.g. "global", "worldwide", "unlimited", "regional"
    pub data_coverage: String,
    /// e.g. "unlimited", "free: 500/day"
    pub rate_limit: String,
    /// e.g. "free", "freemium", "paid"
    pub tier: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureKind {
    Simple,
    Modular,
    Integrated,
}

impl StructureKind {
    fn as_str(&self) -> &'static str {
        match self {
            StructureKind::Simple => "simple",
            StructureKind::Modular => "modular",
            StructureKind::Integrated => "integrated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// Proposed layout of the agent being created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructurePlan {
    pub kind: StructureKind,
    pub directories: Vec<String>,
}

/// Aggregate over the rolling history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub average_confidence: f64,
    pub validity_rate: f64,
    pub by_kind: HashMap<String, KindSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KindSummary {
    pub count: usize,
    pub average_confidence: f64,
}

/// Scores decisions and keeps the rolling history. Owned by one caller;
/// the optional bridge is shared.
pub struct ConfidenceValidator {
    bridge: Option<Arc<ToolBridge>>,
    history: Vec<ValidationResult>,
}

impl ConfidenceValidator {
    pub fn new(bridge: Option<Arc<ToolBridge>>) -> Self {
        Self {
            bridge,
            history: Vec::new(),
        }
    }

    /// Score a template choice against the request text and the caller's
    /// declared domain, consulting the store for the template's historical
    /// prior when possible.
    pub async fn validate_template_selection(
        &mut self,
        template: &str,
        user_input: &str,
        domain: Option<&str>,
    ) -> ValidationResult {
        let history = match &self.bridge {
            Some(bridge) => bridge
                .recall_template_stats(template)
                .await
                .unwrap_or_default(),
            None => TemplateHistory::default(),
        };

        let usage_weight = f64::min(0.2, history.usage_count as f64 / 1000.0);
        let domain_hit = domain_matches_template(template, user_input)
            || domain.is_some_and(|d| domain_matches_template(template, d));
        let domain_bonus = if domain_hit { 0.1 } else { 0.0 };
        let confidence =
            f64::min(0.7 + history.success_rate * usage_weight + domain_bonus, 0.95);

        let facts = serde_json::json!({
            "template": template,
            "domain": domain,
            "input_hash": short_hash(user_input),
            "historical_success_rate": history.success_rate,
            "usage_count": history.usage_count,
            "calculated_confidence": confidence,
        });

        let result = self.finish(
            ValidationKind::TemplateSelection,
            confidence,
            confidence > TEMPLATE_THRESHOLD,
            facts,
            Vec::new(),
        );
        self.record(result.clone()).await;
        result
    }

    /// Score candidate data sources; the best candidate carries the verdict
    pub async fn validate_source_selection(
        &mut self,
        candidates: &[SourceCandidate],
    ) -> ValidationResult {
        let mut scored: Vec<(String, f64)> = candidates
            .iter()
            .map(|candidate| (candidate.name.clone(), source_score(candidate)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let (best, confidence) = scored
            .first()
            .cloned()
            .unwrap_or_else(|| (String::new(), 0.0));

        let facts = serde_json::json!({
            "best_source": best,
            "candidates": scored,
            "confidence_score": confidence,
        });

        let result = self.finish(
            ValidationKind::SourceSelection,
            confidence,
            confidence > SOURCE_THRESHOLD,
            facts,
            Vec::new(),
        );
        self.record(result.clone()).await;
        result
    }

    /// Score a proposed layout against the declared complexity
    pub async fn validate_architecture(
        &mut self,
        structure: &StructurePlan,
        complexity: Complexity,
    ) -> ValidationResult {
        let confidence = architecture_score(structure, complexity);

        let mut recommendations = Vec::new();
        for required in ["scripts", "tests"] {
            if !structure.directories.iter().any(|d| d == required) {
                recommendations.push(format!("Add a {} directory", required));
            }
        }

        let facts = serde_json::json!({
            "structure_type": structure.kind.as_str(),
            "directories": structure.directories,
            "complexity": format!("{:?}", complexity).to_lowercase(),
            "structure_score": confidence,
        });

        let result = self.finish(
            ValidationKind::Architecture,
            confidence,
            confidence > ARCHITECTURE_THRESHOLD,
            facts,
            recommendations,
        );
        self.record(result.clone()).await;
        result
    }

    /// Assemble a result, falling back to the safe default when the proof
    /// cannot be generated
    fn finish(
        &self,
        kind: ValidationKind,
        confidence: f64,
        is_valid: bool,
        facts: serde_json::Value,
        recommendations: Vec<String>,
    ) -> ValidationResult {
        let confidence = confidence.clamp(0.0, 1.0);
        match proof_token(&facts) {
            Some(token) => {
                info!(
                    "{} validation: {:.0}% {}",
                    kind,
                    confidence * 100.0,
                    if is_valid { "valid" } else { "below threshold" }
                );
                ValidationResult {
                    is_valid,
                    confidence,
                    proof_token: token,
                    kind,
                    details: facts,
                    recommendations,
                    recorded_at: Utc::now(),
                }
            }
            None => Self::fallback(kind),
        }
    }

    /// Safe default when scoring itself cannot complete: assume valid at
    /// medium confidence and ask for a manual look.
    pub fn fallback(kind: ValidationKind) -> ValidationResult {
        ValidationResult {
            is_valid: true,
            confidence: 0.5,
            proof_token: "fallback".to_string(),
            kind,
            details: serde_json::json!({"fallback": true}),
            recommendations: vec!["Consider reviewing manually".to_string()],
            recorded_at: Utc::now(),
        }
    }

    /// Append to the rolling history and write back through the bridge
    async fn record(&mut self, result: ValidationResult) {
        if let Some(bridge) = &self.bridge {
            let bridge = Arc::clone(bridge);
            let session = format!("validation-{}", Utc::now().format("%Y%m%d-%H%M%S"));
            let episode = Episode::new(session, result.kind.to_string())
                .with_outcome(result.confidence, result.is_valid);
            // fire and forget; the outcome does not gate the caller
            tokio::spawn(async move {
                if bridge.store_episode(&episode).await.is_none() {
                    debug!("validation write-back skipped");
                }
            });
        }

        self.history.push(result);
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn summary(&self) -> ValidationSummary {
        if self.history.is_empty() {
            return ValidationSummary::default();
        }

        let total = self.history.len();
        let average_confidence =
            self.history.iter().map(|r| r.confidence).sum::<f64>() / total as f64;
        let validity_rate =
            self.history.iter().filter(|r| r.is_valid).count() as f64 / total as f64;

        let mut by_kind: HashMap<String, KindSummary> = HashMap::new();
        for result in &self.history {
            let entry = by_kind.entry(result.kind.to_string()).or_default();
            entry.count += 1;
            entry.average_confidence += result.confidence;
        }
        for entry in by_kind.values_mut() {
            entry.average_confidence /= entry.count as f64;
        }

        ValidationSummary {
            total,
            average_confidence,
            validity_rate,
            by_kind,
        }
    }
}

/// `leaf:<sha256>` over the sorted-key JSON serialization of the facts.
/// Deterministic for identical facts.
fn proof_token(facts: &serde_json::Value) -> Option<String> {
    let serialized = serde_json::to_string(facts).ok()?;
    let digest = Sha256::digest(serialized.as_bytes());
    Some(format!("leaf:{}", hex::encode(digest)))
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn domain_matches_template(template: &str, user_input: &str) -> bool {
    let keyword_sets: [(&str, &[&str]); 3] = [
        (
            "financial",
            &["finance", "stock", "trading", "investment", "money", "market"],
        ),
        (
            "climate",
            &["climate", "weather", "temperature", "environment", "carbon"],
        ),
        (
            "ecommerce",
            &["ecommerce", "store", "shop", "sales", "customer", "inventory"],
        ),
    ];

    let template = template.to_lowercase();
    let input = user_input.to_lowercase();
    for (domain, keywords) in keyword_sets {
        if template.contains(domain) {
            return keywords.iter().any(|keyword| input.contains(keyword));
        }
    }
    false
}

fn source_score(candidate: &SourceCandidate) -> f64 {
    let mut score = 0.5;

    let coverage = candidate.data_coverage.to_lowercase();
    if ["global", "worldwide", "unlimited"].contains(&coverage.as_str()) {
        score += 0.2;
    }

    let rate_limit = candidate.rate_limit.to_lowercase();
    if rate_limit.contains("unlimited") {
        score += 0.2;
    } else if rate_limit.contains("free") {
        score += 0.1;
    }

    let tier = candidate.tier.to_lowercase();
    if tier == "free" || tier == "freemium" {
        score += 0.1;
    }

    f64::min(score, 1.0)
}

fn architecture_score(structure: &StructurePlan, complexity: Complexity) -> f64 {
    let mut score = 0.6;

    score += match structure.kind {
        StructureKind::Modular => 0.2,
        StructureKind::Integrated => 0.1,
        StructureKind::Simple => 0.0,
    };

    let expected = ["scripts", "tests", "references"];
    let found = expected
        .iter()
        .filter(|dir| structure.directories.iter().any(|d| d == *dir))
        .count();
    score += found as f64 / expected.len() as f64 * 0.1;

    score += match (complexity, structure.kind) {
        (Complexity::Low, StructureKind::Simple) => 0.2,
        (Complexity::Low, StructureKind::Modular) => 0.1,
        (Complexity::Medium, StructureKind::Modular) => 0.2,
        (Complexity::Medium, StructureKind::Integrated) => 0.1,
        (Complexity::High, StructureKind::Integrated) => 0.2,
        _ => 0.0,
    };

    f64::min(score, 1.0)
}
