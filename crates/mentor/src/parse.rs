//! Parser for the engram CLI's text output
//!
//! The tool emits human-readable, line-oriented text rather than a stable
//! machine format, so this module is the de facto wire contract of the whole
//! layer. Three layers of detection, in order:
//!
//! 1. a line that is a complete single-line JSON object decodes directly;
//! 2. marker substrings ("Stored episode #42") yield a record id extracted
//!    after the hash, with terminal color escapes stripped;
//! 3. list output is parsed block-wise: a header line flushes the previous
//!    in-progress record, subsequent "Key: value" lines populate fields.
//!
//! Tolerance is the rule: a field that does not parse is skipped, never
//! fatal. A wholly unparseable response yields an empty record.

use crate::records::{CausalEdge, EpisodeHit, RecordId, Skill, StoreStats, TemplateHistory};
use regex::Regex;
use std::sync::OnceLock;

/// Payload recognized inside a tool response
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A single-line JSON object found in the output
    Json(serde_json::Value),
    EpisodeStored(RecordId),
    SkillCreated(RecordId),
    EdgeAdded(RecordId),
    Episodes(Vec<EpisodeHit>),
    Skills(Vec<Skill>),
    /// Nothing recognizable; the raw text is still available
    Empty,
}

/// Parsed tool response: the recognized payload plus the raw text for
/// commands whose interesting content is free-form (critique summaries,
/// consolidation reports).
#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub payload: Payload,
    pub raw: String,
}

fn ansi_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("\\x1b\\[[0-9;]*[A-Za-z]").expect("static regex"))
}

/// Strip terminal color-escape sequences
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").into_owned()
}

/// Entry point: classify and decode one raw tool response
pub fn parse_response(raw: &str) -> ToolResponse {
    let payload = detect_payload(raw);
    ToolResponse {
        payload,
        raw: raw.to_string(),
    }
}

fn detect_payload(raw: &str) -> Payload {
    // JSON fast path: any line that is a complete object
    for line in raw.lines() {
        let line = line.trim();
        if line.starts_with('{') && line.ends_with('}') {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
                return Payload::Json(value);
            }
        }
    }

    if raw.contains("Stored episode #") {
        if let Some(id) = extract_id(raw, "Stored episode #") {
            return Payload::EpisodeStored(id);
        }
    }
    if raw.contains("Created skill #") {
        if let Some(id) = extract_id(raw, "Created skill #") {
            return Payload::SkillCreated(id);
        }
    }
    if raw.contains("Added causal edge #") {
        if let Some(id) = extract_id(raw, "Added causal edge #") {
            return Payload::EdgeAdded(id);
        }
    }
    if raw.contains("Retrieved") && raw.contains("relevant episodes") {
        return Payload::Episodes(parse_episodes(raw));
    }
    if raw.contains("Found") && raw.contains("matching skills") {
        return Payload::Skills(parse_skills(raw));
    }

    Payload::Empty
}

/// Extract the id following `marker` (which ends with `#`). The id is the
/// first whitespace-delimited token after the hash, color escapes stripped.
/// Non-numeric tokens are kept raw rather than discarded.
pub fn extract_id(raw: &str, marker: &str) -> Option<RecordId> {
    for line in raw.lines() {
        if let Some(rest) = line.find(marker).map(|at| &line[at + marker.len()..]) {
            let token = strip_ansi(rest);
            let token = token.split_whitespace().next()?;
            let token = token
                .trim_end_matches(&[':', ',', '.', ')'][..])
                .to_string();
            if token.is_empty() {
                continue;
            }
            return Some(match token.parse::<i64>() {
                Ok(n) => RecordId::Numeric(n),
                Err(_) => RecordId::Raw(token),
            });
        }
    }
    None
}

/// Parse episode blocks. A header line (`#<id>: Episode ...`) flushes the
/// previous record; `Key: value` lines populate fields.
pub fn parse_episodes(raw: &str) -> Vec<EpisodeHit> {
    let mut episodes = Vec::new();
    let mut current: Option<EpisodeHit> = None;

    for line in raw.lines() {
        let line = strip_ansi(line);
        let line = line.trim();

        if line.starts_with('#') && line.contains("Episode") {
            if let Some(done) = current.take() {
                if !done.is_empty() {
                    episodes.push(done);
                }
            }
            let mut hit = EpisodeHit::default();
            hit.episode_id = header_id(line);
            current = Some(hit);
            continue;
        }

        let Some(record) = current.as_mut() else {
            continue;
        };
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Task" => record.task = Some(value.to_string()),
            "Reward" => {
                if let Ok(reward) = value.parse::<f64>() {
                    record.reward = Some(reward);
                }
            }
            "Success" => record.success = Some(value.contains("Yes")),
            "Similarity" => {
                if let Ok(similarity) = value.parse::<f64>() {
                    record.similarity = Some(similarity);
                }
            }
            "Critique" => record.critique = Some(value.to_string()),
            _ => {}
        }
    }

    if let Some(done) = current {
        if !done.is_empty() {
            episodes.push(done);
        }
    }
    episodes
}

/// Id token from a block header like `#42: Episode`
fn header_id(line: &str) -> Option<RecordId> {
    let rest = line.strip_prefix('#')?;
    let token: String = rest
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if token.is_empty() {
        return None;
    }
    Some(match token.parse::<i64>() {
        Ok(n) => RecordId::Numeric(n),
        Err(_) => RecordId::Raw(token),
    })
}

/// Parse skill blocks. Header lines look like `#1: skill-name`; separator
/// rules (`═══`) never start a record.
pub fn parse_skills(raw: &str) -> Vec<Skill> {
    let mut skills = Vec::new();
    let mut current: Option<Skill> = None;

    for line in raw.lines() {
        let line = strip_ansi(line);
        let line = line.trim();

        if line.starts_with('#') && !line.contains("Found") {
            if let Some(done) = current.take() {
                skills.push(done);
            }
            let name = line
                .split_once(':')
                .map(|(_, name)| name.trim())
                .unwrap_or_else(|| line.trim_start_matches('#').trim());
            current = Some(Skill::named(name));
            continue;
        }

        let Some(record) = current.as_mut() else {
            continue;
        };
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Description" => record.description = Some(value.to_string()),
            "Success Rate" => {
                // rendered as a percentage, e.g. "85%" or "85.5 %"
                let cleaned = value.replace('%', "");
                if let Ok(rate) = cleaned.trim().parse::<f64>() {
                    record.success_rate = Some(rate / 100.0);
                }
            }
            "Uses" => {
                if let Ok(uses) = value.parse::<u64>() {
                    record.uses = Some(uses);
                }
            }
            "Avg Reward" => {
                if let Ok(reward) = value.parse::<f64>() {
                    record.avg_reward = Some(reward);
                }
            }
            _ => {}
        }
    }

    if let Some(done) = current {
        skills.push(done);
    }
    skills
}

/// Parse arrow-notation causal edges:
/// `use_template → agent_quality (uplift: 0.25, confidence: 0.95)`
pub fn parse_causal_edges(raw: &str) -> Vec<CausalEdge> {
    let mut edges = Vec::new();

    for line in raw.lines() {
        let line = strip_ansi(line);
        if !line.contains('→') || !line.to_lowercase().contains("uplift") {
            continue;
        }
        let Some((cause, rest)) = line.split_once('→') else {
            continue;
        };
        let cause = cause.trim();
        if cause.is_empty() {
            continue;
        }
        let effect = rest.split('(').next().unwrap_or("").trim();
        if effect.is_empty() {
            continue;
        }

        let mut edge = CausalEdge::new(cause, effect, 0.0);
        edge.confidence = 0.0;
        if let Some(uplift) = field_after(rest, "uplift:", &[',', ')']) {
            if let Ok(value) = uplift.parse::<f64>() {
                edge.uplift = value;
            }
        }
        if let Some(confidence) = field_after(rest, "confidence:", &[',', ')']) {
            if let Ok(value) = confidence.parse::<f64>() {
                edge.confidence = value;
            }
        }
        edges.push(edge);
    }

    edges
}

/// Substring after `marker`, up to the first of `stops`
fn field_after<'a>(text: &'a str, marker: &str, stops: &[char]) -> Option<String> {
    let at = text.find(marker)?;
    let rest = &text[at + marker.len()..];
    let end = rest
        .find(|c| stops.contains(&c))
        .unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}

/// Parse `engram db stats` counter lines
pub fn parse_stats(raw: &str) -> StoreStats {
    let mut stats = StoreStats::default();

    for line in raw.lines() {
        let line = strip_ansi(line);
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let Ok(count) = value.trim().parse::<u64>() else {
            continue;
        };
        // order matters: "causal_edges" and "causal_experiments" share a prefix
        if key.starts_with("causal_edges") {
            stats.causal_edges = Some(count);
        } else if key.starts_with("causal_experiments") {
            stats.causal_experiments = Some(count);
        } else if key.starts_with("episodes") {
            stats.episodes = Some(count);
        } else if key.starts_with("skills") {
            stats.skills = Some(count);
        }
    }

    stats
}

/// Number of skills reported by a consolidation run (`Created 3 skills`)
pub fn parse_consolidation_count(raw: &str) -> u64 {
    for line in raw.lines() {
        if !line.contains("Created") || !line.contains("skills") {
            continue;
        }
        let mut tokens = strip_ansi(line);
        tokens = tokens.trim().to_string();
        let mut words = tokens.split_whitespace();
        while let Some(word) = words.next() {
            if word == "Created" {
                if let Some(count) = words.next().and_then(|w| w.parse::<u64>().ok()) {
                    return count;
                }
                break;
            }
        }
    }
    0
}

/// Critique summary: the text after the last `═` rule, if any
pub fn parse_critique_summary(raw: &str) -> Option<String> {
    let summary = raw.rsplit('═').next().unwrap_or("").trim();
    if summary.is_empty() {
        None
    } else {
        Some(summary.to_string())
    }
}

/// Template prior recalled as single-line JSON
/// (`{"success_rate": 0.85, "usage_count": 120}`)
pub fn parse_template_history(raw: &str) -> Option<TemplateHistory> {
    let Payload::Json(value) = detect_payload(raw) else {
        return None;
    };
    Some(TemplateHistory {
        success_rate: value
            .get("success_rate")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.8),
        usage_count: value
            .get("usage_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[32m42\x1b[0m"), "42");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_stored_episode_marker() {
        let response = parse_response("Stored episode #42\x1b[0m\n");
        assert_eq!(response.payload, Payload::EpisodeStored(RecordId::Numeric(42)));
    }

    #[test]
    fn test_stored_episode_with_color_noise() {
        // the id itself can be wrapped in color escapes
        let response = parse_response("✓ Stored episode #\x1b[1m42\x1b[0m (reward 0.9)");
        assert_eq!(response.payload, Payload::EpisodeStored(RecordId::Numeric(42)));
    }

    #[test]
    fn test_created_skill_marker() {
        let response = parse_response("Created skill #7: fetch-prices");
        match response.payload {
            Payload::SkillCreated(RecordId::Numeric(7)) => {}
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_added_edge_marker() {
        let response = parse_response("Added causal edge #13");
        assert_eq!(response.payload, Payload::EdgeAdded(RecordId::Numeric(13)));
    }

    #[test]
    fn test_non_numeric_id_kept_raw() {
        let response = parse_response("Stored episode #abc123");
        assert_eq!(
            response.payload,
            Payload::EpisodeStored(RecordId::Raw("abc123".into()))
        );
    }

    #[test]
    fn test_json_fast_path() {
        let response = parse_response("info line\n{\"success_rate\": 0.85}\ntrailer");
        match response.payload {
            Payload::Json(value) => assert_eq!(value["success_rate"], 0.85),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_json_line_falls_through() {
        let response = parse_response("{not json}");
        assert_eq!(response.payload, Payload::Empty);
    }

    #[test]
    fn test_episode_blocks() {
        let raw = "\
Retrieved 2 relevant episodes
#3: Episode
  Task: analyze portfolio
  Reward: 0.9
  Success: Yes
  Similarity: 0.82
#4: Episode
  Task: fetch tickers
  Reward: 0.2
  Success: No
  Critique: rate limited
";
        let episodes = parse_episodes(raw);
        assert_eq!(episodes.len(), 2);
        assert_eq!(episodes[0].episode_id, Some(RecordId::Numeric(3)));
        assert_eq!(episodes[0].task.as_deref(), Some("analyze portfolio"));
        assert_eq!(episodes[0].reward, Some(0.9));
        assert_eq!(episodes[0].success, Some(true));
        assert_eq!(episodes[0].similarity, Some(0.82));
        assert_eq!(episodes[1].success, Some(false));
        assert_eq!(episodes[1].critique.as_deref(), Some("rate limited"));
    }

    #[test]
    fn test_episode_bad_number_skipped() {
        let raw = "\
Retrieved 1 relevant episodes
#9: Episode
  Task: parse logs
  Reward: not-a-number
  Success: Yes
";
        let episodes = parse_episodes(raw);
        assert_eq!(episodes.len(), 1);
        assert!(episodes[0].reward.is_none());
        assert_eq!(episodes[0].success, Some(true));
    }

    #[test]
    fn test_skill_blocks() {
        let raw = "\
Found 2 matching skills
═══════════════════════
#1: rsi-calculation
  Description: compute RSI over a window
  Success Rate: 85%
  Uses: 40
  Avg Reward: 0.88
#2: data-caching
  Description: cache fetched series
  Success Rate: 72.5%
";
        let skills = parse_skills(raw);
        assert_eq!(skills.len(), 2);
        assert_eq!(skills[0].name, "rsi-calculation");
        assert_eq!(skills[0].success_rate, Some(0.85));
        assert_eq!(skills[0].uses, Some(40));
        assert_eq!(skills[0].avg_reward, Some(0.88));
        assert_eq!(skills[1].name, "data-caching");
        assert_eq!(skills[1].success_rate, Some(0.725));
        assert!(skills[1].uses.is_none());
    }

    #[test]
    fn test_causal_edge_line() {
        let edges =
            parse_causal_edges("use_template → agent_quality (uplift: 0.25, confidence: 0.95)");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].cause, "use_template");
        assert_eq!(edges[0].effect, "agent_quality");
        assert_eq!(edges[0].uplift, 0.25);
        assert_eq!(edges[0].confidence, 0.95);
    }

    #[test]
    fn test_causal_edge_missing_confidence() {
        let edges = parse_causal_edges("a → b (uplift: 0.1)");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].uplift, 0.1);
        assert_eq!(edges[0].confidence, 0.0);
    }

    #[test]
    fn test_causal_line_without_uplift_ignored() {
        assert!(parse_causal_edges("a → b").is_empty());
    }

    #[test]
    fn test_stats() {
        let raw = "\
episodes: 120
skills: 14
causal_edges: 33
causal_experiments: 5
junk line
broken: count
";
        let stats = parse_stats(raw);
        assert_eq!(stats.episodes, Some(120));
        assert_eq!(stats.skills, Some(14));
        assert_eq!(stats.causal_edges, Some(33));
        assert_eq!(stats.causal_experiments, Some(5));
    }

    #[test]
    fn test_consolidation_count() {
        assert_eq!(parse_consolidation_count("Created 3 skills"), 3);
        assert_eq!(parse_consolidation_count("Created zero skills"), 0);
        assert_eq!(parse_consolidation_count("nothing here"), 0);
    }

    #[test]
    fn test_critique_summary() {
        let raw = "Critique summary\n═══════\n  retry with backoff  ";
        assert_eq!(
            parse_critique_summary(raw).as_deref(),
            Some("retry with backoff")
        );
        assert!(parse_critique_summary("═══").is_none());
    }

    #[test]
    fn test_template_history_json() {
        let history =
            parse_template_history("{\"success_rate\": 0.9, \"usage_count\": 250}").unwrap();
        assert_eq!(history.success_rate, 0.9);
        assert_eq!(history.usage_count, 250);

        // partial object falls back per-field
        let partial = parse_template_history("{\"usage_count\": 5}").unwrap();
        assert_eq!(partial.success_rate, 0.8);
        assert_eq!(partial.usage_count, 5);

        assert!(parse_template_history("no json here").is_none());
    }

    #[test]
    fn test_wholly_unparseable_is_empty_not_fatal() {
        let response = parse_response("�garbage�\nmore garbage");
        assert_eq!(response.payload, Payload::Empty);
        assert!(parse_episodes("garbage").is_empty());
        assert!(parse_skills("garbage").is_empty());
        let stats = parse_stats("garbage");
        assert!(stats.episodes.is_none());
    }
}
