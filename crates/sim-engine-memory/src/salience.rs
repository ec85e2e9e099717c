//! Deterministic salience scoring, reproduced from
//! `original_source/backend/app/services/salience_detector.py`.

use std::cmp::Reverse;

use sim_engine_types::EngineEvent;

pub const SALIENT_EVENT_TYPES: &[&str] = &[
    "proposal_resolved",
    "law_passed",
    "enforcement_initiated",
    "agent_sanctioned",
    "agent_exiled",
    "resources_seized",
    "became_dormant",
    "agent_died",
    "agent_revived",
    "crisis",
    "crisis_event",
    "world_event",
];

pub const SALIENT_KEYWORDS: &[&str] = &[
    "alliance", "ally", "coalition", "betray", "conflict", "hostile", "fight", "war", "truce",
    "sanction", "exile", "crisis", "collapse", "riot",
];

/// Interrupt checkpoints are treated as salient by default.
pub fn is_salient_checkpoint_reason(checkpoint_reason: Option<&str>) -> bool {
    checkpoint_reason
        .map(|reason| reason.starts_with("interrupt_"))
        .unwrap_or(false)
}

pub fn score_event_salience(event: &EngineEvent, agent_id: i64) -> i64 {
    let mut score = 0i64;
    let event_type = event.event_type.as_str();
    let description = event.description.to_lowercase();

    if SALIENT_EVENT_TYPES.contains(&event_type) {
        score += 3;
    }
    if event.agent_id == Some(agent_id) {
        score += 1;
    }
    if SALIENT_KEYWORDS.iter().any(|kw| description.contains(kw)) {
        score += 1;
    }

    if event_type == "proposal_resolved" {
        if let Some(result) = event.metadata.get("result").and_then(|v| v.as_str()) {
            if matches!(result, "passed" | "failed" | "expired") {
                score += 2;
            }
        }
    }
    if matches!(
        event_type,
        "agent_sanctioned" | "agent_exiled" | "agent_died" | "became_dormant"
    ) {
        score += 2;
    }

    score
}

/// Top salient events, highest score first; ties keep original relative
/// order. `Vec::sort_by_key` is a stable sort, so sorting by `Reverse(score)`
/// gives descending order while preserving tie order — this is why the sort
/// key is `Reverse(score)` rather than a reversed comparator.
pub fn detect_salient_events(
    events: &[EngineEvent],
    agent_id: i64,
    limit: usize,
) -> Vec<EngineEvent> {
    let mut scored: Vec<(i64, &EngineEvent)> = events
        .iter()
        .map(|event| (score_event_salience(event, agent_id), event))
        .filter(|(score, _)| *score > 0)
        .collect();

    scored.sort_by_key(|(score, _)| Reverse(*score));
    scored
        .into_iter()
        .take(limit.max(1))
        .map(|(_, event)| event.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, agent_id: Option<i64>, description: &str) -> EngineEvent {
        EngineEvent::new(event_type, json!({})).with_description(description).with_agent(agent_id.unwrap_or(0))
    }

    #[test]
    fn salient_event_type_scores_three() {
        let event = EngineEvent::new("law_passed", json!({}));
        assert_eq!(score_event_salience(&event, 1), 3);
    }

    #[test]
    fn keyword_match_adds_one() {
        let mut event = EngineEvent::new("message", json!({}));
        event.description = "the agents formed an alliance".to_string();
        assert_eq!(score_event_salience(&event, 1), 1);
    }

    #[test]
    fn detect_salient_events_orders_by_score_then_keeps_ties_stable() {
        // agent_died / became_dormant both score 6 (type +3, agent match +1,
        // status-change bonus +2); law_passed scores 4 (type +3, agent match
        // +1). Ties must keep their original relative order.
        let tie_a = event("agent_died", None, "");
        let lower = event("law_passed", None, "");
        let tie_b = event("became_dormant", None, "");
        let events = vec![tie_a.clone(), lower.clone(), tie_b.clone()];
        let result = detect_salient_events(&events, 0, 3);
        assert_eq!(result[0].event_type, "agent_died");
        assert_eq!(result[1].event_type, "became_dormant");
        assert_eq!(result[2].event_type, "law_passed");
    }

    #[test]
    fn interrupt_prefixed_checkpoint_reason_is_salient() {
        assert!(is_salient_checkpoint_reason(Some("interrupt_enforcement")));
        assert!(!is_salient_checkpoint_reason(Some("scheduled")));
        assert!(!is_salient_checkpoint_reason(None));
    }
}
