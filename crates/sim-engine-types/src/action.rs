use serde::{Deserialize, Serialize};

use crate::{EnforcementVoteChoice, ResourceType, VoteChoice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkJob {
    Farm,
    Generate,
    Gather,
}

impl WorkJob {
    pub const fn resource(self) -> ResourceType {
        match self {
            WorkJob::Farm => ResourceType::Food,
            WorkJob::Generate => ResourceType::Energy,
            WorkJob::Gather => ResourceType::Materials,
        }
    }

    /// Base hourly yield before the diminishing-returns curve is applied.
    /// Reproduced verbatim from `app/services/actions.py::WORK_YIELDS`.
    pub const fn base_yield(self) -> f64 {
        match self {
            WorkJob::Farm => 2.0,
            WorkJob::Generate => 1.5,
            WorkJob::Gather => 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAmount {
    pub resource: ResourceType,
    pub qty: f64,
}

/// The tagged action union produced by model dispatch and consumed by the
/// action engine. Mirrors spec.md §6's action object grammar exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Idle,
    Work {
        job: WorkJob,
    },
    Trade {
        target_agent_number: i64,
        give: ResourceAmount,
        receive: ResourceAmount,
    },
    Consume {
        resource: ResourceType,
        qty: f64,
    },
    Produce {
        job: WorkJob,
    },
    Propose {
        proposal_type: String,
        title: String,
        description: String,
    },
    Vote {
        proposal_id: i64,
        vote: VoteChoice,
    },
    Message {
        target_agent_number: Option<i64>,
        body: String,
    },
    EnforceInitiate {
        target_agent_number: i64,
        enforcement_type: String,
        law_id: i64,
        violation_description: String,
    },
    EnforceVote {
        enforcement_id: i64,
        vote: EnforcementVoteChoice,
    },
    SetName {
        display_name: String,
    },
}

impl Action {
    pub const fn tag(&self) -> &'static str {
        match self {
            Action::Idle => "idle",
            Action::Work { .. } => "work",
            Action::Trade { .. } => "trade",
            Action::Consume { .. } => "consume",
            Action::Produce { .. } => "produce",
            Action::Propose { .. } => "propose",
            Action::Vote { .. } => "vote",
            Action::Message { .. } => "message",
            Action::EnforceInitiate { .. } => "enforce_initiate",
            Action::EnforceVote { .. } => "enforce_vote",
            Action::SetName { .. } => "set_name",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_through_json() {
        let action = Action::Trade {
            target_agent_number: 2,
            give: ResourceAmount { resource: ResourceType::Food, qty: 1.0 },
            receive: ResourceAmount { resource: ResourceType::Energy, qty: 1.0 },
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "trade");
        let back: Action = serde_json::from_value(json).unwrap();
        assert_eq!(back.tag(), "trade");
    }

    #[test]
    fn idle_has_no_extra_fields() {
        let action = Action::Idle;
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json, serde_json::json!({"action": "idle"}));
    }
}
