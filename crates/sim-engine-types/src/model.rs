use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unrecognized value `{0}` for {1}")]
pub struct UnknownVariant(pub String, pub &'static str);

/// Stable, literal model-type set. Adding a model is a migration, never a
/// runtime-configurable value — mirrors the `valid_model` CHECK constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    ClaudeSonnet4,
    Gpt4oMini,
    ClaudeHaiku,
    Llama3_3_70b,
    Llama3_1_8b,
    GeminiFlash,
    OrGptOss120b,
    OrQwen3_235bA22b2507,
    OrDeepseekV3_2,
    OrDeepseekChatV3_1,
    OrGptOss20b,
    OrQwen3_32b,
    OrGptOss20bFree,
    OrQwen3_4bFree,
    GrLlama3_1_8bInstant,
}

impl ModelType {
    pub const ALL: &'static [ModelType] = &[
        ModelType::ClaudeSonnet4,
        ModelType::Gpt4oMini,
        ModelType::ClaudeHaiku,
        ModelType::Llama3_3_70b,
        ModelType::Llama3_1_8b,
        ModelType::GeminiFlash,
        ModelType::OrGptOss120b,
        ModelType::OrQwen3_235bA22b2507,
        ModelType::OrDeepseekV3_2,
        ModelType::OrDeepseekChatV3_1,
        ModelType::OrGptOss20b,
        ModelType::OrQwen3_32b,
        ModelType::OrGptOss20bFree,
        ModelType::OrQwen3_4bFree,
        ModelType::GrLlama3_1_8bInstant,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ModelType::ClaudeSonnet4 => "claude-sonnet-4",
            ModelType::Gpt4oMini => "gpt-4o-mini",
            ModelType::ClaudeHaiku => "claude-haiku",
            ModelType::Llama3_3_70b => "llama-3.3-70b",
            ModelType::Llama3_1_8b => "llama-3.1-8b",
            ModelType::GeminiFlash => "gemini-flash",
            ModelType::OrGptOss120b => "or_gpt_oss_120b",
            ModelType::OrQwen3_235bA22b2507 => "or_qwen3_235b_a22b_2507",
            ModelType::OrDeepseekV3_2 => "or_deepseek_v3_2",
            ModelType::OrDeepseekChatV3_1 => "or_deepseek_chat_v3_1",
            ModelType::OrGptOss20b => "or_gpt_oss_20b",
            ModelType::OrQwen3_32b => "or_qwen3_32b",
            ModelType::OrGptOss20bFree => "or_gpt_oss_20b_free",
            ModelType::OrQwen3_4bFree => "or_qwen3_4b_free",
            ModelType::GrLlama3_1_8bInstant => "gr_llama_3_1_8b_instant",
        }
    }

    /// A CHECK-constraint-compatible `IN (...)` clause for migrations/tests.
    pub fn sql_check_clause() -> String {
        let quoted: Vec<String> = Self::ALL.iter().map(|m| format!("'{}'", m.as_str())).collect();
        format!("model_type IN ({})", quoted.join(", "))
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string(), "ModelType"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Food,
    Energy,
    Materials,
}

impl ResourceType {
    pub const ALL: [ResourceType; 3] = [ResourceType::Food, ResourceType::Energy, ResourceType::Materials];

    pub const fn as_str(self) -> &'static str {
        match self {
            ResourceType::Food => "food",
            ResourceType::Energy => "energy",
            ResourceType::Materials => "materials",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = UnknownVariant;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "food" => Ok(ResourceType::Food),
            "energy" => Ok(ResourceType::Energy),
            "materials" => Ok(ResourceType::Materials),
            other => Err(UnknownVariant(other.to_string(), "ResourceType")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Dormant,
    Dead,
}

impl AgentStatus {
    /// Status transitions are monotonic: active -> dormant -> dead.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (AgentStatus::Active, AgentStatus::Dormant)
                | (AgentStatus::Active, AgentStatus::Dead)
                | (AgentStatus::Dormant, AgentStatus::Dead)
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Dormant => "dormant",
            AgentStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = UnknownVariant;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AgentStatus::Active),
            "dormant" => Ok(AgentStatus::Dormant),
            "dead" => Ok(AgentStatus::Dead),
            other => Err(UnknownVariant(other.to_string(), "AgentStatus")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Active,
    Passed,
    Failed,
    Expired,
}

impl ProposalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProposalStatus::Active)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ProposalStatus::Active => "active",
            ProposalStatus::Passed => "passed",
            ProposalStatus::Failed => "failed",
            ProposalStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    Law,
    Repeal,
    General,
}

impl fmt::Display for ProposalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProposalType::Law => "law",
            ProposalType::Repeal => "repeal",
            ProposalType::General => "general",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementType {
    Sanction,
    Seizure,
    Exile,
}

impl fmt::Display for EnforcementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnforcementType::Sanction => "sanction",
            EnforcementType::Seizure => "seizure",
            EnforcementType::Exile => "exile",
        };
        write!(f, "{s}")
    }
}

/// pending -> {approved -> executed, rejected, contested}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Contested,
}

impl EnforcementStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EnforcementStatus::Executed | EnforcementStatus::Rejected | EnforcementStatus::Contested
        )
    }

    /// Validates a status transition against the declared lifecycle. Terminal
    /// statuses never leave their state (spec.md §8).
    pub fn transition(self, next: EnforcementStatus) -> Result<EnforcementStatus, String> {
        let allowed = matches!(
            (self, next),
            (EnforcementStatus::Pending, EnforcementStatus::Approved)
                | (EnforcementStatus::Pending, EnforcementStatus::Rejected)
                | (EnforcementStatus::Pending, EnforcementStatus::Contested)
                | (EnforcementStatus::Approved, EnforcementStatus::Executed)
        );
        if allowed || self == next {
            Ok(next)
        } else {
            Err(format!("illegal enforcement transition {self:?} -> {next:?}"))
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EnforcementStatus::Pending => "pending",
            EnforcementStatus::Approved => "approved",
            EnforcementStatus::Rejected => "rejected",
            EnforcementStatus::Executed => "executed",
            EnforcementStatus::Contested => "contested",
        }
    }
}

impl fmt::Display for EnforcementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementVoteChoice {
    Support,
    Oppose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    WorkProduction,
    Trade,
    Allocation,
    Consumption,
    Building,
    Awakening,
    InitialDistribution,
    SurvivalConsumption,
    DormantSurvival,
    ActionCost,
    Seizure,
}

impl TransactionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            TransactionType::WorkProduction => "work_production",
            TransactionType::Trade => "trade",
            TransactionType::Allocation => "allocation",
            TransactionType::Consumption => "consumption",
            TransactionType::Building => "building",
            TransactionType::Awakening => "awakening",
            TransactionType::InitialDistribution => "initial_distribution",
            TransactionType::SurvivalConsumption => "survival_consumption",
            TransactionType::DormantSurvival => "dormant_survival",
            TransactionType::ActionCost => "action_cost",
            TransactionType::Seizure => "seizure",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Test,
    Real,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunClass {
    Standard72h,
    Deep96h,
    SpecialExploratory,
}

/// Lineage origin for a seeded agent. Only `carryover`/`fresh` are valid;
/// anything else is an integrity violation at the store boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageOrigin {
    Carryover,
    Fresh,
}

impl fmt::Display for LineageOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LineageOrigin::Carryover => "carryover",
            LineageOrigin::Fresh => "fresh",
        };
        write!(f, "{s}")
    }
}
