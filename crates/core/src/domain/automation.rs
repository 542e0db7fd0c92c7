use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::analysis::Intention;
use crate::domain::message::{ConversationId, MessageId, Priority};
use crate::domain::tenant::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeywordMode {
    /// At least one keyword is a substring of the content.
    Any,
    /// Every keyword is a substring of the content.
    All,
    /// The trimmed content equals one of the keywords.
    Exact,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    IntentionMatch {
        intentions: Vec<Intention>,
    },
    KeywordMatch {
        keywords: Vec<String>,
        mode: KeywordMode,
    },
    SenderIsVip,
    FirstMessage,
    /// `[start, end)` in the tenant's local time. No wraparound: `start > end`
    /// never matches.
    TimeWindow {
        start: NaiveTime,
        end: NaiveTime,
        #[serde(default)]
        weekdays: Option<Vec<Weekday>>,
        #[serde(default)]
        utc_offset_minutes: i32,
    },
}

impl Condition {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IntentionMatch { .. } => "intention_match",
            Self::KeywordMatch { .. } => "keyword_match",
            Self::SenderIsVip => "sender_is_vip",
            Self::FirstMessage => "first_message",
            Self::TimeWindow { .. } => "time_window",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(flatten)]
    pub condition: Condition,
    #[serde(default)]
    pub negate: bool,
}

impl RuleCondition {
    pub fn new(condition: Condition) -> Self {
        Self { condition, negate: false }
    }

    pub fn negated(condition: Condition) -> Self {
        Self { condition, negate: true }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    AddTag { tag: String },
    AssignAgent { agent_id: String },
    SetPriority { priority: Priority },
    AutoReply { text: String },
    MarkVip,
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddTag { .. } => "add_tag",
            Self::AssignAgent { .. } => "assign_agent",
            Self::SetPriority { .. } => "set_priority",
            Self::AutoReply { .. } => "auto_reply",
            Self::MarkVip => "mark_vip",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStats {
    pub evaluation_count: u64,
    pub execution_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: RuleId,
    pub tenant_id: TenantId,
    pub name: String,
    /// Lower runs first.
    pub priority: i32,
    pub active: bool,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<Action>,
    pub stats: RuleStats,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Executed,
    PartiallyFailed,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::PartiallyFailed => "partially_failed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "executed" => Some(Self::Executed),
            "partially_failed" => Some(Self::PartiallyFailed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn matched(&self) -> bool {
        !matches!(self, Self::Skipped)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    Applied,
    Suppressed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: String,
    pub result: ActionResult,
    pub detail: Option<String>,
}

/// Audit row written for every rule evaluation, matched or not.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub rule_id: RuleId,
    pub tenant_id: TenantId,
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub status: ExecutionStatus,
    pub outcomes: Vec<ActionOutcome>,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(
        rule: &AutomationRule,
        conversation_id: ConversationId,
        message_id: MessageId,
        status: ExecutionStatus,
        outcomes: Vec<ActionOutcome>,
        executed_at: DateTime<Utc>,
    ) -> Self {
        let error = (status == ExecutionStatus::Failed).then(|| {
            outcomes
                .iter()
                .filter_map(|outcome| outcome.detail.clone())
                .collect::<Vec<_>>()
                .join("; ")
        });

        Self {
            id: Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            tenant_id: rule.tenant_id.clone(),
            conversation_id,
            message_id,
            status,
            outcomes,
            error,
            executed_at,
        }
    }

    pub fn replied(&self) -> bool {
        self.outcomes
            .iter()
            .any(|outcome| outcome.action == "auto_reply" && outcome.result == ActionResult::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, Condition, KeywordMode, RuleCondition};
    use crate::domain::analysis::Intention;

    #[test]
    fn conditions_serialize_with_type_tag_and_negation() {
        let condition = RuleCondition::negated(Condition::SenderIsVip);
        let json = serde_json::to_value(&condition).expect("serialize");

        assert_eq!(json["type"], "sender_is_vip");
        assert_eq!(json["negate"], true);

        let parsed: RuleCondition = serde_json::from_value(serde_json::json!({
            "type": "keyword_match",
            "keywords": ["price"],
            "mode": "ANY"
        }))
        .expect("deserialize");
        assert!(!parsed.negate);
        assert_eq!(
            parsed.condition,
            Condition::KeywordMatch { keywords: vec!["price".to_string()], mode: KeywordMode::Any }
        );
    }

    #[test]
    fn intention_condition_uses_uppercase_names() {
        let condition = Condition::IntentionMatch { intentions: vec![Intention::Sales] };
        let json = serde_json::to_string(&condition).expect("serialize");
        assert!(json.contains("\"SALES\""));
    }

    #[test]
    fn action_kind_names_are_stable() {
        assert_eq!(Action::MarkVip.kind(), "mark_vip");
        assert_eq!(Action::AddTag { tag: "Lead".to_string() }.kind(), "add_tag");
    }
}
