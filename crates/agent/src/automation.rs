//! Automation rule engine.
//!
//! Rules run in ascending priority against one inbound message. Conditions are
//! AND-ed; every action of a matching rule runs even if a sibling fails. Each
//! evaluation, matched or not, leaves an execution record and bumps the rule's
//! counters.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, error, info};

use tollgate_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use tollgate_core::clock::Clock;
use tollgate_core::config::AutomationConfig;
use tollgate_core::domain::analysis::AnalysisResult;
use tollgate_core::domain::automation::{
    Action, ActionOutcome, ActionResult, AutomationRule, ExecutionRecord, ExecutionStatus, RuleId,
};
use tollgate_core::domain::message::{InboundMessage, OutboundReply};
use tollgate_core::errors::ApplicationError;
use tollgate_core::rules::{rule_matches, EvaluationContext};
use tollgate_db::repositories::{CrmRepository, RepositoryError, RuleRepository};

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("automation store unavailable: {0}")]
    Repository(#[from] RepositoryError),
}

impl From<AutomationError> for ApplicationError {
    fn from(value: AutomationError) -> Self {
        match value {
            AutomationError::Repository(error) => Self::Persistence(error.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleEvaluation {
    pub rule_id: RuleId,
    pub rule_name: String,
    pub status: ExecutionStatus,
    pub outcomes: Vec<ActionOutcome>,
}

impl RuleEvaluation {
    pub fn replied(&self) -> bool {
        self.outcomes.iter().any(|outcome| {
            outcome.action == "auto_reply" && outcome.result == ActionResult::Applied
        })
    }
}

/// Executed and skipped rules, each in evaluation order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AutomationReport {
    pub executed: Vec<RuleEvaluation>,
    pub skipped: Vec<RuleEvaluation>,
}

impl AutomationReport {
    pub fn auto_replied(&self) -> bool {
        self.executed.iter().any(RuleEvaluation::replied)
    }

    pub fn executed_ids(&self) -> Vec<&RuleId> {
        self.executed.iter().map(|evaluation| &evaluation.rule_id).collect()
    }

    pub fn skipped_ids(&self) -> Vec<&RuleId> {
        self.skipped.iter().map(|evaluation| &evaluation.rule_id).collect()
    }
}

pub struct AutomationEngine {
    rules: Arc<dyn RuleRepository>,
    crm: Arc<dyn CrmRepository>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    auto_reply_lookback: Duration,
}

impl AutomationEngine {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        crm: Arc<dyn CrmRepository>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: &AutomationConfig,
    ) -> Self {
        let lookback = i64::try_from(config.auto_reply_lookback_secs).unwrap_or(i64::MAX);
        Self { rules, crm, audit, clock, auto_reply_lookback: Duration::seconds(lookback) }
    }

    pub async fn evaluate_and_execute(
        &self,
        message: &InboundMessage,
        analysis: &AnalysisResult,
    ) -> Result<AutomationReport, AutomationError> {
        let rules = self.rules.active_rules(&message.tenant_id).await?;
        let now = self.clock.now();

        // Sender state is read once so every rule sees the same context.
        let sender_is_vip = self
            .crm
            .find_contact(&message.contact_id)
            .await?
            .map(|contact| contact.is_vip)
            .unwrap_or(false);
        let conversation_message_count = self
            .crm
            .find_conversation(&message.conversation_id)
            .await?
            .map(|conversation| conversation.message_count)
            .unwrap_or(1);

        let context = EvaluationContext {
            content: &message.content,
            analysis,
            sender_is_vip,
            conversation_message_count,
            now,
        };

        let mut report = AutomationReport::default();
        for rule in &rules {
            if !rule_matches(rule, &context) {
                debug!(
                    event_name = "automation.rule.skipped",
                    tenant_id = %message.tenant_id,
                    rule_id = %rule.id.0,
                    "rule conditions not met"
                );
                self.record(rule, message, ExecutionStatus::Skipped, Vec::new(), now).await;
                report.skipped.push(RuleEvaluation {
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    status: ExecutionStatus::Skipped,
                    outcomes: Vec::new(),
                });
                continue;
            }

            let mut outcomes = Vec::with_capacity(rule.actions.len());
            for action in &rule.actions {
                outcomes.push(self.run_action(rule, action, message, now).await);
            }
            let status = execution_status(&outcomes);

            info!(
                event_name = "automation.rule.executed",
                tenant_id = %message.tenant_id,
                rule_id = %rule.id.0,
                status = status.as_str(),
                actions = outcomes.len(),
                "rule executed"
            );
            if status != ExecutionStatus::Executed {
                self.audit.emit(
                    AuditEvent::new(
                        Some(message.tenant_id.clone()),
                        message.id.0.clone(),
                        "automation.rule_failed",
                        AuditCategory::Automation,
                        "automation-engine",
                        AuditOutcome::Failed,
                    )
                    .with_metadata("rule_id", rule.id.0.clone())
                    .with_metadata("status", status.as_str()),
                );
            }

            self.record(rule, message, status, outcomes.clone(), now).await;
            report.executed.push(RuleEvaluation {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                status,
                outcomes,
            });
        }

        Ok(report)
    }

    async fn run_action(
        &self,
        rule: &AutomationRule,
        action: &Action,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> ActionOutcome {
        let result = match action {
            Action::AddTag { tag } => {
                match self.crm.add_tag(&message.contact_id, tag, now).await {
                    Ok(true) => Ok((ActionResult::Applied, None)),
                    Ok(false) => {
                        Ok((ActionResult::Suppressed, Some(format!("tag `{tag}` already present"))))
                    }
                    Err(error) => Err(error),
                }
            }
            Action::AssignAgent { agent_id } => self
                .crm
                .assign_agent(&message.conversation_id, agent_id)
                .await
                .map(|()| (ActionResult::Applied, None)),
            Action::SetPriority { priority } => self
                .crm
                .set_priority(&message.conversation_id, *priority)
                .await
                .map(|()| (ActionResult::Applied, None)),
            Action::MarkVip => self
                .crm
                .mark_vip(&message.contact_id)
                .await
                .map(|()| (ActionResult::Applied, None)),
            Action::AutoReply { text } => self.auto_reply(rule, message, text, now).await,
        };

        match result {
            Ok((result, detail)) => ActionOutcome { action: action.kind().to_string(), result, detail },
            Err(error) => {
                error!(
                    event_name = "automation.action.failed",
                    tenant_id = %message.tenant_id,
                    rule_id = %rule.id.0,
                    action = action.kind(),
                    error = %error,
                    "automation action failed"
                );
                ActionOutcome {
                    action: action.kind().to_string(),
                    result: ActionResult::Failed,
                    detail: Some(error.to_string()),
                }
            }
        }
    }

    /// At most one reply per rule and conversation inside the look-back window.
    async fn auto_reply(
        &self,
        rule: &AutomationRule,
        message: &InboundMessage,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<(ActionResult, Option<String>), RepositoryError> {
        if let Some(last) = self.rules.last_auto_reply_at(&rule.id, &message.conversation_id).await? {
            if now - last < self.auto_reply_lookback {
                return Ok((
                    ActionResult::Suppressed,
                    Some(format!("auto-reply already sent at {}", last.to_rfc3339())),
                ));
            }
        }

        self.crm
            .record_reply(OutboundReply::new(
                message.tenant_id.clone(),
                message.conversation_id.clone(),
                Some(rule.id.clone()),
                text,
                now,
            ))
            .await?;
        Ok((ActionResult::Applied, None))
    }

    async fn record(
        &self,
        rule: &AutomationRule,
        message: &InboundMessage,
        status: ExecutionStatus,
        outcomes: Vec<ActionOutcome>,
        now: DateTime<Utc>,
    ) {
        let record = ExecutionRecord::new(
            rule,
            message.conversation_id.clone(),
            message.id.clone(),
            status,
            outcomes,
            now,
        );
        if let Err(error) = self.rules.record_execution(&record).await {
            error!(
                event_name = "automation.execution.record_failed",
                tenant_id = %message.tenant_id,
                rule_id = %rule.id.0,
                error = %error,
                "could not persist execution record"
            );
        }
    }
}

/// Failed only when nothing else happened; a mix is a partial failure.
pub fn execution_status(outcomes: &[ActionOutcome]) -> ExecutionStatus {
    let failed = outcomes.iter().filter(|outcome| outcome.result == ActionResult::Failed).count();
    if failed == 0 {
        ExecutionStatus::Executed
    } else if failed == outcomes.len() {
        ExecutionStatus::Failed
    } else {
        ExecutionStatus::PartiallyFailed
    }
}
