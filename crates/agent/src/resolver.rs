use std::sync::Arc;

use tracing::{info, warn};

use tollgate_core::domain::analysis::AnalysisResult;
use tollgate_core::domain::message::InboundMessage;

use crate::analyzer::MessageAnalyzer;
use crate::automation::{AutomationEngine, AutomationError, AutomationReport};
use crate::knowledge::{KnowledgeRetriever, Resolution};

#[derive(Clone, Debug, PartialEq)]
pub struct InboundResolution {
    pub analysis: AnalysisResult,
    pub automation: AutomationReport,
    /// Present only when no rule sent an auto-reply and retrieval is wired in.
    pub resolution: Option<Resolution>,
}

/// Inbound message path: analyze, run automation, then answer from the
/// knowledge base unless a rule already replied.
pub struct InboundResolver {
    analyzer: Arc<MessageAnalyzer>,
    automation: Arc<AutomationEngine>,
    retriever: Option<Arc<KnowledgeRetriever>>,
}

impl InboundResolver {
    pub fn new(
        analyzer: Arc<MessageAnalyzer>,
        automation: Arc<AutomationEngine>,
        retriever: Option<Arc<KnowledgeRetriever>>,
    ) -> Self {
        Self { analyzer, automation, retriever }
    }

    pub async fn handle(&self, message: &InboundMessage) -> Result<InboundResolution, AutomationError> {
        let analysis = self.analyzer.analyze(&message.tenant_id, &message.content).await;
        let automation = self.automation.evaluate_and_execute(message, &analysis).await?;

        let resolution = match &self.retriever {
            Some(retriever) if !automation.auto_replied() => {
                match retriever
                    .resolve(&message.tenant_id, &message.content, Some(&message.conversation_id))
                    .await
                {
                    Ok(resolution) => Some(resolution),
                    Err(error) => {
                        warn!(
                            event_name = "resolver.retrieval_failed",
                            tenant_id = %message.tenant_id,
                            message_id = %message.id.0,
                            error = %error,
                            "knowledge retrieval failed; leaving message for a human"
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        info!(
            event_name = "resolver.message.handled",
            tenant_id = %message.tenant_id,
            message_id = %message.id.0,
            executed_rules = automation.executed.len(),
            skipped_rules = automation.skipped.len(),
            resolved = resolution.as_ref().map(|resolution| resolution.grounded).unwrap_or(false),
            "inbound message handled"
        );

        Ok(InboundResolution { analysis, automation, resolution })
    }
}
