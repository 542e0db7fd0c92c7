use tracing::{info, warn};

use tollgate_core::audit::{AuditEvent, AuditOutcome, AuditSink};

/// Writes audit events to the tracing pipeline. Failed outcomes go out at
/// warn level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
        let tenant_id = event.tenant_id.as_ref().map(|tenant| tenant.as_str()).unwrap_or("-");

        match event.outcome {
            AuditOutcome::Success => info!(
                event_name = "audit.event",
                audit_event_id = %event.event_id,
                audit_type = %event.event_type,
                category = ?event.category,
                outcome = ?event.outcome,
                actor = %event.actor,
                tenant_id,
                correlation_id = %event.correlation_id,
                metadata = %metadata,
                "audit event"
            ),
            AuditOutcome::Rejected | AuditOutcome::Failed => warn!(
                event_name = "audit.event",
                audit_event_id = %event.event_id,
                audit_type = %event.event_type,
                category = ?event.category,
                outcome = ?event.outcome,
                actor = %event.actor,
                tenant_id,
                correlation_id = %event.correlation_id,
                metadata = %metadata,
                "audit event"
            ),
        }
    }
}
