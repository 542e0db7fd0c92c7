//! Tollgate agent services.
//!
//! Everything that talks to a model provider goes through the
//! [`broker::UsageBroker`], which owns the prepaid billing contract:
//!
//! 1. **Cache** (`broker`) - a normalized prompt hit is billed symbolically
//! 2. **Guard** (`ledger`) - estimated cost is checked against the wallet
//! 3. **Invoke** (`llm`) - OpenAI, Anthropic or Ollama over HTTP
//! 4. **Debit** (`ledger`) - actual cost plus margin, atomically
//!
//! Higher-level services build on that contract:
//!
//! - `analyzer` - message intent and sentiment with a deterministic fallback
//! - `automation` - priority-ordered rules and their side effects
//! - `knowledge` - source ingestion and grounded answers with signed attachments
//! - `resolver` - the inbound message path tying the three together
//!
//! `runtime` wires every service against one database pool.

pub mod analyzer;
pub mod audit;
pub mod automation;
pub mod broker;
pub mod credentials;
pub mod knowledge;
pub mod ledger;
pub mod llm;
pub mod resolver;
pub mod runtime;

pub use analyzer::{AnalysisOutcome, AnalysisSource, MessageAnalyzer};
pub use audit::TracingAuditSink;
pub use automation::{AutomationEngine, AutomationError, AutomationReport};
pub use broker::{BrokerError, BrokerResponse, CompletionService, RequestOptions, UsageBroker};
pub use credentials::{CredentialSource, CredentialStore};
pub use ledger::{LedgerError, LedgerService};
pub use resolver::{InboundResolution, InboundResolver};
pub use runtime::{RuntimeError, TollgateRuntime};
