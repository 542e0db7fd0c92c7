pub mod analysis;
pub mod audit;
pub mod chunking;
pub mod clock;
pub mod config;
pub mod domain;
pub mod errors;
pub mod ledger;
pub mod normalize;
pub mod pricing;
pub mod rules;
pub mod similarity;

pub use chrono;
pub use rust_decimal;

pub use analysis::{fallback_analysis, parse_analysis, AnalysisParseError};
pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use clock::{Clock, FixedClock, SystemClock};
pub use domain::analysis::{AnalysisResult, Intention, Sentiment};
pub use domain::tenant::TenantId;
pub use domain::wallet::{LedgerTransaction, TransactionKind, Wallet};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use ledger::{verify_running_total, LedgerVerification};
pub use normalize::{content_hash, normalize_prompt, prompt_cache_key};
pub use pricing::{MarginPolicy, TokenPrices};
