pub mod event;
pub mod transaction;

pub use event::{CanonicalStatus, EventSource, ProviderEvent};
pub use transaction::{AuditEntry, Provider, Transaction, TransactionStatus};
