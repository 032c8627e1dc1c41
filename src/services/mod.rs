pub mod broadcaster;
pub mod reconciler;
pub mod scheduler;

pub use broadcaster::{Broadcaster, LiveEvent, LiveEventKind, Notifier, SubscriberRegistry, Subscription};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use scheduler::{PollingConfig, PollingScheduler, ProviderPoller, TickReport};
