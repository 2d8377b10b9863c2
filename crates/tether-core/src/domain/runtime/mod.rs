mod aggregation;
mod session_actor;
mod subscription;
mod supervisor;

pub use aggregation::AggregationHandle;
pub use session_actor::{MessageAccepted, SessionError, SessionSummary, UpdateObserver};
pub use subscription::SessionObservable;
pub use supervisor::{SessionStore, SessionStoreService};
