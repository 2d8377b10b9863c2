pub mod aggregator;
pub mod delta;
pub mod observable;
pub mod runtime;
pub mod session;
pub mod transcript;
pub mod types;
pub mod update;

pub use aggregator::{AggregationError, Aggregator, Progress};
pub use delta::{BackendEvent, DeltaEvent, Phase};
pub use observable::{
    ChannelObserver, Coalesce, FnObserver, Notification, NotificationStream, Observable, Observer,
    StreamError, SubscriberError, SubscriberList, Unsubscribe, channel_observer,
};
pub use transcript::{Channel, Part, Role, StopReason, Transcript, Turn, TurnStatus};
pub use types::{AggregationId, CallId, SessionId, SubscriberId, TurnId};
pub use update::SessionUpdate;
