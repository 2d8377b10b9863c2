use std::any::type_name;
use std::sync::Arc;

use async_trait::async_trait;
use tether_core::config::DEFAULT_OBSERVER_BUFFER;
use tether_core::domain::{
    CallId, Coalesce, NotificationStream, Observable, Observer, StreamError, SubscriberError,
    Unsubscribe, channel_observer,
};
use tracing::debug;

use crate::error::LinkError;
use crate::router::{OperationKind, Payload, Router, SharedObservable};

/// One call contract for every operation kind, independent of how the
/// router is reached.
#[async_trait]
pub trait Link: Send + Sync {
    async fn query<I, O>(&self, operation: &str, input: I) -> Result<O, LinkError>
    where
        I: Send + 'static,
        O: Send + 'static;

    /// Runs a mutation exactly once; failures are never retried.
    async fn mutate<I, O>(&self, operation: &str, input: I) -> Result<O, LinkError>
    where
        I: Send + 'static,
        O: Send + 'static;

    /// Attaches `observer` to the operation's stream. Failures before the
    /// stream exists are delivered through `on_error`.
    async fn subscribe<I, T>(
        &self,
        operation: &str,
        input: I,
        observer: Box<dyn Observer<T, LinkError>>,
    ) -> Unsubscribe
    where
        I: Send + 'static,
        T: Send + 'static;

    fn observer_buffer(&self) -> usize {
        DEFAULT_OBSERVER_BUFFER
    }

    /// Subscribes with a bounded channel observer. A consumer that falls
    /// behind receives coalesced items instead of being dropped.
    async fn subscribe_channel<I, T>(
        &self,
        operation: &str,
        input: I,
    ) -> (NotificationStream<T, LinkError>, Unsubscribe)
    where
        I: Send + 'static,
        T: Coalesce + Send + 'static,
    {
        let (observer, stream) = channel_observer(self.observer_buffer());
        let unsubscribe = self.subscribe(operation, input, Box::new(observer)).await;
        (stream, unsubscribe)
    }
}

/// Link that calls the router directly, without serialization.
pub struct InProcessLink<C> {
    router: Arc<Router<C>>,
    context: Arc<C>,
    observer_buffer: usize,
}

impl<C> Clone for InProcessLink<C> {
    fn clone(&self) -> Self {
        Self {
            router: self.router.clone(),
            context: self.context.clone(),
            observer_buffer: self.observer_buffer,
        }
    }
}

impl<C> InProcessLink<C>
where
    C: Send + Sync + 'static,
{
    pub fn new(router: Router<C>, context: C) -> Self {
        Self {
            router: Arc::new(router),
            context: Arc::new(context),
            observer_buffer: DEFAULT_OBSERVER_BUFFER,
        }
    }

    pub fn with_observer_buffer(mut self, capacity: usize) -> Self {
        self.observer_buffer = capacity.max(1);
        self
    }

    pub fn router(&self) -> &Router<C> {
        &self.router
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    async fn call<I, O>(
        &self,
        operation: &str,
        kind: OperationKind,
        input: I,
    ) -> Result<O, LinkError>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let call_id = CallId::new();
        debug!(target: "tether::link", %call_id, operation, %kind, "Call started");

        let result = self
            .router
            .invoke(self.context.clone(), operation, kind, Box::new(input))
            .await
            .and_then(|output| downcast_output::<O>(operation, output));

        match &result {
            Ok(_) => {
                debug!(target: "tether::link", %call_id, operation, %kind, "Call finished");
            }
            Err(e) => {
                debug!(
                    target: "tether::link",
                    %call_id,
                    operation,
                    %kind,
                    error = %e,
                    "Call failed"
                );
            }
        }
        result
    }
}

fn downcast_output<O: 'static>(operation: &str, output: Payload) -> Result<O, LinkError> {
    output
        .downcast::<O>()
        .map(|output| *output)
        .map_err(|_| LinkError::OutputMismatch {
            operation: operation.to_string(),
            expected: type_name::<O>(),
        })
}

#[async_trait]
impl<C> Link for InProcessLink<C>
where
    C: Send + Sync + 'static,
{
    async fn query<I, O>(&self, operation: &str, input: I) -> Result<O, LinkError>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        self.call(operation, OperationKind::Query, input).await
    }

    async fn mutate<I, O>(&self, operation: &str, input: I) -> Result<O, LinkError>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        self.call(operation, OperationKind::Mutation, input).await
    }

    async fn subscribe<I, T>(
        &self,
        operation: &str,
        input: I,
        mut observer: Box<dyn Observer<T, LinkError>>,
    ) -> Unsubscribe
    where
        I: Send + 'static,
        T: Send + 'static,
    {
        let observable = self
            .call::<I, SharedObservable<T>>(operation, OperationKind::Subscription, input)
            .await;

        match observable {
            Ok(observable) => observable.subscribe(Box::new(LinkObserver { inner: observer })),
            Err(e) => {
                observer.on_error(e);
                Unsubscribe::noop()
            }
        }
    }

    fn observer_buffer(&self) -> usize {
        self.observer_buffer
    }
}

/// Re-exposes the handler's stream, lifting its errors into [`LinkError`].
struct LinkObserver<T> {
    inner: Box<dyn Observer<T, LinkError>>,
}

impl<T: Send + 'static> Observer<T, StreamError> for LinkObserver<T> {
    fn on_next(&mut self, item: T) -> Result<(), SubscriberError> {
        self.inner.on_next(item)
    }

    fn on_error(&mut self, error: StreamError) {
        self.inner.on_error(LinkError::Stream(error));
    }

    fn on_complete(&mut self) {
        self.inner.on_complete();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::RouterError;
    use tether_core::domain::{FnObserver, Notification};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Tick(u32);

    impl Coalesce for Tick {
        fn supersedes(&self, _older: &Self) -> bool {
            false
        }
    }

    /// Emits its items on subscribe, then completes.
    struct Replay(Vec<Tick>);

    impl Observable<Tick, StreamError> for Replay {
        fn subscribe(&self, mut observer: Box<dyn Observer<Tick, StreamError>>) -> Unsubscribe {
            for item in &self.0 {
                if observer.on_next(*item).is_err() {
                    return Unsubscribe::noop();
                }
            }
            observer.on_complete();
            Unsubscribe::noop()
        }
    }

    async fn count_to(_context: Arc<()>, n: u32) -> Result<SharedObservable<Tick>, LinkError> {
        Ok(Arc::new(Replay((1..=n).map(Tick).collect())))
    }

    async fn double(_context: Arc<()>, n: u32) -> Result<u32, LinkError> {
        Ok(n * 2)
    }

    fn link() -> InProcessLink<()> {
        let mut router = Router::new();
        router
            .query("double", double)
            .and_then(|router| router.subscription("count", count_to))
            .expect("register");
        InProcessLink::new(router, ())
    }

    #[tokio::test]
    async fn query_returns_typed_output() {
        let value: u32 = link().query("double", 21u32).await.expect("query");
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn wrong_output_type_is_reported() {
        let err = link()
            .query::<u32, String>("double", 1u32)
            .await
            .err()
            .expect("output mismatch");
        assert!(matches!(err, LinkError::OutputMismatch { .. }));
    }

    #[tokio::test]
    async fn mutate_on_query_is_kind_mismatch() {
        let err = link()
            .mutate::<u32, u32>("double", 1u32)
            .await
            .err()
            .expect("kind mismatch");
        assert!(matches!(err, LinkError::Router(RouterError::KindMismatch { .. })));
    }

    #[tokio::test]
    async fn subscribe_channel_delivers_items_then_completes() {
        let (mut stream, _unsubscribe) = link()
            .subscribe_channel::<u32, Tick>("count", 3u32)
            .await;

        let mut items = Vec::new();
        while let Some(notification) = stream.next().await {
            match notification {
                Notification::Next(item) => items.push(item),
                Notification::Complete => break,
                Notification::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(items, vec![Tick(1), Tick(2), Tick(3)]);
    }

    #[tokio::test]
    async fn subscribe_to_unknown_operation_reports_on_error() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let observer = FnObserver::new(|_item: u32| Ok(())).on_error(move |e: LinkError| {
            if let Ok(mut errors) = sink.lock() {
                errors.push(e.to_string());
            }
        });

        let unsubscribe = link()
            .subscribe::<u32, u32>("missing", 1u32, Box::new(observer))
            .await;

        assert!(!unsubscribe.is_active());
        let errors = errors.lock().expect("lock").clone();
        assert_eq!(errors, vec!["Unknown operation: missing".to_string()]);
    }

    #[tokio::test]
    async fn subscribing_to_a_query_is_kind_mismatch() {
        let (mut stream, _unsubscribe) = link()
            .subscribe_channel::<u32, Tick>("double", 1u32)
            .await;
        match stream.next().await {
            Some(Notification::Error(LinkError::Router(RouterError::KindMismatch {
                expected,
                registered,
                ..
            }))) => {
                assert_eq!(expected, OperationKind::Subscription);
                assert_eq!(registered, OperationKind::Query);
            }
            _ => panic!("expected a kind mismatch"),
        }
    }
}
