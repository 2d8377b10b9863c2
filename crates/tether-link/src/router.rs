//! Named registry of operations.
//!
//! Inputs and outputs cross the router as type-erased [`Payload`]s so one
//! router can hold handlers of any signature. The typed registration
//! helpers do the boxing and downcasting; a caller passing the wrong type
//! gets [`LinkError::InputMismatch`] instead of a panic.

use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tether_core::domain::observable::panic_message;
use tether_core::domain::{Observable, StreamError};

use crate::error::{LinkError, RouterError};

pub type Payload = Box<dyn Any + Send>;

pub type HandlerFuture = BoxFuture<'static, Result<Payload, LinkError>>;

type ErasedHandler<C> = Arc<dyn Fn(Arc<C>, Payload) -> HandlerFuture + Send + Sync>;

/// What a subscription handler resolves to.
pub type SharedObservable<T> = Arc<dyn Observable<T, StreamError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationDescriptor {
    pub name: String,
    pub kind: OperationKind,
    pub input: &'static str,
    pub output: &'static str,
}

struct Operation<C> {
    descriptor: OperationDescriptor,
    handler: ErasedHandler<C>,
}

/// Operations keyed by name. Built once, then shared behind an `Arc`.
pub struct Router<C> {
    operations: BTreeMap<String, Operation<C>>,
}

impl<C> Default for Router<C> {
    fn default() -> Self {
        Self {
            operations: BTreeMap::new(),
        }
    }
}

impl<C> Router<C>
where
    C: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an already type-erased handler.
    pub fn register<F>(
        &mut self,
        name: &str,
        kind: OperationKind,
        handler: F,
    ) -> Result<(), RouterError>
    where
        F: Fn(Arc<C>, Payload) -> HandlerFuture + Send + Sync + 'static,
    {
        self.insert(
            OperationDescriptor {
                name: name.to_string(),
                kind,
                input: "dyn Any",
                output: "dyn Any",
            },
            Arc::new(handler),
        )
    }

    pub fn query<I, O, E, F, Fut>(
        &mut self,
        name: &str,
        handler: F,
    ) -> Result<&mut Self, RouterError>
    where
        I: Send + 'static,
        O: Send + 'static,
        E: Into<LinkError>,
        F: Fn(Arc<C>, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        self.typed::<I, O, E, F, Fut>(name, OperationKind::Query, handler)
    }

    pub fn mutation<I, O, E, F, Fut>(
        &mut self,
        name: &str,
        handler: F,
    ) -> Result<&mut Self, RouterError>
    where
        I: Send + 'static,
        O: Send + 'static,
        E: Into<LinkError>,
        F: Fn(Arc<C>, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        self.typed::<I, O, E, F, Fut>(name, OperationKind::Mutation, handler)
    }

    /// Registers a handler producing an observable of `T`.
    pub fn subscription<I, T, E, F, Fut>(
        &mut self,
        name: &str,
        handler: F,
    ) -> Result<&mut Self, RouterError>
    where
        I: Send + 'static,
        T: Send + 'static,
        E: Into<LinkError>,
        F: Fn(Arc<C>, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SharedObservable<T>, E>> + Send + 'static,
    {
        self.typed::<I, SharedObservable<T>, E, F, Fut>(
            name,
            OperationKind::Subscription,
            handler,
        )
    }

    fn typed<I, O, E, F, Fut>(
        &mut self,
        name: &str,
        kind: OperationKind,
        handler: F,
    ) -> Result<&mut Self, RouterError>
    where
        I: Send + 'static,
        O: Send + 'static,
        E: Into<LinkError>,
        F: Fn(Arc<C>, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        let operation: Arc<str> = Arc::from(name);
        let handler = Arc::new(handler);
        let erased: ErasedHandler<C> = Arc::new(move |context: Arc<C>, input: Payload| {
            let operation = operation.clone();
            let handler = handler.clone();
            async move {
                let input = input
                    .downcast::<I>()
                    .map_err(|_| LinkError::InputMismatch {
                        operation: operation.to_string(),
                        expected: type_name::<I>(),
                    })?;
                let output = handler(context, *input).await.map_err(Into::into)?;
                Ok::<Payload, LinkError>(Box::new(output))
            }
            .boxed()
        });

        self.insert(
            OperationDescriptor {
                name: name.to_string(),
                kind,
                input: type_name::<I>(),
                output: type_name::<O>(),
            },
            erased,
        )?;
        Ok(self)
    }

    fn insert(
        &mut self,
        descriptor: OperationDescriptor,
        handler: ErasedHandler<C>,
    ) -> Result<(), RouterError> {
        if self.operations.contains_key(&descriptor.name) {
            return Err(RouterError::DuplicateOperation {
                name: descriptor.name,
            });
        }
        self.operations.insert(
            descriptor.name.clone(),
            Operation {
                descriptor,
                handler,
            },
        );
        Ok(())
    }

    /// Looks up `name`, checking it was registered as `expected`.
    pub fn resolve(
        &self,
        name: &str,
        expected: OperationKind,
    ) -> Result<&OperationDescriptor, RouterError> {
        self.operation(name, expected).map(|op| &op.descriptor)
    }

    fn operation(
        &self,
        name: &str,
        expected: OperationKind,
    ) -> Result<&Operation<C>, RouterError> {
        let operation = self
            .operations
            .get(name)
            .ok_or_else(|| RouterError::UnknownOperation {
                name: name.to_string(),
            })?;
        if operation.descriptor.kind != expected {
            return Err(RouterError::KindMismatch {
                name: name.to_string(),
                expected,
                registered: operation.descriptor.kind,
            });
        }
        Ok(operation)
    }

    /// Runs the handler for `name`. Panics inside the handler, whether
    /// raised while building its future or while polling it, come back as
    /// [`LinkError::HandlerPanicked`].
    pub async fn invoke(
        &self,
        context: Arc<C>,
        name: &str,
        expected: OperationKind,
        input: Payload,
    ) -> Result<Payload, LinkError> {
        let handler = self.operation(name, expected)?.handler.clone();
        let panicked = |payload: Box<dyn Any + Send>| LinkError::HandlerPanicked {
            operation: name.to_string(),
            message: panic_message(payload.as_ref()),
        };

        let future =
            catch_unwind(AssertUnwindSafe(|| handler(context, input))).map_err(panicked)?;
        AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panicked(payload)))
    }

    pub fn operations(&self) -> Vec<OperationDescriptor> {
        self.operations
            .values()
            .map(|op| op.descriptor.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::domain::runtime::SessionError;

    struct Counter {
        base: u32,
    }

    async fn add(context: Arc<Counter>, input: u32) -> Result<u32, LinkError> {
        Ok(context.base + input)
    }

    fn router() -> Router<Counter> {
        let mut router = Router::new();
        router.query("add", add).expect("register add");
        router
    }

    #[tokio::test]
    async fn invokes_typed_query() {
        let router = router();
        let output = router
            .invoke(
                Arc::new(Counter { base: 40 }),
                "add",
                OperationKind::Query,
                Box::new(2u32),
            )
            .await
            .expect("query succeeds");
        assert_eq!(*output.downcast::<u32>().expect("u32 output"), 42);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut router = router();
        let err = router.mutation("add", add).err().expect("duplicate");
        assert_eq!(
            err,
            RouterError::DuplicateOperation {
                name: "add".to_string()
            }
        );
        assert_eq!(router.operations().len(), 1);
    }

    #[test]
    fn resolve_checks_kind() {
        let router = router();
        assert!(router.resolve("add", OperationKind::Query).is_ok());
        assert_eq!(
            router.resolve("add", OperationKind::Mutation),
            Err(RouterError::KindMismatch {
                name: "add".to_string(),
                expected: OperationKind::Mutation,
                registered: OperationKind::Query,
            })
        );
        assert_eq!(
            router.resolve("missing", OperationKind::Query),
            Err(RouterError::UnknownOperation {
                name: "missing".to_string()
            })
        );
    }

    #[tokio::test]
    async fn wrong_input_type_is_reported() {
        let router = router();
        let err = router
            .invoke(
                Arc::new(Counter { base: 0 }),
                "add",
                OperationKind::Query,
                Box::new("two"),
            )
            .await
            .err()
            .expect("input mismatch");
        assert!(matches!(err, LinkError::InputMismatch { ref operation, .. } if operation == "add"));
    }

    #[tokio::test]
    async fn handler_errors_pass_through() {
        let mut router: Router<Counter> = Router::new();
        router
            .mutation("busy", |_context: Arc<Counter>, _input: ()| async {
                Err::<(), _>(SessionError::InvalidInput {
                    message: "nope".to_string(),
                })
            })
            .expect("register");

        let err = router
            .invoke(
                Arc::new(Counter { base: 0 }),
                "busy",
                OperationKind::Mutation,
                Box::new(()),
            )
            .await
            .err()
            .expect("handler error");
        assert!(matches!(
            err.as_session_error(),
            Some(SessionError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_error() {
        let mut router: Router<Counter> = Router::new();
        router
            .query("explode", |_context: Arc<Counter>, _input: ()| async {
                if true {
                    panic!("boom");
                }
                Ok::<(), LinkError>(())
            })
            .expect("register");

        let err = router
            .invoke(
                Arc::new(Counter { base: 0 }),
                "explode",
                OperationKind::Query,
                Box::new(()),
            )
            .await
            .err()
            .expect("panic is caught");
        match err {
            LinkError::HandlerPanicked { operation, message } => {
                assert_eq!(operation, "explode");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn descriptors_are_listed_by_name() {
        let mut router = router();
        router
            .register("raw", OperationKind::Mutation, |_context, input| {
                async move { Ok(input) }.boxed()
            })
            .expect("register raw");

        let names: Vec<_> = router
            .operations()
            .into_iter()
            .map(|descriptor| (descriptor.name, descriptor.kind))
            .collect();
        assert_eq!(
            names,
            vec![
                ("add".to_string(), OperationKind::Query),
                ("raw".to_string(), OperationKind::Mutation),
            ]
        );

        let json = serde_json::to_value(&router.operations()[0]).expect("serialize");
        assert_eq!(json["kind"], "query");
    }
}
