//! Typed routing of decoded records to handlers
//!
//! A [`Router`] maps a message type tag to exactly one handler. Handlers are
//! either synchronous (`Fn(&T, &ProcessorContext)`) or asynchronous
//! (`Fn(Arc<T>, ProcessorContext) -> Future`). Routers are grouped into
//! modules; the [`MasterRouter`] fans a record out to every module able to
//! route it and waits for all of them.

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, Instrument};

use crate::context::ProcessorContext;
use crate::error::{panic_message, BoxError, ProcessorError, ProcessorResult, RouterError};
use crate::message::{downcast_arc, DynMessage, Message, UnknownMessage};
use crate::record::Record;

/// Result returned by handlers
pub type HandlerResult = Result<(), BoxError>;

type Handler =
    Arc<dyn Fn(Arc<dyn DynMessage>, ProcessorContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Route table of one module
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<&'static str, Handler>,
    errors: Vec<RouterError>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous handler for `T`
    ///
    /// Fails with [`RouterError::DuplicateRoute`] when `T` is already routed.
    pub fn try_process<T, F>(&mut self, handler: F) -> Result<&mut Self, RouterError>
    where
        T: Message,
        F: Fn(&T, &ProcessorContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert::<T>(Arc::new(move |message: Arc<dyn DynMessage>, context: ProcessorContext| {
            let result = match message.as_any().downcast_ref::<T>() {
                Some(value) => context.span().in_scope(|| handler(value, &context)),
                None => Err(mismatch::<T>(message.as_ref())),
            };
            future::ready(result).boxed()
        }))
    }

    /// Register an asynchronous handler for `T`
    ///
    /// Fails with [`RouterError::DuplicateRoute`] when `T` is already routed.
    pub fn try_process_async<T, F, Fut>(&mut self, handler: F) -> Result<&mut Self, RouterError>
    where
        T: Message,
        F: Fn(Arc<T>, ProcessorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert::<T>(Arc::new(move |message: Arc<dyn DynMessage>, context: ProcessorContext| {
            let actual = message.message_type().to_string();
            match downcast_arc::<T>(message) {
                Some(value) => {
                    let span = context.span().clone();
                    handler(value, context).instrument(span).boxed()
                }
                None => future::ready(Err(format!(
                    "route for '{}' received a '{actual}'",
                    T::MESSAGE_TYPE
                )
                .into()))
                .boxed(),
            }
        }))
    }

    /// Builder form of [`Router::try_process`]; a duplicate is reported when the processor is built
    pub fn process<T, F>(mut self, handler: F) -> Self
    where
        T: Message,
        F: Fn(&T, &ProcessorContext) -> HandlerResult + Send + Sync + 'static,
    {
        if let Err(error) = self.try_process::<T, F>(handler) {
            self.errors.push(error);
        }
        self
    }

    /// Builder form of [`Router::try_process_async`]
    pub fn process_async<T, F, Fut>(mut self, handler: F) -> Self
    where
        T: Message,
        F: Fn(Arc<T>, ProcessorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if let Err(error) = self.try_process_async::<T, F, Fut>(handler) {
            self.errors.push(error);
        }
        self
    }

    /// First registration error recorded by the builder methods
    pub fn validate(&self) -> Result<(), RouterError> {
        match self.errors.first() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Whether a handler exists for the record's message type
    ///
    /// Values the codec could not decode are never routable, even when their
    /// type tag is registered.
    pub fn can_route(&self, record: &Record) -> bool {
        !record.value.as_any().is::<UnknownMessage>()
            && self.routes.contains_key(record.message_type())
    }

    /// Registered type tags
    pub fn message_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Invoke the handler registered for the context's record
    ///
    /// A panicking handler is reported as [`ProcessorError::Handler`].
    pub async fn route(&self, context: &ProcessorContext) -> ProcessorResult<()> {
        let record = context.record();
        let handler = self
            .routes
            .get(record.message_type())
            .filter(|_| self.can_route(record))
            .ok_or_else(|| RouterError::NoRoute {
                message_type: record.message_type().to_string(),
            })?;

        // sync handlers run during the call, async ones while polled
        let invoked = panic::catch_unwind(AssertUnwindSafe(|| {
            (handler.as_ref())(record.value.clone(), context.clone())
        }));
        let outcome = match invoked {
            Ok(handled) => AssertUnwindSafe(handled).catch_unwind().await,
            Err(panic) => Err(panic),
        };
        let result = outcome.unwrap_or_else(|panic| {
            Err(format!("handler panicked: {}", panic_message(panic.as_ref())).into())
        });

        result.map_err(|source| ProcessorError::Handler {
            record: record.id.clone(),
            source,
        })
    }

    fn insert<T: Message>(&mut self, handler: Handler) -> Result<&mut Self, RouterError> {
        if self.routes.contains_key(T::MESSAGE_TYPE) {
            return Err(RouterError::DuplicateRoute {
                message_type: T::MESSAGE_TYPE,
            });
        }
        debug!(message_type = T::MESSAGE_TYPE, "Route registered");
        self.routes.insert(T::MESSAGE_TYPE, handler);
        Ok(self)
    }
}

fn mismatch<T: Message>(message: &dyn DynMessage) -> BoxError {
    format!(
        "route for '{}' received a '{}'",
        T::MESSAGE_TYPE,
        message.message_type()
    )
    .into()
}

/// A named group of routes contributed to a processor
pub trait RouterModule: Send + Sync {
    /// Module name used in logs
    fn name(&self) -> &str;

    /// Register the module's routes
    fn configure(&self, router: Router) -> Router;
}

/// Composite router over all modules of a processor
#[derive(Clone, Default)]
pub struct MasterRouter {
    modules: Vec<(String, Router)>,
}

impl MasterRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module's router
    pub fn add(&mut self, name: impl Into<String>, router: Router) -> Result<(), RouterError> {
        router.validate()?;
        self.modules.push((name.into(), router));
        Ok(())
    }

    /// Whether any module routes the record
    pub fn can_route(&self, record: &Record) -> bool {
        self.modules.iter().any(|(_, router)| router.can_route(record))
    }

    /// Names of the modules
    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|(name, _)| name.as_str())
    }

    /// Run the handlers of every module that routes the record
    ///
    /// All matching handlers run to completion; the first error in module
    /// order is returned.
    pub async fn route(&self, context: &ProcessorContext) -> ProcessorResult<()> {
        let record = context.record();
        let matching: Vec<_> = self
            .modules
            .iter()
            .filter(|(_, router)| router.can_route(record))
            .collect();
        if matching.is_empty() {
            return Err(RouterError::NoRoute {
                message_type: record.message_type().to_string(),
            }
            .into());
        }

        let results = future::join_all(matching.iter().map(|(name, router)| async move {
            debug!(module = %name, record = %record.id, "Routing record");
            router.route(context).await
        }))
        .await;
        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{record_of, Note};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug)]
    struct Other;

    impl Message for Other {
        const MESSAGE_TYPE: &'static str = "test.Other";
    }

    fn context_for(record: Record) -> ProcessorContext {
        ProcessorContext::with_collaborators(
            record,
            CancellationToken::new(),
            Some("out".into()),
            None,
        )
    }

    #[test]
    fn test_duplicate_route_is_rejected() {
        let mut router = Router::new();
        router.try_process::<Note, _>(|_, _| Ok(())).unwrap();
        let error = router
            .try_process_async::<Note, _, _>(|_, _| async { Ok(()) })
            .err();
        assert_eq!(
            error,
            Some(RouterError::DuplicateRoute {
                message_type: "test.Note"
            })
        );
    }

    #[test]
    fn test_builder_defers_duplicate_error() {
        let router = Router::new()
            .process::<Note, _>(|_, _| Ok(()))
            .process::<Note, _>(|_, _| Ok(()));
        assert!(matches!(
            router.validate(),
            Err(RouterError::DuplicateRoute { .. })
        ));
        assert!(MasterRouter::new().add("notes", router).is_err());
    }

    #[tokio::test]
    async fn test_sync_and_async_handlers_receive_typed_values() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sync_seen = seen.clone();
        let async_seen = seen.clone();
        let router = Router::new()
            .process::<Note, _>(move |note, context| {
                sync_seen.lock().push(note.0);
                context.output_message(Note("echo"))?;
                Ok(())
            })
            .process_async::<Other, _, _>(move |_, _| {
                let seen = async_seen.clone();
                async move {
                    seen.lock().push("other");
                    Ok(())
                }
            });

        let note = context_for(record_of(Note("hello"), 0));
        assert!(router.can_route(note.record()));
        router.route(&note).await.unwrap();
        assert_eq!(note.pending_outputs(), 1);

        router.route(&context_for(record_of(Other, 1))).await.unwrap();
        assert_eq!(*seen.lock(), vec!["hello", "other"]);
    }

    #[tokio::test]
    async fn test_handler_error_is_wrapped_with_record() {
        let router = Router::new().process::<Note, _>(|_, _| Err("bad note".into()));
        let error = router
            .route(&context_for(record_of(Note("x"), 7)))
            .await
            .unwrap_err();
        match error {
            ProcessorError::Handler { record, source } => {
                assert_eq!(record.offset, 7);
                assert_eq!(source.to_string(), "bad note");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    async fn explode() -> HandlerResult {
        panic!("async boom")
    }

    #[tokio::test]
    async fn test_panicking_handlers_become_handler_errors() {
        let router = Router::new()
            .process::<Note, _>(|note, _| panic!("cannot take {}", note.0))
            .process_async::<Other, _, _>(|_, _| explode());

        for (context, expected) in [
            (context_for(record_of(Note("x"), 3)), "handler panicked: cannot take x"),
            (context_for(record_of(Other, 4)), "handler panicked: async boom"),
        ] {
            match router.route(&context).await {
                Err(ProcessorError::Handler { record, source }) => {
                    assert_eq!(record, context.record().id);
                    assert_eq!(source.to_string(), expected);
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_undecoded_value_with_routed_tag_is_not_routable() {
        let router = Router::new().process::<Note, _>(|_, _| Ok(()));
        let mut record = record_of(Note("x"), 0);
        record.value = Arc::new(crate::message::UnknownMessage {
            message_type: Some("test.Note".into()),
            payload: None,
        });
        let tombstone = context_for(record);

        assert!(!router.can_route(tombstone.record()));
        assert!(matches!(
            router.route(&tombstone).await,
            Err(ProcessorError::Router(RouterError::NoRoute { .. }))
        ));
    }

    #[tokio::test]
    async fn test_master_router_fans_out_to_all_modules() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut master = MasterRouter::new();
        for name in ["audit", "billing"] {
            let calls = calls.clone();
            master
                .add(
                    name,
                    Router::new().process::<Note, _>(move |_, _| {
                        calls.lock().push(name);
                        Ok(())
                    }),
                )
                .unwrap();
        }
        master
            .add("other", Router::new().process::<Other, _>(|_, _| Ok(())))
            .unwrap();

        master.route(&context_for(record_of(Note("x"), 0))).await.unwrap();
        assert_eq!(*calls.lock(), vec!["audit", "billing"]);

        let mut record = record_of(Other, 1);
        record.value = Arc::new(crate::message::UnknownMessage {
            message_type: Some("nope".into()),
            payload: None,
        });
        let unknown = context_for(record);
        assert!(!master.can_route(unknown.record()));
        assert!(matches!(
            master.route(&unknown).await,
            Err(ProcessorError::Router(RouterError::NoRoute { .. }))
        ));
    }
}
