//! Fluent construction of a [`Processor`]

use std::future::Future;
use std::sync::Arc;

use super::config::{OffsetReset, OutputTopic, ProcessorOptions};
use super::engine::{Processor, ProcessorParts};
use crate::broker::ClientFactory;
use crate::codec::{Deserializer, Serializer};
use crate::context::ProcessorContext;
use crate::error::{ProcessorError, ProcessorResult, RouterError};
use crate::gap::GapTracker;
use crate::interceptor::{Interceptor, InterceptorBus, LoggingInterceptor};
use crate::message::Message;
use crate::retry::RetryPolicy;
use crate::router::{HandlerResult, MasterRouter, Router, RouterModule};
use crate::state::StateStore;

/// Module name of routes registered directly on the builder
const DEFAULT_MODULE: &str = "processor";

/// Builder for [`Processor`]
pub struct ProcessorBuilder {
    options: ProcessorOptions,
    modules: Vec<(String, Router)>,
    interceptors: Vec<(Arc<dyn Interceptor>, bool)>,
    logging: bool,
    serializer: Option<Arc<dyn Serializer>>,
    deserializer: Option<Arc<dyn Deserializer>>,
    state: Option<Arc<dyn StateStore>>,
    clients: Option<Arc<dyn ClientFactory>>,
}

impl Default for ProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorBuilder {
    pub fn new() -> Self {
        Self {
            options: ProcessorOptions::default(),
            modules: Vec::new(),
            interceptors: Vec::new(),
            logging: true,
            serializer: None,
            deserializer: None,
            state: None,
            clients: None,
        }
    }

    /// Start from complete options, e.g. loaded from YAML
    pub fn options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.options.client_id = client_id.into();
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.options.group_id = Some(group_id.into());
        self
    }

    pub fn bootstrap_servers(mut self, servers: impl Into<String>) -> Self {
        self.options.connection.bootstrap_servers = servers.into();
        self
    }

    /// Add an input topic
    pub fn input_topic(mut self, topic: impl Into<String>) -> Self {
        self.options.input_topics.push(topic.into());
        self
    }

    pub fn output_topic(mut self, topic: OutputTopic) -> Self {
        self.options.output_topic = Some(topic);
        self
    }

    pub fn poll_timeout_ms(mut self, timeout: u64) -> Self {
        self.options.poll_timeout_ms = timeout;
        self
    }

    /// Periodic commit interval; 0 commits only on rebalance and termination
    pub fn commit_interval_ms(mut self, interval: u64) -> Self {
        self.options.commit_interval_ms = interval;
        self
    }

    pub fn flush_timeout_ms(mut self, timeout: u64) -> Self {
        self.options.flush_timeout_ms = timeout;
        self
    }

    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.options.max_in_flight = max;
        self
    }

    pub fn auto_offset_reset(mut self, reset: OffsetReset) -> Self {
        self.options.auto_offset_reset = reset;
        self
    }

    pub fn commit_retry(mut self, policy: RetryPolicy) -> Self {
        self.options.commit_retry = policy;
        self
    }

    /// Pass a client property through; checked against the allow-list on build
    pub fn client_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.client_properties.insert(key.into(), value.into());
        self
    }

    /// Use one codec for both directions
    pub fn codec<C>(mut self, codec: C) -> Self
    where
        C: Serializer + Deserializer + 'static,
    {
        let codec = Arc::new(codec);
        self.serializer = Some(codec.clone());
        self.deserializer = Some(codec);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn deserializer(mut self, deserializer: Arc<dyn Deserializer>) -> Self {
        self.deserializer = Some(deserializer);
        self
    }

    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state = Some(store);
        self
    }

    /// Broker client factory, e.g. a [`crate::broker::MemoryBroker`]
    pub fn clients(mut self, clients: Arc<dyn ClientFactory>) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Add a named route table
    pub fn router(mut self, name: impl Into<String>, router: Router) -> Self {
        self.modules.push((name.into(), router));
        self
    }

    /// Add a module contributing its own routes
    pub fn module<M: RouterModule>(self, module: M) -> Self {
        let name = module.name().to_string();
        let router = module.configure(Router::new());
        self.router(name, router)
    }

    /// Route `T` to a synchronous handler of the default module
    pub fn process<T, F>(mut self, handler: F) -> Self
    where
        T: Message,
        F: Fn(&T, &ProcessorContext) -> HandlerResult + Send + Sync + 'static,
    {
        let router = self.default_router();
        *router = std::mem::take(router).process(handler);
        self
    }

    /// Route `T` to an asynchronous handler of the default module
    pub fn process_async<T, F, Fut>(mut self, handler: F) -> Self
    where
        T: Message,
        F: Fn(Arc<T>, ProcessorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let router = self.default_router();
        *router = std::mem::take(router).process_async(handler);
        self
    }

    /// Register an interceptor; `prepend` places it ahead of those already registered
    pub fn intercept(mut self, interceptor: Arc<dyn Interceptor>, prepend: bool) -> Self {
        self.interceptors.push((interceptor, prepend));
        self
    }

    /// Toggle the built-in logging interceptor (on by default)
    pub fn logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    /// Report this processor's gaps through `tracker`
    pub fn gap_tracker(self, tracker: &GapTracker) -> Self {
        self.intercept(Arc::new(tracker.interceptor()), false)
    }

    fn default_router(&mut self) -> &mut Router {
        let index = match self.modules.iter().position(|(name, _)| name == DEFAULT_MODULE) {
            Some(index) => index,
            None => {
                self.modules.push((DEFAULT_MODULE.to_string(), Router::new()));
                self.modules.len() - 1
            }
        };
        &mut self.modules[index].1
    }

    /// Validate and assemble the processor
    pub fn build(self) -> ProcessorResult<Processor> {
        self.options.validate()?;

        let mut router = MasterRouter::new();
        for (name, routes) in self.modules {
            router.add(name, routes)?;
        }
        if router.module_names().next().is_none() {
            return Err(RouterError::Empty.into());
        }

        let serializer = self
            .serializer
            .ok_or_else(|| ProcessorError::Config("a serializer is required".into()))?;
        let deserializer = self
            .deserializer
            .ok_or_else(|| ProcessorError::Config("a deserializer is required".into()))?;
        let clients = self
            .clients
            .ok_or_else(|| ProcessorError::Config("a broker client factory is required".into()))?;

        let mut bus = InterceptorBus::new();
        if self.logging {
            bus.register(Arc::new(LoggingInterceptor), false);
        }
        for (interceptor, prepend) in self.interceptors {
            bus.register(interceptor, prepend);
        }

        Ok(Processor::from_parts(ProcessorParts {
            options: self.options,
            router,
            bus,
            serializer,
            deserializer,
            state: self.state,
            clients,
        }))
    }
}
