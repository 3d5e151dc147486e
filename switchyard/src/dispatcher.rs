use crate::completion::CompletionHandler;
use crate::component::registry::build_table;
use crate::component::{Catalog, ComponentError, ComponentTable};
use crate::config::DispatcherConfig;
use crate::context::RequestContext;
use crate::host::{AsyncExchange, Container, HostRequest, HostResponse};
use crate::invoker::ControllerInvoker;
use crate::mapper::argument::{ArgumentMapperTable, DynArgumentMapper};
use crate::mapper::response::{DynReturnTypeMapper, ReturnTypeMapperTable};
use crate::router::RouteTable;
use crate::status::{DispatchError, panic_message};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum BootError {
    #[error("Component table could not be built")]
    Components {
        #[from]
        source: ComponentError,
    },

    #[error("Worker pool could not be started: {message}")]
    WorkerPool { message: String },

    #[error("Mapper '{mapper}' is declared but the component table does not hold it")]
    Mapper { mapper: &'static str },
}

impl BootError {
    #[inline]
    pub(crate) fn worker_pool(message: impl Into<String>) -> Self {
        Self::WorkerPool {
            message: message.into(),
        }
    }

    #[inline]
    pub(crate) const fn mapper(mapper: &'static str) -> Self {
        Self::Mapper { mapper }
    }
}

/// Threads handlers run on: an owned multi-threaded runtime, or a handle to
/// one the embedder already runs.
pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl WorkerPool {
    pub fn new(size: usize, name: &str) -> Result<Self, BootError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(size.max(1))
            .thread_name(name)
            .enable_all()
            .build()
            .map_err(|e| BootError::worker_pool(e.to_string()))?;
        let handle = runtime.handle().clone();
        log::debug!("Worker pool '{}' started with {} threads", name, size.max(1));
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self {
            runtime: None,
            handle,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(task)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Boots every table from a [`Catalog`] and services exchanges.
///
/// ```rust,ignore
/// let dispatcher = Dispatcher::boot(&Catalog::discover(), DispatcherConfig::default())?;
/// let exchange = dispatcher.handle(&container, request, response);
/// ```
pub struct Dispatcher {
    config: DispatcherConfig,
    components: Arc<ComponentTable>,
    arguments: Arc<ArgumentMapperTable>,
    renderers: Arc<ReturnTypeMapperTable>,
    invoker: Arc<ControllerInvoker>,
    pool: WorkerPool,
}

impl Dispatcher {
    /// Boots with a worker pool of its own, sized and named by `config`.
    pub fn boot(catalog: &Catalog, config: DispatcherConfig) -> Result<Self, BootError> {
        let pool = WorkerPool::new(config.worker_pool_size, &config.worker_pool_name)?;
        Self::assemble(catalog, config, pool)
    }

    /// Boots onto an existing runtime.
    pub fn boot_on(catalog: &Catalog, config: DispatcherConfig, handle: Handle) -> Result<Self, BootError> {
        Self::assemble(catalog, config, WorkerPool::from_handle(handle))
    }

    fn assemble(catalog: &Catalog, config: DispatcherConfig, pool: WorkerPool) -> Result<Self, BootError> {
        let namespace = config.boot_namespace.as_str();
        let components = build_table(&catalog.components_in(namespace), Vec::new(), config.lifecycle_policy)?;
        components.initialize_all()?;

        let mut user_arguments: Vec<Arc<dyn DynArgumentMapper>> = Vec::new();
        for declaration in catalog.argument_mappers_in(namespace) {
            let mapper = declaration
                .create(&components)
                .ok_or_else(|| BootError::mapper(declaration.type_name()))?;
            user_arguments.push(mapper);
        }
        let mut user_renderers: Vec<Arc<dyn DynReturnTypeMapper>> = Vec::new();
        for declaration in catalog.return_mappers_in(namespace) {
            let mapper = declaration
                .create(&components)
                .ok_or_else(|| BootError::mapper(declaration.type_name()))?;
            user_renderers.push(mapper);
        }

        let arguments = Arc::new(ArgumentMapperTable::new(user_arguments));
        let renderers = Arc::new(ReturnTypeMapperTable::new(user_renderers, &config.default_encoding));
        let routes = Arc::new(RouteTable::build(&catalog.controllers_in(namespace), &components));
        let invoker = Arc::new(ControllerInvoker::new(routes.clone(), arguments.clone()));

        log::info!(
            "Dispatcher booted: {} components, {} routes ({} skipped), namespace '{}'",
            components.component_count(),
            routes.len(),
            routes.skipped(),
            namespace
        );
        Ok(Self {
            config,
            components: Arc::new(components),
            arguments,
            renderers,
            invoker,
            pool,
        })
    }

    /// Starts processing an exchange and returns at once. The exchange is
    /// completed later from the worker pool, or by the container timeout.
    pub fn service(&self, exchange: Arc<dyn AsyncExchange>) {
        let _runtime = self.pool.handle().enter();
        let ctx = RequestContext::new(exchange.clone(), self.config.max_body_size);
        log::debug!("{}: dispatching", ctx);

        let completion = CompletionHandler::new(
            ctx.clone(),
            self.renderers.clone(),
            self.pool.handle().clone(),
            self.config.async_timeout_ms,
        );
        exchange.add_listener(Arc::new(completion.clone()));
        exchange.set_timeout(self.config.async_timeout_ms);

        let invoker = self.invoker.clone();
        self.pool.spawn(async move {
            match AssertUnwindSafe(invoker.invoke(ctx)).catch_unwind().await {
                Ok(Ok(reply)) => completion.on_success(reply),
                Ok(Err(failure)) => completion.on_failure(failure),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    completion.on_failure(DispatchError::panic(message).into());
                }
            }
        });
    }

    /// Asks `container` for an async exchange and services it.
    pub fn handle(
        &self,
        container: &dyn Container,
        request: Arc<dyn HostRequest>,
        response: Arc<dyn HostResponse>,
    ) -> Arc<dyn AsyncExchange> {
        let exchange = container.start_async(request, response);
        self.service(exchange.clone());
        exchange
    }

    /// Runs every component's destroy hook.
    pub fn shutdown(&self) -> Result<(), ComponentError> {
        log::info!("Dispatcher shutting down");
        self.components.destroy_all()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn components(&self) -> &Arc<ComponentTable> {
        &self.components
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        self.invoker.routes()
    }

    pub fn argument_mappers(&self) -> &Arc<ArgumentMapperTable> {
        &self.arguments
    }

    pub fn return_mappers(&self) -> &Arc<ReturnTypeMapperTable> {
        &self.renderers
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.pool
    }
}
