extern crate self as switchyard;

pub mod cache;
pub mod completion;
pub mod component;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod host;
pub mod invoker;
pub mod logger;
pub mod mapper;
pub mod router;
pub mod status;

pub use completion::{CompletionHandler, CompletionState};
pub use component::{Catalog, Component, ComponentDefinition, ComponentTable, Dependencies, Injectable};
pub use config::DispatcherConfig;
pub use context::RequestContext;
pub use dispatcher::{BootError, Dispatcher, WorkerPool};
pub use invoker::ControllerInvoker;
pub use mapper::{Annotation, Arguments, Entity, EntityError, Reply, Returned};
pub use router::{Controller, Filter, RouteTable, Routes};
pub use status::{DispatchError, Failure};
pub use switchyard_macro::Component;

#[doc(hidden)]
pub use inventory;
