//! Worker registry and task dispatch.

pub mod dispatcher;
pub mod registry;

pub use dispatcher::{
    generate_webhook_secret, DispatchError, DispatchOutcome, DispatchRequest, Dispatcher,
    HttpWorkerTransport, WorkerTransport,
};
pub use registry::{WorkerEndpoint, WorkerRegistry};
