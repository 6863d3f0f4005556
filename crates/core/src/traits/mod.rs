pub mod broker;
pub mod clients;
pub mod runtime;

pub use broker::{Broker, TaskHandler};
pub use clients::{BlobStream, Orchestrator, Storage};
pub use runtime::ContainerRuntime;
