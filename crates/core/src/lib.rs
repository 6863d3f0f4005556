pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::{
    AppConfig, BrokerConfig, BrokerMode, OrchestratorConfig, RuntimeConfig, StorageConfig,
    WorkerConfig,
};
pub use errors::{ComputeError, FailureKind, Result};
pub use models::{LearnUplet, Perfuplet, PredUplet, TaskStatus, UpletKind};
pub use traits::{BlobStream, Broker, ContainerRuntime, Orchestrator, Storage, TaskHandler};
