pub mod docker;
pub mod http_clients;
pub mod in_memory;
pub mod rabbitmq;

pub use docker::DockerRuntime;
pub use http_clients::{OrchestratorApi, StorageApi};
pub use in_memory::InMemoryBroker;
pub use rabbitmq::RabbitMqBroker;
