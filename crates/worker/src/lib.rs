pub mod handlers;
pub mod worker;
pub mod workspace;

pub use handlers::{LearnHandler, PredHandler};
pub use worker::Worker;
pub use workspace::TaskWorkspace;
