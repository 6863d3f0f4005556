pub mod perf;
pub mod uplet;

pub use perf::Perfuplet;
pub use uplet::{LearnUplet, PredUplet, TaskStatus, UpletKind};
