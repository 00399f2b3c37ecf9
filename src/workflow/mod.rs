pub mod types;
pub mod graph;
pub mod builder;

pub use types::*;
pub use graph::TaskGraph;
pub use builder::TaskGraphBuilder;
