//! Persistence layer: libSQL message log and planner checkpoints.

mod libsql_backend;
mod memory;
pub mod migrations;
mod traits;

pub use libsql_backend::LibSqlStore;
pub use memory::MemoryCheckpointStore;
pub use traits::CheckpointStore;
