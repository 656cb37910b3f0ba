//! Storage ports.
//!
//! The infrastructure layer (talentflow-infra) implements `InstanceStore`
//! with SQLite; `MemoryInstanceStore` backs tests and embedded use. The core
//! crate never depends on a specific storage technology.

pub mod instance;
pub mod memory;

pub use instance::InstanceStore;
pub use memory::MemoryInstanceStore;
