//! Pointer-store implementations.
//!
//! Two [`tickflow_engine::ports::PointerStore`] backends: a shared
//! in-memory map for tests and single-process use, and a local directory
//! tree for durable blobs.

pub mod filesystem;
pub mod memory;

pub use filesystem::FsPointerStore;
pub use memory::MemoryPointerStore;
