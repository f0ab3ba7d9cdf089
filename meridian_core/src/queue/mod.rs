//! Queue abstraction backing every ingestion path in the pipeline.
//!
//! Three implementations with one contract: an in-memory FIFO for per-route
//! webhook ordering, a per-group-exclusive queue for work that must serialize
//! within a key, and a crash-safe disk queue for routes that need durability.

pub mod disk;
pub mod group;
pub mod memory;
pub mod traits;

pub use disk::DiskQueue;
pub use group::{GroupClaim, GroupQueue};
pub use memory::MemoryQueue;
pub use traits::Queue;
