pub mod cascade;
pub mod l1;
pub mod l2;

pub use cascade::{CascadeCache, CascadeStats};
pub use l1::{ChunkCache, L1Stats};
pub use l2::{MemoryCache, SharedCache, L2Stats};
