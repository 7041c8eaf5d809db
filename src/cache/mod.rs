//! Cache accessor API.
//!
//! The single entry point the application uses for cached data:
//! - read-through for per-owner records, the medicine snapshot and profiles
//! - optimistic write-through that queues mutations for the sync engine
//! - basic offline mode (serve the local copy when the network is unavailable)

mod layer;
mod traits;

pub use layer::OfflineCache;
pub use traits::{CacheResult, CacheSource};
