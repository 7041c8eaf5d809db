//! Offline-first local cache and sync queue for the telemedicine client.
//!
//! Writes land in the local store immediately and are queued for replay;
//! the sync engine drains the queue whenever the connectivity monitor sees
//! the network come back.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod queue;
pub mod remote;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use cache::{CacheResult, CacheSource, OfflineCache};
pub use connectivity::{Connectivity, ConnectivityMonitor, HttpProbe, ReachabilityProbe};
pub use error::{RemoteError, StoreError};
pub use queue::SyncQueue;
pub use remote::{HttpRemote, RemoteApi};
pub use store::{LocalStore, RecordTable};
pub use sync::{DrainOutcome, DrainReport, SyncConfig, SyncEngine, SyncMetrics};
