//! Reverie Storage - Cache Tiers
//!
//! In-process LRU, on-device blob store with an LMDB index, and a pluggable
//! remote object store. Also home to the LMDB-backed quota state store, since
//! it shares the local tier's environment.

pub mod cache;
pub mod state;

pub use cache::{
    HttpRemoteStore, InMemoryRemoteStore, LocalIndex, LocalIndexError, LocalTier, MemoryTier,
    ReconcileReport, RemoteEntry, RemoteStore, RemoteTier, RemoteWriteOutcome, SweepReport,
    TierStats,
};
pub use state::LmdbQuotaStore;
