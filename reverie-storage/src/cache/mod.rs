//! The three cache tiers.
//!
//! Each tier is an independent, explicitly constructed component with its own
//! lock. None of them knows about the others; composition happens in the
//! orchestrator.
//!
//! | Tier                 | Bound         | Survives restart | Failure handling          |
//! |----------------------|---------------|------------------|---------------------------|
//! | [`MemoryTier`]       | byte budget   | no               | lock poisoning only       |
//! | [`LocalTier`]        | byte budget   | yes              | corrupt entries purged    |
//! | [`RemoteTier`]       | none          | yes              | every failure is a miss   |

pub mod http_remote;
pub mod local;
pub mod local_index;
pub mod memory;
pub mod remote;
pub mod traits;

pub use http_remote::HttpRemoteStore;
pub use local::{LocalTier, ReconcileReport, SweepReport};
pub use local_index::{LocalIndex, LocalIndexError};
pub use memory::MemoryTier;
pub use remote::{InMemoryRemoteStore, RemoteEntry, RemoteStore, RemoteTier, RemoteWriteOutcome};
pub use traits::TierStats;
