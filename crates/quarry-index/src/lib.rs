//! Incremental, file-content-derived indexing engine.
//!
//! Quarry maintains a set of named inverted indices (key → set-of-file-association) and
//! forward indices (file → keys-contributed), kept consistent with the current content
//! of each file without full re-scans except on version change or irrecoverable
//! corruption.
//!
//! The host supplies content bytes plus a per-index key/value extraction function; the
//! engine produces and queries association data. What to index and when to scan are the
//! host's business.

mod access;
mod change_tracking;
mod container;
mod engine;
mod externalizer;
mod flush;
mod forward;
mod guard;
mod id_set;
mod map_reduce;
mod rebuild;
mod registry;
mod storage;

pub use access::{enter_index, AccessToken};
pub use change_tracking::{ChangeTrackingValueContainer, COMPACT_CHUNK_THRESHOLD};
pub use container::{ValueContainer, ValueContainerImpl};
pub use engine::{CorpusIndex, CorpusIndexBuilder};
pub use externalizer::{
    BincodeExternalizer, DataExternalizer, StringExternalizer, U32Externalizer,
    UnitExternalizer,
};
pub use flush::{FlushScheduler, FLUSH_IDLE_WINDOW};
pub use forward::{diff_input_data, ForwardIndex, InputData, InputDiff, MapForwardIndex,
    SharedContentForwardIndex};
pub use guard::{StorageGuard, StorageModeHolder, StripedLock, STRIPE_COUNT};
pub use id_set::{InputIdSet, BITMAP_PROMOTION_THRESHOLD, SMALL_DEMOTION_THRESHOLD};
pub use map_reduce::{InputContent, InputMeta, MapReduceIndex, UpdatableIndex};
pub use rebuild::{RebuildStatus, REBUILD_POLL_INTERVAL};
pub use registry::{IndexExtension, IndexRegistry};
pub use storage::{
    BufferingStateListener, Flushable, IndexStorageRead, IndexStorageWrite,
    MemoryIndexStorage, PersistentIndexStorage,
};

pub use quarry_core::{logging, CancellationToken, Cancelled, IndexId, InputId};
pub use quarry_storage::StorageError;

pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors produced by the index engine.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("failed to decode persisted index data: {reason}")]
    Decode { reason: String },

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("mapper failed: {message}")]
    Mapper { message: String },

    #[error("reentrant index access: entered {requested} while {active} is active")]
    ReentrantAccess { active: IndexId, requested: IndexId },

    #[error("index registry is frozen; indices must be registered before startup")]
    RegistryFrozen,

    #[error("duplicate index name {name:?}")]
    DuplicateIndex { name: String },

    #[error("unknown index {0}")]
    UnknownIndex(IndexId),
}

impl IndexError {
    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }
}
