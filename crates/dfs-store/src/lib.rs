//! dfs-store: local content-addressable storage.

pub mod cas;
mod error;

pub use cas::{cas_path_transform, CasStore, ContentPath, PathTransform, ShardLayout, HASH_HEX_LEN};
pub use error::{StoreError, StoreResult};
