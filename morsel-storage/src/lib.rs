//! morsel Storage - Rate Window and Tile Stores
//!
//! Two store contracts and two implementations:
//!
//! - [`MemoryStore`]: `DashMap`-backed, single process
//! - [`LmdbStore`]: LMDB-backed, shared by every process on the host
//!
//! Records are expired lazily by their readers. The `purge_*` methods only
//! reclaim space.

pub mod codec;
pub mod lmdb;
pub mod memory;
pub mod traits;

pub use lmdb::{LmdbStore, LmdbStoreError};
pub use memory::MemoryStore;
pub use traits::{RateWindowStore, TileStore, WindowWrite};
