//! CLI command implementations.

pub mod dump_oplog;
pub mod inspect;
pub mod verify;

use sessiontxn_core::{Config, CoreResult, StorageEngine};
use std::path::Path;
use std::sync::Arc;

/// Opens an existing data directory without creating anything.
pub fn open_existing(path: &Path) -> CoreResult<Arc<StorageEngine>> {
    StorageEngine::open_with_config(
        path,
        Config::new().create_if_missing(false).sync_on_commit(false),
    )
}
