//! # sessiontxn storage
//!
//! Byte-store backends underneath the oplog and the session transaction
//! table.
//!
//! Backends are **opaque append-only logs**. They know nothing about
//! oplog entries, session records or record framing; `sessiontxn_core`
//! owns every format decision.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - tests and ephemeral engines
//! - [`FileBackend`] - one OS file per log
//!
//! ## Example
//!
//! ```rust
//! use sessiontxn_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"oplog bytes").unwrap();
//! assert_eq!(backend.read_at(offset, 11).unwrap(), b"oplog bytes");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
