//! Streaming bulk import of exported workspaces.
//!
//! An export is a newline-delimited JSON manifest, optionally paired with a
//! ZIP archive of attachment content. The pipeline streams the manifest one
//! record at a time, groups consecutive same-type records into segments, and
//! applies each segment through a pool of concurrent workers before moving to
//! the next, so teams exist before their channels, channels before their
//! posts, and so on. Post and direct-post records are buffered and persisted
//! in bulk batches with content-addressed attachment dedup, which makes
//! re-running the same import idempotent.
//!
//! The data store and blob backend are consumed through the [`store::Store`]
//! and [`store::FileStore`] traits; [`memory`] provides the in-memory
//! reference implementation used by the tests.
//!
//! ```no_run
//! use std::io::BufReader;
//! use std::sync::Arc;
//! use workspace_import::{ImportConfig, Importer};
//! use workspace_import::memory::{MemoryFileStore, MemoryStore};
//!
//! # async fn run() -> Result<(), workspace_import::LineError> {
//! let importer = Importer::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryFileStore::new()),
//!     ImportConfig::default(),
//! );
//! let file = std::fs::File::open("export.jsonl").map_err(|e| {
//!     workspace_import::LineError::unattributed(e.into())
//! })?;
//! importer.import(&mut BufReader::new(file), None).await?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
mod attachments;
mod bulk_import;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod model;
pub mod reader;
pub mod store;
mod worker;

pub use archive::{ArchiveError, AttachmentSource, ImportArchive};
pub use dispatcher::{ImportConfig, Importer, DEFAULT_MAX_PROFILE_IMAGE_BYTES};
pub use error::{ImportError, LineError};
pub use model::{ImportLine, RecordKind};
pub use reader::{DEFAULT_MAX_LINE_BYTES, IMPORT_VERSION};
