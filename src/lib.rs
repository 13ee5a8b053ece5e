//! A bounded, persistent, least-recently-used cache of value tuples,
//! kept crash-safe by an append-only journal.
//!
//! Each key stores a fixed number of opaque byte values as plain files
//! in one cache directory.  Edits stage into `.tmp` files and publish
//! atomically by rename; reads hand back open file handles that stay
//! valid however the cache changes afterwards.  A textual journal
//! records every edit, publication, read, and removal, so reopening
//! the directory restores the entries, their sizes, and the LRU order,
//! and sweeps up whatever a crash left half-done.  When the published
//! bytes exceed the configured budget, least recently used entries are
//! evicted on a background thread.
//!
//! ```no_run
//! use std::io::Write;
//!
//! use ledger_cache::Cache;
//!
//! # fn main() -> ledger_cache::Result<()> {
//! let cache = Cache::open("/tmp/thumbnails", 1, 2, 10 << 20)?;
//!
//! if let Some(mut editor) = cache.edit("front-page")? {
//!     editor.sink(0)?.write_all(b"image bytes")?;
//!     editor.set_string(1, "etag-1234")?;
//!     editor.commit()?;
//! }
//!
//! if let Some(mut snapshot) = cache.get("front-page")? {
//!     let mut image = Vec::new();
//!     std::io::Read::read_to_end(snapshot.source(0), &mut image)?;
//!     let etag = snapshot.string(1)?;
//!     assert_eq!(etag, "etag-1234");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Keys must match `[a-z0-9_-]{1,120}`.  One process owns a cache
//! directory at a time; the [`Cache`] handle itself is safe to share
//! across threads.
mod cache;
mod editor;
mod error;
mod fsutil;
mod journal;
mod snapshot;
mod table;

pub use cache::Cache;
pub use editor::Editor;
pub use editor::Sink;
pub use error::Error;
pub use error::Result;
pub use snapshot::Snapshot;
