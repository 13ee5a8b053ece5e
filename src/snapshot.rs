//! A [`Snapshot`] is a read handle over the values of one key as they
//! were published at the moment of the `get`.  It owns its open file
//! handles, so the bytes it serves stay coherent even after the entry
//! is overwritten or evicted; the handles close when the snapshot is
//! dropped.
use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use derivative::Derivative;

use crate::cache::Shared;
use crate::editor::Editor;
use crate::error::{Error, Result};

/// The values of one key, captured at `get` time.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Snapshot {
    #[derivative(Debug = "ignore")]
    shared: Arc<Shared>,
    key: String,
    /// The entry's sequence number when this snapshot was taken;
    /// [`Snapshot::edit`] uses it to detect staleness.
    sequence: u64,
    lengths: Vec<u64>,
    #[derivative(Debug = "ignore")]
    sources: Vec<File>,
}

impl Snapshot {
    pub(crate) fn new(
        shared: Arc<Shared>,
        key: String,
        sequence: u64,
        lengths: Vec<u64>,
        sources: Vec<File>,
    ) -> Snapshot {
        Snapshot {
            shared,
            key,
            sequence,
            lengths,
            sources,
        }
    }

    /// The key this snapshot was taken of.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Byte length of value `index` at capture time.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below the cache's value count.
    pub fn length(&self, index: usize) -> u64 {
        self.lengths[index]
    }

    /// The open source over value `index`.
    ///
    /// Every call returns the same underlying file, so consecutive
    /// reads continue where the previous one stopped.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below the cache's value count.
    pub fn source(&mut self, index: usize) -> &mut File {
        &mut self.sources[index]
    }

    /// Reads the rest of value `index` as UTF-8.
    pub fn string(&mut self, index: usize) -> Result<String> {
        let mut value = String::new();
        self.source(index)
            .read_to_string(&mut value)
            .map_err(Error::Io)?;
        Ok(value)
    }

    /// Starts an edit against exactly the version this snapshot
    /// captured.  Returns `None` if the entry has been overwritten,
    /// removed, or evicted since — or is already being edited.
    pub fn edit(&self) -> Result<Option<Editor>> {
        self.shared.edit_impl(&self.key, Some(self.sequence))
    }
}
