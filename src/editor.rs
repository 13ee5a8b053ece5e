//! An [`Editor`] is the exclusive handle for one in-flight edit of a
//! key.  Values are staged into dirty files through [`Sink`]s and
//! published all at once by [`Editor::commit`], which renames each
//! staged file over its clean counterpart.  Until then readers keep
//! seeing the previous published values, and a crash leaves nothing
//! worse than stray dirty files for the next open to sweep up.
use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use derivative::Derivative;
use tracing::warn;

use crate::cache::Shared;
use crate::error::{Error, Result};

/// An exclusive, in-flight edit of one key.
///
/// At most one editor exists per key at any time.  `commit` and
/// `abort` consume the editor; dropping one that is still pending
/// aborts the edit, which for a never-published entry removes it
/// entirely and for an update preserves the previous values.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Editor {
    #[derivative(Debug = "ignore")]
    shared: Arc<Shared>,
    key: String,
    id: u64,
    /// Indices whose dirty file was opened during this edit.  A first
    /// publish must cover all of them.
    written: Vec<bool>,
    /// Set by any sink that hit an I/O error; commit then degrades to
    /// an abort.
    errored: Arc<AtomicBool>,
    finished: bool,
}

impl Editor {
    pub(crate) fn new(shared: Arc<Shared>, key: String, id: u64, value_count: usize) -> Editor {
        Editor {
            shared,
            key,
            id,
            written: vec![false; value_count],
            errored: Arc::new(AtomicBool::new(false)),
            finished: false,
        }
    }

    /// The key this editor is editing.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Opens a write sink over the staging file for value `index`,
    /// truncating whatever a previous sink of this edit wrote there.
    ///
    /// The sink absorbs I/O errors instead of surfacing them: writes
    /// always report success, and a failure is only visible as the
    /// commit quietly turning into an abort.
    pub fn sink(&mut self, index: usize) -> Result<Sink> {
        let path = self.shared.dirty_file_for_edit(&self.key, self.id, index)?;
        self.written[index] = true;

        let errored = Arc::clone(&self.errored);
        match File::create(&path) {
            Ok(file) => Ok(Sink {
                file: Some(file),
                errored,
            }),
            Err(e) => {
                warn!("failed to open staging file {}: {}", path.display(), e);
                errored.store(true, Ordering::Relaxed);
                Ok(Sink {
                    file: None,
                    errored,
                })
            }
        }
    }

    /// Opens the currently published value at `index` for reading, or
    /// `None` if this entry has never published or the file is gone.
    pub fn source(&mut self, index: usize) -> Result<Option<File>> {
        self.shared.clean_file_for_edit(&self.key, self.id, index)
    }

    /// Stages the UTF-8 bytes of `value` at `index`.
    pub fn set_string(&mut self, index: usize, value: &str) -> Result<()> {
        let mut sink = self.sink(index)?;
        sink.write_all(value.as_bytes()).map_err(Error::Io)
    }

    /// Reads the currently published value at `index` as UTF-8.
    pub fn string(&mut self, index: usize) -> Result<Option<String>> {
        match self.source(index)? {
            Some(mut file) => {
                let mut value = String::new();
                file.read_to_string(&mut value).map_err(Error::Io)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Publishes the staged values atomically.
    ///
    /// For a first publish, every index must have been written; the
    /// edit is aborted and *IllegalState* returned otherwise.  For an
    /// update, unwritten indices keep their previous values.  If any
    /// sink recorded an error the commit aborts instead, preserving
    /// whatever was published before.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let success = !self.errored.load(Ordering::Relaxed);
        self.shared
            .complete_edit(&self.key, self.id, &self.written, success)
    }

    /// Discards the staged values.
    pub fn abort(mut self) -> Result<()> {
        self.finished = true;
        self.shared
            .complete_edit(&self.key, self.id, &self.written, false)
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self
                .shared
                .complete_edit(&self.key, self.id, &self.written, false);
        }
    }
}

/// Write sink over one staging file.
///
/// Errors never propagate out of a sink: a failed write marks the
/// owning editor and every subsequent write is swallowed, so callers
/// can stream into the cache without error handling and let the
/// commit sort it out.
#[derive(Debug)]
pub struct Sink {
    file: Option<File>,
    errored: Arc<AtomicBool>,
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(buf) {
                warn!("cache value write failed: {}", e);
                self.errored.store(true, Ordering::Relaxed);
                self.file = None;
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush() {
                self.errored.store(true, Ordering::Relaxed);
                self.file = None;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A sink with no backing file pretends every write succeeded.
    #[test]
    fn test_detached_sink_absorbs_writes() {
        let errored = Arc::new(AtomicBool::new(true));
        let mut sink = Sink {
            file: None,
            errored: Arc::clone(&errored),
        };

        assert_eq!(sink.write(b"payload").expect("write must not fail"), 7);
        sink.write_all(b"more").expect("write_all must not fail");
        sink.flush().expect("flush must not fail");
        assert!(errored.load(Ordering::Relaxed));
    }

    /// A healthy sink passes bytes through to its file.
    #[test]
    fn test_sink_writes_through() {
        use test_dir::{DirBuilder, TestDir};

        let temp = TestDir::temp();
        let path = temp.path("staged");

        let errored = Arc::new(AtomicBool::new(false));
        {
            let mut sink = Sink {
                file: Some(File::create(&path).expect("create must succeed")),
                errored: Arc::clone(&errored),
            };
            sink.write_all(b"payload").expect("write must not fail");
            sink.flush().expect("flush must not fail");
        }

        assert_eq!(
            std::fs::read(&path).expect("read must succeed"),
            b"payload"
        );
        assert!(!errored.load(Ordering::Relaxed));
    }
}
