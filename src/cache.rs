//! The cache proper: a bounded directory of value files whose index —
//! lengths, publication state, LRU order — is reconstructed from the
//! journal on open and kept consistent with the directory at every
//! step in between.
//!
//! All metadata lives under one mutex.  Critical sections only ever
//! touch the table, the journal writer, and filesystem metadata
//! (open/rename/delete/stat); bulk value I/O happens on the caller's
//! side of an [`Editor`] sink or [`Snapshot`] source, outside the
//! lock.  A single maintenance thread drains evictions and compacts
//! the journal; [`Cache::flush`] waits for it so callers can observe
//! a settled cache.
use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use derivative::Derivative;
use parking_lot::Condvar;
use parking_lot::Mutex;
use tracing::debug;
use tracing::warn;

use crate::editor::Editor;
use crate::error::{Error, Result};
use crate::fsutil;
use crate::journal;
use crate::journal::Header;
use crate::journal::JournalWriter;
use crate::journal::Record;
use crate::snapshot::Snapshot;
use crate::table::{clean_path, dirty_path, Entry, EntryTable};

/// Compact the journal once this many records have accumulated since
/// the last rebuild (and at least one record per live entry, so large
/// caches rebuild proportionally less often).
const REBUILD_OPS_THRESHOLD: usize = 2000;

/// Editor id attached to entries while their DIRTY record awaits a
/// matching CLEAN or REMOVE during journal replay.  Real editor ids
/// start at 1.
const REPLAY_EDITOR: u64 = 0;

/// Checks a cache key against `[a-z0-9_-]{1,120}`.
fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= 120
        && key
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'));

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "Keys must match regex [a-z0-9_-]{{1,120}}: \"{}\"",
            key
        )))
    }
}

/// Everything the mutex protects.
struct State {
    closed: bool,
    shutdown: bool,
    /// True while a maintenance pass is requested or running.
    maintenance: bool,
    /// Set on the first failed journal write; the cache then refuses
    /// all further operations, since the journal no longer matches
    /// what a future recovery would replay.
    wedged: bool,
    max_size: u64,
    /// Total published bytes, i.e. the sum of lengths over readable
    /// entries.  An in-flight edit keeps contributing its pre-edit
    /// lengths until it commits.
    size: u64,
    entries: EntryTable,
    journal: Option<JournalWriter>,
    /// Journal records appended since the last compaction.
    redundant_ops: usize,
    next_sequence: u64,
    next_editor: u64,
}

impl State {
    fn new(max_size: u64) -> State {
        State {
            closed: false,
            shutdown: false,
            maintenance: false,
            wedged: false,
            max_size,
            size: 0,
            entries: EntryTable::new(),
            journal: None,
            redundant_ops: 0,
            next_sequence: 1,
            next_editor: 1,
        }
    }
}

/// State shared between the [`Cache`] handle, its editors and
/// snapshots, and the maintenance thread.
pub(crate) struct Shared {
    directory: PathBuf,
    app_version: u32,
    value_count: usize,
    state: Mutex<State>,
    /// Wakes the maintenance thread.
    work: Condvar,
    /// Signalled when a maintenance pass finishes; `flush` waits here.
    drained: Condvar,
}

/// A bounded, persistent, least-recently-used cache of value tuples.
///
/// Every key maps to a fixed number of opaque byte values, stored as
/// plain files and published atomically by rename.  An append-only
/// journal makes the cache crash-safe: reopening a directory replays
/// the journal, reconciles it against the files actually present, and
/// carries on.  When the total published bytes exceed `max_size`, the
/// least recently used entries are evicted until the cache fits.
///
/// One process owns a cache directory at a time; within that process
/// the handle may be shared freely across threads.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Cache {
    #[derivative(Debug = "ignore")]
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Cache {
    /// Opens the cache in `directory`, creating it if necessary.
    ///
    /// `app_version` is stamped into the journal header; reopening
    /// with a different version (or a different `value_count`)
    /// invalidates everything previously cached.  A corrupt journal is
    /// handled the same way: the directory contents are discarded and
    /// the cache starts fresh.
    ///
    /// # Errors
    ///
    /// Returns *InvalidArgument* if `max_size` or `value_count` is
    /// zero, and *IO* if the directory or a fresh journal cannot be
    /// created.
    pub fn open(
        directory: impl Into<PathBuf>,
        app_version: u32,
        value_count: usize,
        max_size: u64,
    ) -> Result<Cache> {
        if max_size == 0 {
            return Err(Error::InvalidArgument(
                "max_size must be positive".to_owned(),
            ));
        }

        if value_count == 0 {
            return Err(Error::InvalidArgument(
                "value_count must be positive".to_owned(),
            ));
        }

        let directory = directory.into();
        let header = Header {
            app_version,
            value_count,
        };

        fsutil::ensure_directory(&directory)?;

        // A backup journal is a rebuild that never finished.  Prefer
        // the live journal when both exist; promote the backup
        // otherwise.
        let journal_path = directory.join(journal::JOURNAL_FILE);
        let backup_path = directory.join(journal::JOURNAL_BACKUP_FILE);
        if fsutil::file_exists(&backup_path) {
            if fsutil::file_exists(&journal_path) {
                fsutil::ensure_file_removed(&backup_path)?;
            } else {
                std::fs::rename(&backup_path, &journal_path)?;
            }
        }

        let mut state = State::new(max_size);
        let mut recovered = false;

        if fsutil::file_exists(&journal_path) {
            match recover(&directory, header, &mut state) {
                Ok(()) => recovered = true,
                Err(e) => {
                    warn!(
                        "cache {} is corrupt: {}, removing",
                        directory.display(),
                        e
                    );
                    state = State::new(max_size);
                    fsutil::delete_contents(&directory)?;
                }
            }
        }

        if !recovered {
            journal::write_snapshot(&journal_path, header, std::iter::empty())?;
            state.journal = Some(JournalWriter::append_to(&journal_path)?);
        }

        let shared = Arc::new(Shared {
            directory,
            app_version,
            value_count,
            state: Mutex::new(state),
            work: Condvar::new(),
            drained: Condvar::new(),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("cache-maintenance".to_owned())
                .spawn(move || maintenance_loop(shared))?
        };

        Ok(Cache {
            shared,
            worker: Some(worker),
        })
    }

    /// Returns a snapshot of the current values for `key`, or `None`
    /// if nothing readable is cached under it.
    ///
    /// The snapshot holds its own open handles: the bytes it reads
    /// stay those published at `get` time even if the entry is
    /// overwritten or evicted afterwards.
    pub fn get(&self, key: &str) -> Result<Option<Snapshot>> {
        validate_key(key)?;

        let shared = &self.shared;
        let mut guard = shared.state.lock();
        let state = &mut *guard;
        shared.check_operational(state)?;

        let (sequence, lengths) = match state.entries.touch(key) {
            Some(entry) if entry.readable => (entry.sequence, entry.lengths.clone()),
            _ => return Ok(None),
        };

        let mut sources = Vec::with_capacity(shared.value_count);
        for index in 0..shared.value_count {
            match File::open(clean_path(&shared.directory, key, index)) {
                Ok(file) => sources.push(file),
                Err(e) if fsutil::is_absent_file_error(&e) => {
                    // The entry is stale on disk; forget it.  An edit
                    // caught in flight loses its entry and fails on
                    // its next operation.
                    drop(sources);
                    shared.drop_entry(state, key)?;
                    return Ok(None);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }

        state.redundant_ops += 1;
        shared.append_record(
            state,
            &Record::Read {
                key: key.to_owned(),
            },
        )?;
        shared.schedule_maintenance_if_needed(state);

        Ok(Some(Snapshot::new(
            Arc::clone(shared),
            key.to_owned(),
            sequence,
            lengths,
            sources,
        )))
    }

    /// Starts an edit of `key`, creating the entry if absent.
    ///
    /// Returns `None` while another edit of the same key is in
    /// flight.  The `DIRTY` journal record is flushed before this
    /// returns, so a crash mid-edit is always recognised on reopen.
    pub fn edit(&self, key: &str) -> Result<Option<Editor>> {
        self.shared.edit_impl(key, None)
    }

    /// Removes `key` and deletes its published files.
    ///
    /// Returns `false` if the entry does not exist or is currently
    /// being edited.  Fails with *IO* only when an existing value file
    /// cannot be deleted; the entry is left in place in that case.
    pub fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;

        let shared = &self.shared;
        let mut guard = shared.state.lock();
        let state = &mut *guard;
        shared.check_operational(state)?;

        match state.entries.get(key) {
            None => return Ok(false),
            Some(entry) if entry.editor.is_some() => return Ok(false),
            Some(_) => {}
        }

        shared.drop_entry(state, key)?;
        shared.schedule_maintenance_if_needed(state);
        Ok(true)
    }

    /// Total published bytes currently accounted to the cache.  May
    /// transiently exceed [`Cache::max_size`] until the eviction drain
    /// runs; [`Cache::flush`] waits for it.
    pub fn size(&self) -> Result<u64> {
        let state = self.shared.state.lock();
        self.shared.check_operational(&state)?;

        Ok(state.size)
    }

    pub fn max_size(&self) -> u64 {
        self.shared.state.lock().max_size
    }

    /// Changes the byte budget and schedules an eviction drain to
    /// enforce it.
    pub fn set_max_size(&self, max_size: u64) -> Result<()> {
        if max_size == 0 {
            return Err(Error::InvalidArgument(
                "max_size must be positive".to_owned(),
            ));
        }

        let shared = &self.shared;
        let mut guard = shared.state.lock();
        let state = &mut *guard;
        shared.check_operational(state)?;

        state.max_size = max_size;
        shared.schedule_maintenance_if_needed(state);
        Ok(())
    }

    /// Waits for pending maintenance, then flushes buffered journal
    /// records to the filesystem.
    pub fn flush(&self) -> Result<()> {
        let shared = &self.shared;
        let mut guard = shared.state.lock();

        shared.check_operational(&guard)?;
        while guard.maintenance {
            shared.drained.wait(&mut guard);
        }
        shared.check_operational(&guard)?;

        shared.flush_journal(&mut guard)
    }

    /// Closes the cache: aborts in-flight edits, drains eviction,
    /// flushes and closes the journal, and stops the maintenance
    /// thread.  Idempotent; also run on drop.
    ///
    /// Outstanding [`Editor`] handles fail with *IllegalState* from
    /// here on; outstanding [`Snapshot`] handles keep reading.
    pub fn close(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut result = Ok(());

        {
            let mut guard = shared.state.lock();
            let state = &mut *guard;

            if !state.closed {
                let editing: Vec<(String, u64)> = state
                    .entries
                    .iter()
                    .filter_map(|(key, entry)| entry.editor.map(|id| (key.clone(), id)))
                    .collect();
                for (key, id) in editing {
                    result = result.and(shared.finish_edit(state, &key, id, &[], false));
                }

                result = result.and(shared.trim_to_size(state));
                if !state.wedged {
                    result = result.and(shared.flush_journal(state));
                }

                state.journal = None;
                state.entries.clear();
                state.size = 0;
                state.closed = true;
            }

            state.shutdown = true;
            state.maintenance = false;
            shared.work.notify_one();
            shared.drained.notify_all();
        }

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        result
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// The directory this cache owns.
    pub fn directory(&self) -> &Path {
        &self.shared.directory
    }

    pub fn app_version(&self) -> u32 {
        self.shared.app_version
    }

    /// Number of values stored per key.
    pub fn value_count(&self) -> usize {
        self.shared.value_count
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl Shared {
    fn header(&self) -> Header {
        Header {
            app_version: self.app_version,
            value_count: self.value_count,
        }
    }

    fn check_operational(&self, state: &State) -> Result<()> {
        if state.closed {
            return Err(Error::closed());
        }

        if state.wedged {
            return Err(Error::wedged());
        }

        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index < self.value_count {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "value index out of range: {}",
                index
            )))
        }
    }

    /// Appends one record to the journal, poisoning the cache if the
    /// write fails.
    fn append_record(&self, state: &mut State, record: &Record) -> Result<()> {
        let journal = match state.journal.as_mut() {
            Some(journal) => journal,
            None => return Err(Error::wedged()),
        };

        if let Err(e) = journal.append(record) {
            warn!(
                "journal append failed for {}: {}",
                self.directory.display(),
                e
            );
            state.wedged = true;
            state.journal = None;
            return Err(Error::Io(e));
        }

        Ok(())
    }

    fn flush_journal(&self, state: &mut State) -> Result<()> {
        let journal = match state.journal.as_mut() {
            Some(journal) => journal,
            None => return Err(Error::wedged()),
        };

        if let Err(e) = journal.flush() {
            warn!(
                "journal flush failed for {}: {}",
                self.directory.display(),
                e
            );
            state.wedged = true;
            state.journal = None;
            return Err(Error::Io(e));
        }

        Ok(())
    }

    fn rebuild_required(&self, state: &State) -> bool {
        state.redundant_ops >= REBUILD_OPS_THRESHOLD
            && state.redundant_ops >= state.entries.len()
    }

    fn maintenance_needed(&self, state: &State) -> bool {
        state.size > state.max_size || self.rebuild_required(state)
    }

    fn schedule_maintenance_if_needed(&self, state: &mut State) {
        if !state.maintenance && self.maintenance_needed(state) {
            state.maintenance = true;
            self.work.notify_one();
        }
    }

    /// Deletes `key`'s clean files, drops it from the table, and logs
    /// the removal.  Files are deleted first: if one of them cannot be
    /// removed, the entry stays and the cache remains consistent.
    fn drop_entry(&self, state: &mut State, key: &str) -> Result<()> {
        for index in 0..self.value_count {
            fsutil::ensure_file_removed(&clean_path(&self.directory, key, index))?;
        }

        if let Some(entry) = state.entries.remove(key) {
            if entry.readable {
                state.size -= entry.total_length();
            }

            // A detached edit must not leave staging files behind.
            if entry.editor.is_some() {
                for index in 0..self.value_count {
                    fsutil::ensure_file_removed(&dirty_path(&self.directory, key, index))?;
                }
            }
        }

        state.redundant_ops += 1;
        self.append_record(
            state,
            &Record::Remove {
                key: key.to_owned(),
            },
        )
    }

    /// Evicts least-recently-used entries until the cache fits its
    /// budget.  Entries with an in-flight editor are skipped; their
    /// commit re-triggers eviction.
    fn trim_to_size(&self, state: &mut State) -> Result<()> {
        let mut evicted = 0usize;
        while state.size > state.max_size {
            let victim = match state.entries.eviction_candidate() {
                Some(key) => key.to_owned(),
                None => break,
            };

            self.drop_entry(state, &victim)?;
            evicted += 1;
        }

        if evicted > 0 {
            debug!(
                "evicted {} entries from {}",
                evicted,
                self.directory.display()
            );
        }

        Ok(())
    }

    fn rebuild_journal(&self, state: &mut State) -> Result<()> {
        match rebuild_journal_files(&self.directory, self.header(), state) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "journal rebuild failed for {}: {}",
                    self.directory.display(),
                    e
                );
                state.wedged = true;
                state.journal = None;
                Err(Error::Io(e))
            }
        }
    }

    fn run_maintenance(&self, state: &mut State) -> Result<()> {
        if state.closed || state.wedged {
            return Ok(());
        }

        self.trim_to_size(state)?;
        if self.rebuild_required(state) {
            self.rebuild_journal(state)?;
        }

        Ok(())
    }

    /// Starts an edit, optionally only if the entry still carries
    /// `expected_sequence` (how [`Snapshot::edit`] detects staleness).
    pub(crate) fn edit_impl(
        self: &Arc<Self>,
        key: &str,
        expected_sequence: Option<u64>,
    ) -> Result<Option<Editor>> {
        validate_key(key)?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.check_operational(state)?;

        if let Some(expected) = expected_sequence {
            match state.entries.get(key) {
                Some(entry) if entry.sequence == expected => {}
                _ => return Ok(None),
            }
        }

        if state
            .entries
            .get(key)
            .map_or(false, |entry| entry.editor.is_some())
        {
            return Ok(None);
        }

        // The DIRTY record must be durable before the editor exists:
        // a crash mid-edit has to be recognisable on reopen.
        self.append_record(
            state,
            &Record::Dirty {
                key: key.to_owned(),
            },
        )?;
        self.flush_journal(state)?;

        let id = state.next_editor;
        state.next_editor += 1;

        if state.entries.get(key).is_none() {
            state
                .entries
                .insert(key.to_owned(), Entry::new(self.value_count));
        }
        if let Some(entry) = state.entries.touch(key) {
            entry.editor = Some(id);
        }

        Ok(Some(Editor::new(
            Arc::clone(self),
            key.to_owned(),
            id,
            self.value_count,
        )))
    }

    /// Resolves the dirty-file path for one value of an in-flight
    /// edit, verifying the editor is still attached.
    pub(crate) fn dirty_file_for_edit(
        &self,
        key: &str,
        id: u64,
        index: usize,
    ) -> Result<PathBuf> {
        self.check_index(index)?;

        let state = self.state.lock();
        self.check_edit_attached(&state, key, id)?;
        Ok(dirty_path(&self.directory, key, index))
    }

    /// Opens the published value at `index` for an in-flight edit:
    /// `None` if the entry has never published or the file is gone.
    pub(crate) fn clean_file_for_edit(
        &self,
        key: &str,
        id: u64,
        index: usize,
    ) -> Result<Option<File>> {
        self.check_index(index)?;

        let state = self.state.lock();
        self.check_edit_attached(&state, key, id)?;

        match state.entries.get(key) {
            Some(entry) if entry.readable => {}
            _ => return Ok(None),
        }

        fsutil::open_if_present(&clean_path(&self.directory, key, index)).map_err(Error::Io)
    }

    fn check_edit_attached(&self, state: &State, key: &str, id: u64) -> Result<()> {
        if state.closed {
            return Err(Error::closed());
        }

        if state.wedged {
            return Err(Error::wedged());
        }

        match state.entries.get(key) {
            Some(entry) if entry.editor == Some(id) => Ok(()),
            _ => Err(Error::IllegalState(
                "editor is no longer attached to its entry",
            )),
        }
    }

    pub(crate) fn complete_edit(
        &self,
        key: &str,
        id: u64,
        written: &[bool],
        success: bool,
    ) -> Result<()> {
        let mut guard = self.state.lock();
        self.finish_edit(&mut guard, key, id, written, success)
    }

    /// Ends an edit: publishes the written dirty files (success) or
    /// deletes them (abort), updates lengths and size, detaches the
    /// editor, and journals the outcome.  `written` is only consulted
    /// on the success path.
    fn finish_edit(
        &self,
        state: &mut State,
        key: &str,
        id: u64,
        written: &[bool],
        success: bool,
    ) -> Result<()> {
        if state.closed {
            return Err(Error::closed());
        }

        if state.wedged {
            return Err(Error::wedged());
        }

        let readable = match state.entries.get(key) {
            Some(entry) if entry.editor == Some(id) => entry.readable,
            _ => {
                return Err(Error::IllegalState(
                    "editor is no longer attached to its entry",
                ))
            }
        };

        // A first publish must cover every index; a half-written new
        // entry aborts instead.  A dirty file that vanished under the
        // editor also aborts, silently: writes are best-effort.
        let mut success = success;
        let mut missing_value = false;
        if success && !readable {
            for index in 0..self.value_count {
                if written.get(index) != Some(&true) {
                    missing_value = true;
                    success = false;
                    break;
                }

                if !fsutil::file_exists(&dirty_path(&self.directory, key, index)) {
                    success = false;
                    break;
                }
            }
        }

        let mut published: Vec<(usize, u64)> = Vec::new();
        for index in 0..self.value_count {
            let dirty = dirty_path(&self.directory, key, index);
            if success {
                // Unwritten indices have no dirty file; the previous
                // clean file stays authoritative.
                if fsutil::file_exists(&dirty) {
                    let clean = clean_path(&self.directory, key, index);
                    std::fs::rename(&dirty, &clean)?;
                    published.push((index, fsutil::file_length(&clean)?));
                }
            } else {
                fsutil::ensure_file_removed(&dirty)?;
            }
        }

        if let Some(entry) = state.entries.get_mut(key) {
            entry.editor = None;
            for (index, length) in &published {
                state.size = state.size + length - entry.lengths[*index];
                entry.lengths[*index] = *length;
            }
        }

        state.redundant_ops += 1;

        let record = if readable || success {
            let mut lengths = Vec::new();
            if let Some(entry) = state.entries.get_mut(key) {
                entry.readable = true;
                if success {
                    entry.sequence = state.next_sequence;
                    state.next_sequence += 1;
                }
                lengths = entry.lengths.clone();
            }

            Record::Clean {
                key: key.to_owned(),
                lengths,
            }
        } else {
            state.entries.remove(key);
            Record::Remove {
                key: key.to_owned(),
            }
        };
        self.append_record(state, &record)?;

        self.schedule_maintenance_if_needed(state);

        if missing_value {
            return Err(Error::IllegalState(
                "newly created entry did not write every value index",
            ));
        }

        Ok(())
    }
}

/// Body of the maintenance thread: waits for work, runs it under the
/// cache lock, and signals `flush` waiters.
fn maintenance_loop(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        while !state.maintenance && !state.shutdown {
            shared.work.wait(&mut state);
        }

        if state.shutdown {
            return;
        }

        if let Err(e) = shared.run_maintenance(&mut state) {
            warn!(
                "cache maintenance failed for {}: {}",
                shared.directory.display(),
                e
            );
        }

        state.maintenance = false;
        shared.drained.notify_all();
    }
}

/// Replays the journal in `directory` into `state` and reconciles it
/// with the files actually present.
///
/// Any error — unreadable journal, header mismatch, malformed record,
/// a readable entry whose clean file is missing — means the directory
/// contents cannot be trusted; the caller wipes them and starts
/// fresh.
fn recover(directory: &Path, header: Header, state: &mut State) -> std::io::Result<()> {
    fsutil::ensure_file_removed(&directory.join(journal::JOURNAL_TMP_FILE))?;

    let journal_path = directory.join(journal::JOURNAL_FILE);
    let loaded = journal::load(&journal_path, header)?;
    let record_count = loaded.records.len();

    for record in loaded.records {
        match record {
            Record::Remove { key } => {
                state.entries.remove(&key);
            }
            Record::Read { key } => {
                state.entries.touch(&key);
            }
            Record::Dirty { key } => {
                if state.entries.touch(&key).is_none() {
                    state
                        .entries
                        .insert(key.clone(), Entry::new(header.value_count));
                }
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.editor = Some(REPLAY_EDITOR);
                }
            }
            Record::Clean { key, lengths } => {
                // Compacted journals start entries directly at CLEAN,
                // so create on demand just like DIRTY does.
                if state.entries.touch(&key).is_none() {
                    state
                        .entries
                        .insert(key.clone(), Entry::new(header.value_count));
                }
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.editor = None;
                    entry.readable = true;
                    entry.lengths = lengths;
                    entry.sequence = state.next_sequence;
                }
                state.next_sequence += 1;
            }
        }
    }

    // A DIRTY with no matching CLEAN or REMOVE is an edit the crash
    // interrupted: delete whatever it left behind and forget the
    // entry.
    let unresolved: Vec<String> = state
        .entries
        .iter()
        .filter(|(_, entry)| entry.editor.is_some())
        .map(|(key, _)| key.clone())
        .collect();
    for key in &unresolved {
        for index in 0..header.value_count {
            fsutil::ensure_file_removed(&clean_path(directory, key, index))?;
            fsutil::ensure_file_removed(&dirty_path(directory, key, index))?;
        }
        state.entries.remove(key);
    }

    // Everything left claims to be readable; hold it to that.
    let mut size = 0u64;
    for (key, entry) in state.entries.iter() {
        for index in 0..header.value_count {
            if !fsutil::file_exists(&clean_path(directory, key, index)) {
                return Err(std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!("missing value file for {:?}", key),
                ));
            }
        }
        size += entry.total_length();
    }
    state.size = size;
    state.redundant_ops = record_count.saturating_sub(state.entries.len());

    if loaded.truncated {
        // The discarded partial record is unrecoverable; start the
        // journal over from the surviving state.
        rebuild_journal_files(directory, header, state)?;
    } else {
        state.journal = Some(JournalWriter::append_to(&journal_path)?);
    }

    Ok(())
}

/// Replaces the live journal with a compacted one: header plus a
/// single record per entry.  The backup-rename dance keeps a valid
/// journal on disk at every instant.
fn rebuild_journal_files(
    directory: &Path,
    header: Header,
    state: &mut State,
) -> std::io::Result<()> {
    let tmp_path = directory.join(journal::JOURNAL_TMP_FILE);
    let journal_path = directory.join(journal::JOURNAL_FILE);
    let backup_path = directory.join(journal::JOURNAL_BACKUP_FILE);

    state.journal = None;

    journal::write_snapshot(
        &tmp_path,
        header,
        state.entries.iter().map(|(key, entry)| {
            if entry.readable {
                Record::Clean {
                    key: key.clone(),
                    lengths: entry.lengths.clone(),
                }
            } else {
                Record::Dirty { key: key.clone() }
            }
        }),
    )?;

    if fsutil::file_exists(&journal_path) {
        std::fs::rename(&journal_path, &backup_path)?;
    }
    std::fs::rename(&tmp_path, &journal_path)?;
    fsutil::ensure_file_removed(&backup_path)?;

    state.journal = Some(JournalWriter::append_to(&journal_path)?);
    state.redundant_ops = state.entries.len();

    debug!(
        "rebuilt journal for {} with {} entries",
        directory.display(),
        state.entries.len()
    );
    Ok(())
}
