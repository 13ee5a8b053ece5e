//! Small filesystem helpers shared by the journal and the cache
//! proper.  The cache relies on the filesystem for all durable state,
//! so missing files are often benign: things do disappear from caches.
use std::fs::File;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Result;
use std::path::Path;

/// Checks whether the error is for a missing file: NotFound, or stale
/// handle.  A stale (NFS) handle means the inode we're trying to read
/// isn't available on the server anymore.  Maybe we'd find something
/// else if we flushed our client's filehandle cache, but things do go
/// missing from caches, so gracefully treating stale handles like
/// cache misses should be fine.
pub fn is_absent_file_error(error: &Error) -> bool {
    if error.kind() == ErrorKind::NotFound {
        true
    } else if let Some(errno) = error.raw_os_error() {
        // We'd like to use [`ErrorKind::StaleNetworkFileHandle`],
        // but that's not stabilised https://github.com/rust-lang/rust/issues/86442
        errno == libc::ESTALE
    } else {
        false
    }
}

/// Removes a file if it exists.
pub fn ensure_file_removed(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if is_absent_file_error(&e) => Ok(()),
        err => err,
    }
}

/// Attempts to make sure `path` is a directory that exists.  Unlike
/// `std::fs::create_dir_all`, this function is optimised for the case
/// where `path` is already a directory.
pub fn ensure_directory(path: &Path) -> Result<()> {
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.file_type().is_dir() {
            return Ok(());
        }
    }

    std::fs::create_dir_all(path)
}

/// Returns the current length of the file at `path`, in bytes.
pub fn file_length(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)?.len())
}

/// Returns whether a file (or directory) exists at `path`.
pub fn file_exists(path: &Path) -> bool {
    std::fs::metadata(path).is_ok()
}

/// Opens the file at `path` for reading, mapping an absent file to
/// `None`.
pub fn open_if_present(path: &Path) -> Result<Option<File>> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if is_absent_file_error(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Deletes everything inside `dir`, leaving the directory itself in
/// place.  Used when a corrupt journal forces a fresh start.
pub fn delete_contents(dir: &Path) -> Result<()> {
    let iter = match std::fs::read_dir(dir) {
        Err(e) if is_absent_file_error(&e) => return Ok(()),
        x => x?,
    };

    for dirent in iter.flatten() {
        let path = dirent.path();
        let meta = match dirent.metadata() {
            Ok(meta) => meta,
            Err(e) if is_absent_file_error(&e) => continue,
            Err(e) => return Err(e),
        };

        if meta.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            ensure_file_removed(&path)?;
        }
    }

    Ok(())
}

/// Removing a file should remove that file, and removing it twice is
/// not an error.
#[test]
fn test_ensure_file_removed() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("victim", FileType::ZeroFile(10));
    let path = temp.path("victim");

    assert!(std::fs::metadata(&path).is_ok());
    assert!(ensure_file_removed(&path).is_ok());
    assert!(matches!(std::fs::metadata(&path),
                     Err(e) if e.kind() == ErrorKind::NotFound));

    assert!(ensure_file_removed(&path).is_ok());
}

#[test]
fn test_is_absent_file_error() {
    assert!(is_absent_file_error(&Error::new(
        ErrorKind::NotFound,
        "not found"
    )));
    assert!(!is_absent_file_error(&Error::new(
        ErrorKind::PermissionDenied,
        "bad"
    )));

    assert!(is_absent_file_error(&Error::from_raw_os_error(
        libc::ENOENT
    )));
    assert!(is_absent_file_error(&Error::from_raw_os_error(
        libc::ESTALE
    )));
    assert!(!is_absent_file_error(&Error::from_raw_os_error(libc::EIO)));
}

/// `delete_contents` empties the directory, including subdirectories,
/// but leaves the directory itself.
#[test]
fn test_delete_contents() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp()
        .create("a", FileType::ZeroFile(10))
        .create("sub", FileType::Dir)
        .create("sub/b", FileType::ZeroFile(10));

    delete_contents(&temp.path(".")).expect("delete_contents must succeed");

    assert!(std::fs::metadata(temp.path(".")).is_ok());
    assert!(std::fs::read_dir(temp.path("."))
        .expect("read_dir must succeed")
        .next()
        .is_none());

    // An already-empty directory is fine too.
    delete_contents(&temp.path(".")).expect("delete_contents must succeed");
}

/// `open_if_present` maps a missing file to `None` and hands back a
/// readable handle otherwise.
#[test]
fn test_open_if_present() {
    use std::io::Read;
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("present", FileType::ZeroFile(4));

    assert!(open_if_present(&temp.path("missing"))
        .expect("must succeed")
        .is_none());

    let mut file = open_if_present(&temp.path("present"))
        .expect("must succeed")
        .expect("must be found");
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).expect("read must succeed");
    assert_eq!(bytes.len(), 4);
}
