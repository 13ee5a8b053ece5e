//! The journal is the cache's source of truth across restarts: an
//! append-only text file whose header pins the cache configuration and
//! whose body records every edit, publication, read, and removal.
//! Replaying it reconstructs the in-memory table, including the LRU
//! order.  This module implements the codec — header, one-line records,
//! the append writer, and the compacted rewrite — but no policy: when
//! to append, flush, or rebuild is the cache's business.
//!
//! The format is byte-exact.  Every line is `\n`-terminated; a final
//! line without its terminator is a crash artifact, reported to the
//! caller so it can discard the partial record and rebuild.
use std::fs::File;
use std::fs::OpenOptions;
use std::io::BufWriter;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Result;
use std::io::Write;
use std::path::Path;

pub(crate) const MAGIC: &str = "libcore.io.DiskLruCache";
pub(crate) const FORMAT_VERSION: &str = "1";

pub(crate) const JOURNAL_FILE: &str = "journal";
pub(crate) const JOURNAL_BACKUP_FILE: &str = "journal.bkp";
pub(crate) const JOURNAL_TMP_FILE: &str = "journal.tmp";

/// Returns the `InvalidData` error that marks the journal as corrupt.
/// The cache reacts by wiping the directory; the message only ever
/// shows up in logs.
fn corrupt(message: String) -> Error {
    Error::new(ErrorKind::InvalidData, message)
}

/// The five-line journal header: magic, format version, application
/// version, value count, and a blank line.  Any mismatch invalidates
/// the whole journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Header {
    pub app_version: u32,
    pub value_count: usize,
}

impl Header {
    fn write_to(&self, out: &mut impl Write) -> Result<()> {
        write!(
            out,
            "{}\n{}\n{}\n{}\n\n",
            MAGIC, FORMAT_VERSION, self.app_version, self.value_count
        )
    }

    fn matches(&self, lines: &[&str]) -> bool {
        lines.len() == 4
            && lines[0] == MAGIC
            && lines[1] == FORMAT_VERSION
            && lines[2] == self.app_version.to_string()
            && lines[3] == self.value_count.to_string()
    }
}

/// One journal body record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Record {
    /// An edit began for `key`.
    Dirty { key: String },
    /// An edit for `key` published; `lengths` are the clean file sizes.
    Clean { key: String, lengths: Vec<u64> },
    /// `key` was read; replaying this restores the LRU order.
    Read { key: String },
    /// `key` was removed, or aborted before ever publishing.
    Remove { key: String },
}

impl Record {
    pub fn write_to(&self, out: &mut impl Write) -> Result<()> {
        match self {
            Record::Dirty { key } => write!(out, "DIRTY {}\n", key),
            Record::Read { key } => write!(out, "READ {}\n", key),
            Record::Remove { key } => write!(out, "REMOVE {}\n", key),
            Record::Clean { key, lengths } => {
                write!(out, "CLEAN {}", key)?;
                for length in lengths {
                    write!(out, " {}", length)?;
                }
                write!(out, "\n")
            }
        }
    }

    /// Parses one body line.  `value_count` fixes the number of
    /// lengths a CLEAN record must carry.  Anything unexpected — an
    /// unknown verb, a missing or extra token, an unparsable length —
    /// is corruption.
    pub fn parse(line: &str, value_count: usize) -> Result<Record> {
        let mut tokens = line.split(' ');
        let verb = tokens.next().unwrap_or("");

        let key = match tokens.next() {
            Some(key) if !key.is_empty() => key.to_owned(),
            _ => return Err(corrupt(format!("unexpected journal line: {:?}", line))),
        };

        match verb {
            "DIRTY" | "READ" | "REMOVE" => {
                if tokens.next().is_some() {
                    return Err(corrupt(format!("unexpected journal line: {:?}", line)));
                }

                Ok(match verb {
                    "DIRTY" => Record::Dirty { key },
                    "READ" => Record::Read { key },
                    _ => Record::Remove { key },
                })
            }
            "CLEAN" => {
                let mut lengths = Vec::with_capacity(value_count);
                for token in tokens {
                    let length = token.parse::<u64>().map_err(|_| {
                        corrupt(format!("unexpected journal line: {:?}", line))
                    })?;
                    lengths.push(length);
                }

                if lengths.len() != value_count {
                    return Err(corrupt(format!("unexpected journal line: {:?}", line)));
                }

                Ok(Record::Clean { key, lengths })
            }
            _ => Err(corrupt(format!("unexpected journal line: {:?}", line))),
        }
    }
}

/// The result of reading a whole journal file.
#[derive(Debug)]
pub(crate) struct LoadedJournal {
    pub records: Vec<Record>,
    /// True if the final record was missing its `\n` terminator.  The
    /// partial record is already discarded from `records`; the caller
    /// should rebuild the journal before appending to it.
    pub truncated: bool,
}

/// Reads and parses the journal at `path` against the expected header.
///
/// Corruption anywhere but an unterminated final line is an
/// `InvalidData` error; plain I/O failures pass through unchanged.
/// Either way the caller's reaction is the same: discard the cache
/// directory.
pub(crate) fn load(path: &Path, expected: Header) -> Result<LoadedJournal> {
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8(bytes)
        .map_err(|_| corrupt("journal is not valid UTF-8".to_owned()))?;

    let mut lines = Vec::new();
    let mut rest = text.as_str();
    while let Some(terminator) = rest.find('\n') {
        lines.push(&rest[..terminator]);
        rest = &rest[terminator + 1..];
    }

    // Whatever remains never got its terminator written.
    let truncated = !rest.is_empty();

    if lines.len() < 5 {
        return Err(corrupt("truncated journal header".to_owned()));
    }

    if !expected.matches(&lines[0..4]) || !lines[4].is_empty() {
        return Err(corrupt(format!(
            "unexpected journal header: {:?}",
            &lines[0..5]
        )));
    }

    let records = lines[5..]
        .iter()
        .map(|line| Record::parse(line, expected.value_count))
        .collect::<Result<Vec<Record>>>()?;

    Ok(LoadedJournal { records, truncated })
}

/// Writes a complete journal — header plus `records` — to `path`,
/// truncating anything already there.  Used both for brand-new caches
/// and for the compaction rewrite, which stages into `journal.tmp`.
pub(crate) fn write_snapshot(
    path: &Path,
    header: Header,
    records: impl IntoIterator<Item = Record>,
) -> Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);

    header.write_to(&mut out)?;
    for record in records {
        record.write_to(&mut out)?;
    }

    out.flush()
}

/// Buffered append handle over the active journal.
#[derive(Debug)]
pub(crate) struct JournalWriter {
    out: BufWriter<File>,
}

impl JournalWriter {
    /// Opens the journal at `path` in append mode, creating it if it
    /// does not exist.
    pub fn append_to(path: &Path) -> Result<JournalWriter> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(JournalWriter {
            out: BufWriter::new(file),
        })
    }

    /// Buffers one record.  The bytes reach the filesystem on the next
    /// [`JournalWriter::flush`], or when the writer is dropped.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        record.write_to(&mut self.out)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_dir::{DirBuilder, TestDir};

    const HEADER: Header = Header {
        app_version: 7,
        value_count: 2,
    };

    fn encode(record: &Record) -> String {
        let mut bytes = Vec::new();
        record.write_to(&mut bytes).expect("write must succeed");
        String::from_utf8(bytes).expect("records are UTF-8")
    }

    /// Records encode to the exact byte layout and parse back.
    #[test]
    fn test_record_round_trip() {
        let records = [
            (
                Record::Dirty {
                    key: "k1".to_owned(),
                },
                "DIRTY k1\n",
            ),
            (
                Record::Clean {
                    key: "k1".to_owned(),
                    lengths: vec![3, 2],
                },
                "CLEAN k1 3 2\n",
            ),
            (
                Record::Read {
                    key: "some-key_0".to_owned(),
                },
                "READ some-key_0\n",
            ),
            (
                Record::Remove {
                    key: "k1".to_owned(),
                },
                "REMOVE k1\n",
            ),
        ];

        for (record, expected) in &records {
            let line = encode(record);
            assert_eq!(&line, expected);

            let reparsed =
                Record::parse(line.trim_end_matches('\n'), 2).expect("parse must succeed");
            assert_eq!(&reparsed, record);
        }
    }

    /// Token-count and length-parse mismatches are corruption.
    #[test]
    fn test_record_parse_rejects_garbage() {
        for line in [
            "",
            "DIRTY",
            "DIRTY ",
            "DIRTY k1 extra",
            "REMOVE k1 0",
            "READ k1 k2",
            "CLEAN k1 3",
            "CLEAN k1 3 2 1",
            "CLEAN k1 3 x",
            "CLEAN k1 -1 2",
            "PUBLISH k1",
        ] {
            let err = Record::parse(line, 2).expect_err(line);
            assert_eq!(err.kind(), ErrorKind::InvalidData);
        }
    }

    /// A journal written by `write_snapshot` loads back exactly.
    #[test]
    fn test_snapshot_round_trip() {
        let temp = TestDir::temp();
        let path = temp.path("journal");

        let records = vec![
            Record::Dirty {
                key: "a".to_owned(),
            },
            Record::Clean {
                key: "a".to_owned(),
                lengths: vec![1, 3],
            },
            Record::Read {
                key: "a".to_owned(),
            },
            Record::Remove {
                key: "a".to_owned(),
            },
        ];

        write_snapshot(&path, HEADER, records.iter().cloned()).expect("write must succeed");

        let loaded = load(&path, HEADER).expect("load must succeed");
        assert!(!loaded.truncated);
        assert_eq!(loaded.records, records);
    }

    /// Appending continues an existing journal.
    #[test]
    fn test_append_extends_snapshot() {
        let temp = TestDir::temp();
        let path = temp.path("journal");

        write_snapshot(&path, HEADER, std::iter::empty()).expect("write must succeed");

        {
            let mut writer = JournalWriter::append_to(&path).expect("open must succeed");
            writer
                .append(&Record::Dirty {
                    key: "k".to_owned(),
                })
                .expect("append must succeed");
            writer
                .append(&Record::Clean {
                    key: "k".to_owned(),
                    lengths: vec![0, 4],
                })
                .expect("append must succeed");
            writer.flush().expect("flush must succeed");
        }

        let loaded = load(&path, HEADER).expect("load must succeed");
        assert_eq!(
            loaded.records,
            vec![
                Record::Dirty {
                    key: "k".to_owned()
                },
                Record::Clean {
                    key: "k".to_owned(),
                    lengths: vec![0, 4]
                },
            ]
        );
    }

    /// Any header field mismatch is corruption.
    #[test]
    fn test_header_mismatch() {
        let temp = TestDir::temp();
        let path = temp.path("journal");

        write_snapshot(&path, HEADER, std::iter::empty()).expect("write must succeed");

        for wrong in [
            Header {
                app_version: 8,
                value_count: 2,
            },
            Header {
                app_version: 7,
                value_count: 3,
            },
        ] {
            let err = load(&path, wrong).expect_err("load must fail");
            assert_eq!(err.kind(), ErrorKind::InvalidData);
        }

        // And a journal whose fifth line is not blank.
        std::fs::write(
            &path,
            format!("{}\n{}\n7\n2\nnot-blank\n", MAGIC, FORMAT_VERSION),
        )
        .expect("write must succeed");
        let err = load(&path, HEADER).expect_err("load must fail");
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    /// An unterminated final record is discarded and reported, not
    /// fatal; the terminated prefix still parses.
    #[test]
    fn test_truncated_tail() {
        let temp = TestDir::temp();
        let path = temp.path("journal");

        std::fs::write(
            &path,
            format!(
                "{}\n{}\n7\n2\n\nDIRTY k1\nCLEAN k1 3 2\nCLEAN k1 9",
                MAGIC, FORMAT_VERSION
            ),
        )
        .expect("write must succeed");

        let loaded = load(&path, HEADER).expect("load must succeed");
        assert!(loaded.truncated);
        assert_eq!(
            loaded.records,
            vec![
                Record::Dirty {
                    key: "k1".to_owned()
                },
                Record::Clean {
                    key: "k1".to_owned(),
                    lengths: vec![3, 2]
                },
            ]
        );
    }

    /// A header cut short mid-line is corruption, not a truncated
    /// record.
    #[test]
    fn test_truncated_header() {
        let temp = TestDir::temp();
        let path = temp.path("journal");

        std::fs::write(&path, format!("{}\n{}\n7", MAGIC, FORMAT_VERSION))
            .expect("write must succeed");

        let err = load(&path, HEADER).expect_err("load must fail");
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
