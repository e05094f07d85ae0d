//! Write-ahead log
//!
//! The durable state of a mount is one newline-delimited stream: line 1 is a
//! JSON [`Snapshot`], every later line a JSON [`WalEntry`]. Entries describe
//! tree and pool mutations only; file contents go straight to backing files.
//!
//! Two streams ("slots") are kept. A checkpoint writes the next snapshot into
//! the idle slot with a higher generation before clearing the live one, so a
//! crash at any point leaves at least one complete snapshot behind.

use crate::core::config::CorruptSnapshotPolicy;
use crate::core::node::SnapshotNode;
use crate::core::storage::SyncAccessHandle;
use crate::error::{FsError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Primary slot name
pub const STATE_FILE: &str = "state.txt";

/// Secondary slot name
pub const STATE_NEXT_FILE: &str = "state.next.txt";

/// Options accepted by `mkdir`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MkdirOptions {
    pub recursive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// Full copy of the tree and pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub root: SnapshotNode,
    pub pool: Vec<String>,
    /// Checkpoint counter; absent in logs written before slots existed
    #[serde(default)]
    pub generation: u64,
}

impl Snapshot {
    /// Empty tree, empty pool
    pub fn empty() -> Self {
        Snapshot {
            root: SnapshotNode::empty_root(),
            pool: Vec::new(),
            generation: 0,
        }
    }
}

/// One logged mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEntry", into = "RawEntry")]
pub enum WalEntry {
    Chmod { path: String, mode: u32 },
    Mkdir { path: String, options: MkdirOptions },
    Rename { old_path: String, new_path: String },
    Rmdir { path: String },
    Unlink { path: String },
    Utimes { path: String, atime: u64, mtime: u64 },
    CreateFileNode { path: String, node: SnapshotNode },
    SetLastModified { path: String, last_modified: u64 },
    CreatePoolFile { filename: String },
    DeletePoolFile { filename: String },
}

impl WalEntry {
    /// Operation name as written to the log
    pub fn opp(&self) -> &'static str {
        match self {
            WalEntry::Chmod { .. } => "chmod",
            WalEntry::Mkdir { .. } => "mkdir",
            WalEntry::Rename { .. } => "rename",
            WalEntry::Rmdir { .. } => "rmdir",
            WalEntry::Unlink { .. } => "unlink",
            WalEntry::Utimes { .. } => "utimes",
            WalEntry::CreateFileNode { .. } => "createFileNode",
            WalEntry::SetLastModified { .. } => "setLastModified",
            WalEntry::CreatePoolFile { .. } => "createPoolFile",
            WalEntry::DeletePoolFile { .. } => "deletePoolFile",
        }
    }
}

/// Wire shape: `{"opp": "...", "args": [...]}`
#[derive(Serialize, Deserialize)]
struct RawEntry {
    opp: String,
    args: Vec<Value>,
}

struct Args {
    opp: String,
    args: std::vec::IntoIter<Value>,
}

impl Args {
    fn next<T: DeserializeOwned>(&mut self) -> Result<T> {
        let value = self.args.next().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| {
            FsError::Protocol(format!("bad argument for {}: {}", self.opp, e))
        })
    }
}

impl TryFrom<RawEntry> for WalEntry {
    type Error = FsError;

    fn try_from(raw: RawEntry) -> Result<Self> {
        let mut args = Args {
            opp: raw.opp.clone(),
            args: raw.args.into_iter(),
        };
        let entry = match raw.opp.as_str() {
            "chmod" => WalEntry::Chmod {
                path: args.next()?,
                mode: args.next()?,
            },
            "mkdir" => WalEntry::Mkdir {
                path: args.next()?,
                options: args.next::<Option<MkdirOptions>>()?.unwrap_or_default(),
            },
            "rename" => WalEntry::Rename {
                old_path: args.next()?,
                new_path: args.next()?,
            },
            "rmdir" => WalEntry::Rmdir { path: args.next()? },
            "unlink" => WalEntry::Unlink { path: args.next()? },
            "utimes" => WalEntry::Utimes {
                path: args.next()?,
                atime: args.next()?,
                mtime: args.next()?,
            },
            "createFileNode" => WalEntry::CreateFileNode {
                path: args.next()?,
                node: args.next()?,
            },
            "setLastModified" => WalEntry::SetLastModified {
                path: args.next()?,
                last_modified: args.next()?,
            },
            "createPoolFile" => WalEntry::CreatePoolFile {
                filename: args.next()?,
            },
            "deletePoolFile" => WalEntry::DeletePoolFile {
                filename: args.next()?,
            },
            other => return Err(FsError::Protocol(format!("unknown operation: {}", other))),
        };
        Ok(entry)
    }
}

impl From<WalEntry> for RawEntry {
    fn from(entry: WalEntry) -> Self {
        let opp = entry.opp().to_string();
        let args = match entry {
            WalEntry::Chmod { path, mode } => vec![path.into(), mode.into()],
            WalEntry::Mkdir { path, options } => vec![
                path.into(),
                serde_json::to_value(options).unwrap_or(Value::Null),
            ],
            WalEntry::Rename { old_path, new_path } => vec![old_path.into(), new_path.into()],
            WalEntry::Rmdir { path } | WalEntry::Unlink { path } => vec![path.into()],
            WalEntry::Utimes { path, atime, mtime } => {
                vec![path.into(), atime.into(), mtime.into()]
            }
            WalEntry::CreateFileNode { path, node } => vec![
                path.into(),
                serde_json::to_value(node).unwrap_or(Value::Null),
            ],
            WalEntry::SetLastModified {
                path,
                last_modified,
            } => vec![path.into(), last_modified.into()],
            WalEntry::CreatePoolFile { filename } | WalEntry::DeletePoolFile { filename } => {
                vec![filename.into()]
            }
        };
        RawEntry { opp, args }
    }
}

/// Result of parsing one log stream
#[derive(Debug)]
pub enum ParsedLog {
    /// Zero bytes
    Empty,
    /// Bytes present, but line 1 is not a snapshot
    Corrupt(String),
    Valid {
        snapshot: Snapshot,
        entries: Vec<WalEntry>,
        /// Length of the stream up to the end of the last good line
        valid_len: u64,
        /// Whether a malformed line cut replay short
        torn: bool,
    },
}

/// Parse a log stream
///
/// A malformed entry line ends parsing; everything from the newline before
/// it onwards is reported as a torn tail.
pub fn parse_log(bytes: &[u8]) -> ParsedLog {
    if bytes.is_empty() {
        return ParsedLog::Empty;
    }

    let mut lines = bytes.split(|b| *b == b'\n');
    let first = lines.next().unwrap_or_default();
    let snapshot: Snapshot = match serde_json::from_slice(first) {
        Ok(snapshot) => snapshot,
        Err(e) => return ParsedLog::Corrupt(e.to_string()),
    };

    let mut entries = Vec::new();
    let mut offset = first.len();
    let mut valid_len = offset;
    let mut torn = false;
    for line in lines {
        // Account for the separating newline
        offset += 1;
        let end = offset + line.len();
        if line.iter().all(u8::is_ascii_whitespace) {
            offset = end;
            continue;
        }
        match serde_json::from_slice::<WalEntry>(line) {
            Ok(entry) => {
                entries.push(entry);
                valid_len = end;
            }
            Err(_) => {
                torn = true;
                break;
            }
        }
        offset = end;
    }

    ParsedLog::Valid {
        snapshot,
        entries,
        valid_len: valid_len as u64,
        torn,
    }
}

/// One log stream on top of a sync access handle
pub struct LogFile {
    name: String,
    handle: Box<dyn SyncAccessHandle>,
}

impl LogFile {
    pub fn new(name: impl Into<String>, handle: Box<dyn SyncAccessHandle>) -> Self {
        LogFile {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> Result<u64> {
        self.handle.size()
    }

    /// Read the whole stream
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let size = self.handle.size()? as usize;
        let mut buf = vec![0u8; size];
        let n = self.handle.read_at(&mut buf, 0)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Append an entry as `"\n" + json`, returning the offset before it
    pub fn append(&mut self, entry: &WalEntry) -> Result<u64> {
        let mut line = Vec::with_capacity(64);
        line.push(b'\n');
        serde_json::to_writer(&mut line, entry)?;

        let offset = self.handle.size()?;
        self.handle.write_at(&line, offset)?;
        Ok(offset)
    }

    /// Cut the stream back to `offset`
    pub fn rollback(&mut self, offset: u64) -> Result<()> {
        self.handle.truncate(offset)
    }

    /// Replace the whole stream with a snapshot line, durably
    pub fn rewrite(&mut self, snapshot: &Snapshot) -> Result<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        self.handle.truncate(0)?;
        self.handle.write_at(&bytes, 0)?;
        self.handle.flush()
    }

    /// Empty the stream, durably
    pub fn clear(&mut self) -> Result<()> {
        self.handle.truncate(0)?;
        self.handle.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.handle.flush()
    }

    pub fn close(&mut self) -> Result<()> {
        self.handle.close()
    }
}

/// State recovered at mount
#[derive(Debug)]
pub struct Recovery {
    pub snapshot: Snapshot,
    pub entries: Vec<WalEntry>,
    /// No prior state existed (or it was discarded)
    pub fresh: bool,
}

/// The pair of log slots of one mount
pub struct StateLog {
    slots: [LogFile; 2],
    active: usize,
    generation: u64,
}

impl StateLog {
    /// Recover from the two slots
    ///
    /// The valid snapshot with the highest generation wins; a torn tail on it
    /// is cut off. A mount is fresh only when both slots hold zero bytes.
    pub fn open(
        primary: LogFile,
        secondary: LogFile,
        policy: CorruptSnapshotPolicy,
    ) -> Result<(Self, Recovery)> {
        let mut slots = [primary, secondary];
        let mut parsed = Vec::with_capacity(2);
        for slot in slots.iter_mut() {
            parsed.push(parse_log(&slot.read_all()?));
        }

        // Pick the newest complete snapshot
        let mut best: Option<usize> = None;
        for (i, p) in parsed.iter().enumerate() {
            if let ParsedLog::Valid { snapshot, .. } = p {
                let newer = match best.map(|b| &parsed[b]) {
                    Some(ParsedLog::Valid { snapshot: current, .. }) => {
                        snapshot.generation > current.generation
                    }
                    _ => true,
                };
                if newer {
                    best = Some(i);
                }
            }
        }

        let Some(active) = best else {
            let all_empty = parsed.iter().all(|p| matches!(p, ParsedLog::Empty));
            if !all_empty {
                let reason = parsed
                    .iter()
                    .find_map(|p| match p {
                        ParsedLog::Corrupt(reason) => Some(reason.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                match policy {
                    CorruptSnapshotPolicy::Fail => {
                        return Err(FsError::CorruptSnapshot(reason));
                    }
                    CorruptSnapshotPolicy::Reset => {
                        warn!("Discarding corrupt snapshot ({}), starting empty", reason);
                    }
                }
            }
            return Self::start_fresh(slots);
        };

        let inactive = 1 - active;
        let ParsedLog::Valid {
            snapshot,
            entries,
            valid_len,
            torn,
        } = std::mem::replace(&mut parsed[active], ParsedLog::Empty)
        else {
            return Self::start_fresh(slots);
        };

        if torn {
            warn!(
                "Truncating torn tail of {} at byte {}",
                slots[active].name(),
                valid_len
            );
            slots[active].rollback(valid_len)?;
            slots[active].flush()?;
        }
        if !matches!(parsed[inactive], ParsedLog::Empty) {
            debug!("Clearing stale slot {}", slots[inactive].name());
            slots[inactive].clear()?;
        }

        info!(
            "Recovered snapshot generation {} from {} with {} log entries",
            snapshot.generation,
            slots[active].name(),
            entries.len()
        );
        let generation = snapshot.generation;
        Ok((
            StateLog {
                slots,
                active,
                generation,
            },
            Recovery {
                snapshot,
                entries,
                fresh: false,
            },
        ))
    }

    fn start_fresh(mut slots: [LogFile; 2]) -> Result<(Self, Recovery)> {
        let snapshot = Snapshot::empty();
        slots[1].clear()?;
        slots[0].rewrite(&snapshot)?;
        Ok((
            StateLog {
                slots,
                active: 0,
                generation: snapshot.generation,
            },
            Recovery {
                snapshot,
                entries: Vec::new(),
                fresh: true,
            },
        ))
    }

    /// Generation of the live snapshot
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Name of the live slot
    pub fn active_name(&self) -> &str {
        self.slots[self.active].name()
    }

    /// Bytes in the live slot
    pub fn size(&self) -> Result<u64> {
        self.slots[self.active].size()
    }

    pub fn append(&mut self, entry: &WalEntry) -> Result<u64> {
        self.slots[self.active].append(entry)
    }

    pub fn rollback(&mut self, offset: u64) -> Result<()> {
        self.slots[self.active].rollback(offset)
    }

    /// Write `root` and `pool` as the next snapshot and retire the old slot
    pub fn checkpoint(&mut self, root: SnapshotNode, pool: Vec<String>) -> Result<()> {
        let next = 1 - self.active;
        let snapshot = Snapshot {
            root,
            pool,
            generation: self.generation + 1,
        };

        // Step 1: new snapshot, durable, in the idle slot
        self.slots[next].rewrite(&snapshot)?;

        // Step 2: retire the old slot
        self.slots[self.active].clear()?;

        self.active = next;
        self.generation = snapshot.generation;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.slots[self.active].flush()
    }

    pub fn close(&mut self) -> Result<()> {
        for slot in self.slots.iter_mut() {
            slot.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::FILE_MODE;

    #[test]
    fn test_entry_wire_format() {
        let entry = WalEntry::Rename {
            old_path: "/a".into(),
            new_path: "/b".into(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"opp":"rename","args":["/a","/b"]}"#);

        let node = WalEntry::CreateFileNode {
            path: "/f".into(),
            node: SnapshotNode::File {
                last_modified: 5,
                mode: FILE_MODE,
                backing_filename: "p1".into(),
            },
        };
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["opp"], "createFileNode");
        assert_eq!(value["args"][1]["type"], "file");
        assert_eq!(value["args"][1]["backingFilename"], "p1");
    }

    #[test]
    fn test_mkdir_options_may_be_null() {
        let entry: WalEntry = serde_json::from_str(r#"{"opp":"mkdir","args":["/d",null]}"#).unwrap();
        assert_eq!(
            entry,
            WalEntry::Mkdir {
                path: "/d".into(),
                options: MkdirOptions::default()
            }
        );

        let entry: WalEntry =
            serde_json::from_str(r#"{"opp":"mkdir","args":["/d",{"recursive":true}]}"#).unwrap();
        assert!(matches!(entry, WalEntry::Mkdir { options, .. } if options.recursive));
    }

    #[test]
    fn test_unknown_opp_is_rejected() {
        assert!(serde_json::from_str::<WalEntry>(r#"{"opp":"link","args":["/a","/b"]}"#).is_err());
        assert!(serde_json::from_str::<WalEntry>(r#"{"opp":"unlink","args":[]}"#).is_err());
    }

    #[test]
    fn test_parse_log_torn_tail() {
        let snapshot = serde_json::to_string(&Snapshot::empty()).unwrap();
        let good = r#"{"opp":"createPoolFile","args":["p1"]}"#;
        let log = format!("{}\n{}\n{{\"opp\":\"unl", snapshot, good);

        match parse_log(log.as_bytes()) {
            ParsedLog::Valid {
                entries,
                valid_len,
                torn,
                ..
            } => {
                assert_eq!(entries.len(), 1);
                assert!(torn);
                assert_eq!(valid_len as usize, snapshot.len() + 1 + good.len());
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_parse_log_plain_snapshot() {
        // Logs without a generation field still load
        let log = br#"{"root":{"type":"directory","lastModified":1,"mode":16384,"children":{}},"pool":["a"]}"#;
        match parse_log(log) {
            ParsedLog::Valid {
                snapshot, torn, ..
            } => {
                assert_eq!(snapshot.generation, 0);
                assert_eq!(snapshot.pool, vec!["a".to_string()]);
                assert!(!torn);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
        assert!(matches!(parse_log(b""), ParsedLog::Empty));
        assert!(matches!(parse_log(b"garbage"), ParsedLog::Corrupt(_)));
    }
}
