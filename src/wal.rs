//! Append-only write-ahead log.
//!
//! One record per line: `<sha256 of json>\t<json>\n`. Every append is followed
//! by `sync_all` before the caller proceeds. On replay, an incomplete final
//! line (no newline, so never acknowledged) is reported for truncation; any
//! other undecodable record stops recovery.

use crate::error::{GuardError, GuardResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Upper bound on one encoded record.
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalOp {
    Begin,
    Commit,
    Rollback,
}

impl WalOp {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Commit | Self::Rollback)
    }
}

/// One framed WAL record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub op: WalOp,
    pub tx_id: String,
    pub payload_hash: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl WalEntry {
    pub fn new(op: WalOp, tx_id: impl Into<String>, payload_hash: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            op,
            tx_id: tx_id.into(),
            payload_hash: payload_hash.into(),
            timestamp,
        }
    }
}

/// A decoded record and where it sits in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub offset: u64,
    pub raw: String,
    pub entry: WalEntry,
}

/// Result of replaying a WAL file.
#[derive(Debug, Default)]
pub struct WalReplay {
    pub records: Vec<WalRecord>,
    /// Offset the torn tail was cut at, if there was one.
    pub truncated_at: Option<u64>,
}

fn checksum(json: &str) -> String {
    hex::encode(Sha256::digest(json.as_bytes()))
}

/// Encode `entry` as one complete WAL line, newline included.
pub fn encode_line(entry: &WalEntry) -> GuardResult<String> {
    let json = serde_json::to_string(entry)?;
    Ok(format!("{}\t{}\n", checksum(&json), json))
}

/// Decode one line without its trailing newline.
pub fn decode_line(content: &str) -> Result<WalEntry, String> {
    let (sum, json) = content
        .split_once('\t')
        .ok_or_else(|| "missing checksum separator".to_string())?;
    if sum != checksum(json) {
        return Err("checksum mismatch".to_string());
    }
    let entry: WalEntry = serde_json::from_str(json).map_err(|e| format!("bad record: {e}"))?;
    if entry.tx_id.is_empty() {
        return Err("empty tx_id".to_string());
    }
    Ok(entry)
}

/// Durability barrier for directory entries (create, rename, unlink).
pub(crate) fn sync_dir(dir: &Path) -> GuardResult<()> {
    #[cfg(unix)]
    {
        File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| GuardError::io(dir, e))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Read every record of the WAL at `path`. A torn tail is reported in
/// [`WalReplay::truncated_at`] but left on disk; see [`truncate_tail`].
pub fn replay(path: &Path) -> GuardResult<WalReplay> {
    let file = File::open(path).map_err(|e| GuardError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut replay = WalReplay::default();
    let mut offset: u64 = 0;

    loop {
        let mut buf = Vec::new();
        let read = (&mut reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_until(b'\n', &mut buf)
            .map_err(|e| GuardError::io(path, e))?;
        if read == 0 {
            break;
        }
        let complete = buf.last() == Some(&b'\n');
        let corrupt = |reason: String, buf: &[u8]| GuardError::WalCorrupt {
            path: path.to_path_buf(),
            offset,
            raw: String::from_utf8_lossy(buf).into_owned(),
            reason,
        };

        if !complete {
            if buf.len() > MAX_LINE_LEN {
                return Err(corrupt(
                    format!("record exceeds {MAX_LINE_LEN} bytes"),
                    &buf[..128.min(buf.len())],
                ));
            }
            replay.truncated_at = Some(offset);
            break;
        }

        let line = String::from_utf8(buf[..buf.len() - 1].to_vec())
            .map_err(|e| corrupt(format!("not valid UTF-8: {e}"), &buf))?;
        let entry = decode_line(&line).map_err(|reason| corrupt(reason, &buf))?;
        replay.records.push(WalRecord {
            offset,
            raw: line,
            entry,
        });
        offset += read as u64;
    }
    Ok(replay)
}

/// Cut the log at `path` back to `offset`, dropping a torn final record.
pub fn truncate_tail(path: &Path, offset: u64) -> GuardResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| GuardError::io(path, e))?;
    let len = file.metadata().map_err(|e| GuardError::io(path, e))?.len();
    tracing::warn!(
        path = %path.display(),
        offset,
        bytes = len.saturating_sub(offset),
        "truncating torn tail from write-ahead log"
    );
    file.set_len(offset).map_err(|e| GuardError::io(path, e))?;
    file.sync_all().map_err(|e| GuardError::io(path, e))?;
    Ok(())
}

/// Handle on the open WAL file.
#[derive(Debug)]
pub struct WriteAheadLog {
    path: PathBuf,
    file: File,
    len: u64,
}

impl WriteAheadLog {
    /// Create an empty WAL. Fails if one already exists.
    pub fn create(path: &Path) -> GuardResult<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(path)
            .map_err(|e| GuardError::io(path, e))?;
        file.sync_all().map_err(|e| GuardError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len: 0,
        })
    }

    /// Open an existing WAL for appending. Call after [`replay`].
    pub fn open(path: &Path) -> GuardResult<Self> {
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| GuardError::io(path, e))?;
        let len = file.metadata().map_err(|e| GuardError::io(path, e))?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
        })
    }

    /// Open `path` for appending, creating an empty log if there is none.
    pub fn open_or_create(path: &Path) -> GuardResult<Self> {
        if path.exists() {
            return Self::open(path);
        }
        let log = Self::create(path)?;
        if let Some(dir) = path.parent() {
            sync_dir(dir)?;
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the log in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one record and wait for it to reach disk.
    pub fn append(&mut self, entry: &WalEntry) -> GuardResult<()> {
        let line = encode_line(entry)?;
        self.file
            .write_all(line.as_bytes())
            .map_err(|e| GuardError::io(&self.path, e))?;
        self.file.sync_all().map_err(|e| GuardError::io(&self.path, e))?;
        self.len += line.len() as u64;
        Ok(())
    }

    /// Append `entries` with a single sync at the end.
    pub fn append_all(&mut self, entries: &[WalEntry]) -> GuardResult<()> {
        let mut body = String::new();
        for entry in entries {
            body.push_str(&encode_line(entry)?);
        }
        self.file
            .write_all(body.as_bytes())
            .map_err(|e| GuardError::io(&self.path, e))?;
        self.file.sync_all().map_err(|e| GuardError::io(&self.path, e))?;
        self.len += body.len() as u64;
        Ok(())
    }

    /// Replace the log with `records`, via temp file and atomic rename.
    pub fn rewrite<'a, I>(&mut self, records: I) -> GuardResult<()>
    where
        I: IntoIterator<Item = &'a WalEntry>,
    {
        let temp = self.path.with_extension("log.compact.tmp");
        let mut body = String::new();
        for entry in records {
            body.push_str(&encode_line(entry)?);
        }
        {
            let mut file = File::create(&temp).map_err(|e| GuardError::io(&temp, e))?;
            file.write_all(body.as_bytes())
                .map_err(|e| GuardError::io(&temp, e))?;
            file.sync_all().map_err(|e| GuardError::io(&temp, e))?;
        }
        fs::rename(&temp, &self.path).map_err(|e| GuardError::io(&self.path, e))?;
        if let Some(dir) = self.path.parent() {
            sync_dir(dir)?;
        }
        *self = Self::open(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_tampered_json() {
        let line = encode_line(&WalEntry::new(WalOp::Begin, "tx-1", "abc")).unwrap();
        let tampered = line.trim_end().replace("tx-1", "tx-2");
        assert!(decode_line(&tampered).unwrap_err().contains("checksum"));
    }

    #[test]
    fn decode_accepts_own_encoding() {
        let entry = WalEntry::new(WalOp::Rollback, "tx-9", "ff");
        let line = encode_line(&entry).unwrap();
        assert_eq!(decode_line(line.trim_end()).unwrap(), entry);
    }

    #[test]
    fn replay_reports_torn_tail_without_touching_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let whole = encode_line(&WalEntry::new(WalOp::Begin, "tx-1", "aa")).unwrap();
        let torn = encode_line(&WalEntry::new(WalOp::Commit, "tx-1", "aa")).unwrap();
        fs::write(&path, format!("{whole}{}", &torn[..10])).unwrap();
        let before = fs::read(&path).unwrap();

        let replayed = replay(&path).unwrap();
        assert_eq!(replayed.records.len(), 1);
        assert_eq!(replayed.truncated_at, Some(whole.len() as u64));
        assert_eq!(fs::read(&path).unwrap(), before);

        truncate_tail(&path, whole.len() as u64).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), whole);
    }

    #[test]
    fn terminal_ops() {
        assert!(!WalOp::Begin.is_terminal());
        assert!(WalOp::Commit.is_terminal());
        assert!(WalOp::Rollback.is_terminal());
    }
}
