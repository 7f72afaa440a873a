use crate::config::{DurabilityMode, RecoveryMode};
use crate::error::CoordError;
use crate::store::MetaStore;
use crate::store::frame::{FrameError, FrameReader, FrameWriter, LogOp};
use crate::tso::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

pub const LOG_FILE_NAME: &str = "functions.log";

#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    key: String,
    #[serde(with = "serde_bytes")]
    value: Vec<u8>,
}

#[derive(Debug, Clone)]
struct IndexedValue {
    ts: Timestamp,
    value: Vec<u8>,
}

struct LogState {
    writer: FrameWriter<File>,
    index: BTreeMap<String, IndexedValue>,
    log_bytes: u64,
    max_ts: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStats {
    pub live_entries: usize,
    pub log_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    pub live_entries: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// File-backed metadata store: an append-only log of checksummed put/delete
/// frames plus an in-memory index rebuilt by replaying the log on open.
pub struct LogMetaStore {
    dir: PathBuf,
    path: PathBuf,
    durability: DurabilityMode,
    state: Mutex<LogState>,
}

struct ReplayedLog {
    index: BTreeMap<String, IndexedValue>,
    valid_len: u64,
    frames: usize,
    max_ts: Timestamp,
}

impl LogMetaStore {
    pub fn open(
        dir: &Path,
        durability: DurabilityMode,
        recovery: RecoveryMode,
    ) -> Result<Self, CoordError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let replayed = replay_log(&path, recovery)?;
        let file_len = file.metadata()?.len();
        if replayed.valid_len < file_len {
            warn!(
                path = %path.display(),
                valid_len = replayed.valid_len,
                file_len,
                "truncating unreadable metadata log tail"
            );
            file.set_len(replayed.valid_len)?;
            file.sync_all()?;
        }
        info!(
            path = %path.display(),
            frames = replayed.frames,
            live_entries = replayed.index.len(),
            "metadata log opened"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            path,
            durability,
            state: Mutex::new(LogState {
                writer: FrameWriter::new(file),
                index: replayed.index,
                log_bytes: replayed.valid_len,
                max_ts: replayed.max_ts,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> LogStats {
        let state = self.state.lock();
        LogStats {
            live_entries: state.index.len(),
            log_bytes: state.log_bytes,
        }
    }

    /// Rewrites the log with one put frame per live key, followed by a mark
    /// frame holding the high water mark, and atomically replaces the old
    /// file.
    pub fn compact(&self) -> Result<CompactionReport, CoordError> {
        let mut state = self.state.lock();
        let bytes_before = state.log_bytes;

        let tmp = NamedTempFile::new_in(&self.dir)?;
        let mut writer = FrameWriter::new(tmp);
        let mut bytes_after = 0u64;
        for (key, entry) in &state.index {
            let payload = encode_entry(key, &entry.value)?;
            let written = writer
                .append(entry.ts, LogOp::Put, &payload)
                .map_err(frame_to_store)?;
            bytes_after += written as u64;
        }
        if state.max_ts > 0 {
            let written = writer
                .append(state.max_ts, LogOp::Mark, &[])
                .map_err(frame_to_store)?;
            bytes_after += written as u64;
        }
        let mut tmp = writer.into_inner();
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| CoordError::Io(e.error))?;
        fsync_dir(&self.dir)?;

        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        state.writer = FrameWriter::new(file);
        state.log_bytes = bytes_after;
        let report = CompactionReport {
            live_entries: state.index.len(),
            bytes_before,
            bytes_after,
        };
        info!(
            live_entries = report.live_entries,
            bytes_before, bytes_after, "metadata log compacted"
        );
        Ok(report)
    }

    fn append(
        &self,
        state: &mut LogState,
        ts: Timestamp,
        op: LogOp,
        payload: &[u8],
    ) -> Result<(), CoordError> {
        let appended = state
            .writer
            .append(ts, op, payload)
            .map_err(frame_to_store)
            .and_then(|written| {
                let file = state.writer.get_mut();
                file.flush()?;
                if self.durability == DurabilityMode::Full {
                    file.sync_data()?;
                }
                Ok(written)
            });
        match appended {
            Ok(written) => {
                state.log_bytes += written as u64;
                state.max_ts = state.max_ts.max(ts);
                Ok(())
            }
            Err(err) => {
                // Drop whatever part of the frame reached the file.
                if let Err(trunc_err) = state.writer.get_mut().set_len(state.log_bytes) {
                    warn!(error = %trunc_err, "failed to roll back partial metadata frame");
                }
                Err(match err {
                    CoordError::Io(e) => CoordError::Store(e.to_string()),
                    other => other,
                })
            }
        }
    }
}

impl MetaStore for LogMetaStore {
    fn put_if_absent(&self, key: &str, value: &[u8], ts: Timestamp) -> Result<bool, CoordError> {
        let mut state = self.state.lock();
        if state.index.contains_key(key) {
            return Ok(false);
        }
        let payload = encode_entry(key, value)?;
        self.append(&mut state, ts, LogOp::Put, &payload)?;
        state.index.insert(
            key.to_string(),
            IndexedValue {
                ts,
                value: value.to_vec(),
            },
        );
        Ok(true)
    }

    fn delete(&self, key: &str, ts: Timestamp) -> Result<bool, CoordError> {
        let mut state = self.state.lock();
        if !state.index.contains_key(key) {
            return Ok(false);
        }
        let payload = encode_entry(key, &[])?;
        self.append(&mut state, ts, LogOp::Delete, &payload)?;
        state.index.remove(key);
        Ok(true)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordError> {
        Ok(self
            .state
            .lock()
            .index
            .get(key)
            .map(|entry| entry.value.clone()))
    }

    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, CoordError> {
        Ok(self
            .state
            .lock()
            .index
            .iter()
            .map(|(k, entry)| (k.clone(), entry.value.clone()))
            .collect())
    }

    fn high_water_mark(&self) -> Result<Timestamp, CoordError> {
        Ok(self.state.lock().max_ts)
    }
}

fn replay_log(path: &Path, recovery: RecoveryMode) -> Result<ReplayedLog, CoordError> {
    let file = File::open(path)?;
    let mut reader = FrameReader::new(BufReader::with_capacity(64 * 1024, file));
    let mut index = BTreeMap::new();
    let mut valid_len = 0u64;
    let mut frames = 0usize;
    let mut max_ts: Timestamp = 0;
    loop {
        match reader.next_frame() {
            Ok(Some(frame)) if frame.op == LogOp::Mark => {
                max_ts = max_ts.max(frame.ts);
                valid_len += frame.encoded_len() as u64;
                frames += 1;
            }
            Ok(Some(frame)) => {
                let entry: LogEntry = match rmp_serde::from_slice(&frame.payload) {
                    Ok(entry) => entry,
                    Err(e) if recovery == RecoveryMode::Strict => {
                        return Err(CoordError::Decode(format!(
                            "metadata log entry at offset {valid_len}: {e}"
                        )));
                    }
                    Err(e) => {
                        warn!(offset = valid_len, error = %e, "stopping replay at undecodable entry");
                        break;
                    }
                };
                match frame.op {
                    LogOp::Put => {
                        index.insert(
                            entry.key,
                            IndexedValue {
                                ts: frame.ts,
                                value: entry.value,
                            },
                        );
                    }
                    LogOp::Delete => {
                        index.remove(&entry.key);
                    }
                    LogOp::Mark => {}
                }
                max_ts = max_ts.max(frame.ts);
                valid_len += frame.encoded_len() as u64;
                frames += 1;
            }
            Ok(None) => break,
            Err(FrameError::Truncation) => break,
            Err(FrameError::Corruption) => {
                if recovery == RecoveryMode::Strict {
                    return Err(CoordError::IntegrityError {
                        message: format!(
                            "metadata log frame corruption at offset {valid_len} in {}",
                            path.display()
                        ),
                    });
                }
                warn!(offset = valid_len, "stopping replay at corrupt metadata frame");
                break;
            }
            Err(FrameError::Io(e)) => return Err(CoordError::Io(std::io::Error::other(e))),
        }
    }
    Ok(ReplayedLog {
        index,
        valid_len,
        frames,
        max_ts,
    })
}

fn encode_entry(key: &str, value: &[u8]) -> Result<Vec<u8>, CoordError> {
    rmp_serde::to_vec(&LogEntry {
        key: key.to_string(),
        value: value.to_vec(),
    })
    .map_err(|e| CoordError::Encode(e.to_string()))
}

fn frame_to_store(err: FrameError) -> CoordError {
    CoordError::Store(err.to_string())
}

fn fsync_dir(dir: &Path) -> Result<(), CoordError> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
