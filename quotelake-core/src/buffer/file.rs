//! File-backed durable buffer.
//!
//! Layout: `{dir}/{stream}/shard-{n}.jsonl`
//!
//! Records are distributed round-robin across shards. Each shard is guarded
//! by its own mutex, so concurrent appends to different shards never
//! contend. A record is acknowledged only after `sync_data` returns.
//!
//! A failed append is truncated away before the error is returned, and an
//! unterminated tail left by a crash is cut back to the last complete line
//! before the next append, so an acknowledged record never shares a line
//! with torn bytes.

use super::{Ack, BufferError, BufferSource, DurableBuffer};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct FileBuffer {
    stream_dir: PathBuf,
    shards: Vec<Mutex<()>>,
    next: AtomicUsize,
}

/// Per-shard line counts and byte sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct BufferStats {
    pub shards: Vec<ShardStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ShardStats {
    pub shard: usize,
    pub records: usize,
    pub bytes: u64,
}

impl BufferStats {
    pub fn total_records(&self) -> usize {
        self.shards.iter().map(|s| s.records).sum()
    }
}

impl FileBuffer {
    pub fn open(
        dir: impl AsRef<Path>,
        stream_name: &str,
        shard_count: usize,
    ) -> Result<Self, BufferError> {
        if shard_count == 0 {
            return Err(BufferError::Rejected("shard count must be positive".into()));
        }
        let stream_dir = dir.as_ref().join(stream_name);
        fs::create_dir_all(&stream_dir)?;

        Ok(Self {
            stream_dir,
            shards: (0..shard_count).map(|_| Mutex::new(())).collect(),
            next: AtomicUsize::new(0),
        })
    }

    pub fn stream_dir(&self) -> &Path {
        &self.stream_dir
    }

    fn shard_path(&self, shard: usize) -> PathBuf {
        self.stream_dir.join(format!("shard-{shard}.jsonl"))
    }

    /// Shard files present on disk, in shard order.
    fn shard_files(&self) -> Result<Vec<(usize, PathBuf)>, BufferError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.stream_dir)? {
            let path = entry?.path();
            let shard = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("shard-"))
                .and_then(|n| n.strip_suffix(".jsonl"))
                .and_then(|n| n.parse::<usize>().ok());
            if let Some(shard) = shard {
                files.push((shard, path));
            }
        }
        files.sort_by_key(|(shard, _)| *shard);
        Ok(files)
    }

    pub fn stats(&self) -> Result<BufferStats, BufferError> {
        let mut stats = BufferStats::default();
        for (shard, path) in self.shard_files()? {
            let content = fs::read_to_string(&path)?;
            stats.shards.push(ShardStats {
                shard,
                records: content.lines().filter(|l| !l.trim().is_empty()).count(),
                bytes: content.len() as u64,
            });
        }
        Ok(stats)
    }
}

impl DurableBuffer for FileBuffer {
    fn put_record(&self, data: &[u8]) -> Result<Ack, BufferError> {
        match data.iter().position(|&b| b == b'\n') {
            Some(pos) if pos == data.len() - 1 => {}
            Some(_) => return Err(BufferError::Rejected("record spans multiple lines".into())),
            None => return Err(BufferError::Rejected("record is not newline-terminated".into())),
        }

        let shard = self.next.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        let _guard = self.shards[shard]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let path = self.shard_path(shard);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let offset = truncate_torn_tail(&mut file, &path)?;
        if let Err(e) = file.write_all(data).and_then(|()| file.sync_data()) {
            if let Err(undo) = file.set_len(offset) {
                tracing::error!(shard, error = %undo, "failed to truncate partial append");
            }
            return Err(e.into());
        }

        Ok(Ack {
            record_id: format!("{shard}-{offset}"),
            shard,
        })
    }
}

/// Cut an unterminated trailing line back to the last newline. Returns the
/// offset the next record starts at.
fn truncate_torn_tail(file: &mut File, path: &Path) -> io::Result<u64> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(len);
    }

    file.seek(SeekFrom::Start(0))?;
    let mut content = Vec::with_capacity(len as usize);
    file.read_to_end(&mut content)?;
    let keep = content
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos as u64 + 1);
    tracing::warn!(
        path = %path.display(),
        torn_bytes = len - keep,
        "truncating unterminated buffer tail"
    );
    file.set_len(keep)?;
    file.sync_data()?;
    Ok(keep)
}

impl BufferSource for FileBuffer {
    fn read_lines(&self) -> Result<Vec<String>, BufferError> {
        let mut lines = Vec::new();
        for (_, path) in self.shard_files()? {
            let content = fs::read_to_string(&path)?;
            lines.extend(
                content
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(str::to_string),
            );
        }
        Ok(lines)
    }
}
