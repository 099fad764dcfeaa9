//! Disk-backed batch buffer.
//!
//! Batches that exhausted their retries are written to sequence-numbered
//! segment files (`{seq}.buf`) so they survive a restart. Each file holds
//! one batch framed as a u32 little-endian payload length followed by the
//! JSON-encoded items. The directory is capped by total bytes; when the cap
//! is reached the oldest segments are evicted first and counted as dropped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::telemetry::TelemetryItem;

const SEGMENT_EXTENSION: &str = "buf";
const FRAME_HEADER_LEN: u64 = 4;

pub struct DiskBuffer {
    dir: PathBuf,
    max_bytes: u64,
    next_seq: u64,
    dropped_batches: u64,
    corrupt_segments: u64,
}

impl DiskBuffer {
    /// Open (creating if needed) the buffer directory and resume the
    /// sequence counter after any segments left by a previous run.
    pub fn open(dir: impl Into<PathBuf>, max_bytes: u64) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let next_seq = segments(&dir)?
            .last()
            .map(|s| s.seq + 1)
            .unwrap_or(0);
        Ok(Self {
            dir,
            max_bytes,
            next_seq,
            dropped_batches: 0,
            corrupt_segments: 0,
        })
    }

    /// Persist one batch and enforce the byte cap. Returns how many older
    /// batches were evicted to make room.
    pub fn store(&mut self, batch: &[TelemetryItem]) -> io::Result<u64> {
        let payload = serde_json::to_vec(batch)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut frame = Vec::with_capacity(payload.len() + FRAME_HEADER_LEN as usize);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);

        let path = self.segment_path(self.next_seq);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &frame)?;
        fs::rename(&tmp, &path)?;
        self.next_seq += 1;
        debug!(path = %path.display(), items = batch.len(), "batch buffered to disk");

        self.enforce_cap()
    }

    /// Read the oldest intact batch without removing it. Corrupt segments
    /// are deleted on the way and counted.
    pub fn peek_oldest(&mut self) -> io::Result<Option<(PathBuf, Vec<TelemetryItem>)>> {
        for segment in segments(&self.dir)? {
            match read_segment(&segment.path) {
                Ok(batch) => return Ok(Some((segment.path, batch))),
                Err(e) => {
                    warn!(
                        path = %segment.path.display(),
                        error = %e,
                        "removing corrupt buffer segment"
                    );
                    self.corrupt_segments += 1;
                    fs::remove_file(&segment.path)?;
                }
            }
        }
        Ok(None)
    }

    /// Acknowledge a replayed batch by deleting its segment.
    pub fn remove(&mut self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    pub fn segment_count(&self) -> io::Result<usize> {
        Ok(segments(&self.dir)?.len())
    }

    pub fn total_bytes(&self) -> io::Result<u64> {
        Ok(segments(&self.dir)?.iter().map(|s| s.size).sum())
    }

    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches
    }

    pub fn corrupt_segments(&self) -> u64 {
        self.corrupt_segments
    }

    fn segment_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{seq:020}.{SEGMENT_EXTENSION}"))
    }

    fn enforce_cap(&mut self) -> io::Result<u64> {
        let mut entries = segments(&self.dir)?;
        let mut total: u64 = entries.iter().map(|s| s.size).sum();
        let mut evict = entries.drain(..);
        let mut evicted = 0u64;
        while total > self.max_bytes {
            // never evict down to nothing: the newest segment stays even
            // if it alone exceeds the cap
            let Some(oldest) = evict.next() else { break };
            if evict.len() == 0 {
                break;
            }
            fs::remove_file(&oldest.path)?;
            total = total.saturating_sub(oldest.size);
            evicted += 1;
            warn!(
                path = %oldest.path.display(),
                "buffer over capacity, evicted oldest segment"
            );
        }
        self.dropped_batches += evicted;
        Ok(evicted)
    }
}

struct Segment {
    seq: u64,
    path: PathBuf,
    size: u64,
}

/// Segments sorted oldest first. Non-segment files are ignored.
fn segments(dir: &Path) -> io::Result<Vec<Segment>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }
        let Some(seq) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        else {
            continue;
        };
        out.push(Segment {
            seq,
            path,
            size: entry.metadata()?.len(),
        });
    }
    out.sort_by_key(|s| s.seq);
    Ok(out)
}

fn read_segment(path: &Path) -> io::Result<Vec<TelemetryItem>> {
    let bytes = fs::read(path)?;
    if bytes.len() < FRAME_HEADER_LEN as usize {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "segment shorter than frame header",
        ));
    }
    let declared = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let payload = &bytes[FRAME_HEADER_LEN as usize..];
    if payload.len() != declared {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "frame length mismatch: header says {declared}, payload is {}",
                payload.len()
            ),
        ));
    }
    serde_json::from_slice(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{LogRecord, MetricSample};

    fn batch(tag: &str) -> Vec<TelemetryItem> {
        vec![
            TelemetryItem::Metric(MetricSample::gauge(format!("m.{tag}"), 1.0, 1000)),
            TelemetryItem::Log(LogRecord::new(format!("log {tag}"), 1000)),
        ]
    }

    #[test]
    fn store_and_replay_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = DiskBuffer::open(dir.path(), 1024 * 1024).unwrap();

        buffer.store(&batch("one")).unwrap();
        buffer.store(&batch("two")).unwrap();
        assert_eq!(buffer.segment_count().unwrap(), 2);

        let (path, items) = buffer.peek_oldest().unwrap().unwrap();
        assert_eq!(items, batch("one"));
        buffer.remove(&path).unwrap();

        let (path, items) = buffer.peek_oldest().unwrap().unwrap();
        assert_eq!(items, batch("two"));
        buffer.remove(&path).unwrap();
        assert!(buffer.peek_oldest().unwrap().is_none());
    }

    #[test]
    fn batches_survive_reopen_in_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut buffer = DiskBuffer::open(dir.path(), 1024 * 1024).unwrap();
            buffer.store(&batch("first")).unwrap();
            buffer.store(&batch("second")).unwrap();
        }

        let mut reopened = DiskBuffer::open(dir.path(), 1024 * 1024).unwrap();
        let (_, items) = reopened.peek_oldest().unwrap().unwrap();
        assert_eq!(items, batch("first"));

        // new writes continue the sequence after the survivors
        reopened.store(&batch("third")).unwrap();
        assert_eq!(reopened.segment_count().unwrap(), 3);
    }

    #[test]
    fn cap_evicts_oldest_first() {
        let probe_dir = tempfile::tempdir().unwrap();
        let mut probe = DiskBuffer::open(probe_dir.path(), u64::MAX).unwrap();
        probe.store(&batch("a")).unwrap();
        let one_batch = probe.total_bytes().unwrap();

        // cap that holds exactly two batches (all test batches are the
        // same size), then store three
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = DiskBuffer::open(dir.path(), 2 * one_batch).unwrap();
        assert_eq!(buffer.store(&batch("a")).unwrap(), 0);
        assert_eq!(buffer.store(&batch("b")).unwrap(), 0);
        // the third store reports the eviction it forced
        assert_eq!(buffer.store(&batch("c")).unwrap(), 1);

        assert_eq!(buffer.dropped_batches(), 1);
        assert!(buffer.total_bytes().unwrap() <= 2 * one_batch);
        let (_, items) = buffer.peek_oldest().unwrap().unwrap();
        assert_eq!(items, batch("b"));
    }

    #[test]
    fn newest_segment_survives_even_when_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = DiskBuffer::open(dir.path(), 8).unwrap();
        buffer.store(&batch("big")).unwrap();
        assert_eq!(buffer.segment_count().unwrap(), 1);
        assert_eq!(buffer.dropped_batches(), 0);
    }

    #[test]
    fn corrupt_segment_is_skipped_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = DiskBuffer::open(dir.path(), 1024 * 1024).unwrap();
        buffer.store(&batch("good")).unwrap();

        // a torn write: header promises more bytes than follow
        let torn = dir.path().join(format!("{:020}.buf", 9999));
        fs::write(&torn, [200u8, 0, 0, 0, b'x']).unwrap();

        let (_, items) = buffer.peek_oldest().unwrap().unwrap();
        assert_eq!(items, batch("good"));
        assert_eq!(buffer.corrupt_segments(), 0);

        // remove the good one; the torn segment is then hit and dropped
        let (path, _) = buffer.peek_oldest().unwrap().unwrap();
        buffer.remove(&path).unwrap();
        assert!(buffer.peek_oldest().unwrap().is_none());
        assert_eq!(buffer.corrupt_segments(), 1);
    }

    #[test]
    fn non_segment_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        let mut buffer = DiskBuffer::open(dir.path(), 1024).unwrap();
        assert!(buffer.peek_oldest().unwrap().is_none());
        assert_eq!(buffer.segment_count().unwrap(), 0);
    }
}
