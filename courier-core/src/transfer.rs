//! Transfer engine: chunked upload with P2P → relay fallback, and offset-based reassembly.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::chunk::{self, ChunkReader, ReceivedSet};
use crate::error::{CourierError, Result};
use crate::integrity;
use crate::protocol::{Chunk, DeliveryMode, FileId, FileMeta, Payload, Rank, Tag};
use crate::transport::Transport;

/// Everything an upload needs once the handshake approved it.
#[derive(Debug, Clone)]
pub struct UploadPlan {
    pub file_id: FileId,
    pub path: PathBuf,
    pub filename: String,
    pub from: String,
    pub to: String,
    pub target_rank: Rank,
    pub relay_rank: Rank,
    pub mode: DeliveryMode,
    pub chunk_size: u64,
    /// Pause between chunks; throttles the transport.
    pub chunk_delay: Duration,
}

impl UploadPlan {
    fn destination(&self, mode: DeliveryMode) -> Rank {
        match mode {
            DeliveryMode::P2p => self.target_rank,
            DeliveryMode::Relay => self.relay_rank,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Mode the successful attempt used.
    pub mode: DeliveryMode,
    pub chunks: u64,
    pub bytes: u64,
    /// The P2P attempt failed and the relay attempt delivered.
    pub fell_back: bool,
}

/// Send metadata then every chunk. A transport failure during a P2P attempt restarts the
/// whole transfer once through the relay; a failure while relaying is terminal.
pub fn upload(transport: &dyn Transport, plan: &UploadPlan) -> Result<UploadReport> {
    let digest = integrity::hash_file(&plan.path)?;
    let mut mode = plan.mode;
    match send_once(transport, plan, mode, digest) {
        Err(CourierError::Transport(e)) if mode == DeliveryMode::P2p => {
            warn!(
                "direct upload of {} to rank {} failed ({}); retrying through the relay",
                plan.filename, plan.target_rank, e
            );
            mode = DeliveryMode::Relay;
            let mut report = send_once(transport, plan, mode, digest)?;
            report.fell_back = true;
            Ok(report)
        }
        other => other,
    }
}

fn send_once(
    transport: &dyn Transport,
    plan: &UploadPlan,
    mode: DeliveryMode,
    digest: [u8; 32],
) -> Result<UploadReport> {
    let dest = plan.destination(mode);
    let reader = ChunkReader::open(&plan.path, plan.chunk_size)?;
    let total = reader.total();
    let size = reader.size();
    if total > chunk::MAX_CHUNKS {
        return Err(CourierError::Protocol(format!(
            "{} would take {} chunks of {} bytes, limit is {}",
            plan.filename,
            total,
            reader.chunk_size(),
            chunk::MAX_CHUNKS
        )));
    }
    let meta = FileMeta {
        file_id: plan.file_id,
        filename: plan.filename.clone(),
        size,
        from: plan.from.clone(),
        to: plan.to.clone(),
        chunk_size: reader.chunk_size(),
        digest,
    };
    info!(
        "sending {} ({} bytes, {} chunks) to {} via {} (rank {})",
        plan.filename, size, total, plan.to, mode, dest
    );
    transport.send(Payload::FileMeta(meta), dest, Tag::FileMeta)?;
    for item in reader {
        let (index, payload) = item?;
        let chunk = Chunk {
            file_id: plan.file_id,
            filename: plan.filename.clone(),
            index,
            total,
            payload,
            to: plan.to.clone(),
        };
        transport.send(Payload::FileChunk(chunk), dest, Tag::FileChunk)?;
        if index + 1 < total && !plan.chunk_delay.is_zero() {
            std::thread::sleep(plan.chunk_delay);
        }
    }
    Ok(UploadReport {
        mode,
        chunks: total,
        bytes: size,
        fell_back: false,
    })
}

/// Reduce a peer-supplied name to a single safe path component.
pub fn sanitize_filename(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    match cleaned.as_str() {
        "" | "." | ".." => "unnamed".to_string(),
        _ => cleaned,
    }
}

/// A finished, verified download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedDownload {
    pub file_id: FileId,
    pub filename: String,
    pub from: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    InProgress { received: u64, total: u64 },
    /// The last index arrived but earlier ones are still missing.
    AwaitingGaps { missing: u64 },
    Complete(CompletedDownload),
}

struct Download {
    meta: FileMeta,
    path: PathBuf,
    file: File,
    received: ReceivedSet,
    last_activity: Instant,
}

impl Download {
    /// Close and delete the partial file.
    fn discard(self, reason: &str) -> String {
        let Download { meta, path, file, .. } = self;
        drop(file);
        warn!("dropping partial download {} ({}): {}", path.display(), meta.file_id, reason);
        if let Err(e) = fs::remove_file(&path) {
            debug!("could not remove {}: {}", path.display(), e);
        }
        meta.filename
    }
}

/// Receiver side: one writer per in-progress transfer, keyed by file id.
pub struct Downloads {
    dir: PathBuf,
    active: HashMap<FileId, Download>,
}

impl Downloads {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            active: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn in_progress(&self) -> usize {
        self.active.len()
    }

    /// Start (or restart) receiving a file. Returns the destination path.
    ///
    /// A name already being written by another sender is refused. The same sender reusing a
    /// name under a new file id supersedes its earlier, unfinished transfer.
    pub fn on_meta(&mut self, meta: FileMeta) -> Result<PathBuf> {
        if meta.chunk_size == 0 || meta.chunk_size > chunk::MAX_CHUNK_SIZE {
            return Err(CourierError::Protocol(format!(
                "invalid chunk size {} for {}",
                meta.chunk_size, meta.filename
            )));
        }
        let total = chunk::chunk_count(meta.size, meta.chunk_size);
        let received = ReceivedSet::new(total).ok_or_else(|| {
            CourierError::Protocol(format!(
                "{} would take {} chunks, limit is {}",
                meta.filename,
                total,
                chunk::MAX_CHUNKS
            ))
        })?;
        let name = sanitize_filename(&meta.filename);
        let path = self.dir.join(&name);
        if self.active.remove(&meta.file_id).is_some() {
            info!("restarting download of {} ({})", name, meta.file_id);
        }
        let holder = self
            .active
            .iter()
            .find(|(_, d)| d.path == path)
            .map(|(id, d)| (*id, d.meta.from.clone()));
        if let Some((held_by, from)) = holder {
            if from != meta.from {
                return Err(CourierError::Protocol(format!(
                    "{} is already being received from {} ({})",
                    name, from, held_by
                )));
            }
            info!("{} resent {} as {}; dropping {}", from, name, meta.file_id, held_by);
            self.active.remove(&held_by);
        }
        fs::create_dir_all(&self.dir)?;
        let file = File::create(&path)?;
        info!(
            "incoming file {} ({} bytes, {} chunks) from {}",
            name, meta.size, total, meta.from
        );
        self.active.insert(
            meta.file_id,
            Download {
                meta,
                path: path.clone(),
                file,
                received,
                last_activity: Instant::now(),
            },
        );
        Ok(path)
    }

    /// Drop unfinished downloads whose sender fails `online`. Returns their file names.
    pub fn retain_senders(&mut self, online: impl Fn(&str) -> bool) -> Vec<String> {
        let gone: Vec<FileId> = self
            .active
            .iter()
            .filter(|(_, d)| !online(&d.meta.from))
            .map(|(id, _)| *id)
            .collect();
        self.discard_all(gone, "sender went offline")
    }

    /// Drop unfinished downloads that saw no metadata or chunk for `max_idle`.
    pub fn expire_idle(&mut self, max_idle: Duration) -> Vec<String> {
        let stale: Vec<FileId> = self
            .active
            .iter()
            .filter(|(_, d)| d.last_activity.elapsed() >= max_idle)
            .map(|(id, _)| *id)
            .collect();
        self.discard_all(stale, "no data received")
    }

    fn discard_all(&mut self, ids: Vec<FileId>, reason: &str) -> Vec<String> {
        ids.into_iter()
            .filter_map(|id| self.active.remove(&id))
            .map(|d| d.discard(reason))
            .collect()
    }

    /// Write one chunk at its offset. Completion needs every index, not just the last one.
    pub fn on_chunk(&mut self, chunk: Chunk) -> Result<ChunkOutcome> {
        let download = self.active.get_mut(&chunk.file_id).ok_or_else(|| {
            CourierError::Protocol(format!(
                "chunk {} of {} for unknown transfer {}",
                chunk.index, chunk.filename, chunk.file_id
            ))
        })?;
        let total = download.received.total();
        if chunk.total != total || chunk.index >= total {
            return Err(CourierError::Protocol(format!(
                "chunk {}/{} does not fit {} ({} chunks)",
                chunk.index, chunk.total, download.meta.filename, total
            )));
        }
        let expected = chunk::expected_len(download.meta.size, download.meta.chunk_size, chunk.index);
        if chunk.payload.len() as u64 != expected {
            return Err(CourierError::Protocol(format!(
                "chunk {} of {} has {} bytes, expected {}",
                chunk.index,
                download.meta.filename,
                chunk.payload.len(),
                expected
            )));
        }
        download.last_activity = Instant::now();
        if download.received.contains(chunk.index) {
            debug!("duplicate chunk {} of {}", chunk.index, download.meta.filename);
        } else {
            let offset = chunk.index * download.meta.chunk_size;
            download.file.seek(SeekFrom::Start(offset))?;
            download.file.write_all(&chunk.payload)?;
            download.received.mark(chunk.index);
        }

        if download.received.is_complete() {
            return self.finish(chunk.file_id).map(ChunkOutcome::Complete);
        }
        if chunk.is_last() {
            let missing = download.received.missing();
            warn!(
                "last chunk of {} arrived with {} chunk(s) missing",
                download.meta.filename, missing
            );
            return Ok(ChunkOutcome::AwaitingGaps { missing });
        }
        Ok(ChunkOutcome::InProgress {
            received: download.received.received(),
            total,
        })
    }

    fn finish(&mut self, file_id: FileId) -> Result<CompletedDownload> {
        let Some(mut download) = self.active.remove(&file_id) else {
            return Err(CourierError::Protocol(format!("unknown transfer {}", file_id)));
        };
        download.file.flush()?;
        download.file.sync_all()?;
        drop(download.file);
        if !integrity::verify_file(&download.path, &download.meta.digest)? {
            warn!(
                "checksum mismatch for {} (expected {}); discarding",
                download.path.display(),
                integrity::short_hex(&download.meta.digest)
            );
            fs::remove_file(&download.path)?;
            return Err(CourierError::Integrity(download.meta.filename));
        }
        info!(
            "download of {} complete ({} bytes)",
            download.path.display(),
            download.meta.size
        );
        Ok(CompletedDownload {
            file_id,
            filename: download.meta.filename,
            from: download.meta.from,
            path: download.path,
            size: download.meta.size,
        })
    }
}
