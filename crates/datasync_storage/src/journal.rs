//! The write-ahead journal.
//!
//! Every committed write batch is appended as one frame:
//!
//! ```text
//! | magic (4) | version (2) | kind (1) | length (4) | payload (length) | crc32 (4) |
//! ```
//!
//! The payload is a CBOR-encoded [`JournalBatch`]; the CRC covers header and
//! payload. On open the frames are replayed in order. A trailing frame that
//! is incomplete or fails its checksum is a torn write and is cut off; a bad
//! frame followed by more data is corruption.

use datasync_model::{ModelSyncMetadata, MutationSyncMetadata};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::records::OutboxRecord;

/// Magic bytes identifying journal frames.
pub const JOURNAL_MAGIC: [u8; 4] = *b"DSJL";

/// Current frame format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4)
const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

/// Kind of a journal frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Incremental write batch.
    Batch = 1,
    /// Full snapshot written by compaction.
    Snapshot = 2,
}

impl FrameKind {
    fn from_byte(byte: u8) -> StorageResult<Self> {
        match byte {
            1 => Ok(FrameKind::Batch),
            2 => Ok(FrameKind::Snapshot),
            other => Err(StorageError::corrupted(format!("unknown frame kind {other}"))),
        }
    }
}

/// One logical change recorded in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalOp {
    /// Insert or replace a model row (JSON-encoded).
    PutModel {
        /// Model name.
        model: String,
        /// Row key.
        id: String,
        /// Model JSON.
        json: String,
    },
    /// Remove a model row.
    DeleteModel {
        /// Model name.
        model: String,
        /// Row key.
        id: String,
    },
    /// Insert or replace a sync metadata row.
    PutSyncMetadata(MutationSyncMetadata),
    /// Remove a sync metadata row.
    DeleteSyncMetadata {
        /// Metadata key (`model|id`).
        key: String,
    },
    /// Insert or replace an outbox row.
    PutOutbox(OutboxRecord),
    /// Remove an outbox row.
    DeleteOutbox {
        /// Outbox sequence.
        sequence: u64,
    },
    /// Insert or replace a per-model sync cursor.
    PutSyncState(ModelSyncMetadata),
    /// Drop every table.
    Clear,
}

/// The payload of one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JournalBatch {
    /// Changes, applied in order.
    pub ops: Vec<JournalOp>,
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let crc = data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    });
    !crc
}

/// Encodes a batch into a complete frame.
///
/// # Errors
///
/// Fails if CBOR encoding fails or the payload exceeds `u32::MAX` bytes.
pub fn encode_frame(kind: FrameKind, batch: &JournalBatch) -> StorageResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(batch, &mut payload)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::Serialization("journal frame too large".into()))?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    frame.extend_from_slice(&JOURNAL_MAGIC);
    frame.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    frame.push(kind as u8);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Result of scanning a journal.
#[derive(Debug, Default)]
pub struct Replay {
    /// Decoded frames in order.
    pub frames: Vec<(FrameKind, JournalBatch)>,
    /// Offset just past the last valid frame.
    pub valid_len: u64,
    /// Whether a torn trailing frame was found.
    pub torn: bool,
}

/// Scans raw journal bytes.
///
/// # Errors
///
/// Returns [`StorageError::Corrupted`] when a damaged frame is followed by
/// more data, or a frame carries the wrong magic or version.
pub fn scan(data: &[u8]) -> StorageResult<Replay> {
    let mut replay = Replay::default();
    let mut offset = 0usize;

    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < HEADER_SIZE {
            replay.torn = true;
            break;
        }
        if rest[0..4] != JOURNAL_MAGIC {
            return Err(StorageError::corrupted(format!("bad magic at offset {offset}")));
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version != JOURNAL_VERSION {
            return Err(StorageError::corrupted(format!(
                "unsupported journal version {version} at offset {offset}"
            )));
        }
        let kind = FrameKind::from_byte(rest[6])?;
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let frame_len = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < frame_len {
            replay.torn = true;
            break;
        }

        let body = &rest[..HEADER_SIZE + len];
        let stored = u32::from_le_bytes([
            rest[HEADER_SIZE + len],
            rest[HEADER_SIZE + len + 1],
            rest[HEADER_SIZE + len + 2],
            rest[HEADER_SIZE + len + 3],
        ]);
        if compute_crc32(body) != stored {
            if offset + frame_len == data.len() {
                replay.torn = true;
                break;
            }
            return Err(StorageError::corrupted(format!(
                "checksum mismatch at offset {offset}"
            )));
        }

        let batch: JournalBatch = ciborium::from_reader(&body[HEADER_SIZE..])
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        replay.frames.push((kind, batch));
        offset += frame_len;
        replay.valid_len = offset as u64;
    }

    Ok(replay)
}

/// The journal writer over a backend.
pub struct Journal {
    backend: Box<dyn StorageBackend>,
    sync_on_write: bool,
    frames_since_snapshot: usize,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("sync_on_write", &self.sync_on_write)
            .field("frames_since_snapshot", &self.frames_since_snapshot)
            .finish()
    }
}

impl Journal {
    /// Opens a journal, returning it with the batches to replay.
    ///
    /// A torn trailing frame is truncated away before returning.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or corruption.
    pub fn open(
        mut backend: Box<dyn StorageBackend>,
        sync_on_write: bool,
    ) -> StorageResult<(Self, Vec<JournalBatch>)> {
        let data = backend.read_all()?;
        let replay = scan(&data)?;
        if replay.torn {
            warn!(
                valid_len = replay.valid_len,
                size = data.len(),
                "discarding torn journal frame"
            );
            backend.truncate(replay.valid_len)?;
            backend.sync()?;
        }

        let frames_since_snapshot = replay
            .frames
            .iter()
            .rev()
            .take_while(|(kind, _)| *kind == FrameKind::Batch)
            .count();
        debug!(frames = replay.frames.len(), "journal replayed");

        let journal = Self {
            backend,
            sync_on_write,
            frames_since_snapshot,
        };
        Ok((journal, replay.frames.into_iter().map(|(_, b)| b).collect()))
    }

    /// Appends one committed batch.
    ///
    /// # Errors
    ///
    /// Fails on encoding or I/O errors; nothing is considered committed then.
    pub fn append(&mut self, batch: &JournalBatch) -> StorageResult<()> {
        if batch.ops.is_empty() {
            return Ok(());
        }
        let frame = encode_frame(FrameKind::Batch, batch)?;
        let offset = self.backend.append(&frame)?;
        if self.sync_on_write {
            if let Err(e) = self.backend.sync() {
                // Leave no half-acknowledged frame behind.
                let _ = self.backend.truncate(offset);
                return Err(e);
            }
        }
        self.frames_since_snapshot += 1;
        Ok(())
    }

    /// Batches appended since the last snapshot.
    pub fn frames_since_snapshot(&self) -> usize {
        self.frames_since_snapshot
    }

    /// Replaces the journal with a single snapshot frame.
    ///
    /// # Errors
    ///
    /// Fails on encoding or I/O errors; the old journal is kept then.
    pub fn compact(&mut self, snapshot: &JournalBatch) -> StorageResult<()> {
        let frame = encode_frame(FrameKind::Snapshot, snapshot)?;
        self.backend.replace(&frame)?;
        self.frames_since_snapshot = 0;
        debug!(bytes = frame.len(), "journal compacted");
        Ok(())
    }

    /// Current journal size in bytes.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot report its size.
    pub fn size(&self) -> StorageResult<u64> {
        self.backend.size()
    }
}
