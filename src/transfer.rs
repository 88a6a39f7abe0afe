//! Chunked file transfer over the data channel.
//!
//! Sender side: [`OutgoingFile`] is cut into [`CHUNK_SIZE`] pieces and framed as
//! `file_start`, N x `file_chunk`, `file_end`.
//!
//! Receiver side: [`Reassembler`] stores chunks at their declared index and
//! hands back the whole file once every slot is filled. `file_end` is only
//! logged, so a late or lost end frame never blocks delivery.

use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;

use crate::error::ProtocolError;
use crate::protocol::Frame;

pub const CHUNK_SIZE: usize = 16 * 1024;

/// Largest `fileSize` a peer may announce. Files are held in memory until
/// complete.
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Unfinished transfers accepted at once from one peer.
pub const MAX_IN_FLIGHT: usize = 8;

pub const DEFAULT_MIME: &str = "application/octet-stream";

pub fn total_chunks(size: u64) -> usize {
    size.div_ceil(CHUNK_SIZE as u64) as usize
}

/// Percentage reported after chunk `index` (0-based) of `total` went out.
pub fn progress_percent(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (((index + 1) as f64 / total as f64) * 100.0).round() as u8
}

/// A file reconstructed from the peer's frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub mime: String,
    pub data: Bytes,
    pub transfer_id: Option<String>,
}

impl ReceivedFile {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A file queued for sending.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub mime: String,
    pub data: Bytes,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let mime = mime.into();
        Self {
            name: name.into(),
            mime: if mime.is_empty() { DEFAULT_MIME.to_string() } else { mime },
            data: data.into(),
        }
    }

    /// Read a file from disk. The name is the path's final component.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self::new(name, DEFAULT_MIME, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn total_chunks(&self) -> usize {
        total_chunks(self.size())
    }

    pub fn start_frame(&self, transfer_id: &str, timestamp: i64) -> Frame {
        Frame::FileStart {
            file_name: self.name.clone(),
            file_size: self.size(),
            file_type: self.mime.clone(),
            timestamp,
            transfer_id: Some(transfer_id.to_string()),
        }
    }

    pub fn chunk_frame(&self, index: usize, transfer_id: &str) -> Frame {
        let offset = index * CHUNK_SIZE;
        let end = (offset + CHUNK_SIZE).min(self.data.len());
        Frame::FileChunk {
            data: self.data[offset..end].to_vec(),
            offset: offset as u64,
            chunk_index: index as u32,
            is_last: index + 1 == self.total_chunks(),
            transfer_id: Some(transfer_id.to_string()),
        }
    }

    pub fn end_frame(&self, transfer_id: &str, timestamp: i64) -> Frame {
        Frame::FileEnd {
            file_name: self.name.clone(),
            timestamp,
            transfer_id: Some(transfer_id.to_string()),
        }
    }
}

/// Frames that carry `transferId` are keyed by it. Frames from peers that do
/// not send one are keyed by file name, and their chunks go to the oldest such
/// assembly, so only one legacy transfer can be in flight at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum AssemblyKey {
    Transfer(String),
    Legacy(String),
}

struct Assembly {
    name: String,
    mime: String,
    transfer_id: Option<String>,
    slots: Vec<Option<Vec<u8>>>,
    received: usize,
    seq: u64,
}

impl Assembly {
    fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }

    fn finish(self) -> ReceivedFile {
        let size = self.slots.iter().flatten().map(Vec::len).sum();
        let mut data = Vec::with_capacity(size);
        for chunk in self.slots.into_iter().flatten() {
            data.extend_from_slice(&chunk);
        }
        ReceivedFile {
            name: self.name,
            mime: self.mime,
            data: Bytes::from(data),
            transfer_id: self.transfer_id,
        }
    }
}

pub struct Reassembler {
    assemblies: HashMap<AssemblyKey, Assembly>,
    next_seq: u64,
    max_file_size: u64,
    max_in_flight: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::with_limits(MAX_FILE_SIZE, MAX_IN_FLIGHT)
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_file_size: u64, max_in_flight: usize) -> Self {
        Self {
            assemblies: HashMap::new(),
            next_seq: 0,
            max_file_size,
            max_in_flight,
        }
    }

    /// Number of transfers still waiting for chunks.
    pub fn in_flight(&self) -> usize {
        self.assemblies.len()
    }

    /// Route a file frame. Message frames are not ours and yield `None`.
    /// A `file_start` over the limits is refused and nothing is allocated.
    pub fn accept(&mut self, frame: Frame) -> Result<Option<ReceivedFile>, ProtocolError> {
        let file = match frame {
            Frame::FileStart {
                file_name,
                file_size,
                file_type,
                transfer_id,
                ..
            } => return self.on_start(file_name, file_size, file_type, transfer_id),
            Frame::FileChunk {
                data,
                chunk_index,
                is_last,
                transfer_id,
                ..
            } => self.on_chunk(chunk_index as usize, data, is_last, transfer_id.as_deref()),
            Frame::FileEnd {
                file_name,
                transfer_id,
                ..
            } => {
                self.on_end(&file_name, transfer_id.as_deref());
                None
            }
            Frame::Message { .. } => None,
        };
        Ok(file)
    }

    /// Begin an assembly. An assembly with the same key is replaced. A
    /// zero-byte file has no chunks and completes right here.
    pub fn on_start(
        &mut self,
        name: String,
        size: u64,
        mime: String,
        transfer_id: Option<String>,
    ) -> Result<Option<ReceivedFile>, ProtocolError> {
        if size > self.max_file_size {
            return Err(ProtocolError::FileTooLarge {
                name,
                size,
                limit: self.max_file_size,
            });
        }
        let key = match &transfer_id {
            Some(id) => AssemblyKey::Transfer(id.clone()),
            None => AssemblyKey::Legacy(name.clone()),
        };
        // A restart under a known key replaces, so it never counts.
        if !self.assemblies.contains_key(&key) && self.assemblies.len() >= self.max_in_flight {
            return Err(ProtocolError::TooManyTransfers(self.max_in_flight));
        }

        let total = total_chunks(size);
        log::info!("Receiving file {name} ({size} bytes, {total} chunks)");

        let assembly = Assembly {
            name,
            mime: if mime.is_empty() { DEFAULT_MIME.to_string() } else { mime },
            transfer_id,
            slots: vec![None; total],
            received: 0,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        if assembly.is_complete() {
            self.assemblies.remove(&key);
            return Ok(Some(assembly.finish()));
        }
        if self.assemblies.insert(key, assembly).is_some() {
            log::debug!("Replaced an unfinished assembly with the same key");
        }
        Ok(None)
    }

    /// Store one chunk. Returns the file when this chunk filled the last slot.
    pub fn on_chunk(
        &mut self,
        index: usize,
        data: Vec<u8>,
        is_last: bool,
        transfer_id: Option<&str>,
    ) -> Option<ReceivedFile> {
        let Some(key) = self.resolve(transfer_id) else {
            log::warn!("Dropping chunk {index}: no matching transfer in progress");
            return None;
        };
        let assembly = self.assemblies.get_mut(&key)?;

        let Some(slot) = assembly.slots.get_mut(index) else {
            log::warn!(
                "Dropping chunk {index} of {}: only {} chunks expected",
                assembly.name,
                assembly.slots.len()
            );
            return None;
        };
        if slot.replace(data).is_none() {
            assembly.received += 1;
        }
        if is_last {
            log::debug!("Last chunk of {} arrived", assembly.name);
        }

        if !assembly.is_complete() {
            return None;
        }
        let file = self.assemblies.remove(&key).map(Assembly::finish)?;
        log::info!("File {} received ({} bytes)", file.name, file.data.len());
        Some(file)
    }

    pub fn on_end(&mut self, name: &str, transfer_id: Option<&str>) {
        log::debug!("End of file {name} (transfer {transfer_id:?})");
    }

    pub fn clear(&mut self) {
        if !self.assemblies.is_empty() {
            log::debug!("Discarding {} unfinished transfers", self.assemblies.len());
        }
        self.assemblies.clear();
    }

    fn resolve(&self, transfer_id: Option<&str>) -> Option<AssemblyKey> {
        match transfer_id {
            Some(id) => {
                let key = AssemblyKey::Transfer(id.to_string());
                self.assemblies.contains_key(&key).then_some(key)
            }
            None => self
                .assemblies
                .iter()
                .filter(|(k, _)| matches!(k, AssemblyKey::Legacy(_)))
                .min_by_key(|(_, a)| a.seq)
                .map(|(k, _)| k.clone()),
        }
    }
}
