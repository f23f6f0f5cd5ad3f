use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{info, warn};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde_json::Value;

/// Binary snapshot file format constants
const SNAPSHOT_MAGIC: &[u8; 4] = b"LSNP";
const SNAPSHOT_VERSION: u8 = 1;

/// Flag bits
const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Header size: magic(4) + version(1) + flags(1) + payload_len(4) = 10 bytes
const HEADER_SIZE: usize = 10;
/// CRC32 size
const CRC_SIZE: usize = 4;

/// Minimum payload size in bytes before LZ4 compression is applied
const COMPRESSION_THRESHOLD: usize = 512;

/// Store keeping the latest snapshot blob per topic.
///
/// Snapshots always live in memory; when a data directory is configured,
/// each write is also persisted to `<dir>/<topic>.snap` so topic state
/// survives process restarts. A corrupt or unreadable file is treated as
/// "no snapshot" rather than an error, since the event log remains the
/// source of truth.
pub struct SnapshotStore {
    memory: Mutex<HashMap<String, Value>>,
    dir: Option<PathBuf>,
}

impl SnapshotStore {
    /// Create a purely in-memory store (no persistence).
    pub fn in_memory() -> Self {
        SnapshotStore {
            memory: Mutex::new(HashMap::new()),
            dir: None,
        }
    }

    /// Create a store that persists snapshots under the given directory.
    pub fn with_dir<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!("Snapshot persistence enabled, directory: {}", dir.display());
        Ok(SnapshotStore {
            memory: Mutex::new(HashMap::new()),
            dir: Some(dir),
        })
    }

    /// Store the latest snapshot for a topic.
    pub fn save(&self, name: &str, snapshot: &Value) -> io::Result<()> {
        if let Ok(mut memory) = self.memory.lock() {
            memory.insert(name.to_string(), snapshot.clone());
        }
        if let Some(ref dir) = self.dir {
            write_snapshot_file(&snapshot_path(dir, name), snapshot)?;
        }
        Ok(())
    }

    /// Load the latest snapshot for a topic, if any.
    pub fn load(&self, name: &str) -> Option<Value> {
        if let Ok(memory) = self.memory.lock() {
            if let Some(snapshot) = memory.get(name) {
                return Some(snapshot.clone());
            }
        }
        let dir = self.dir.as_ref()?;
        let path = snapshot_path(dir, name);
        if !path.exists() {
            return None;
        }
        match read_snapshot_file(&path) {
            Ok(snapshot) => {
                if let Ok(mut memory) = self.memory.lock() {
                    memory.insert(name.to_string(), snapshot.clone());
                }
                Some(snapshot)
            }
            Err(e) => {
                warn!("Discarding unreadable snapshot {}: {}", path.display(), e);
                None
            }
        }
    }
}

fn snapshot_path(dir: &Path, name: &str) -> PathBuf {
    // Topic ids are caller-defined strings; keep the file name safe.
    let safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    dir.join(format!("{}.snap", safe))
}

/// Encode a snapshot to the binary file format.
fn encode(snapshot: &Value) -> io::Result<Vec<u8>> {
    let json = serde_json::to_vec(snapshot)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let (payload, flags) = if json.len() >= COMPRESSION_THRESHOLD {
        let compressed = compress_prepend_size(&json);
        if compressed.len() < json.len() {
            (compressed, FLAG_COMPRESSED)
        } else {
            (json, 0)
        }
    } else {
        (json, 0)
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    buf.extend_from_slice(SNAPSHOT_MAGIC);
    buf.push(SNAPSHOT_VERSION);
    buf.push(flags);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);

    // CRC32 over everything before the CRC itself
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());

    Ok(buf)
}

/// Decode a snapshot from the binary file format.
fn decode(data: &[u8]) -> io::Result<Value> {
    if data.len() < HEADER_SIZE + CRC_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Snapshot too short"));
    }
    if &data[0..4] != SNAPSHOT_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Invalid magic"));
    }
    let version = data[4];
    if version != SNAPSHOT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Unsupported snapshot version: {}", version),
        ));
    }
    let flags = data[5];
    let payload_len = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
    let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
    if data.len() < total_len {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Snapshot truncated"));
    }

    let stored_crc = u32::from_le_bytes([
        data[total_len - 4],
        data[total_len - 3],
        data[total_len - 2],
        data[total_len - 1],
    ]);
    let actual_crc = crc32fast::hash(&data[..total_len - CRC_SIZE]);
    if stored_crc != actual_crc {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "CRC mismatch"));
    }

    let payload = &data[HEADER_SIZE..HEADER_SIZE + payload_len];
    let json = if flags & FLAG_COMPRESSED != 0 {
        decompress_size_prepended(payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
    } else {
        payload.to_vec()
    };

    serde_json::from_slice(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_snapshot_file(path: &Path, snapshot: &Value) -> io::Result<()> {
    let encoded = encode(snapshot)?;
    // Write to a temp file and rename so readers never see a partial file.
    let tmp = path.with_extension("snap.tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(&encoded)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}

fn read_snapshot_file(path: &Path) -> io::Result<Value> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    decode(&data)
}
