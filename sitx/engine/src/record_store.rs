//! Durable storage of transaction records.
//!
//! The registry is authoritative in memory but writes every record through
//! to a [`TxnRecordStore`] so that transaction state survives the caches.
//! Records are framed as `[u32 len][u32 crc32][postcard payload]`
//! (little-endian); a checksum mismatch on load surfaces as
//! [`RegistryError::CorruptRecord`] rather than silently resurrecting a
//! half-written record.

use crc32fast::Hasher;
use crossbeam_skiplist::SkipMap;
use sitx_txn::timestamp::TxnId;
use sitx_txn::transaction::TxnRecord;

use crate::config::Durability;
use crate::error::RegistryError;

const HEADER_SIZE: usize = 8; // 4 bytes length + 4 bytes crc32

fn encode(record: &TxnRecord) -> Result<Vec<u8>, RegistryError> {
    let payload = postcard::to_allocvec(record)
        .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn decode(id: TxnId, frame: &[u8]) -> Result<TxnRecord, RegistryError> {
    if frame.len() < HEADER_SIZE {
        return Err(RegistryError::CorruptRecord(id));
    }
    let len = u32::from_le_bytes(frame[0..4].try_into().expect("4-byte slice")) as usize;
    let crc = u32::from_le_bytes(frame[4..8].try_into().expect("4-byte slice"));
    let payload = &frame[HEADER_SIZE..];
    if payload.len() != len {
        return Err(RegistryError::CorruptRecord(id));
    }
    let mut hasher = Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != crc {
        return Err(RegistryError::CorruptRecord(id));
    }
    postcard::from_bytes(payload).map_err(|_| RegistryError::CorruptRecord(id))
}

/// Authoritative storage for transaction records.
///
/// `save` must be atomic per record; the registry serializes writers of the
/// same record through its stripe locks.
pub trait TxnRecordStore: Send + Sync {
    fn load(&self, id: TxnId) -> Result<Option<TxnRecord>, RegistryError>;

    fn save(&self, record: &TxnRecord, durability: Durability) -> Result<(), RegistryError>;
}

/// In-memory [`TxnRecordStore`] holding encoded frames, so the full codec
/// path is exercised even in tests.
pub struct MemRecordStore {
    records: SkipMap<TxnId, Vec<u8>>,
}

impl Default for MemRecordStore {
    fn default() -> Self {
        Self {
            records: SkipMap::new(),
        }
    }
}

impl MemRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored frame with garbage. Test hook for the corruption
    /// path.
    #[doc(hidden)]
    pub fn corrupt(&self, id: TxnId) {
        if let Some(entry) = self.records.get(&id) {
            let mut frame = entry.value().clone();
            if let Some(byte) = frame.last_mut() {
                *byte ^= 0xff;
            }
            self.records.insert(id, frame);
        }
    }
}

impl TxnRecordStore for MemRecordStore {
    fn load(&self, id: TxnId) -> Result<Option<TxnRecord>, RegistryError> {
        self.records
            .get(&id)
            .map(|entry| decode(id, entry.value()))
            .transpose()
    }

    fn save(&self, record: &TxnRecord, _durability: Durability) -> Result<(), RegistryError> {
        // The in-memory store is durable the moment the frame is inserted;
        // None/Async/Sync collapse to the same write.
        let frame = encode(record)?;
        self.records.insert(record.id, frame);
        Ok(())
    }
}
