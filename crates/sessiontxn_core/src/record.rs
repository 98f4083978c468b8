//! Checksummed record framing shared by the oplog and the transaction table.
//!
//! Every record on disk is laid out as:
//!
//! ```text
//! | magic (4) | version (2) | kind (1) | len (4) | payload (len) | crc32 (4) |
//! ```
//!
//! The checksum covers everything before it. A record cut short at the end of
//! the file is a torn write and is dropped on recovery; a checksum or magic
//! mismatch anywhere is corruption.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use sessiontxn_storage::{StorageBackend, StorageResult};
use tracing::{debug, warn};

/// Record format version.
pub(crate) const RECORD_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4)
const HEADER_SIZE: usize = 11;

const CRC_SIZE: usize = 4;

/// A decoded record and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FramedRecord {
    pub offset: u64,
    pub kind: u8,
    pub payload: Vec<u8>,
}

/// Append-only log of framed records over a storage backend.
pub(crate) struct RecordLog {
    name: &'static str,
    magic: [u8; 4],
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_append: bool,
}

impl RecordLog {
    pub(crate) fn new(
        name: &'static str,
        magic: [u8; 4],
        backend: Box<dyn StorageBackend>,
        sync_on_append: bool,
    ) -> Self {
        Self {
            name,
            magic,
            backend: Mutex::new(backend),
            sync_on_append,
        }
    }

    fn corruption(&self, message: impl Into<String>) -> CoreError {
        CoreError::LogCorruption {
            log: self.name,
            message: message.into(),
        }
    }

    fn encode(&self, kind: u8, payload: &[u8]) -> CoreResult<Vec<u8>> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            CoreError::invalid_operation(format!(
                "{} record of {} bytes exceeds the 4-byte length field",
                self.name,
                payload.len()
            ))
        })?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(&self.magic);
        buf.extend_from_slice(&RECORD_VERSION.to_le_bytes());
        buf.push(kind);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(payload);
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Appends one record, returning its offset.
    pub(crate) fn append(&self, kind: u8, payload: &[u8]) -> CoreResult<u64> {
        let offsets = self.append_batch(&[(kind, payload.to_vec())])?;
        offsets
            .first()
            .copied()
            .ok_or_else(|| self.corruption("append produced no offset"))
    }

    /// Appends records back to back under one lock and one flush.
    ///
    /// If any append or the flush fails, the log is cut back to where the
    /// batch started so no part of it is left behind.
    pub(crate) fn append_batch(&self, records: &[(u8, Vec<u8>)]) -> CoreResult<Vec<u64>> {
        let mut encoded = Vec::with_capacity(records.len());
        for (kind, payload) in records {
            encoded.push(self.encode(*kind, payload)?);
        }

        let mut backend = self.backend.lock();
        let start = backend.size()?;
        match write_all(&mut **backend, &encoded, self.sync_on_append) {
            Ok(offsets) => Ok(offsets),
            Err(e) => {
                if let Err(cut) = backend.truncate(start) {
                    warn!(
                        log = self.name,
                        offset = start,
                        error = %cut,
                        "could not cut back a failed append"
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Reads the record starting at `offset`.
    pub(crate) fn read_at(&self, offset: u64) -> CoreResult<FramedRecord> {
        let backend = self.backend.lock();
        let header = backend.read_at(offset, HEADER_SIZE)?;
        let (kind, len) = self.parse_header(&header, offset)?;
        let rest = backend.read_at(offset + HEADER_SIZE as u64, len + CRC_SIZE)?;
        let payload = self.verify(&header, &rest, len)?;
        Ok(FramedRecord {
            offset,
            kind,
            payload,
        })
    }

    /// Scans the whole log from the start.
    ///
    /// A partial record at the tail is cut off so later appends start on a
    /// record boundary.
    pub(crate) fn recover(&self) -> CoreResult<Vec<FramedRecord>> {
        let mut backend = self.backend.lock();
        let size = backend.size()?;
        let size_usize = usize::try_from(size)
            .map_err(|_| self.corruption(format!("log of {size} bytes cannot be mapped")))?;
        let data = if size == 0 {
            Vec::new()
        } else {
            backend.read_at(0, size_usize)?
        };

        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos < data.len() {
            let remaining = data.len() - pos;
            if remaining < HEADER_SIZE {
                break;
            }
            let header = &data[pos..pos + HEADER_SIZE];
            let (kind, len) = self.parse_header(header, pos as u64)?;
            if remaining < HEADER_SIZE + len + CRC_SIZE {
                break;
            }
            let rest = &data[pos + HEADER_SIZE..pos + HEADER_SIZE + len + CRC_SIZE];
            let payload = self.verify(header, rest, len)?;
            records.push(FramedRecord {
                offset: pos as u64,
                kind,
                payload,
            });
            pos += HEADER_SIZE + len + CRC_SIZE;
        }

        if pos < data.len() {
            warn!(
                log = self.name,
                offset = pos,
                dropped = data.len() - pos,
                "discarding torn record at end of log"
            );
            backend.truncate(pos as u64)?;
        }
        debug!(log = self.name, records = records.len(), "recovered log");
        Ok(records)
    }

    /// Current size in bytes.
    pub(crate) fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    fn parse_header(&self, header: &[u8], offset: u64) -> CoreResult<(u8, usize)> {
        if header[0..4] != self.magic {
            return Err(self.corruption(format!("bad magic at offset {offset}")));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != RECORD_VERSION {
            return Err(CoreError::invalid_format(format!(
                "{} record at offset {offset} has version {version}, expected {RECORD_VERSION}",
                self.name
            )));
        }
        let kind = header[6];
        let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        Ok((kind, len))
    }

    fn verify(&self, header: &[u8], rest: &[u8], len: usize) -> CoreResult<Vec<u8>> {
        let payload = &rest[..len];
        let stored = u32::from_le_bytes([rest[len], rest[len + 1], rest[len + 2], rest[len + 3]]);
        let mut covered = Vec::with_capacity(HEADER_SIZE + len);
        covered.extend_from_slice(header);
        covered.extend_from_slice(payload);
        let actual = compute_crc32(&covered);
        if actual != stored {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }
        Ok(payload.to_vec())
    }
}

fn write_all(
    backend: &mut dyn StorageBackend,
    encoded: &[Vec<u8>],
    flush: bool,
) -> StorageResult<Vec<u64>> {
    let mut offsets = Vec::with_capacity(encoded.len());
    for buf in encoded {
        offsets.push(backend.append(buf)?);
    }
    if flush {
        backend.flush()?;
    }
    Ok(offsets)
}

/// Computes CRC32 checksum for data (IEEE polynomial).
pub(crate) fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessiontxn_storage::{InMemoryBackend, StorageError};

    /// Accepts `appends_left` appends, then fails.
    struct ShortBackend {
        inner: InMemoryBackend,
        appends_left: usize,
    }

    impl StorageBackend for ShortBackend {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.inner.read_at(offset, len)
        }

        fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
            if self.appends_left == 0 {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            self.appends_left -= 1;
            self.inner.append(data)
        }

        fn flush(&mut self) -> StorageResult<()> {
            Ok(())
        }

        fn size(&self) -> StorageResult<u64> {
            self.inner.size()
        }

        fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
            self.inner.truncate(new_size)
        }
    }

    fn log_over(backend: &InMemoryBackend) -> RecordLog {
        RecordLog::new("test", *b"TEST", Box::new(backend.clone()), false)
    }

    #[test]
    fn crc_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn append_then_read() {
        let backend = InMemoryBackend::new();
        let log = log_over(&backend);
        let a = log.append(1, b"alpha").unwrap();
        let b = log.append(2, b"beta").unwrap();
        assert_eq!(a, 0);

        let rec = log.read_at(b).unwrap();
        assert_eq!(rec.kind, 2);
        assert_eq!(rec.payload, b"beta");

        let all = log.recover().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].payload, b"alpha");
    }

    #[test]
    fn torn_tail_is_dropped() {
        let backend = InMemoryBackend::new();
        let log = log_over(&backend);
        log.append(1, b"kept").unwrap();
        let good_size = log.size().unwrap();
        log.append(1, b"torn away").unwrap();

        let mut bytes = backend.data();
        bytes.truncate(bytes.len() - 3);
        let torn = InMemoryBackend::with_data(bytes);
        let reopened = log_over(&torn);

        let records = reopened.recover().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(reopened.size().unwrap(), good_size);
    }

    #[test]
    fn flipped_byte_is_corruption() {
        let backend = InMemoryBackend::new();
        let log = log_over(&backend);
        log.append(1, b"payload").unwrap();

        let mut bytes = backend.data();
        bytes[HEADER_SIZE + 2] ^= 0xFF;
        let damaged = log_over(&InMemoryBackend::with_data(bytes));
        assert!(matches!(
            damaged.recover(),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn wrong_magic_is_corruption() {
        let backend = InMemoryBackend::new();
        log_over(&backend).append(1, b"x").unwrap();
        let other = RecordLog::new("other", *b"OTHR", Box::new(backend.clone()), false);
        let err = other.recover().unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn failed_batch_is_cut_back() {
        let backend = InMemoryBackend::new();
        let short = ShortBackend {
            inner: backend.clone(),
            appends_left: 2,
        };
        let log = RecordLog::new("test", *b"TEST", Box::new(short), false);
        log.append(1, b"kept").unwrap();
        let good_size = log.size().unwrap();

        let batch = vec![(1, b"first".to_vec()), (1, b"second".to_vec())];
        assert!(matches!(
            log.append_batch(&batch),
            Err(CoreError::Storage(StorageError::Io(_)))
        ));
        assert_eq!(log.size().unwrap(), good_size);
        assert_eq!(log_over(&backend).recover().unwrap().len(), 1);
    }
}
