//! Identifiers and positions shared by every module.

use sessiontxn_codec::{CodecError, CodecResult, Document};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Per-session transaction counter. Only ever moves forward.
pub type TxnNumber = i64;

/// Index of a write statement inside one transaction number.
pub type StmtId = i32;

/// Active transaction number of a session that has not seen one yet.
pub const UNINITIALIZED_TXN_NUMBER: TxnNumber = -1;

/// Statement id reserved for the dead-end sentinel of a truncated chain.
pub const INCOMPLETE_HISTORY_STMT_ID: StmtId = -1;

/// Term of a null [`OpTime`].
pub const UNINITIALIZED_TERM: i64 = -1;

/// Logical session identifier.
///
/// `id` is a random UUID chosen by the client; `uid` is the SHA-256 digest
/// of the authenticated user that owns the session. Immutable once built.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalSessionId {
    id: Uuid,
    uid: [u8; 32],
}

impl LogicalSessionId {
    /// Creates a fresh session id for `user`.
    #[must_use]
    pub fn new(user: &str) -> Self {
        Self::from_parts(Uuid::new_v4(), Self::user_digest(user))
    }

    /// Rebuilds a session id from its parts.
    #[must_use]
    pub const fn from_parts(id: Uuid, uid: [u8; 32]) -> Self {
        Self { id, uid }
    }

    /// SHA-256 digest of a user name, as stored in `uid`.
    #[must_use]
    pub fn user_digest(user: &str) -> [u8; 32] {
        Sha256::digest(user.as_bytes()).into()
    }

    /// The client-chosen UUID.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Digest of the owning user.
    #[must_use]
    pub const fn uid(&self) -> &[u8; 32] {
        &self.uid
    }

    /// `{ id: <16 bytes>, uid: <32 bytes> }`
    #[must_use]
    pub fn to_document(&self) -> Document {
        Document::new()
            .with("id", sessiontxn_codec::Value::Bytes(self.id.as_bytes().to_vec()))
            .with("uid", sessiontxn_codec::Value::Bytes(self.uid.to_vec()))
    }

    /// Parses the form written by [`LogicalSessionId::to_document`].
    ///
    /// # Errors
    ///
    /// Returns an error if either field is missing or has the wrong length.
    pub fn from_document(doc: &Document) -> CodecResult<Self> {
        let id = Uuid::from_slice(doc.require_bytes("id")?)
            .map_err(|e| CodecError::decoding_failed(format!("lsid.id: {e}")))?;
        let uid: [u8; 32] = doc
            .require_bytes("uid")?
            .try_into()
            .map_err(|_| CodecError::decoding_failed("lsid.uid must be 32 bytes"))?;
        Ok(Self { id, uid })
    }
}

impl fmt::Display for LogicalSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - ", self.id)?;
        for b in &self.uid[..4] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for LogicalSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalSessionId({self})")
    }
}

/// Position of an entry in the oplog.
///
/// Ordered by term first, then timestamp. The null optime sorts before every
/// real one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpTime {
    term: i64,
    timestamp: u64,
}

impl OpTime {
    /// Creates an optime.
    #[must_use]
    pub const fn new(timestamp: u64, term: i64) -> Self {
        Self { term, timestamp }
    }

    /// The null optime; marks "no previous write".
    #[must_use]
    pub const fn null() -> Self {
        Self {
            term: UNINITIALIZED_TERM,
            timestamp: 0,
        }
    }

    /// True for [`OpTime::null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.timestamp == 0 && self.term == UNINITIALIZED_TERM
    }

    /// Timestamp component.
    #[must_use]
    pub const fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Election term component.
    #[must_use]
    pub const fn term(&self) -> i64 {
        self.term
    }

    /// `{ ts, t }`
    #[must_use]
    pub fn to_document(&self) -> Document {
        Document::new()
            .with("ts", self.timestamp as i64)
            .with("t", self.term)
    }

    /// Parses `{ ts, t }`.
    ///
    /// # Errors
    ///
    /// Returns an error on missing fields or a negative timestamp.
    pub fn from_document(doc: &Document) -> CodecResult<Self> {
        let ts = doc.require_i64("ts")?;
        let timestamp = u64::try_from(ts)
            .map_err(|_| CodecError::decoding_failed(format!("negative timestamp {ts}")))?;
        Ok(Self::new(timestamp, doc.require_i64("t")?))
    }
}

impl Default for OpTime {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ts: {}, t: {} }}", self.timestamp, self.term)
    }
}

/// Wall-clock time of a write, in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct WallClockTime(i64);

impl WallClockTime {
    /// Current system time.
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        Self(millis)
    }

    /// Wraps a millisecond value.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the epoch.
    #[must_use]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for WallClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_optime_sorts_first() {
        assert!(OpTime::null() < OpTime::new(1, 0));
        assert!(OpTime::null().is_null());
        assert!(!OpTime::new(0, 0).is_null());
    }

    #[test]
    fn term_dominates_timestamp() {
        assert!(OpTime::new(100, 1) < OpTime::new(1, 2));
        assert!(OpTime::new(1, 2) < OpTime::new(2, 2));
    }

    #[test]
    fn same_user_same_uid() {
        let a = LogicalSessionId::new("alice");
        let b = LogicalSessionId::new("alice");
        assert_ne!(a, b);
        assert_eq!(a.uid(), b.uid());
        assert_ne!(a.uid(), LogicalSessionId::new("bob").uid());
    }

    #[test]
    fn lsid_document_form() {
        let lsid = LogicalSessionId::new("carol");
        let doc = lsid.to_document();
        assert_eq!(LogicalSessionId::from_document(&doc).unwrap(), lsid);

        let short = Document::new()
            .with("id", sessiontxn_codec::Value::Bytes(lsid.id().as_bytes().to_vec()))
            .with("uid", sessiontxn_codec::Value::Bytes(vec![1, 2, 3]));
        assert!(LogicalSessionId::from_document(&short).is_err());
    }

    #[test]
    fn optime_document_form() {
        let t = OpTime::new(42, 3);
        assert_eq!(OpTime::from_document(&t.to_document()).unwrap(), t);
        assert_eq!(t.to_string(), "{ ts: 42, t: 3 }");
    }
}
