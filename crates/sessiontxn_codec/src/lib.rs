//! # sessiontxn codec
//!
//! Ordered documents and their CBOR encoding.
//!
//! Oplog entries and session transaction records are stored as
//! [`Document`]s: ordered `field -> Value` lists, where field order is
//! preserved exactly as built. Documents are serialised with `serde` into
//! CBOR through `ciborium`.
//!
//! Floats are not representable; nothing in the transaction bookkeeping
//! needs them and rejecting them keeps encodings comparable byte-for-byte.
//!
//! ```
//! use sessiontxn_codec::{decode_document, encode_document, Document};
//!
//! let doc = Document::new().with("txnNum", 5).with("ns", "config.transactions");
//! let bytes = encode_document(&doc).unwrap();
//! assert_eq!(decode_document(&bytes).unwrap(), doc);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod document;
mod error;
mod serde_impl;

pub use document::{Document, Value};
pub use error::{CodecError, CodecResult};

/// Encodes a value to CBOR bytes.
///
/// # Errors
///
/// Returns [`CodecError::EncodingFailed`] if the serializer fails.
pub fn to_cbor(value: &Value) -> CodecResult<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(value, &mut buffer)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buffer)
}

/// Decodes a value from CBOR bytes.
///
/// # Errors
///
/// Returns [`CodecError::DecodingFailed`] on malformed input, floats, or
/// maps with non-text keys.
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
}

/// Encodes a document to CBOR bytes.
///
/// # Errors
///
/// See [`to_cbor`].
pub fn encode_document(doc: &Document) -> CodecResult<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(doc, &mut buffer)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buffer)
}

/// Decodes a document from CBOR bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not a CBOR map with text keys.
pub fn decode_document(bytes: &[u8]) -> CodecResult<Document> {
    match from_cbor(bytes)? {
        Value::Document(doc) => Ok(doc),
        other => Err(CodecError::decoding_failed(format!(
            "expected a document, found {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_document_roundtrip() {
        let doc = Document::new()
            .with(
                "o",
                Document::new().with("applyOps", vec![Value::from(1), Value::from("x")]),
            )
            .with("b", true)
            .with("id", Value::Bytes(vec![0xde, 0xad]))
            .with("prev", Value::Null)
            .with("neg", -42);
        let bytes = encode_document(&doc).unwrap();
        assert_eq!(decode_document(&bytes).unwrap(), doc);
    }

    #[test]
    fn field_order_is_preserved() {
        let doc = Document::new().with("z", 1).with("a", 2);
        let decoded = decode_document(&encode_document(&doc).unwrap()).unwrap();
        let keys: Vec<&str> = decoded.keys().collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[test]
    fn non_document_top_level_is_rejected() {
        let bytes = to_cbor(&Value::Int(7)).unwrap();
        assert!(matches!(
            decode_document(&bytes),
            Err(CodecError::DecodingFailed { .. })
        ));
    }

    #[test]
    fn floats_are_rejected() {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&1.5f64, &mut bytes).unwrap();
        assert!(from_cbor(&bytes).is_err());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let doc = Document::new().with("txnNum", 9);
        let bytes = encode_document(&doc).unwrap();
        assert!(decode_document(&bytes[..bytes.len() - 1]).is_err());
    }
}
