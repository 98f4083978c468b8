//! Document and value types.

use crate::error::{CodecError, CodecResult};
use std::fmt;

/// A single document value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// Byte string.
    Bytes(Vec<u8>),
    /// UTF-8 text.
    Text(String),
    /// Array of values.
    Array(Vec<Value>),
    /// Nested document.
    Document(Document),
}

impl Value {
    /// Short name of the variant, used in error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Bytes(_) => "bytes",
            Value::Text(_) => "text",
            Value::Array(_) => "array",
            Value::Document(_) => "document",
        }
    }

    /// Returns the integer, if this is one.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the boolean, if this is one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the text, if this is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the bytes, if this is a byte string.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the elements, if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the nested document, if this is one.
    #[must_use]
    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Document(doc)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

/// An ordered list of named fields.
///
/// Field order is whatever order the fields were added in. Setting a field
/// that already exists replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Document::insert`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Sets `key`, replacing an existing value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(index).1)
    }

    /// Looks up a field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// True if the field exists.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Name of the first field; a command document's command name.
    #[must_use]
    pub fn first_key(&self) -> Option<&str> {
        self.fields.first().map(|(k, _)| k.as_str())
    }

    /// Field names in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    /// Fields in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the document has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Required field of any type.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingField`] if absent.
    pub fn require(&self, key: &str) -> CodecResult<&Value> {
        self.get(key).ok_or_else(|| CodecError::missing_field(key))
    }

    /// Required integer field.
    ///
    /// # Errors
    ///
    /// Returns an error if the field is absent or not an integer.
    pub fn require_i64(&self, key: &str) -> CodecResult<i64> {
        let value = self.require(key)?;
        value.as_i64().ok_or_else(|| mistyped(key, "int", value))
    }

    /// Required text field.
    ///
    /// # Errors
    ///
    /// Returns an error if the field is absent or not text.
    pub fn require_text(&self, key: &str) -> CodecResult<&str> {
        let value = self.require(key)?;
        value.as_text().ok_or_else(|| mistyped(key, "text", value))
    }

    /// Required byte-string field.
    ///
    /// # Errors
    ///
    /// Returns an error if the field is absent or not bytes.
    pub fn require_bytes(&self, key: &str) -> CodecResult<&[u8]> {
        let value = self.require(key)?;
        value.as_bytes().ok_or_else(|| mistyped(key, "bytes", value))
    }

    /// Required nested document.
    ///
    /// # Errors
    ///
    /// Returns an error if the field is absent or not a document.
    pub fn require_document(&self, key: &str) -> CodecResult<&Document> {
        let value = self.require(key)?;
        value.as_document().ok_or_else(|| mistyped(key, "document", value))
    }

    /// Optional nested document; present-but-wrong-type is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the field exists and is not a document.
    pub fn optional_document(&self, key: &str) -> CodecResult<Option<&Document>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Document(doc)) => Ok(Some(doc)),
            Some(other) => Err(mistyped(key, "document", other)),
        }
    }

    /// Optional integer field; present-but-wrong-type is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the field exists and is not an integer.
    pub fn optional_i64(&self, key: &str) -> CodecResult<Option<i64>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Int(n)) => Ok(Some(*n)),
            Some(other) => Err(mistyped(key, "int", other)),
        }
    }
}

fn mistyped(field: &str, expected: &'static str, found: &Value) -> CodecError {
    CodecError::InvalidField {
        field: field.to_owned(),
        expected,
        found: found.type_name(),
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Bytes(bytes) => {
                write!(f, "0x")?;
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Document(doc) => write!(f, "{doc}"),
        }
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {k}: {v}")?;
        }
        if !self.fields.is_empty() {
            write!(f, " ")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replaces_in_place() {
        let mut doc = Document::new().with("a", 1).with("b", 2);
        doc.insert("a", 10);
        assert_eq!(doc.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(doc.get("a"), Some(&Value::Int(10)));
    }

    #[test]
    fn typed_accessors_report_mismatch() {
        let doc = Document::new().with("txnNum", "five");
        assert_eq!(
            doc.require_i64("txnNum"),
            Err(CodecError::InvalidField {
                field: "txnNum".into(),
                expected: "int",
                found: "text",
            })
        );
        assert_eq!(
            doc.require_i64("missing"),
            Err(CodecError::missing_field("missing"))
        );
    }

    #[test]
    fn optional_fields_treat_null_as_absent() {
        let doc = Document::new().with("o2", Value::Null);
        assert_eq!(doc.optional_document("o2").unwrap(), None);
        assert_eq!(doc.optional_i64("stmtId").unwrap(), None);
    }

    #[test]
    fn display_is_readable() {
        let doc = Document::new().with("$incompleteOplogHistory", 1);
        assert_eq!(doc.to_string(), "{ $incompleteOplogHistory: 1 }");
        assert_eq!(Document::new().to_string(), "{}");
    }

    #[test]
    fn remove_and_first_key() {
        let mut doc = Document::new().with("applyOps", Vec::<Value>::new()).with("x", 1);
        assert_eq!(doc.first_key(), Some("applyOps"));
        assert!(doc.remove("applyOps").is_some());
        assert_eq!(doc.first_key(), Some("x"));
        assert!(doc.remove("applyOps").is_none());
    }
}
