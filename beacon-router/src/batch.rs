use std::fmt;

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

/// Position of a batch in its source stream. The router never interprets
/// it, it is only echoed back to the source and into delivery keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BatchOffset {
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for BatchOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition, self.offset)
    }
}

/// One inbound unit of work: a JSON array of beacon records.
#[derive(Clone, Debug)]
pub struct Batch {
    pub payload: Bytes,
    pub offset: BatchOffset,
    pub enqueued_at: Option<OffsetDateTime>,
}

impl Batch {
    pub fn new(payload: impl Into<Bytes>, offset: BatchOffset) -> Self {
        Self {
            payload: payload.into(),
            offset,
            enqueued_at: None,
        }
    }

    pub fn records(&self) -> Result<Records, ParseError> {
        decompose(&self.payload)
    }
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("batch payload is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("batch payload must be a JSON array, found {found}")]
    NotAnArray { found: &'static str },
}

/// Split a batch payload into its records.
///
/// The whole payload is parsed before the first record is handed out, so a
/// malformed batch fails without producing anything. Records themselves are
/// opaque: any JSON value is accepted as an element.
pub fn decompose(payload: &[u8]) -> Result<Records, ParseError> {
    match serde_json::from_slice(payload)? {
        Value::Array(elements) => Ok(Records {
            elements: elements.into_iter().enumerate(),
        }),
        other => Err(ParseError::NotAnArray {
            found: json_kind(&other),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Records of one batch, in array order. Consumed once.
#[derive(Debug)]
pub struct Records {
    elements: std::iter::Enumerate<std::vec::IntoIter<Value>>,
}

impl Iterator for Records {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        self.elements
            .next()
            .map(|(ordinal, value)| Record::new(ordinal, value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.elements.size_hint()
    }
}

impl ExactSizeIterator for Records {}

#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    ordinal: usize,
    value: Value,
    canonical: String,
}

impl Record {
    pub fn new(ordinal: usize, value: Value) -> Self {
        // Compact form, object keys sorted: the same value always yields the same bytes
        let canonical = value.to_string();
        Self {
            ordinal,
            value,
            canonical,
        }
    }

    /// 0-based position in the batch
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Serialized form handed to sinks.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

/// Identifies one record of one batch across redeliveries. Sinks attach it to
/// what they write, they do not deduplicate on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeliveryKey {
    pub offset: BatchOffset,
    pub ordinal: usize,
}

impl DeliveryKey {
    pub fn new(offset: BatchOffset, record: &Record) -> Self {
        Self {
            offset,
            ordinal: record.ordinal(),
        }
    }
}

impl fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.offset, self.ordinal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn yields_one_record_per_element_in_order() {
        let payload = br#"[{"m":1,"t":2,"d":[]}, 3, "four", null, [5, {"six": 6}]]"#;
        let records: Vec<Record> = decompose(payload).expect("valid batch").collect();

        let expected = [
            json!({"m": 1, "t": 2, "d": []}),
            json!(3),
            json!("four"),
            json!(null),
            json!([5, {"six": 6}]),
        ];
        assert_eq!(records.len(), expected.len());
        for (i, (record, value)) in records.iter().zip(expected.iter()).enumerate() {
            assert_eq!(record.ordinal(), i);
            assert_eq!(record.value(), value);
            let reparsed: Value = serde_json::from_str(record.canonical()).unwrap();
            assert_eq!(&reparsed, value);
        }
    }

    #[test]
    fn empty_array_is_not_an_error() {
        let records = decompose(b"[]").expect("empty batch is valid");
        assert_eq!(records.len(), 0);

        let records = decompose(b"  [ ]\n").expect("whitespace is fine");
        assert_eq!(records.count(), 0);
    }

    #[test]
    fn rejects_malformed_payloads() {
        for payload in [
            &b"not json"[..],
            &b""[..],
            &b"[1, 2"[..],
            &b"[1, 2] trailing"[..],
            &b"[\"\xff\"]"[..],
        ] {
            match decompose(payload) {
                Err(ParseError::Malformed(_)) => {}
                other => panic!("expected malformed error for {:?}, got {:?}", payload, other),
            }
        }
    }

    #[test]
    fn rejects_non_array_documents() {
        for (payload, found) in [
            (&b"{\"m\":1}"[..], "an object"),
            (&b"42"[..], "a number"),
            (&b"\"[]\""[..], "a string"),
            (&b"null"[..], "null"),
            (&b"true"[..], "a boolean"),
        ] {
            match decompose(payload) {
                Err(ParseError::NotAnArray { found: kind }) => assert_eq!(kind, found),
                other => panic!("expected non-array error, got {:?}", other),
            }
        }
    }

    #[test]
    fn canonical_form_is_reproducible() {
        let a = Record::new(0, serde_json::from_str(r#"{"t": 2, "m": 1}"#).unwrap());
        let b = Record::new(0, serde_json::from_str(r#"{ "m" : 1 , "t" : 2 }"#).unwrap());

        assert_eq!(a.canonical(), r#"{"m":1,"t":2}"#);
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(Record::new(0, a.value().clone()).canonical(), a.canonical());
    }

    #[test]
    fn delivery_key_combines_offset_and_ordinal() {
        let offset = BatchOffset {
            partition: 3,
            offset: 1200,
        };
        let record = Record::new(7, json!({}));
        assert_eq!(DeliveryKey::new(offset, &record).to_string(), "3/1200:7");
    }

    #[test]
    fn decomposing_leaves_the_batch_untouched() {
        let batch = Batch::new(&b"[1,2,3]"[..], BatchOffset { partition: 0, offset: 0 });
        assert_eq!(batch.records().unwrap().count(), 3);
        assert_eq!(batch.records().unwrap().count(), 3);
        assert_eq!(&batch.payload[..], b"[1,2,3]");
    }
}
