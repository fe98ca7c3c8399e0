//! Profile document decoding.
//!
//! A profile document is one JSON record written by the database profiler.
//! Decoding is lenient about missing numeric fields and strict about the
//! timestamp, namespace, and operation.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::qan::Metric;

/// Suffix of the profiler's own collection, never reported.
const PROFILE_COLLECTION: &str = ".system.profile";

/// Errors that can occur while decoding a profile document.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed profile document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid timestamp {raw:?}")]
    InvalidTimestamp { raw: String },
}

/// Timestamp forms accepted in the `ts` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Text(String),
    Millis(i64),
    Extended {
        #[serde(rename = "$date")]
        date: ExtendedDate,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ExtendedDate {
    Text(String),
    Millis(i64),
    NumberLong {
        #[serde(rename = "$numberLong")]
        value: String,
    },
}

impl RawTimestamp {
    fn resolve(&self) -> Result<SystemTime, DecodeError> {
        match self {
            Self::Text(s) | Self::Extended { date: ExtendedDate::Text(s) } => parse_rfc3339(s),
            Self::Millis(ms) | Self::Extended { date: ExtendedDate::Millis(ms) } => {
                from_epoch_millis(*ms)
            }
            Self::Extended {
                date: ExtendedDate::NumberLong { value },
            } => {
                let ms = value
                    .parse::<i64>()
                    .map_err(|_| DecodeError::InvalidTimestamp { raw: value.clone() })?;
                from_epoch_millis(ms)
            }
        }
    }
}

fn parse_rfc3339(s: &str) -> Result<SystemTime, DecodeError> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(SystemTime::from)
        .map_err(|_| DecodeError::InvalidTimestamp { raw: s.to_string() })
}

fn from_epoch_millis(ms: i64) -> Result<SystemTime, DecodeError> {
    let ms = u64::try_from(ms).map_err(|_| DecodeError::InvalidTimestamp {
        raw: ms.to_string(),
    })?;
    Ok(UNIX_EPOCH + Duration::from_millis(ms))
}

/// Wire shape of a profile document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDocument {
    ts: RawTimestamp,
    ns: String,
    op: String,
    #[serde(default)]
    command: Option<Value>,
    #[serde(default)]
    query: Option<Value>,
    #[serde(default)]
    millis: f64,
    #[serde(default, rename = "nscannedObjects", alias = "docsExamined")]
    docs_scanned: f64,
    #[serde(default, rename = "keysExamined", alias = "nscanned")]
    keys_scanned: f64,
    #[serde(default, rename = "nreturned")]
    docs_returned: f64,
    #[serde(default)]
    response_length: f64,
}

/// One decoded profiler record.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub ts: SystemTime,
    /// Namespace in `database.collection` form.
    pub ns: String,
    pub op: String,
    /// Command or query document, whichever the record carries.
    pub command: Option<Value>,
    pub millis: f64,
    pub docs_scanned: f64,
    pub keys_scanned: f64,
    pub docs_returned: f64,
    pub response_length: f64,
}

impl Observation {
    /// Decodes a profile document from its JSON value.
    pub fn decode(value: Value) -> Result<Self, DecodeError> {
        let doc: ProfileDocument = serde_json::from_value(value)?;
        Self::try_from(doc)
    }

    /// Metrics tracked for the streaming path, in a fixed order.
    pub fn metrics(&self) -> [(Metric, f64); 5] {
        [
            (Metric::QueryTime, self.millis),
            (Metric::DocsScanned, self.docs_scanned),
            (Metric::DocsReturned, self.docs_returned),
            (Metric::KeysScanned, self.keys_scanned),
            (Metric::ResponseLength, self.response_length),
        ]
    }

    /// Compact JSON text of the command document, used as the bucket example.
    pub fn example(&self) -> Option<String> {
        self.command.as_ref().map(Value::to_string)
    }

    /// True for records about the profiler's own collection.
    pub fn is_profiler_namespace(&self) -> bool {
        self.ns.ends_with(PROFILE_COLLECTION)
    }
}

impl TryFrom<ProfileDocument> for Observation {
    type Error = DecodeError;

    fn try_from(doc: ProfileDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            ts: doc.ts.resolve()?,
            ns: doc.ns,
            op: doc.op,
            command: doc.command.or(doc.query),
            millis: doc.millis,
            docs_scanned: doc.docs_scanned,
            keys_scanned: doc.keys_scanned,
            docs_returned: doc.docs_returned,
            response_length: doc.response_length,
        })
    }
}

/// Extracts and resolves only the timestamp of a raw record.
///
/// Sources use this to range-filter records without a full decode.
pub fn record_timestamp(value: &Value) -> Option<SystemTime> {
    let ts = value.get("ts")?;
    let raw: RawTimestamp = serde_json::from_value(ts.clone()).ok()?;
    raw.resolve().ok()
}
