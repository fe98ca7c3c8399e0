use serde_json::{Map, Value};
use thiserror::Error;

use super::observation::Observation;
use crate::qan::split_namespace;

/// Errors returned when an observation cannot be fingerprinted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("observation has no operation")]
    EmptyOperation,

    #[error("observation has no namespace")]
    EmptyNamespace,

    #[error("command observation has no command document")]
    MissingCommand,
}

/// Derives a stable query signature from an observation.
pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, obs: &Observation) -> Result<String, FingerprintError>;
}

/// Fingerprints profile documents as `"<OP> <collection> [filter keys]"`.
///
/// Filter values are dropped so queries that differ only in their literals
/// share a fingerprint.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileFingerprinter;

impl Fingerprinter for ProfileFingerprinter {
    fn fingerprint(&self, obs: &Observation) -> Result<String, FingerprintError> {
        if obs.op.is_empty() {
            return Err(FingerprintError::EmptyOperation);
        }
        if obs.ns.is_empty() {
            return Err(FingerprintError::EmptyNamespace);
        }

        let doc = obs.command.as_ref().and_then(Value::as_object);
        let op = if obs.op == "command" {
            command_name(doc.ok_or(FingerprintError::MissingCommand)?)
                .ok_or(FingerprintError::MissingCommand)?
                .to_string()
        } else {
            obs.op.clone()
        };

        let (_, collection) = split_namespace(&obs.ns);
        let mut out = op.to_uppercase();
        if !collection.is_empty() {
            out.push(' ');
            out.push_str(collection);
        }

        let keys = doc.map(filter_keys).unwrap_or_default();
        if !keys.is_empty() {
            out.push(' ');
            out.push_str(&keys.join(","));
        }
        Ok(out)
    }
}

/// The command name is the first non-`$` key of the command document.
fn command_name(doc: &Map<String, Value>) -> Option<&str> {
    doc.keys().map(String::as_str).find(|k| !k.starts_with('$'))
}

/// Sorted top-level filter keys, operators excluded.
fn filter_keys(doc: &Map<String, Value>) -> Vec<&str> {
    let filter = ["filter", "q", "query"]
        .iter()
        .find_map(|k| doc.get(*k).and_then(Value::as_object));

    let Some(filter) = filter else {
        return Vec::new();
    };

    let mut keys: Vec<&str> = filter
        .keys()
        .map(String::as_str)
        .filter(|k| !k.starts_with('$'))
        .collect();
    keys.sort_unstable();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::UNIX_EPOCH;

    fn obs(ns: &str, op: &str, command: Option<Value>) -> Observation {
        Observation {
            ts: UNIX_EPOCH,
            ns: ns.to_string(),
            op: op.to_string(),
            command,
            millis: 0.0,
            docs_scanned: 0.0,
            keys_scanned: 0.0,
            docs_returned: 0.0,
            response_length: 0.0,
        }
    }

    #[test]
    fn test_insert() {
        let fp = ProfileFingerprinter
            .fingerprint(&obs("collection.people", "insert", None))
            .expect("fingerprint");
        assert_eq!(fp, "INSERT people");
    }

    #[test]
    fn test_query_filter_keys_sorted() {
        let command = json!({"find": "people", "filter": {"name": "x", "age": {"$gt": 3}}});
        let fp = ProfileFingerprinter
            .fingerprint(&obs("shop.people", "query", Some(command)))
            .expect("fingerprint");
        assert_eq!(fp, "QUERY people age,name");
    }

    #[test]
    fn test_literals_do_not_change_fingerprint() {
        let a = obs("shop.people", "update", Some(json!({"q": {"_id": 1}})));
        let b = obs("shop.people", "update", Some(json!({"q": {"_id": 99}})));
        assert_eq!(
            ProfileFingerprinter.fingerprint(&a),
            ProfileFingerprinter.fingerprint(&b)
        );
    }

    #[test]
    fn test_operator_keys_dropped() {
        let command = json!({"filter": {"$or": [{"a": 1}], "b": 2}});
        let fp = ProfileFingerprinter
            .fingerprint(&obs("shop.people", "query", Some(command)))
            .expect("fingerprint");
        assert_eq!(fp, "QUERY people b");
    }

    #[test]
    fn test_command_uses_command_name() {
        let command = json!({"$db": "shop", "aggregate": "people", "pipeline": []});
        let fp = ProfileFingerprinter
            .fingerprint(&obs("shop.people", "command", Some(command)))
            .expect("fingerprint");
        assert_eq!(fp, "AGGREGATE people");
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            ProfileFingerprinter.fingerprint(&obs("db.c", "", None)),
            Err(FingerprintError::EmptyOperation)
        );
        assert_eq!(
            ProfileFingerprinter.fingerprint(&obs("", "insert", None)),
            Err(FingerprintError::EmptyNamespace)
        );
        assert_eq!(
            ProfileFingerprinter.fingerprint(&obs("db.c", "command", None)),
            Err(FingerprintError::MissingCommand)
        );
    }

    #[test]
    fn test_namespace_without_collection() {
        let fp = ProfileFingerprinter
            .fingerprint(&obs("admin", "query", None))
            .expect("fingerprint");
        assert_eq!(fp, "QUERY");
    }
}
