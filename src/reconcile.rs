//! Reconciliation merge of a remote snapshot with locally cached records.
//!
//! Records created offline carry a provisional key the remote has never seen,
//! so key equality cannot tell whether a local record already reached the
//! remote. The merge falls back to a caller-supplied predicate over
//! business-identifying fields (for a payment: customer, vehicle, creation
//! time and amount).
//!
//! This is best-effort: two distinct records with identical identifying
//! fields, one created offline and one online, collapse into one. When both
//! sides carry a `_client_key` field that identity is compared instead and
//! the predicate is not consulted.

use std::collections::HashSet;

use serde_json::Value;

use crate::models::Record;

/// Result of a reconciliation merge
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// Remote records followed by local-only records
    pub records: Vec<Record>,
    /// Keys of local records found to be copies of remote ones; the caller
    /// should purge these from the Local Store
    pub redundant_local: Vec<String>,
}

/// Merge `remote` with `local` without duplicates.
///
/// Every remote record is kept verbatim and in order. A local record whose
/// key is among the remote keys is the cached copy of that remote record and
/// is dropped. Any other local record is appended unless `same_object(local,
/// remote)` holds for some remote record, in which case it is reported as
/// redundant.
pub fn merge<F>(remote: Vec<Record>, local: Vec<Record>, same_object: F) -> MergeOutcome
where
    F: Fn(&Record, &Record) -> bool,
{
    let remote_keys: HashSet<&str> = remote.iter().map(|r| r.key.as_str()).collect();

    let mut local_only = Vec::new();
    let mut redundant_local = Vec::new();

    for candidate in local {
        if remote_keys.contains(candidate.key.as_str()) {
            continue;
        }

        let synced = remote
            .iter()
            .any(|r| is_same_object(&candidate, r, &same_object));
        if synced {
            tracing::debug!(key = %candidate.key, "Local record already present remotely");
            redundant_local.push(candidate.key);
        } else {
            local_only.push(candidate);
        }
    }

    let mut records = remote;
    records.extend(local_only);

    MergeOutcome {
        records,
        redundant_local,
    }
}

fn is_same_object<F>(local: &Record, remote: &Record, same_object: &F) -> bool
where
    F: Fn(&Record, &Record) -> bool,
{
    match (local.client_key(), remote.client_key()) {
        (Some(a), Some(b)) => a == b,
        _ => same_object(local, remote),
    }
}

/// Build a predicate that matches records whose named fields are all present
/// on both sides and equal. Numbers compare by value, so `500` equals `500.0`.
pub fn match_fields<S: AsRef<str>>(names: &[S]) -> impl Fn(&Record, &Record) -> bool {
    let names: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
    move |a: &Record, b: &Record| {
        !names.is_empty()
            && names.iter().all(|name| match (a.field(name), b.field(name)) {
                (Some(x), Some(y)) => values_equal(x, y),
                _ => false,
            })
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

/// Integers compare exactly; floats only against floats or mixed pairs
fn numbers_equal(x: &serde_json::Number, y: &serde_json::Number) -> bool {
    if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
        return x == y;
    }
    if x.is_f64() || y.is_f64() {
        return matches!((x.as_f64(), y.as_f64()), (Some(x), Some(y)) if x == y);
    }
    // One negative and one above i64::MAX
    false
}
