//! Metadata is an opaque JSON object carried on executions and tasks. This
//! module supplies the two utilities the rest of the crate needs: pulling
//! out the `transcript`/`progress` arrays, and merging two metadata
//! documents (§4.4).
//!
//! Merge semantics: `transcript` arrays concatenate (append), every other
//! key is a shallow last-writer-wins overwrite. Concatenation is
//! associative, which is what makes `merge_metadata` associative (§8
//! property 6) regardless of what the other keys contain.

use serde_json::{Map, Value};

/// One entry of a metadata `transcript` array. Unknown/extra fields are
/// preserved via `extra` so merging never drops information the caller put
/// there.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TranscriptEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Returns the `transcript` array of a metadata object, if present and
/// well-formed. Entries that fail to parse as a `TranscriptEntry` are
/// skipped rather than aborting the whole extraction.
pub fn extract_transcript(metadata: &Value) -> Vec<TranscriptEntry> {
    metadata
        .as_object()
        .and_then(|m| m.get("transcript"))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Returns the `progress` array of a metadata object as raw JSON values.
pub fn extract_progress(metadata: &Value) -> Vec<Value> {
    metadata
        .as_object()
        .and_then(|m| m.get("progress"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Merges `b` into `a`: `transcript` arrays concatenate, every other key is
/// shallow-overwritten by `b`'s value. Non-object inputs are treated as
/// empty objects. Associative: `merge(merge(a,b),c) == merge(a,merge(b,c))`.
pub fn merge_metadata(a: &Value, b: &Value) -> Value {
    let mut out = a.as_object().cloned().unwrap_or_default();
    let b_obj = b.as_object().cloned().unwrap_or_default();

    let mut transcript = out
        .get("transcript")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if let Some(b_transcript) = b_obj.get("transcript").and_then(|v| v.as_array()) {
        transcript.extend(b_transcript.iter().cloned());
    }

    for (key, value) in b_obj {
        if key == "transcript" {
            continue;
        }
        out.insert(key, value);
    }

    if !transcript.is_empty() {
        out.insert("transcript".to_string(), Value::Array(transcript));
    }

    Value::Object(out)
}
