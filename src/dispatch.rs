//! Dispatch context resolver (C8): figures out which session a telephony
//! job belongs to from whatever metadata the provider handed us.

use serde_json::Value;
use std::collections::HashMap;

/// The resolved identity of an inbound job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchContext {
    pub session_id: String,
    pub flow: Option<String>,
}

/// Parse job metadata as JSON. Missing, malformed, or non-object metadata
/// all resolve to an empty map rather than an error — dispatch must never
/// fail just because a provider sent an odd payload.
pub fn parse_job_metadata(metadata: Option<&str>) -> serde_json::Map<String, Value> {
    let Some(raw) = metadata else {
        return serde_json::Map::new();
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

/// Resolve the session id with priority: metadata JSON `session_id` field,
/// then a `session_id` participant attribute, then the room name, then the
/// literal string `"unknown"` if even that is empty.
pub fn resolve_session_id(
    metadata: &serde_json::Map<String, Value>,
    participant_attributes: &HashMap<String, String>,
    room_name: &str,
) -> String {
    if let Some(Value::String(s)) = metadata.get("session_id") {
        let trimmed = s.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    if let Some(attr) = participant_attributes.get("session_id") {
        let trimmed = attr.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let room = room_name.trim();
    if !room.is_empty() {
        room.to_string()
    } else {
        "unknown".to_string()
    }
}

/// Build the full dispatch context for a job, extracting `flow` from
/// metadata when present as a string.
pub fn build_dispatch_context(
    metadata: Option<&str>,
    participant_attributes: &HashMap<String, String>,
    room_name: &str,
) -> DispatchContext {
    let metadata = parse_job_metadata(metadata);
    let session_id = resolve_session_id(&metadata, participant_attributes, room_name);
    let flow = match metadata.get("flow") {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    };
    DispatchContext { session_id, flow }
}
