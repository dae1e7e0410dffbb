//! OBS-00 event envelope, emitter, and bounded in-memory store (C1 + C2).
//!
//! Every observable thing the platform does flows through [`EventEmitter::emit`]
//! (or one of its typed sugar constructors), which stamps the envelope, writes
//! one JSON line to the structured sink, and hands the record to the
//! [`EventStore`] ring for later query (§4.2, §4.3).

use std::collections::VecDeque;
use std::io::IsTerminal;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Component types per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    ControlPlane,
    VoicePipeline,
    Adapter,
    ActionRunner,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::ControlPlane => "control_plane",
            Component::VoicePipeline => "voice_pipeline",
            Component::Adapter => "adapter",
            Component::ActionRunner => "action_runner",
        }
    }
}

/// Event severity levels per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

/// PII metadata block required on every event (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pii {
    pub contains_pii: bool,
    pub fields: Vec<String>,
    pub handling: String,
}

impl Default for Pii {
    fn default() -> Self {
        Self {
            contains_pii: false,
            fields: Vec::new(),
            handling: "none".to_string(),
        }
    }
}

impl Pii {
    pub fn audit_only(fields: Vec<String>) -> Self {
        Self {
            contains_pii: true,
            fields,
            handling: "none".to_string(),
        }
    }
}

/// A single stored/emitted event record.
///
/// The seven mandatory envelope fields are typed; anything else goes in
/// `fields`, a string-keyed extension map (§9 "Dynamic event payloads").
#[derive(Debug, Clone)]
pub struct Event {
    pub ts: DateTime<Utc>,
    pub session_id: String,
    pub component: Component,
    pub event_type: String,
    pub severity: Severity,
    pub correlation_id: String,
    pub pii: Pii,
    pub fields: Map<String, Value>,
}

impl Event {
    /// Render as a single canonical JSON object. `serde_json::Map` is
    /// BTreeMap-backed by default, so keys come out in stable sorted order.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("ts".to_string(), Value::String(self.ts.to_rfc3339()));
        map.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );
        map.insert(
            "component".to_string(),
            Value::String(self.component.as_str().to_string()),
        );
        map.insert(
            "event_type".to_string(),
            Value::String(self.event_type.clone()),
        );
        map.insert(
            "severity".to_string(),
            Value::String(self.severity.as_str().to_string()),
        );
        map.insert(
            "correlation_id".to_string(),
            Value::String(self.correlation_id.clone()),
        );
        map.insert(
            "pii".to_string(),
            serde_json::to_value(&self.pii).expect("Pii serializes"),
        );
        // Extension fields never shadow the mandatory envelope fields.
        for (k, v) in &self.fields {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Value::Object(map)
    }
}

/// Builder for an event's extension-field map plus a couple of helpers
/// used by every sugar constructor below.
#[derive(Default)]
pub struct Fields(Map<String, Value>);

impl Fields {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn set_opt(mut self, key: &str, value: Option<impl Into<Value>>) -> Self {
        if let Some(v) = value {
            self.0.insert(key.to_string(), v.into());
        }
        self
    }

    pub fn build(self) -> Map<String, Value> {
        self.0
    }
}

/// Emits structured JSON events per the envelope in §4.2.
#[derive(Clone)]
pub struct EventEmitter {
    component: Component,
    store: Arc<EventStore>,
}

impl EventEmitter {
    pub fn new(component: Component, store: Arc<EventStore>) -> Self {
        Self { component, store }
    }

    pub fn store_ref(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Build, render, and store one event. This is the single choke point
    /// everything else (including the sugar constructors) flows through.
    pub fn emit(
        &self,
        event_type: &str,
        session_id: &str,
        severity: Severity,
        correlation_id: Option<&str>,
        pii: Option<Pii>,
        fields: Map<String, Value>,
    ) -> Event {
        let event = Event {
            ts: Utc::now(),
            session_id: session_id.to_string(),
            component: self.component,
            event_type: event_type.to_string(),
            severity,
            correlation_id: correlation_id.unwrap_or(session_id).to_string(),
            pii: pii.unwrap_or_default(),
            fields,
        };

        render_to_sink(&event);
        self.store.store(event.clone());
        event
    }

    pub fn emit_info(&self, event_type: &str, session_id: &str, fields: Map<String, Value>) -> Event {
        self.emit(event_type, session_id, Severity::Info, None, None, fields)
    }

    // --- Taxonomy sugar (§4.2) ---

    pub fn call_started(&self, session_id: &str, direction: &str) -> Event {
        self.emit_info(
            "call.started",
            session_id,
            Fields::new().set("direction", direction).build(),
        )
    }

    pub fn call_answered(&self, session_id: &str) -> Event {
        self.emit_info("call.answered", session_id, Map::new())
    }

    pub fn call_ended(&self, session_id: &str, reason: &str) -> Event {
        self.emit_info(
            "call.ended",
            session_id,
            Fields::new().set("reason", reason).build(),
        )
    }

    pub fn session_state_changed(&self, session_id: &str, from: &str, to: &str) -> Event {
        self.emit_info(
            "session.state_changed",
            session_id,
            Fields::new().set("from", from).set("to", to).build(),
        )
    }

    pub fn livekit_room_created(&self, session_id: &str, room: &str) -> Event {
        self.emit_info(
            "livekit.room.created",
            session_id,
            Fields::new()
                .set("livekit", serde_json::json!({"room": room}))
                .build(),
        )
    }

    pub fn livekit_participant_joined(&self, session_id: &str, room: &str, participant: &str) -> Event {
        self.emit_info(
            "livekit.participant.joined",
            session_id,
            Fields::new()
                .set(
                    "livekit",
                    serde_json::json!({"room": room, "participant": participant}),
                )
                .build(),
        )
    }

    pub fn livekit_participant_left(&self, session_id: &str, room: &str, participant: &str) -> Event {
        self.emit_info(
            "livekit.participant.left",
            session_id,
            Fields::new()
                .set(
                    "livekit",
                    serde_json::json!({"room": room, "participant": participant}),
                )
                .build(),
        )
    }

    pub fn livekit_track_published(
        &self,
        session_id: &str,
        room: &str,
        participant: Option<&str>,
        track: Option<&str>,
    ) -> Event {
        self.emit_info(
            "livekit.track.published",
            session_id,
            Fields::new()
                .set(
                    "livekit",
                    serde_json::json!({"room": room, "participant": participant, "track": track}),
                )
                .build(),
        )
    }

    pub fn provider_event(
        &self,
        session_id: &str,
        category: &str,
        direction: Option<&str>,
        provider: Option<&str>,
        detail: Option<&str>,
    ) -> Event {
        let severity = if category.contains("error") || category.contains("limited") {
            Severity::Warn
        } else {
            Severity::Info
        };
        self.emit(
            "provider.event",
            session_id,
            severity,
            None,
            None,
            Fields::new()
                .set("category", category)
                .set_opt("direction", direction)
                .set_opt("provider", provider)
                .set_opt("detail", detail)
                .build(),
        )
    }
}

/// Render one event to the human-facing sink.
///
/// The machine record stored/queried is unaffected: this only controls what
/// gets printed. `latency_ms`, when present, is rendered as `<N> ms`; colour
/// is applied only when stdout is a TTY and neither `NO_COLOR` nor
/// `FORCE_COLOR=0` disables it (§4.2).
fn render_to_sink(event: &Event) {
    let mut json = event.to_json();
    if let Some(obj) = json.as_object_mut() {
        if let Some(Value::Number(n)) = obj.get("latency_ms").cloned() {
            obj.insert(
                "latency_ms".to_string(),
                Value::String(format!("{n} ms")),
            );
        }
    }

    let line = serde_json::to_string(&json).unwrap_or_else(|_| "{}".to_string());
    let colored = should_color() && matches!(event.severity, Severity::Warn | Severity::Error);

    if colored {
        let code = match event.severity {
            Severity::Warn => "33",
            Severity::Error => "31",
            _ => "0",
        };
        println!("\x1b[{code}m{line}\x1b[0m");
    } else {
        println!("{line}");
    }
}

fn should_color() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if let Some(v) = std::env::var_os("FORCE_COLOR") {
        return v != "0";
    }
    std::io::stdout().is_terminal()
}

/// Filters accepted by [`EventStore::query`] (§4.3).
#[derive(Debug, Default, Clone)]
pub struct EventQuery {
    pub session_id: Option<String>,
    pub event_type: Option<String>,
    pub component: Option<Component>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Bounded FIFO ring of emitted events (default 10,000), oldest dropped on
/// overflow (§3).
pub struct EventStore {
    events: Mutex<VecDeque<Event>>,
    max_events: usize,
}

impl EventStore {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    pub fn store(&self, event: Event) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Query with AND-combined filters, oldest-first, `limit` stopping
    /// iteration early (§4.3).
    pub fn query(&self, q: &EventQuery) -> Vec<Event> {
        let events = self.events.lock();
        let mut results = Vec::new();
        for event in events.iter() {
            if let Some(sid) = &q.session_id {
                if &event.session_id != sid {
                    continue;
                }
            }
            if let Some(et) = &q.event_type {
                if &event.event_type != et {
                    continue;
                }
            }
            if let Some(c) = q.component {
                if event.component != c {
                    continue;
                }
            }
            if let Some(since) = q.since {
                if event.ts < since {
                    continue;
                }
            }
            if let Some(until) = q.until {
                if event.ts > until {
                    continue;
                }
            }
            results.push(event.clone());
            if let Some(limit) = q.limit {
                if results.len() >= limit {
                    break;
                }
            }
        }
        results
    }

    pub fn stats(&self) -> EventStoreStats {
        let events = self.events.lock();
        EventStoreStats {
            total_events: events.len(),
            max_events: self.max_events,
            oldest_ts: events.front().map(|e| e.ts),
            newest_ts: events.back().map(|e| e.ts),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventStoreStats {
    pub total_events: usize,
    pub max_events: usize,
    pub oldest_ts: Option<DateTime<Utc>>,
    pub newest_ts: Option<DateTime<Utc>>,
}

/// Parse a `since`/`until` boundary per §4.3: tolerate `Z` or `±HH:MM`,
/// assume UTC when no zone is given, and tolerate transports that turn `+`
/// into a literal space.
pub fn parse_timestamp_boundary(raw: &str) -> Option<DateTime<Utc>> {
    let candidate = raw.replace(' ', "+");
    if let Ok(dt) = DateTime::parse_from_rfc3339(&candidate) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // No explicit zone: try naive datetime and assume UTC.
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(&candidate, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(&candidate, "%Y-%m-%dT%H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<EventStore> {
        Arc::new(EventStore::new(10_000))
    }

    #[test]
    fn emit_fills_correlation_id_and_pii_defaults() {
        let emitter = EventEmitter::new(Component::ControlPlane, store());
        let event = emitter.emit_info("call.started", "sess-1", Map::new());
        assert_eq!(event.correlation_id, "sess-1");
        assert!(!event.pii.contains_pii);
        assert_eq!(event.pii.handling, "none");
    }

    #[test]
    fn emit_preserves_explicit_correlation_id() {
        let emitter = EventEmitter::new(Component::VoicePipeline, store());
        let event = emitter.emit(
            "turn.started",
            "sess-1",
            Severity::Info,
            Some("turn_42"),
            None,
            Map::new(),
        );
        assert_eq!(event.correlation_id, "turn_42");
    }

    #[test]
    fn to_json_has_stable_sorted_key_order() {
        let emitter = EventEmitter::new(Component::ControlPlane, store());
        let event = emitter.call_started("sess-1", "inbound");
        let json = event.to_json();
        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn store_respects_bound_and_drops_oldest() {
        let s = EventStore::new(2);
        let emitter = EventEmitter::new(Component::ControlPlane, Arc::new(EventStore::new(2)));
        for i in 0..3 {
            let e = emitter.emit_info(
                "call.started",
                &format!("sess-{i}"),
                Map::new(),
            );
            s.store(e);
        }
        let all = s.query(&EventQuery::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].session_id, "sess-1");
        assert_eq!(all[1].session_id, "sess-2");
    }

    #[test]
    fn query_filters_are_and_combined_and_ordered() {
        let s = store();
        let emitter = EventEmitter::new(Component::ControlPlane, s.clone());
        emitter.call_started("sess_A", "inbound");
        emitter.call_ended("sess_A", "participant_left");
        emitter.call_started("sess_B", "inbound");

        let results = s.query(&EventQuery {
            session_id: Some("sess_A".to_string()),
            event_type: Some("call.started".to_string()),
            limit: Some(10),
            ..Default::default()
        });
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].session_id, "sess_A");
    }

    #[test]
    fn parse_timestamp_boundary_accepts_zulu_offset_and_tolerates_space() {
        assert!(parse_timestamp_boundary("2026-07-28T10:00:00Z").is_some());
        assert!(parse_timestamp_boundary("2026-07-28T10:00:00+02:00").is_some());
        // Transport turned '+' into a literal space.
        assert!(parse_timestamp_boundary("2026-07-28T10:00:00 02:00").is_some());
        assert!(parse_timestamp_boundary("2026-07-28T10:00:00").is_some());
        assert!(parse_timestamp_boundary("not-a-timestamp").is_none());
    }
}
