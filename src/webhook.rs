//! Webhook ingester (C4): verifies provider webhook signatures and maps
//! provider events onto session-lifecycle transitions.

use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::{CoreError, Result};
use crate::events::EventEmitter;
use crate::session::{Direction, SessionRegistry, SessionState};

/// Pull `phone_number` out of a participant's freeform metadata string
/// (typically JSON). Malformed or non-object metadata yields `None` rather
/// than an error — the caller number is a best-effort enrichment, never a
/// precondition for answering the call (§4.4).
fn parse_phone_number_from_metadata(metadata: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(metadata).ok()?;
    value.get("phone_number")?.as_str().map(|s| s.to_string())
}

/// Claims carried by a LiveKit webhook's signing token: a JWT (HS256, keyed
/// with the API secret) whose `sha256` claim is the base64-encoded SHA-256
/// digest of the raw request body.
#[derive(Debug, Deserialize, serde::Serialize)]
struct WebhookClaims {
    sha256: String,
}

/// Verify a LiveKit webhook's `Authorization` token against the raw request
/// body (§4.4, Open Question a). The token is a JWT, not a raw signature:
/// decoding it (HS256, keyed with the configured webhook secret) both
/// authenticates the sender and yields the `sha256` claim, which must match
/// the digest of `body`.
pub fn verify_signature(secret: &str, body: &[u8], token: &str) -> Result<()> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    let data = jsonwebtoken::decode::<WebhookClaims>(token, &key, &validation)?;

    let digest = ring::digest::digest(&ring::digest::SHA256, body);
    let expected = base64::engine::general_purpose::STANDARD.encode(digest.as_ref());
    if data.claims.sha256 == expected {
        Ok(())
    } else {
        Err(CoreError::Unauthorized)
    }
}

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub participant: Option<String>,
    #[serde(default)]
    pub participant_identity: Option<String>,
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub metadata: Option<String>,
}

/// Processes one webhook payload against the session registry, emitting
/// events as it goes. Unknown event kinds are acknowledged but ignored
/// (§4.4): the provider may add event kinds we don't yet react to.
pub struct WebhookIngester {
    sessions: SessionRegistry,
    emitter: EventEmitter,
}

impl WebhookIngester {
    pub fn new(sessions: SessionRegistry, emitter: EventEmitter) -> Self {
        Self { sessions, emitter }
    }

    pub fn handle(&self, raw_body: &[u8]) -> Result<()> {
        let payload: WebhookPayload = serde_json::from_slice(raw_body)
            .map_err(|e| CoreError::InvalidPayload(e.to_string()))?;

        match payload.event.as_str() {
            "room_started" => self.handle_room_started(&payload),
            "participant_joined" => self.handle_participant_joined(&payload),
            "participant_left" => self.handle_participant_left(&payload),
            "track_published" => self.handle_track_published(&payload),
            "room_finished" => self.handle_room_finished(&payload),
            _ => Ok(()),
        }
    }

    fn room(payload: &WebhookPayload) -> Result<&str> {
        payload
            .room
            .as_deref()
            .ok_or_else(|| CoreError::InvalidPayload("missing room".to_string()))
    }

    fn handle_room_started(&self, payload: &WebhookPayload) -> Result<()> {
        let room = Self::room(payload)?;
        let is_new = self.sessions.get_by_room(room).is_none();
        if is_new {
            let session = self.sessions.create(room, Direction::Inbound);
            self.sessions.set_room(&session.session_id, room)?;
        }
        self.emitter.livekit_room_created(room, room);
        if is_new {
            // A session already owning this room is an outbound
            // pre-registration (§4.4): only the room-created event is
            // emitted for it, never a second `call.started`.
            self.emitter.call_started(room, "inbound");
        }
        Ok(())
    }

    fn handle_participant_joined(&self, payload: &WebhookPayload) -> Result<()> {
        let room = Self::room(payload)?;
        let identity = payload
            .participant
            .as_deref()
            .or(payload.participant_identity.as_deref())
            .unwrap_or("");

        let session = match self.sessions.get_by_room(room) {
            Some(s) => s,
            None => {
                let s = self.sessions.create(room, Direction::Inbound);
                self.sessions.set_room(&s.session_id, room)?;
                s
            }
        };

        // Always emit the raw LiveKit event first, then react (§4.4 event
        // order, confirmed by the inbound-happy-path scenario).
        self.emitter
            .livekit_participant_joined(&session.session_id, room, identity);

        let is_caller_identity =
            identity.starts_with("sip:") || identity.to_lowercase().contains("phone");

        if is_caller_identity && session.livekit_participant.is_none() {
            self.sessions.set_participant(&session.session_id, identity)?;

            if let Some(phone) = payload
                .metadata
                .as_deref()
                .and_then(parse_phone_number_from_metadata)
            {
                self.sessions.set_caller_number(&session.session_id, &phone)?;
            }

            if session.state == SessionState::InboundRinging {
                self.sessions
                    .transition(&session.session_id, SessionState::Connected)?;
                self.emitter.session_state_changed(
                    &session.session_id,
                    SessionState::InboundRinging.as_str(),
                    SessionState::Connected.as_str(),
                );
                self.emitter.call_answered(&session.session_id);
            }
        }
        Ok(())
    }

    fn handle_participant_left(&self, payload: &WebhookPayload) -> Result<()> {
        let room = Self::room(payload)?;
        let participant = payload
            .participant
            .as_deref()
            .or(payload.participant_identity.as_deref())
            .unwrap_or("");

        let session = self.sessions.get_by_room(room);
        let session_id = session
            .as_ref()
            .map(|s| s.session_id.clone())
            .unwrap_or_else(|| room.to_string());

        self.emitter
            .livekit_participant_left(&session_id, room, participant);

        if let Some(session) = session {
            if session.livekit_participant.as_deref() == Some(participant)
                && !session.state.is_terminal()
            {
                self.sessions.end(&session.session_id, "participant_left")?;
                self.emitter.call_ended(&session.session_id, "participant_left");
            }
        }
        Ok(())
    }

    fn handle_track_published(&self, payload: &WebhookPayload) -> Result<()> {
        let room = Self::room(payload)?;
        let session_id = self
            .sessions
            .get_by_room(room)
            .map(|s| s.session_id)
            .unwrap_or_else(|| room.to_string());
        self.emitter.livekit_track_published(
            &session_id,
            room,
            payload.participant.as_deref(),
            payload.track.as_deref(),
        );
        Ok(())
    }

    fn handle_room_finished(&self, payload: &WebhookPayload) -> Result<()> {
        let room = Self::room(payload)?;
        if let Some(session) = self.sessions.get_by_room(room) {
            if !session.state.is_terminal() {
                self.sessions.end(&session.session_id, "room_finished")?;
                self.emitter.call_ended(&session.session_id, "room_finished");
            }
        }
        Ok(())
    }
}
