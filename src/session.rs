//! Session registry (C3): lifecycle state machine and shared directory of
//! in-progress and recently-ended calls.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Session lifecycle states. Transitions form a monotonic DAG (§4.1):
/// a session never moves backward, and `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Dialing,
    Ringing,
    InboundRinging,
    Connected,
    Ending,
    Ended,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Dialing => "dialing",
            SessionState::Ringing => "ringing",
            SessionState::InboundRinging => "inbound_ringing",
            SessionState::Connected => "connected",
            SessionState::Ending => "ending",
            SessionState::Ended => "ended",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "created" => SessionState::Created,
            "dialing" => SessionState::Dialing,
            "ringing" => SessionState::Ringing,
            "inbound_ringing" => SessionState::InboundRinging,
            "connected" => SessionState::Connected,
            "ending" => SessionState::Ending,
            "ended" => SessionState::Ended,
            _ => return None,
        })
    }

    /// Rank in the monotonic DAG. Two states at the same rank
    /// (`Ringing`/`InboundRinging`) are both valid predecessors of
    /// `Connected` but not of each other.
    fn rank(&self) -> u8 {
        match self {
            SessionState::Created => 0,
            SessionState::Dialing => 1,
            SessionState::Ringing => 1,
            SessionState::InboundRinging => 1,
            SessionState::Connected => 2,
            SessionState::Ending => 3,
            SessionState::Ended => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
    }
}

/// Call direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "inbound" => Direction::Inbound,
            "outbound" => Direction::Outbound,
            _ => return None,
        })
    }
}

/// A single call/session record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub direction: Direction,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub caller_number: Option<String>,
    pub callee_number: Option<String>,
    pub livekit_room: Option<String>,
    pub livekit_participant: Option<String>,
    pub end_reason: Option<String>,
}

impl Session {
    fn new(session_id: String, direction: Direction, initial_state: SessionState) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            direction,
            state: initial_state,
            created_at: now,
            updated_at: now,
            caller_number: None,
            callee_number: None,
            livekit_room: None,
            livekit_participant: None,
            end_reason: None,
        }
    }
}

/// Shared, concurrency-safe directory of sessions.
///
/// Inbound calls start life already `InboundRinging` (the provider only
/// tells us about them once ringing has begun); everything else starts
/// `Created` (§4.1).
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn create(&self, session_id: &str, direction: Direction) -> Session {
        let initial_state = match direction {
            Direction::Inbound => SessionState::InboundRinging,
            Direction::Outbound => SessionState::Created,
        };
        let session = Session::new(session_id.to_string(), direction, initial_state);
        self.sessions
            .insert(session_id.to_string(), session.clone());
        session
    }

    pub fn get(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))
    }

    pub fn get_optional(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Linear scan by LiveKit room name, mirroring the original's
    /// `get_session_by_room` (there is no secondary index; session counts
    /// are small enough per-process that this is not a bottleneck).
    pub fn get_by_room(&self, room: &str) -> Option<Session> {
        self.sessions
            .iter()
            .find(|entry| entry.livekit_room.as_deref() == Some(room))
            .map(|entry| entry.clone())
    }

    pub fn list(&self, state: Option<&str>, direction: Option<&str>) -> Result<Vec<Session>> {
        let state_filter = match state {
            Some(s) => Some(
                SessionState::from_str(s)
                    .ok_or_else(|| CoreError::InvalidFilter(s.to_string()))?,
            ),
            None => None,
        };
        let direction_filter = match direction {
            Some(d) => {
                Some(Direction::from_str(d).ok_or_else(|| CoreError::InvalidFilter(d.to_string()))?)
            }
            None => None,
        };

        Ok(self
            .sessions
            .iter()
            .filter(|entry| state_filter.map_or(true, |s| entry.state == s))
            .filter(|entry| direction_filter.map_or(true, |d| entry.direction == d))
            .map(|entry| entry.clone())
            .collect())
    }

    /// Apply a forward transition. Returns the `(from, to)` pair actually
    /// applied, or an error if the transition is illegal or the session is
    /// unknown. Non-monotonic transitions are a programming error, not a
    /// recoverable condition — callers are expected to check preconditions
    /// (e.g. "only transition out of `InboundRinging`") before calling this.
    pub fn transition(&self, session_id: &str, next: SessionState) -> Result<(SessionState, SessionState)> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
        let from = entry.state;
        if !from.can_transition_to(next) {
            return Err(CoreError::InvalidFilter(format!(
                "cannot transition session {session_id} from {} to {}",
                from.as_str(),
                next.as_str()
            )));
        }
        entry.state = next;
        entry.updated_at = Utc::now();
        Ok((from, next))
    }

    /// Idempotent: ending an already-ended session is a no-op that returns
    /// the session unchanged, `end_reason` included.
    pub fn end(&self, session_id: &str, reason: &str) -> Result<Session> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
        if !entry.state.is_terminal() {
            entry.state = SessionState::Ended;
            entry.end_reason = Some(reason.to_string());
            entry.updated_at = Utc::now();
        }
        Ok(entry.clone())
    }

    pub fn set_room(&self, session_id: &str, room: &str) -> Result<()> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
        entry.livekit_room = Some(room.to_string());
        Ok(())
    }

    pub fn set_participant(&self, session_id: &str, participant: &str) -> Result<()> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
        entry.livekit_participant = Some(participant.to_string());
        Ok(())
    }

    /// Record the caller's phone number (PII), pulled from webhook metadata
    /// when the joining participant is recognised as the caller (§4.4).
    /// Only set once — the session's `participant` invariant (iv) mirrors
    /// this: a caller number recorded for one participant never changes
    /// under a different one.
    pub fn set_caller_number(&self, session_id: &str, caller_number: &str) -> Result<()> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
        entry.caller_number = Some(caller_number.to_string());
        Ok(())
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
