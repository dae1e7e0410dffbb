//! Per-call Observer (C7): the timing engine that watches one call's turn
//! sequence and reacts on the caller's behalf when the agent is slow,
//! silent, or has talked for too long.
//!
//! All scheduled reactions (processing-delay ack, silence reprompt/close,
//! max-duration guard) are implemented as `tokio::spawn`ed timers guarded by
//! an epoch counter: arming or cancelling a timer bumps its epoch, and a
//! fired timer checks its epoch is still current before acting. Tests drive
//! these deterministically with `tokio::time::{pause, advance}`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::Config;
use crate::events::{EventEmitter, Fields, Pii, Severity};
use crate::telephony::AgentSession;

const DELAY_ACK_PHRASE: &str = "Momentje, ik denk even mee.";
const REPROMPT_PHRASE: &str = "Ben je er nog?";
const CLOSE_PHRASE: &str = "Oké, ik hoor even niks. Ik hang op. Fijne dag!";
const MAX_DURATION_WARNING_PHRASE: &str =
    "De maximale gesprekduur is bijna bereikt, het gesprek wordt over 15 seconde afgebroken";
const MAX_DURATION_WARNING_LEAD: Duration = Duration::from_secs(20);

/// Why a TTS segment stopped playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsStopCause {
    Completed,
    BargeIn,
    Error,
}

impl TtsStopCause {
    fn as_str(&self) -> &'static str {
        match self {
            TtsStopCause::Completed => "completed",
            TtsStopCause::BargeIn => "barge_in",
            TtsStopCause::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SilenceKind {
    Processing,
    User,
}

impl SilenceKind {
    fn as_str(&self) -> &'static str {
        match self {
            SilenceKind::Processing => "processing",
            SilenceKind::User => "user",
        }
    }
}

struct Timing {
    processing_delay_ack: Duration,
    user_silence_reprompt: Duration,
    user_silence_close: Duration,
    max_call_duration: Option<Duration>,
}

impl Timing {
    fn from_config(config: &Config) -> Self {
        let max_call_duration = if config.max_call_duration_seconds > 0 {
            Some(Duration::from_secs(config.max_call_duration_seconds as u64))
        } else {
            None
        };
        Self {
            processing_delay_ack: config.processing_delay_ack(),
            user_silence_reprompt: config.user_silence_reprompt(),
            user_silence_close: config.user_silence_close(),
            max_call_duration,
        }
    }
}

/// Watches one call. Constructed once per session and attached to its
/// agent session after the greeting is (attempted to be) spoken.
pub struct Observer {
    session_id: String,
    emitter: Arc<EventEmitter>,
    agent: Arc<dyn AgentSession>,
    http: reqwest::Client,
    control_plane_url: String,
    timing: Timing,

    turn_counter: AtomicU64,
    processing_epoch: Arc<AtomicU64>,
    silence_epoch: Arc<AtomicU64>,
    max_duration_epoch: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,

    current_turn_id: Mutex<Option<String>>,
    tts_started_at: Mutex<Option<Instant>>,
    llm_request_at: Mutex<Option<Instant>>,
    barge_in_at: Mutex<Option<Instant>>,
}

impl Observer {
    pub fn new(
        session_id: String,
        emitter: Arc<EventEmitter>,
        agent: Arc<dyn AgentSession>,
        config: &Config,
    ) -> Self {
        Self {
            session_id,
            emitter,
            agent,
            http: reqwest::Client::new(),
            control_plane_url: config.control_plane_url.clone(),
            timing: Timing::from_config(config),
            turn_counter: AtomicU64::new(0),
            processing_epoch: Arc::new(AtomicU64::new(0)),
            silence_epoch: Arc::new(AtomicU64::new(0)),
            max_duration_epoch: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            current_turn_id: Mutex::new(None),
            tts_started_at: Mutex::new(None),
            llm_request_at: Mutex::new(None),
            barge_in_at: Mutex::new(None),
        }
    }

    fn next_turn_id(&self) -> String {
        let n = self.turn_counter.fetch_add(1, Ordering::SeqCst);
        format!("turn_{n}")
    }

    /// Called once the greeting has been attempted (successfully or not) —
    /// the safety net must arm regardless (§4.5).
    pub fn attach_to_session(&self) {
        self.arm_max_duration_guard();
        self.arm_user_silence_timer();
    }

    // --- Turn lifecycle ---

    pub fn on_user_input_transcribed(
        &self,
        text: &str,
        language: Option<&str>,
        transcript_delay_ms: Option<u64>,
    ) {
        self.cancel_user_silence_timer();

        self.emitter.emit(
            "stt.final",
            &self.session_id,
            Severity::Info,
            None,
            Some(Pii::audit_only(vec!["transcript_text".to_string()])),
            Fields::new()
                .set("transcript_length", text.chars().count() as u64)
                .set("transcript_text", text)
                .set_opt("language", language)
                .set_opt("transcript_delay_ms", transcript_delay_ms)
                .build(),
        );

        let turn_id = self.next_turn_id();
        *self.current_turn_id.lock() = Some(turn_id.clone());

        self.emitter.emit(
            "turn.started",
            &self.session_id,
            Severity::Info,
            Some(&turn_id),
            None,
            Fields::new().build(),
        );

        self.arm_processing_delay_timer(turn_id);
    }

    pub fn on_llm_request(&self, prompt_tokens: Option<u64>) {
        *self.llm_request_at.lock() = Some(Instant::now());
        let turn_id = self.current_turn_id.lock().clone();
        self.emitter.emit(
            "llm.request",
            &self.session_id,
            Severity::Info,
            turn_id.as_deref(),
            None,
            Fields::new().set_opt("prompt_tokens", prompt_tokens).build(),
        );
    }

    /// The first LLM response text becomes known, typically when it's
    /// handed to TTS. `latency_ms` is measured from the matching
    /// `llm.request` (§4.5).
    pub fn on_llm_response(&self, text: &str) {
        self.cancel_processing_delay_timer();
        let turn_id = self.current_turn_id.lock().clone();
        let requested_at = self.llm_request_at.lock().take();
        let latency_ms = requested_at.map(|t| Instant::now().duration_since(t).as_millis() as u64);

        self.emitter.emit(
            "llm.response",
            &self.session_id,
            Severity::Info,
            turn_id.as_deref(),
            Some(Pii::audit_only(vec!["response_text".to_string()])),
            Fields::new()
                .set("response_text", text)
                .set_opt("latency_ms", latency_ms)
                .build(),
        );
    }

    pub fn on_tts_started(&self, text: &str) {
        *self.tts_started_at.lock() = Some(Instant::now());
        let turn_id = self.current_turn_id.lock().clone();
        self.emitter.emit(
            "tts.started",
            &self.session_id,
            Severity::Info,
            turn_id.as_deref(),
            Some(Pii::audit_only(vec!["response_text".to_string()])),
            Fields::new().set("response_text", text).build(),
        );
    }

    /// `latency_ms` is always measured from the matching `tts.started`.
    /// When `cause == BargeIn`, `time_to_tts_stop_ms` is additionally
    /// measured from the `barge_in.detected` timestamp, not from
    /// `tts.started` (§4.5 Barge-in).
    pub fn on_tts_stopped(&self, cause: TtsStopCause) {
        let turn_id = self.current_turn_id.lock().clone();
        let started_at = self.tts_started_at.lock().take();
        let latency_ms =
            started_at.map(|started| Instant::now().duration_since(started).as_millis() as u64);

        let mut fields = Fields::new()
            .set("cause", cause.as_str())
            .set_opt("latency_ms", latency_ms);

        if cause == TtsStopCause::BargeIn {
            if let Some(barge_in_at) = self.barge_in_at.lock().take() {
                fields = fields.set(
                    "time_to_tts_stop_ms",
                    Instant::now().duration_since(barge_in_at).as_millis() as u64,
                );
            }
        }

        self.emitter.emit(
            "tts.stopped",
            &self.session_id,
            Severity::Info,
            turn_id.as_deref(),
            None,
            fields.build(),
        );

        self.arm_user_silence_timer();
    }

    /// User speech arriving while TTS is playing. Any user speech also
    /// cancels the user-silence timer (§4.5).
    pub fn on_user_started_speaking(&self) {
        self.cancel_user_silence_timer();
        if self.tts_started_at.lock().is_none() {
            return;
        }
        *self.barge_in_at.lock() = Some(Instant::now());

        let turn_id = self.current_turn_id.lock().clone();
        self.emitter.emit(
            "barge_in.detected",
            &self.session_id,
            Severity::Info,
            turn_id.as_deref(),
            None,
            Fields::new().build(),
        );
    }

    /// Alias kept for direct callers/tests that drive barge-in detection
    /// without going through the `user_started_speaking` SDK event.
    pub fn on_barge_in_detected(&self) {
        self.barge_in_at.lock().get_or_insert_with(Instant::now);
        let turn_id = self.current_turn_id.lock().clone();
        let elapsed_ms = self
            .tts_started_at
            .lock()
            .map(|started| Instant::now().duration_since(started).as_millis() as u64);

        self.emitter.emit(
            "barge_in.detected",
            &self.session_id,
            Severity::Info,
            turn_id.as_deref(),
            None,
            Fields::new()
                .set_opt("time_to_barge_in_ms", elapsed_ms)
                .build(),
        );
    }

    // --- Processing-delay acknowledgement (§4.5) ---

    fn arm_processing_delay_timer(&self, turn_id: String) {
        let epoch = self.processing_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let epoch_ref = self.processing_epoch.clone();
        let closed = self.closed.clone();
        let emitter = self.emitter.clone();
        let agent = self.agent.clone();
        let session_id = self.session_id.clone();
        let delay = self.timing.processing_delay_ack;

        self.emitter.emit(
            "silence.timer_started",
            &self.session_id,
            Severity::Debug,
            Some(&turn_id),
            None,
            Fields::new()
                .set("kind", SilenceKind::Processing.as_str())
                .build(),
        );

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if closed.load(Ordering::SeqCst) || epoch_ref.load(Ordering::SeqCst) != epoch {
                return;
            }
            emitter.emit(
                "silence.timer_fired",
                &session_id,
                Severity::Info,
                Some(&turn_id),
                None,
                Fields::new()
                    .set("kind", SilenceKind::Processing.as_str())
                    .set("threshold_ms", delay.as_millis() as u64)
                    .build(),
            );
            let _ = agent.say(DELAY_ACK_PHRASE, true).await;
            emitter.emit(
                "ux.delay_acknowledged",
                &session_id,
                Severity::Info,
                Some(&turn_id),
                None,
                Fields::new().set("message_key", "delay_ack.thinking").build(),
            );
        });
    }

    fn cancel_processing_delay_timer(&self) {
        self.processing_epoch.fetch_add(1, Ordering::SeqCst);
    }

    // --- User silence reprompt + close (§4.5) ---

    /// Arm (or re-arm) the user-silence watchdog. Safe to call repeatedly;
    /// each call invalidates any timers already in flight.
    pub fn arm_user_silence_timer(&self) {
        let epoch = self.silence_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let reprompt = self.timing.user_silence_reprompt;
        let close = self.timing.user_silence_close;

        self.emitter.emit(
            "silence.timer_started",
            &self.session_id,
            Severity::Debug,
            None,
            None,
            Fields::new().set("kind", SilenceKind::User.as_str()).build(),
        );

        if close <= reprompt {
            self.spawn_close_timer(epoch, close);
        } else {
            self.spawn_reprompt_timer(epoch, reprompt, close);
        }
    }

    pub fn cancel_user_silence_timer(&self) {
        self.silence_epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn spawn_reprompt_timer(&self, epoch: u64, reprompt: Duration, close: Duration) {
        let epoch_ref = self.silence_epoch.clone();
        let closed = self.closed.clone();
        let emitter = self.emitter.clone();
        let agent = self.agent.clone();
        let session_id = self.session_id.clone();
        let http = self.http.clone();
        let control_plane_url = self.control_plane_url.clone();
        let remaining_to_close = close.saturating_sub(reprompt);

        tokio::spawn(async move {
            tokio::time::sleep(reprompt).await;
            if closed.load(Ordering::SeqCst) || epoch_ref.load(Ordering::SeqCst) != epoch {
                return;
            }
            emitter.emit(
                "silence.timer_fired",
                &session_id,
                Severity::Info,
                None,
                None,
                Fields::new()
                    .set("kind", SilenceKind::User.as_str())
                    .set("threshold_ms", reprompt.as_millis() as u64)
                    .build(),
            );
            let _ = agent.say(REPROMPT_PHRASE, true).await;

            tokio::time::sleep(remaining_to_close).await;
            if closed.load(Ordering::SeqCst) || epoch_ref.load(Ordering::SeqCst) != epoch {
                return;
            }
            close_for_silence(&emitter, &agent, &http, &control_plane_url, &session_id, close).await;
        });
    }

    fn spawn_close_timer(&self, epoch: u64, close: Duration) {
        let epoch_ref = self.silence_epoch.clone();
        let closed = self.closed.clone();
        let emitter = self.emitter.clone();
        let agent = self.agent.clone();
        let session_id = self.session_id.clone();
        let http = self.http.clone();
        let control_plane_url = self.control_plane_url.clone();

        tokio::spawn(async move {
            tokio::time::sleep(close).await;
            if closed.load(Ordering::SeqCst) || epoch_ref.load(Ordering::SeqCst) != epoch {
                return;
            }
            close_for_silence(&emitter, &agent, &http, &control_plane_url, &session_id, close).await;
        });
    }

    // --- Maximum call duration guard (§4.5) ---

    fn arm_max_duration_guard(&self) {
        let Some(max) = self.timing.max_call_duration else {
            return;
        };
        let epoch = self.max_duration_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let epoch_ref = self.max_duration_epoch.clone();
        let closed = self.closed.clone();
        let emitter = self.emitter.clone();
        let agent = self.agent.clone();
        let session_id = self.session_id.clone();
        let http = self.http.clone();
        let control_plane_url = self.control_plane_url.clone();

        let warn_after = max.saturating_sub(MAX_DURATION_WARNING_LEAD);

        tokio::spawn(async move {
            if warn_after > Duration::ZERO {
                tokio::time::sleep(warn_after).await;
                if closed.load(Ordering::SeqCst) || epoch_ref.load(Ordering::SeqCst) != epoch {
                    return;
                }
                let _ = agent.say(MAX_DURATION_WARNING_PHRASE, false).await;
            }

            tokio::time::sleep(max.saturating_sub(warn_after)).await;
            if closed.load(Ordering::SeqCst) || epoch_ref.load(Ordering::SeqCst) != epoch {
                return;
            }
            emitter.emit(
                "call.ended",
                &session_id,
                Severity::Info,
                None,
                None,
                Fields::new().set("reason", "max_duration_reached").build(),
            );
            let cp_ok = request_hangup(&http, &control_plane_url, &session_id, "max_duration_reached").await;
            if !cp_ok {
                let _ = agent.aclose().await;
            }
        });
    }

    /// Cancel every outstanding timer and close the agent session. Safe to
    /// call more than once.
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.processing_epoch.fetch_add(1, Ordering::SeqCst);
        self.silence_epoch.fetch_add(1, Ordering::SeqCst);
        self.max_duration_epoch.fetch_add(1, Ordering::SeqCst);

        self.emitter.emit(
            "call.ended",
            &self.session_id,
            Severity::Info,
            None,
            None,
            Fields::new().set("reason", reason).build(),
        );
        let _ = self.agent.aclose().await;
    }
}

async fn close_for_silence(
    emitter: &EventEmitter,
    agent: &Arc<dyn AgentSession>,
    http: &reqwest::Client,
    control_plane_url: &str,
    session_id: &str,
    threshold: Duration,
) {
    emitter.emit(
        "silence.timer_fired",
        session_id,
        Severity::Info,
        None,
        None,
        Fields::new()
            .set("kind", SilenceKind::User.as_str())
            .set("threshold_ms", threshold.as_millis() as u64)
            .build(),
    );
    let _ = agent.say(CLOSE_PHRASE, false).await;
    emitter.emit(
        "call.ended",
        session_id,
        Severity::Info,
        None,
        None,
        Fields::new().set("reason", "user_silence_timeout").build(),
    );
    let cp_ok = request_hangup(http, control_plane_url, session_id, "user_silence_timeout").await;
    if !cp_ok {
        let _ = agent.aclose().await;
    }
}

/// POST a hangup request to the control plane's own HTTP surface, per the
/// graceful-close back-pressure path (§6, §9). Returns whether the control
/// plane applied it (2xx) — the caller only falls back to closing the agent
/// session locally when this comes back false, since a successful hangup
/// already tears the room down from the control plane side.
async fn request_hangup(
    http: &reqwest::Client,
    control_plane_url: &str,
    session_id: &str,
    reason: &str,
) -> bool {
    let url = format!("{}/control/call/hangup", control_plane_url.trim_end_matches('/'));
    match http
        .post(&url)
        .json(&serde_json::json!({ "session_id": session_id, "reason": reason }))
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStore;
    use crate::events::Component;
    use crate::telephony::mocks::MockAgentSession;
    use std::sync::atomic::Ordering as O;

    fn test_config() -> Config {
        Config {
            telephony_url: "https://telephony.example.com".to_string(),
            telephony_api_key: "key".to_string(),
            telephony_api_secret: "secret".to_string(),
            webhook_secret: "secret".to_string(),
            caller_id: "+3197010206472".to_string(),
            control_plane_url: "http://127.0.0.1:9999".to_string(),
            processing_delay_ack_ms: 900,
            user_silence_reprompt_ms: 7000,
            user_silence_close_ms: 14000,
            max_call_duration_seconds: 0,
            max_events: 1000,
            bind_address: "0.0.0.0:8000".to_string(),
        }
    }

    fn observer(agent: Arc<MockAgentSession>, config: &Config) -> (Observer, Arc<EventStore>) {
        let store = Arc::new(EventStore::new(1000));
        let emitter = Arc::new(EventEmitter::new(Component::VoicePipeline, store.clone()));
        let obs = Observer::new("sess-1".to_string(), emitter, agent, config);
        (obs, store)
    }

    #[tokio::test(start_paused = true)]
    async fn processing_delay_ack_fires_when_llm_is_slow() {
        let config = test_config();
        let agent = Arc::new(MockAgentSession::default());
        let (obs, _store) = observer(agent.clone(), &config);

        obs.on_user_input_transcribed("hallo", None, None);
        tokio::time::advance(Duration::from_millis(950)).await;
        tokio::task::yield_now().await;

        let said = agent.said.lock().unwrap();
        assert!(said.iter().any(|(text, _)| text == DELAY_ACK_PHRASE));
    }

    #[tokio::test(start_paused = true)]
    async fn processing_delay_ack_is_cancelled_by_fast_llm_response() {
        let config = test_config();
        let agent = Arc::new(MockAgentSession::default());
        let (obs, _store) = observer(agent.clone(), &config);

        obs.on_user_input_transcribed("hallo", None, None);
        obs.on_llm_response("hoi");
        tokio::time::advance(Duration::from_millis(950)).await;
        tokio::task::yield_now().await;

        let said = agent.said.lock().unwrap();
        assert!(!said.iter().any(|(text, _)| text == DELAY_ACK_PHRASE));
    }

    #[tokio::test(start_paused = true)]
    async fn user_silence_reprompts_then_closes() {
        let config = test_config();
        let agent = Arc::new(MockAgentSession::default());
        let (obs, _store) = observer(agent.clone(), &config);

        obs.arm_user_silence_timer();
        tokio::time::advance(Duration::from_millis(7050)).await;
        tokio::task::yield_now().await;
        assert!(agent
            .said
            .lock()
            .unwrap()
            .iter()
            .any(|(text, _)| text == REPROMPT_PHRASE));

        tokio::time::advance(Duration::from_millis(7050)).await;
        tokio::task::yield_now().await;
        assert!(agent
            .said
            .lock()
            .unwrap()
            .iter()
            .any(|(text, _)| text == CLOSE_PHRASE));
        assert!(agent.closed.load(O::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn user_silence_closes_without_reprompt_when_close_not_after_reprompt() {
        let mut config = test_config();
        config.user_silence_reprompt_ms = 7000;
        config.user_silence_close_ms = 5000;
        let agent = Arc::new(MockAgentSession::default());
        let (obs, _store) = observer(agent.clone(), &config);

        obs.arm_user_silence_timer();
        tokio::time::advance(Duration::from_millis(5050)).await;
        tokio::task::yield_now().await;

        let said = agent.said.lock().unwrap();
        assert!(!said.iter().any(|(text, _)| text == REPROMPT_PHRASE));
        assert!(said.iter().any(|(text, _)| text == CLOSE_PHRASE));
    }

    #[tokio::test(start_paused = true)]
    async fn user_activity_cancels_the_silence_timer() {
        let config = test_config();
        let agent = Arc::new(MockAgentSession::default());
        let (obs, _store) = observer(agent.clone(), &config);

        obs.arm_user_silence_timer();
        tokio::time::advance(Duration::from_millis(3000)).await;
        obs.cancel_user_silence_timer();
        tokio::time::advance(Duration::from_millis(20_000)).await;
        tokio::task::yield_now().await;

        assert!(agent.said.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn barge_in_reports_elapsed_time_since_tts_started() {
        let config = test_config();
        let agent = Arc::new(MockAgentSession::default());
        let (obs, store) = observer(agent.clone(), &config);

        obs.on_tts_started("hoi daar");
        tokio::time::advance(Duration::from_millis(250)).await;
        obs.on_barge_in_detected();

        let events = store.query(&crate::events::EventQuery {
            event_type: Some("barge_in.detected".to_string()),
            ..Default::default()
        });
        assert_eq!(events.len(), 1);
        let elapsed = events[0]
            .fields
            .get("time_to_barge_in_ms")
            .and_then(|v| v.as_u64())
            .unwrap();
        assert!(elapsed >= 250);
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_cancels_outstanding_timers() {
        let config = test_config();
        let agent = Arc::new(MockAgentSession::default());
        let (obs, _store) = observer(agent.clone(), &config);

        obs.arm_user_silence_timer();
        obs.close("call.hangup").await;
        obs.close("call.hangup").await;
        tokio::time::advance(Duration::from_millis(20_000)).await;
        tokio::task::yield_now().await;

        assert!(!agent
            .said
            .lock()
            .unwrap()
            .iter()
            .any(|(text, _)| text == REPROMPT_PHRASE || text == CLOSE_PHRASE));
        assert!(agent.closed.load(O::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn tts_stopped_with_barge_in_measures_from_barge_in_not_tts_start() {
        let config = test_config();
        let agent = Arc::new(MockAgentSession::default());
        let (obs, store) = observer(agent.clone(), &config);

        obs.on_tts_started("hoi daar");
        tokio::time::advance(Duration::from_millis(100)).await;
        obs.on_user_started_speaking();
        tokio::time::advance(Duration::from_millis(80)).await;
        obs.on_tts_stopped(TtsStopCause::BargeIn);

        let barge_ins = store.query(&crate::events::EventQuery {
            event_type: Some("barge_in.detected".to_string()),
            ..Default::default()
        });
        assert_eq!(barge_ins.len(), 1);

        let stops = store.query(&crate::events::EventQuery {
            event_type: Some("tts.stopped".to_string()),
            ..Default::default()
        });
        assert_eq!(stops.len(), 1);
        assert_eq!(
            stops[0].fields.get("cause").and_then(|v| v.as_str()),
            Some("barge_in")
        );
        let time_to_stop = stops[0]
            .fields
            .get("time_to_tts_stop_ms")
            .and_then(|v| v.as_u64())
            .unwrap();
        assert!((80..120).contains(&time_to_stop), "got {time_to_stop}");
        // latency_ms is measured from tts.started instead (100 + 80 = 180ms).
        let latency = stops[0].fields.get("latency_ms").and_then(|v| v.as_u64()).unwrap();
        assert!((180..220).contains(&latency), "got {latency}");
    }

    #[tokio::test(start_paused = true)]
    async fn user_started_speaking_is_ignored_when_tts_is_not_playing() {
        let config = test_config();
        let agent = Arc::new(MockAgentSession::default());
        let (obs, store) = observer(agent.clone(), &config);

        obs.on_user_started_speaking();

        let barge_ins = store.query(&crate::events::EventQuery {
            event_type: Some("barge_in.detected".to_string()),
            ..Default::default()
        });
        assert!(barge_ins.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn llm_response_latency_is_measured_from_llm_request() {
        let config = test_config();
        let agent = Arc::new(MockAgentSession::default());
        let (obs, store) = observer(agent.clone(), &config);

        obs.on_user_input_transcribed("hallo", Some("nl"), None);
        obs.on_llm_request(None);
        tokio::time::advance(Duration::from_millis(120)).await;
        obs.on_llm_response("hoi daar");

        let responses = store.query(&crate::events::EventQuery {
            event_type: Some("llm.response".to_string()),
            ..Default::default()
        });
        assert_eq!(responses.len(), 1);
        let latency = responses[0]
            .fields
            .get("latency_ms")
            .and_then(|v| v.as_u64())
            .unwrap();
        assert!(latency >= 120);
        assert!(responses[0].pii.contains_pii);
    }
}
