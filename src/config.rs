//! Runtime configuration, loaded once at startup from the environment.
//!
//! Mirrors the validation posture of the original control plane: required
//! fields are checked eagerly and missing ones refuse to start (§7 "Fatal
//! conditions"). An optional `.env` file is loaded first so local
//! development doesn't require exporting every variable by hand.

use std::time::Duration;

use crate::error::{CoreError, Result};

/// Telephony provider connection details plus every timing threshold the
/// Observer (C7) needs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the telephony provider's room/session API.
    pub telephony_url: String,
    pub telephony_api_key: String,
    pub telephony_api_secret: String,

    /// Shared secret used to verify inbound webhook signatures.
    pub webhook_secret: String,

    /// Caller ID used for outbound calls.
    pub caller_id: String,

    /// Base URL the Observer uses to POST hangup requests to the control
    /// plane's own HTTP surface (§6, §9 "Graceful-close back-pressure").
    pub control_plane_url: String,

    pub processing_delay_ack_ms: u64,
    pub user_silence_reprompt_ms: u64,
    pub user_silence_close_ms: u64,
    pub max_call_duration_seconds: i64,

    /// Bound on the in-memory event ring (§3).
    pub max_events: usize,

    /// Address the control HTTP surface binds to.
    pub bind_address: String,
}

impl Config {
    /// Load configuration from the environment, validating required fields.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = std::env::var("CALLCORE_ENV_FILE") {
            let _ = dotenvy::from_path(path);
        } else {
            let _ = dotenvy::dotenv();
        }

        let telephony_url = require_env("TELEPHONY_URL")?;
        let telephony_api_key = require_env("TELEPHONY_API_KEY")?;
        let telephony_api_secret = require_env("TELEPHONY_API_SECRET")?;

        let webhook_secret = std::env::var("WEBHOOK_SECRET")
            .unwrap_or_else(|_| telephony_api_secret.clone());

        let caller_id =
            std::env::var("CALLER_ID").unwrap_or_else(|_| "+3197010206472".to_string());

        let control_plane_url = std::env::var("CONTROL_PLANE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8000".to_string());

        Ok(Self {
            telephony_url,
            telephony_api_key,
            telephony_api_secret,
            webhook_secret,
            caller_id,
            control_plane_url,
            processing_delay_ack_ms: env_u64("VP_PROCESSING_DELAY_ACK_MS", 900),
            user_silence_reprompt_ms: env_u64("VP_USER_SILENCE_REPROMPT_MS", 7000),
            user_silence_close_ms: env_u64("VP_USER_SILENCE_CLOSE_MS", 14000),
            max_call_duration_seconds: env_i64("MAX_CALL_DURATION_SECONDS", 0),
            max_events: env_u64("CALLCORE_MAX_EVENTS", 10_000) as usize,
            bind_address: std::env::var("CALLCORE_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
        })
    }

    pub fn processing_delay_ack(&self) -> Duration {
        Duration::from_millis(self.processing_delay_ack_ms)
    }

    pub fn user_silence_reprompt(&self) -> Duration {
        Duration::from_millis(self.user_silence_reprompt_ms)
    }

    pub fn user_silence_close(&self) -> Duration {
        Duration::from_millis(self.user_silence_close_ms)
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CoreError::Configuration(format!("{key} is required")))
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "TELEPHONY_URL",
            "TELEPHONY_API_KEY",
            "TELEPHONY_API_SECRET",
            "WEBHOOK_SECRET",
            "CALLER_ID",
            "CONTROL_PLANE_URL",
            "VP_PROCESSING_DELAY_ACK_MS",
            "VP_USER_SILENCE_REPROMPT_MS",
            "VP_USER_SILENCE_CLOSE_MS",
            "MAX_CALL_DURATION_SECONDS",
            "CALLCORE_MAX_EVENTS",
            "CALLCORE_BIND_ADDR",
            "CALLCORE_ENV_FILE",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn refuses_to_start_without_required_fields() {
        clear_env();
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    #[serial]
    fn loads_defaults_when_optional_fields_absent() {
        clear_env();
        std::env::set_var("TELEPHONY_URL", "https://telephony.example.com");
        std::env::set_var("TELEPHONY_API_KEY", "key");
        std::env::set_var("TELEPHONY_API_SECRET", "secret");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.webhook_secret, "secret");
        assert_eq!(cfg.user_silence_reprompt_ms, 7000);
        assert_eq!(cfg.user_silence_close_ms, 14000);
        assert_eq!(cfg.max_call_duration_seconds, 0);
        clear_env();
    }
}
