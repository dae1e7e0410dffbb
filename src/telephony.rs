//! External collaborator traits (§6): the things this crate talks to but
//! does not implement — the agent's live media session and the provider's
//! room-management API. Everything on the other side of these traits (STT,
//! LLM, TTS, the SIP/media bridge itself) is out of scope.

use async_trait::async_trait;

use crate::error::Result;

/// A live, in-progress agent/telephony session the Observer can speak
/// through and close.
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Speak `text` to the caller. `allow_interruptions` controls whether
    /// the caller can barge in while it plays.
    async fn say(&self, text: &str, allow_interruptions: bool) -> Result<()>;

    /// Close the session gracefully.
    async fn aclose(&self) -> Result<()>;
}

/// The provider's room-management API (§4.7 hangup, §9 provider errors).
#[async_trait]
pub trait RoomService: Send + Sync {
    async fn delete_room(&self, room_name: &str) -> Result<()>;
}

/// `RoomService` backed by an HTTP call to the configured telephony
/// provider, grounded in the same `reqwest` usage the control plane's
/// Observer uses to reach back into this crate's own hangup endpoint.
pub struct HttpRoomService {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl HttpRoomService {
    pub fn new(base_url: String, api_key: String, api_secret: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            api_secret,
        }
    }
}

#[async_trait]
impl RoomService for HttpRoomService {
    async fn delete_room(&self, room_name: &str) -> Result<()> {
        let url = format!("{}/rooms/{}", self.base_url.trim_end_matches('/'), room_name);
        let response = self
            .client
            .delete(&url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(crate::error::CoreError::Provider(format!(
                "delete_room failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}
