//! HTTP collaborators for session negotiation: credential issuers and SDP
//! relays, for both the browser-facing endpoints and the upstream service.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use url::Url;

use super::negotiator::{CredentialIssuer, Credentials, SdpRelay};
use super::SessionError;

pub const OPENAI_REALTIME_API_URL: &str = "https://api.openai.com/v1/realtime";
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

async fn error_message(response: Response, fallback: &str) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|value| value.get("message")?.as_str().map(str::to_string))
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                format!("{} ({})", fallback, status)
            } else {
                format!("{} ({}): {}", fallback, status, body.trim())
            }
        })
}

/// Fetches credentials from a token endpoint that holds the API key.
pub struct HttpCredentialIssuer {
    client: Client,
    token_url: String,
    instructions: Option<String>,
}

impl HttpCredentialIssuer {
    pub fn new<S: Into<String>>(token_url: S) -> Self {
        Self {
            client: Client::new(),
            token_url: token_url.into(),
            instructions: None,
        }
    }

    /// Extra session context appended to the agent instructions.
    pub fn with_instructions<S: Into<String>>(mut self, instructions: S) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

#[async_trait]
impl CredentialIssuer for HttpCredentialIssuer {
    async fn issue(&self) -> Result<Credentials, SessionError> {
        let body = match &self.instructions {
            Some(instructions) if !instructions.trim().is_empty() => {
                json!({ "instructions": instructions })
            }
            _ => json!({}),
        };
        let response = self
            .client
            .post(&self.token_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::Credentials(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SessionError::Credentials(
                error_message(response, "Failed to obtain realtime credentials").await,
            ));
        }
        response
            .json::<Credentials>()
            .await
            .map_err(|e| SessionError::Credentials(e.to_string()))
    }
}

#[derive(Deserialize)]
struct RelayAnswer {
    answer: String,
}

/// Sends the offer to a relay endpoint that forwards it upstream.
pub struct HttpSdpRelay {
    client: Client,
    relay_url: String,
}

impl HttpSdpRelay {
    pub fn new<S: Into<String>>(relay_url: S) -> Self {
        Self {
            client: Client::new(),
            relay_url: relay_url.into(),
        }
    }
}

#[async_trait]
impl SdpRelay for HttpSdpRelay {
    async fn exchange(
        &self,
        credentials: &Credentials,
        offer: &str,
    ) -> Result<String, SessionError> {
        let response = self
            .client
            .post(&self.relay_url)
            .json(&json!({
                "clientSecret": credentials.client_secret,
                "realtimeUrl": credentials.realtime_url,
                "sdp": offer,
            }))
            .send()
            .await
            .map_err(|e| SessionError::Signaling(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SessionError::Signaling(
                error_message(response, "Realtime negotiation failed").await,
            ));
        }
        let answer: RelayAnswer = response
            .json()
            .await
            .map_err(|e| SessionError::Signaling(e.to_string()))?;
        Ok(answer.answer)
    }
}

#[derive(Deserialize)]
struct ClientSecret {
    value: Option<String>,
}

#[derive(Deserialize)]
struct RealtimeSessionResponse {
    client_secret: Option<ClientSecret>,
    url: Option<String>,
}

/// Creates a session directly with the upstream realtime API.
pub struct OpenAiSessionIssuer {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
    voice: Option<String>,
    instructions: String,
    tools: Vec<Value>,
    transcription_model: String,
}

impl OpenAiSessionIssuer {
    pub fn new<K: Into<String>, M: Into<String>>(api_key: K, model: M) -> Self {
        Self {
            client: Client::new(),
            api_base: OPENAI_REALTIME_API_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            voice: None,
            instructions: String::new(),
            tools: Vec::new(),
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
        }
    }

    pub fn with_api_base<S: Into<String>>(mut self, api_base: S) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_voice<S: Into<String>>(mut self, voice: S) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn with_instructions<S: Into<String>>(mut self, instructions: S) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Function tool definitions offered to the model.
    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_transcription_model<S: Into<String>>(mut self, model: S) -> Self {
        self.transcription_model = model.into();
        self
    }

    fn fallback_url(&self) -> Result<String, SessionError> {
        let mut url =
            Url::parse(&self.api_base).map_err(|e| SessionError::Credentials(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("model", &self.model);
            if let Some(voice) = &self.voice {
                query.append_pair("voice", voice);
            }
        }
        Ok(url.to_string())
    }
}

#[async_trait]
impl CredentialIssuer for OpenAiSessionIssuer {
    async fn issue(&self) -> Result<Credentials, SessionError> {
        let mut payload = json!({
            "model": self.model,
            "instructions": self.instructions,
            "tools": self.tools,
            "tool_choice": "auto",
            "input_audio_transcription": { "model": self.transcription_model },
        });
        if let Some(voice) = &self.voice {
            payload["voice"] = json!(voice);
        }

        let response = self
            .client
            .post(format!("{}/sessions", self.api_base))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "realtime=v1")
            .json(&payload)
            .send()
            .await
            .map_err(|e| SessionError::Credentials(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SessionError::Credentials(
                error_message(response, "Failed to create realtime session").await,
            ));
        }

        let body: RealtimeSessionResponse = response
            .json()
            .await
            .map_err(|e| SessionError::Credentials(e.to_string()))?;
        let client_secret = body
            .client_secret
            .and_then(|secret| secret.value)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                SessionError::Credentials(
                    "Realtime session response missing client secret.".to_string(),
                )
            })?;
        let realtime_url = match body.url {
            Some(url) => url,
            None => self.fallback_url()?,
        };

        info!(model = %self.model, "issued realtime session token");
        Ok(Credentials {
            client_secret,
            realtime_url,
        })
    }
}

/// Posts the offer straight to the realtime URL with the client secret.
pub struct DirectSdpRelay {
    client: Client,
}

impl DirectSdpRelay {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for DirectSdpRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SdpRelay for DirectSdpRelay {
    async fn exchange(
        &self,
        credentials: &Credentials,
        offer: &str,
    ) -> Result<String, SessionError> {
        let response = self
            .client
            .post(&credentials.realtime_url)
            .bearer_auth(&credentials.client_secret)
            .header(reqwest::header::CONTENT_TYPE, "application/sdp")
            .header("OpenAI-Beta", "realtime=v1")
            .body(offer.to_string())
            .send()
            .await
            .map_err(|e| SessionError::Signaling(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SessionError::Signaling(
                error_message(response, "Realtime SDP exchange failed").await,
            ));
        }
        response
            .text()
            .await
            .map_err(|e| SessionError::Signaling(e.to_string()))
    }
}
