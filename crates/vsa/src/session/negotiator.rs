//! Establishing the duplex transport with the remote model.
//!
//! The peer connection itself sits behind [`PeerTransport`]; credentials and
//! the SDP exchange go through [`CredentialIssuer`] and [`SdpRelay`] so bearer
//! tokens stay server-side.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{ConnectionState, SessionError};
use crate::channel::{ControlChannel, CONTROL_CHANNEL_LABEL};

/// Short-lived credentials for one realtime session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub client_secret: String,
    pub realtime_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IceGatheringState {
    #[default]
    New,
    Gathering,
    Complete,
}

#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self) -> Result<Credentials, SessionError>;
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn LocalMedia>, SessionError>;
}

/// Captured local media. Stopping releases the device.
pub trait LocalMedia: Send + Sync {
    fn tracks(&self) -> Vec<MediaTrack>;
    fn stop(&mut self);
}

#[async_trait]
pub trait SdpRelay: Send + Sync {
    /// Exchange a local offer for the remote answer.
    async fn exchange(&self, credentials: &Credentials, offer: &str)
        -> Result<String, SessionError>;
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn add_track(&mut self, track: &MediaTrack) -> Result<(), SessionError>;
    fn create_control_channel(&mut self, label: &str) -> Result<ControlChannel, SessionError>;
    /// Create an offer and install it as the local description.
    async fn create_offer(&mut self) -> Result<(), SessionError>;
    /// The local description, including whatever candidates were gathered so far.
    fn local_description(&self) -> Option<String>;
    fn ice_gathering(&self) -> watch::Receiver<IceGatheringState>;
    async fn apply_answer(&mut self, sdp: String) -> Result<(), SessionError>;
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;
    async fn close(&mut self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn PeerTransport>, SessionError>;
}

/// Everything a negotiated session needs, handed over to the driver.
pub struct NegotiatedSession {
    pub transport: Box<dyn PeerTransport>,
    pub media: Box<dyn LocalMedia>,
    pub channel: ControlChannel,
    pub connection: watch::Receiver<ConnectionState>,
}

pub struct Negotiator {
    issuer: Arc<dyn CredentialIssuer>,
    media: Arc<dyn MediaSource>,
    transports: Arc<dyn TransportFactory>,
    relay: Arc<dyn SdpRelay>,
    ice_timeout: Duration,
}

impl Negotiator {
    pub fn new(
        issuer: Arc<dyn CredentialIssuer>,
        media: Arc<dyn MediaSource>,
        transports: Arc<dyn TransportFactory>,
        relay: Arc<dyn SdpRelay>,
    ) -> Self {
        Self {
            issuer,
            media,
            transports,
            relay,
            ice_timeout: Duration::from_millis(3000),
        }
    }

    pub fn with_ice_timeout(mut self, timeout: Duration) -> Self {
        self.ice_timeout = timeout;
        self
    }

    /// Negotiate a session. On any failure every resource acquired so far is
    /// released; a partial session is never returned.
    pub async fn negotiate(&self) -> Result<NegotiatedSession, SessionError> {
        let (credentials, mut media) = self.prepare().await?;

        let mut transport = match self.transports.create().await {
            Ok(transport) => transport,
            Err(e) => {
                media.stop();
                return Err(e);
            }
        };

        match self
            .connect(transport.as_mut(), media.as_ref(), &credentials)
            .await
        {
            Ok(channel) => {
                info!(label = channel.label(), "realtime session negotiated");
                let connection = transport.connection_state();
                Ok(NegotiatedSession {
                    transport,
                    media,
                    channel,
                    connection,
                })
            }
            Err(e) => {
                warn!(error = %e, "negotiation failed; releasing resources");
                transport.close().await;
                media.stop();
                Err(e)
            }
        }
    }

    /// Issue credentials and acquire media concurrently. When one side fails
    /// the other is abandoned, and media that was already acquired is stopped.
    async fn prepare(&self) -> Result<(Credentials, Box<dyn LocalMedia>), SessionError> {
        let issue = self.issuer.issue();
        let acquire = self.media.acquire();
        tokio::pin!(issue, acquire);

        tokio::select! {
            credentials = &mut issue => {
                let credentials = credentials?;
                let media = acquire.await?;
                Ok((credentials, media))
            }
            media = &mut acquire => {
                let mut media = media?;
                match issue.await {
                    Ok(credentials) => Ok((credentials, media)),
                    Err(e) => {
                        media.stop();
                        Err(e)
                    }
                }
            }
        }
    }

    async fn connect(
        &self,
        transport: &mut dyn PeerTransport,
        media: &dyn LocalMedia,
        credentials: &Credentials,
    ) -> Result<ControlChannel, SessionError> {
        for track in media.tracks() {
            transport.add_track(&track)?;
        }
        // The channel has to exist before the offer so it is part of the description.
        let channel = transport.create_control_channel(CONTROL_CHANNEL_LABEL)?;
        transport.create_offer().await?;
        self.wait_for_ice(transport).await;

        let offer = transport.local_description().ok_or_else(|| {
            SessionError::Transport("Local description missing after offer".to_string())
        })?;
        let answer = self.relay.exchange(credentials, &offer).await?;
        transport.apply_answer(answer).await?;
        Ok(channel)
    }

    async fn wait_for_ice(&self, transport: &dyn PeerTransport) {
        let mut gathering = transport.ice_gathering();
        let complete = async {
            gathering
                .wait_for(|state| *state == IceGatheringState::Complete)
                .await
                .map(|_| ())
        };
        match tokio::time::timeout(self.ice_timeout, complete).await {
            Ok(Ok(())) => debug!("ICE gathering complete"),
            Ok(Err(_)) => debug!("ICE gathering state closed; using gathered candidates"),
            Err(_) => info!(
                timeout_ms = self.ice_timeout.as_millis() as u64,
                "ICE gathering timed out; proceeding with gathered candidates"
            ),
        }
    }
}
