//! The control channel: JSON text frames in both directions, multiplexed with
//! the media session by the transport.

use tokio::sync::mpsc;

use crate::session::SessionError;

/// Label of the data channel the remote service expects events on.
pub const CONTROL_CHANNEL_LABEL: &str = "oai-events";

/// Inbound frames the driver may fall behind by before the transport has to
/// wait.
pub const DEFAULT_INBOUND_CAPACITY: usize = 256;

/// Outbound half, cloneable so tool results can be written from anywhere in
/// the session.
#[derive(Debug, Clone)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<String>,
}

impl ControlSender {
    pub fn send(&self, frame: String) -> Result<(), SessionError> {
        self.tx.send(frame).map_err(|_| SessionError::ChannelClosed)
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// The engine's end of a control channel.
#[derive(Debug)]
pub struct ControlChannel {
    label: String,
    sender: ControlSender,
    inbound: mpsc::Receiver<String>,
}

/// The transport's end: frames the engine sent, and a way to deliver frames
/// received from the remote service.
///
/// The inbound queue is bounded. `inbound.send(..).await` waits while the
/// driver is behind; `try_send` lets a transport that cannot wait drop or
/// buffer the frame itself.
#[derive(Debug)]
pub struct ControlPeer {
    pub outbound: mpsc::UnboundedReceiver<String>,
    pub inbound: mpsc::Sender<String>,
}

impl ControlChannel {
    pub fn pair(label: &str) -> (ControlChannel, ControlPeer) {
        Self::pair_with_capacity(label, DEFAULT_INBOUND_CAPACITY)
    }

    /// Panics if `capacity` is zero.
    pub fn pair_with_capacity(label: &str, capacity: usize) -> (ControlChannel, ControlPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(capacity);
        (
            ControlChannel {
                label: label.to_string(),
                sender: ControlSender { tx: out_tx },
                inbound: in_rx,
            },
            ControlPeer {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn sender(&self) -> ControlSender {
        self.sender.clone()
    }

    pub(crate) fn into_parts(self) -> (ControlSender, mpsc::Receiver<String>) {
        (self.sender, self.inbound)
    }
}
