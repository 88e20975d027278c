use std::net::{IpAddr, SocketAddr};

use parley_types::{EndReason, Event};

use crate::audio::AudioError;

/// An invitation waiting for the user to accept or reject it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInvite {
    pub from: String,
    pub to: String,
    pub is_group: bool,
    pub caller_ip: IpAddr,
    pub caller_udp_port: u16,
    pub call_id: String,
}

impl PendingInvite {
    pub fn caller_addr(&self) -> SocketAddr {
        SocketAddr::new(self.caller_ip, self.caller_udp_port)
    }
}

/// What the client surfaces to the application driving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Any server event not consumed by call signaling.
    Server(Event),

    IncomingCall(PendingInvite),

    /// An invite that arrived while busy and was ignored.
    MissedCall { from: String, call_id: String },

    CallConnected {
        peer: String,
        call_id: String,
        remote: SocketAddr,
    },

    CallEnded {
        call_id: Option<String>,
        reason: EndReason,
    },

    /// The server refused to place our call.
    CallRejected { message: String },

    /// The audio device failed; the call was aborted.
    CallFailed(AudioError),

    Disconnected,
}
