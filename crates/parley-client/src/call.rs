//! Client side of call signaling.
//!
//! One call at a time: `Idle -> Calling -> InCall -> Ending -> Idle`. An
//! incoming invite is held as pending while the state stays `Idle`; the
//! user answers it with [`CallService::accept`] or [`CallService::reject`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parley_net::DatagramRelay;
use parley_types::{Command, EndReason};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::audio::{AudioDevice, AudioError};
use crate::event::{ClientEvent, PendingInvite};
use crate::pump::{AudioPump, FaultSender, PlaybackQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Calling,
    InCall,
    Ending,
}

impl CallState {
    pub fn can_advance(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Idle, Calling) | (Calling, InCall) | (Calling, Ending) | (InCall, Ending) | (Ending, Idle)
        )
    }
}

#[derive(Error, Debug)]
pub enum CallError {
    #[error("invalid call transition {from:?} -> {to:?}")]
    InvalidTransition { from: CallState, to: CallState },

    #[error("a call is already in progress")]
    Busy,

    #[error("no incoming call to answer")]
    NoPendingInvite,

    #[error("no active call")]
    NoActiveCall,

    #[error("signaling connection closed")]
    Disconnected,

    #[error(transparent)]
    Audio(#[from] AudioError),
}

/// The call this client is placing or taking part in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveCall {
    /// User or group we called, or the caller whose invite we accepted.
    pub peer: String,
    pub is_group: bool,
    /// Unknown until the server's `call_waiting` arrives.
    pub call_id: Option<String>,
    pub remote: Option<SocketAddr>,
}

struct CallInner {
    state: CallState,
    active: Option<ActiveCall>,
    pending: Option<PendingInvite>,
    pump: Option<AudioPump>,
    /// Ended before the server assigned an id; cancel once it does.
    abandoned_start: bool,
}

pub struct CallService {
    username: String,
    relay: Arc<DatagramRelay>,
    device: Arc<dyn AudioDevice>,
    queue: PlaybackQueue,
    faults: FaultSender,
    outbound: UnboundedSender<Command>,
    events: UnboundedSender<ClientEvent>,
    inner: Mutex<CallInner>,
}

fn advance(inner: &mut CallInner, next: CallState) -> Result<(), CallError> {
    if !inner.state.can_advance(next) {
        return Err(CallError::InvalidTransition {
            from: inner.state,
            to: next,
        });
    }
    debug!("Call state {:?} -> {:?}", inner.state, next);
    inner.state = next;
    Ok(())
}

impl CallService {
    /// Returns the service and the receiver for device faults raised by the
    /// audio threads. Faults must be fed back through
    /// [`CallService::on_device_fault`].
    pub fn new(
        username: impl Into<String>,
        relay: Arc<DatagramRelay>,
        device: Arc<dyn AudioDevice>,
        queue: PlaybackQueue,
        outbound: UnboundedSender<Command>,
        events: UnboundedSender<ClientEvent>,
    ) -> (Self, UnboundedReceiver<AudioError>) {
        let (faults, fault_rx) = mpsc::unbounded_channel();
        let service = Self {
            username: username.into(),
            relay,
            device,
            queue,
            faults,
            outbound,
            events,
            inner: Mutex::new(CallInner {
                state: CallState::Idle,
                active: None,
                pending: None,
                pump: None,
                abandoned_start: false,
            }),
        };
        (service, fault_rx)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> CallState {
        self.lock().state
    }

    pub fn active_call(&self) -> Option<ActiveCall> {
        self.lock().active.clone()
    }

    pub fn pending_invite(&self) -> Option<PendingInvite> {
        self.lock().pending.clone()
    }

    pub fn relay(&self) -> &Arc<DatagramRelay> {
        &self.relay
    }

    /// Place a call to a user or group.
    pub fn start_call(&self, target: &str, is_group: bool) -> Result<(), CallError> {
        let mut inner = self.lock();
        if inner.state != CallState::Idle || inner.pending.is_some() {
            return Err(CallError::Busy);
        }
        if self.outbound.is_closed() {
            return Err(CallError::Disconnected);
        }

        advance(&mut inner, CallState::Calling)?;
        inner.abandoned_start = false;
        inner.active = Some(ActiveCall {
            peer: target.to_string(),
            is_group,
            call_id: None,
            remote: None,
        });

        info!("{} calling {}", self.username, target);
        self.emit(Command::CallStart {
            from: self.username.clone(),
            to: target.to_string(),
            is_group,
            udp_port: self.relay.local_port(),
        })
    }

    pub fn on_call_waiting(&self, call_id: &str) {
        let mut inner = self.lock();
        if inner.state == CallState::Idle && inner.abandoned_start {
            inner.abandoned_start = false;
            debug!("Cancelling call {} ended before it was placed", call_id);
            let _ = self.emit(Command::CallEnd {
                from: self.username.clone(),
                call_id: call_id.to_string(),
            });
            return;
        }

        let calling = inner.state == CallState::Calling;
        match inner.active.as_mut() {
            Some(call) if calling && call.call_id.is_none() => {
                call.call_id = Some(call_id.to_string());
            }
            _ => debug!("Ignoring call_waiting for {}", call_id),
        }
    }

    pub fn on_incoming(&self, invite: PendingInvite) {
        let mut inner = self.lock();
        if inner.state != CallState::Idle || inner.pending.is_some() {
            debug!("{} busy, ignoring invite from {}", self.username, invite.from);
            self.notify(ClientEvent::MissedCall {
                from: invite.from,
                call_id: invite.call_id,
            });
            return;
        }

        info!("Incoming call {} from {}", invite.call_id, invite.from);
        inner.pending = Some(invite.clone());
        self.notify(ClientEvent::IncomingCall(invite));
    }

    /// Answer the pending invite.
    pub fn accept(&self) -> Result<(), CallError> {
        let mut inner = self.lock();
        if inner.state != CallState::Idle {
            return Err(CallError::Busy);
        }
        let invite = inner.pending.take().ok_or(CallError::NoPendingInvite)?;

        advance(&mut inner, CallState::Calling)?;
        let remote = invite.caller_addr();
        inner.active = Some(ActiveCall {
            peer: invite.from.clone(),
            is_group: invite.is_group,
            call_id: Some(invite.call_id.clone()),
            remote: Some(remote),
        });
        self.relay.configure_peer(remote);

        if let Err(e) = self.start_pump(&mut inner) {
            self.abort(&mut inner, e.clone());
            return Err(e.into());
        }
        advance(&mut inner, CallState::InCall)?;

        info!("{} accepted call {} from {}", self.username, invite.call_id, invite.from);
        self.notify(ClientEvent::CallConnected {
            peer: invite.from.clone(),
            call_id: invite.call_id.clone(),
            remote,
        });
        self.emit(Command::CallAccept {
            from: self.username.clone(),
            to: invite.from,
            udp_port: self.relay.local_port(),
            call_id: Some(invite.call_id),
        })
    }

    /// Refuse the pending invite so the server stops ringing us.
    pub fn reject(&self) -> Result<(), CallError> {
        let invite = self.lock().pending.take().ok_or(CallError::NoPendingInvite)?;
        info!("{} rejected call {} from {}", self.username, invite.call_id, invite.from);
        self.emit(Command::CallEnd {
            from: self.username.clone(),
            call_id: invite.call_id,
        })
    }

    pub fn on_call_accepted(&self, from: &str, remote: SocketAddr, call_id: &str) {
        let mut inner = self.lock();
        if inner.state != CallState::Calling {
            debug!("Ignoring call_accepted for {} while {:?}", call_id, inner.state);
            return;
        }
        let Some(call) = inner.active.as_mut() else {
            return;
        };
        if call.call_id.as_deref().is_some_and(|id| id != call_id) {
            debug!("Ignoring call_accepted for stale call {}", call_id);
            return;
        }
        call.call_id = Some(call_id.to_string());
        call.remote = Some(remote);
        self.relay.configure_peer(remote);

        if let Err(e) = self.start_pump(&mut inner) {
            self.abort(&mut inner, e);
            return;
        }
        if let Err(e) = advance(&mut inner, CallState::InCall) {
            warn!("{}", e);
            return;
        }

        info!("{} connected to {} at {}", self.username, from, remote);
        self.notify(ClientEvent::CallConnected {
            peer: from.to_string(),
            call_id: call_id.to_string(),
            remote,
        });
    }

    /// Hang up, or cancel a call that is still ringing.
    pub fn end_call(&self) -> Result<(), CallError> {
        let mut inner = self.lock();
        if !matches!(inner.state, CallState::Calling | CallState::InCall) {
            return Err(CallError::NoActiveCall);
        }
        let call_id = inner.active.as_ref().and_then(|call| call.call_id.clone());
        self.teardown(&mut inner)?;

        self.notify(ClientEvent::CallEnded {
            call_id: call_id.clone(),
            reason: EndReason::Hangup,
        });
        match call_id {
            Some(call_id) => self.emit(Command::CallEnd {
                from: self.username.clone(),
                call_id,
            }),
            None => {
                inner.abandoned_start = true;
                Ok(())
            }
        }
    }

    pub fn on_call_ended(&self, call_id: &str, reason: EndReason) {
        let mut inner = self.lock();

        if inner.pending.as_ref().is_some_and(|invite| invite.call_id == call_id) {
            inner.pending = None;
            debug!("Pending invite {} withdrawn ({})", call_id, reason.as_str());
            self.notify(ClientEvent::CallEnded {
                call_id: Some(call_id.to_string()),
                reason,
            });
            return;
        }

        let current = inner.active.as_ref().and_then(|call| call.call_id.as_deref()) == Some(call_id);
        if !current || !matches!(inner.state, CallState::Calling | CallState::InCall) {
            debug!("Ignoring stale call_ended for {}", call_id);
            return;
        }

        if let Err(e) = self.teardown(&mut inner) {
            warn!("{}", e);
            return;
        }
        info!("Call {} ended: {}", call_id, reason.as_str());
        self.notify(ClientEvent::CallEnded {
            call_id: Some(call_id.to_string()),
            reason,
        });
    }

    /// The server answered our `call_start` with an error.
    pub fn on_call_refused(&self, message: &str) {
        let mut inner = self.lock();
        let unplaced = inner.state == CallState::Calling
            && inner.active.as_ref().is_some_and(|call| call.call_id.is_none());
        if !unplaced {
            debug!("Ignoring call refusal while {:?}: {}", inner.state, message);
            return;
        }
        if let Err(e) = self.teardown(&mut inner) {
            warn!("{}", e);
            return;
        }
        // Should the call have been placed after all, cancel it on arrival.
        inner.abandoned_start = true;
        info!("Call refused by server: {}", message);
        self.notify(ClientEvent::CallRejected {
            message: message.to_string(),
        });
    }

    /// Abort the call after the audio device failed.
    pub fn on_device_fault(&self, error: AudioError) {
        let mut inner = self.lock();
        if !matches!(inner.state, CallState::Calling | CallState::InCall) {
            debug!("Ignoring late device fault: {}", error);
            return;
        }
        self.abort(&mut inner, error);
    }

    /// Local cleanup after the signaling connection is gone.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.pending = None;
        inner.abandoned_start = false;
        if matches!(inner.state, CallState::Calling | CallState::InCall) {
            if let Err(e) = self.teardown(&mut inner) {
                warn!("{}", e);
            }
        }
    }

    fn start_pump(&self, inner: &mut CallInner) -> Result<(), AudioError> {
        if self.relay.is_closed() {
            return Err(AudioError::StreamError("datagram relay closed".into()));
        }
        let pump = AudioPump::start(
            self.device.clone(),
            self.relay.clone(),
            self.queue.clone(),
            self.faults.clone(),
        )?;
        inner.pump = Some(pump);
        Ok(())
    }

    /// `Calling`/`InCall` -> `Ending` -> `Idle`, releasing the pumps and peer.
    fn teardown(&self, inner: &mut CallInner) -> Result<(), CallError> {
        advance(inner, CallState::Ending)?;
        if let Some(mut pump) = inner.pump.take() {
            pump.stop();
        }
        self.relay.clear_peer();
        inner.active = None;
        advance(inner, CallState::Idle)
    }

    fn abort(&self, inner: &mut CallInner, error: AudioError) {
        warn!("{}: aborting call: {}", self.username, error);
        let call_id = inner.active.as_ref().and_then(|call| call.call_id.clone());
        if let Err(e) = self.teardown(inner) {
            warn!("{}", e);
        }
        if let Some(call_id) = call_id {
            let _ = self.emit(Command::CallEnd {
                from: self.username.clone(),
                call_id,
            });
        }
        self.notify(ClientEvent::CallFailed(error));
    }

    fn emit(&self, command: Command) -> Result<(), CallError> {
        self.outbound.send(command).map_err(|_| CallError::Disconnected)
    }

    fn notify(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, CallInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
