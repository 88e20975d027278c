//! Client session: one signaling connection, one datagram relay, one call
//! service. Every command goes through one ordered queue, so the replies
//! the server owes can be matched up. Server events are decoded and either
//! handed to the call signaling thread or passed on to the app.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parley_net::{ConnectionListener, DEFAULT_MAX_RECORD_BYTES, DatagramRelay, NetError, StreamConnection};
use parley_types::{Command, EndReason, Event};
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace, warn};

use crate::audio::{AudioDevice, AudioError};
use crate::call::{CallError, CallService, CallState};
use crate::event::{ClientEvent, PendingInvite};
use crate::pump::{DEFAULT_PLAYBACK_FRAMES, PlaybackQueue};
use crate::replies::{Owed, ReplyLedger};

/// Ports the relay picks from when none is configured.
pub const UDP_PORT_RANGE: Range<u16> = 6000..7000;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("failed to start signaling thread: {0}")]
    Thread(std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the chat server.
    pub server_addr: String,
    pub udp_bind: SocketAddr,
    pub playback_frames: usize,
    pub max_record_bytes: usize,
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>) -> Self {
        let port = rand::rng().random_range(UDP_PORT_RANGE);
        Self {
            server_addr: server_addr.into(),
            udp_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            playback_frames: DEFAULT_PLAYBACK_FRAMES,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }
}

/// Call signaling inputs, applied in arrival order on one thread. Ending
/// or starting a call joins or spawns audio threads, which must not happen
/// on the connection's reader task.
enum Signal {
    Incoming(PendingInvite),
    Waiting(String),
    Accepted {
        from: String,
        remote: SocketAddr,
        call_id: String,
    },
    Ended {
        call_id: String,
        reason: EndReason,
    },
    Refused(String),
    Fault(AudioError),
    Shutdown,
}

fn signal_loop(calls: Arc<CallService>, signals: Receiver<Signal>) {
    for signal in signals.iter() {
        match signal {
            Signal::Incoming(invite) => calls.on_incoming(invite),
            Signal::Waiting(call_id) => calls.on_call_waiting(&call_id),
            Signal::Accepted { from, remote, call_id } => {
                calls.on_call_accepted(&from, remote, &call_id)
            }
            Signal::Ended { call_id, reason } => calls.on_call_ended(&call_id, reason),
            Signal::Refused(message) => calls.on_call_refused(&message),
            Signal::Fault(error) => calls.on_device_fault(error),
            Signal::Shutdown => {
                calls.shutdown();
                break;
            }
        }
    }
    debug!("Signal loop for {} exiting", calls.username());
}

struct ClientListener {
    replies: Arc<ReplyLedger>,
    signals: Sender<Signal>,
    events: UnboundedSender<ClientEvent>,
}

impl ClientListener {
    fn signal(&self, signal: Signal) {
        if self.signals.send(signal).is_err() {
            debug!("Signal loop gone, dropping call event");
        }
    }
}

impl ConnectionListener for ClientListener {
    fn on_record(&self, _conn: &StreamConnection, record: String) {
        let event = match Event::decode(&record) {
            Ok(event) => event,
            Err(e) => {
                warn!("Undecodable record from server: {}", e);
                return;
            }
        };
        trace!("<- {}", event.name());

        if let Event::Error { message } = &event {
            if self.replies.resolve_error() == Some(Owed::CallStart) {
                self.signal(Signal::Refused(message.clone()));
            }
            let _ = self.events.send(ClientEvent::Server(event));
            return;
        }
        self.replies.resolve(&event);

        match event {
            Event::IncomingCall {
                from,
                to,
                is_group,
                caller_ip,
                caller_udp_port,
                call_id,
            } => self.signal(Signal::Incoming(PendingInvite {
                from,
                to,
                is_group,
                caller_ip,
                caller_udp_port,
                call_id,
            })),
            Event::CallWaiting { call_id, .. } => self.signal(Signal::Waiting(call_id)),
            Event::CallAccepted {
                from,
                receiver_ip,
                receiver_udp_port,
                call_id,
            } => self.signal(Signal::Accepted {
                from,
                remote: SocketAddr::new(receiver_ip, receiver_udp_port),
                call_id,
            }),
            Event::CallEnded { call_id, reason, .. } => {
                self.signal(Signal::Ended { call_id, reason })
            }
            other => {
                let _ = self.events.send(ClientEvent::Server(other));
            }
        }
    }

    fn on_error(&self, conn: &StreamConnection, error: &NetError) {
        warn!("Connection {} error: {}", conn.id(), error);
    }

    fn on_disconnect(&self, _conn: &StreamConnection) {
        self.signal(Signal::Shutdown);
        let _ = self.events.send(ClientEvent::Disconnected);
    }
}

/// Handle to a logged-in (or logging-in) chat session. Cheap to clone.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    username: String,
    conn: StreamConnection,
    calls: Arc<CallService>,
    outbound: UnboundedSender<Command>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.conn.disconnect();
        self.calls.relay().close();
    }
}

impl ChatClient {
    /// Bind the datagram relay, connect to the server and send `login`.
    /// The outcome arrives as `login_success` or `login_error` on the
    /// returned event stream.
    pub async fn connect(
        config: ClientConfig,
        username: impl Into<String>,
        device: Arc<dyn AudioDevice>,
    ) -> Result<(Self, UnboundedReceiver<ClientEvent>), ClientError> {
        let username = username.into();

        let relay = Arc::new(DatagramRelay::bind(config.udp_bind)?);
        let queue = PlaybackQueue::new(config.playback_frames);
        let feed = queue.clone();
        relay.start(Arc::new(move |data: &[u8], _from: SocketAddr| {
            feed.push(Bytes::copy_from_slice(data))
        }))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (calls, faults) = CallService::new(
            username.clone(),
            relay.clone(),
            device,
            queue,
            outbound_tx.clone(),
            events_tx.clone(),
        );
        let calls = Arc::new(calls);

        let (signals_tx, signals_rx) = unbounded();
        let signal_calls = calls.clone();
        if let Err(e) = std::thread::Builder::new()
            .name("call-signal".into())
            .spawn(move || signal_loop(signal_calls, signals_rx))
        {
            relay.close();
            return Err(ClientError::Thread(e));
        }

        let replies = Arc::new(ReplyLedger::new());
        let listener = Arc::new(ClientListener {
            replies: replies.clone(),
            signals: signals_tx.clone(),
            events: events_tx,
        });
        let conn = match StreamConnection::connect(
            config.server_addr.as_str(),
            listener,
            config.max_record_bytes,
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                let _ = signals_tx.send(Signal::Shutdown);
                relay.close();
                return Err(e.into());
            }
        };

        tokio::spawn(forward_loop(conn.clone(), replies, outbound_rx, faults, signals_tx));

        info!(
            "{} connected to {} (udp {})",
            username,
            config.server_addr,
            relay.local_port()
        );
        let client = Self {
            inner: Arc::new(ClientInner {
                username: username.clone(),
                conn,
                calls,
                outbound: outbound_tx,
            }),
        };
        client.send(Command::Login { username })?;
        Ok((client, events_rx))
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn udp_port(&self) -> u16 {
        self.inner.calls.relay().local_port()
    }

    pub fn calls(&self) -> &CallService {
        &self.inner.calls
    }

    pub fn call_state(&self) -> CallState {
        self.inner.calls.state()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.conn.is_closed()
    }

    /// Queue a command behind everything sent before it.
    pub fn send(&self, command: Command) -> Result<(), ClientError> {
        if self.inner.conn.is_closed() {
            return Err(NetError::Closed.into());
        }
        self.inner
            .outbound
            .send(command)
            .map_err(|_| NetError::Closed)?;
        Ok(())
    }

    pub fn send_private(&self, to: &str, content: &str) -> Result<(), ClientError> {
        self.send(Command::PrivateMessage {
            from: self.username().to_string(),
            to: to.to_string(),
            content: content.to_string(),
        })
    }

    pub fn send_group(&self, group: &str, content: &str) -> Result<(), ClientError> {
        self.send(Command::GroupMessage {
            from: self.username().to_string(),
            group_name: group.to_string(),
            content: content.to_string(),
        })
    }

    pub fn create_group(&self, group: &str) -> Result<(), ClientError> {
        self.send(Command::CreateGroup {
            group_name: group.to_string(),
            creator: self.username().to_string(),
        })
    }

    pub fn join_group(&self, group: &str) -> Result<(), ClientError> {
        self.send(Command::JoinGroup {
            group_name: group.to_string(),
            username: self.username().to_string(),
        })
    }

    pub fn leave_group(&self, group: &str) -> Result<(), ClientError> {
        self.send(Command::LeaveGroup {
            group_name: group.to_string(),
            username: self.username().to_string(),
        })
    }

    pub fn request_online_users(&self) -> Result<(), ClientError> {
        self.send(Command::GetOnlineUsers {
            username: self.username().to_string(),
        })
    }

    pub fn request_groups(&self) -> Result<(), ClientError> {
        self.send(Command::GetGroups {
            username: self.username().to_string(),
        })
    }

    pub fn request_history(&self, target: &str, is_group: bool) -> Result<(), ClientError> {
        self.send(Command::GetHistory {
            username: self.username().to_string(),
            target: target.to_string(),
            is_group,
        })
    }

    pub fn send_audio_note(
        &self,
        to: &str,
        is_group: bool,
        duration_secs: u32,
        data: Vec<u8>,
    ) -> Result<(), ClientError> {
        self.send(Command::AudioNote {
            from: self.username().to_string(),
            to: to.to_string(),
            is_group,
            duration_secs,
            data,
        })
    }

    pub fn request_audio(&self, audio_id: &str) -> Result<(), ClientError> {
        self.send(Command::GetAudio {
            username: self.username().to_string(),
            audio_id: audio_id.to_string(),
        })
    }

    pub fn start_call(&self, target: &str, is_group: bool) -> Result<(), ClientError> {
        Ok(self.inner.calls.start_call(target, is_group)?)
    }

    pub fn accept_call(&self) -> Result<(), ClientError> {
        Ok(self.inner.calls.accept()?)
    }

    pub fn reject_call(&self) -> Result<(), ClientError> {
        Ok(self.inner.calls.reject()?)
    }

    pub fn end_call(&self) -> Result<(), ClientError> {
        Ok(self.inner.calls.end_call()?)
    }

    /// Hang up any call and say goodbye. The server closes the connection
    /// once it has processed the logout.
    pub fn logout(&self) -> Result<(), ClientError> {
        if matches!(self.call_state(), CallState::Calling | CallState::InCall) {
            self.end_call()?;
        }
        self.send(Command::Logout {
            username: self.username().to_string(),
        })
    }

    pub fn disconnect(&self) {
        self.inner.conn.disconnect();
    }
}

/// The single writer for outbound commands. Records each command's owed
/// reply before writing it and passes device faults to the signal loop,
/// until the connection closes.
async fn forward_loop(
    conn: StreamConnection,
    replies: Arc<ReplyLedger>,
    mut outbound: UnboundedReceiver<Command>,
    mut faults: UnboundedReceiver<AudioError>,
    signals: Sender<Signal>,
) {
    loop {
        tokio::select! {
            _ = conn.closed() => break,
            Some(command) = outbound.recv() => {
                debug!("-> {}", command.name());
                replies.expect(&command);
                if let Err(e) = conn.send(command.encode()) {
                    warn!("Dropping {}: {}", command.name(), e);
                    break;
                }
            }
            Some(fault) = faults.recv() => {
                if signals.send(Signal::Fault(fault)).is_err() {
                    break;
                }
            }
            else => break,
        }
    }
    debug!("Forward loop for {} exiting", conn.id());
}
