use std::net::IpAddr;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::codec::{self, Frame};
use crate::error::ProtocolError;

/// Commands sent FROM client TO server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { username: String },
    Logout { username: String },
    PrivateMessage { from: String, to: String, content: String },
    GroupMessage { from: String, group_name: String, content: String },
    CreateGroup { group_name: String, creator: String },
    JoinGroup { group_name: String, username: String },
    LeaveGroup { group_name: String, username: String },
    GetOnlineUsers { username: String },
    GetGroups { username: String },
    GetHistory { username: String, target: String, is_group: bool },

    /// Voice note; `data` travels base64-encoded inside the record.
    AudioNote {
        from: String,
        to: String,
        is_group: bool,
        duration_secs: u32,
        data: Vec<u8>,
    },

    /// Fetch the stored payload of a voice note by message id.
    GetAudio { username: String, audio_id: String },

    CallStart { from: String, to: String, is_group: bool, udp_port: u16 },
    CallAccept {
        from: String,
        to: String,
        udp_port: u16,
        call_id: Option<String>,
    },
    CallEnd { from: String, call_id: String },
}

impl Command {
    /// Wire name (`type` field).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Login { .. } => "login",
            Self::Logout { .. } => "logout",
            Self::PrivateMessage { .. } => "private_message",
            Self::GroupMessage { .. } => "group_message",
            Self::CreateGroup { .. } => "create_group",
            Self::JoinGroup { .. } => "join_group",
            Self::LeaveGroup { .. } => "leave_group",
            Self::GetOnlineUsers { .. } => "get_online_users",
            Self::GetGroups { .. } => "get_groups",
            Self::GetHistory { .. } => "get_history",
            Self::AudioNote { .. } => "audio_note",
            Self::GetAudio { .. } => "get_audio",
            Self::CallStart { .. } => "call_start",
            Self::CallAccept { .. } => "call_accept",
            Self::CallEnd { .. } => "call_end",
        }
    }

    /// The user this command claims to come from.
    pub fn sender(&self) -> &str {
        match self {
            Self::Login { username }
            | Self::Logout { username }
            | Self::JoinGroup { username, .. }
            | Self::LeaveGroup { username, .. }
            | Self::GetOnlineUsers { username }
            | Self::GetGroups { username }
            | Self::GetHistory { username, .. }
            | Self::GetAudio { username, .. } => username,
            Self::CreateGroup { creator, .. } => creator,
            Self::PrivateMessage { from, .. }
            | Self::GroupMessage { from, .. }
            | Self::AudioNote { from, .. }
            | Self::CallStart { from, .. }
            | Self::CallAccept { from, .. }
            | Self::CallEnd { from, .. } => from,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let frame = Frame::new(self.name());
        match self {
            Self::Login { username }
            | Self::Logout { username }
            | Self::GetOnlineUsers { username }
            | Self::GetGroups { username } => frame.with("username", username),
            Self::PrivateMessage { from, to, content } => frame
                .with("from", from)
                .with("to", to)
                .with("content", content),
            Self::GroupMessage { from, group_name, content } => frame
                .with("from", from)
                .with("group_name", group_name)
                .with("content", content),
            Self::CreateGroup { group_name, creator } => frame
                .with("group_name", group_name)
                .with("creator", creator),
            Self::JoinGroup { group_name, username } | Self::LeaveGroup { group_name, username } => {
                frame.with("group_name", group_name).with("username", username)
            }
            Self::GetHistory { username, target, is_group } => frame
                .with("username", username)
                .with("target", target)
                .with("isGroup", is_group),
            Self::AudioNote { from, to, is_group, duration_secs, data } => frame
                .with("from", from)
                .with("to", to)
                .with("isGroup", is_group)
                .with("duration", duration_secs)
                .with("data", BASE64.encode(data)),
            Self::GetAudio { username, audio_id } => frame
                .with("username", username)
                .with("audioId", audio_id),
            Self::CallStart { from, to, is_group, udp_port } => frame
                .with("from", from)
                .with("to", to)
                .with("isGroup", is_group)
                .with("udpPort", udp_port),
            Self::CallAccept { from, to, udp_port, call_id } => {
                let frame = frame
                    .with("from", from)
                    .with("to", to)
                    .with("udpPort", udp_port);
                match call_id {
                    Some(id) => frame.with("callId", id),
                    None => frame,
                }
            }
            Self::CallEnd { from, call_id } => frame.with("from", from).with("callId", call_id),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let cmd = match frame.kind() {
            "login" => Self::Login { username: text(frame, "username")? },
            "logout" => Self::Logout { username: text(frame, "username")? },
            "private_message" => Self::PrivateMessage {
                from: text(frame, "from")?,
                to: text(frame, "to")?,
                content: text(frame, "content")?,
            },
            "group_message" => Self::GroupMessage {
                from: text(frame, "from")?,
                group_name: text(frame, "group_name")?,
                content: text(frame, "content")?,
            },
            "create_group" => Self::CreateGroup {
                group_name: text(frame, "group_name")?,
                creator: text(frame, "creator")?,
            },
            "join_group" => Self::JoinGroup {
                group_name: text(frame, "group_name")?,
                username: text(frame, "username")?,
            },
            "leave_group" => Self::LeaveGroup {
                group_name: text(frame, "group_name")?,
                username: text(frame, "username")?,
            },
            "get_online_users" => Self::GetOnlineUsers { username: text(frame, "username")? },
            "get_groups" => Self::GetGroups { username: text(frame, "username")? },
            "get_history" => Self::GetHistory {
                username: text(frame, "username")?,
                target: text(frame, "target")?,
                is_group: flag(frame, "isGroup")?,
            },
            "audio_note" => Self::AudioNote {
                from: text(frame, "from")?,
                to: text(frame, "to")?,
                is_group: flag(frame, "isGroup")?,
                duration_secs: number(frame, "duration")?,
                data: binary(frame, "data")?,
            },
            "get_audio" => Self::GetAudio {
                username: text(frame, "username")?,
                audio_id: text(frame, "audioId")?,
            },
            "call_start" => Self::CallStart {
                from: text(frame, "from")?,
                to: text(frame, "to")?,
                is_group: flag(frame, "isGroup")?,
                udp_port: number(frame, "udpPort")?,
            },
            "call_accept" => Self::CallAccept {
                from: text(frame, "from")?,
                to: text(frame, "to")?,
                udp_port: number(frame, "udpPort")?,
                call_id: frame.get("callId").map(str::to_string),
            },
            "call_end" => Self::CallEnd {
                from: text(frame, "from")?,
                call_id: text(frame, "callId")?,
            },
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(cmd)
    }

    pub fn encode(&self) -> String {
        self.to_frame().encode()
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        Self::from_frame(&Frame::decode(line)?)
    }
}

/// Why a call left the ringing or active state, carried by `call_ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Hangup,
    Declined,
    Timeout,
    AnsweredElsewhere,
    Disconnected,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hangup => "hangup",
            Self::Declined => "declined",
            Self::Timeout => "timeout",
            Self::AnsweredElsewhere => "answered_elsewhere",
            Self::Disconnected => "disconnected",
        }
    }
}

impl FromStr for EndReason {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "hangup" => Ok(Self::Hangup),
            "declined" => Ok(Self::Declined),
            "timeout" => Ok(Self::Timeout),
            "answered_elsewhere" => Ok(Self::AnsweredElsewhere),
            "disconnected" => Ok(Self::Disconnected),
            _ => Err(()),
        }
    }
}

/// Events sent FROM server TO client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    LoginSuccess { username: String, message: String },
    LoginError { message: String },

    PrivateMessage {
        id: String,
        from: String,
        to: String,
        content: String,
        timestamp: i64,
    },

    GroupMessage {
        id: String,
        from: String,
        group: String,
        content: String,
        timestamp: i64,
    },

    /// Delivery acknowledgment to the sender; `target` is the user or group.
    MessageSent { target: String, is_group: bool, content: String },

    GroupCreated { group_name: String },
    JoinGroupSuccess { group: String },
    LeaveGroupSuccess { group: String, deleted: bool },
    OnlineUsers { users: Vec<String> },
    GroupsList { groups: Vec<String> },

    /// Conversation log as `(sender, content)` pairs, oldest first.
    History {
        target: String,
        is_group: bool,
        entries: Vec<(String, String)>,
    },

    AudioNote {
        id: String,
        from: String,
        to: String,
        is_group: bool,
        duration_secs: u32,
        size: u64,
        data: Vec<u8>,
    },

    IncomingCall {
        from: String,
        to: String,
        is_group: bool,
        caller_ip: IpAddr,
        caller_udp_port: u16,
        call_id: String,
    },

    CallAccepted {
        from: String,
        receiver_ip: IpAddr,
        receiver_udp_port: u16,
        call_id: String,
    },

    CallWaiting { to: String, call_id: String },
    CallEnded { from: String, call_id: String, reason: EndReason },

    SystemMessage { content: String },
    Error { message: String },
}

impl Event {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::SystemMessage { content: content.into() }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::LoginSuccess { .. } => "login_success",
            Self::LoginError { .. } => "login_error",
            Self::PrivateMessage { .. } => "private_message",
            Self::GroupMessage { .. } => "group_message",
            Self::MessageSent { .. } => "message_sent",
            Self::GroupCreated { .. } => "group_created",
            Self::JoinGroupSuccess { .. } => "join_group_success",
            Self::LeaveGroupSuccess { .. } => "leave_group_success",
            Self::OnlineUsers { .. } => "online_users",
            Self::GroupsList { .. } => "groups_list",
            Self::History { .. } => "history",
            Self::AudioNote { .. } => "audio_note",
            Self::IncomingCall { .. } => "incoming_call",
            Self::CallAccepted { .. } => "call_accepted",
            Self::CallWaiting { .. } => "call_waiting",
            Self::CallEnded { .. } => "call_ended",
            Self::SystemMessage { .. } => "system_message",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_frame(&self) -> Frame {
        let frame = Frame::new(self.name());
        match self {
            Self::LoginSuccess { username, message } => {
                frame.with("username", username).with("message", message)
            }
            Self::LoginError { message } | Self::Error { message } => frame.with("message", message),
            Self::PrivateMessage { id, from, to, content, timestamp } => frame
                .with("id", id)
                .with("from", from)
                .with("to", to)
                .with("content", content)
                .with("timestamp", timestamp),
            Self::GroupMessage { id, from, group, content, timestamp } => frame
                .with("id", id)
                .with("from", from)
                .with("group", group)
                .with("content", content)
                .with("timestamp", timestamp),
            Self::MessageSent { target, is_group, content } => frame
                .with(if *is_group { "group" } else { "to" }, target)
                .with("status", "ok")
                .with("content", content),
            Self::GroupCreated { group_name } => {
                frame.with("group_name", group_name).with("status", "ok")
            }
            Self::JoinGroupSuccess { group } => frame.with("group", group).with("status", "ok"),
            Self::LeaveGroupSuccess { group, deleted } => frame
                .with("group", group)
                .with("status", "ok")
                .with("deleted", deleted),
            Self::OnlineUsers { users } => frame.with("users", codec::join_list(users)),
            Self::GroupsList { groups } => frame.with("groups", codec::join_list(groups)),
            Self::History { target, is_group, entries } => frame
                .with("target", target)
                .with("isGroup", is_group)
                .with("messages", codec::encode_pairs(entries)),
            Self::AudioNote { id, from, to, is_group, duration_secs, size, data } => frame
                .with("id", id)
                .with("from", from)
                .with("to", to)
                .with("isGroup", is_group)
                .with("duration", duration_secs)
                .with("size", size)
                .with("data", BASE64.encode(data)),
            Self::IncomingCall { from, to, is_group, caller_ip, caller_udp_port, call_id } => frame
                .with("from", from)
                .with("to", to)
                .with("isGroup", is_group)
                .with("callerIp", caller_ip)
                .with("callerUdpPort", caller_udp_port)
                .with("callId", call_id),
            Self::CallAccepted { from, receiver_ip, receiver_udp_port, call_id } => frame
                .with("from", from)
                .with("receiverIp", receiver_ip)
                .with("receiverUdpPort", receiver_udp_port)
                .with("callId", call_id),
            Self::CallWaiting { to, call_id } => frame.with("to", to).with("callId", call_id),
            Self::CallEnded { from, call_id, reason } => frame
                .with("from", from)
                .with("callId", call_id)
                .with("reason", reason.as_str()),
            Self::SystemMessage { content } => frame.with("content", content),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let event = match frame.kind() {
            "login_success" => Self::LoginSuccess {
                username: text(frame, "username")?,
                message: frame.get("message").unwrap_or_default().to_string(),
            },
            "login_error" => Self::LoginError { message: text(frame, "message")? },
            "private_message" => Self::PrivateMessage {
                id: text(frame, "id")?,
                from: text(frame, "from")?,
                to: text(frame, "to")?,
                content: text(frame, "content")?,
                timestamp: number(frame, "timestamp")?,
            },
            "group_message" => Self::GroupMessage {
                id: text(frame, "id")?,
                from: text(frame, "from")?,
                group: text(frame, "group")?,
                content: text(frame, "content")?,
                timestamp: number(frame, "timestamp")?,
            },
            "message_sent" => {
                let (target, is_group) = match frame.get("group") {
                    Some(group) => (group.to_string(), true),
                    None => (text(frame, "to")?, false),
                };
                Self::MessageSent {
                    target,
                    is_group,
                    content: text(frame, "content")?,
                }
            }
            "group_created" => Self::GroupCreated { group_name: text(frame, "group_name")? },
            "join_group_success" => Self::JoinGroupSuccess { group: text(frame, "group")? },
            "leave_group_success" => Self::LeaveGroupSuccess {
                group: text(frame, "group")?,
                deleted: flag(frame, "deleted")?,
            },
            "online_users" => Self::OnlineUsers {
                users: codec::split_list(frame.require("users")?),
            },
            "groups_list" => Self::GroupsList {
                groups: codec::split_list(frame.require("groups")?),
            },
            "history" => Self::History {
                target: text(frame, "target")?,
                is_group: flag(frame, "isGroup")?,
                entries: codec::decode_pairs(frame.require("messages")?)?,
            },
            "audio_note" => Self::AudioNote {
                id: text(frame, "id")?,
                from: text(frame, "from")?,
                to: text(frame, "to")?,
                is_group: flag(frame, "isGroup")?,
                duration_secs: number(frame, "duration")?,
                size: number(frame, "size")?,
                data: binary(frame, "data")?,
            },
            "incoming_call" => Self::IncomingCall {
                from: text(frame, "from")?,
                to: text(frame, "to")?,
                is_group: flag(frame, "isGroup")?,
                caller_ip: number(frame, "callerIp")?,
                caller_udp_port: number(frame, "callerUdpPort")?,
                call_id: text(frame, "callId")?,
            },
            "call_accepted" => Self::CallAccepted {
                from: text(frame, "from")?,
                receiver_ip: number(frame, "receiverIp")?,
                receiver_udp_port: number(frame, "receiverUdpPort")?,
                call_id: text(frame, "callId")?,
            },
            "call_waiting" => Self::CallWaiting {
                to: text(frame, "to")?,
                call_id: text(frame, "callId")?,
            },
            "call_ended" => {
                let raw = frame.require("reason")?;
                let reason = raw.parse().map_err(|_| ProtocolError::InvalidField {
                    field: "reason",
                    value: raw.to_string(),
                })?;
                Self::CallEnded {
                    from: text(frame, "from")?,
                    call_id: text(frame, "callId")?,
                    reason,
                }
            }
            "system_message" => Self::SystemMessage { content: text(frame, "content")? },
            "error" => Self::Error { message: text(frame, "message")? },
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(event)
    }

    pub fn encode(&self) -> String {
        self.to_frame().encode()
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        Self::from_frame(&Frame::decode(line)?)
    }
}

// -- Field helpers --

fn text(frame: &Frame, key: &'static str) -> Result<String, ProtocolError> {
    frame.require(key).map(str::to_string)
}

fn flag(frame: &Frame, key: &'static str) -> Result<bool, ProtocolError> {
    let raw = frame.require(key)?;
    if raw.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(ProtocolError::InvalidField {
            field: key,
            value: raw.to_string(),
        })
    }
}

/// Anything parsed with `FromStr`: integers, ports, IP addresses.
fn number<T: FromStr>(frame: &Frame, key: &'static str) -> Result<T, ProtocolError> {
    let raw = frame.require(key)?;
    raw.parse().map_err(|_| ProtocolError::InvalidField {
        field: key,
        value: raw.to_string(),
    })
}

fn binary(frame: &Frame, key: &'static str) -> Result<Vec<u8>, ProtocolError> {
    let raw = frame.require(key)?;
    BASE64.decode(raw).map_err(|e| ProtocolError::InvalidField {
        field: key,
        value: e.to_string(),
    })
}
