//! Replies the server still owes this client.
//!
//! The server answers each connection's records in order. Most commands get
//! exactly one reply, either their success event or `error`. `call_accept`,
//! `call_end` and `logout` have no success reply and are not tracked. An
//! `error` therefore answers the oldest tracked command.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use parley_types::{Command, Event};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owed {
    /// The command's own success event (`message_sent`, `groups_list`, ...).
    Reply,
    /// `audio_note` carrying this id.
    Audio(String),
    /// `call_waiting`.
    CallStart,
}

impl Owed {
    pub fn for_command(command: &Command) -> Option<Owed> {
        match command {
            Command::Logout { .. } | Command::CallAccept { .. } | Command::CallEnd { .. } => None,
            Command::GetAudio { audio_id, .. } => Some(Owed::Audio(audio_id.clone())),
            Command::CallStart { .. } => Some(Owed::CallStart),
            _ => Some(Owed::Reply),
        }
    }

    fn answered_by(event: &Event) -> Option<Owed> {
        match event {
            Event::LoginSuccess { .. }
            | Event::LoginError { .. }
            | Event::MessageSent { .. }
            | Event::GroupCreated { .. }
            | Event::JoinGroupSuccess { .. }
            | Event::LeaveGroupSuccess { .. }
            | Event::OnlineUsers { .. }
            | Event::GroupsList { .. }
            | Event::History { .. } => Some(Owed::Reply),
            Event::CallWaiting { .. } => Some(Owed::CallStart),
            Event::AudioNote { id, .. } => Some(Owed::Audio(id.clone())),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct ReplyLedger {
    owed: Mutex<VecDeque<Owed>>,
}

impl ReplyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `command` just before it is written.
    pub fn expect(&self, command: &Command) {
        if let Some(owed) = Owed::for_command(command) {
            self.lock().push_back(owed);
        }
    }

    /// The command an `error` answers.
    pub fn resolve_error(&self) -> Option<Owed> {
        self.lock().pop_front()
    }

    /// Settle the command `event` answers. Returns false for events that are
    /// not replies, such as a forwarded `audio_note`.
    pub fn resolve(&self, event: &Event) -> bool {
        let Some(kind) = Owed::answered_by(event) else {
            return false;
        };
        let mut owed = self.lock();
        match owed.iter().position(|o| *o == kind) {
            Some(0) => {
                owed.pop_front();
                true
            }
            Some(i) => {
                warn!("{} arrived ahead of {} older replies", event.name(), i);
                owed.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Owed>> {
        self.owed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
