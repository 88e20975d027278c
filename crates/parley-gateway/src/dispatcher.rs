use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_db::HistoryStore;
use parley_net::{ConnectionListener, DEFAULT_MAX_RECORD_BYTES, NetError, StreamConnection};
use parley_types::{AudioNote, Command, ConversationKey, EndReason, Event, Message, MessageBody, TargetKind};

use crate::calls::{CallBook, CallEnd};
use crate::error::StateError;
use crate::groups::GroupDirectory;
use crate::sessions::SessionRegistry;

/// Tunables for the command handlers.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long a call may ring before it is ended with `timeout`.
    pub call_timeout: Duration,
    /// Most recent messages returned by `get_history`.
    pub history_limit: usize,
    /// Longest accepted inbound record.
    pub max_record_bytes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            history_limit: 200,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }
}

/// Routes decoded commands to the registries and sends the resulting events.
///
/// Every connection shares one dispatcher. Handlers run synchronously on the
/// connection's reader task; sends are non-blocking queue pushes.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    sessions: SessionRegistry,
    groups: GroupDirectory,
    calls: CallBook,
    history: Arc<dyn HistoryStore>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(history: Arc<dyn HistoryStore>, config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                sessions: SessionRegistry::new(),
                groups: GroupDirectory::new(),
                calls: CallBook::new(),
                history,
                config,
            }),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn groups(&self) -> &GroupDirectory {
        &self.inner.groups
    }

    pub fn calls(&self) -> &CallBook {
        &self.inner.calls
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Decode and handle one inbound record. Anything refused is answered
    /// with an `error` event; the connection stays open.
    pub fn handle_record(&self, conn: &StreamConnection, record: &str) {
        let command = match Command::decode(record) {
            Ok(command) => command,
            Err(e) => {
                warn!("{}: rejected record: {}", conn.peer_addr(), e);
                self.reply(conn, Event::error(e.to_string()));
                return;
            }
        };

        debug!("{}: {}", conn.peer_addr(), command.name());
        if let Err(e) = self.dispatch(conn, command) {
            warn!("{}: {}", conn.peer_addr(), e);
            self.reply(conn, Event::error(e.to_string()));
        }
    }

    /// Drop everything bound to a closed connection.
    pub fn handle_disconnect(&self, conn: &StreamConnection) {
        if let Some(user) = self.inner.sessions.logout_connection(conn.id()) {
            info!(
                "{} ({}) disconnected, {} online",
                user,
                conn.peer_addr(),
                self.inner.sessions.len()
            );
            self.release_user(&user);
        }
    }

    fn dispatch(&self, conn: &StreamConnection, command: Command) -> Result<(), StateError> {
        if let Command::Login { username } = &command {
            self.handle_login(conn, username);
            return Ok(());
        }

        let user = self.authorize(conn, command.sender())?;

        match command {
            Command::Login { .. } => Ok(()),
            Command::Logout { .. } => {
                self.handle_logout(conn, &user);
                Ok(())
            }
            Command::PrivateMessage { to, content, .. } => {
                self.handle_private_message(conn, &user, to, content);
                Ok(())
            }
            Command::GroupMessage { group_name, content, .. } => {
                self.handle_group_message(conn, &user, group_name, content)
            }
            Command::CreateGroup { group_name, .. } => {
                let group = self.inner.groups.create(&group_name, &user)?;
                self.reply(conn, Event::GroupCreated { group_name: group.clone() });
                self.broadcast(Event::system(format!("Group '{}' created by {}", group, user)));
                Ok(())
            }
            Command::JoinGroup { group_name, .. } => {
                self.inner.groups.join(&group_name, &user)?;
                self.reply(conn, Event::JoinGroupSuccess { group: group_name.clone() });
                self.broadcast(Event::system(format!("{} joined group {}", user, group_name)));
                Ok(())
            }
            Command::LeaveGroup { group_name, .. } => {
                let deleted = self.inner.groups.leave(&group_name, &user)?;
                self.reply(conn, Event::LeaveGroupSuccess { group: group_name, deleted });
                Ok(())
            }
            Command::GetOnlineUsers { .. } => {
                let users = self.inner.sessions.online_users();
                self.reply(conn, Event::OnlineUsers { users });
                Ok(())
            }
            Command::GetGroups { .. } => {
                let groups = self.inner.groups.names();
                self.reply(conn, Event::GroupsList { groups });
                Ok(())
            }
            Command::GetHistory { target, is_group, .. } => {
                self.handle_get_history(conn, &user, target, is_group)
            }
            Command::AudioNote { to, is_group, duration_secs, data, .. } => {
                self.handle_audio_note(conn, &user, to, is_group, duration_secs, data)
            }
            Command::GetAudio { audio_id, .. } => self.handle_get_audio(conn, &user, &audio_id),
            Command::CallStart { to, is_group, udp_port, .. } => {
                self.handle_call_start(conn, &user, to, is_group, udp_port)
            }
            Command::CallAccept { to, udp_port, call_id, .. } => {
                self.handle_call_accept(conn, &user, &to, udp_port, call_id.as_deref())
            }
            Command::CallEnd { call_id, .. } => {
                match self.inner.calls.end(&user, &call_id) {
                    Some(end) => self.announce_end(&end),
                    None => debug!("Ignoring stale call_end {} from {}", call_id, user),
                }
                Ok(())
            }
        }
    }

    /// The connection must be logged in and act only as itself.
    fn authorize(&self, conn: &StreamConnection, claimed: &str) -> Result<String, StateError> {
        let bound = self
            .inner
            .sessions
            .user_for(conn.id())
            .ok_or(StateError::NotLoggedIn)?;
        if bound != claimed.trim() {
            return Err(StateError::IdentityMismatch {
                claimed: claimed.to_string(),
                bound,
            });
        }
        Ok(bound)
    }

    // -- Session --

    fn handle_login(&self, conn: &StreamConnection, username: &str) {
        match self.inner.sessions.login(username, conn) {
            Ok(name) => {
                self.reply(
                    conn,
                    Event::LoginSuccess {
                        username: name.clone(),
                        message: format!("Welcome {}", name),
                    },
                );
                self.broadcast(Event::system(format!("{} joined", name)));
            }
            Err(e) => {
                warn!("{}: login as '{}' refused: {}", conn.peer_addr(), username, e);
                self.reply(conn, Event::LoginError { message: e.to_string() });
                conn.disconnect();
            }
        }
    }

    fn handle_logout(&self, conn: &StreamConnection, user: &str) {
        if self.inner.sessions.logout(user).is_some() {
            self.release_user(user);
        }
        conn.disconnect();
    }

    /// Shared by logout and disconnect once the binding is gone.
    fn release_user(&self, user: &str) {
        for end in self.inner.calls.drop_user(user) {
            self.announce_end(&end);
        }
        self.broadcast(Event::system(format!("{} left", user)));
    }

    // -- Messages --

    fn handle_private_message(&self, conn: &StreamConnection, user: &str, to: String, content: String) {
        let message = Message::text(user, &to, TargetKind::Direct, &content);
        self.record(&message);

        let event = Event::PrivateMessage {
            id: message.id.to_string(),
            from: user.to_string(),
            to: to.clone(),
            content: content.clone(),
            timestamp: message.created_at.timestamp_millis(),
        };
        if !self.deliver(&to, &event) {
            debug!("{} is offline; message {} stored only", to, message.id);
        }

        self.reply(conn, Event::MessageSent { target: to, is_group: false, content });
    }

    fn handle_group_message(
        &self,
        conn: &StreamConnection,
        user: &str,
        group: String,
        content: String,
    ) -> Result<(), StateError> {
        self.inner.groups.require_member(&group, user)?;

        let message = Message::text(user, &group, TargetKind::Group, &content);
        self.record(&message);

        let event = Event::GroupMessage {
            id: message.id.to_string(),
            from: user.to_string(),
            group: group.clone(),
            content: content.clone(),
            timestamp: message.created_at.timestamp_millis(),
        };
        self.deliver_to_group(&group, user, &event);

        self.reply(conn, Event::MessageSent { target: group, is_group: true, content });
        Ok(())
    }

    fn handle_audio_note(
        &self,
        conn: &StreamConnection,
        user: &str,
        to: String,
        is_group: bool,
        duration_secs: u32,
        data: Vec<u8>,
    ) -> Result<(), StateError> {
        if is_group {
            self.inner.groups.require_member(&to, user)?;
        }

        let note = AudioNote::new(user, &to, TargetKind::from_is_group(is_group), duration_secs, data);
        if let Err(e) = self.inner.history.append_audio_note(&note.message, &note.payload) {
            error!("Failed to store audio note {}: {:#}", note.message.id, e);
        }

        let preview = note.message.body.preview();
        let event = audio_event(&note.message, note.payload);
        if is_group {
            self.deliver_to_group(&to, user, &event);
        } else {
            self.deliver(&to, &event);
        }

        self.reply(conn, Event::MessageSent { target: to, is_group, content: preview });
        Ok(())
    }

    fn handle_get_history(
        &self,
        conn: &StreamConnection,
        user: &str,
        target: String,
        is_group: bool,
    ) -> Result<(), StateError> {
        let key = if is_group {
            self.inner.groups.require_member(&target, user)?;
            ConversationKey::group(&target)
        } else {
            ConversationKey::direct(user, &target)
        };

        let messages = self
            .inner
            .history
            .load_recent(&key, self.inner.config.history_limit)
            .map_err(|e| {
                error!("Failed to load history for {}: {:#}", key.storage_key(), e);
                StateError::HistoryUnavailable
            })?;

        let entries = messages
            .into_iter()
            .map(|m| {
                let content = m.body.preview();
                (m.sender, content)
            })
            .collect();
        self.reply(conn, Event::History { target, is_group, entries });
        Ok(())
    }

    fn handle_get_audio(&self, conn: &StreamConnection, user: &str, audio_id: &str) -> Result<(), StateError> {
        let id = Uuid::parse_str(audio_id).map_err(|_| StateError::AudioNotFound)?;
        let history = &self.inner.history;

        let message = history
            .find_message(&id)
            .map_err(|e| {
                error!("Failed to look up audio {}: {:#}", id, e);
                StateError::HistoryUnavailable
            })?
            .filter(|m| m.is_audio() && self.can_read(user, m))
            .ok_or(StateError::AudioNotFound)?;

        let payload = history
            .load_audio_payload(&id)
            .map_err(|e| {
                error!("Failed to load audio {}: {:#}", id, e);
                StateError::HistoryUnavailable
            })?
            .ok_or(StateError::AudioNotFound)?;

        self.reply(conn, audio_event(&message, payload));
        Ok(())
    }

    fn can_read(&self, user: &str, message: &Message) -> bool {
        match message.kind {
            TargetKind::Direct => message.sender == user || message.target == user,
            TargetKind::Group => self.inner.groups.is_member(&message.target, user),
        }
    }

    // -- Calls --

    fn handle_call_start(
        &self,
        conn: &StreamConnection,
        user: &str,
        to: String,
        is_group: bool,
        udp_port: u16,
    ) -> Result<(), StateError> {
        let candidates: Vec<String> = if is_group {
            self.inner.groups.require_member(&to, user)?;
            self.inner
                .groups
                .members(&to)
                .unwrap_or_default()
                .into_iter()
                .filter(|member| member != user && self.inner.sessions.is_online(member))
                .collect()
        } else {
            if to == user {
                return Err(StateError::SelfCall);
            }
            if !self.inner.sessions.is_online(&to) {
                return Err(StateError::UserOffline(to));
            }
            vec![to.clone()]
        };

        let call = self.inner.calls.start(user, &to, is_group, candidates)?;

        let invite = Event::IncomingCall {
            from: user.to_string(),
            to: to.clone(),
            is_group,
            caller_ip: conn.peer_addr().ip().to_canonical(),
            caller_udp_port: udp_port,
            call_id: call.id.clone(),
        };
        for invitee in &call.ringing {
            self.deliver(invitee, &invite);
        }

        self.reply(conn, Event::CallWaiting { to, call_id: call.id.clone() });
        self.schedule_ring_timeout(call.id);
        Ok(())
    }

    fn handle_call_accept(
        &self,
        conn: &StreamConnection,
        user: &str,
        caller: &str,
        udp_port: u16,
        call_id: Option<&str>,
    ) -> Result<(), StateError> {
        let accepted = self.inner.calls.accept(user, caller, call_id)?;
        let call_id = accepted.call.id;

        self.deliver(
            &accepted.call.initiator,
            &Event::CallAccepted {
                from: user.to_string(),
                receiver_ip: conn.peer_addr().ip().to_canonical(),
                receiver_udp_port: udp_port,
                call_id: call_id.clone(),
            },
        );

        let elsewhere = Event::CallEnded {
            from: user.to_string(),
            call_id,
            reason: EndReason::AnsweredElsewhere,
        };
        for other in &accepted.answered_elsewhere {
            self.deliver(other, &elsewhere);
        }
        Ok(())
    }

    fn schedule_ring_timeout(&self, call_id: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime; call {} will ring until answered or ended", call_id);
            return;
        };

        let dispatcher = self.clone();
        let timeout = self.inner.config.call_timeout;
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(end) = dispatcher.inner.calls.expire(&call_id) {
                dispatcher.announce_end(&end);
            }
        });
    }

    fn announce_end(&self, end: &CallEnd) {
        let event = Event::CallEnded {
            from: end.by.clone(),
            call_id: end.call.id.clone(),
            reason: end.reason,
        };
        for user in &end.notify {
            self.deliver(user, &event);
        }
        if end.finished {
            debug!("Call {} closed by {} ({})", end.call.id, end.by, end.reason.as_str());
        } else {
            debug!("{} left call {}, {} still ringing", end.by, end.call.id, end.call.ringing.len());
        }
    }

    // -- Delivery --

    fn record(&self, message: &Message) {
        if let Err(e) = self.inner.history.append_message(message) {
            error!("Failed to store message {}: {:#}", message.id, e);
        }
    }

    fn reply(&self, conn: &StreamConnection, event: Event) {
        if let Err(e) = conn.send(event.encode()) {
            debug!("{}: reply '{}' dropped: {}", conn.peer_addr(), event.name(), e);
        }
    }

    fn deliver(&self, user: &str, event: &Event) -> bool {
        self.inner.sessions.unicast(user, &event.encode())
    }

    fn deliver_to_group(&self, group: &str, sender: &str, event: &Event) {
        let record = event.encode();
        for member in self.inner.groups.members(group).unwrap_or_default() {
            if member != sender {
                self.inner.sessions.unicast(&member, &record);
            }
        }
    }

    fn broadcast(&self, event: Event) {
        self.inner.sessions.broadcast(&event.encode());
    }
}

impl ConnectionListener for Dispatcher {
    fn on_ready(&self, conn: &StreamConnection) {
        debug!("{} ({}) ready", conn.id(), conn.peer_addr());
    }

    fn on_record(&self, conn: &StreamConnection, record: String) {
        self.handle_record(conn, &record);
    }

    fn on_error(&self, conn: &StreamConnection, error: &NetError) {
        match error {
            NetError::RecordTooLong(_) => self.reply(conn, Event::error(error.to_string())),
            _ => debug!("{} ({}) transport error: {}", conn.id(), conn.peer_addr(), error),
        }
    }

    fn on_disconnect(&self, conn: &StreamConnection) {
        self.handle_disconnect(conn);
    }
}

fn audio_event(message: &Message, payload: Vec<u8>) -> Event {
    let (duration_secs, size) = match message.body {
        MessageBody::Audio { duration_secs, size } => (duration_secs, size),
        MessageBody::Text(_) => (0, payload.len() as u64),
    };
    Event::AudioNote {
        id: message.id.to_string(),
        from: message.sender.clone(),
        to: message.target.clone(),
        is_group: message.kind.is_group(),
        duration_secs,
        size,
        data: payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_db::Database;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Client {
        conn: StreamConnection,
        rx: UnboundedReceiver<String>,
    }

    impl Client {
        fn connect(dispatcher: &Dispatcher, ip: &str) -> Self {
            let peer = format!("{}:40000", ip).parse().unwrap();
            let (conn, rx) = StreamConnection::in_memory(peer, Arc::new(dispatcher.clone()));
            Self { conn, rx }
        }

        fn login(dispatcher: &Dispatcher, name: &str, ip: &str) -> Self {
            let mut client = Self::connect(dispatcher, ip);
            client.send(Command::Login { username: name.into() });
            assert!(matches!(client.events()[0], Event::LoginSuccess { .. }));
            client
        }

        fn send(&self, command: Command) {
            self.conn.inject(command.encode());
        }

        /// Drain and decode everything queued for this client.
        fn events(&mut self) -> Vec<Event> {
            let mut events = Vec::new();
            while let Ok(line) = self.rx.try_recv() {
                events.push(Event::decode(&line).unwrap());
            }
            events
        }

        fn only_event(&mut self) -> Event {
            let mut events = self.events();
            assert_eq!(events.len(), 1, "expected one event, got {:?}", events);
            events.remove(0)
        }
    }

    fn setup(config: DispatcherConfig) -> (Dispatcher, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        (Dispatcher::new(db.clone(), config), db)
    }

    fn pm(from: &str, to: &str, content: &str) -> Command {
        Command::PrivateMessage {
            from: from.into(),
            to: to.into(),
            content: content.into(),
        }
    }

    fn error_message(event: Event) -> String {
        match event {
            Event::Error { message } => message,
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn private_message_is_delivered_and_stored() {
        let (dispatcher, db) = setup(DispatcherConfig::default());
        let mut alice = Client::login(&dispatcher, "alice", "10.0.0.5");
        let mut bob = Client::login(&dispatcher, "bob", "10.0.0.6");
        alice.events();

        alice.send(pm("alice", "bob", "hi"));

        match bob.only_event() {
            Event::PrivateMessage { from, to, content, .. } => {
                assert_eq!(from, "alice");
                assert_eq!(to, "bob");
                assert_eq!(content, "hi");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            alice.only_event(),
            Event::MessageSent {
                target: "bob".into(),
                is_group: false,
                content: "hi".into(),
            }
        );

        let history = db.load(&ConversationKey::direct("alice", "bob")).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender, "alice");
        assert_eq!(history[0].target, "bob");
        assert_eq!(history[0].kind, TargetKind::Direct);
    }

    #[test]
    fn message_to_offline_user_is_stored_and_acknowledged() {
        let (dispatcher, db) = setup(DispatcherConfig::default());
        let mut alice = Client::login(&dispatcher, "alice", "10.0.0.5");
        let mut bob = Client::login(&dispatcher, "bob", "10.0.0.6");
        alice.events();

        alice.send(pm("alice", "carol", "later"));

        assert!(matches!(alice.only_event(), Event::MessageSent { .. }));
        assert!(bob.events().is_empty());
        assert_eq!(db.load(&ConversationKey::direct("carol", "alice")).unwrap().len(), 1);
    }

    #[test]
    fn group_message_reaches_other_members() {
        let (dispatcher, _db) = setup(DispatcherConfig::default());
        let mut alice = Client::login(&dispatcher, "alice", "10.0.0.5");
        let mut bob = Client::login(&dispatcher, "bob", "10.0.0.6");

        alice.send(Command::CreateGroup { group_name: "team".into(), creator: "alice".into() });
        bob.send(Command::JoinGroup { group_name: "team".into(), username: "bob".into() });
        alice.events();
        bob.events();

        alice.send(Command::GroupMessage {
            from: "alice".into(),
            group_name: "team".into(),
            content: "standup".into(),
        });

        match bob.only_event() {
            Event::GroupMessage { from, group, content, .. } => {
                assert_eq!((from.as_str(), group.as_str(), content.as_str()), ("alice", "team", "standup"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            alice.only_event(),
            Event::MessageSent {
                target: "team".into(),
                is_group: true,
                content: "standup".into(),
            }
        );
        assert_eq!(dispatcher.groups().member_count("team"), Some(2));
    }

    #[test]
    fn group_message_requires_membership() {
        let (dispatcher, _db) = setup(DispatcherConfig::default());
        let alice = Client::login(&dispatcher, "alice", "10.0.0.5");
        let mut bob = Client::login(&dispatcher, "bob", "10.0.0.6");
        alice.send(Command::CreateGroup { group_name: "team".into(), creator: "alice".into() });
        bob.events();

        bob.send(Command::GroupMessage {
            from: "bob".into(),
            group_name: "team".into(),
            content: "let me in".into(),
        });
        assert!(error_message(bob.only_event()).contains("not a member"));

        bob.send(Command::GetHistory { username: "bob".into(), target: "team".into(), is_group: true });
        assert!(error_message(bob.only_event()).contains("not a member"));
    }

    #[test]
    fn group_lifecycle_events() {
        let (dispatcher, _db) = setup(DispatcherConfig::default());
        let mut alice = Client::login(&dispatcher, "alice", "10.0.0.5");

        alice.send(Command::CreateGroup { group_name: "team".into(), creator: "alice".into() });
        let events = alice.events();
        assert_eq!(events[0], Event::GroupCreated { group_name: "team".into() });
        assert!(matches!(events[1], Event::SystemMessage { .. }));

        alice.send(Command::GetGroups { username: "alice".into() });
        assert_eq!(alice.only_event(), Event::GroupsList { groups: vec!["team".into()] });

        alice.send(Command::LeaveGroup { group_name: "team".into(), username: "alice".into() });
        assert_eq!(
            alice.only_event(),
            Event::LeaveGroupSuccess { group: "team".into(), deleted: true }
        );

        alice.send(Command::JoinGroup { group_name: "team".into(), username: "alice".into() });
        assert!(error_message(alice.only_event()).contains("group not found"));
    }

    #[test]
    fn login_rules() {
        let (dispatcher, _db) = setup(DispatcherConfig::default());
        let _alice = Client::login(&dispatcher, "alice", "10.0.0.5");

        let mut impostor = Client::connect(&dispatcher, "10.0.0.9");
        impostor.send(Command::Login { username: "alice".into() });
        assert!(matches!(impostor.only_event(), Event::LoginError { .. }));
        assert!(impostor.conn.is_closed());

        let mut blank = Client::connect(&dispatcher, "10.0.0.9");
        blank.send(Command::Login { username: "   ".into() });
        assert!(matches!(blank.only_event(), Event::LoginError { .. }));

        assert_eq!(dispatcher.sessions().online_users(), vec!["alice"]);
    }

    #[test]
    fn commands_require_matching_identity() {
        let (dispatcher, _db) = setup(DispatcherConfig::default());
        let mut anonymous = Client::connect(&dispatcher, "10.0.0.9");
        anonymous.send(Command::GetOnlineUsers { username: "alice".into() });
        assert_eq!(error_message(anonymous.only_event()), "not logged in");
        assert!(!anonymous.conn.is_closed());

        let mut alice = Client::login(&dispatcher, "alice", "10.0.0.5");
        alice.send(pm("bob", "carol", "spoofed"));
        assert!(error_message(alice.only_event()).contains("cannot act as 'bob'"));
    }

    #[test]
    fn malformed_records_keep_connection_open() {
        let (dispatcher, _db) = setup(DispatcherConfig::default());
        let mut alice = Client::login(&dispatcher, "alice", "10.0.0.5");

        alice.conn.inject("type:private_message|from:alice|content:10:30");
        assert!(error_message(alice.only_event()).contains("unescaped ':'"));

        alice.conn.inject("type:private_message|from:alice|to:bob");
        assert!(error_message(alice.only_event()).contains("content"));

        alice.conn.inject("type:dance|username:alice");
        assert!(error_message(alice.only_event()).contains("dance"));

        assert!(!alice.conn.is_closed());
        alice.send(Command::GetOnlineUsers { username: "alice".into() });
        assert_eq!(alice.only_event(), Event::OnlineUsers { users: vec!["alice".into()] });
    }

    #[test]
    fn logout_closes_connection_and_announces() {
        let (dispatcher, _db) = setup(DispatcherConfig::default());
        let alice = Client::login(&dispatcher, "alice", "10.0.0.5");
        let mut bob = Client::login(&dispatcher, "bob", "10.0.0.6");

        alice.send(Command::Logout { username: "alice".into() });

        assert!(alice.conn.is_closed());
        assert!(!dispatcher.sessions().is_online("alice"));
        assert_eq!(bob.only_event(), Event::system("alice left"));
    }

    #[test]
    fn history_is_capped_to_most_recent() {
        let config = DispatcherConfig { history_limit: 2, ..DispatcherConfig::default() };
        let (dispatcher, _db) = setup(config);
        let alice = Client::login(&dispatcher, "alice", "10.0.0.5");
        let mut bob = Client::login(&dispatcher, "bob", "10.0.0.6");

        alice.send(pm("alice", "bob", "one"));
        bob.send(pm("bob", "alice", "two: the sequel"));
        alice.send(pm("alice", "bob", "three"));
        bob.events();

        bob.send(Command::GetHistory { username: "bob".into(), target: "alice".into(), is_group: false });
        assert_eq!(
            bob.only_event(),
            Event::History {
                target: "alice".into(),
                is_group: false,
                entries: vec![
                    ("bob".into(), "two: the sequel".into()),
                    ("alice".into(), "three".into()),
                ],
            }
        );
    }

    #[test]
    fn audio_note_delivery_and_retrieval() {
        let (dispatcher, _db) = setup(DispatcherConfig::default());
        let mut alice = Client::login(&dispatcher, "alice", "10.0.0.5");
        let mut bob = Client::login(&dispatcher, "bob", "10.0.0.6");
        let mut carol = Client::login(&dispatcher, "carol", "10.0.0.7");
        alice.events();
        bob.events();

        let payload: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();
        alice.send(Command::AudioNote {
            from: "alice".into(),
            to: "bob".into(),
            is_group: false,
            duration_secs: 3,
            data: payload.clone(),
        });

        let id = match bob.only_event() {
            Event::AudioNote { id, from, duration_secs, size, data, .. } => {
                assert_eq!(from, "alice");
                assert_eq!(duration_secs, 3);
                assert_eq!(size, 4096);
                assert_eq!(data, payload);
                id
            }
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(alice.only_event(), Event::MessageSent { .. }));

        bob.send(Command::GetAudio { username: "bob".into(), audio_id: id.clone() });
        assert!(matches!(bob.only_event(), Event::AudioNote { data, .. } if data == payload));

        carol.events();
        carol.send(Command::GetAudio { username: "carol".into(), audio_id: id });
        assert_eq!(error_message(carol.only_event()), "audio not found");

        bob.send(Command::GetHistory { username: "bob".into(), target: "alice".into(), is_group: false });
        match bob.only_event() {
            Event::History { entries, .. } => {
                assert_eq!(entries, vec![("alice".into(), "[AUDIO 3s, 4096 bytes]".into())]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn call_negotiation() {
        let (dispatcher, _db) = setup(DispatcherConfig::default());
        let mut alice = Client::login(&dispatcher, "alice", "10.0.0.5");
        let mut bob = Client::login(&dispatcher, "bob", "10.0.0.6");
        alice.events();

        alice.send(Command::CallStart {
            from: "alice".into(),
            to: "bob".into(),
            is_group: false,
            udp_port: 6001,
        });

        let call_id = match bob.only_event() {
            Event::IncomingCall { from, caller_ip, caller_udp_port, call_id, .. } => {
                assert_eq!(from, "alice");
                assert_eq!(caller_ip.to_string(), "10.0.0.5");
                assert_eq!(caller_udp_port, 6001);
                call_id
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            alice.only_event(),
            Event::CallWaiting { to: "bob".into(), call_id: call_id.clone() }
        );

        bob.send(Command::CallAccept {
            from: "bob".into(),
            to: "alice".into(),
            udp_port: 6002,
            call_id: Some(call_id.clone()),
        });
        match alice.only_event() {
            Event::CallAccepted { from, receiver_ip, receiver_udp_port, call_id: id } => {
                assert_eq!(from, "bob");
                assert_eq!(receiver_ip.to_string(), "10.0.0.6");
                assert_eq!(receiver_udp_port, 6002);
                assert_eq!(id, call_id);
            }
            other => panic!("unexpected {:?}", other),
        }

        alice.send(Command::CallEnd { from: "alice".into(), call_id: call_id.clone() });
        assert_eq!(
            bob.only_event(),
            Event::CallEnded { from: "alice".into(), call_id: call_id.clone(), reason: EndReason::Hangup }
        );

        // A stale end is ignored.
        alice.send(Command::CallEnd { from: "alice".into(), call_id });
        assert!(alice.events().is_empty());
        assert!(bob.events().is_empty());
    }

    #[test]
    fn busy_user_rejects_second_call() {
        let (dispatcher, _db) = setup(DispatcherConfig::default());
        let alice = Client::login(&dispatcher, "alice", "10.0.0.5");
        let bob = Client::login(&dispatcher, "bob", "10.0.0.6");
        let mut carol = Client::login(&dispatcher, "carol", "10.0.0.7");

        alice.send(Command::CallStart { from: "alice".into(), to: "bob".into(), is_group: false, udp_port: 6001 });
        bob.send(Command::CallAccept { from: "bob".into(), to: "alice".into(), udp_port: 6002, call_id: None });
        carol.events();

        carol.send(Command::CallStart { from: "carol".into(), to: "alice".into(), is_group: false, udp_port: 6003 });
        assert_eq!(error_message(carol.only_event()), "alice is busy");
        assert_eq!(dispatcher.calls().len(), 1);
    }

    #[test]
    fn group_call_answered_elsewhere() {
        let (dispatcher, _db) = setup(DispatcherConfig::default());
        let mut alice = Client::login(&dispatcher, "alice", "10.0.0.5");
        let mut bob = Client::login(&dispatcher, "bob", "10.0.0.6");
        let mut carol = Client::login(&dispatcher, "carol", "10.0.0.7");
        alice.send(Command::CreateGroup { group_name: "team".into(), creator: "alice".into() });
        bob.send(Command::JoinGroup { group_name: "team".into(), username: "bob".into() });
        carol.send(Command::JoinGroup { group_name: "team".into(), username: "carol".into() });
        alice.events();
        bob.events();
        carol.events();

        alice.send(Command::CallStart { from: "alice".into(), to: "team".into(), is_group: true, udp_port: 6001 });
        let call_id = match bob.only_event() {
            Event::IncomingCall { call_id, is_group: true, .. } => call_id,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(carol.only_event(), Event::IncomingCall { .. }));

        carol.send(Command::CallAccept {
            from: "carol".into(),
            to: "alice".into(),
            udp_port: 6003,
            call_id: Some(call_id.clone()),
        });
        assert!(matches!(
            bob.only_event(),
            Event::CallEnded { reason: EndReason::AnsweredElsewhere, .. }
        ));

        bob.send(Command::CallAccept {
            from: "bob".into(),
            to: "alice".into(),
            udp_port: 6002,
            call_id: Some(call_id),
        });
        assert_eq!(error_message(bob.only_event()), "call already answered");
    }

    #[test]
    fn disconnect_ends_active_call() {
        let (dispatcher, _db) = setup(DispatcherConfig::default());
        let mut alice = Client::login(&dispatcher, "alice", "10.0.0.5");
        let bob = Client::login(&dispatcher, "bob", "10.0.0.6");

        alice.send(Command::CallStart { from: "alice".into(), to: "bob".into(), is_group: false, udp_port: 6001 });
        bob.send(Command::CallAccept { from: "bob".into(), to: "alice".into(), udp_port: 6002, call_id: None });
        alice.events();

        bob.conn.disconnect();

        let events = alice.events();
        assert!(matches!(
            &events[0],
            Event::CallEnded { from, reason: EndReason::Disconnected, .. } if from == "bob"
        ));
        assert_eq!(events[1], Event::system("bob left"));
        assert!(dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn unanswered_call_times_out() {
        let config = DispatcherConfig {
            call_timeout: Duration::from_millis(50),
            ..DispatcherConfig::default()
        };
        let (dispatcher, _db) = setup(config);
        let mut alice = Client::login(&dispatcher, "alice", "10.0.0.5");
        let mut bob = Client::login(&dispatcher, "bob", "10.0.0.6");
        alice.send(Command::CallStart { from: "alice".into(), to: "bob".into(), is_group: false, udp_port: 6001 });
        alice.events();
        bob.events();

        tokio::time::sleep(Duration::from_millis(300)).await;

        for client in [&mut alice, &mut bob] {
            assert!(matches!(
                client.only_event(),
                Event::CallEnded { reason: EndReason::Timeout, .. }
            ));
        }
        assert!(dispatcher.calls().is_empty());
    }
}
