//! Line-framed stream connection.
//!
//! Each connection owns two tasks: a reader that frames inbound bytes into
//! newline-delimited records and hands them to a [`ConnectionListener`] in
//! receipt order, and a writer that drains an unbounded outbound queue. The
//! socket halves live inside those tasks, so the socket is closed exactly once
//! when both finish. An over-long record is reported to the listener as
//! [`NetError::RecordTooLong`] and skipped; the connection stays open.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use socket2::SockRef;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::NetError;

/// Longest accepted inbound record (1 MiB).
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1024 * 1024;

/// Lifecycle callbacks for one connection.
///
/// Callbacks run on the connection's reader task (or on whichever caller
/// triggered the disconnect) and must not block on I/O.
pub trait ConnectionListener: Send + Sync + 'static {
    fn on_ready(&self, _conn: &StreamConnection) {}

    fn on_record(&self, conn: &StreamConnection, record: String);

    fn on_error(&self, _conn: &StreamConnection, _error: &NetError) {}

    /// Fires exactly once per connection.
    fn on_disconnect(&self, _conn: &StreamConnection) {}
}

/// Cheap, cloneable handle to one connection.
#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: Uuid,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    closed: AtomicBool,
    listener: Arc<dyn ConnectionListener>,
}

impl StreamConnection {
    fn new(
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<String>,
        listener: Arc<dyn ConnectionListener>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: Uuid::new_v4(),
                peer,
                outbound,
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
                listener,
            }),
        }
    }

    /// Dial a server and start the reader and writer tasks.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        listener: Arc<dyn ConnectionListener>,
        max_record_bytes: usize,
    ) -> Result<Self, NetError> {
        let stream = TcpStream::connect(addr).await?;
        Self::spawn(stream, listener, max_record_bytes)
    }

    /// Take ownership of an accepted or dialed socket and start its tasks.
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        stream: TcpStream,
        listener: Arc<dyn ConnectionListener>,
        max_record_bytes: usize,
    ) -> Result<Self, NetError> {
        let peer = stream.peer_addr()?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("{}: failed to set TCP_NODELAY: {}", peer, e);
        }
        if let Err(e) = SockRef::from(&stream).set_keepalive(true) {
            warn!("{}: failed to enable keepalive: {}", peer, e);
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self::new(peer, tx, listener);

        tokio::spawn(write_loop(conn.clone(), write_half, rx));
        conn.inner.listener.on_ready(&conn);
        tokio::spawn(read_loop(conn.clone(), read_half, max_record_bytes));

        info!("Connection {} ({}) established", conn.id(), peer);
        Ok(conn)
    }

    /// A socketless connection. Outbound records are yielded by the returned
    /// receiver; inbound records are fed with [`StreamConnection::inject`].
    pub fn in_memory(
        peer: SocketAddr,
        listener: Arc<dyn ConnectionListener>,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self::new(peer, tx, listener);
        conn.inner.listener.on_ready(&conn);
        (conn, rx)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Queue one record (without trailing newline) for the writer.
    pub fn send(&self, record: impl Into<String>) -> Result<(), NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        self.inner
            .outbound
            .send(record.into())
            .map_err(|_| NetError::Closed)
    }

    /// Deliver an inbound record as if it had been read from the socket.
    pub fn inject(&self, record: impl Into<String>) {
        if self.is_closed() {
            return;
        }
        self.inner.listener.on_record(self, record.into());
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the connection. Idempotent; only the first call notifies the
    /// listener. Records queued before the call are still written.
    pub fn disconnect(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        info!("Connection {} ({}) closed", self.id(), self.peer_addr());
        self.inner.listener.on_disconnect(self);
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }
}

impl PartialEq for StreamConnection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for StreamConnection {}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop(conn: StreamConnection, read_half: OwnedReadHalf, max_record_bytes: usize) {
    let mut reader = FramedRead::new(read_half, RecordCodec::new(max_record_bytes));

    loop {
        let next = tokio::select! {
            _ = conn.inner.cancel.cancelled() => break,
            next = reader.next() => next,
        };

        match next {
            Some(Ok(Inbound::Record(line))) => {
                if line.trim().is_empty() {
                    continue;
                }
                trace!("{} <- {}", conn.peer_addr(), line);
                conn.inner.listener.on_record(&conn, line);
            }
            Some(Ok(Inbound::TooLong)) => {
                let err = NetError::RecordTooLong(max_record_bytes);
                warn!("{}: {}", conn.peer_addr(), err);
                conn.inner.listener.on_error(&conn, &err);
            }
            Some(Err(e)) => {
                let err = codec_error(e, max_record_bytes);
                warn!("{}: read error: {}", conn.peer_addr(), err);
                conn.inner.listener.on_error(&conn, &err);
                break;
            }
            None => {
                debug!("{}: closed by peer", conn.peer_addr());
                break;
            }
        }
    }

    conn.disconnect();
}

#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Record(String),
    /// A record over the limit; its bytes up to the next newline are dropped.
    TooLong,
}

/// [`LinesCodec`] that yields an over-long record as an item instead of an
/// error, so the reader keeps decoding whatever is already buffered.
struct RecordCodec {
    lines: LinesCodec,
}

impl RecordCodec {
    fn new(max_record_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_record_bytes),
        }
    }

    fn wrap(result: Result<Option<String>, LinesCodecError>) -> Result<Option<Inbound>, LinesCodecError> {
        match result {
            Ok(line) => Ok(line.map(Inbound::Record)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Inbound::TooLong)),
            Err(e) => Err(e),
        }
    }
}

impl Decoder for RecordCodec {
    type Item = Inbound;
    type Error = LinesCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, LinesCodecError> {
        Self::wrap(self.lines.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, LinesCodecError> {
        Self::wrap(self.lines.decode_eof(src))
    }
}

async fn write_loop(
    conn: StreamConnection,
    write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    let mut writer = FramedWrite::new(write_half, LinesCodec::new());

    loop {
        tokio::select! {
            biased;
            record = rx.recv() => match record {
                Some(record) => write_record(&conn, &mut writer, record).await,
                None => break,
            },
            _ = conn.inner.cancel.cancelled() => break,
        }
    }

    // Flush what was queued before the disconnect.
    while let Ok(record) = rx.try_recv() {
        write_record(&conn, &mut writer, record).await;
    }

    let mut write_half = writer.into_inner();
    if let Err(e) = write_half.shutdown().await {
        debug!("{}: shutdown error: {}", conn.peer_addr(), e);
    }
}

async fn write_record(
    conn: &StreamConnection,
    writer: &mut FramedWrite<OwnedWriteHalf, LinesCodec>,
    record: String,
) {
    trace!("{} -> {}", conn.peer_addr(), record);
    if let Err(e) = writer.send(record).await {
        let err = codec_error(e, 0);
        warn!("{}: write error: {}", conn.peer_addr(), err);
        conn.inner.listener.on_error(conn, &err);
    }
}

fn codec_error(e: LinesCodecError, max_record_bytes: usize) -> NetError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => NetError::RecordTooLong(max_record_bytes),
        LinesCodecError::Io(e) => NetError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        records: Mutex<Vec<String>>,
        disconnects: AtomicUsize,
    }

    impl ConnectionListener for Recorder {
        fn on_record(&self, _conn: &StreamConnection, record: String) {
            self.records.lock().unwrap().push(record);
        }

        fn on_disconnect(&self, _conn: &StreamConnection) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn peer() -> SocketAddr {
        "10.0.0.5:40000".parse().unwrap()
    }

    #[test]
    fn in_memory_send_and_inject() {
        let recorder = Arc::new(Recorder::default());
        let (conn, mut rx) = StreamConnection::in_memory(peer(), recorder.clone());

        conn.send("type:system_message|content:hi").unwrap();
        assert_eq!(rx.try_recv().unwrap(), "type:system_message|content:hi");

        conn.inject("type:login|username:alice");
        assert_eq!(
            *recorder.records.lock().unwrap(),
            vec!["type:login|username:alice".to_string()]
        );
        assert_eq!(conn.peer_addr(), peer());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let recorder = Arc::new(Recorder::default());
        let (conn, mut rx) = StreamConnection::in_memory(peer(), recorder.clone());

        conn.send("queued").unwrap();
        conn.disconnect();
        conn.disconnect();
        conn.clone().disconnect();

        assert!(conn.is_closed());
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 1);
        assert!(matches!(conn.send("late"), Err(NetError::Closed)));
        // Queued before the disconnect, so still delivered.
        assert_eq!(rx.try_recv().unwrap(), "queued");
        assert!(rx.try_recv().is_err());

        conn.inject("ignored");
        assert!(recorder.records.lock().unwrap().is_empty());
    }

    #[test]
    fn connections_compare_by_identity() {
        let recorder = Arc::new(Recorder::default());
        let (a, _rx_a) = StreamConnection::in_memory(peer(), recorder.clone());
        let (b, _rx_b) = StreamConnection::in_memory(peer(), recorder);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn codec_skips_over_long_record() {
        let mut codec = RecordCodec::new(8);
        let mut buf = BytesMut::from("0123456789abcdef\nshort\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Inbound::TooLong));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::Record("short".into()))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
