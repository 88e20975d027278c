/// Integration tests: real sockets on the loopback interface.
///
/// A TCP server echoes records back through `StreamConnection`, and two
/// datagram relays exchange audio-sized packets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parley_net::{ConnectionListener, DEFAULT_MAX_RECORD_BYTES, DatagramRelay, NetError, StreamConnection};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Seen {
    Record(String),
    Error(String),
    Disconnect,
}

/// Forwards every callback into a channel the test can await.
struct Recorder {
    tx: mpsc::UnboundedSender<Seen>,
    echo: bool,
}

impl ConnectionListener for Recorder {
    fn on_record(&self, conn: &StreamConnection, record: String) {
        let _ = self.tx.send(Seen::Record(record.clone()));
        if self.echo {
            if record == "quit" {
                conn.send("bye").unwrap();
                conn.disconnect();
            } else {
                conn.send(format!("echo {}", record)).unwrap();
            }
        }
    }

    fn on_error(&self, _conn: &StreamConnection, error: &NetError) {
        let _ = self.tx.send(Seen::Error(error.to_string()));
    }

    fn on_disconnect(&self, _conn: &StreamConnection) {
        let _ = self.tx.send(Seen::Disconnect);
    }
}

async fn echo_server(max_record_bytes: usize) -> (SocketAddr, mpsc::UnboundedReceiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let recorder = Arc::new(Recorder { tx: tx.clone(), echo: true });
            StreamConnection::spawn(stream, recorder, max_record_bytes).unwrap();
        }
    });
    (addr, rx)
}

async fn client(addr: SocketAddr) -> (StreamConnection, mpsc::UnboundedReceiver<Seen>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let recorder = Arc::new(Recorder { tx, echo: false });
    let conn = StreamConnection::connect(addr, recorder, DEFAULT_MAX_RECORD_BYTES)
        .await
        .unwrap();
    (conn, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

/// Skips transport errors (a reset may precede EOF) until the disconnect.
async fn until_disconnect(rx: &mut mpsc::UnboundedReceiver<Seen>) {
    loop {
        match next(rx).await {
            Seen::Disconnect => return,
            Seen::Error(_) => continue,
            Seen::Record(r) => panic!("unexpected record {}", r),
        }
    }
}

#[tokio::test]
async fn records_arrive_in_order() {
    let (addr, mut server_rx) = echo_server(DEFAULT_MAX_RECORD_BYTES).await;
    let (conn, mut client_rx) = client(addr).await;

    for i in 0..20 {
        conn.send(format!("type:private_message|content:{}", i)).unwrap();
    }

    for i in 0..20 {
        match next(&mut server_rx).await {
            Seen::Record(r) => assert_eq!(r, format!("type:private_message|content:{}", i)),
            other => panic!("unexpected {:?}", other),
        }
        match next(&mut client_rx).await {
            Seen::Record(r) => assert_eq!(r, format!("echo type:private_message|content:{}", i)),
            other => panic!("unexpected {:?}", other),
        }
    }

    conn.disconnect();
    assert!(matches!(next(&mut client_rx).await, Seen::Disconnect));
    assert!(matches!(next(&mut server_rx).await, Seen::Disconnect));
}

#[tokio::test]
async fn queued_reply_is_flushed_before_close() {
    let (addr, mut server_rx) = echo_server(DEFAULT_MAX_RECORD_BYTES).await;
    let (conn, mut client_rx) = client(addr).await;

    conn.send("quit").unwrap();

    match next(&mut client_rx).await {
        Seen::Record(r) => assert_eq!(r, "bye"),
        other => panic!("unexpected {:?}", other),
    }
    until_disconnect(&mut client_rx).await;

    assert!(matches!(next(&mut server_rx).await, Seen::Record(_)));
    assert!(matches!(next(&mut server_rx).await, Seen::Disconnect));
    conn.closed().await;
}

#[tokio::test]
async fn over_long_record_is_reported_and_skipped() {
    let (addr, mut server_rx) = echo_server(64).await;
    let (conn, mut client_rx) = client(addr).await;

    // Both records usually land in one read, so the short one is already
    // buffered behind the long one.
    conn.send("x".repeat(1000)).unwrap();
    conn.send("after").unwrap();

    match next(&mut server_rx).await {
        Seen::Error(e) => assert_eq!(e, "record exceeds 64 bytes"),
        other => panic!("unexpected {:?}", other),
    }
    match next(&mut server_rx).await {
        Seen::Record(r) => assert_eq!(r, "after"),
        other => panic!("unexpected {:?}", other),
    }
    match next(&mut client_rx).await {
        Seen::Record(r) => assert_eq!(r, "echo after"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(!conn.is_closed());
}

#[test]
fn datagram_relays_exchange_packets() {
    let a = DatagramRelay::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let b = DatagramRelay::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    a.configure_peer(b.local_addr());
    b.configure_peer(a.local_addr());

    let (a_tx, a_rx) = crossbeam_channel::unbounded::<(Vec<u8>, SocketAddr)>();
    let (b_tx, b_rx) = crossbeam_channel::unbounded::<(Vec<u8>, SocketAddr)>();
    a.start(Arc::new(move |data: &[u8], from: SocketAddr| {
        let _ = a_tx.send((data.to_vec(), from));
    }))
    .unwrap();
    b.start(Arc::new(move |data: &[u8], from: SocketAddr| {
        let _ = b_tx.send((data.to_vec(), from));
    }))
    .unwrap();

    let frame: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
    a.send(&frame).unwrap();
    let (data, from) = b_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(data, frame);
    assert_eq!(from, a.local_addr());

    b.send(b"pong").unwrap();
    let (data, _) = a_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(data, b"pong");

    a.close();
    b.close();
}

#[test]
fn datagram_relay_accepts_unconfigured_senders() {
    let relay = DatagramRelay::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let stranger = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

    let (tx, rx) = crossbeam_channel::unbounded::<SocketAddr>();
    relay
        .start(Arc::new(move |_: &[u8], from: SocketAddr| {
            let _ = tx.send(from);
        }))
        .unwrap();

    stranger.send_to(b"hello", relay.local_addr()).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), stranger.local_addr().unwrap());
    relay.close();
}
