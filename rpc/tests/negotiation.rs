//! Negotiation: failure tears the connection down before any RPC traffic,
//! and a real blocking handshake hands cleanly back to the reactor.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rpc::{
    Direction, DumpState, InboundCall, InboundRequest, NegotiationOutcome, Negotiator, Protocol,
    ReactorBuilder, RpcError,
};

/// Rejects every connection.
struct FailingNegotiator;

impl Negotiator for FailingNegotiator {
    fn negotiate(
        &self,
        _socket: &mut TcpStream,
        _direction: Direction,
        _protocol: Protocol,
        _deadline: Instant,
    ) -> Result<NegotiationOutcome, RpcError> {
        Err(RpcError::Corruption("handshake rejected".into()))
    }
}

/// A four-byte greeting exchange: the client sends "HELO", the server
/// answers "OK". Exercises blocking I/O on the duplicated socket.
struct TokenNegotiator;

impl Negotiator for TokenNegotiator {
    fn negotiate(
        &self,
        socket: &mut TcpStream,
        direction: Direction,
        _protocol: Protocol,
        _deadline: Instant,
    ) -> Result<NegotiationOutcome, RpcError> {
        let corrupt = |e: std::io::Error| RpcError::Corruption(e.to_string());
        match direction {
            Direction::Server => {
                let mut greeting = [0u8; 4];
                socket.read_exact(&mut greeting).map_err(corrupt)?;
                if &greeting != b"HELO" {
                    return Err(RpcError::Corruption("bad greeting".into()));
                }
                socket.write_all(b"OK").map_err(corrupt)?;
                Ok(NegotiationOutcome {
                    user: Some("anonymous".into()),
                })
            }
            Direction::Client => {
                socket.write_all(b"HELO").map_err(corrupt)?;
                let mut ack = [0u8; 2];
                socket.read_exact(&mut ack).map_err(corrupt)?;
                if &ack != b"OK" {
                    return Err(RpcError::Corruption("bad ack".into()));
                }
                Ok(NegotiationOutcome::default())
            }
        }
    }
}

fn echo_service() -> crossbeam_channel::Sender<InboundCall> {
    let (tx, rx) = crossbeam_channel::unbounded::<InboundCall>();
    thread::spawn(move || {
        while let Ok(call) = rx.recv() {
            let payload = match call.request() {
                InboundRequest::Yb { payload, .. } => payload.clone(),
                _ => Bytes::new(),
            };
            call.respond(payload);
        }
    });
    tx
}

#[test]
fn failed_negotiation_tears_down_before_any_rpc_traffic() {
    let (tx, service_rx) = crossbeam_channel::unbounded::<InboundCall>();
    let server = ReactorBuilder::new("neg-fail-server")
        .listener(Protocol::Yb, "127.0.0.1:0".parse().unwrap())
        .negotiator(Arc::new(FailingNegotiator))
        .spawn(tx)
        .unwrap();
    let addr = server.listen_addrs()[0];

    let mut sock = TcpStream::connect(addr).unwrap();
    let _ = sock.write_all(&protocol_yb::encode_frame(1, b"early"));

    sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 64];
    loop {
        match sock.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => break,
            Err(e) => panic!("expected the connection to close, got {e}"),
        }
    }
    // The early frame was never dispatched.
    assert!(service_rx.is_empty());
}

#[test]
fn blocking_handshake_hands_back_to_the_reactor() {
    let server = ReactorBuilder::new("neg-server")
        .listener(Protocol::Yb, "127.0.0.1:0".parse().unwrap())
        .negotiator(Arc::new(TokenNegotiator))
        .spawn(echo_service())
        .unwrap();
    let addr = server.listen_addrs()[0];

    let (client_tx, _client_rx) = crossbeam_channel::unbounded();
    let client = ReactorBuilder::new("neg-client")
        .negotiator(Arc::new(TokenNegotiator))
        .spawn(client_tx)
        .unwrap();

    let conn = client.handle().connect(addr).unwrap();
    let rx = client.handle().call(
        conn,
        Bytes::from_static(b"after-handshake"),
        Some(Duration::from_secs(5)),
    );
    assert_eq!(
        rx.blocking_recv().unwrap().unwrap(),
        Bytes::from_static(b"after-handshake")
    );

    // The server's snapshot reports the authenticated user once open.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let dumps = server.handle().dump().unwrap();
        if dumps
            .iter()
            .any(|d| d.state == DumpState::Open && d.user.as_deref() == Some("anonymous"))
        {
            break;
        }
        assert!(Instant::now() < deadline, "server never reported the user");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn negotiation_timeout_fails_the_connection() {
    /// Server side never answers the greeting.
    struct SilentNegotiator;
    impl Negotiator for SilentNegotiator {
        fn negotiate(
            &self,
            socket: &mut TcpStream,
            _direction: Direction,
            _protocol: Protocol,
            _deadline: Instant,
        ) -> Result<NegotiationOutcome, RpcError> {
            let mut greeting = [0u8; 4];
            socket
                .read_exact(&mut greeting)
                .map_err(|e| RpcError::Corruption(e.to_string()))?;
            Ok(NegotiationOutcome::default())
        }
    }

    let (tx, _service_rx) = crossbeam_channel::unbounded::<InboundCall>();
    let server = ReactorBuilder::new("neg-timeout-server")
        .listener(Protocol::Yb, "127.0.0.1:0".parse().unwrap())
        .negotiator(Arc::new(SilentNegotiator))
        .negotiation_timeout(Duration::from_millis(200))
        .spawn(tx)
        .unwrap();
    let addr = server.listen_addrs()[0];

    // Connect but never send the greeting; the read deadline expires and
    // the connection is torn down.
    let mut sock = TcpStream::connect(addr).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    let mut buf = [0u8; 16];
    match sock.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected EOF, read {n} bytes"),
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {}
        Err(e) => panic!("expected the connection to close, got {e}"),
    }
}
