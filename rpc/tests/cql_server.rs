//! End-to-end tests for the binary SQL protocol: pipelining and direction
//! validation.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use rpc::{InboundCall, InboundRequest, Protocol, ReactorBuilder, ReactorClient};

fn spawn_server(dispatcher: crossbeam_channel::Sender<InboundCall>) -> ReactorClient {
    ReactorBuilder::new("cql-server")
        .listener(Protocol::Cql, "127.0.0.1:0".parse().unwrap())
        .spawn(dispatcher)
        .unwrap()
}

fn read_response_frame(sock: &mut TcpStream) -> (protocol_cql::Header, Vec<u8>) {
    sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut header_bytes = [0u8; protocol_cql::HEADER_LEN];
    sock.read_exact(&mut header_bytes).unwrap();
    let header = protocol_cql::Header::decode(&header_bytes).unwrap();
    let mut body = vec![0u8; header.body_len];
    sock.read_exact(&mut body).unwrap();
    (header, body)
}

#[test]
fn pipelined_queries_are_answered_by_stream_id() {
    // Hold both queries, then answer them in reverse order.
    let (tx, service_rx) = crossbeam_channel::unbounded::<InboundCall>();
    thread::spawn(move || {
        let first = service_rx.recv().unwrap();
        let second = service_rx.recv().unwrap();
        second.respond(Bytes::from_static(b"second-result"));
        first.respond(Bytes::from_static(b"first-result"));
    });

    let server = spawn_server(tx);
    let addr = server.listen_addrs()[0];
    let mut sock = TcpStream::connect(addr).unwrap();

    let mut wire = protocol_cql::encode_request_frame(4, 1, 0x07, b"select 1").to_vec();
    wire.extend_from_slice(&protocol_cql::encode_request_frame(4, 2, 0x07, b"select 2"));
    sock.write_all(&wire).unwrap();

    // Responses come back in completion order, correlated by stream id.
    let (header, body) = read_response_frame(&mut sock);
    assert!(header.is_response());
    assert_eq!(header.stream_id, 2);
    assert_eq!(&body, b"second-result");

    let (header, body) = read_response_frame(&mut sock);
    assert_eq!(header.stream_id, 1);
    assert_eq!(&body, b"first-result");
}

#[test]
fn query_payload_reaches_the_service() {
    let (tx, service_rx) = crossbeam_channel::unbounded::<InboundCall>();
    let (seen_tx, seen_rx) = crossbeam_channel::unbounded::<(u16, u8, Vec<u8>)>();
    thread::spawn(move || {
        while let Ok(call) = service_rx.recv() {
            if let InboundRequest::Cql {
                stream_id,
                opcode,
                body,
                ..
            } = call.request()
            {
                seen_tx.send((*stream_id, *opcode, body.to_vec())).unwrap();
            }
            call.respond(Bytes::new());
        }
    });

    let server = spawn_server(tx);
    let addr = server.listen_addrs()[0];
    let mut sock = TcpStream::connect(addr).unwrap();

    sock.write_all(&protocol_cql::encode_request_frame(4, 99, 0x07, b"select now()"))
        .unwrap();
    let (stream_id, opcode, body) = seen_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(stream_id, 99);
    assert_eq!(opcode, 0x07);
    assert_eq!(body, b"select now()");
}

#[test]
fn response_direction_frame_closes_the_connection() {
    let (tx, _service_rx) = crossbeam_channel::unbounded::<InboundCall>();
    let server = spawn_server(tx);
    let addr = server.listen_addrs()[0];
    let mut sock = TcpStream::connect(addr).unwrap();

    let mut frame = protocol_cql::encode_request_frame(4, 1, 0x07, b"q").to_vec();
    frame[0] |= protocol_cql::DIRECTION_RESPONSE;
    sock.write_all(&frame).unwrap();

    sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 64];
    loop {
        match sock.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return,
            Err(e) => panic!("expected the connection to close, got {e}"),
        }
    }
}
