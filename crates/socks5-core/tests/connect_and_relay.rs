use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::OwnedFd;
use std::thread;
use std::time::Duration;

fn spawn_proxy(buffer_size: usize) -> std::net::SocketAddr {
    let front = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = front.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = front.accept().unwrap();
        let fd = OwnedFd::from(stream);
        socks5_core::serve_client(fd, buffer_size);
    });
    addr
}

fn greet(client: &mut TcpStream) {
    client.write_all(&[0x05, 0x01, 0x00]).unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [0x05, 0x00]);
}

fn connect_request(client: &mut TcpStream, dest: std::net::SocketAddr) {
    let std::net::SocketAddr::V4(v4) = dest else {
        panic!("test only uses IPv4 destinations");
    };
    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    req.extend_from_slice(&v4.ip().octets());
    req.extend_from_slice(&v4.port().to_be_bytes());
    client.write_all(&req).unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(reply[0], 0x05, "reply version");
    assert_eq!(reply[1], 0x00, "reply code: success");
}

#[test]
fn happy_path_connect_and_bidirectional_relay() {
    let dest_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dest_addr = dest_listener.local_addr().unwrap();
    let dest_thread = thread::spawn(move || {
        let (mut stream, _) = dest_listener.accept().unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        stream.write_all(b"world").unwrap();
    });

    let proxy_addr = spawn_proxy(65536);
    let mut client = TcpStream::connect(proxy_addr).unwrap();
    greet(&mut client);
    connect_request(&mut client, dest_addr);

    client.write_all(b"hello").unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"world");

    dest_thread.join().unwrap();
}

#[test]
fn method_negotiation_rejects_when_no_auth_not_offered() {
    let proxy_addr = spawn_proxy(65536);
    let mut client = TcpStream::connect(proxy_addr).unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [0x05, 0xFF]);

    // The proxy tears down the connection after a rejected negotiation.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn split_handshake_bytes_across_multiple_writes() {
    let dest_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dest_addr = dest_listener.local_addr().unwrap();
    let dest_thread = thread::spawn(move || {
        let (_stream, _) = dest_listener.accept().unwrap();
    });

    let proxy_addr = spawn_proxy(65536);
    let mut client = TcpStream::connect(proxy_addr).unwrap();

    // Send the greeting one byte at a time.
    for byte in [0x05u8, 0x01, 0x00] {
        client.write_all(&[byte]).unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    let std::net::SocketAddr::V4(v4) = dest_addr else {
        panic!("ipv4 only");
    };
    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    req.extend_from_slice(&v4.ip().octets());
    req.extend_from_slice(&v4.port().to_be_bytes());
    for chunk in req.chunks(3) {
        client.write_all(chunk).unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    let mut resp = [0u8; 10];
    client.read_exact(&mut resp).unwrap();
    assert_eq!(resp[1], 0x00);

    dest_thread.join().unwrap();
}

#[test]
fn payload_pipelined_with_handshake_request_is_still_forwarded() {
    let dest_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dest_addr = dest_listener.local_addr().unwrap();
    let dest_thread = thread::spawn(move || {
        let (mut stream, _) = dest_listener.accept().unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    });

    let proxy_addr = spawn_proxy(65536);
    let mut client = TcpStream::connect(proxy_addr).unwrap();

    let std::net::SocketAddr::V4(v4) = dest_addr else {
        panic!("ipv4 only");
    };
    let mut handshake = vec![0x05, 0x01, 0x00];
    handshake.extend_from_slice(&[0x05, 0x01, 0x00, 0x01]);
    handshake.extend_from_slice(&v4.ip().octets());
    handshake.extend_from_slice(&v4.port().to_be_bytes());
    // Append payload bytes in the same write the request arrives in, as a
    // client that doesn't wait for the CONNECT reply before sending data.
    handshake.extend_from_slice(b"ping");
    client.write_all(&handshake).unwrap();

    let mut greet_reply = [0u8; 2];
    client.read_exact(&mut greet_reply).unwrap();
    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).unwrap();
    assert_eq!(connect_reply[1], 0x00);

    dest_thread.join().unwrap();
}

/// A ~1 MiB pipelined payload, sent in the same writes as the handshake and
/// CONNECT request, spans many default-sized (64 KiB) buffer blocks on its
/// way through a live socket rather than the synthetic tiny-block coverage
/// `buffer.rs`'s unit tests exercise.
const LARGE_PAYLOAD_LEN: usize = 1024 * 1024 + 37;

fn large_payload() -> Vec<u8> {
    (0..LARGE_PAYLOAD_LEN).map(|i| (i % 251) as u8).collect()
}

#[test]
fn one_mebibyte_pipelined_payload_spans_many_buffer_blocks() {
    let dest_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dest_addr = dest_listener.local_addr().unwrap();
    let payload = large_payload();
    let expected = payload.clone();
    let dest_thread = thread::spawn(move || {
        let (mut stream, _) = dest_listener.accept().unwrap();
        let mut received = vec![0u8; expected.len()];
        stream.read_exact(&mut received).unwrap();
        assert_eq!(received, expected);
    });

    let proxy_addr = spawn_proxy(65536);
    let mut client = TcpStream::connect(proxy_addr).unwrap();

    let std::net::SocketAddr::V4(v4) = dest_addr else {
        panic!("ipv4 only");
    };
    let mut handshake = vec![0x05, 0x01, 0x00];
    handshake.extend_from_slice(&[0x05, 0x01, 0x00, 0x01]);
    handshake.extend_from_slice(&v4.ip().octets());
    handshake.extend_from_slice(&v4.port().to_be_bytes());
    handshake.extend_from_slice(&payload);
    client.write_all(&handshake).unwrap();

    let mut greet_reply = [0u8; 2];
    client.read_exact(&mut greet_reply).unwrap();
    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).unwrap();
    assert_eq!(connect_reply[1], 0x00);

    dest_thread.join().unwrap();
}
