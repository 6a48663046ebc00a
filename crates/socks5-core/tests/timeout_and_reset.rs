//! Grounded directly on `synchronization_test.cc`'s `HandshakeTimeout` and
//! `ServerConnResetProxyHang`: both set a deadline on the *test's own*
//! socket so a regression that reintroduces an indefinite hang fails the
//! test promptly instead of blocking the test runner forever.

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

#[test]
fn handshake_timeout_closes_client_instead_of_hanging() {
    let proxy_addr = spawn_proxy(65536);
    let mut client = TcpStream::connect(proxy_addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(8)))
        .unwrap();

    // Send only the first byte of the greeting and then go silent. The
    // proxy's 5-second handshake watchdog should close the connection
    // rather than wait forever for the rest.
    client.write_all(&[0x05]).unwrap();

    let mut buf = [0u8; 1];
    let read = client.read(&mut buf);
    match read {
        Ok(0) => {}
        Err(_) => {}
        Ok(n) => panic!("expected EOF/closed connection, got {n} bytes"),
    }
}

#[test]
fn destination_reset_closes_client_instead_of_hanging() {
    let dest_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dest_addr = dest_listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = dest_listener.accept().unwrap();
        // Force an RST instead of a clean FIN on close.
        stream.set_linger(Some(Duration::ZERO)).unwrap();
        drop(stream);
    });

    let proxy_addr = spawn_proxy(65536);
    let mut client = TcpStream::connect(proxy_addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(8)))
        .unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).unwrap();
    let mut greet_reply = [0u8; 2];
    client.read_exact(&mut greet_reply).unwrap();
    assert_eq!(greet_reply, [0x05, 0x00]);

    let std::net::SocketAddr::V4(v4) = dest_addr else {
        panic!("ipv4 only");
    };
    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    req.extend_from_slice(&v4.ip().octets());
    req.extend_from_slice(&v4.port().to_be_bytes());
    client.write_all(&req).unwrap();

    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).unwrap();
    assert_eq!(connect_reply[1], 0x00, "CONNECT should still succeed");

    // The destination is gone; the proxy must notice and close the client
    // side within its watchdog window rather than hang.
    let mut buf = [0u8; 1];
    let read = client.read(&mut buf);
    match read {
        Ok(0) => {}
        Err(_) => {}
        Ok(n) => panic!("expected EOF/closed connection, got {n} bytes"),
    }
}
