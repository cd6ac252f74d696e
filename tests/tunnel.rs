//! CONNECT tunnel tests.

use std::time::Duration;

use sslstrip_proxy::net::tunnel::CONNECTION_ESTABLISHED;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

mod common;

#[tokio::test]
async fn test_connect_replies_with_literal_then_relays() {
    let echo = common::start_echo_server().await;
    let (proxy, downgrades, shutdown) = common::start_proxy().await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut reply = vec![0u8; CONNECTION_ESTABLISHED.len()];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, CONNECTION_ESTABLISHED);
    assert_eq!(
        reply,
        b"HTTP/1.1 200 Connection established\r\nConnection: keep-alive\r\n\r\n"
    );

    stream.write_all(b"\x16\x03\x01opaque").await.unwrap();
    let mut echoed = [0u8; 9];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"\x16\x03\x01opaque");
    assert!(downgrades.is_empty());

    shutdown.trigger();
}

#[tokio::test]
async fn test_pipelined_bytes_follow_the_success_line() {
    let echo = common::start_echo_server().await;
    let (proxy, _, shutdown) = common::start_proxy().await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {echo} HTTP/1.1\r\n\r\nhello");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut reply = vec![0u8; CONNECTION_ESTABLISHED.len() + 5];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..CONNECTION_ESTABLISHED.len()], CONNECTION_ESTABLISHED);
    assert_eq!(&reply[CONNECTION_ESTABLISHED.len()..], b"hello");

    shutdown.trigger();
}

#[tokio::test]
async fn test_connect_failure_closes_connection() {
    let dead = common::dead_addr().await;
    let (proxy, _, shutdown) = common::start_proxy().await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {dead} HTTP/1.1\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
    assert!(read.is_ok(), "connection should be closed");
    assert!(rest.is_empty());

    shutdown.trigger();
}

#[tokio::test]
async fn test_connect_after_http_request_uses_upgrade() {
    let echo = common::start_echo_server().await;
    let (proxy, _, shutdown) = common::start_proxy().await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(b"GET /nohost HTTP/1.1\r\n\r\n").await.unwrap();

    let expected_first = b"no absolute target";
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.ends_with(expected_first) {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "proxy closed the keep-alive connection");
        buf.extend_from_slice(&chunk[..n]);
    }
    assert!(buf.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));

    let second = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    stream.write_all(second.as_bytes()).await.unwrap();
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut chunk[..1]).await.unwrap();
        assert!(n > 0);
        head.push(chunk[0]);
    }
    assert!(head.starts_with(b"HTTP/1.1 200 Connection established\r\n"));

    stream.write_all(b"ping").await.unwrap();
    let mut pong = [0u8; 4];
    stream.read_exact(&mut pong).await.unwrap();
    assert_eq!(&pong, b"ping");

    shutdown.trigger();
}

#[tokio::test]
async fn test_failed_connect_after_http_request_closes_connection() {
    let dead = common::dead_addr().await;
    let (proxy, _, shutdown) = common::start_proxy().await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(b"GET /nohost HTTP/1.1\r\n\r\n").await.unwrap();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.ends_with(b"no absolute target") {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0);
        buf.extend_from_slice(&chunk[..n]);
    }

    let connect = format!("CONNECT {dead} HTTP/1.1\r\nHost: {dead}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await.unwrap();
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
    assert!(read.is_ok(), "connection should be closed");
    assert!(rest.starts_with(b"HTTP/1.1 502 Proxy fetch failed\r\n"));

    shutdown.trigger();
}
