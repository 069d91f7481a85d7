//! HTTPS: the encrypted conduit pair under the usual HTTP chains.

use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use sluice::handler::EchoHandler;
use sluice::HttpServer;

mod common;
use common::{start, test_config, wait_for_idle_pool};

fn self_signed() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let der = CertificateDer::from(cert.cert.der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
    (der, key)
}

/// Write `request` over a fresh TLS session and read until the server closes.
fn exchange(addr: SocketAddr, trusted: CertificateDer<'static>, request: &[u8]) -> Vec<u8> {
    let mut roots = RootCertStore::empty();
    roots.add(trusted).unwrap();
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let session = ClientConnection::new(Arc::new(config), ServerName::try_from("localhost").unwrap()).unwrap();

    let tcp = std::net::TcpStream::connect(addr).unwrap();
    tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut tls = StreamOwned::new(session, tcp);
    tls.write_all(request).unwrap();

    let mut out = Vec::new();
    match tls.read_to_end(&mut out) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {}
        Err(e) => panic!("TLS read failed: {}", e),
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn https_echo() {
    let (cert, key) = self_signed();
    let server_config = sluice::net::tls::server_config(vec![cert.clone()], key).unwrap();
    let server = start(HttpServer::new(test_config(), EchoHandler).with_tls(server_config)).await;
    let addr = server.addr;

    let response = tokio::task::spawn_blocking(move || {
        exchange(
            addr,
            cert,
            b"POST /secure HTTP/1.1\r\nHost: localhost\r\nContent-Length: 9\r\nConnection: close\r\n\r\nover tls!",
        )
    })
    .await
    .unwrap();

    let split = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let head = String::from_utf8(response[..split].to_vec()).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{}", head);
    assert!(head.contains("connection: close\r\n"));
    assert!(head.contains("transfer-encoding: chunked\r\n"));
    assert_eq!(decode_chunked(&response[split..]), b"over tls!");

    assert_eq!(wait_for_idle_pool(&server.pool).await, 0);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn https_body_larger_than_a_buffer() {
    let (cert, key) = self_signed();
    let server_config = sluice::net::tls::server_config(vec![cert.clone()], key).unwrap();
    let server = start(HttpServer::new(test_config(), EchoHandler).with_tls(server_config)).await;
    let addr = server.addr;

    // Several times the 4 KiB test buffer, so both directions cycle the wire.
    let body: Vec<u8> = (b'a'..=b'z').cycle().take(20_000).collect();
    let mut request = format!(
        "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);

    let response = tokio::task::spawn_blocking(move || exchange(addr, cert, &request))
        .await
        .unwrap();

    let split = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert_eq!(decode_chunked(&response[split..]), body);
    server.stop().await;
}

fn decode_chunked(mut data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let line_end = data.windows(2).position(|w| w == b"\r\n").unwrap();
        let size = usize::from_str_radix(std::str::from_utf8(&data[..line_end]).unwrap(), 16).unwrap();
        data = &data[line_end + 2..];
        if size == 0 {
            return out;
        }
        out.extend_from_slice(&data[..size]);
        data = &data[size + 2..];
    }
}
