
use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{
    make_backend, make_server, make_snapshot, tcp_roundtrip, tls_whoami, PassthroughHandle,
    ProxyV1Backend, TcpEchoBackend, TlsBackend,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn tls_passthrough_sni_routes_to_correct_backend() {
    let backend_a = TlsBackend::spawn(&["a.example.test"], "A").await.unwrap();
    let backend_b = TlsBackend::spawn(&["b.example.test"], "B").await.unwrap();

    let ingress = PassthroughHandle::spawn(make_snapshot(
        vec![
            make_backend("a.example.test", backend_a.addr),
            make_backend("b.example.test", backend_b.addr),
        ],
        None,
        Vec::new(),
    ))
    .await
    .unwrap();

    let response_a = timeout(
        TEST_TIMEOUT,
        tls_whoami(ingress.listen_addr, "a.example.test", &backend_a.cert_der),
    )
    .await
    .expect("TLS connection to A timed out")
    .expect("TLS connection to A failed");
    assert_eq!(response_a, "A", "Expected response from backend A");

    let response_b = timeout(
        TEST_TIMEOUT,
        tls_whoami(ingress.listen_addr, "b.example.test", &backend_b.cert_der),
    )
    .await
    .expect("TLS connection to B timed out")
    .expect("TLS connection to B failed");
    assert_eq!(response_b, "B", "Expected response from backend B");

    assert_eq!(backend_a.connection_count(), 1);
    assert_eq!(backend_b.connection_count(), 1);

    let found = ingress
        .wait_for(|l| l.stats().sni_found.load(Ordering::Relaxed), 2)
        .await;
    assert_eq!(found, 2);
}

#[tokio::test]
async fn unknown_sni_falls_back_to_default() {
    let backend_a = TlsBackend::spawn(&["a.example.test"], "A").await.unwrap();
    let fallback = TlsBackend::spawn(&["other.example.test"], "D").await.unwrap();

    let ingress = PassthroughHandle::spawn(make_snapshot(
        vec![make_backend("a.example.test", backend_a.addr)],
        Some(make_backend("", fallback.addr)),
        Vec::new(),
    ))
    .await
    .unwrap();

    let response = timeout(
        TEST_TIMEOUT,
        tls_whoami(ingress.listen_addr, "other.example.test", &fallback.cert_der),
    )
    .await
    .expect("timed out")
    .expect("TLS connection through default failed");

    assert_eq!(response, "D");
    assert_eq!(backend_a.connection_count(), 0);
    assert_eq!(fallback.connection_count(), 1);
}

#[tokio::test]
async fn non_tls_bytes_use_default_backend_unchanged() {
    let fallback = TcpEchoBackend::spawn().await.unwrap();

    let ingress = PassthroughHandle::spawn(make_snapshot(
        vec![make_backend("a.example.test", fallback.addr)],
        Some(make_backend("", fallback.addr)),
        Vec::new(),
    ))
    .await
    .unwrap();

    let payload = b"GET / HTTP/1.1\r\nHost: a.example.test\r\n\r\n";
    let echoed = timeout(TEST_TIMEOUT, tcp_roundtrip(ingress.listen_addr, payload))
        .await
        .expect("timed out")
        .expect("roundtrip failed");

    assert_eq!(echoed, payload);
    assert_eq!(fallback.connection_count(), 1);

    let failed = ingress
        .wait_for(|l| l.stats().sni_failed.load(Ordering::Relaxed), 1)
        .await;
    assert_eq!(failed, 1);

    // tcp_roundtrip closes its socket, so the client-to-backend copy finishes
    // first with exactly the payload.
    let relayed = ingress
        .wait_for(
            |l| l.stats().bytes_relayed.load(Ordering::Relaxed),
            payload.len() as u64,
        )
        .await;
    assert_eq!(relayed, payload.len() as u64);
}

#[tokio::test]
async fn no_backend_closes_without_response() {
    let ingress = PassthroughHandle::spawn(make_snapshot(Vec::new(), None, Vec::new()))
        .await
        .unwrap();

    let result = timeout(TEST_TIMEOUT, tcp_roundtrip(ingress.listen_addr, b"hello"))
        .await
        .expect("connection should be closed, not left hanging");

    match result {
        Ok(data) => assert!(data.is_empty(), "No bytes should be written back"),
        Err(_) => {}
    }

    let no_backend = ingress
        .wait_for(|l| l.stats().no_backend.load(Ordering::Relaxed), 1)
        .await;
    assert_eq!(no_backend, 1);
}

#[tokio::test]
async fn proxy_v1_header_precedes_client_bytes() {
    let backend = ProxyV1Backend::spawn().await.unwrap();

    let ingress = PassthroughHandle::spawn(make_snapshot(
        Vec::new(),
        Some(make_backend("", backend.addr).with_proxy_protocol(true)),
        Vec::new(),
    ))
    .await
    .unwrap();

    let (client_addr, response) = timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(ingress.listen_addr).await?;
        let client_addr = stream.local_addr()?;
        stream.write_all(b"ping").await?;
        stream.flush().await?;

        let mut buf = vec![0u8; 16];
        let n = stream.read(&mut buf).await?;
        Ok::<_, io::Error>((client_addr, buf[..n].to_vec()))
    })
    .await
    .expect("timed out")
    .expect("connection failed");

    assert_eq!(response, b"ack");

    let preamble = backend
        .get_last_preamble()
        .await
        .expect("Backend should have captured a PROXY header");

    assert_eq!(
        preamble.header_line,
        format!(
            "PROXY TCP4 127.0.0.1 127.0.0.1 {} {}\r\n",
            client_addr.port(),
            ingress.listen_addr.port()
        )
    );
    assert_eq!(preamble.payload, b"ping", "Payload should follow header");
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn proxy_header_not_sent_when_disabled() {
    let backend = ProxyV1Backend::spawn().await.unwrap();

    let ingress = PassthroughHandle::spawn(make_snapshot(
        Vec::new(),
        Some(make_backend("", backend.addr)),
        Vec::new(),
    ))
    .await
    .unwrap();

    let response = timeout(TEST_TIMEOUT, tcp_roundtrip(ingress.listen_addr, b"raw line\r\nrest"))
        .await
        .expect("timed out")
        .expect("connection failed");
    assert_eq!(response, b"ack");

    let preamble = backend.get_last_preamble().await.unwrap();
    assert_eq!(preamble.header_line, "raw line\r\n");
    assert_eq!(preamble.payload, b"rest");
}

#[tokio::test]
async fn allowlist_admits_client_inside_cidr() {
    let backend = TlsBackend::spawn(&["a.example.test"], "A").await.unwrap();

    let ingress = PassthroughHandle::spawn(make_snapshot(
        vec![make_backend("a.example.test", backend.addr)],
        None,
        vec![make_server("a.example.test", true, &["10.0.0.0/8", "127.0.0.0/8"])],
    ))
    .await
    .unwrap();

    let response = timeout(
        TEST_TIMEOUT,
        tls_whoami(ingress.listen_addr, "a.example.test", &backend.cert_der),
    )
    .await
    .expect("timed out")
    .expect("Client inside the allowlist should connect");

    assert_eq!(response, "A");
}

#[tokio::test]
async fn allowlist_denies_client_outside_cidr() {
    let backend = TlsBackend::spawn(&["a.example.test"], "A").await.unwrap();

    let ingress = PassthroughHandle::spawn(make_snapshot(
        vec![make_backend("a.example.test", backend.addr)],
        None,
        vec![make_server("a.example.test", true, &["10.0.0.0/8"])],
    ))
    .await
    .unwrap();

    let result = timeout(
        TEST_TIMEOUT,
        tls_whoami(ingress.listen_addr, "a.example.test", &backend.cert_der),
    )
    .await
    .expect("Denied connection should be closed, not left hanging");

    assert!(result.is_err(), "Handshake should fail on a dropped connection");
    assert_eq!(backend.connection_count(), 0, "Backend must never be dialed");

    let denied = ingress
        .wait_for(|l| l.stats().denied.load(Ordering::Relaxed), 1)
        .await;
    assert_eq!(denied, 1);
}

#[tokio::test]
async fn empty_allowlist_denies_every_client() {
    let backend = TlsBackend::spawn(&["a.example.test"], "A").await.unwrap();

    let ingress = PassthroughHandle::spawn(make_snapshot(
        vec![make_backend("a.example.test", backend.addr)],
        None,
        vec![make_server("a.example.test", true, &[])],
    ))
    .await
    .unwrap();

    let result = timeout(
        TEST_TIMEOUT,
        tls_whoami(ingress.listen_addr, "a.example.test", &backend.cert_der),
    )
    .await
    .expect("timed out");

    assert!(result.is_err());
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn allowlist_skipped_when_passthrough_disabled_for_server() {
    let backend = TlsBackend::spawn(&["a.example.test"], "A").await.unwrap();

    // This allowlist would deny 127.0.0.1, but the entry is not a
    // passthrough server so it is never consulted.
    let ingress = PassthroughHandle::spawn(make_snapshot(
        vec![make_backend("a.example.test", backend.addr)],
        None,
        vec![make_server("a.example.test", false, &["10.0.0.0/8"])],
    ))
    .await
    .unwrap();

    let response = timeout(
        TEST_TIMEOUT,
        tls_whoami(ingress.listen_addr, "a.example.test", &backend.cert_der),
    )
    .await
    .expect("timed out")
    .expect("Connection should be relayed without an allowlist check");

    assert_eq!(response, "A");
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn allowlist_skipped_when_no_server_entry_matches() {
    let backend = TlsBackend::spawn(&["a.example.test"], "A").await.unwrap();

    let ingress = PassthroughHandle::spawn(make_snapshot(
        vec![make_backend("a.example.test", backend.addr)],
        None,
        vec![make_server("z.example.test", true, &["10.0.0.0/8"])],
    ))
    .await
    .unwrap();

    let response = timeout(
        TEST_TIMEOUT,
        tls_whoami(ingress.listen_addr, "a.example.test", &backend.cert_der),
    )
    .await
    .expect("timed out")
    .expect("Connection should be relayed without an allowlist check");

    assert_eq!(response, "A");
}

#[tokio::test]
async fn snapshot_swap_applies_to_new_connections() {
    let first = TcpEchoBackend::spawn().await.unwrap();
    let second = TcpEchoBackend::spawn().await.unwrap();

    let ingress = PassthroughHandle::spawn(make_snapshot(
        Vec::new(),
        Some(make_backend("", first.addr)),
        Vec::new(),
    ))
    .await
    .unwrap();

    let echoed = timeout(TEST_TIMEOUT, tcp_roundtrip(ingress.listen_addr, b"one"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, b"one");

    ingress.replace_snapshot(make_snapshot(
        Vec::new(),
        Some(make_backend("", second.addr)),
        Vec::new(),
    ));

    let echoed = timeout(TEST_TIMEOUT, tcp_roundtrip(ingress.listen_addr, b"two"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, b"two");

    assert_eq!(first.connection_count(), 1);
    assert_eq!(second.connection_count(), 1);
}

#[tokio::test]
async fn invalid_cidr_stops_listener() {
    let backend = TlsBackend::spawn(&["a.example.test"], "A").await.unwrap();

    // Built in code, so it never went through snapshot validation.
    let ingress = PassthroughHandle::spawn(make_snapshot(
        vec![make_backend("a.example.test", backend.addr)],
        None,
        vec![make_server("a.example.test", true, &["not-a-cidr"])],
    ))
    .await
    .unwrap();

    let _ = timeout(
        TEST_TIMEOUT,
        tls_whoami(ingress.listen_addr, "a.example.test", &backend.cert_der),
    )
    .await;

    let run_result = timeout(TEST_TIMEOUT, ingress.run_handle)
        .await
        .expect("Listener should stop on invalid configuration")
        .unwrap();

    let err = run_result.expect_err("Listener should return an error");
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    assert_eq!(backend.connection_count(), 0);
}
