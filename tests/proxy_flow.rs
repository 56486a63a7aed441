//! Integration tests for the intercepting proxy against a scripted
//! forwarder stub sharing a rendezvous tempdir.
//!
//! The stub plays the Internet-side role without any networking: it claims
//! request envelopes, fabricates responses, and publishes them — which is
//! exactly the contract the real forwarder honors.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use della_wonders::envelope::{
    decode_request, encode_response, ResponseEnvelope, ResponseMeta, ResponsePayload,
    ResponseSecurity, ScanResults, SecurityStatus, DEFAULT_MAX_RESPONSE_SIZE,
};
use della_wonders::proxy::{ProxyCa, ProxyConfig, ProxyServer, DEFAULT_SOURCE_PROCESS};
use della_wonders::store::{Kind, RendezvousStore};

/// Everything a proxy test needs: the tempdir, a store handle, the bound
/// address, and the shutdown sender keeping the server alive.
struct ProxyFixture {
    _dir: tempfile::TempDir,
    store: Arc<RendezvousStore>,
    ca: Arc<ProxyCa>,
    addr: SocketAddr,
    _shutdown_tx: watch::Sender<bool>,
}

async fn start_proxy(response_timeout: Duration) -> ProxyFixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RendezvousStore::open(dir.path()).unwrap());
    let ca = Arc::new(ProxyCa::generate().unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let config = ProxyConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ca: ca.clone(),
        store: store.clone(),
        response_timeout,
        max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        source_process: DEFAULT_SOURCE_PROCESS.to_string(),
    };
    let server = ProxyServer::bind(config, shutdown_rx).await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run());

    ProxyFixture {
        _dir: dir,
        store,
        ca,
        addr,
        _shutdown_tx: shutdown_tx,
    }
}

/// Scripted forwarder: answer every request with `make_reply`, archive it,
/// repeat until the task is dropped.
fn spawn_stub_forwarder<F>(store: Arc<RendezvousStore>, make_reply: F)
where
    F: Fn(&della_wonders::envelope::RequestEnvelope) -> ResponseEnvelope + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            while let Ok(Some((id, bytes))) = store.claim(Kind::Requests) {
                let request = decode_request(&bytes).expect("stub got invalid request");
                let reply = make_reply(&request);
                let encoded = encode_response(&reply).unwrap();
                store.publish(Kind::Responses, &id, &encoded).unwrap();
                store.archive(&id).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    });
}

fn approved_reply(request_id: &str, status_code: u16, body: &[u8]) -> ResponseEnvelope {
    ResponseEnvelope {
        metadata: ResponseMeta {
            request_id: request_id.to_string(),
            processed_at: chrono::Utc::now(),
            forwarder_version: "1.0.0".to_string(),
            security_status: SecurityStatus::Approved,
        },
        response: Some(ResponsePayload {
            status_code,
            reason: "OK".to_string(),
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            body: body.to_vec(),
            http_version: "HTTP/1.1".to_string(),
        }),
        security: ResponseSecurity {
            content_filtered: false,
            response_hash: String::new(),
            scan_results: ScanResults::default(),
        },
    }
}

/// Poll until `cond` holds; the stub and the proxy settle the directory a
/// beat after the client sees its response.
async fn settle(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("never settled: {what}");
}

/// Issue one absolute-form request and read the full response.
async fn proxy_exchange(addr: SocketAddr, request: &str) -> (u16, String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header/body separator in response");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let body = raw[split + 4..].to_vec();

    let status: u16 = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("unparseable status line");

    (status, head, body)
}

#[tokio::test]
async fn test_happy_path_get() {
    let fixture = start_proxy(Duration::from_secs(10)).await;
    spawn_stub_forwarder(fixture.store.clone(), |request| {
        assert_eq!(request.request.method, "GET");
        assert_eq!(request.request.url, "http://example.invalid/ping");
        approved_reply(&request.metadata.request_id, 200, b"pong")
    });

    let (status, _head, body) = proxy_exchange(
        fixture.addr,
        "GET http://example.invalid/ping HTTP/1.1\r\n\
         Host: example.invalid\r\n\
         Connection: close\r\n\r\n",
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body, b"pong");

    // request archived by the stub, response consumed by the proxy
    let store = fixture.store.clone();
    settle("request archived", || {
        store.list_ids(Kind::Requests).unwrap().is_empty()
    })
    .await;
    let store = fixture.store.clone();
    settle("response consumed", || {
        store.list_ids(Kind::Responses).unwrap().is_empty()
    })
    .await;
    assert_eq!(fixture.store.list_ids(Kind::Processed).unwrap().len(), 1);
}

#[tokio::test]
async fn test_gateway_timeout_leaves_request_on_disk() {
    // nobody is forwarding
    let fixture = start_proxy(Duration::from_secs(2)).await;

    let started = std::time::Instant::now();
    let (status, _head, _body) = proxy_exchange(
        fixture.addr,
        "GET http://example.invalid/slow HTTP/1.1\r\n\
         Host: example.invalid\r\n\
         Connection: close\r\n\r\n",
    )
    .await;

    assert_eq!(status, 504);
    assert!(started.elapsed() >= Duration::from_secs(2));
    // the request file stays for the sweeper
    assert_eq!(fixture.store.list_ids(Kind::Requests).unwrap().len(), 1);
}

#[tokio::test]
async fn test_blocked_reply_without_payload_maps_to_403() {
    let fixture = start_proxy(Duration::from_secs(10)).await;
    spawn_stub_forwarder(fixture.store.clone(), |request| {
        let mut reply = approved_reply(&request.metadata.request_id, 200, b"");
        reply.metadata.security_status = SecurityStatus::Blocked;
        reply.response = None;
        reply
    });

    let (status, _head, _body) = proxy_exchange(
        fixture.addr,
        "GET http://blocked.example/ HTTP/1.1\r\n\
         Host: blocked.example\r\n\
         Connection: close\r\n\r\n",
    )
    .await;

    assert_eq!(status, 403);
}

#[tokio::test]
async fn test_relative_uri_is_bad_request() {
    let fixture = start_proxy(Duration::from_secs(5)).await;

    let (status, _head, _body) = proxy_exchange(
        fixture.addr,
        "GET /not-absolute HTTP/1.1\r\n\
         Host: example.invalid\r\n\
         Connection: close\r\n\r\n",
    )
    .await;

    assert_eq!(status, 400);
    // nothing was published for an unparseable flow
    assert_eq!(fixture.store.list_ids(Kind::Requests).unwrap().len(), 0);
}

#[tokio::test]
async fn test_post_body_and_headers_survive_the_gap() {
    let fixture = start_proxy(Duration::from_secs(10)).await;
    spawn_stub_forwarder(fixture.store.clone(), |request| {
        assert_eq!(request.request.method, "POST");
        assert_eq!(request.request.body, b"name=widget");
        // the custom header crossed the gap in order
        assert!(request
            .request
            .headers
            .iter()
            .any(|(name, value)| name.eq_ignore_ascii_case("x-trace") && value == "t-1"));
        approved_reply(&request.metadata.request_id, 201, b"created")
    });

    let (status, _head, body) = proxy_exchange(
        fixture.addr,
        "POST http://example.invalid/items HTTP/1.1\r\n\
         Host: example.invalid\r\n\
         X-Trace: t-1\r\n\
         Content-Length: 11\r\n\
         Connection: close\r\n\r\nname=widget",
    )
    .await;

    assert_eq!(status, 201);
    assert_eq!(body, b"created");
}

#[tokio::test]
async fn test_connect_interception_end_to_end() {
    let fixture = start_proxy(Duration::from_secs(10)).await;
    spawn_stub_forwarder(fixture.store.clone(), |request| {
        // the tunneled origin-form request was rebuilt to an absolute URL
        assert_eq!(request.request.url, "https://secure.example/data");
        approved_reply(&request.metadata.request_id, 200, b"secret-pong")
    });

    // several rustls providers are compiled in; pin one for the test client
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    // a client that trusts only the proxy's CA
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut fixture.ca.cert_pem().as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));

    // CONNECT, then TLS-handshake against the minted leaf
    let mut stream = TcpStream::connect(fixture.addr).await.unwrap();
    stream
        .write_all(
            b"CONNECT secure.example:443 HTTP/1.1\r\n\
              Host: secure.example:443\r\n\r\n",
        )
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "proxy closed before answering CONNECT");
        head.extend_from_slice(&buf[..n]);
    }
    assert!(String::from_utf8_lossy(&head).starts_with("HTTP/1.1 200"));

    let server_name =
        rustls_pki_types::ServerName::try_from("secure.example".to_string()).unwrap();
    let mut tls = connector.connect(server_name, stream).await.unwrap();

    tls.write_all(
        b"GET /data HTTP/1.1\r\n\
          Host: secure.example\r\n\
          Connection: close\r\n\r\n",
    )
    .await
    .unwrap();

    let mut raw = Vec::new();
    // close without close_notify is fine, the bytes are already in
    let _ = tls.read_to_end(&mut raw).await;
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");
    assert!(text.ends_with("secret-pong"), "got: {text}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_flows_keep_their_correlation() {
    let fixture = start_proxy(Duration::from_secs(30)).await;

    // echo each request's X-Seq header into the response body
    spawn_stub_forwarder(fixture.store.clone(), |request| {
        let seq = request
            .request
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("x-seq"))
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        approved_reply(&request.metadata.request_id, 200, seq.as_bytes())
    });

    let mut clients = tokio::task::JoinSet::new();
    for seq in 0..100u32 {
        let addr = fixture.addr;
        clients.spawn(async move {
            let request = format!(
                "GET http://example.invalid/seq HTTP/1.1\r\n\
                 Host: example.invalid\r\n\
                 X-Seq: {seq}\r\n\
                 Connection: close\r\n\r\n"
            );
            let (status, _head, body) = proxy_exchange(addr, &request).await;
            (seq, status, body)
        });
    }

    while let Some(result) = clients.join_next().await {
        let (seq, status, body) = result.unwrap();
        assert_eq!(status, 200);
        assert_eq!(
            String::from_utf8_lossy(&body),
            seq.to_string(),
            "flow {seq} received someone else's response"
        );
    }

    // every id consumed exactly once
    let store = fixture.store.clone();
    settle("all responses consumed", || {
        store.list_ids(Kind::Responses).unwrap().is_empty()
    })
    .await;
    assert_eq!(fixture.store.list_ids(Kind::Processed).unwrap().len(), 100);
}
