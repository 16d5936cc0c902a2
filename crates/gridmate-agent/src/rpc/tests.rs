use super::handle_client;
use crate::config::AgentConfig;
use crate::state::{AgentState, SharedState};
use gridmate::client::AgentClient;
use gridmate::protocol::{AgentVersion, ErrorCode, Request, Response, auth2_hash};
use gridmate_control::transport::MockTransport;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

const PASSWORD: &str = "testpw";

async fn spawn_agent() -> (SharedState, SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let agent = AgentState::load_with_transport(
        dir.path(),
        &AgentConfig::default(),
        Arc::new(MockTransport::new()),
    )
    .unwrap();
    let state: SharedState = Arc::new(Mutex::new(agent));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // Treat every connection as remote so the auth path is exercised.
    let server_state = state.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let state = server_state.clone();
            tokio::spawn(async move {
                let _ = handle_client(state, stream, false, Some(PASSWORD.to_string())).await;
            });
        }
    });
    (state, addr, dir)
}

async fn connect(addr: SocketAddr) -> AgentClient {
    AgentClient::connect(&addr.ip().to_string(), addr.port())
        .await
        .unwrap()
}

#[tokio::test]
async fn exchange_versions_needs_no_auth() {
    let (_state, addr, _dir) = spawn_agent().await;
    let mut client = connect(addr).await;
    let resp = client
        .request(Request::ExchangeVersions {
            major: 1,
            minor: 0,
            release: 0,
        })
        .await
        .unwrap();
    let Response::Ok { data } = resp else {
        panic!("expected ok, got {resp:?}");
    };
    let version: AgentVersion = serde_json::from_value(data.unwrap()).unwrap();
    assert_eq!(version.major, 1);
}

#[tokio::test]
async fn protected_op_without_auth_is_unauthorized_then_closed() {
    let (_state, addr, _dir) = spawn_agent().await;
    let mut client = connect(addr).await;

    let resp = client.request(Request::GetProjects).await.unwrap();
    assert!(matches!(resp, Response::Unauthorized));

    // Second consecutive unauthorized request: answered, then closed.
    let resp = client.request(Request::GetProjects).await.unwrap();
    assert!(matches!(resp, Response::Unauthorized));

    assert!(client.request(Request::GetProjects).await.is_err());
}

#[tokio::test]
async fn one_bad_digest_is_forgiven() {
    let (_state, addr, _dir) = spawn_agent().await;
    let mut client = connect(addr).await;

    let Response::Nonce { .. } = client.request(Request::Auth1).await.unwrap() else {
        panic!("expected nonce");
    };
    let resp = client
        .request(Request::Auth2 {
            nonce_hash: "wrong".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(resp, Response::Unauthorized));

    // The connection is still open; a correct handshake succeeds.
    let Response::Nonce { nonce } = client.request(Request::Auth1).await.unwrap() else {
        panic!("expected nonce");
    };
    let resp = client
        .request(Request::Auth2 {
            nonce_hash: auth2_hash(&nonce, PASSWORD),
        })
        .await
        .unwrap();
    assert!(matches!(resp, Response::Ok { .. }));

    let resp = client.request(Request::GetProjects).await.unwrap();
    assert!(matches!(resp, Response::Ok { .. }));
}

#[tokio::test]
async fn two_bad_digests_in_a_row_close_the_connection() {
    let (_state, addr, _dir) = spawn_agent().await;
    let mut client = connect(addr).await;

    for _ in 0..2 {
        client.request(Request::Auth1).await.unwrap();
        let resp = client
            .request(Request::Auth2 {
                nonce_hash: "wrong".to_string(),
            })
            .await;
        match resp {
            Ok(resp) => assert!(matches!(resp, Response::Unauthorized)),
            // The server may already have hung up on the second strike.
            Err(_) => return,
        }
    }
    assert!(client.request(Request::Auth1).await.is_err());
}

#[tokio::test]
async fn authorize_helper_runs_the_handshake() {
    let (state, addr, _dir) = spawn_agent().await;
    {
        let mut st = state.lock().await;
        st.ctx
            .notices
            .post("hello", "from the agent", Default::default(), 1_700_000_000)
            .unwrap();
    }
    let mut client = connect(addr).await;
    client.authorize(PASSWORD).await.unwrap();
    let data = client
        .request_data(Request::GetNotices { seqno: 0 })
        .await
        .unwrap()
        .unwrap();
    let notices: Vec<gridmate::protocol::NoticeView> = serde_json::from_value(data).unwrap();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].title, "hello");
}

#[tokio::test]
async fn unknown_op_reports_unrecognized_without_closing() {
    let (_state, addr, _dir) = spawn_agent().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"{\"op\":\"reboot_host\"}\x03")
        .await
        .unwrap();

    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        if byte[0] == 0x03 {
            break;
        }
        buf.push(byte[0]);
    }
    let resp: Response = serde_json::from_slice(&buf).unwrap();
    let Response::Error { code, message } = resp else {
        panic!("expected error, got {resp:?}");
    };
    assert_eq!(code, ErrorCode::UnrecognizedOp);
    assert_eq!(message, "unrecognized op");

    // Still serviceable afterwards.
    stream
        .write_all(b"{\"op\":\"exchange_versions\",\"major\":1,\"minor\":0,\"release\":0}\x03")
        .await
        .unwrap();
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte).await.unwrap();
}

#[tokio::test]
async fn project_op_on_unknown_project_is_not_found() {
    let (_state, addr, _dir) = spawn_agent().await;
    let mut client = connect(addr).await;
    client.authorize(PASSWORD).await.unwrap();
    let resp = client
        .request(Request::ProjectOp {
            url: "https://missing.example.com/".to_string(),
            command: gridmate::protocol::ProjectCommand::Suspend,
        })
        .await
        .unwrap();
    let Response::Error { code, .. } = resp else {
        panic!("expected error, got {resp:?}");
    };
    assert_eq!(code, ErrorCode::NotFound);
}

#[tokio::test]
async fn quit_sets_the_shutdown_flag() {
    let (state, addr, _dir) = spawn_agent().await;
    let mut client = connect(addr).await;
    client.authorize(PASSWORD).await.unwrap();
    client.request_data(Request::Quit).await.unwrap();
    assert!(state.lock().await.quit_requested);
}

#[tokio::test]
async fn network_rpc_opens_the_grace_window() {
    let (state, addr, _dir) = spawn_agent().await;
    let mut client = connect(addr).await;
    client.authorize(PASSWORD).await.unwrap();
    client.request_data(Request::NetworkAvailable).await.unwrap();
    let st = state.lock().await;
    assert!(st.last_network_rpc_time > 0);
    assert!(st.network_needed(st.last_network_rpc_time + 299));
    assert!(!st.network_needed(st.last_network_rpc_time + 300));
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

async fn http_exchange(addr: SocketAddr, raw: &[u8]) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response).to_string();
    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn http_post_carries_a_request() {
    let (_state, addr, _dir) = spawn_agent().await;
    let body = r#"{"op":"exchange_versions","major":1,"minor":0,"release":0}"#;
    let raw = format!(
        "POST / HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let (status, reply) = http_exchange(addr, raw.as_bytes()).await;
    assert_eq!(status, 200);
    let resp: Response = serde_json::from_str(&reply).unwrap();
    assert!(matches!(resp, Response::Ok { .. }));
}

#[tokio::test]
async fn http_get_is_limited_to_the_allowlist() {
    let (_state, addr, _dir) = spawn_agent().await;

    let (status, reply) =
        http_exchange(addr, b"GET /get_public_notices?seqno=0 HTTP/1.1\r\n\r\n").await;
    assert_eq!(status, 200);
    let resp: Response = serde_json::from_str(&reply).unwrap();
    assert!(matches!(resp, Response::Ok { .. }));

    let (status, _) = http_exchange(addr, b"GET /set_run_mode HTTP/1.1\r\n\r\n").await;
    assert_eq!(status, 403);
}

#[tokio::test]
async fn http_malformed_request_line_is_400() {
    let (_state, addr, _dir) = spawn_agent().await;
    let (status, _) = http_exchange(addr, b"GET /x yadda\r\n\r\n").await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn http_preflight_gets_cors_headers() {
    let (_state, addr, _dir) = spawn_agent().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"OPTIONS / HTTP/1.1\r\nOrigin: https://console.example.com\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 204"));
    assert!(text.contains("Access-Control-Allow-Origin: *"));
}

#[tokio::test]
async fn http_header_auth_grants_protected_ops() {
    let (_state, addr, _dir) = spawn_agent().await;

    // Without credentials the protected op is refused.
    let (status, reply) = http_exchange(addr, b"GET /get_notices HTTP/1.1\r\n\r\n").await;
    assert_eq!(status, 200);
    let resp: Response = serde_json::from_str(&reply).unwrap();
    assert!(matches!(resp, Response::Unauthorized));

    let hash = gridmate::protocol::http_auth_hash("console-1", 7, PASSWORD);
    let raw = format!(
        "GET /get_notices HTTP/1.1\r\nAuth-ID: console-1\r\nAuth-Seqno: 7\r\nAuth-Hash: {hash}\r\n\r\n"
    );
    let (status, reply) = http_exchange(addr, raw.as_bytes()).await;
    assert_eq!(status, 200);
    let resp: Response = serde_json::from_str(&reply).unwrap();
    assert!(matches!(resp, Response::Ok { .. }));

    // Replaying the same seqno is rejected.
    let (status, reply) = http_exchange(addr, raw.as_bytes()).await;
    assert_eq!(status, 200);
    let resp: Response = serde_json::from_str(&reply).unwrap();
    assert!(matches!(resp, Response::Unauthorized));
}
