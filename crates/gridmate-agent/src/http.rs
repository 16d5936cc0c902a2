//! HTTP-compatible transport of the management RPC protocol, served on
//! the same port as the raw framed protocol.
//!
//! `POST /` carries one JSON request per exchange; a small set of
//! read-only operations is reachable via `GET`. Every reply carries CORS
//! headers so browser-hosted consoles can talk to a local agent. Besides
//! the nonce handshake, HTTP callers may authenticate per request with
//! `Auth-ID` / `Auth-Seqno` / `Auth-Hash` headers (monotone seqno per
//! ID, MD5 digest).

use crate::auth::AuthSession;
use crate::handler::{handle_request, policy_of, process_frame};
use crate::state::SharedState;
use anyhow::Result;
use gridmate::protocol::{MAX_FRAME_BYTES, Request, Response};
use gridmate_control::now_secs;
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Serve one HTTP exchange and close.
pub async fn handle_http_client(
    state: SharedState,
    session: &mut AuthSession,
    mut stream: TcpStream,
) -> Result<()> {
    // Read up to the end of the header block.
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let head_end = loop {
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > MAX_FRAME_BYTES {
            return write_plain(&mut stream, 400, "request too large").await;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v)) if v.starts_with("HTTP/") => (m.to_string(), p.to_string()),
        _ => return write_plain(&mut stream, 400, "malformed request line").await,
    };

    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    match method.as_str() {
        // CORS preflight.
        "OPTIONS" => write_response(&mut stream, 204, None).await,

        "POST" => {
            let content_length: usize = headers
                .get("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            if content_length > MAX_FRAME_BYTES {
                return write_plain(&mut stream, 400, "request too large").await;
            }
            let mut body = buf[head_end + 4..].to_vec();
            while body.len() < content_length {
                let mut chunk = [0u8; 1024];
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return write_plain(&mut stream, 400, "truncated body").await;
                }
                body.extend_from_slice(&chunk[..n]);
            }

            apply_header_auth(&state, session, &headers).await;
            let (resp, _close) = process_frame(&state, session, &body, now_secs()).await;
            write_json(&mut stream, 200, &resp).await
        }

        "GET" => {
            let Some(req) = request_for_get_path(&path) else {
                return write_plain(&mut stream, 403, "GET not allowed for this operation").await;
            };
            // GET never reaches a mutating handler, even by a crafted path.
            if policy_of(&req).mutating {
                return write_plain(&mut stream, 403, "GET not allowed for this operation").await;
            }
            apply_header_auth(&state, session, &headers).await;
            let (resp, _close) = handle_request(&state, session, req, now_secs()).await;
            write_json(&mut stream, 200, &resp).await
        }

        _ => write_plain(&mut stream, 400, "unsupported method").await,
    }
}

/// Grant per-request authentication from the header scheme, if present
/// and valid.
async fn apply_header_auth(
    state: &SharedState,
    session: &mut AuthSession,
    headers: &HashMap<String, String>,
) {
    let (Some(id), Some(seqno), Some(hash)) = (
        headers.get("auth-id"),
        headers.get("auth-seqno"),
        headers.get("auth-hash"),
    ) else {
        return;
    };
    let Ok(seqno) = seqno.parse::<u64>() else {
        return;
    };
    let mut st = state.lock().await;
    let last = st.http_auth_seqnos.get(id).copied();
    if session.verify_header_auth(id, seqno, hash, last) {
        st.http_auth_seqnos.insert(id.clone(), seqno);
        drop(st);
        session.grant();
        tracing::debug!(auth_id = %id, "header auth accepted");
    } else {
        tracing::debug!(auth_id = %id, "header auth rejected");
    }
}

/// Operations reachable by GET. Everything else is 403.
fn request_for_get_path(path: &str) -> Option<Request> {
    let path = path.trim_start_matches('/');
    let (name, query) = match path.split_once('?') {
        Some((name, query)) => (name, Some(query)),
        None => (path, None),
    };
    let seqno = query
        .and_then(|q| {
            q.split('&')
                .find_map(|kv| kv.strip_prefix("seqno="))
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(0);
    match name {
        "get_public_notices" => Some(Request::GetPublicNotices { seqno }),
        "get_notices" => Some(Request::GetNotices { seqno }),
        "get_projects" => Some(Request::GetProjects),
        "get_newer_version" => Some(Request::GetNewerVersion),
        "exchange_versions" => Some(Request::ExchangeVersions {
            major: 0,
            minor: 0,
            release: 0,
        }),
        _ => None,
    }
}

async fn write_json(stream: &mut TcpStream, status: u16, resp: &Response) -> Result<()> {
    let body = serde_json::to_vec(resp)?;
    write_response(stream, status, Some(("application/json", &body))).await
}

async fn write_plain(stream: &mut TcpStream, status: u16, message: &str) -> Result<()> {
    write_response(stream, status, Some(("text/plain", message.as_bytes()))).await
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    body: Option<(&str, &[u8])>,
) -> Result<()> {
    let reason = match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        403 => "Forbidden",
        _ => "Error",
    };
    let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
    head.push_str("Access-Control-Allow-Origin: *\r\n");
    head.push_str("Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n");
    head.push_str("Access-Control-Allow-Headers: Content-Type, Auth-ID, Auth-Seqno, Auth-Hash\r\n");
    head.push_str("Connection: close\r\n");
    match body {
        Some((content_type, bytes)) => {
            head.push_str(&format!("Content-Type: {content_type}\r\n"));
            head.push_str(&format!("Content-Length: {}\r\n\r\n", bytes.len()));
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(bytes).await?;
        }
        None => {
            head.push_str("Content-Length: 0\r\n\r\n");
            stream.write_all(head.as_bytes()).await?;
        }
    }
    stream.flush().await?;
    Ok(())
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
