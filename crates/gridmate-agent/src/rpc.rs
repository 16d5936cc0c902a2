#[cfg(test)]
mod tests;

use crate::auth::AuthSession;
use crate::handler::process_frame;
use crate::http;
use crate::state::SharedState;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use gridmate::client::frame_codec;
use gridmate_control::now_secs;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Accept management RPC connections until the listener dies.
///
/// Each connection speaks either the raw sentinel-framed protocol or the
/// HTTP-compatible variant; the first bytes decide which.
pub async fn serve(
    state: SharedState,
    listener: TcpListener,
    password: Option<String>,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "management RPC listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        let password = password.clone();
        tokio::spawn(async move {
            let local = peer.ip().is_loopback();
            if let Err(e) = handle_client(state, stream, local, password).await {
                tracing::debug!(err = %e, "rpc client disconnected");
            }
        });
    }
}

async fn handle_client(
    state: SharedState,
    stream: TcpStream,
    local: bool,
    password: Option<String>,
) -> Result<()> {
    let mut session = AuthSession::new(local, password);
    tracing::debug!(local = session.is_local(), "rpc connection opened");

    let mut probe = [0u8; 8];
    let n = stream.peek(&mut probe).await?;
    if n == 0 {
        return Ok(());
    }
    let head = &probe[..n];
    let is_http = head.starts_with(b"GET ")
        || head.starts_with(b"POST")
        || head.starts_with(b"OPTI")
        || head.starts_with(b"HEAD");
    if is_http {
        return http::handle_http_client(state, &mut session, stream).await;
    }

    let (r, w) = stream.into_split();
    let mut reader = FramedRead::new(r, frame_codec());
    let mut writer = FramedWrite::new(w, frame_codec());

    while let Some(frame) = reader.next().await {
        let frame = frame?;
        let (resp, close) = process_frame(&state, &mut session, &frame, now_secs()).await;
        writer.send(serde_json::to_string(&resp)?).await?;
        if close {
            tracing::debug!("closing connection after repeated unauthorized requests");
            break;
        }
    }
    Ok(())
}
