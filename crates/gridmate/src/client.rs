use crate::protocol::{
    auth2_hash, FRAME_SENTINEL, MAX_FRAME_BYTES, Request, Response,
};
use anyhow::{Context, Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{AnyDelimiterCodec, FramedRead, FramedWrite};

/// Codec for the raw transport: one JSON document per sentinel-terminated
/// frame.
pub fn frame_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(
        vec![FRAME_SENTINEL],
        vec![FRAME_SENTINEL],
        MAX_FRAME_BYTES,
    )
}

/// Client for the agent's management RPC socket.
pub struct AgentClient {
    reader: FramedRead<OwnedReadHalf, AnyDelimiterCodec>,
    writer: FramedWrite<OwnedWriteHalf, AnyDelimiterCodec>,
}

impl AgentClient {
    /// Connect to the agent at `host:port`.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("failed to connect to {host}:{port}"))?;
        let (r, w) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(r, frame_codec()),
            writer: FramedWrite::new(w, frame_codec()),
        })
    }

    /// Send one request and read its reply.
    pub async fn request(&mut self, req: Request) -> Result<Response> {
        let line = serde_json::to_string(&req)?;
        self.writer.send(line).await?;
        let Some(frame) = self.reader.next().await else {
            bail!("agent closed the connection");
        };
        let frame = frame.context("framing error")?;
        serde_json::from_slice(&frame).context("invalid reply from agent")
    }

    /// Run the nonce handshake. Must be done before any operation that
    /// requires authentication when connecting with a password set.
    pub async fn authorize(&mut self, password: &str) -> Result<()> {
        let nonce = match self.request(Request::Auth1).await? {
            Response::Nonce { nonce } => nonce,
            other => bail!("expected nonce, got {other:?}"),
        };
        match self
            .request(Request::Auth2 {
                nonce_hash: auth2_hash(&nonce, password),
            })
            .await?
        {
            Response::Ok { .. } => Ok(()),
            Response::Unauthorized => bail!("authentication failed: wrong password"),
            other => bail!("unexpected auth reply: {other:?}"),
        }
    }

    /// Send a request and unwrap the `Ok` payload, turning every other
    /// reply into an error.
    pub async fn request_data(&mut self, req: Request) -> Result<Option<serde_json::Value>> {
        match self.request(req).await? {
            Response::Ok { data } => Ok(data),
            Response::Error { code, message } => Err(anyhow!("{message} ({code:?})")),
            Response::Unauthorized => Err(anyhow!("not authorized; run the auth handshake")),
            Response::Nonce { .. } => Err(anyhow!("unexpected nonce reply")),
        }
    }
}
