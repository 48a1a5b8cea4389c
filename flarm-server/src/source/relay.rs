//! Relay from another flarm instance.
//!
//! Connects to a peer's `/ws` endpoint and receives reports that are already in
//! canonical form: one JSON object per message, no decoding or projection.
//! A relay link is expected to stay up, so a close from the peer or a message
//! that is not a valid report ends the stream with an error.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use flarm_core::CanonicalReport;

use super::{OnReport, Source, SourceError, StreamEnd};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct RelaySource {
    ws: Option<WsStream>,
    url: String,
}

impl RelaySource {
    /// Dial a `ws://` or `wss://` URL.
    pub async fn connect(url: &str) -> Result<Self, SourceError> {
        let (ws, _response) = timeout(HANDSHAKE_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| SourceError::Open(format!("{url}: handshake timed out")))?
            .map_err(|e| SourceError::Open(format!("{url}: {e}")))?;

        info!(url, "connected to relay");
        Ok(RelaySource {
            ws: Some(ws),
            url: url.to_string(),
        })
    }
}

fn parse_report(payload: &[u8]) -> Result<CanonicalReport, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[async_trait]
impl Source for RelaySource {
    async fn for_each(
        &mut self,
        cancel: &CancellationToken,
        on_report: OnReport<'_>,
    ) -> Result<StreamEnd, SourceError> {
        let url = self.url.as_str();
        let Some(ws) = self.ws.as_mut() else {
            return Err(SourceError::Terminal(format!("{url}: closed")));
        };

        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                msg = ws.next() => msg,
            };

            let payload = match msg {
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Close(frame))) => {
                    return Err(SourceError::Terminal(format!("{url}: closed by peer ({frame:?})")));
                }
                Some(Ok(_)) => continue, // ping/pong
                Some(Err(e)) => return Err(SourceError::Terminal(format!("{url}: {e}"))),
                None => return Err(SourceError::Terminal(format!("{url}: connection closed"))),
            };

            let report = parse_report(&payload)
                .map_err(|e| SourceError::Terminal(format!("{url}: malformed report: {e}")))?;
            if report.id.is_empty() {
                debug!("ignoring relayed report with empty id");
                continue;
            }
            on_report(report);
        }
    }

    async fn close(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
        }
    }
}
