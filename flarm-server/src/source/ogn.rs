//! OGN decoder text feed over TCP.
//!
//! The OGN receiver's decoder serves its packet log on a TCP port, one
//! newline-terminated line per packet, interleaved with banner and status lines.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use flarm_core::{normalize, ogn, StationReference};

use super::{OnReport, Source, SourceError, StreamEnd};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest line kept. The rest of a longer line is skipped up to the next newline.
pub const MAX_LINE_LEN: usize = 4096;

pub struct OgnSource {
    reader: Option<BufReader<TcpStream>>,
    addr: String,
    station: StationReference,
}

impl OgnSource {
    /// Connect to `host:port`.
    pub async fn connect(addr: &str, station: StationReference) -> Result<Self, SourceError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| SourceError::Open(format!("{addr}: connect timed out")))?
            .map_err(|e| SourceError::Open(format!("{addr}: {e}")))?;

        info!(addr, "connected to OGN feed");
        Ok(OgnSource {
            reader: Some(BufReader::with_capacity(8192, stream)),
            addr: addr.to_string(),
            station,
        })
    }
}

#[async_trait]
impl Source for OgnSource {
    async fn for_each(
        &mut self,
        cancel: &CancellationToken,
        on_report: OnReport<'_>,
    ) -> Result<StreamEnd, SourceError> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(SourceError::Terminal(format!("{}: closed", self.addr)));
        };
        let mut buf = Vec::with_capacity(256);
        let mut oversized = false;

        loop {
            buf.clear();
            let mut limited = (&mut *reader).take(MAX_LINE_LEN as u64);
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                read = limited.read_until(b'\n', &mut buf) => read,
            };

            match read {
                Ok(0) => return Ok(StreamEnd::Eof),
                Ok(_) => {
                    let terminated = buf.last() == Some(&b'\n');
                    if oversized {
                        oversized = !terminated;
                        continue;
                    }
                    if !terminated && buf.len() == MAX_LINE_LEN {
                        debug!(addr = %self.addr, limit = MAX_LINE_LEN, "discarding oversized line");
                        oversized = true;
                        continue;
                    }
                    let line = String::from_utf8_lossy(&buf);
                    let Some(record) = ogn::decode(&line) else {
                        continue;
                    };
                    match normalize::from_ogn(&self.station, &record, self.station.now()) {
                        Some(report) => on_report(report),
                        None => trace!(address = %record.address, "dropped OGN record"),
                    }
                }
                Err(e) => return Err(SourceError::Terminal(format!("{}: {e}", self.addr))),
            }
        }
    }

    async fn close(&mut self) {
        self.reader = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const FEED: &str = "
Connection closed by foreign host.
@@@ Child \"./ogn-decode\" started at: Thu Apr 22 13:40:56 2021
@@@ 0 user(s) and 0 logger(s) connected (plus you)
0.802sec:916.200MHz:   1:2:DDFD1D 104436: [ +32.59657, +35.23525]deg    77m  +0.1m/s   0.4m/s 123.1deg  -1.2deg/s 1m1 07x05m Fn:35___ +0.41kHz 45.0/55.5dB/0  0e     0.0km 161.7deg +12.9deg
0.802sec:916.200MHz: 2:2:123456 104436: [+32.5, +35.1]deg 10m -3.1m/s 0.4m/s 123.1deg -1.2deg/s
";

    async fn serve_once(payload: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(payload.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_reads_feed_until_eof() {
        let addr = serve_once(FEED).await;
        let mut station = StationReference::default();
        station.id_map.insert("123456".into(), "4X-APL".into());

        let mut source = OgnSource::connect(&addr, station).await.unwrap();
        let cancel = CancellationToken::new();
        let mut got = Vec::new();
        let end = source.for_each(&cancel, &mut |r| got.push(r)).await.unwrap();

        assert_eq!(end, StreamEnd::Eof);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].id, "DDFD1D");
        assert_eq!(got[0].lat, 32.59657);
        assert_eq!(got[0].long, 35.23525);
        assert_eq!(got[0].altitude, 77.0);
        assert_eq!(got[0].heading, 123);
        assert_eq!(got[1].id, "4X-APL");
        assert_eq!(got[1].climb_rate, -3.1);
    }

    #[tokio::test]
    async fn test_oversized_line_skipped() {
        let junk: String = "x".repeat(3 * MAX_LINE_LEN);
        let payload = format!(
            "{junk}\n0.802sec:916.200MHz: 2:2:123456 104436: [+32.5, +35.1]deg 10m -3.1m/s 0.4m/s 123.1deg -1.2deg/s\n{junk}"
        );
        let addr = serve_once(Box::leak(payload.into_boxed_str())).await;

        let mut source = OgnSource::connect(&addr, StationReference::default()).await.unwrap();
        let cancel = CancellationToken::new();
        let mut got = Vec::new();
        let end = source.for_each(&cancel, &mut |r| got.push(r)).await.unwrap();

        assert_eq!(end, StreamEnd::Eof);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "123456");
    }

    #[tokio::test]
    async fn test_cancel_while_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            // Hold the connection open without sending.
            let (conn, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(conn);
        });

        let mut source = OgnSource::connect(&addr, StationReference::default())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let end = source.for_each(&cancel, &mut |_| {}).await.unwrap();
        assert_eq!(end, StreamEnd::Cancelled);
        source.close().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = OgnSource::connect(&addr, StationReference::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::Open(_)));
    }

    #[tokio::test]
    async fn test_closed_source_is_terminal() {
        let addr = serve_once("").await;
        let mut source = OgnSource::connect(&addr, StationReference::default())
            .await
            .unwrap();
        source.close().await;
        let err = source.for_each(&CancellationToken::new(), &mut |_| {}).await;
        assert!(matches!(err, Err(SourceError::Terminal(_))));
    }
}
