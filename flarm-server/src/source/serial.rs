//! FLARM device on a serial port.
//!
//! All FLARM data ports use 8 data bits, 1 stop bit and no parity; the baud rate
//! is fixed per open. Sentences are delimited by CR. Reads happen on a blocking
//! thread which polls a keep-alive flag between read timeouts and hands frames
//! to the async side over a channel.

use std::io::{self, BufRead, BufReader, Read};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serialport::{DataBits, FlowControl, Parity, StopBits};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use flarm_core::{normalize, sentence, StationReference};

use super::{OnReport, Source, SourceError, StreamEnd};

/// How long a blocked read waits before re-checking the keep-alive flag.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

const FRAME_QUEUE: usize = 256;

type Frame = io::Result<String>;

pub struct SerialSource {
    frames: mpsc::Receiver<Frame>,
    keep_alive: Arc<AtomicBool>,
    station: StationReference,
}

impl SerialSource {
    /// Open `path` at `baud_rate`, 8N1, no flow control.
    pub fn open(path: &str, baud_rate: u32, station: StationReference) -> Result<Self, SourceError> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| SourceError::Open(format!("{path}: {e}")))?;

        info!(path, baud_rate, "opened serial port");
        Ok(Self::from_reader(port, station))
    }

    /// Drive any byte stream as if it were the serial port.
    pub fn from_reader<R: Read + Send + 'static>(reader: R, station: StationReference) -> Self {
        let (tx, frames) = mpsc::channel(FRAME_QUEUE);
        let keep_alive = Arc::new(AtomicBool::new(true));

        let flag = Arc::clone(&keep_alive);
        tokio::task::spawn_blocking(move || {
            let result = read_frames(reader, &flag, |frame| tx.blocking_send(Ok(frame)).is_ok());
            if let Err(e) = result {
                let _ = tx.blocking_send(Err(e));
            }
        });

        SerialSource {
            frames,
            keep_alive,
            station,
        }
    }
}

impl Drop for SerialSource {
    fn drop(&mut self) {
        self.keep_alive.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl Source for SerialSource {
    async fn for_each(
        &mut self,
        cancel: &CancellationToken,
        on_report: OnReport<'_>,
    ) -> Result<StreamEnd, SourceError> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                frame = self.frames.recv() => frame,
            };

            match frame {
                Some(Ok(line)) => {
                    let Some(decoded) = sentence::decode(&line) else {
                        trace!(%line, "unrecognized frame");
                        continue;
                    };
                    if let Some(report) =
                        normalize::from_sentence(&self.station, &decoded, self.station.now())
                    {
                        on_report(report);
                    }
                }
                Some(Err(e)) => return Err(SourceError::Terminal(e.to_string())),
                None => return Ok(StreamEnd::Eof),
            }
        }
    }

    async fn close(&mut self) {
        self.keep_alive.store(false, Ordering::Relaxed);
        self.frames.close();
    }
}

/// Longest frame kept. Longer runs without a CR (wrong baud rate, line noise)
/// are discarded up to the next CR.
pub const MAX_FRAME_LEN: usize = 4096;

/// Split a byte stream on CR and pass each frame to `emit` until end of stream,
/// a read error, `keep_alive` going false, or `emit` returning false.
///
/// A trailing unterminated fragment at end of stream is emitted as a frame.
/// Read timeouts are not errors: the partial frame is kept and reading resumes.
pub fn read_frames<R: Read>(
    reader: R,
    keep_alive: &AtomicBool,
    mut emit: impl FnMut(String) -> bool,
) -> io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(128);
    let mut oversized = false;

    while keep_alive.load(Ordering::Relaxed) {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => return Err(e),
        };

        if available.is_empty() {
            if !buf.is_empty() && !oversized {
                emit(String::from_utf8_lossy(&buf).into_owned());
            }
            debug!("serial stream ended");
            return Ok(());
        }

        let (chunk, terminated) = match available.iter().position(|&b| b == b'\r') {
            Some(i) => (&available[..i], true),
            None => (available, false),
        };
        let used = chunk.len() + usize::from(terminated);

        if !oversized {
            if buf.len() + chunk.len() > MAX_FRAME_LEN {
                debug!(limit = MAX_FRAME_LEN, "discarding oversized frame");
                buf.clear();
                oversized = true;
            } else {
                buf.extend_from_slice(chunk);
            }
        }
        reader.consume(used);

        if terminated {
            if mem::take(&mut oversized) {
                continue;
            }
            let frame = String::from_utf8_lossy(&mem::take(&mut buf)).into_owned();
            if !emit(frame) {
                return Ok(());
            }
        }
    }
    Ok(())
}
