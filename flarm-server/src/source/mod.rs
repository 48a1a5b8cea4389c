//! Acquisition sources.
//!
//! Every transport is driven through one contract: [`open`] a [`Source`] from
//! a [`SourceLocator`], then call [`Source::for_each`] which blocks the caller
//! until the transport ends, fails, or the cancellation token fires.
//!
//! - [`serial::SerialSource`]: FLARM device on a serial port (protocol A)
//! - [`ogn::OgnSource`]: OGN decoder text feed over TCP (protocol B)
//! - [`relay::RelaySource`]: another flarm instance's WebSocket feed

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use flarm_core::{CanonicalReport, SourceLocator, StationReference};

pub mod ogn;
pub mod relay;
pub mod serial;

/// Transport-level failures. Both lead to a reconnect, never to process exit.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("open failed: {0}")]
    Open(String),
    #[error("transport failed: {0}")]
    Terminal(String),
}

/// How a `for_each` drive loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The transport closed (end of stream).
    Eof,
    /// The cancellation token fired.
    Cancelled,
}

/// Callback receiving each report, in decode order.
pub type OnReport<'a> = &'a mut (dyn FnMut(CanonicalReport) + Send);

#[async_trait]
pub trait Source: Send {
    /// Drive the transport, handing every report to `on_report`.
    async fn for_each(
        &mut self,
        cancel: &CancellationToken,
        on_report: OnReport<'_>,
    ) -> Result<StreamEnd, SourceError>;

    /// Release the transport. Safe to call more than once.
    async fn close(&mut self);
}

/// Open the source named by `locator`.
pub async fn open(
    locator: &SourceLocator,
    station: &StationReference,
) -> Result<Box<dyn Source>, SourceError> {
    let source: Box<dyn Source> = match locator {
        SourceLocator::Serial { path, baud_rate } => {
            Box::new(serial::SerialSource::open(path, *baud_rate, station.clone())?)
        }
        SourceLocator::NetworkText { addr } => {
            Box::new(ogn::OgnSource::connect(addr, station.clone()).await?)
        }
        SourceLocator::Relay { url } => Box::new(relay::RelaySource::connect(url).await?),
    };
    Ok(source)
}
