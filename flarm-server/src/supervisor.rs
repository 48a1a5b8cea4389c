//! Source supervision: open, drain, reconnect.
//!
//! One supervisor drives one source at a time through
//! `Idle -> Connecting -> Streaming -> Reconnecting -> Connecting ...` until the
//! cancellation token fires, which moves it to `Stopped`. Open failures, stream
//! errors and end of stream are all logged and followed by a reconnect after
//! the configured delay. The delay is cancellable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flarm_core::config::DEFAULT_RECONNECT_DELAY;
use flarm_core::{CanonicalReport, SourceLocator, StationReference};

use crate::source::{self, Source, SourceError, StreamEnd};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

/// Push interface for consumers of reports.
pub trait ReportSink: Send + Sync {
    fn on_report(&self, report: &CanonicalReport);
}

/// Produces a fresh source for each connection attempt.
#[async_trait]
pub trait SourceOpener: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Source>, SourceError>;
}

/// Opens the configured transport for one service generation.
pub struct LocatorOpener {
    locator: SourceLocator,
    station: StationReference,
}

impl LocatorOpener {
    pub fn new(locator: SourceLocator, station: StationReference) -> Self {
        LocatorOpener { locator, station }
    }
}

#[async_trait]
impl SourceOpener for LocatorOpener {
    async fn open(&self) -> Result<Box<dyn Source>, SourceError> {
        source::open(&self.locator, &self.station).await
    }
}

pub struct Supervisor {
    opener: Box<dyn SourceOpener>,
    sinks: Vec<Arc<dyn ReportSink>>,
    reconnect_delay: Duration,
    state: Arc<watch::Sender<SupervisorState>>,
}

impl Supervisor {
    /// A zero `reconnect_delay` means the default of 3 seconds.
    pub fn new(
        opener: Box<dyn SourceOpener>,
        sinks: Vec<Arc<dyn ReportSink>>,
        reconnect_delay: Duration,
        state: Arc<watch::Sender<SupervisorState>>,
    ) -> Self {
        let reconnect_delay = if reconnect_delay.is_zero() {
            DEFAULT_RECONNECT_DELAY
        } else {
            reconnect_delay
        };
        state.send_replace(SupervisorState::Idle);
        Supervisor {
            opener,
            sinks,
            reconnect_delay,
            state,
        }
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }

    /// Run until `cancel` fires. Never returns early on transport failure.
    pub async fn run(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            self.set_state(SupervisorState::Connecting);
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                opened = self.opener.open() => opened,
            };

            match opened {
                Ok(mut source) => {
                    self.set_state(SupervisorState::Streaming);
                    info!("reading reports");
                    let result = self.drain(source.as_mut(), &cancel).await;
                    source.close().await;
                    match result {
                        Ok(StreamEnd::Cancelled) => break,
                        Ok(StreamEnd::Eof) => warn!("source ended"),
                        Err(e) => warn!(error = %e, "source failed"),
                    }
                }
                Err(e) => warn!(error = %e, "failed to open source"),
            }

            if cancel.is_cancelled() {
                break;
            }
            self.set_state(SupervisorState::Reconnecting);
            info!(delay_sec = self.reconnect_delay.as_secs_f64(), "will reconnect");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        self.set_state(SupervisorState::Stopped);
        info!("supervisor stopped");
    }

    async fn drain(
        &self,
        source: &mut dyn Source,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, SourceError> {
        let sinks = &self.sinks;
        let mut forward = |report: CanonicalReport| {
            for sink in sinks {
                sink.on_report(&report);
            }
        };
        source.for_each(cancel, &mut forward).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use chrono::DateTime;
    use flarm_core::AircraftKind;

    fn report(id: &str) -> CanonicalReport {
        CanonicalReport {
            id: id.into(),
            lat: 0.0,
            long: 0.0,
            altitude: 0.0,
            heading: 0,
            ground_speed: 0.0,
            climb_rate: 0.0,
            turn_rate: 0.0,
            aircraft_kind: AircraftKind::Unknown,
            alarm_level: 0,
            timestamp: DateTime::parse_from_rfc3339("2021-04-22T13:40:56Z").unwrap(),
        }
    }

    enum Ending {
        Eof,
        Fail,
        WaitForCancel,
    }

    struct FakeSource {
        reports: Vec<CanonicalReport>,
        ending: Ending,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Source for FakeSource {
        async fn for_each(
            &mut self,
            cancel: &CancellationToken,
            on_report: source::OnReport<'_>,
        ) -> Result<StreamEnd, SourceError> {
            for r in self.reports.drain(..) {
                on_report(r);
            }
            match self.ending {
                Ending::Eof => Ok(StreamEnd::Eof),
                Ending::Fail => Err(SourceError::Terminal("reset".into())),
                Ending::WaitForCancel => {
                    cancel.cancelled().await;
                    Ok(StreamEnd::Cancelled)
                }
            }
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// First attempt yields a source built by `first`, later attempts fail.
    struct FakeOpener {
        attempts: Arc<AtomicUsize>,
        first: Mutex<Option<FakeSource>>,
    }

    impl FakeOpener {
        fn failing(attempts: Arc<AtomicUsize>) -> Self {
            FakeOpener {
                attempts,
                first: Mutex::new(None),
            }
        }

        fn with_source(attempts: Arc<AtomicUsize>, source: FakeSource) -> Self {
            FakeOpener {
                attempts,
                first: Mutex::new(Some(source)),
            }
        }
    }

    #[async_trait]
    impl SourceOpener for FakeOpener {
        async fn open(&self) -> Result<Box<dyn Source>, SourceError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let first = self.first.lock().unwrap().take();
            match first {
                Some(source) => Ok(Box::new(source)),
                None => Err(SourceError::Open("no device".into())),
            }
        }
    }

    #[derive(Default)]
    struct CollectSink(Mutex<Vec<String>>);

    impl ReportSink for CollectSink {
        fn on_report(&self, report: &CanonicalReport) {
            self.0.lock().unwrap().push(report.id.clone());
        }
    }

    fn state_channel() -> Arc<watch::Sender<SupervisorState>> {
        Arc::new(watch::channel(SupervisorState::Idle).0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_delay() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let state = state_channel();
        let supervisor = Supervisor::new(
            Box::new(FakeOpener::failing(Arc::clone(&attempts))),
            vec![],
            Duration::from_secs(3),
            Arc::clone(&state),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { supervisor.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(*state.borrow(), SupervisorState::Reconnecting);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(*state.borrow(), SupervisorState::Stopped);
    }

    #[test]
    fn test_zero_delay_defaults_to_three_seconds() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let supervisor = Supervisor::new(
            Box::new(FakeOpener::failing(Arc::clone(&attempts))),
            vec![],
            Duration::ZERO,
            state_channel(),
        );
        assert_eq!(supervisor.reconnect_delay, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_delay() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let state = state_channel();
        let supervisor = Supervisor::new(
            Box::new(FakeOpener::failing(Arc::clone(&attempts))),
            vec![],
            Duration::from_secs(3),
            Arc::clone(&state),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { supervisor.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        let before = tokio::time::Instant::now();
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(*state.borrow(), SupervisorState::Stopped);
        assert!(tokio::time::Instant::now() - before < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_to_sinks_then_reconnects() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let source = FakeSource {
            reports: vec![report("a"), report("b"), report("c")],
            ending: Ending::Fail,
            closed: Arc::clone(&closed),
        };
        let sink = Arc::new(CollectSink::default());
        let state = state_channel();
        let supervisor = Supervisor::new(
            Box::new(FakeOpener::with_source(Arc::clone(&attempts), source)),
            vec![sink.clone() as Arc<dyn ReportSink>],
            Duration::from_secs(3),
            Arc::clone(&state),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { supervisor.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*sink.0.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(*state.borrow(), SupervisorState::Reconnecting);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_stream_reconnects() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let source = FakeSource {
            reports: vec![],
            ending: Ending::Eof,
            closed: Arc::new(AtomicBool::new(false)),
        };
        let supervisor = Supervisor::new(
            Box::new(FakeOpener::with_source(Arc::clone(&attempts), source)),
            vec![],
            Duration::from_secs(3),
            state_channel(),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { supervisor.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_streaming() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let source = FakeSource {
            reports: vec![report("a")],
            ending: Ending::WaitForCancel,
            closed: Arc::clone(&closed),
        };
        let sink = Arc::new(CollectSink::default());
        let state = state_channel();
        let supervisor = Supervisor::new(
            Box::new(FakeOpener::with_source(Arc::clone(&attempts), source)),
            vec![sink.clone() as Arc<dyn ReportSink>],
            Duration::from_secs(3),
            Arc::clone(&state),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { supervisor.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*state.borrow(), SupervisorState::Streaming);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(*sink.0.lock().unwrap(), vec!["a"]);
        assert_eq!(*state.borrow(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let state = state_channel();
        let supervisor = Supervisor::new(
            Box::new(FakeOpener::failing(Arc::clone(&attempts))),
            vec![],
            Duration::from_secs(3),
            Arc::clone(&state),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        supervisor.run(cancel).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(*state.borrow(), SupervisorState::Stopped);
    }
}
