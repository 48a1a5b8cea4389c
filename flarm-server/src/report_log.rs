//! Report log: every accepted report as one JSON line in a file.
//!
//! Writes go through a non-blocking worker so a slow disk never stalls the
//! supervisor. Lines are dropped, not queued without bound, if the worker falls
//! behind. The file is rotated by time according to the configuration, and only
//! the newest `max_files` rotated files are kept.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use tracing::{info, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation as FileRotation};

use flarm_core::config::{ReportLogConfig, Rotation};
use flarm_core::CanonicalReport;

use crate::supervisor::ReportSink;

pub struct ReportLog {
    writer: Mutex<NonBlocking>,
    // Flushes pending lines when the log is dropped.
    _guard: WorkerGuard,
}

impl ReportLog {
    /// Open the report log, or `None` if no directory is configured.
    pub fn open(config: &ReportLogConfig) -> std::io::Result<Option<ReportLog>> {
        let Some(dir) = config.dir.as_deref() else {
            return Ok(None);
        };
        Self::create(dir, config).map(Some)
    }

    fn create(dir: &Path, config: &ReportLogConfig) -> std::io::Result<ReportLog> {
        std::fs::create_dir_all(dir)?;
        let builder = RollingFileAppender::builder().filename_prefix(&config.file);
        let builder = match config.rotation {
            Rotation::Never => builder.rotation(FileRotation::NEVER),
            Rotation::Hourly => builder
                .rotation(FileRotation::HOURLY)
                .max_log_files(config.max_files),
            Rotation::Daily => builder
                .rotation(FileRotation::DAILY)
                .max_log_files(config.max_files),
        };
        let appender = builder.build(dir).map_err(std::io::Error::other)?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        info!(
            dir = %dir.display(),
            file = %config.file,
            rotation = ?config.rotation,
            "report log enabled"
        );
        Ok(ReportLog {
            writer: Mutex::new(writer),
            _guard: guard,
        })
    }

    /// Append one report.
    pub fn log(&self, report: &CanonicalReport) {
        let mut line = match serde_json::to_vec(report) {
            Ok(line) => line,
            Err(e) => {
                warn!(id = %report.id, error = %e, "failed to encode report for log");
                return;
            }
        };
        line.push(b'\n');

        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writer.write_all(&line) {
            warn!(error = %e, "failed to write report log");
        }
    }
}

impl ReportSink for ReportLog {
    fn on_report(&self, report: &CanonicalReport) {
        self.log(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use flarm_core::AircraftKind;

    fn report(id: &str) -> CanonicalReport {
        CanonicalReport {
            id: id.into(),
            lat: 32.5,
            long: 35.1,
            altitude: 565.0,
            heading: 78,
            ground_speed: 44.0,
            climb_rate: 2.8,
            turn_rate: 0.0,
            aircraft_kind: AircraftKind::TowPlane,
            alarm_level: 0,
            timestamp: DateTime::parse_from_rfc3339("2021-04-22T13:40:56+03:00").unwrap(),
        }
    }

    #[test]
    fn test_disabled_without_dir() {
        let config = ReportLogConfig::default();
        assert!(ReportLog::open(&config).unwrap().is_none());
    }

    #[test]
    fn test_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReportLogConfig {
            dir: Some(dir.path().join("logs")),
            file: "reports.log".into(),
            rotation: Rotation::Never,
            max_files: 1,
        };

        let log = ReportLog::open(&config).unwrap().unwrap();
        log.on_report(&report("4X-GDL"));
        log.on_report(&report("DDFD1D"));
        drop(log);

        let text = std::fs::read_to_string(dir.path().join("logs").join("reports.log")).unwrap();
        let ids: Vec<String> = text
            .lines()
            .map(|l| serde_json::from_str::<CanonicalReport>(l).unwrap().id)
            .collect();
        assert_eq!(ids, vec!["4X-GDL", "DDFD1D"]);
    }

    #[test]
    fn test_daily_rotation_names_file_by_date() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReportLogConfig {
            dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(config.rotation, Rotation::Daily);

        let log = ReportLog::open(&config).unwrap().unwrap();
        log.on_report(&report("4X-GDL"));
        drop(log);

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("reports.log."), "{names:?}");
    }
}
