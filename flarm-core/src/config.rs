//! Configuration file management for flarm.
//!
//! Reads/writes a JSON file (default `config.json`) with the station location,
//! time zone, ID map, reconnect delay, subscriber queue bound, report log and
//! TLS settings. Also validates the exclusive choice of acquisition source.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{FlarmError, Result, StationReference};

/// Default config file name, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Used when `reconnect_delay_sec` is absent or zero.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

pub const DEFAULT_BAUD_RATE: u32 = 57600;

/// Rotated report log files kept by default.
pub const DEFAULT_REPORT_LOG_FILES: usize = 7;

/// Full configuration structure. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub station: StationConfig,
    /// IANA name. Empty means UTC.
    pub time_zone: String,
    /// Raw device ID -> call-sign.
    pub id_map: BTreeMap<String, String>,
    pub reconnect_delay_sec: u64,
    pub queue_capacity: usize,
    pub report_log: ReportLogConfig,
    /// Serve the subscriber feed over HTTPS when set. Read once at startup.
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub lat: f64,
    pub long: f64,
    /// Meters.
    pub alt: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportLogConfig {
    /// Report logging is off when unset.
    pub dir: Option<PathBuf>,
    pub file: String,
    pub rotation: Rotation,
    /// Rotated files kept; older ones are deleted. Ignored with `never`.
    pub max_files: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Never,
    Hourly,
    #[default]
    Daily,
}

/// PEM certificate chain and private key. Both or neither.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsConfig {
    /// Certificate and key to serve with, `None` for plain HTTP. Empty paths
    /// count as unset.
    pub fn files(&self) -> Result<Option<TlsFiles>> {
        let set = |p: &Option<PathBuf>| p.clone().filter(|p| !p.as_os_str().is_empty());
        match (set(&self.cert), set(&self.key)) {
            (None, None) => Ok(None),
            (Some(cert), Some(key)) => Ok(Some(TlsFiles { cert, key })),
            _ => Err(FlarmError::Config(
                "tls.cert and tls.key must be set together".into(),
            )),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            station: StationConfig::default(),
            time_zone: String::new(),
            id_map: BTreeMap::new(),
            reconnect_delay_sec: DEFAULT_RECONNECT_DELAY.as_secs(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            report_log: ReportLogConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl Default for ReportLogConfig {
    fn default() -> Self {
        ReportLogConfig {
            dir: None,
            file: "reports.log".into(),
            rotation: Rotation::Daily,
            max_files: DEFAULT_REPORT_LOG_FILES,
        }
    }
}

impl Config {
    /// Delay between a source failure and the next open attempt.
    pub fn reconnect_delay(&self) -> Duration {
        match self.reconnect_delay_sec {
            0 => DEFAULT_RECONNECT_DELAY,
            s => Duration::from_secs(s),
        }
    }

    pub fn time_zone(&self) -> Result<Tz> {
        if self.time_zone.is_empty() {
            return Ok(Tz::UTC);
        }
        self.time_zone
            .parse()
            .map_err(|_| FlarmError::Config(format!("invalid time zone {:?}", self.time_zone)))
    }

    /// Build the read-only station reference for one service generation.
    pub fn station_reference(&self) -> Result<StationReference> {
        let StationConfig { lat, long, alt } = self.station;
        if !(-90.0..=90.0).contains(&lat) {
            return Err(FlarmError::Config(format!("station latitude {lat} out of range")));
        }
        if !(-180.0..=180.0).contains(&long) {
            return Err(FlarmError::Config(format!("station longitude {long} out of range")));
        }

        Ok(StationReference {
            lat,
            long,
            altitude: alt,
            time_zone: self.time_zone()?,
            id_map: self.id_map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        })
    }

    /// Check everything a service generation needs before it starts.
    pub fn validate(&self) -> Result<()> {
        self.station_reference()?;
        if self.queue_capacity == 0 {
            return Err(FlarmError::Config("queue_capacity must be positive".into()));
        }
        if self.report_log.dir.is_some() && self.report_log.file.is_empty() {
            return Err(FlarmError::Config("report_log.file must be set".into()));
        }
        if self.report_log.rotation != Rotation::Never && self.report_log.max_files == 0 {
            return Err(FlarmError::Config("report_log.max_files must be positive".into()));
        }
        self.tls.files()?;
        Ok(())
    }
}

/// Load and validate config from `path`.
///
/// Returns default config if the file doesn't exist.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }

    let text = std::fs::read_to_string(path)?;
    let config = parse_config(&text)
        .map_err(|e| FlarmError::Config(format!("{}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Save config to `path`, creating parent directories.
pub fn save_config(config: &Config, path: &Path) -> Result<PathBuf> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(path, text + "\n")?;
    Ok(path.to_path_buf())
}

fn parse_config(text: &str) -> std::result::Result<Config, serde_json::Error> {
    serde_json::from_str(text)
}

// ---------------------------------------------------------------------------
// Source selection
// ---------------------------------------------------------------------------

/// Where reports come from. Exactly one per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    /// Local FLARM device on a serial port.
    Serial { path: String, baud_rate: u32 },
    /// OGN decoder text output, `host:port`.
    NetworkText { addr: String },
    /// Another flarm instance's WebSocket feed.
    Relay { url: String },
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::Serial { path, baud_rate } => write!(f, "serial {path} @ {baud_rate}"),
            SourceLocator::NetworkText { addr } => write!(f, "ogn {addr}"),
            SourceLocator::Relay { url } => write!(f, "relay {url}"),
        }
    }
}

/// Pick the single configured source. Empty strings count as unset.
pub fn select_source(
    port: Option<&str>,
    baud_rate: u32,
    ogn: Option<&str>,
    remote: Option<&str>,
) -> Result<SourceLocator> {
    let set = |v: Option<&str>| v.filter(|s| !s.trim().is_empty()).map(str::to_string);

    match (set(port), set(ogn), set(remote)) {
        (Some(path), None, None) => Ok(SourceLocator::Serial { path, baud_rate }),
        (None, Some(addr), None) => Ok(SourceLocator::NetworkText { addr }),
        (None, None, Some(url)) => Ok(SourceLocator::Relay { url }),
        (None, None, None) => Err(FlarmError::Config(
            "no source selected: set one of port, ogn or remote".into(),
        )),
        _ => Err(FlarmError::Config(
            "only one of port, ogn or remote may be set".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.reconnect_delay(), Duration::from_secs(3));
        assert_eq!(config.queue_capacity, 100);
        assert!(config.report_log.dir.is_none());
        assert_eq!(config.report_log.rotation, Rotation::Daily);
        assert_eq!(config.report_log.max_files, DEFAULT_REPORT_LOG_FILES);
        assert_eq!(config.tls.files().unwrap(), None);
        assert_eq!(config.time_zone().unwrap(), Tz::UTC);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_config() {
        let text = r#"{
            "station": {"lat": 32.5, "long": 35.1, "alt": 100},
            "time_zone": "Asia/Jerusalem",
            "id_map": {"DD8E8B": "4X-GDL"},
            "reconnect_delay_sec": 5,
            "report_log": {"dir": "/var/log/flarm", "rotation": "daily"}
        }"#;
        let config = parse_config(text).unwrap();
        assert_eq!(config.station.lat, 32.5);
        assert_eq!(config.station.alt, 100.0);
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.report_log.dir, Some(PathBuf::from("/var/log/flarm")));
        assert_eq!(config.report_log.file, "reports.log");
        assert_eq!(config.report_log.rotation, Rotation::Daily);

        let station = config.station_reference().unwrap();
        assert_eq!(station.time_zone, chrono_tz::Asia::Jerusalem);
        assert_eq!(station.map_id("DD8E8B"), "4X-GDL");
    }

    #[test]
    fn test_zero_delay_uses_default() {
        let config = parse_config(r#"{"reconnect_delay_sec": 0}"#).unwrap();
        assert_eq!(config.reconnect_delay(), DEFAULT_RECONNECT_DELAY);
    }

    #[test]
    fn test_invalid_time_zone() {
        let config = parse_config(r#"{"time_zone": "Mars/Olympus"}"#).unwrap();
        assert!(matches!(config.validate(), Err(FlarmError::Config(_))));
    }

    #[test]
    fn test_out_of_range_station() {
        let config = parse_config(r#"{"station": {"lat": 91}}"#).unwrap();
        assert!(config.station_reference().is_err());
        let config = parse_config(r#"{"station": {"long": -181}}"#).unwrap();
        assert!(config.station_reference().is_err());
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let config = parse_config(r#"{"queue_capacity": 0}"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_max_files_rejected() {
        let config = parse_config(r#"{"report_log": {"max_files": 0}}"#).unwrap();
        assert!(config.validate().is_err());
        let config =
            parse_config(r#"{"report_log": {"max_files": 0, "rotation": "never"}}"#).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_tls_files() {
        let config = parse_config(r#"{"tls": {"cert": "/etc/flarm/cert.pem", "key": "/etc/flarm/key.pem"}}"#)
            .unwrap();
        config.validate().unwrap();
        assert_eq!(
            config.tls.files().unwrap(),
            Some(TlsFiles {
                cert: PathBuf::from("/etc/flarm/cert.pem"),
                key: PathBuf::from("/etc/flarm/key.pem"),
            })
        );

        let config = parse_config(r#"{"tls": {"cert": "", "key": ""}}"#).unwrap();
        assert_eq!(config.tls.files().unwrap(), None);
    }

    #[test]
    fn test_tls_needs_cert_and_key() {
        let config = parse_config(r#"{"tls": {"cert": "/etc/flarm/cert.pem"}}"#).unwrap();
        assert!(matches!(config.validate(), Err(FlarmError::Config(_))));
        let config = parse_config(r#"{"tls": {"cert": "", "key": "/etc/flarm/key.pem"}}"#).unwrap();
        assert!(config.tls.files().is_err());
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_config(&path), Err(FlarmError::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.json");

        let mut config = Config::default();
        config.station.lat = 32.5;
        config.time_zone = "UTC".into();
        config.id_map.insert("123456".into(), "4X-APL".into());
        config.report_log.rotation = Rotation::Hourly;

        let written = save_config(&config, &path).unwrap();
        assert_eq!(written, path);
        assert_eq!(load_config(&path).unwrap(), config);
    }

    #[test]
    fn test_select_source() {
        assert_eq!(
            select_source(Some("/dev/ttyUSB0"), 57600, None, None).unwrap(),
            SourceLocator::Serial { path: "/dev/ttyUSB0".into(), baud_rate: 57600 }
        );
        assert_eq!(
            select_source(None, 57600, Some("127.0.0.1:50001"), Some("")).unwrap(),
            SourceLocator::NetworkText { addr: "127.0.0.1:50001".into() }
        );
        assert_eq!(
            select_source(Some(""), 57600, None, Some("ws://host:8082/ws")).unwrap(),
            SourceLocator::Relay { url: "ws://host:8082/ws".into() }
        );
    }

    #[test]
    fn test_select_source_exclusive() {
        assert!(select_source(None, 57600, None, None).is_err());
        assert!(select_source(Some("/dev/ttyS0"), 57600, Some("h:1"), None).is_err());
        assert!(select_source(Some("/dev/ttyS0"), 57600, Some("h:1"), Some("ws://x")).is_err());
    }
}
