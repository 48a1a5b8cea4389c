//! flarm: FLARM traffic ingest + live WebSocket feed.

use std::collections::HashMap;
use std::future::Future;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use comfy_table::{Cell, Table};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flarm_core::config::{self, Config, DEFAULT_BAUD_RATE, DEFAULT_CONFIG_FILE};
use flarm_core::{normalize, ogn, sentence, CanonicalReport, SourceLocator, StationReference};

mod registry;
mod report_log;
mod source;
mod supervisor;
mod web;

use registry::BroadcastRegistry;
use report_log::ReportLog;
use supervisor::{LocatorOpener, ReportSink, Supervisor, SupervisorState};
use web::AppState;

#[derive(Parser)]
#[command(name = "flarm", version, about = "FLARM traffic receiver and broadcaster")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read from one source and broadcast reports to WebSocket clients
    Serve(ServeArgs),

    /// Decode a capture file and print a traffic table
    Decode {
        /// Capture file, one sentence per line (`-` for stdin)
        file: PathBuf,

        /// Line protocol of the capture
        #[arg(long, value_enum, default_value = "nmea")]
        protocol: Protocol,

        /// Configuration file (station location, ID map)
        #[arg(long, env = "FLARM_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,

        /// Print one JSON report per line instead of the summary table
        #[arg(short, long)]
        raw: bool,
    },

    /// Write a default configuration file
    InitConfig {
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Address for HTTP serving
    #[arg(long, env = "FLARM_ADDR", default_value = "0.0.0.0:8082")]
    addr: String,

    /// Configuration file, reloaded at each reset
    #[arg(long, env = "FLARM_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Serial port of a FLARM device, e.g. /dev/ttyUSB0
    #[arg(long, env = "FLARM_PORT")]
    port: Option<String>,

    /// Serial port baud rate
    #[arg(long, env = "FLARM_BAUD_RATE", default_value_t = DEFAULT_BAUD_RATE)]
    baud_rate: u32,

    /// OGN decoder address, host:port
    #[arg(long, env = "FLARM_OGN")]
    ogn: Option<String>,

    /// Remote flarm server WebSocket URL, e.g. ws://host:8082/ws
    #[arg(long, env = "FLARM_REMOTE")]
    remote: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Protocol {
    /// FLARM data port sentences ($PFLAA, $PFLAU, $PGRMZ)
    Nmea,
    /// OGN decoder text output
    Ogn,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => cmd_serve(args).await,
        Commands::Decode {
            file,
            protocol,
            config,
            raw,
        } => cmd_decode(&file, protocol, &config, raw),
        Commands::InitConfig { path, force } => cmd_init_config(&path, force),
    }
}

fn fatal(msg: impl std::fmt::Display) -> ! {
    error!("{msg}");
    std::process::exit(1);
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn cmd_serve(args: ServeArgs) {
    let locator = config::select_source(
        args.port.as_deref(),
        args.baud_rate,
        args.ogn.as_deref(),
        args.remote.as_deref(),
    )
    .unwrap_or_else(|e| fatal(e));

    let first_config = config::load_config(&args.config).unwrap_or_else(|e| fatal(e));
    first_config.validate().unwrap_or_else(|e| fatal(e));
    let tls = first_config.tls.files().unwrap_or_else(|e| fatal(e));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c");
                return;
            }
            info!("shutting down");
            shutdown.cancel();
        }
    });

    // The listener and subscriber set live for the whole process; a reset
    // only restarts the source side.
    let registry = Arc::new(BroadcastRegistry::new(first_config.queue_capacity));
    let (state_tx, state_rx) = watch::channel(SupervisorState::Idle);
    let state_tx = Arc::new(state_tx);
    let app = Arc::new(AppState::new(registry, state_rx, shutdown.clone()));

    let listener = TcpListener::bind(&args.addr)
        .await
        .unwrap_or_else(|e| fatal(format!("cannot listen on {}: {e}", args.addr)));
    let server = match tls {
        Some(tls) => tokio::spawn({
            let app = Arc::clone(&app);
            async move { web::serve_tls(listener, app, &tls).await }
        }),
        None => tokio::spawn(web::serve(listener, Arc::clone(&app))),
    };

    let served = run_generations(
        &args.config,
        Some(first_config),
        &locator,
        &app,
        &state_tx,
        wait_for_reset,
    )
    .await;
    if let Err(e) = served {
        shutdown.cancel();
        fatal(e);
    }

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "web server failed"),
        Err(e) => error!(error = %e, "web server task failed"),
    }
}

/// Run service generations until the process shuts down. Every generation
/// after the first reloads its configuration from `config_path`; `reset`
/// yields the future that ends the current generation.
async fn run_generations<F, Fut>(
    config_path: &Path,
    mut next_config: Option<Config>,
    locator: &SourceLocator,
    app: &AppState,
    state: &Arc<watch::Sender<SupervisorState>>,
    mut reset: F,
) -> flarm_core::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    while !app.shutdown.is_cancelled() {
        let config = match next_config.take() {
            Some(c) => c,
            None => config::load_config(config_path)?,
        };
        config.validate()?;

        let generation = app.generation.fetch_add(1, Ordering::Relaxed) + 1;
        info!(generation, source = %locator, "starting service generation");
        run_generation(&config, locator, &app.registry, state, &app.shutdown, reset()).await?;
    }
    Ok(())
}

/// Run one generation: fresh station, report log and supervisor, until the
/// process shuts down or `reset` completes.
async fn run_generation(
    config: &Config,
    locator: &SourceLocator,
    registry: &Arc<BroadcastRegistry>,
    state: &Arc<watch::Sender<SupervisorState>>,
    shutdown: &CancellationToken,
    reset: impl Future<Output = ()> + Send + 'static,
) -> flarm_core::Result<()> {
    let station = config.station_reference()?;

    let mut sinks: Vec<Arc<dyn ReportSink>> = vec![Arc::clone(registry) as Arc<dyn ReportSink>];
    match ReportLog::open(&config.report_log) {
        Ok(Some(log)) => sinks.push(Arc::new(log)),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "report log disabled"),
    }

    let supervisor = Supervisor::new(
        Box::new(LocatorOpener::new(locator.clone(), station)),
        sinks,
        config.reconnect_delay(),
        Arc::clone(state),
    );

    let cancel = shutdown.child_token();
    let reset_task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            reset.await;
            info!("reset requested, reloading configuration");
            cancel.cancel();
        }
    });

    supervisor.run(cancel).await;
    reset_task.abort();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_reset() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::hangup()) {
        Ok(mut hup) => {
            hup.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGHUP, reset disabled");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_reset() {
    std::future::pending::<()>().await;
}

// ---------------------------------------------------------------------------
// decode
// ---------------------------------------------------------------------------

/// Latest report and message count per aircraft.
struct Seen {
    latest: CanonicalReport,
    messages: u32,
}

fn cmd_decode(file: &Path, protocol: Protocol, config_path: &Path, raw: bool) {
    let station = config::load_config(config_path)
        .and_then(|c| c.station_reference())
        .unwrap_or_else(|e| fatal(e));

    let reader: Box<dyn BufRead> = if file.to_str() == Some("-") {
        Box::new(io::stdin().lock())
    } else {
        let f = std::fs::File::open(file).unwrap_or_else(|e| {
            fatal(format!("Error opening {}: {e}", file.display()))
        });
        Box::new(io::BufReader::new(f))
    };

    let mut aircraft: HashMap<String, Seen> = HashMap::new();
    let mut total_lines = 0u64;
    let mut recognized = 0u64;

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => continue,
        };

        // Device captures may use bare CR as the terminator.
        for frame in line.split('\r') {
            if frame.trim().is_empty() {
                continue;
            }
            total_lines += 1;

            let Some(report) = decode_frame(frame, protocol, &station, &mut recognized) else {
                continue;
            };

            if raw {
                match serde_json::to_string(&report) {
                    Ok(json) => println!("{json}"),
                    Err(e) => warn!(error = %e, "cannot encode report"),
                }
            }

            aircraft
                .entry(report.id.clone())
                .and_modify(|s| {
                    s.messages += 1;
                    s.latest = report.clone();
                })
                .or_insert(Seen {
                    latest: report,
                    messages: 1,
                });
        }
    }

    if !raw {
        print_summary(&aircraft, total_lines, recognized);
    }
}

fn decode_frame(
    frame: &str,
    protocol: Protocol,
    station: &StationReference,
    recognized: &mut u64,
) -> Option<CanonicalReport> {
    match protocol {
        Protocol::Nmea => {
            let decoded = sentence::decode(frame)?;
            *recognized += 1;
            normalize::from_sentence(station, &decoded, station.now())
        }
        Protocol::Ogn => {
            let record = ogn::decode(frame)?;
            *recognized += 1;
            normalize::from_ogn(station, &record, station.now())
        }
    }
}

fn print_summary(aircraft: &HashMap<String, Seen>, total_lines: u64, recognized: u64) {
    println!();
    println!(
        "Lines: {total_lines} read, {recognized} recognized, {} aircraft",
        aircraft.len()
    );
    println!();

    if aircraft.is_empty() {
        return;
    }

    let mut table = Table::new();
    table.set_header(vec![
        "ID", "Kind", "Lat", "Long", "Alt (m)", "Hdg", "Speed (m/s)", "Climb (m/s)", "Alarm",
        "Msgs",
    ]);

    let mut sorted: Vec<_> = aircraft.values().collect();
    sorted.sort_by_key(|s| std::cmp::Reverse(s.messages));

    for seen in sorted {
        let r = &seen.latest;
        table.add_row(vec![
            Cell::new(&r.id),
            Cell::new(r.aircraft_kind),
            Cell::new(format!("{:.5}", r.lat)),
            Cell::new(format!("{:.5}", r.long)),
            Cell::new(format!("{:.0}", r.altitude)),
            Cell::new(r.heading),
            Cell::new(format!("{:.1}", r.ground_speed)),
            Cell::new(format!("{:+.1}", r.climb_rate)),
            Cell::new(r.alarm_level),
            Cell::new(seen.messages),
        ]);
    }

    println!("{table}");
}

// ---------------------------------------------------------------------------
// init-config
// ---------------------------------------------------------------------------

fn cmd_init_config(path: &Path, force: bool) {
    if path.exists() && !force {
        fatal(format!("{} already exists (use --force to overwrite)", path.display()));
    }
    match config::save_config(&Config::default(), path) {
        Ok(written) => println!("Wrote {}", written.display()),
        Err(e) => fatal(e),
    }
}
