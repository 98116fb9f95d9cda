use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use crossbeam_channel::Sender;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use syclone::detect::{DetectError, PortDetector, PortTally};
use syclone::engine::FillStats;
use syclone::session::{AcquisitionStats, Session};
use syclone::sink::{CellPos, CellSink, CellValue, ChangeNotification, CompletionNotifier, MemorySheet};
use syclone::transport::{enumerate_ports, Endpoint, SerialEndpoint, SerialPortOpener};
use syclone::{sample_queue, BridgeConfig, CommandParser, FillEngine};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_SHEET: &str = "Sheet1";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("syclone")
        .version("0.1.0")
        .author("Radiation Instrumentation Team")
        .about("☢️  Syclone serial bridge - stream dose-rate samples into capture grids")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("baud")
                .short("b")
                .long("baud")
                .value_name("RATE")
                .help("Serial baud rate")
                .takes_value(true)
                .global(true)
                .validator(|v| match v.parse::<u32>() {
                    Ok(rate) if rate > 0 => Ok(()),
                    _ => Err("Baud rate must be a positive number".into()),
                }),
        )
        .arg(
            Arg::with_name("window")
                .short("w")
                .long("window-ms")
                .value_name("MS")
                .help("Calibration window for port detection in milliseconds")
                .takes_value(true)
                .global(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(()),
                    _ => Err("Window must be a positive number of milliseconds".into()),
                }),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Use this serial port instead of auto-detecting")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("ports")
                .about("🔌 List serial ports and whether they qualify as candidates"),
        )
        .subcommand(
            SubCommand::with_name("detect")
                .about("🔍 Find the port carrying Syclone data")
                .long_about("Opens every candidate port, counts incoming bytes for the calibration window and reports the busiest one"),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("📡 Stream samples and accept capture commands")
                .long_about("Detects the sensor port, then reads host edits from stdin as '<row> <col> <text>' or '<sheet>!<row> <col> <text>'. Typing 'Syclone 5' or 'Syclone 3x4' as the text starts a capture at that cell.")
                .arg(
                    Arg::with_name("output")
                        .short("o")
                        .long("output")
                        .value_name("CSV")
                        .help("Write the captured sheet to this CSV file on exit")
                        .takes_value(true),
                ),
        )
        .get_matches();

    let verbose = matches.is_present("verbose");
    init_tracing(verbose);

    let format = matches.value_of("format").unwrap_or("table").to_string();
    let config = build_config(&matches)?;

    match matches.subcommand() {
        ("ports", _) => handle_ports(&config, &format)?,
        ("detect", _) => handle_detect(config, &format).await?,
        ("run", Some(sub_matches)) => {
            let mut config = config;
            if let Some(output) = sub_matches.value_of("output") {
                config.output = Some(PathBuf::from(output));
            }
            handle_run(config, &format).await?;
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} List serial ports", "syclone ports".bright_cyan());
            println!("  {} Find the sensor", "syclone detect".bright_cyan());
            println!("  {} Stream and capture", "syclone run".bright_cyan());
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn build_config(matches: &ArgMatches<'_>) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    let mut config = match matches.value_of("config") {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };

    if let Some(baud) = matches.value_of("baud") {
        config.baud_rate = baud.parse()?;
    }
    if let Some(window) = matches.value_of("window") {
        config.calibration_window_ms = window.parse()?;
    }
    if let Some(port) = matches.value_of("port") {
        config.port = Some(port.to_string());
    }

    config.validate()?;
    Ok(config)
}

fn handle_ports(config: &BridgeConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let ports = enumerate_ports()?;
    let filter = config.candidate_filter();

    if format == "json" {
        let listing: Vec<serde_json::Value> = ports
            .iter()
            .map(|port| {
                serde_json::json!({
                    "name": port.name,
                    "description": port.description,
                    "candidate": filter.matches(&port.description),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if ports.is_empty() {
        println!("{}", "No serial ports found.".yellow());
        return Ok(());
    }

    println!("{}", "🔌 Serial Ports".bright_blue().bold());
    for port in &ports {
        let marker = if filter.matches(&port.description) {
            "candidate".green()
        } else {
            "ignored".dimmed()
        };
        println!("  {:<16} {:<10} {}", port.name.bright_white(), marker, port.description);
    }
    Ok(())
}

/// Resolve the sensor endpoint: the pinned port if configured, otherwise
/// whichever candidate wins calibration.
async fn acquire_endpoint(
    config: &BridgeConfig,
    session: &Session,
) -> Result<(SerialEndpoint, Vec<PortTally>), Box<dyn std::error::Error>> {
    let detector = PortDetector::new(SerialPortOpener, config.detector_config())
        .with_shutdown(session.shutdown_flag());

    if let Some(port) = config.port.clone() {
        let endpoint = tokio::task::spawn_blocking(move || detector.open_direct(&port)).await??;
        return Ok((endpoint, Vec::new()));
    }

    let candidates = config.candidate_filter().apply(&enumerate_ports()?);
    let detection = tokio::task::spawn_blocking(move || detector.detect(&candidates)).await?;
    match detection {
        Ok(detection) => Ok((detection.endpoint, detection.tallies)),
        Err(e) => {
            if let DetectError::NoTraffic { tallies } = &e {
                print_tallies(tallies);
            }
            Err(e.into())
        }
    }
}

fn spawn_ctrl_c(session: &Session) {
    let session = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            session.request_shutdown();
        }
    });
}

async fn handle_detect(config: BridgeConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::new();
    spawn_ctrl_c(&session);

    let (mut endpoint, tallies) = acquire_endpoint(&config, &session).await?;

    if format == "json" {
        let report = serde_json::json!({
            "port": endpoint.id(),
            "tallies": tallies,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_tallies(&tallies);
        println!("{} {}", "✅ Syclone port:".green(), endpoint.id().bright_white().bold());
    }

    endpoint.close();
    Ok(())
}

fn print_tallies(tallies: &[PortTally]) {
    for tally in tallies {
        println!("  {:<16} {:>8} bytes", tally.port, tally.bytes);
    }
}

async fn handle_run(config: BridgeConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::new();
    spawn_ctrl_c(&session);

    let (endpoint, _) = match acquire_endpoint(&config, &session).await {
        Ok(found) => found,
        Err(e) => {
            error!("Syclone not detected: {}", e);
            return Err(e);
        }
    };
    info!("Syclone serial stream is live on {}", endpoint.id());

    let (producer, consumer) = sample_queue();
    let acquisition = session.spawn_acquisition(endpoint, producer, config.read_timeout(), |sample| {
        info!("[Syclone] {:6.1} nSv/h  @ {}", sample.dose_nsv_per_h, sample.timestamp);
    })?;

    info!("Waiting for the first Syclone sample...");
    let waiter = session.clone();
    let poll = config.fill_poll_interval();
    let got_sample = tokio::task::spawn_blocking(move || waiter.wait_for_first_sample(poll)).await?;
    if !got_sample {
        warn!("Stopped before any sample arrived");
        join_acquisition(acquisition).await?;
        return Ok(());
    }

    let (change_tx, change_rx) = crossbeam_channel::unbounded();
    spawn_stdin_host(change_tx)?;
    println!(
        "{}",
        "Enter edits as '<row> <col> <text>', e.g. '2 1 Syclone 10'. Ctrl+C to exit.".bright_blue()
    );

    let parser = CommandParser::new(&config.command_keyword)?;
    let fill_session = session.clone();
    let max_targets = config.max_targets;
    let (sink, stats) = tokio::task::spawn_blocking(move || {
        let mut engine = FillEngine::new(parser, ConsoleSheet::default(), BellNotifier)
            .with_max_targets(max_targets);
        fill_session.run_fill(&mut engine, &consumer, &change_rx, poll);
        let stats = *engine.stats();
        (engine.into_sink(), stats)
    })
    .await?;

    session.request_shutdown();
    join_acquisition(acquisition).await?;

    print_summary(&session.acquisition_stats(), &stats, format)?;

    if let Some(path) = &config.output {
        let sheet_count = sink.inner.sheets().count();
        for sheet in sink.inner.sheets() {
            let target = csv_path_for(path, sheet, sheet_count);
            sink.inner.write_csv(sheet, &target)?;
            info!("Wrote {} to {}", sheet, target.display());
        }
    }

    Ok(())
}

/// Wait for the acquisition thread off the runtime. Returns `false` if it
/// panicked.
async fn join_acquisition(handle: JoinHandle<()>) -> Result<bool, tokio::task::JoinError> {
    let clean = tokio::task::spawn_blocking(move || handle.join()).await?.is_ok();
    if !clean {
        error!("Acquisition thread panicked");
    }
    Ok(clean)
}

fn csv_path_for(path: &Path, sheet: &str, sheet_count: usize) -> PathBuf {
    if sheet_count <= 1 {
        return path.to_path_buf();
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("capture");
    path.with_file_name(format!("{stem}-{sheet}.csv"))
}

fn print_summary(
    acquisition: &AcquisitionStats,
    fill: &FillStats,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if format == "json" {
        let summary = serde_json::json!({
            "acquisition": acquisition,
            "fill": fill,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("\n{}", "📊 Session Summary".bright_blue().bold());
    println!("  {:<20} {}", "Bytes read:".bright_white(), acquisition.bytes_read);
    println!("  {:<20} {}", "Frames:".bright_white(), acquisition.frames);
    println!("  {:<20} {}", "Samples:".bright_white(), acquisition.samples);
    println!("  {:<20} {}", "Invalid frames:".bright_white(), acquisition.invalid_frames);
    println!("  {:<20} {}", "Samples written:".bright_white(), fill.samples_written);
    println!("  {:<20} {}", "Samples discarded:".bright_white(), fill.samples_discarded);
    println!("  {:<20} {}", "Grids allocated:".bright_white(), fill.grids_allocated);
    println!("  {:<20} {}", "Grids completed:".bright_white(), fill.grids_completed);
    Ok(())
}

/// Parse `<row> <col> <text>` or `<sheet>!<row> <col> <text>`.
fn parse_host_line(line: &str) -> Option<ChangeNotification> {
    let line = line.trim();
    let (sheet, rest) = match line.split_once('!') {
        Some((sheet, rest)) if !sheet.is_empty() && !sheet.contains(char::is_whitespace) => (sheet, rest),
        _ => (DEFAULT_SHEET, line),
    };

    let mut parts = rest.trim_start().splitn(3, char::is_whitespace);
    let row = parts.next()?.parse().ok()?;
    let col = parts.next()?.parse().ok()?;
    let text = parts.next().unwrap_or("");

    Some(ChangeNotification::new(sheet, CellPos::new(row, col), text))
}

/// Stand-in host: each stdin line is a cell edit. EOF closes the change
/// stream, which ends the session.
fn spawn_stdin_host(tx: Sender<ChangeNotification>) -> std::io::Result<()> {
    thread::Builder::new()
        .name(String::from("syclone-host"))
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_host_line(&line) {
                    Some(change) => {
                        if tx.send(change).is_err() {
                            break;
                        }
                    }
                    None => warn!("Expected '<row> <col> <text>', got {:?}", line),
                }
            }
        })
        .map(|_| ())
}

/// In-memory sheet that echoes every write.
#[derive(Debug, Default)]
struct ConsoleSheet {
    inner: MemorySheet,
}

impl CellSink for ConsoleSheet {
    fn set_value(&mut self, sheet: &str, pos: CellPos, value: CellValue) {
        match &value {
            CellValue::Empty => {}
            CellValue::Number(dose) => info!("{}!{} <- {:.1} nSv/h", sheet, pos, dose),
            CellValue::Text(text) => info!("{}!{} <- {}", sheet, pos, text),
        }
        self.inner.set_value(sheet, pos, value);
    }

    fn get_value(&self, sheet: &str, pos: CellPos) -> CellValue {
        self.inner.get_value(sheet, pos)
    }
}

/// Terminal bell on completion.
struct BellNotifier;

impl CompletionNotifier for BellNotifier {
    fn notify_complete(&mut self) {
        println!("{}", "🔔 Last sample collected.".bright_green().bold());
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(b"\x07");
        let _ = stdout.flush();
    }
}
