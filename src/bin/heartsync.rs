//! Heartsync CLI - Operator tool for the heart-rate synchronization core
//!
//! Commands:
//! - decode: Decode Heart Rate Measurement notifications given as hex
//! - score: Score a set of readings
//! - encode: Build outbound OSC or actuator payloads
//! - replay: Drive an orchestrator from recorded NDJSON input
//! - simulate: Run a full experience with simulated sensors over UDP
//! - doctor: Diagnose configuration and network health

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, BufRead, Write};
use std::net::{ToSocketAddrs, UdpSocket};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use heartsync::config::OrchestratorConfig;
use heartsync::decoder::decode_heart_rate;
use heartsync::driver::{spawn_sensor_pump, DriverHandles};
use heartsync::encoder::{encode_text_bpm, encode_text_group, OscMessage};
use heartsync::orchestrator::SessionOrchestrator;
use heartsync::scorer::SyncScorer;
use heartsync::sensor::{QueuedSensorLink, SensorEvent, SimulatedSensors};
use heartsync::transport::{MemoryTransport, Outbound, UdpTransport};
use heartsync::types::{ExperienceState, SessionId};
use heartsync::{SyncError, HEARTSYNC_VERSION, PRODUCER_NAME};

/// Heartsync - Group heart-rate synchronization core
#[derive(Parser)]
#[command(name = "heartsync")]
#[command(version = HEARTSYNC_VERSION)]
#[command(about = "Decode, score and broadcast group heart-rate data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode Heart Rate Measurement payloads (hex); reads stdin lines when none are given
    Decode {
        /// Payloads as hex, e.g. 0048 or 012c01
        payloads: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Score a set of readings (0 = silent sensor)
    Score {
        /// Readings in bpm
        #[arg(required = true)]
        bpms: Vec<u16>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build an outbound payload and print it as hex
    Encode {
        /// Player id for a per-player message
        #[arg(long, requires = "bpm", conflicts_with_all = ["group", "address"])]
        player: Option<SessionId>,

        /// Reading for a per-player message
        #[arg(long)]
        bpm: Option<u16>,

        /// Readings for the group bundle, comma separated
        #[arg(long, value_delimiter = ',', conflicts_with = "address")]
        group: Option<Vec<u16>>,

        /// Arbitrary OSC address
        #[arg(long)]
        address: Option<String>,

        /// Integer arguments for --address, comma separated
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        args: Vec<i32>,

        /// Also print the actuator text payload
        #[arg(long)]
        text: bool,

        /// Decode the encoded bytes again and print the parsed message
        #[arg(long)]
        verify: bool,
    },

    /// Replay NDJSON sensor events and control steps through an orchestrator
    Replay {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Orchestrator configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Stop at the first rejected line
        #[arg(long)]
        strict: bool,
    },

    /// Run a whole experience with simulated sensors, sending real UDP packets
    Simulate {
        /// Orchestrator configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the destination host
        #[arg(long)]
        host: Option<String>,

        /// Override the destination port
        #[arg(long)]
        port: Option<u16>,

        /// Override the experience duration in seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Number of simulated players (ignored with --config)
        #[arg(long, default_value = "3")]
        players: u32,

        /// Resting heart rate the players converge to
        #[arg(long, default_value = "72")]
        base_bpm: u16,

        /// Initial spread between players in bpm
        #[arg(long, default_value = "30")]
        spread: u16,

        /// Status line format
        #[arg(long, default_value = "text")]
        output: StatusFormat,
    },

    /// Diagnose configuration and network health
    Doctor {
        /// Configuration file to check
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum StatusFormat {
    /// One human-readable line per second
    Text,
    /// One snapshot per line as JSON
    Ndjson,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), HeartsyncCliError> {
    match cli.command {
        Commands::Decode { payloads, json } => cmd_decode(payloads, json),

        Commands::Score { bpms, json } => cmd_score(&bpms, json),

        Commands::Encode {
            player,
            bpm,
            group,
            address,
            args,
            text,
            verify,
        } => {
            let message = match (player, bpm, group, address) {
                (Some(player), Some(bpm), _, _) => OscMessage::player_bpm(player, bpm),
                (_, _, Some(group), _) => OscMessage::group_bpms(&group),
                (_, _, _, Some(address)) => OscMessage::new(address, args),
                _ => {
                    return Err(HeartsyncCliError::InvalidArgs(
                        "one of --player/--bpm, --group or --address is required".to_string(),
                    ))
                }
            };
            cmd_encode(&message, text, verify)
        }

        Commands::Replay {
            input,
            config,
            strict,
        } => cmd_replay(&input, config.as_deref(), strict),

        Commands::Simulate {
            config,
            host,
            port,
            duration,
            players,
            base_bpm,
            spread,
            output,
        } => {
            let mut config = match config {
                Some(path) => load_config(&path)?,
                None => OrchestratorConfig::with_targets(
                    (0..players).map(|_| uuid::Uuid::new_v4()),
                ),
            };
            if let Some(host) = host {
                config.destination.host = host;
            }
            if let Some(port) = port {
                config.destination.port = port;
            }
            if let Some(duration) = duration {
                config.duration_secs = duration;
            }
            config.validate()?;
            cmd_simulate(config, base_bpm, spread, output)
        }

        Commands::Doctor { config, json } => cmd_doctor(config.as_deref(), json),
    }
}

fn load_config(path: &Path) -> Result<OrchestratorConfig, HeartsyncCliError> {
    let json = fs::read_to_string(path)?;
    Ok(OrchestratorConfig::from_json(&json)?)
}

// ============================================================================
// decode / score / encode
// ============================================================================

fn cmd_decode(payloads: Vec<String>, json: bool) -> Result<(), HeartsyncCliError> {
    let payloads = if !payloads.is_empty() {
        payloads
    } else if atty::is(atty::Stream::Stdin) {
        return Err(HeartsyncCliError::NoInput);
    } else {
        io::stdin()
            .lock()
            .lines()
            .map(|line| line.map(|l| l.trim().to_string()))
            .filter(|line| !matches!(line, Ok(l) if l.is_empty()))
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut stdout = io::stdout();
    for payload in payloads {
        let bytes = hex::decode(payload.trim_start_matches("0x"))?;
        let measurement = decode_heart_rate(&bytes)?;

        if json {
            let record = json!({
                "payload": hex::encode(&bytes),
                "bpm": measurement.bpm,
                "wide_format": measurement.wide_format,
                "sensor_contact": measurement.sensor_contact,
            });
            writeln!(stdout, "{record}")?;
        } else {
            writeln!(
                stdout,
                "{}  {} bpm ({}-bit, contact {:?})",
                hex::encode(&bytes),
                measurement.bpm,
                if measurement.wide_format { 16 } else { 8 },
                measurement.sensor_contact
            )?;
        }
    }

    Ok(())
}

fn cmd_score(bpms: &[u16], json: bool) -> Result<(), HeartsyncCliError> {
    let score = SyncScorer::score(bpms);
    let synchronized = SyncScorer::is_synchronized(score);

    if json {
        let report = json!({
            "readings": bpms,
            "score": score,
            "synchronized": synchronized,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Score: {score:.1}");
        println!("Synchronized: {}", if synchronized { "yes" } else { "no" });
    }
    Ok(())
}

fn cmd_encode(message: &OscMessage, text: bool, verify: bool) -> Result<(), HeartsyncCliError> {
    let bytes = message.encode();
    println!("{}", hex::encode(&bytes));

    if text {
        let payload = match message.args.as_slice() {
            [single] if message.address != heartsync::encoder::GROUP_BPM_ADDRESS => {
                encode_text_bpm(u16::try_from(*single).map_err(|_| {
                    HeartsyncCliError::InvalidArgs(format!("{single} is not a valid bpm"))
                })?)
            }
            args => {
                let bpms = args
                    .iter()
                    .map(|&arg| u16::try_from(arg))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| {
                        HeartsyncCliError::InvalidArgs("arguments are not valid bpms".to_string())
                    })?;
                encode_text_group(&bpms)
            }
        };
        println!("{}", String::from_utf8_lossy(&payload));
    }

    if verify {
        let decoded = OscMessage::decode(&bytes)?;
        println!("{}", serde_json::to_string(&decoded)?);
    }
    Ok(())
}

// ============================================================================
// replay
// ============================================================================

/// Control step in a replay file; sensor events use their own `type` tag
#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ControlStep {
    Connect { player: SessionId },
    ConnectAll,
    Disconnect { player: SessionId },
    Join { player: SessionId },
    Cycle { player: SessionId },
    Start,
    Pause,
    Resume,
    End,
    Reset,
    /// Run one tick at `at_secs` seconds on the replay clock
    Tick { at_secs: i64 },
    Snapshot,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReplayLine {
    Sensor(SensorEvent),
    Control(ControlStep),
}

fn cmd_replay(
    input: &Path,
    config: Option<&Path>,
    strict: bool,
) -> Result<(), HeartsyncCliError> {
    let config = match config {
        Some(path) => load_config(path)?,
        None => OrchestratorConfig::default(),
    };

    let osc = Arc::new(MemoryTransport::new("osc"));
    let actuator = Arc::new(MemoryTransport::new("actuator"));
    let link = Arc::new(QueuedSensorLink::new());
    let orchestrator = SessionOrchestrator::new(
        &config,
        osc.clone(),
        config
            .actuator
            .then(|| actuator.clone() as Arc<dyn Outbound>),
        link.clone(),
    )?;
    let mut events = orchestrator.subscribe();

    let reader: Box<dyn BufRead> = if input.to_string_lossy() == "-" {
        Box::new(io::stdin().lock())
    } else {
        Box::new(io::BufReader::new(fs::File::open(input)?))
    };

    let epoch = Utc::now();
    let mut clock = chrono::Duration::zero();
    let mut stdout = io::stdout();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let line_no = index + 1;

        let result = serde_json::from_str::<ReplayLine>(trimmed)
            .map_err(|e| HeartsyncCliError::ParseError(format!("line {line_no}: {e}")))
            .and_then(|step| {
                apply_replay_step(&orchestrator, step, epoch, &mut clock, &mut stdout)
            });

        if let Err(e) = result {
            if strict {
                return Err(e);
            }
            let rejected = json!({
                "record": "rejected",
                "line": line_no,
                "error": CliError::from(e).message,
            });
            writeln!(stdout, "{rejected}")?;
        }

        while let Ok(event) = events.try_recv() {
            writeln!(stdout, "{}", json!({ "record": "event", "event": event }))?;
        }
        for request in link.drain() {
            writeln!(stdout, "{}", json!({ "record": "link", "request": request }))?;
        }
        for packet in osc.take() {
            let decoded = OscMessage::decode(&packet)?;
            let record = json!({
                "record": "packet",
                "channel": "osc",
                "address": decoded.address,
                "args": decoded.args,
                "hex": hex::encode(&packet),
            });
            writeln!(stdout, "{record}")?;
        }
        for payload in actuator.take() {
            let record = json!({
                "record": "packet",
                "channel": "actuator",
                "text": String::from_utf8_lossy(&payload),
            });
            writeln!(stdout, "{record}")?;
        }
    }

    stdout.flush()?;
    Ok(())
}

fn apply_replay_step(
    orchestrator: &SessionOrchestrator,
    step: ReplayLine,
    epoch: chrono::DateTime<Utc>,
    clock: &mut chrono::Duration,
    stdout: &mut io::Stdout,
) -> Result<(), HeartsyncCliError> {
    let control = match step {
        ReplayLine::Sensor(event) => return Ok(orchestrator.handle_sensor_event(event)?),
        ReplayLine::Control(control) => control,
    };

    match control {
        ControlStep::Connect { player } => orchestrator.connect(player)?,
        ControlStep::ConnectAll => orchestrator.connect_all(),
        ControlStep::Disconnect { player } => orchestrator.disconnect(player)?,
        ControlStep::Join { player } => orchestrator.join_group(player)?,
        ControlStep::Cycle { player } => {
            orchestrator.cycle_elapsed(player)?;
        }
        ControlStep::Start => orchestrator.start_at(epoch + *clock)?,
        ControlStep::Pause => orchestrator.pause()?,
        ControlStep::Resume => orchestrator.resume()?,
        ControlStep::End => orchestrator.end(),
        ControlStep::Reset => orchestrator.reset(),
        ControlStep::Tick { at_secs } => {
            *clock = chrono::Duration::seconds(at_secs);
            orchestrator.tick(epoch + *clock);
        }
        ControlStep::Snapshot => {
            let snapshot = orchestrator.snapshot_at(epoch + *clock);
            writeln!(stdout, "{}", json!({ "record": "snapshot", "snapshot": snapshot }))?;
        }
    }
    Ok(())
}

// ============================================================================
// simulate
// ============================================================================

/// Reading of simulated player `index` after `elapsed` seconds.
///
/// Players start `spread` bpm apart and drift together over the experience.
fn simulated_bpm(base: u16, spread: u16, index: usize, elapsed: u64, duration: u64) -> u16 {
    let progress = (elapsed as f64 / duration.max(1) as f64).min(1.0);
    let amplitude = f64::from(spread) / 2.0 * (1.0 - progress);
    let phase = index as f64 * 2.1 + elapsed as f64 / 7.0;
    let bpm = f64::from(base) + amplitude * phase.sin();
    bpm.round().clamp(40.0, 200.0) as u16
}

fn cmd_simulate(
    config: OrchestratorConfig,
    base_bpm: u16,
    spread: u16,
    output: StatusFormat,
) -> Result<(), HeartsyncCliError> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_simulation(config, base_bpm, spread, output))
}

async fn run_simulation(
    config: OrchestratorConfig,
    base_bpm: u16,
    spread: u16,
    output: StatusFormat,
) -> Result<(), HeartsyncCliError> {
    let transport = Arc::new(UdpTransport::spawn(config.destination.clone()));
    let actuator = Arc::new(MemoryTransport::new("actuator"));
    let (sensors, sensor_events) = SimulatedSensors::new();
    let sensors = Arc::new(sensors);

    let orchestrator = Arc::new(SessionOrchestrator::new(
        &config,
        transport.clone(),
        config
            .actuator
            .then(|| actuator.clone() as Arc<dyn Outbound>),
        sensors.clone(),
    )?);

    let mut drivers = DriverHandles::default();
    drivers.push(spawn_sensor_pump(Arc::clone(&orchestrator), sensor_events));

    orchestrator.connect_all();
    for _ in 0..100 {
        if orchestrator.state() == ExperienceState::Ready {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    if orchestrator.state() != ExperienceState::Ready {
        return Err(HeartsyncCliError::NotReady);
    }

    orchestrator.start()?;
    let mut timed = DriverHandles::spawn(&orchestrator, config.tick_interval());
    log::info!(
        "simulating {} players for {}s towards {}",
        config.players.len(),
        config.duration_secs,
        transport.destination()
    );

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut elapsed = 0u64;
    let mut stdout = io::stdout();
    loop {
        interval.tick().await;
        for (index, player) in config.players.iter().enumerate() {
            let bpm = simulated_bpm(base_bpm, spread, index, elapsed, config.duration_secs);
            sensors.beat(player.target, bpm);
        }

        let snapshot = orchestrator.snapshot();
        match output {
            StatusFormat::Ndjson => writeln!(stdout, "{}", serde_json::to_string(&snapshot)?)?,
            StatusFormat::Text => {
                let readings: Vec<String> = snapshot
                    .sessions
                    .iter()
                    .map(|s| s.last_heart_rate.to_string())
                    .collect();
                writeln!(
                    stdout,
                    "[{:>4}s] {:<8} bpm [{}] sync {:.1}",
                    snapshot.remaining_secs.unwrap_or(0),
                    snapshot.state.as_str(),
                    readings.join(", "),
                    snapshot.sync_score
                )?;
            }
        }
        stdout.flush()?;
        actuator.take();

        if snapshot.state != ExperienceState::Playing {
            break;
        }
        elapsed += 1;
    }

    timed.abort();
    drivers.abort();

    let summary = orchestrator.snapshot().score_summary;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

// ============================================================================
// doctor
// ============================================================================

fn cmd_doctor(config: Option<&Path>, json: bool) -> Result<(), HeartsyncCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Heartsync version {}", HEARTSYNC_VERSION),
    });

    let loaded = match config {
        Some(path) => match fs::read_to_string(path) {
            Ok(content) => match OrchestratorConfig::from_json(&content) {
                Ok(config) => {
                    checks.push(DoctorCheck {
                        name: "config".to_string(),
                        status: CheckStatus::Ok,
                        message: format!("Configuration valid ({} players)", config.players.len()),
                    });
                    Some(config)
                }
                Err(e) => {
                    checks.push(DoctorCheck {
                        name: "config".to_string(),
                        status: CheckStatus::Error,
                        message: e.to_string(),
                    });
                    None
                }
            },
            Err(e) => {
                checks.push(DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Error,
                    message: format!("Cannot read configuration: {}", e),
                });
                None
            }
        },
        None => {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Warning,
                message: "No configuration given, using defaults".to_string(),
            });
            Some(OrchestratorConfig::default())
        }
    };

    if let Some(config) = &loaded {
        let destination = &config.destination;
        let resolved = (destination.host.as_str(), destination.port)
            .to_socket_addrs()
            .map(|mut addrs| addrs.next());
        checks.push(match resolved {
            Ok(Some(addr)) => DoctorCheck {
                name: "destination".to_string(),
                status: CheckStatus::Ok,
                message: format!("{} resolves to {}", destination, addr),
            },
            Ok(None) => DoctorCheck {
                name: "destination".to_string(),
                status: CheckStatus::Error,
                message: format!("{} has no addresses", destination),
            },
            Err(e) => DoctorCheck {
                name: "destination".to_string(),
                status: CheckStatus::Error,
                message: format!("Cannot resolve {}: {}", destination, e),
            },
        });
    }

    checks.push(match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => DoctorCheck {
            name: "udp_socket".to_string(),
            status: CheckStatus::Ok,
            message: match socket.local_addr() {
                Ok(addr) => format!("Bound UDP socket on {}", addr),
                Err(_) => "Bound UDP socket".to_string(),
            },
        },
        Err(e) => DoctorCheck {
            name: "udp_socket".to_string(),
            status: CheckStatus::Error,
            message: format!("Cannot bind UDP socket: {}", e),
        },
    });

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (replay and decode ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: HEARTSYNC_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Heartsync Doctor Report");
        println!("=======================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");
        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(HeartsyncCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Error types

#[derive(Debug)]
enum HeartsyncCliError {
    Io(io::Error),
    Sync(SyncError),
    Json(serde_json::Error),
    Hex(hex::FromHexError),
    NoInput,
    NotReady,
    DoctorFailed,
    InvalidArgs(String),
    ParseError(String),
}

impl From<io::Error> for HeartsyncCliError {
    fn from(e: io::Error) -> Self {
        HeartsyncCliError::Io(e)
    }
}

impl From<SyncError> for HeartsyncCliError {
    fn from(e: SyncError) -> Self {
        HeartsyncCliError::Sync(e)
    }
}

impl From<serde_json::Error> for HeartsyncCliError {
    fn from(e: serde_json::Error) -> Self {
        HeartsyncCliError::Json(e)
    }
}

impl From<hex::FromHexError> for HeartsyncCliError {
    fn from(e: hex::FromHexError) -> Self {
        HeartsyncCliError::Hex(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<HeartsyncCliError> for CliError {
    fn from(e: HeartsyncCliError) -> Self {
        match e {
            HeartsyncCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            HeartsyncCliError::Sync(e) => {
                let (code, hint) = match &e {
                    SyncError::MalformedPayload(_) => (
                        "MALFORMED_PAYLOAD",
                        "Payload must be a flags byte followed by an 8- or 16-bit bpm",
                    ),
                    SyncError::InvalidConfig(_) => {
                        ("INVALID_CONFIG", "Run 'heartsync doctor --config <file>'")
                    }
                    SyncError::InvalidTransition { .. } => {
                        ("INVALID_TRANSITION", "Check the experience state first")
                    }
                    SyncError::UnknownSession(_) => {
                        ("UNKNOWN_SESSION", "Use a player id or sensor from the configuration")
                    }
                    SyncError::NotConnected(_) => {
                        ("NOT_CONNECTED", "Connect the session before sending readings")
                    }
                    SyncError::TransportUnavailable(_) => {
                        ("TRANSPORT_UNAVAILABLE", "Check the destination host and port")
                    }
                    SyncError::MalformedPacket(_) => ("MALFORMED_PACKET", "Check the OSC framing"),
                    SyncError::JsonError(_) => ("JSON_ERROR", "Check JSON syntax"),
                };
                CliError {
                    code: code.to_string(),
                    message: e.to_string(),
                    hint: Some(hint.to_string()),
                }
            }
            HeartsyncCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            HeartsyncCliError::Hex(e) => CliError {
                code: "HEX_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Give payloads as an even number of hex digits".to_string()),
            },
            HeartsyncCliError::NoInput => CliError {
                code: "NO_INPUT".to_string(),
                message: "No payloads given".to_string(),
                hint: Some("Pass payloads as arguments or pipe them on stdin".to_string()),
            },
            HeartsyncCliError::NotReady => CliError {
                code: "NOT_READY".to_string(),
                message: "Simulated sensors did not all connect".to_string(),
                hint: Some("Re-run with RUST_LOG=debug for details".to_string()),
            },
            HeartsyncCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
            HeartsyncCliError::InvalidArgs(msg) => CliError {
                code: "INVALID_ARGS".to_string(),
                message: msg,
                hint: Some("See 'heartsync --help'".to_string()),
            },
            HeartsyncCliError::ParseError(msg) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: msg,
                hint: Some("Each line must be a sensor event or a control step".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_bpm_converges() {
        let early: Vec<u16> = (0..3).map(|i| simulated_bpm(72, 30, i, 0, 180)).collect();
        let late: Vec<u16> = (0..3).map(|i| simulated_bpm(72, 30, i, 180, 180)).collect();

        assert!(SyncScorer::score(&early) < SyncScorer::score(&late));
        assert_eq!(late, vec![72, 72, 72]);
    }

    #[test]
    fn test_replay_line_parsing() {
        let sensor: ReplayLine = serde_json::from_str(
            r#"{"type":"connected","device":"6f1c4a3e-2b1d-4c8e-9a57-0d9f3b2e7a11"}"#,
        )
        .unwrap();
        assert!(matches!(sensor, ReplayLine::Sensor(SensorEvent::Connected { .. })));

        let tick: ReplayLine = serde_json::from_str(r#"{"op":"tick","at_secs":5}"#).unwrap();
        assert!(matches!(
            tick,
            ReplayLine::Control(ControlStep::Tick { at_secs: 5 })
        ));
    }

    #[test]
    fn test_sync_errors_map_to_codes() {
        let error = CliError::from(HeartsyncCliError::from(SyncError::MalformedPayload(
            "empty".to_string(),
        )));
        assert_eq!(error.code, "MALFORMED_PAYLOAD");
        assert!(error.hint.is_some());
    }
}
