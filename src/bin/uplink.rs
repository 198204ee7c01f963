//! Uplink CLI - Command-line interface for Diabetes Uplink
//!
//! Commands:
//! - devices: List known device families
//! - replay: Run a full session against a recorded capture
//! - decode: Decode one frame with a family codec
//! - timezone: Resolve a device-local time in a named zone
//! - doctor: Diagnose configuration and environment

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use diabetes_uplink::codec::astm::AstmCodec;
use diabetes_uplink::codec::ibf::IbfCodec;
use diabetes_uplink::codec::stx::StxCodec;
use diabetes_uplink::codec::sync::SyncCodec;
use diabetes_uplink::codec::{from_hex, to_hex, Decoded, FrameCodec};
use diabetes_uplink::error::{ConfigError, FrameError, StageError, TimezoneError};
use diabetes_uplink::session::FixedClock;
use diabetes_uplink::timezone::{apply_timezone, offset_minutes, parse_timezone};
use diabetes_uplink::transport::{BlockTransport, DeviceDescriptor, ScriptedTransport, Transport, TransportMode};
use diabetes_uplink::types::{format_device_time, format_utc, parse_device_time};
use diabetes_uplink::{
    build_driver, ClinicalEvent, DeltaStore, DeviceManifest, DriverKind, Period, Progress, RecordingUploader,
    SessionConfig, SessionData, SessionOutcome, SessionRunner, PRODUCER_NAME, UPLINK_VERSION,
};

/// Uplink - Acquisition and normalization engine for diabetes devices
#[derive(Parser)]
#[command(name = "uplink")]
#[command(version = UPLINK_VERSION)]
#[command(about = "Read diabetes devices into canonical clinical events", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known device families
    Devices {
        /// Output the manifest as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a full session against a recorded capture and print the events
    Replay {
        /// Device family (e.g. dexcom, bayer, onetouch, insulet)
        #[arg(short, long)]
        family: String,

        /// Capture file: raw file contents for block devices, otherwise one
        /// hex-encoded device response per line
        #[arg(short, long)]
        input: PathBuf,

        /// Session configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// User timezone (IANA format, e.g., "America/New_York")
        #[arg(long)]
        timezone: Option<String>,

        /// Upload period
        #[arg(long, value_enum)]
        period: Option<PeriodArg>,

        /// Delta store to read and update
        #[arg(long)]
        delta_store: Option<PathBuf>,

        /// Reference time the capture was taken at (RFC 3339)
        #[arg(long)]
        now: Option<String>,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,
    },

    /// Decode one hex frame
    Decode {
        /// Frame codec
        #[arg(value_enum)]
        codec: CodecArg,

        /// Frame bytes as hex
        hex: String,
    },

    /// Resolve a device-local time in a named zone
    Timezone {
        /// IANA zone name
        zone: String,

        /// Local time, e.g. 2015-06-01T08:00:00
        local: String,
    },

    /// Diagnose configuration and environment
    Doctor {
        /// Session configuration to validate
        #[arg(long)]
        config: Option<PathBuf>,

        /// Delta store to check
        #[arg(long)]
        delta_store: Option<PathBuf>,

        /// Timezone to check
        #[arg(long, default_value = "UTC")]
        timezone: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PeriodArg {
    /// Every record on the device
    All,
    /// Only records newer than the last upload
    Delta,
}

impl From<PeriodArg> for Period {
    fn from(arg: PeriodArg) -> Self {
        match arg {
            PeriodArg::All => Period::All,
            PeriodArg::Delta => Period::Delta,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CodecArg {
    /// Dexcom sync-byte packets
    Sync,
    /// LifeScan STX/ETX packets
    Stx,
    /// Bayer ASTM frames
    Astm,
    /// Insulet IBF records
    Ibf,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one event per line)
    Ndjson,
    /// JSON array of events
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), UplinkCliError> {
    match cli.command {
        Commands::Devices { json } => cmd_devices(json),

        Commands::Replay {
            family,
            input,
            config,
            timezone,
            period,
            delta_store,
            now,
            output_format,
        } => {
            let mut session = match config {
                Some(path) => SessionConfig::load(&path)?,
                None => SessionConfig::default(),
            };
            if let Some(timezone) = timezone {
                session.timezone = timezone;
            }
            if let Some(period) = period {
                session.period = period.into();
            }
            session.validate()?;
            let now = now.as_deref().map(parse_now).transpose()?;

            let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
            runtime.block_on(cmd_replay(
                &family,
                &input,
                session,
                delta_store.as_deref(),
                now,
                output_format,
            ))
        }

        Commands::Decode { codec, hex } => cmd_decode(codec, &hex),

        Commands::Timezone { zone, local } => cmd_timezone(&zone, &local),

        Commands::Doctor {
            config,
            delta_store,
            timezone,
            json,
        } => cmd_doctor(config.as_deref(), delta_store.as_deref(), &timezone, json),
    }
}

fn cmd_devices(json: bool) -> Result<(), UplinkCliError> {
    let manifest = DeviceManifest::builtin();
    if json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    println!("{:<22} {:<10} {:<10} USB ids", "Family", "Link", "Driver");
    for entry in &manifest.entries {
        let driver = entry.driver().map(|d| d.as_str()).unwrap_or("-");
        let ids: Vec<String> = entry
            .usb
            .iter()
            .map(|id| format!("{:04x}:{:04x}", id.vendor_id, id.product_id))
            .collect();
        println!(
            "{:<22} {:<10} {:<10} {}",
            entry.family,
            entry.mode.as_str(),
            driver,
            ids.join(" ")
        );
    }
    Ok(())
}

async fn cmd_replay(
    family: &str,
    input: &Path,
    config: SessionConfig,
    delta_store: Option<&Path>,
    now: Option<DateTime<Utc>>,
    output_format: OutputFormat,
) -> Result<(), UplinkCliError> {
    let kind = DriverKind::from_name(family).ok_or_else(|| UplinkCliError::UnknownFamily(family.to_string()))?;
    let transport = load_capture(kind, input)?;
    let mut driver = build_driver(kind, transport);

    let device = DeviceDescriptor::new(kind.family());
    let mut data = SessionData::new(config, device);
    if let Some(now) = now {
        data = data.with_clock(Arc::new(FixedClock(now)));
    }

    let mut store = match delta_store {
        Some(path) => DeltaStore::load(path)?,
        None => DeltaStore::new(),
    };
    let uploader = RecordingUploader::new();
    let mut progress = Progress::new(|stage, overall| log::debug!("{} {:.0}%", stage.as_str(), overall));

    let outcome = SessionRunner::run(driver.as_mut(), &mut data, &uploader, &mut store, &mut progress).await?;
    match outcome {
        SessionOutcome::Uploaded {
            count,
            last_end_position,
        } => {
            log::info!("{} events, end position {:?}", count, last_end_position);
            let events = uploader.events().await;
            print!("{}", format_output(&events, &output_format)?);
        }
        SessionOutcome::UpToDate(reason) => {
            log::info!("nothing to upload: {}", reason);
        }
    }

    if let Some(path) = delta_store {
        store.save(path)?;
    }
    Ok(())
}

/// Block families replay the raw file; the rest replay one response per line
fn load_capture(kind: DriverKind, input: &Path) -> Result<Box<dyn Transport>, UplinkCliError> {
    if kind.mode() == TransportMode::Block {
        return Ok(Box::new(BlockTransport::from_bytes(fs::read(input)?)));
    }

    let text = fs::read_to_string(input)?;
    let responses = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(from_hex)
        .collect::<Result<Vec<_>, _>>()?;
    log::info!("replaying {} responses for {}", responses.len(), kind.family());
    Ok(Box::new(ScriptedTransport::new().with_responses(responses)))
}

fn parse_now(raw: &str) -> Result<DateTime<Utc>, UplinkCliError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| UplinkCliError::Timezone(TimezoneError::InvalidTimestamp(raw.to_string())))
}

fn cmd_decode(codec: CodecArg, hex: &str) -> Result<(), UplinkCliError> {
    let bytes = from_hex(hex)?;
    let decoded = match codec {
        CodecArg::Sync => SyncCodec::dexcom().decode(&bytes)?,
        CodecArg::Stx => StxCodec::onetouch().decode(&bytes)?,
        CodecArg::Astm => AstmCodec.decode(&bytes)?,
        CodecArg::Ibf => IbfCodec.decode(&bytes)?,
    };

    let Decoded::Frame { frame, consumed } = decoded else {
        return Err(UplinkCliError::Incomplete(bytes.len()));
    };
    let report = serde_json::json!({
        "descriptor": frame.descriptor,
        "payload": to_hex(&frame.payload),
        "payloadText": String::from_utf8_lossy(&frame.payload),
        "checksum": frame.checksum,
        "consumed": consumed,
        "trailing": bytes.len() - consumed,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_timezone(zone: &str, local: &str) -> Result<(), UplinkCliError> {
    let tz = parse_timezone(zone)?;
    let local_time = parse_device_time(local)
        .ok_or_else(|| UplinkCliError::Timezone(TimezoneError::InvalidTimestamp(local.to_string())))?;
    let utc = apply_timezone(local_time, &tz);

    let report = serde_json::json!({
        "zone": zone,
        "deviceTime": format_device_time(&local_time),
        "time": format_utc(&utc),
        "timezoneOffset": offset_minutes(&utc, &tz),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_doctor(
    config: Option<&Path>,
    delta_store: Option<&Path>,
    timezone: &str,
    json: bool,
) -> Result<(), UplinkCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck::ok("uplink_version", format!("Uplink version {}", UPLINK_VERSION)));

    let manifest = DeviceManifest::builtin();
    let drivers = manifest.entries.iter().filter(|e| e.driver().is_some()).count();
    checks.push(DoctorCheck::ok(
        "manifest",
        format!("{} families known, {} with drivers", manifest.entries.len(), drivers),
    ));

    checks.push(match parse_timezone(timezone) {
        Ok(_) => DoctorCheck::ok("timezone", format!("Timezone {} resolves", timezone)),
        Err(e) => DoctorCheck::error("timezone", e.to_string()),
    });

    if let Some(path) = config {
        checks.push(match SessionConfig::load(path) {
            Ok(config) => DoctorCheck::ok(
                "config",
                format!("Config valid (timezone {}, period {})", config.timezone, config.period.as_str()),
            ),
            Err(e) => DoctorCheck::error("config", e.to_string()),
        });
    }

    if let Some(path) = delta_store {
        let check = if !path.exists() {
            DoctorCheck {
                name: "delta_store".to_string(),
                status: CheckStatus::Warning,
                message: "Delta store does not exist yet; the first upload will be full".to_string(),
            }
        } else {
            match DeltaStore::load(path) {
                Ok(store) => DoctorCheck::ok("delta_store", format!("Delta store valid ({} devices)", store.len())),
                Err(e) => DoctorCheck::error("delta_store", e.to_string()),
            }
        };
        checks.push(check);
    }

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck::ok("stdin", "stdin is a TTY (interactive mode)".to_string())
    } else {
        DoctorCheck::ok("stdin", "stdin is a pipe".to_string())
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: UPLINK_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Uplink Doctor Report");
        println!("====================");
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

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(UplinkCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn format_output(events: &[ClinicalEvent], format: &OutputFormat) -> Result<String, UplinkCliError> {
    match format {
        OutputFormat::Ndjson => {
            let mut lines: Vec<String> = Vec::new();
            for event in events {
                lines.push(serde_json::to_string(event)?);
            }
            Ok(lines.join("\n") + "\n")
        }
        OutputFormat::Json => Ok(serde_json::to_string(events)?),
        OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(events)?),
    }
}

// Error handling

#[derive(Debug)]
enum UplinkCliError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Config(ConfigError),
    Frame(FrameError),
    Timezone(TimezoneError),
    Session(StageError),
    UnknownFamily(String),
    Incomplete(usize),
    DoctorFailed,
}

impl From<std::io::Error> for UplinkCliError {
    fn from(e: std::io::Error) -> Self {
        UplinkCliError::Io(e)
    }
}

impl From<serde_json::Error> for UplinkCliError {
    fn from(e: serde_json::Error) -> Self {
        UplinkCliError::Json(e)
    }
}

impl From<ConfigError> for UplinkCliError {
    fn from(e: ConfigError) -> Self {
        UplinkCliError::Config(e)
    }
}

impl From<FrameError> for UplinkCliError {
    fn from(e: FrameError) -> Self {
        UplinkCliError::Frame(e)
    }
}

impl From<TimezoneError> for UplinkCliError {
    fn from(e: TimezoneError) -> Self {
        UplinkCliError::Timezone(e)
    }
}

impl From<StageError> for UplinkCliError {
    fn from(e: StageError) -> Self {
        UplinkCliError::Session(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<UplinkCliError> for CliError {
    fn from(e: UplinkCliError) -> Self {
        match e {
            UplinkCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            UplinkCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            UplinkCliError::Config(e) => CliError {
                code: "E_INIT".to_string(),
                message: e.to_string(),
                hint: Some("Run 'uplink doctor --config <file>' for details".to_string()),
            },
            UplinkCliError::Frame(e) => CliError {
                code: "FRAME_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check the hex input and the chosen codec".to_string()),
            },
            UplinkCliError::Timezone(e) => CliError {
                code: "E_INIT".to_string(),
                message: e.to_string(),
                hint: Some("Use an IANA zone name and a YYYY-MM-DDTHH:MM:SS time".to_string()),
            },
            UplinkCliError::Session(e) => CliError {
                code: e.source.code().to_string(),
                message: e.to_string(),
                hint: Some(format!("Failed during {}", e.stage.as_str())),
            },
            UplinkCliError::UnknownFamily(family) => CliError {
                code: "UNKNOWN_FAMILY".to_string(),
                message: format!("No driver for device family {}", family),
                hint: Some("Run 'uplink devices' to list families with drivers".to_string()),
            },
            UplinkCliError::Incomplete(len) => CliError {
                code: "INCOMPLETE_FRAME".to_string(),
                message: format!("{} bytes do not hold a complete frame", len),
                hint: Some("Pass the whole frame, including its checksum".to_string()),
            },
            UplinkCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
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

impl DoctorCheck {
    fn ok(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Ok,
            message,
        }
    }

    fn error(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Error,
            message,
        }
    }
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
