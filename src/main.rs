use std::{
    env,
    fmt,
    fs::File,
    io::{self, stderr, Stderr},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use clap::{ArgGroup, Parser, ValueEnum};
use log::{debug, Level, log_enabled};
use serde::{Deserialize, Serialize};

use fwlib::{
    devices::DeviceCatalog,
    download::{self, DownloadProgress, Downloader},
    firmware::{self, FirmwareClient, FirmwareRecord, DEFAULT_BASE_URL},
    resolver,
    transport::{HttpTransport, RetryPolicy},
};
use progresslib::{ProgressBar, ProgressDrawMode};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const DEFAULT_OUTPUT_DIR: &str = "fw";

/// Create a new progress bar for a download of `len` bytes (or of unknown
/// size). The progress bar is not immediately rendered.
fn create_progress_bar(len: Option<u64>) -> ProgressBar<Stderr> {
    let mut bar = ProgressBar::new(stderr(), len);
    if log_enabled!(Level::Debug) {
        // The escape sequences for the interactive progress bar would clobber
        // log messages.
        bar.set_mode(Some(ProgressDrawMode::Append));
    }

    bar
}

fn print_devices(catalog: &DeviceCatalog) {
    let width = catalog.iter().map(|d| d.name.len()).max().unwrap_or(0);

    for device in catalog.iter() {
        println!("{:width$}  {}", device.name, device.type_code);
    }
}

fn print_listing(records: &[FirmwareRecord]) {
    for (i, record) in records.iter().enumerate() {
        match record.version_label() {
            Some(v) => println!("{:>3}. {} (date: {}, version: {})", i + 1, record.file_name, record.date, v),
            None => println!("{:>3}. {} (date: {})", i + 1, record.file_name, record.date),
        }
    }
}

/// Query every distinct type code in the catalog. Failures are reported and
/// do not stop the scan. An error is only returned if every query failed.
async fn scan(client: &FirmwareClient, catalog: &DeviceCatalog) -> Result<()> {
    let codes = catalog.type_codes();
    let mut failed = 0;

    for &code in &codes {
        println!("Type {} ({}):", code, catalog.names_for(code).join(", "));

        match client.list_firmware(code).await {
            Ok(records) => print_listing(&records),
            Err(e) => {
                failed += 1;
                eprintln!("Failed to list firmware for type {code}: {:#}", anyhow::Error::from(e));
            }
        }
    }

    if !codes.is_empty() && failed == codes.len() {
        return Err(anyhow!("Failed to list firmware for all {} type codes", codes.len()));
    }

    Ok(())
}

/// Download a firmware file, rendering progress to stderr.
async fn download_firmware(downloader: &Downloader, url: &str, path: &Path) -> Result<u64> {
    let mut bar = None;

    let size = downloader.download(url, path, |p: &DownloadProgress| {
        let bar = bar.get_or_insert_with(|| create_progress_bar(p.total_bytes));
        let delta = p.bytes_written.saturating_sub(bar.position());

        if let Err(e) = bar.advance(delta) {
            debug!("Failed to draw progress bar: {e}");
        }
    }).await?;

    if let Some(mut b) = bar {
        b.finish().context("Failed to draw progress bar")?;
    }

    Ok(size)
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => f.write_str("debug"),
            Self::Trace => f.write_str("trace"),
        }
    }
}

/// 1-based position in a firmware listing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct FirmwareIndex(usize);

impl FromStr for FirmwareIndex {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n: usize = s.parse()?;
        if n == 0 {
            return Err(anyhow!("index starts at 1"));
        }

        Ok(Self(n))
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct Config {
    base_url: Option<String>,
    retries: Option<u32>,
    backoff_secs: Option<f64>,
    output_dir: Option<PathBuf>,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push(format!("{PKG_NAME}.conf"));
        p
    })
}

fn load_config_file(user_path: Option<&Path>) -> Result<Option<Config>> {
    let default_path = default_config_path();
    let path = user_path.or(default_path.as_deref());

    match path {
        Some(p) => {
            let file = match File::open(p) {
                Ok(f) => f,
                Err(e) => {
                    return if e.kind() == io::ErrorKind::NotFound {
                        debug!("Config file does not exist: {p:?}");
                        Ok(None)
                    } else {
                        Err(e).context(format!("Could not open file: {p:?}"))
                    };
                }
            };

            let config = serde_json::from_reader(file)
                .context(format!("Could not parse config file: {p:?}"))?;

            Ok(Some(config))
        }
        None => Ok(None),
    }
}

/// Effective settings after merging command-line arguments, environment
/// variables, and the config file.
#[derive(Debug, PartialEq)]
struct Settings {
    base_url: String,
    policy: RetryPolicy,
    output_dir: PathBuf,
}

fn load_settings(opts: &Opts, config: Option<&Config>) -> Result<Settings> {
    let base_url = opts.base_url.clone()
        .or_else(|| config.and_then(|c| c.base_url.clone()))
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());

    let max_retries = opts.retries
        .or_else(|| config.and_then(|c| c.retries))
        .unwrap_or(RetryPolicy::DEFAULT_MAX_RETRIES);

    let backoff_base = match opts.backoff.or_else(|| config.and_then(|c| c.backoff_secs)) {
        Some(secs) => Duration::try_from_secs_f64(secs)
            .with_context(|| format!("Invalid backoff duration: {secs}"))?,
        None => RetryPolicy::DEFAULT_BACKOFF_BASE,
    };

    let output_dir = opts.output_dir.clone()
        .or_else(|| config.and_then(|c| c.output_dir.clone()))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));

    Ok(Settings {
        base_url,
        policy: RetryPolicy::new(max_retries, backoff_base),
        output_dir,
    })
}

/// A simple tool for downloading official 8BitDo firmware files.
#[derive(Debug, Parser)]
#[command(author, version)]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["list_devices", "device", "scan"]),
))]
struct Opts {
    /// List all known devices and their type codes
    #[arg(short, long)]
    list_devices: bool,
    /// Device name (eg. "Ultimate 2C Wireless")
    ///
    /// Exact names and case-insensitive names are accepted, as is any part of
    /// a name that matches only one device. If nothing matches, similar device
    /// names are suggested.
    #[arg(short, long)]
    device: Option<String>,
    /// List available firmware for the device instead of downloading
    ///
    /// Firmware is listed newest first. The numbers shown can be passed to
    /// -i/--index.
    #[arg(long, requires = "device")]
    list_firmware: bool,
    /// Firmware to download (latest if unspecified)
    ///
    /// This is the 1-based position of the firmware in the output of
    /// --list-firmware.
    #[arg(short, long, requires = "device")]
    index: Option<FirmwareIndex>,
    /// List available firmware for every known type code
    #[arg(long)]
    scan: bool,
    /// Directory to save firmware files to
    ///
    /// Files are saved to "<dir>/<device name>/<file name>_<date>.dat". By
    /// default, the directory is "fw" in the current working directory.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
    /// Firmware server URL
    #[arg(long, env = "FWDL_BASE_URL")]
    base_url: Option<String>,
    /// Maximum attempts per request
    ///
    /// Timeouts, connection failures, and server errors (HTTP 5xx) are
    /// retried. Other HTTP errors fail immediately.
    #[arg(long)]
    retries: Option<u32>,
    /// Delay in seconds after the first failed attempt
    ///
    /// The delay doubles after every subsequent failed attempt.
    #[arg(long, value_name = "SECS")]
    backoff: Option<f64>,
    /// Set logging verbosity
    ///
    /// By default, no log messages are printed out. If set to 'debug', log
    /// messages about requests and retries are printed out. If set to 'trace',
    /// server responses and file writes are also printed out. This option
    /// overrides the RUST_LOG environment variable, which would otherwise be
    /// respected if this option was not passed.
    #[arg(value_enum, long)]
    loglevel: Option<LogLevel>,
    /// Config file path
    ///
    /// If unspecified, the default config file path is used. The config file
    /// can store the base URL, retry settings, and output directory.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Some(l) = opts.loglevel {
        env::set_var("RUST_LOG", format!("{PKG_NAME}={l},fwlib={l}"));
    }

    env_logger::init();

    debug!("Arguments: {opts:#?}");

    let catalog = DeviceCatalog::builtin();

    if opts.list_devices {
        print_devices(&catalog);
        return Ok(());
    }

    let config = load_config_file(opts.config.as_deref())?;
    debug!("Config: {config:#?}");

    let settings = load_settings(&opts, config.as_ref())?;
    debug!("Settings: {settings:#?}");

    let transport = HttpTransport::new(settings.policy)
        .context("Could not initialize HTTP client")?
        .on_retry(|n| eprintln!("{n}"));
    let client = FirmwareClient::new(transport.clone(), &settings.base_url);

    if opts.scan {
        return scan(&client, &catalog).await;
    }

    let query = opts.device.as_deref()
        .ok_or_else(|| anyhow!("No device specified"))?;
    let device = resolver::resolve(query, &catalog)?;

    println!("Device: {} (type {})", device.name, device.type_code);

    let records = client.list_firmware(device.type_code).await
        .with_context(|| format!("Failed to list firmware for {:?}", device.name))?;

    if opts.list_firmware {
        print_listing(&records);
        return Ok(());
    }

    let record = firmware::select_firmware(&records, opts.index.map(|i| i.0))
        .ok_or_else(|| match opts.index {
            Some(i) => anyhow!("Firmware index {} is out of range (1-{})", i.0, records.len()),
            None => anyhow!("No firmware available"),
        })?;
    let url = client.download_url(record)
        .ok_or_else(|| anyhow!("Firmware has no download path: {:?}", record.file_name))?;
    let path = download::output_path(&settings.output_dir, &device.name, record);

    println!("Firmware: {} (date: {})", record.file_name, record.date);
    debug!("Download URL: {url}");

    let size = download_firmware(&Downloader::new(transport), &url, &path).await
        .with_context(|| format!("Failed to download firmware: {url}"))?;

    println!("Saved {size} bytes to {path:?}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::CommandFactory;

    use super::*;

    fn parse(args: &[&str]) -> Opts {
        Opts::try_parse_from([PKG_NAME].iter().chain(args)).unwrap()
    }

    #[test]
    fn test_command() {
        Opts::command().debug_assert();
    }

    #[test]
    fn test_firmware_index() {
        assert_eq!("1".parse::<FirmwareIndex>().unwrap(), FirmwareIndex(1));
        assert_eq!("12".parse::<FirmwareIndex>().unwrap(), FirmwareIndex(12));
        assert!("0".parse::<FirmwareIndex>().is_err());
        assert!("-1".parse::<FirmwareIndex>().is_err());
        assert!("latest".parse::<FirmwareIndex>().is_err());
    }

    #[test]
    fn test_action_required() {
        assert!(Opts::try_parse_from([PKG_NAME]).is_err());
        assert!(Opts::try_parse_from([PKG_NAME, "-l", "-d", "x"]).is_err());
        assert!(Opts::try_parse_from([PKG_NAME, "--list-firmware"]).is_err());
        assert!(Opts::try_parse_from([PKG_NAME, "-i", "2", "--scan"]).is_err());

        let opts = parse(&["-d", "Ultimate", "-i", "2"]);
        assert_eq!(opts.device.as_deref(), Some("Ultimate"));
        assert_eq!(opts.index, Some(FirmwareIndex(2)));
    }

    #[test]
    fn test_settings_defaults() {
        let opts = parse(&["--scan", "--base-url", DEFAULT_BASE_URL]);
        let settings = load_settings(&opts, None).unwrap();

        assert_eq!(settings, Settings {
            base_url: DEFAULT_BASE_URL.to_owned(),
            policy: RetryPolicy::default(),
            output_dir: PathBuf::from("fw"),
        });
    }

    #[test]
    fn test_settings_precedence() {
        let config = Config {
            base_url: Some("http://config".to_owned()),
            retries: Some(2),
            backoff_secs: Some(0.5),
            output_dir: Some(PathBuf::from("config_dir")),
        };

        let opts = parse(&["--scan", "--base-url", "http://flag", "--retries", "7"]);
        let settings = load_settings(&opts, Some(&config)).unwrap();

        assert_eq!(settings.base_url, "http://flag");
        assert_eq!(settings.policy, RetryPolicy::new(7, Duration::from_millis(500)));
        assert_eq!(settings.output_dir, PathBuf::from("config_dir"));

        let opts = parse(&["--scan", "--base-url", "http://flag", "--backoff", "3", "-o", "out"]);
        let settings = load_settings(&opts, Some(&config)).unwrap();

        assert_eq!(settings.policy, RetryPolicy::new(2, Duration::from_secs(3)));
        assert_eq!(settings.output_dir, PathBuf::from("out"));
    }

    #[test]
    fn test_settings_invalid_backoff() {
        let opts = parse(&["--scan", "--backoff=-1"]);
        assert!(load_settings(&opts, None).is_err());
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.conf");
        assert!(load_config_file(Some(&missing)).unwrap().is_none());

        let valid = dir.path().join("valid.conf");
        let mut file = File::create(&valid).unwrap();
        file.write_all(br#"{"base_url": "http://localhost:8080", "retries": 3}"#).unwrap();
        drop(file);

        let config = load_config_file(Some(&valid)).unwrap().unwrap();
        assert_eq!(config.base_url.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.retries, Some(3));
        assert_eq!(config.backoff_secs, None);

        let invalid = dir.path().join("invalid.conf");
        std::fs::write(&invalid, "retries = 3").unwrap();
        assert!(load_config_file(Some(&invalid)).is_err());
    }
}
