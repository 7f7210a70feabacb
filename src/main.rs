//! crget - a Campbell datalogger access utility.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crget::clock;
use crget::download::{self, DownloadOptions};

const DEFAULT_DEVICE: &str = "/dev/logger";
const DEFAULT_PORT: u16 = 2030;

#[derive(Parser, Debug)]
#[command(
    name = "crget",
    version,
    about = "A Campbell Datalogger access utility",
    after_help = "Environment variables:\n  \
        MODEM_INITSTRING  Init string sent to the modem after reset (default ATM1L0)\n  \
        VERBOSE_OUTPUT    Enable extra diagnostics\n  \
        HIDE_DOWNLOADBAR  Suppress the download progress bar\n  \
        DEBUG_HANGUP      Trace the modem hangup sequence"
)]
struct Args {
    /// Communicate using the given serial device
    #[arg(short = 'd', value_name = "DEVICE", conflicts_with_all = ["port", "force_inet"])]
    device: Option<String>,

    /// Connect to the datalogger using the given TCP/IP port
    #[arg(short = 'p', value_name = "PORT")]
    port: Option<u16>,

    /// Location to begin reading from; may also name a file holding it
    #[arg(short = 'l', value_name = "LOCATION")]
    location: Option<String>,

    /// Use the given security code
    #[arg(short = 'c', value_name = "CODE")]
    security_code: Option<String>,

    /// Output to the given file (- for stdout)
    #[arg(short = 'o', value_name = "FILE")]
    output: Option<String>,

    /// Don't update the datalogger's clock
    #[arg(short = 'C')]
    no_clock_update: bool,

    /// Force interpretation of the datalogger location as an Internet address
    #[arg(short = 'i')]
    force_inet: bool,

    /// Quiet operation (disables all messages)
    #[arg(short = 'q')]
    quiet: bool,

    /// IP address or phone number of the datalogger
    #[arg(value_name = "ADDRESS")]
    target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Serial,
    Modem,
    Tcp,
}

/// A positional made of digits and dashes is a phone number, as is anything
/// containing a dial-string pause; everything else is a host.
fn classify_target(target: &str) -> Mode {
    for c in target.chars() {
        if c.is_ascii_digit() || c == '-' {
            continue;
        }
        if c == ',' {
            return Mode::Modem;
        }
        return Mode::Tcp;
    }
    Mode::Modem
}

/// The `-l` argument: a readable file containing the start location, or the
/// location itself. When it was a file, the path is kept so the new end
/// location can be written back after a successful run.
fn resolve_location(arg: &str) -> Result<(Option<u32>, Option<PathBuf>), String> {
    if let Ok(text) = fs::read_to_string(arg) {
        let value = text.split_whitespace().next().and_then(|t| t.parse().ok());
        if let Some(v) = value {
            debug!("reading position out of '{arg}': {v}");
        }
        return Ok((value, Some(PathBuf::from(arg))));
    }
    match arg.parse::<u32>() {
        Ok(v) => Ok((Some(v), None)),
        Err(_) => Err(format!("no valid position entered: {arg}")),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.quiet {
        "error"
    } else if std::env::var_os("VERBOSE_OUTPUT").is_some() {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(io::stderr)
        .init();

    let mode = match (&args.device, args.port.is_some() || args.force_inet, &args.target) {
        (Some(_), _, Some(_)) => Mode::Modem,
        (Some(_), _, None) => Mode::Serial,
        (None, true, Some(_)) => Mode::Tcp,
        (None, true, None) => {
            error!("a host is required with -p or -i");
            return ExitCode::FAILURE;
        }
        (None, false, Some(target)) => classify_target(target),
        (None, false, None) => Mode::Serial,
    };

    let (start_location, location_file) = match &args.location {
        Some(arg) => match resolve_location(arg) {
            Ok(resolved) => resolved,
            Err(err) => {
                error!("{err}");
                return ExitCode::FAILURE;
            }
        },
        None => (None, None),
    };

    let device = args.device.clone().unwrap_or_else(|| DEFAULT_DEVICE.into());
    let port = args.port.unwrap_or(DEFAULT_PORT);
    let target = args.target.clone().unwrap_or_default();

    let stamp = clock::time_stamp();
    match mode {
        Mode::Serial => info!("--{stamp}--  getting data from serial device at {device}"),
        Mode::Modem => info!("--{stamp}--  getting data via modem {device} from logger at {target}"),
        Mode::Tcp => info!("--{stamp}--  getting data via TCP/IP connection to {target}:{port}"),
    }

    let out_name = match &args.output {
        Some(name) => name.clone(),
        None => {
            let stamp = clock::date_stamp();
            match mode {
                Mode::Serial => format!("logger_data-{stamp}"),
                Mode::Modem | Mode::Tcp => format!("logger_data-{target}-{stamp}"),
            }
        }
    };

    let mut output: Box<dyn Write> = if out_name == "-" {
        info!("           => (standard output)");
        Box::new(io::stdout())
    } else {
        info!("           => '{out_name}'");
        match OpenOptions::new().append(true).create(true).open(&out_name) {
            Ok(f) => Box::new(f),
            Err(err) => {
                error!("could not open '{out_name}': {err}");
                return ExitCode::FAILURE;
            }
        }
    };

    let opts = DownloadOptions {
        security_code: args.security_code.clone(),
        update_clock: !args.no_clock_update,
        start_location,
    };

    let result = match mode {
        Mode::Serial => download::download_serial(&mut output, &device, &opts),
        Mode::Modem => download::download_modem(&mut output, &target, &device, &opts),
        Mode::Tcp => download::download_tcpip(&mut output, &target, port, &opts),
    };

    match result {
        Ok(end_location) => {
            let stamp = clock::time_stamp();
            if out_name == "-" {
                info!("--{stamp}--  data download successful => (standard output)");
            } else {
                info!("--{stamp}--  data download successful => '{out_name}'");
            }
            if let Some(path) = &location_file {
                debug!("writing back the end location to '{}'", path.display());
                if let Err(err) = fs::write(path, end_location.to_string()) {
                    error!("could not write '{}': {err}", path.display());
                    return ExitCode::FAILURE;
                }
            }
            debug!("end location: {end_location}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            info!("--{}--  data download failed", clock::time_stamp());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digits_and_dashes_dial_a_modem() {
        assert_eq!(classify_target("555-0100"), Mode::Modem);
        assert_eq!(classify_target("18005550100"), Mode::Modem);
    }

    #[test]
    fn dial_pause_still_means_modem() {
        assert_eq!(classify_target("9,5550100"), Mode::Modem);
    }

    #[test]
    fn hostnames_go_over_tcp() {
        assert_eq!(classify_target("logger.example.net"), Mode::Tcp);
        assert_eq!(classify_target("10.0.0.5"), Mode::Tcp);
    }

    #[test]
    fn location_file_round_trip() {
        let dir = std::env::temp_dir().join("crget-location-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("location");

        fs::write(&path, "500").unwrap();
        let (value, file) = resolve_location(path.to_str().unwrap()).unwrap();
        assert_eq!(value, Some(500));
        assert_eq!(file.as_deref(), Some(path.as_path()));

        // What a successful run persists is the bare end location.
        fs::write(&path, 900u32.to_string()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "900");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn bare_integer_location() {
        let (value, file) = resolve_location("12345").unwrap();
        assert_eq!(value, Some(12345));
        assert!(file.is_none());
    }

    #[test]
    fn garbage_location_is_rejected() {
        assert!(resolve_location("not-a-location-or-file").is_err());
    }
}
