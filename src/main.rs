//! serterm command line front end
//!
//! Reads lines from stdin. A line that is one of the verbs below controls the
//! session; anything else is transmitted.
//!
//! | Line | Action |
//! |------|--------|
//! | open / close / reopen | Port control |
//! | status | One-line session summary |
//! | set <field> <value> | Change a setting |
//! | settings | Show all settings |
//! | ports | List serial ports |
//! | help | Show verbs |
//! | quit | Save settings and exit |

use std::env;
use std::io::{self, BufRead};
use std::sync::mpsc::Receiver;
use std::thread;

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use serterm::config::{self, Settings, SettingsChange, SettingsStore, FIELDS};
use serterm::core::port::{self, SystemPortOpener};
use serterm::core::session::{SerialSession, SessionTimings};
use serterm::printer::Printer;

/// Command line overrides
#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    port: Option<String>,
    baud: Option<String>,
    format: Option<String>,
}

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Receive format word shapes, with one accepted example of each
const FORMAT_WORDS: &str = "[count][x|b]<type>[x|b] or [count]ch|char";
const FORMAT_EXAMPLES: [&str; 4] = ["2xu16", "u32b", "f64", "8char"];

fn print_version() {
    eprintln!("serterm {}", VERSION);
}

fn print_help() {
    eprintln!("serterm {} - A serial port terminal", VERSION);
    eprintln!();
    eprintln!("Usage: serterm [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -p, --port <NAME>     Serial port (COM7, /dev/ttyUSB0)");
    eprintln!("  -b, --baud <RATE>     Baud rate");
    eprintln!("  -f, --format <SPEC>   Receive format, \"str\" for raw text");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Transmit literals:");
    eprintln!("  0x48 0b1010 0d10 255  Hex, binary, decimal");
    eprintln!("  4x0F 12b1             Explicit bit widths");
    eprintln!("  anything else         Sent as ASCII text");
    eprintln!();
    eprintln!("Receive format words: {}", FORMAT_WORDS);
    eprintln!("  types: u8..u256 i8..i256 f32 f64");
    eprintln!("  e.g.:  {}", FORMAT_EXAMPLES.join(" "));
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  serterm -p COM7 -b 115200");
    eprintln!("  serterm -p /dev/ttyUSB0 -f \"2xu16 f32\"");
    eprintln!();
    eprintln!("Configuration: ~/.serterm/config.toml");
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            flag @ ("-p" | "--port" | "-b" | "--baud" | "-f" | "--format") => {
                i += 1;
                let value = args
                    .get(i)
                    .cloned()
                    .ok_or_else(|| format!("Missing argument for {}", flag))?;
                match flag {
                    "-p" | "--port" => parsed.port = Some(value),
                    "-b" | "--baud" => parsed.baud = Some(value),
                    _ => parsed.format = Some(value),
                }
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(parsed)
}

/// A line typed at the prompt
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Open,
    Close,
    Reopen,
    Status,
    Set { field: &'a str, value: &'a str },
    Settings,
    Ports,
    Help,
    Quit,
    Transmit(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    let trimmed = line.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "open" => return Command::Open,
        "close" => return Command::Close,
        "reopen" => return Command::Reopen,
        "status" => return Command::Status,
        "settings" => return Command::Settings,
        "ports" => return Command::Ports,
        "help" => return Command::Help,
        "quit" | "exit" => return Command::Quit,
        _ => {}
    }

    if let Some(rest) = trimmed.strip_prefix("set ") {
        let rest = rest.trim_start();
        let (field, value) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        if config::field(field).is_some() {
            return Command::Set {
                field,
                value: value.trim(),
            };
        }
    }

    Command::Transmit(line)
}

fn print_verbs(printer: &mut Printer<io::Stdout>) -> io::Result<()> {
    printer.plain("open | close | reopen | status | settings | ports | quit")?;
    let names: Vec<&str> = FIELDS.iter().map(|f| f.name).collect();
    printer.plain(&format!("set <{}> <value>", names.join("|")))
}

/// Push settings changes into the running session
fn apply_changes(
    changes: &Receiver<SettingsChange>,
    store: &SettingsStore,
    session: &SerialSession,
) {
    for change in changes.try_iter() {
        match change {
            SettingsChange::Connection => {
                // Failures were already reported on the event channel
                let _ = session.reconfigure(store.settings().port_config());
            }
            SettingsChange::Format => {
                session.set_format(&store.settings().format);
            }
        }
    }
}

fn init_logging() {
    let log_path = config::data_dir()
        .map(|dir| dir.join("serterm.log"))
        .unwrap_or_else(|| std::path::PathBuf::from("serterm.log"));

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut store = SettingsStore::new(Settings::load());
    if let Some(port) = &args.port {
        store.set("port", port)?;
    }
    if let Some(baud) = &args.baud {
        store.set("baud", baud)?;
    }
    if let Some(format) = &args.format {
        store.set("format", format)?;
    }
    let changes = store.subscribe();

    let settings = store.settings().clone();
    let (session, events) = SerialSession::new(
        Box::new(SystemPortOpener),
        settings.port_config(),
        &settings.format,
        SessionTimings::default(),
    );

    let printer_thread = thread::Builder::new()
        .name("event-printer".to_string())
        .spawn(move || {
            let mut printer = Printer::new(io::stdout());
            for event in events {
                if let Err(e) = printer.event(&event) {
                    error!("Failed to print event: {}", e);
                    break;
                }
            }
        })?;

    let mut printer = Printer::new(io::stdout());
    printer.info(&format!("serterm {} - type 'help' for commands", VERSION))?;
    printer.plain(&session.status_line())?;

    for line in io::stdin().lock().lines() {
        let line = line?;
        match parse_command(&line) {
            Command::Open => {
                let _ = session.open();
            }
            Command::Close => session.close(),
            Command::Reopen => {
                let _ = session.reopen();
            }
            Command::Status => printer.plain(&session.status_line())?,
            Command::Set { field, value } => match store.set(field, value) {
                Ok(_) => apply_changes(&changes, &store, &session),
                Err(e) => printer.error(&e.to_string())?,
            },
            Command::Settings => {
                for (label, value) in store.describe() {
                    printer.plain(&format!("{:<20} {}", label, value))?;
                }
            }
            Command::Ports => match port::available_ports() {
                Ok(names) if names.is_empty() => printer.warning("No serial ports found")?,
                Ok(names) => printer.plain(&names.join("\n"))?,
                Err(e) => printer.error(&e.to_string())?,
            },
            Command::Help => print_verbs(&mut printer)?,
            Command::Quit => break,
            Command::Transmit(message) => match session.transmit(message) {
                Ok(0) => printer.warning("Port is not open")?,
                // Sent bytes and failures arrive as events
                Ok(_) | Err(_) => {}
            },
        }
    }

    if let Err(e) = store.settings().save() {
        error!("{}", e);
        printer.error(&e.to_string())?;
    }

    drop(session);
    let _ = printer_thread.join();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let argv: Vec<String> = env::args().collect();
    let args = match parse_args(&argv) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    init_logging();
    info!("serterm {} starting...", VERSION);

    let result = run(args);
    if let Err(e) = &result {
        error!("serterm exited with error: {:#}", e);
    }
    info!("serterm exiting");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("serterm")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_args() {
        let args = parse_args(&argv(&["-p", "COM7", "--baud", "115200", "-f", "2u16"])).unwrap();
        assert_eq!(args.port.as_deref(), Some("COM7"));
        assert_eq!(args.baud.as_deref(), Some("115200"));
        assert_eq!(args.format.as_deref(), Some("2u16"));

        assert_eq!(parse_args(&argv(&[])).unwrap(), Args::default());
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse_args(&argv(&["-p"])).is_err());
        assert!(parse_args(&argv(&["--bogus"])).is_err());
    }

    #[test]
    fn test_help_format_examples_are_valid() {
        let spec = FORMAT_EXAMPLES.join(" ");
        assert_eq!(serterm::codec::validate(&spec), vec![false; FORMAT_EXAMPLES.len()]);
        assert!(!FORMAT_WORDS.contains("|c]"));
    }

    #[test]
    fn test_parse_verbs() {
        assert_eq!(parse_command("open"), Command::Open);
        assert_eq!(parse_command("  CLOSE "), Command::Close);
        assert_eq!(parse_command("reopen"), Command::Reopen);
        assert_eq!(parse_command("status"), Command::Status);
        assert_eq!(parse_command("settings"), Command::Settings);
        assert_eq!(parse_command("ports"), Command::Ports);
        assert_eq!(parse_command("quit"), Command::Quit);
    }

    #[test]
    fn test_parse_set() {
        assert_eq!(
            parse_command("set format 2xu16 f32"),
            Command::Set { field: "format", value: "2xu16 f32" }
        );
        assert_eq!(parse_command("set baud 19200"), Command::Set { field: "baud", value: "19200" });
        assert_eq!(parse_command("set format"), Command::Set { field: "format", value: "" });
    }

    #[test]
    fn test_everything_else_is_transmitted() {
        assert_eq!(parse_command("0x48 0x65"), Command::Transmit("0x48 0x65"));
        assert_eq!(parse_command("open sesame"), Command::Transmit("open sesame"));
        assert_eq!(parse_command("set the table"), Command::Transmit("set the table"));
        assert_eq!(parse_command(" hello "), Command::Transmit(" hello "));
    }
}
