//! Burst Command Send Tool
//!
//! Sends one timed command through the ESP32 bridge and prints the outcome.
//!
//! Usage:
//!   cargo run --example burst_send -- [OPTIONS] [COMMAND]
//!
//! Options:
//!   --port PORT       Serial port (default: the one attached bridge)
//!   --baud RATE       Baud rate (default: 115200)
//!   --config FILE     Load dispatcher settings from a JSON file
//!   --delay SECS      Execution delay in seconds (default: 1.0)
//!   --lead SECS       Lead time in seconds (default: 0)
//!   --targets LIST    Comma-separated device ids (default: 0)
//!   --retries N       Retry budget (default: 3)
//!   --demo            Use the simulated bridge instead of a serial port
//!   --list            List candidate bridge ports and exit

use burstlink_core::config::DispatcherConfig;
use burstlink_core::demo::{SimulatedDevice, SimulationConfig};
use burstlink_core::protocol::{
    detect_bridge, find_bridges, CommandId, CommandRequest, DispatchOutcome, Dispatcher,
    MonotonicClock, TargetSet,
};
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().collect();

    let mut config = DispatcherConfig::default();
    let mut command = "PLAY".to_string();
    let mut delay_secs = 1.0f64;
    let mut lead_secs = 0.0f64;
    let mut targets: Vec<u8> = vec![0];
    let mut retries = None;
    let mut demo = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                if i < args.len() {
                    config.port_name = args[i].clone();
                }
            }
            "--baud" | "-b" => {
                i += 1;
                if i < args.len() {
                    config.baud_rate = parse_arg("--baud", &args[i]);
                }
            }
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    match DispatcherConfig::load(&args[i]) {
                        Ok(loaded) => config = loaded,
                        Err(e) => {
                            eprintln!("Failed to load {}: {}", args[i], e);
                            std::process::exit(1);
                        }
                    }
                }
            }
            "--delay" | "-d" => {
                i += 1;
                if i < args.len() {
                    delay_secs = parse_arg("--delay", &args[i]);
                }
            }
            "--lead" | "-l" => {
                i += 1;
                if i < args.len() {
                    lead_secs = parse_arg("--lead", &args[i]);
                }
            }
            "--targets" | "-t" => {
                i += 1;
                if i < args.len() {
                    targets = parse_arg::<TargetSet>("--targets", &args[i]).ids();
                }
            }
            "--retries" | "-r" => {
                i += 1;
                if i < args.len() {
                    retries = Some(parse_arg("--retries", &args[i]));
                }
            }
            "--demo" => {
                demo = true;
            }
            "--list" => {
                print_ports();
                return;
            }
            "--help" | "-h" => {
                print_help();
                return;
            }
            arg if !arg.starts_with('-') => {
                command = arg.to_string();
            }
            other => {
                eprintln!("Unknown option: {}", other);
                print_help();
                std::process::exit(2);
            }
        }
        i += 1;
    }

    let command: CommandId = match command.parse() {
        Ok(id) => id,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    let mut request = match CommandRequest::with_delay_secs(command, delay_secs) {
        Ok(request) => request.targets(targets),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };
    if lead_secs != 0.0 {
        match std::time::Duration::try_from_secs_f64(lead_secs) {
            Ok(lead) => request = request.lead_time(lead),
            Err(_) => {
                eprintln!("Invalid value for --lead: {}", lead_secs);
                std::process::exit(2);
            }
        }
    }
    if let Some(retries) = retries {
        request = request.retries(retries);
    }

    let outcome = if demo {
        println!("Using simulated bridge");
        let clock = MonotonicClock::new();
        let device = SimulatedDevice::new(clock.clone(), SimulationConfig::default());
        Dispatcher::new(device, clock, config).send(&request)
    } else {
        if config.port_name.is_empty() {
            match detect_bridge() {
                Ok(port) => {
                    if let Some(chip) = port.chip {
                        println!("Found {} bridge on {}", chip, port.name);
                    }
                    config.port_name = port.name;
                }
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        }
        println!("Opening {} @ {} baud", config.port_name, config.baud_rate);
        match Dispatcher::open(config) {
            Ok(mut dispatcher) => dispatcher.send(&request),
            Err(e) => {
                eprintln!("Failed to open port: {}", e);
                std::process::exit(1);
            }
        }
    };

    print_outcome(&outcome);
    if !outcome.is_success() {
        std::process::exit(1);
    }
}

fn print_outcome(outcome: &DispatchOutcome) {
    println!("{:?}: {}", outcome.status, outcome.message);
    for warning in &outcome.warnings {
        println!("  warning: {}", warning);
    }
    match serde_json::to_string_pretty(outcome) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize outcome: {}", e),
    }
}

/// Parse an option value, exiting with usage status on garbage
fn parse_arg<T>(flag: &str, value: &str) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value.parse() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Invalid value for {} {:?}: {}", flag, value, e);
            std::process::exit(2);
        }
    }
}

fn print_ports() {
    let ports = find_bridges();
    if ports.is_empty() {
        println!("No serial ports found");
        return;
    }
    for port in ports {
        let chip = port.chip.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
        match port.usb_id {
            Some((vid, pid)) => println!("{:<16} {:04x}:{:04x}  {}", port.name, vid, pid, chip),
            None => println!("{:<16} {:9}  {}", port.name, "", chip),
        }
    }
}

fn print_help() {
    println!("Burst Command Send Tool");
    println!();
    println!("Usage: burst_send [OPTIONS] [COMMAND]");
    println!();
    println!("COMMAND is a name (RESET, READY, TEST, PLAY, PAUSE) or a code (0xA0, 160)");
    println!();
    println!("Options:");
    println!("  --port, -p PORT     Serial port (default: the one attached bridge)");
    println!("  --baud, -b RATE     Baud rate (default: 115200)");
    println!("  --config, -c FILE   Load dispatcher settings from a JSON file");
    println!("  --delay, -d SECS    Execution delay in seconds (default: 1.0)");
    println!("  --lead, -l SECS     Lead time in seconds (default: 0)");
    println!("  --targets, -t LIST  Comma-separated device ids (default: 0)");
    println!("  --retries, -r N     Retry budget (default: 3)");
    println!("  --demo              Use the simulated bridge");
    println!("  --list              List candidate bridge ports and exit");
    println!("  --help, -h          Show this help");
}
