/* Command line entry point: picks the serial device and printer type,
sets up logging and signal handling, optionally forks, and runs the
server. */

use clap::{ArgAction, Parser};
use print3d::server::Server;
use print3d::{driver, ipc};
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};

const DEFAULT_BAUDRATE: u32 = 250_000;

#[derive(Parser, Debug)]
#[command(
    name = "print3d",
    about = "Print server for serial-attached 3D printers",
    version
)]
struct Args {
    /// The printer serial device to use (any path prefix is cut off)
    #[arg(short, long)]
    device: Option<String>,

    /// The printer type to drive ('help' lists supported printers)
    #[arg(short, long)]
    printer: Option<String>,

    /// Fork the server process to the background
    #[arg(short, long)]
    fork: bool,

    /// Do not fork the server process
    #[arg(short = 'F', long = "no-fork")]
    no_fork: bool,

    /// Start with the platform default device if none could be found
    #[arg(short = 'S', long)]
    force: bool,

    /// Log verbose (repeat for bulk output)
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Log only errors (repeat to disable logging)
    #[arg(short, long, action = ArgAction::Count)]
    quiet: u8,
}

fn log_level(args: &Args) -> LevelFilter {
    match (args.quiet, args.verbose) {
        (q, _) if q >= 2 => LevelFilter::OFF,
        (1, _) => LevelFilter::ERROR,
        (_, 0) => LevelFilter::WARN,
        (_, 1) => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Resolves the serial device id: an explicit argument wins, otherwise
/// the single discovered device is used. Multiple candidates require an
/// explicit pick; none is an error unless `force` allows the platform
/// default.
fn pick_device(device: Option<&str>, force: bool) -> Result<String, String> {
    if let Some(device) = device {
        return Ok(device.rsplit('/').next().unwrap_or(device).to_string());
    }

    let devices = ipc::find_devices()
        .map_err(|e| format!("could not retrieve device list ({})", e))?;
    match devices.len() {
        0 if force => Ok(ipc::DEFAULT_DEVICE_ID.to_string()),
        0 => Err("no devices found, please connect a printer or re-run with '-S'".to_string()),
        1 => Ok(devices.into_iter().next().unwrap()),
        _ => Err(format!(
            "more than one device found, please specify one of: {}",
            devices.join(", ")
        )),
    }
}

fn print_driver_help() {
    println!("Listing supported printer drivers and device models they support.");
    for info in driver::driver_info() {
        println!("* Models supported by driver '{}':", info.name);
        for firmware in info.supported_firmware {
            println!("    {}", firmware);
        }
    }
}

fn run() -> i32 {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(log_level(&args))
        .with_writer(std::io::stderr)
        .init();

    if args.printer.as_deref() == Some("help") {
        print_driver_help();
        return 0;
    }

    let Some(printer) = args.printer.clone() else {
        error!("no printer type given, use --printer (or '--printer help' for a list)");
        return 1;
    };

    let device_id = match pick_device(args.device.as_deref(), args.force) {
        Ok(device_id) => device_id,
        Err(msg) => {
            error!("{}", msg);
            return 1;
        }
    };

    info!(device = %device_id, printer = %printer, "starting print3d server");

    let port_path = format!("/dev/{}", device_id);
    let Some(printer_driver) = driver::create_driver(&printer, &port_path, DEFAULT_BAUDRATE)
    else {
        error!(printer = %printer, "no printer driver found for type");
        return 1;
    };

    // writes to vanished clients must fail locally instead of killing
    // the process
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let mut server = match Server::bind(&device_id, printer_driver) {
        Ok(server) => server,
        Err(e) => {
            error!("could not start server: {}", e);
            return 1;
        }
    };

    let shutdown = server.shutdown_flag();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            error!("could not register signal handler: {}", e);
            return 1;
        }
    }

    if args.fork && !args.no_fork {
        // fork as late as possible, before any lengthy serial operations
        match unsafe { libc::fork() } {
            -1 => {
                error!("could not fork server");
                return 1;
            }
            0 => {
                if unsafe { libc::setsid() } == -1 {
                    error!("could not create new session for forked process");
                    return 1;
                }
            }
            pid => {
                info!(pid, "print server forked to background");
                return 0;
            }
        }
    }

    match server.run() {
        Ok(rv) => rv,
        Err(e) => {
            error!("server failed: {}", e);
            1
        }
    }
}

fn main() {
    std::process::exit(run());
}
