// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ChituLink command-line host for Chitu-firmware Wi-Fi printers.
//
// Entry point. Initialises logging and services, then dispatches one
// subcommand. Device work is blocking and runs on tokio's blocking pool so
// Ctrl-C can abort a transfer or end a status watch.

mod output;
mod services;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use chitulink_core::error::{ChituLinkError, Result};
use chitulink_core::human_errors::humanize_error;
use chitulink_device::{DiscoveryEvent, StatusEvent, TransferEvent};
use chitulink_gcode::CaptureRect;
use chitulink_gcode::writer::default_remote_name;

use services::app_services::AppServices;
use services::data_dir::data_dir;

#[derive(Debug, Parser)]
#[command(name = "chitulink", version, about = "Upload and monitor Chitu-firmware Wi-Fi printers")]
struct Cli {
    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding config.json and devices.json.
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Broadcast for printers on the local networks.
    Discover {
        /// Add every printer found to the device registry.
        #[arg(long)]
        save: bool,
    },
    /// Manage saved printers.
    #[command(subcommand)]
    Devices(DevicesCommand),
    /// Prepare and upload a G-code file.
    Upload(UploadArgs),
    /// Start printing a file already on the printer.
    Print {
        #[command(flatten)]
        target: Target,
        /// Remote file name, e.g. `cube.gcode`.
        file: String,
    },
    Pause(Target),
    Resume(Target),
    /// Stop the current print.
    Cancel(Target),
    /// Show printer status.
    Status {
        #[command(flatten)]
        target: Target,
        /// Keep polling until Ctrl-C.
        #[arg(short, long)]
        watch: bool,
        /// Print the status record as JSON.
        #[arg(long, conflicts_with = "watch")]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
enum DevicesCommand {
    List,
    Add { name: String, address: String },
    Rename { old_name: String, name: String, address: String },
    Remove { name: String },
}

#[derive(Debug, Args)]
struct Target {
    /// Saved device name or IPv4 address.
    #[arg(short, long)]
    device: String,
}

#[derive(Debug, Args)]
struct UploadArgs {
    #[command(flatten)]
    target: Target,
    /// Sliced G-code file.
    gcode: PathBuf,
    /// Remote base name (defaults to the file stem).
    #[arg(short, long)]
    name: Option<String>,
    /// PNG or JPEG preview to embed.
    #[arg(short, long, value_name = "IMAGE")]
    thumbnail: Option<PathBuf>,
    /// Capture rectangle of the preview as `x0,y0,x1,y1`.
    #[arg(long, value_parser = parse_rect, requires = "thumbnail")]
    rect: Option<CaptureRect>,
    /// Start the print once the upload finishes.
    #[arg(short, long)]
    print: bool,
    /// Watch status after starting the print.
    #[arg(short, long, requires = "print")]
    monitor: bool,
}

fn parse_rect(text: &str) -> std::result::Result<CaptureRect, String> {
    let values: Vec<u32> = text
        .split(',')
        .map(|v| v.trim().parse::<u32>().map_err(|e| format!("{v:?}: {e}")))
        .collect::<std::result::Result<_, _>>()?;
    match values[..] {
        [start_x, start_y, end_x, end_y] if end_x > start_x && end_y > start_y => Ok(CaptureRect {
            start_x,
            start_y,
            end_x,
            end_y,
        }),
        [_, _, _, _] => Err("the end corner must lie below and right of the start".into()),
        _ => Err("expected four comma-separated values".into()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("ChituLink starting");

    let result = match AppServices::init(data_dir(cli.data_dir.as_deref())) {
        Ok(services) => run(services, cli.command).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", output::error_report(&humanize_error(&err)));
            ExitCode::FAILURE
        }
    }
}

async fn run(services: AppServices, command: Command) -> Result<()> {
    match command {
        Command::Discover { save } => discover(services, save).await,
        Command::Devices(cmd) => devices(&services, cmd),
        Command::Upload(args) => upload(services, args).await,
        Command::Print { target, file } => {
            blocking(move || {
                let session = services.connect(&target.device)?;
                session.start_print(&file)?;
                println!("Printing {file}");
                Ok(())
            })
            .await
        }
        Command::Pause(target) => simple(services, target, "paused", |s| s.pause()).await,
        Command::Resume(target) => simple(services, target, "resumed", |s| s.resume()).await,
        Command::Cancel(target) => simple(services, target, "cancelled", |s| s.cancel()).await,
        Command::Status {
            target,
            watch,
            json,
        } => {
            let session = {
                let services = services.clone();
                blocking(move || services.connect(&target.device)).await?
            };
            if watch {
                watch_status(&services, session).await
            } else {
                blocking(move || {
                    let poller = services.status_poller(session);
                    let status = poller.poll_once()?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&status)?);
                    } else {
                        println!("{}", output::status_line(&status, poller.remaining_seconds()));
                    }
                    Ok(())
                })
                .await
            }
        }
    }
}

/// Run blocking device work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ChituLinkError::Io(std::io::Error::other(e)))?
}

// -- Discovery --------------------------------------------------------------

async fn discover(services: AppServices, save: bool) -> Result<()> {
    let scanner = Arc::new(services.scanner());
    let events = scanner.subscribe();
    let handle = Arc::clone(&scanner).spawn()?;

    let printer = tokio::task::spawn_blocking(move || {
        for event in events {
            match event {
                DiscoveryEvent::Found(device) => println!("{:<16} {}", device.ip, device.name),
                DiscoveryEvent::Finished(_) => break,
                DiscoveryEvent::Cleared => {}
            }
        }
    });

    let devices = tokio::select! {
        joined = blocking(move || handle.join()) => joined?,
        _ = tokio::signal::ctrl_c() => {
            warn!("discovery interrupted");
            scanner.cancel();
            scanner.devices()
        }
    };
    printer.await.ok();

    if devices.is_empty() {
        println!("No printers found.");
    } else if save {
        let saved = blocking(move || services.remember_devices(&devices)).await?;
        println!("Saved {saved} printer(s).");
    }
    Ok(())
}

// -- Registry ---------------------------------------------------------------

fn devices(services: &AppServices, cmd: DevicesCommand) -> Result<()> {
    match cmd {
        DevicesCommand::List => {
            let devices = services.devices();
            if devices.is_empty() {
                println!("No saved printers. Run `chitulink discover --save`.");
            }
            for (name, address) in devices {
                println!("{name:<24} {address}");
            }
        }
        DevicesCommand::Add { name, address } => services.add_device(&name, &address)?,
        DevicesCommand::Rename {
            old_name,
            name,
            address,
        } => services.rename_device(&old_name, &name, &address)?,
        DevicesCommand::Remove { name } => services.remove_device(&name)?,
    }
    Ok(())
}

// -- Upload -----------------------------------------------------------------

async fn upload(services: AppServices, args: UploadArgs) -> Result<()> {
    let remote_base = match args.name {
        Some(name) => name,
        None => default_remote_name(&args.gcode).ok_or_else(|| {
            ChituLinkError::InvalidFileName(args.gcode.display().to_string())
        })?,
    };

    let prepared = {
        let services = services.clone();
        let gcode = args.gcode.clone();
        let remote_base = remote_base.clone();
        let thumbnail = args.thumbnail.clone();
        let rect = args.rect;
        blocking(move || {
            services.prepare_upload_file(
                &gcode,
                &remote_base,
                thumbnail.as_deref().map(|path| (path, rect)),
            )
        })
        .await?
    };

    let session = {
        let services = services.clone();
        let device = args.target.device.clone();
        blocking(move || services.connect(&device)).await?
    };

    let engine = Arc::new(services.transfer_engine(Arc::clone(&session)));
    let events = engine.subscribe();
    let handle = engine.spawn_upload(prepared, remote_base, services.compressor())?;

    let abort_session = Arc::clone(&session);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting upload");
            abort_session.abort();
        }
    });

    // The event channel closes once the upload thread drops the engine.
    let report = blocking(move || {
        let mut name = String::new();
        for event in events {
            match event {
                TransferEvent::Started { remote_name, .. } => name = remote_name,
                TransferEvent::Progress(percent) => {
                    eprint!("\r{name} {}", output::progress_bar(percent));
                    std::io::stderr().flush().ok();
                }
                TransferEvent::Finished(_) => eprintln!(),
            }
        }
        handle.join()
    })
    .await;
    interrupt.abort();
    let report = report?;

    println!(
        "Uploaded {} ({} bytes, {} resends)",
        report.remote_name, report.bytes, report.resends
    );

    if args.print || services.config().auto_print {
        let remote_name = report.remote_name.clone();
        let printing = Arc::clone(&session);
        blocking(move || printing.start_print(&remote_name)).await?;
        println!("Printing {}", report.remote_name);
        if args.monitor {
            return watch_status(&services, session).await;
        }
    }
    Ok(())
}

// -- Control ----------------------------------------------------------------

async fn simple<F>(services: AppServices, target: Target, done: &'static str, action: F) -> Result<()>
where
    F: FnOnce(&chitulink_device::Session) -> bool + Send + 'static,
{
    blocking(move || {
        let session = services.connect(&target.device)?;
        if !action(session.as_ref()) {
            return Err(ChituLinkError::Busy);
        }
        println!("Print {done}.");
        Ok(())
    })
    .await
}

// -- Status -----------------------------------------------------------------

async fn watch_status(
    services: &AppServices,
    session: Arc<chitulink_device::Session>,
) -> Result<()> {
    let poller = Arc::new(services.status_poller(session));
    let events = poller.subscribe();
    let mut ticker = tokio::time::interval(services.config().poll_interval().max(Duration::from_millis(100)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let polling = Arc::clone(&poller);
                if let Err(err) = blocking(move || polling.poll_once()).await {
                    warn!(error = %err, "status poll failed");
                }
                for event in events.try_iter() {
                    match event {
                        StatusEvent::Updated(status) => {
                            println!("{}", output::status_line(&status, poller.remaining_seconds()));
                        }
                        StatusEvent::PrintStarted { file } => println!("Print started: {file}"),
                        StatusEvent::PrintFinished => println!("Print finished."),
                        StatusEvent::ConnectionLost => {
                            return Err(ChituLinkError::Disconnected);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
