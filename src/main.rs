use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use printlink::core::event_bus::{CommunicationEvent, EventCategory};
use printlink::core::{AppEvent, CommunicationState, EventFilter};
use printlink::settings::{default_config_path, Config};
use printlink::{build_session, init_logging, job_history_path, resolve_port};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "printlink",
    version = printlink::LONG_VERSION,
    about = "Stream G-code to FDM printers over serial"
)]
struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports that look like printers
    ListPorts,
    /// Print a G-code file
    Print {
        file: PathBuf,
        #[arg(short, long)]
        port: Option<String>,
        #[arg(short, long)]
        baud: Option<u32>,
        /// Name recorded in the job history
        #[arg(long)]
        name: Option<String>,
    },
    /// Send commands and show the replies
    Send {
        #[arg(required = true)]
        lines: Vec<String>,
        #[arg(short, long)]
        port: Option<String>,
        #[arg(short, long)]
        baud: Option<u32>,
        /// How long to keep listening after the last command is acknowledged
        #[arg(long, default_value_t = 2)]
        listen_secs: u64,
    },
    /// Write a default configuration file
    InitConfig {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };

    match cli.command {
        Command::ListPorts => list_ports(),
        Command::InitConfig { force } => {
            if config_path.exists() && !force {
                bail!("{} exists; pass --force to overwrite", config_path.display());
            }
            Config::default().save_to_file(&config_path)?;
            println!("Wrote {}", config_path.display());
            Ok(())
        }
        Command::Print {
            file,
            port,
            baud,
            name,
        } => {
            let config = Config::load_or_default(&config_path)?;
            print(config, config_path, file, port, baud, name).await
        }
        Command::Send {
            lines,
            port,
            baud,
            listen_secs,
        } => {
            let config = Config::load_or_default(&config_path)?;
            send(config, config_path, lines, port, baud, listen_secs).await
        }
    }
}

fn list_ports() -> Result<()> {
    let ports = printlink::communication::list_ports()?;
    if ports.is_empty() {
        println!("No printer ports found");
    }
    for port in ports {
        match &port.manufacturer {
            Some(maker) => println!("{}\t{} ({})", port.port_name, port.description, maker),
            None => println!("{}\t{}", port.port_name, port.description),
        }
    }
    Ok(())
}

async fn print(
    config: Config,
    config_path: PathBuf,
    file: PathBuf,
    port: Option<String>,
    baud: Option<u32>,
    name: Option<String>,
) -> Result<()> {
    let port = resolve_port(port.as_deref(), &config)?;
    let baud = baud.unwrap_or(config.connection.baud_rate);
    let timeout = Duration::from_millis(config.connection.connect_timeout_ms);

    let session = build_session(config, job_history_path(&config_path));
    session.bus().subscribe(
        EventFilter::Categories(vec![
            EventCategory::Connection,
            EventCategory::Job,
            EventCategory::Error,
        ]),
        |event| info!("{}", event.description()),
    );

    session
        .connect_and_wait(&port, baud, timeout)
        .await
        .with_context(|| format!("Could not connect to {}", port))?;
    let link = session.connection().clone();

    link.start_print(&file, name)
        .await
        .with_context(|| format!("Could not start {}", file.display()))?;

    let mut progress = tokio::time::interval(Duration::from_secs(5));
    let canceled = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, canceling print");
                link.stop().await;
                break true;
            }
            _ = progress.tick() => {
                if !link.print_is_active() && link.state() != CommunicationState::PreparingToPrint {
                    break false;
                }
                info!(
                    "{}: {:.1}% ({}s left)",
                    link.status_text(),
                    link.percent_complete(),
                    link.seconds_remaining()
                );
            }
        }
    };

    if canceled {
        // let the cancel snippet drain before releasing the printer
        session
            .wait_for_state(CommunicationState::Connected, Duration::from_secs(60))
            .await;
    }

    let finished = link.state() == CommunicationState::FinishedPrint;
    link.disable().await;
    session.shutdown().await;

    if !finished && !canceled {
        bail!("Print ended early: {}", link.failure_message());
    }
    Ok(())
}

async fn send(
    config: Config,
    config_path: PathBuf,
    lines: Vec<String>,
    port: Option<String>,
    baud: Option<u32>,
    listen_secs: u64,
) -> Result<()> {
    let port = resolve_port(port.as_deref(), &config)?;
    let baud = baud.unwrap_or(config.connection.baud_rate);
    let timeout = Duration::from_millis(config.connection.connect_timeout_ms);

    let session = build_session(config, job_history_path(&config_path));
    session.bus().subscribe(
        EventFilter::Categories(vec![EventCategory::Communication]),
        |event| {
            if let AppEvent::Communication(CommunicationEvent::LineReceived { line }) = event {
                println!("{}", line);
            }
        },
    );

    session
        .connect_and_wait(&port, baud, timeout)
        .await
        .with_context(|| format!("Could not connect to {}", port))?;
    let link = session.connection().clone();

    for line in &lines {
        link.send_line_now(line);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    while link.queued_command_count() > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!("{} commands still queued", link.queued_command_count());
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_secs(listen_secs)).await;

    session.shutdown().await;
    Ok(())
}
