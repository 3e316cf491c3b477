// jacquard-cli: host-side demo of the Jacquard tag SDK
//
// Runs the full connection stack against the in-process simulated tag and
// manages the CLI's JSON configuration.

mod config;
mod logging;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use jacquard_core::{
    ConnectedTag, ConnectionState, ConnectionStateStream, Domain, Notification, PeripheralId,
    Request, Response, SimulatedTag, TagManager,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "jacquard")]
#[command(about = "Jacquard BLE tag SDK demo", long_about = None)]
#[command(version)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a simulated tag and exercise commands and notifications
    Simulate(SimulateArgs),
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct SimulateArgs {
    /// MTU the simulated tag negotiates
    #[arg(long, default_value = "185")]
    mtu: u16,
    /// Echo commands to send once connected
    #[arg(short, long, default_value = "3")]
    commands: usize,
    /// Notifications the tag pushes once connected
    #[arg(short, long, default_value = "3")]
    notifications: usize,
    /// Fail the first hello write to show automatic reconnection
    #[arg(long)]
    fail_hello: bool,
    /// Drop the link after the demo traffic and wait for reconnection
    #[arg(long)]
    drop_link: bool,
    /// Never answer the hello request, so the connection times out
    #[arg(long)]
    silent: bool,
    /// Override the connection timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _guard = logging::init(cli.verbose, &config)?;

    match cli.command {
        Commands::Simulate(args) => cmd_simulate(&config, args).await,
        Commands::Config { action } => cmd_config(config, action),
    }
}

async fn cmd_simulate(config: &config::Config, args: SimulateArgs) -> Result<()> {
    let peripheral = PeripheralId::new(Uuid::new_v4());
    let mut tag = SimulatedTag::new(peripheral)
        .with_mtu(args.mtu)
        .with_command_handler(|request| Some(Response::ok(request.id, request.payload.clone())));
    if args.silent {
        tag = tag.with_hello(None);
    }
    let tag = Arc::new(tag);
    tracing::info!("Simulated tag {} at mtu {}", peripheral, args.mtu);

    let mut sdk = config.sdk.clone();
    if let Some(secs) = args.timeout {
        sdk = sdk.with_connection_timeout(secs);
    }
    let manager = TagManager::new(tag.clone(), sdk).context("Invalid SDK configuration")?;
    tag.attach(manager.event_sink());
    if args.fail_hello {
        tag.fail_next_writes(1);
    }

    println!(
        "{} {}",
        "Connecting to simulated tag".bold(),
        peripheral.to_string().bright_cyan()
    );
    let mut states = manager.connect(peripheral).await?;
    let connected = wait_connected(&mut states).await?;
    print_metadata(&connected);

    run_commands(&connected, args.commands).await?;
    run_notifications(&tag, &connected, args.notifications).await?;

    let connected = if args.drop_link {
        println!();
        println!("{}", "Dropping link".bold());
        tag.drop_link();
        let reconnected = wait_connected(&mut states).await?;
        println!(
            "  {} Reconnected (generation {})",
            "✓".green(),
            reconnected.generation()
        );
        reconnected
    } else {
        connected
    };

    println!();
    let mut closing = manager.disconnect(&connected).await?;
    match closing.settled().await {
        Some(state) => println!("{} {}", "Final state:".bold(), state),
        None => println!("{}", "Orchestrator stopped".dimmed()),
    }
    println!(
        "  Link attempts: {}, cancellations: {}",
        tag.connect_count(),
        tag.cancel_count()
    );
    Ok(())
}

/// Print states until the tag is connected; errors other than a timeout are retried by the SDK
async fn wait_connected(states: &mut ConnectionStateStream) -> Result<ConnectedTag> {
    while let Some(state) = states.next().await {
        print_state(&state);
        match state {
            ConnectionState::Connected(tag) => return Ok(tag),
            ConnectionState::Disconnected(Some(e)) if e.is_timeout() => {
                anyhow::bail!("Gave up: {}", e)
            }
            ConnectionState::Disconnected(None) => anyhow::bail!("Disconnected"),
            _ => {}
        }
    }
    anyhow::bail!("Connection state stream ended")
}

fn print_state(state: &ConnectionState) {
    match (state.progress(), state) {
        (Some((step, total)), _) => {
            println!("  {} {}", format!("[{:>2}/{}]", step, total).dimmed(), state)
        }
        (None, ConnectionState::Connected(_)) => println!("  {} {}", "✓".green(), state),
        (None, ConnectionState::Disconnected(Some(_))) => {
            println!("  {} {}", "✗".red(), state.to_string().bright_red())
        }
        (None, _) => println!("  {}", state),
    }
}

fn print_metadata(tag: &ConnectedTag) {
    let metadata = tag.metadata();
    println!();
    println!("{}", "Tag Information".bold());
    println!("  Name:       {}", metadata.name.bright_cyan());
    println!("  Firmware:   {}", metadata.firmware_version);
    println!("  Vendor:     {:#06x}", metadata.vendor_id);
    println!("  Product:    {:#06x}", metadata.product_id);
    println!("  Protocol:   {}", metadata.protocol);
    println!("  MTU:        {}", metadata.mtu);
}

async fn run_commands(tag: &ConnectedTag, count: usize) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    println!();
    println!("{} ({})", "Commands".bold(), count);
    for i in 0..count {
        let payload: Vec<u8> = (0..=i as u8).collect();
        let request = Request::new(Domain::Gear, 7, payload);
        let response = tag
            .enqueue(request)
            .await
            .with_context(|| format!("Command {} failed", i))?;
        println!(
            "  {} #{} {} {}",
            "•".bright_green(),
            response.id,
            response.status,
            hex::encode(&response.payload).dimmed()
        );
    }
    Ok(())
}

async fn run_notifications(sim: &SimulatedTag, tag: &ConnectedTag, count: usize) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    println!();
    println!("{} ({})", "Notifications".bold(), count);
    let mut notifications = tag.subscribe_all();
    for i in 0..count {
        sim.push_notification(&Notification::new(Domain::Gear, 3, vec![i as u8]));
    }
    // pushed before release, delivered in order
    tag.subscriptions_ready();

    for _ in 0..count {
        let item = tokio::time::timeout(Duration::from_secs(1), notifications.recv())
            .await
            .context("Timed out waiting for a notification")?
            .context("Notification stream ended")?;
        let notification = item?;
        println!(
            "  {} {} {}",
            "•".bright_green(),
            notification.kind(),
            hex::encode(&notification.payload).dimmed()
        );
    }
    Ok(())
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<32} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }
    Ok(())
}
