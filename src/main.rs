use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use camera_fleet::beacon::run_beacon_listener;
use camera_fleet::config::{Config, LiveSettings, Settings};
use camera_fleet::error::FleetResult;
use camera_fleet::net::{run_event_loop, MqttTransport};
use camera_fleet::ota::{fetch_latest_firmware, FirmwareTarget};
use camera_fleet::registry::DeviceRegistry;
use camera_fleet::simulate::simulated_context;
use camera_fleet::storage::SqliteCaptureStore;
use camera_fleet::{Fleet, FleetContext, FleetError};

const SETTINGS_RELOAD_SECS: u64 = 10;
const MQTT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "camera-fleet")]
#[command(about = "Dispatch commands to a camera rig and collect the replies", long_about = None)]
struct Cli {
    /// Talk to an in-process simulated fleet instead of the MQTT broker
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as a service: periodic status sweeps and live settings reload
    Serve,
    /// Ask every device for its status once
    Ping,
    /// Query the clock-sync status of every ready device
    TimeSync,
    /// Roll a firmware build out to the fleet
    Update {
        /// Firmware version to install
        #[arg(long, requires = "url", conflicts_with = "manifest_url")]
        firmware_version: Option<String>,

        /// Download URL of the firmware image
        #[arg(long, requires = "firmware_version")]
        url: Option<String>,

        /// Expected checksum of the firmware image
        #[arg(long)]
        checksum: Option<String>,

        /// Ask this endpoint for the latest build instead
        #[arg(long, required_unless_present = "firmware_version")]
        manifest_url: Option<String>,

        /// Also target devices already on that version or with unknown status
        #[arg(long)]
        force: bool,
    },
    /// Take a synchronized picture on every ready camera
    Capture {
        /// Logical capture type, e.g. "standing"
        #[arg(long, default_value = "standard")]
        capture_type: String,

        /// Capture set the request belongs to
        #[arg(long)]
        set: Option<Uuid>,

        /// Lead time in milliseconds, overriding the live setting
        #[arg(long)]
        lead_ms: Option<u64>,
    },
    /// Create an empty capture set and print its id
    CreateSet { name: String },
    /// Transfer the pictures of one capture request off the cameras
    SendRequest { request_id: Uuid },
    /// Transfer every active request of a capture set
    SendSet { set_id: Uuid },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("FLEET_LOG_JSON").map(|v| v == "1").unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    info!(?config, "camera-fleet starting");

    let shutdown = CancellationToken::new();
    let (beacon_tx, beacon_rx) = watch::channel(None);

    let (context, mqtt) = if cli.simulate {
        let ids = DeviceRegistry::with_default_fleet().ids().to_vec();
        let (context, _) = simulated_context(&ids, Settings::default())?;
        info!(devices = ids.len(), "using simulated fleet");
        (context, None)
    } else {
        let (transport, eventloop) = MqttTransport::connect(&config.broker_url, &config.client_id)?;
        let transport = Arc::new(transport);
        let store = Arc::new(SqliteCaptureStore::open(&config.database_path)?);
        let context = FleetContext::new(
            Arc::new(DeviceRegistry::with_default_fleet()),
            transport.clone(),
            store,
            LiveSettings::default(),
        );
        transport.subscribe_replies().await?;
        tokio::spawn(run_event_loop(
            eventloop,
            context.router.clone(),
            MQTT_RETRY_DELAY,
            shutdown.clone(),
        ));

        let group: Ipv4Addr = config
            .beacon_group
            .parse()
            .context("FLEET_BEACON_GROUP is not an IPv4 address")?;
        let beacon_shutdown = shutdown.clone();
        let port = config.beacon_port;
        tokio::spawn(async move {
            if let Err(e) = run_beacon_listener(group, port, beacon_tx, beacon_shutdown).await {
                error!(error = %e, "beacon listener stopped");
            }
        });
        (context, Some(transport))
    };
    context.settings.reload_from_file(&config.settings_path);

    let fleet = Arc::new(Fleet::new(context, config.ping_timeout(), beacon_rx));
    let result = run_command(cli.command, &fleet, &config).await;

    shutdown.cancel();
    if let Some(transport) = mqtt {
        transport.disconnect().await;
    }
    result
}

async fn run_command(command: Commands, fleet: &Arc<Fleet>, config: &Config) -> Result<()> {
    match command {
        Commands::Serve => serve(fleet, config).await,
        Commands::Ping => {
            let summary = interruptible(fleet, fleet.ping.run()).await?;
            println!(
                "{} of {} devices answered",
                summary.replied,
                summary.replied + summary.unreachable.len()
            );
            for device in &summary.unreachable {
                println!("unreachable: {}", device);
            }
            Ok(())
        }
        Commands::TimeSync => {
            refresh(fleet).await?;
            let summary = interruptible(fleet, fleet.time_sync.run()).await?;
            info!(?summary, "time sync finished");
            let states = fleet.context.board.time_sync.snapshot();
            for id in fleet.context.registry.ids() {
                if let Some(state) = states.get(id) {
                    println!("{}\t{:?}", id, state);
                }
            }
            Ok(())
        }
        Commands::Update {
            firmware_version,
            url,
            checksum,
            manifest_url,
            force,
        } => {
            let target = match (firmware_version, url, manifest_url) {
                (Some(version), Some(url), _) => FirmwareTarget {
                    version,
                    url,
                    checksum,
                },
                (_, _, Some(manifest_url)) => {
                    match fetch_latest_firmware(&Client::new(), &manifest_url).await? {
                        Some(target) => target,
                        None => {
                            println!("no firmware update available");
                            return Ok(());
                        }
                    }
                }
                _ => anyhow::bail!("either --firmware-version with --url or --manifest-url is required"),
            };
            refresh(fleet).await?;
            let summary = interruptible(fleet, fleet.update.run(&target, force)).await?;
            println!(
                "update to {}: {} dispatched, {} failed to request",
                target.version, summary.dispatched, summary.failed_to_request
            );
            Ok(())
        }
        Commands::Capture {
            capture_type,
            set,
            lead_ms,
        } => {
            refresh(fleet).await?;
            let pending = fleet
                .capture
                .request_capture(&capture_type, set, lead_ms)
                .await?;
            println!("capture request {} at {}", pending.request.id, pending.request.capture_at);
            let outcome = interruptible(fleet, pending.finished()).await?;
            println!(
                "taken: {}, saved: {}{}",
                outcome.taken,
                outcome.saved,
                if outcome.cancelled { " (cancelled)" } else { "" }
            );
            Ok(())
        }
        Commands::CreateSet { name } => {
            let set = fleet.context.store.create_set(&name).await?;
            println!("{}", set.id);
            Ok(())
        }
        Commands::SendRequest { request_id } => {
            refresh(fleet).await?;
            let summary = interruptible(fleet, fleet.picture_send.run(request_id)).await?;
            println!(
                "{} pictures requested, {} failed to request",
                summary.dispatched, summary.failed_to_request
            );
            Ok(())
        }
        Commands::SendSet { set_id } => {
            refresh(fleet).await?;
            let summary = interruptible(fleet, fleet.picture_set.send_set(set_id)).await?;
            println!(
                "{} requests sent, {} failed, set {}",
                summary.requests,
                summary.failed_requests,
                if summary.completed { "complete" } else { "incomplete" }
            );
            Ok(())
        }
    }
}

/// One-shot commands start from an empty registry; a status sweep tells
/// them who is ready.
async fn refresh(fleet: &Fleet) -> Result<()> {
    let summary = interruptible(fleet, fleet.ping.run()).await?;
    info!(replied = summary.replied, unreachable = summary.unreachable.len(), "fleet status refreshed");
    Ok(())
}

/// Await `work`, cancelling everything on Ctrl-C and then waiting for the
/// run to wind down.
async fn interruptible<T>(fleet: &Fleet, work: impl Future<Output = FleetResult<T>>) -> Result<T> {
    tokio::pin!(work);
    tokio::select! {
        result = &mut work => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling running operations");
            fleet.cancel_all().await;
            Ok(work.await?)
        }
    }
}

async fn serve(fleet: &Arc<Fleet>, config: &Config) -> Result<()> {
    let mut ping_interval = time::interval(Duration::from_secs(config.ping_interval_secs.max(1)));
    let mut settings_interval = time::interval(Duration::from_secs(SETTINGS_RELOAD_SECS));
    let mut events = fleet.context.events.subscribe();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                let fleet = Arc::clone(fleet);
                tokio::spawn(async move {
                    match fleet.ping.run().await {
                        Ok(summary) => debug!(replied = summary.replied, "periodic status sweep done"),
                        Err(FleetError::AlreadyRunning(_)) => debug!("status sweep still running, skipping"),
                        Err(e) => error!(error = %e, "periodic status sweep failed"),
                    }
                });
            }
            _ = settings_interval.tick() => {
                fleet.context.settings.reload_from_file(&config.settings_path);
            }
            event = events.recv() => {
                match event {
                    Ok(event) => debug!(?event, "fleet event"),
                    Err(e) => debug!(error = %e, "fleet event stream lagged"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                fleet.cancel_all().await;
                break;
            }
        }
    }
    Ok(())
}
