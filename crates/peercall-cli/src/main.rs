//! # peercall
//!
//! Command-line entry point:
//! - `peercall demo` runs two clients (`alice` and `bob`) over an in-process
//!   bus and prints both call logs.
//! - `peercall config` prints the effective configuration.

use clap::{Args, Parser, Subcommand};
use peercall_common::config::{AppConfig, LoggingConfig};
use peercall_rtc::MediaKind;
use peercall_rtc::soft::SyntheticMediaSource;
use peercall_session::{CallClient, CallEvent, SessionOptions, SessionSnapshot};
use peercall_signaling::{MemoryBus, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peercall", version, about = "Peer-to-peer call signaling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Place a call from alice to bob and print both call logs.
    Demo(DemoArgs),
    /// Print the effective configuration as TOML.
    Config,
}

#[derive(Args)]
struct DemoArgs {
    /// How long the connected call lasts before alice hangs up.
    #[arg(long, default_value_t = 1_000)]
    hangup_after_ms: u64,

    /// Bob never answers; the call ends on the dial timeout.
    #[arg(long)]
    no_answer: bool,

    /// Start the call with the camera on.
    #[arg(long)]
    video: bool,

    /// Bob's capture devices are denied.
    #[arg(long)]
    deny_media: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = peercall_common::config::init()?;

    init_tracing(&config.logging);

    match cli.command {
        Command::Config => print!("{}", config.to_toml()?),
        Command::Demo(args) => run_demo(config, args).await?,
    }
    Ok(())
}

/// `RUST_LOG` wins over the configured filter.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_demo(config: &AppConfig, args: DemoArgs) -> anyhow::Result<()> {
    tracing::info!("Starting peercall demo v{}", env!("CARGO_PKG_VERSION"));

    let bus = MemoryBus::new();
    let transport: Arc<dyn Transport> = Arc::new(bus.clone());

    let mut options = SessionOptions::from_config(config);
    options.media.video |= args.video;

    let bob_source = SyntheticMediaSource::new();
    if args.deny_media {
        bob_source.deny(MediaKind::Audio, true);
        bob_source.deny(MediaKind::Video, true);
    }

    let alice = CallClient::spawn("alice", transport.clone(), options.clone()).await;
    let bob = CallClient::spawn(
        "bob",
        transport,
        options.with_media_source(Arc::new(bob_source)),
    )
    .await;
    log_events(&alice);
    log_events(&bob);

    let call = alice.place_call("bob").await?;
    tracing::info!(call = %call, "Dialing");
    wait_until(&bob, "ringing", Duration::from_secs(5), SessionSnapshot::is_ringing).await?;

    if args.no_answer {
        let limit = config.call.dial_timeout() + Duration::from_secs(5);
        wait_until(&alice, "done dialing", limit, |s| !s.is_dialing()).await?;
    } else {
        bob.answer_call().await?;
        for client in [&alice, &bob] {
            wait_until(client, "connected", Duration::from_secs(10), SessionSnapshot::is_connected)
                .await?;
        }

        tokio::time::sleep(Duration::from_millis(args.hangup_after_ms)).await;
        alice.end_call().await?;
        wait_until(&bob, "hung up", Duration::from_secs(5), |s| {
            s.current_state().is_terminal()
        })
        .await?;
    }

    for client in [&alice, &bob] {
        println!("{} call log:", client.local_id());
        println!("{}", serde_json::to_string_pretty(&client.call_log())?);
    }

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}

async fn wait_until(
    client: &CallClient,
    what: &str,
    limit: Duration,
    done: impl Fn(&SessionSnapshot) -> bool,
) -> anyhow::Result<()> {
    let mut snapshots = client.watch();
    tokio::time::timeout(limit, snapshots.wait_for(|s| done(s)))
        .await
        .map_err(|_| anyhow::anyhow!("{} was not {what} after {limit:?}", client.local_id()))??;
    Ok(())
}

fn log_events(client: &CallClient) {
    let user = client.local_id().clone();
    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CallEvent::IncomingCall(record) => {
                    tracing::info!(%user, peer = %record.peer_user_id, "Ringing");
                }
                CallEvent::StateChanged { identity, from, to } => {
                    tracing::info!(%user, call = %identity, %from, %to, "State changed");
                }
                CallEvent::CallEnded(record) => {
                    tracing::info!(
                        %user,
                        call = %record.identity(),
                        state = %record.call_state,
                        reason = ?record.end_reason,
                        "Call ended"
                    );
                }
                CallEvent::MediaUnavailable { identity, error } => {
                    tracing::warn!(%user, call = %identity, %error, "Media unavailable");
                }
                CallEvent::RemoteTrack { identity, track } => {
                    tracing::info!(%user, call = %identity, kind = ?track.kind, "Remote track");
                }
                CallEvent::ProtocolError(error) => {
                    tracing::warn!(%user, %error, "Protocol error");
                }
                CallEvent::SignalFailed { identity, error } => {
                    tracing::warn!(%user, call = %identity, %error, "Signal failed");
                }
            }
        }
    });
}
