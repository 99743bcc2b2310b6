//! RTP-MIDI Session Daemon
//!
//! Accepts AppleMIDI invitations, optionally invites a configured peer,
//! and relays MIDI between every connected session and the local note port.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtpmidi_session::{
    config::AppConfig,
    network::{Dispatcher, Distributor, Listener, MidiSender, ServiceSockets},
    protocol::{PortKind, ProtocolEngine},
    session::Registry,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::load_or_default(args.config.as_deref())?;

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(name = %config.service.name, "Starting RTP-MIDI session service");

    let registry = Arc::new(Registry::new(config.network.max_connections));
    let sync_port = if config.remote.use_control_port {
        PortKind::Control
    } else {
        PortKind::Data
    };
    let engine = Arc::new(
        ProtocolEngine::new(registry.clone(), config.service.name.clone())?
            .with_sync_port(sync_port),
    );
    let sockets = Arc::new(ServiceSockets::bind(&config.network)?);

    let distributor = Distributor::new(registry.clone(), sockets.clone(), config.journal.write)
        .with_max_packet_size(config.network.max_packet_size);
    let mut sender = MidiSender::start(distributor)?;

    let dispatcher = Dispatcher::new(engine.clone(), sockets.clone(), sender.queue())
        .with_feedback(config.journal.send_feedback);
    let mut listener = Listener::new(
        sockets.clone(),
        dispatcher,
        Duration::from_millis(config.network.socket_interval_ms),
    )
    .with_max_packet_size(config.network.max_packet_size);
    listener.start()?;

    if let Some(remote) = &config.remote.connect {
        let addr = remote
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve remote {}", remote))?
            .next()
            .with_context(|| format!("no address for remote {}", remote))?;
        let (_, invitation) = engine.invite(addr)?;
        listener.dispatcher().send_all([invitation]);
    }

    let mut sync_timer =
        tokio::time::interval(Duration::from_secs(config.remote.sync_interval_secs));
    loop {
        tokio::select! {
            _ = sync_timer.tick() => {
                listener.dispatcher().send_all(engine.sync_tick());
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                break;
            }
        }
    }

    tracing::info!("Shutting down");
    listener.dispatcher().send_all(engine.teardown_all());
    listener.stop();
    sender.stop();

    let listener_stats = listener.dispatcher().stats();
    let sender_stats = sender.stats();
    tracing::info!(
        datagrams = listener_stats.datagrams(),
        commands = listener_stats.commands(),
        midi_in = listener_stats.midi_packets(),
        feedback = listener_stats.feedback_sent(),
        midi_out = sender_stats.packets_sent(),
        journal_resets = sender_stats.journal_resets(),
        send_errors = sender_stats.send_errors(),
        "Service stopped"
    );

    Ok(())
}
