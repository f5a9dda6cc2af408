// Courier node: runs the router or a peer for one rank of the group.

mod command;
mod config;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use courier_core::protocol::{mint_identity, MessageKind};
use courier_core::{
    AgentConfig, ChatMessage, Control, Event, Payload, PeerAgent, Rank, Recipient, Router,
    ShutdownPolicy, Tag, Transport,
};
use log::{info, warn};
use tokio::sync::mpsc;

use crate::command::{Command, HELP};
use crate::transport::TcpTransport;

const ROUTER_LINK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "courier", version, about = "Relay chat and file transfer over a rank-addressed group")]
struct Args {
    /// This process's rank; the configured router rank runs the directory/relay.
    #[arg(long)]
    rank: Rank,
    /// Config file (default: ~/.config/courier/config.toml, then /etc/courier/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Display name shown to other users.
    #[arg(long)]
    name: Option<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = config::load(args.config.as_deref())?;
    let members = cfg.members()?;

    let rt = tokio::runtime::Runtime::new()?;
    let transport = rt
        .block_on(TcpTransport::start(args.rank, &members))
        .with_context(|| format!("starting transport for rank {}", args.rank))?;

    let result = if args.rank == cfg.router_rank {
        run_router(&rt, transport.clone(), &cfg)
    } else {
        run_peer(&rt, transport.clone(), &cfg, args.name)
    };
    transport.close();
    rt.shutdown_timeout(Duration::from_millis(500));
    result
}

fn run_router(
    rt: &tokio::runtime::Runtime,
    transport: Arc<TcpTransport>,
    cfg: &config::Config,
) -> anyhow::Result<()> {
    let signal_transport = transport.clone();
    rt.spawn(async move {
        if let Err(e) = shutdown_signal().await {
            warn!("signal handler failed: {}", e);
            return;
        }
        let rank = signal_transport.local_rank();
        if let Err(e) = signal_transport.send(Payload::Control(Control::Shutdown), rank, Tag::Cmd) {
            warn!("could not stop the router: {}", e);
        }
    });
    Router::new(transport.local_rank()).serve(transport.as_ref(), cfg.poll_interval())?;
    Ok(())
}

fn run_peer(
    rt: &tokio::runtime::Runtime,
    transport: Arc<TcpTransport>,
    cfg: &config::Config,
    name: Option<String>,
) -> anyhow::Result<()> {
    let rank = transport.local_rank();
    info!("waiting for the router (rank {})", cfg.router_rank);
    if !transport.wait_for_link(cfg.router_rank, ROUTER_LINK_TIMEOUT) {
        bail!("router rank {} is not reachable", cfg.router_rank);
    }

    let display_name = name
        .or_else(|| cfg.display_name.clone())
        .unwrap_or_else(|| format!("User_{}", rank));
    let mut agent_cfg = AgentConfig::new(
        mint_identity(rank),
        display_name,
        cfg.router_rank,
        cfg.download_dir.clone(),
    );
    agent_cfg.chunk_size = cfg.chunk_size;
    agent_cfg.chunk_delay = cfg.chunk_delay();
    agent_cfg.poll_interval = cfg.poll_interval();
    agent_cfg.download_idle_timeout = cfg.download_idle_timeout();

    let (agent, events) = PeerAgent::new(transport, agent_cfg);
    agent.login()?;
    rt.spawn(print_events(agent.clone(), events));
    println!("{}", HELP);

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        let next = rt.block_on(async {
            tokio::select! {
                line = line_rx.recv() => line,
                _ = shutdown_signal() => None,
            }
        });
        let Some(line) = next else { break };
        match command::parse(&line) {
            Ok(None) => {}
            Ok(Some(Command::Quit)) => break,
            Ok(Some(cmd)) => {
                if let Err(e) = execute(&agent, cmd) {
                    println!("error: {}", e);
                }
            }
            Err(e) => println!("{}", e),
        }
    }

    if agent.uploads_in_flight() > 0 {
        println!("waiting for uploads to finish...");
    }
    agent.logout(ShutdownPolicy::Wait)?;
    Ok(())
}

fn execute(agent: &PeerAgent, cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Broadcast(text) => {
            agent.send_message(text, Recipient::All, Default::default())?;
        }
        Command::Dm { rank, text, mode } => {
            agent.send_to_rank(text, rank, mode)?;
        }
        Command::Send { path, rank, mode } => {
            let file_id = agent.send_file(&path, rank, mode)?;
            println!("offered {} to rank {} ({})", path.display(), rank, file_id);
        }
        Command::Accept(rank) => {
            let offer = agent.accept(rank)?;
            println!("accepted {} from rank {}", offer.filename, rank);
        }
        Command::Deny(rank) => {
            let offer = agent.deny(rank)?;
            println!("denied {} from rank {}", offer.filename, rank);
        }
        Command::Users => {
            let users = agent.users();
            println!("{} online:", users.len());
            for peer in users {
                let me = if peer.rank == agent.rank() { " (you)" } else { "" };
                println!("  rank {:>3}  {}  [{}]{}", peer.rank, peer.display_name, peer.identity, me);
            }
        }
        Command::Shutdown => agent.request_shutdown()?,
        Command::Help => println!("{}", HELP),
        Command::Quit => {}
    }
    Ok(())
}

async fn print_events(agent: PeerAgent, mut events: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Chat(msg) => println!("{}", render_chat(&agent, &msg)),
            Event::Presence(peers) => {
                let names: Vec<&str> = peers.iter().map(|p| p.display_name.as_str()).collect();
                println!("* online: {}", names.join(", "));
            }
            Event::OfferReceived { offer, replaced } => {
                if let Some(old) = replaced {
                    println!("* offer of {} from rank {} was replaced", old.filename, old.from_rank);
                }
                println!(
                    "* {} (rank {}) offers {} ({}). /accept {} or /deny {}",
                    name_of(&agent, &offer.from),
                    offer.from_rank,
                    offer.filename,
                    format_size(offer.size),
                    offer.from_rank,
                    offer.from_rank
                );
            }
            Event::TransferStarted { filename, mode, .. } => {
                println!("* sending {} via {}", filename, mode)
            }
            Event::TransferDelivered { filename, report, .. } => println!(
                "* sent {} ({}, {} chunks) via {}{}",
                filename,
                format_size(report.bytes),
                report.chunks,
                report.mode,
                if report.fell_back { " after P2P failed" } else { "" }
            ),
            Event::TransferDenied { filename, .. } => println!("* {} was declined", filename),
            Event::TransferFailed {
                filename, reason, ..
            } => println!("* sending {} failed: {}", filename, reason),
            Event::IncomingFile(meta) => println!(
                "* receiving {} ({}) from {}",
                meta.filename,
                format_size(meta.size),
                name_of(&agent, &meta.from)
            ),
            Event::DownloadComplete(done) => {
                println!("* received {} -> {}", done.filename, done.path.display())
            }
            Event::DownloadFailed { filename, reason } => {
                println!("* receiving {} failed: {}", filename, reason)
            }
        }
    }
}

fn render_chat(agent: &PeerAgent, msg: &ChatMessage) -> String {
    match msg.kind {
        MessageKind::System => format!("[{}] * {}", msg.time_of_day(), msg.content),
        MessageKind::Text => {
            let private = if msg.to.is_broadcast() { "" } else { " (private)" };
            format!(
                "[{}] {}{}: {}",
                msg.time_of_day(),
                name_of(agent, &msg.from),
                private,
                msg.content
            )
        }
    }
}

fn name_of(agent: &PeerAgent, identity: &str) -> String {
    agent
        .users()
        .into_iter()
        .find(|p| p.identity == identity)
        .map(|p| p.display_name)
        .unwrap_or_else(|| identity.to_string())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1000.0 && unit < UNITS.len() - 1 {
        size /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(999), "999 B");
        assert_eq!(format_size(10_000_000), "10.0 MB");
        assert_eq!(format_size(1_500), "1.5 KB");
    }

    #[test]
    fn args_parse() {
        let args = Args::parse_from(["courier", "--rank", "2", "--name", "Alice"]);
        assert_eq!(args.rank, 2);
        assert_eq!(args.name.as_deref(), Some("Alice"));
        assert!(args.config.is_none());
    }
}
