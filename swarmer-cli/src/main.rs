use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use ratatui::{crossterm::event, DefaultTerminal};
use swarmer::{
    Session, SessionConfig, TorrentConfig, TorrentCreator, TorrentCreatorConfig, TorrentInfo,
    TorrentViewState, TrackerConfig, TrackerRegistry, TrackerServer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod ui;

#[derive(Debug, Parser)]
#[clap(version, about = "Share files with a swarm of peers")]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download a torrent, then keep seeding it with --seed.
    Run(RunArgs),
    /// Create a .torrent file from a file or directory.
    Create(CreateArgs),
    /// Run an HTTP tracker.
    Tracker(TrackerArgs),
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    torrent: PathBuf,

    /// directory the torrent's files are stored in
    #[clap(long, default_value = ".")]
    root: PathBuf,

    /// peers to connect to, besides the ones trackers hand out
    #[clap(long)]
    peers: Vec<SocketAddr>,

    #[clap(long, default_value = "0.0.0.0:6881")]
    listen: SocketAddr,

    #[clap(long)]
    no_trackers: bool,

    /// address reported to trackers
    #[clap(long)]
    announce_ip: Option<IpAddr>,

    /// keep running once the download completes
    #[clap(long)]
    seed: bool,
}

#[derive(Debug, clap::Args)]
struct CreateArgs {
    path: PathBuf,

    #[clap(long, short)]
    output: PathBuf,

    #[clap(long)]
    announce: Option<String>,

    #[clap(long)]
    name: Option<String>,

    #[clap(long)]
    comment: Option<String>,

    #[clap(long)]
    piece_length: Option<u32>,
}

#[derive(Debug, clap::Args)]
struct TrackerArgs {
    #[clap(long, default_value = "0.0.0.0:6969")]
    listen: SocketAddr,

    /// announce interval in seconds
    #[clap(long, default_value_t = 900)]
    interval: u64,

    #[clap(long, default_value_t = 50)]
    max_peers: usize,

    /// torrents to register up front so scrapes report their names
    #[clap(long)]
    torrents: Vec<PathBuf>,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn main() -> Result<()> {
    let args = Args::parse();
    color_eyre::install()?;

    match args.command {
        Command::Run(args) => {
            tui_logger::init_logger(tui_logger::LevelFilter::Trace)?;
            tracing_subscriber::registry()
                .with(tui_logger::tracing_subscriber_layer())
                .with(env_filter())
                .init();
            let runtime = tokio::runtime::Runtime::new()?;
            let terminal = ratatui::init();
            let result = run(&runtime, args, terminal);
            ratatui::restore();
            result
        }
        Command::Create(args) => {
            init_stderr_logging();
            create(args)
        }
        Command::Tracker(args) => {
            init_stderr_logging();
            tokio::runtime::Runtime::new()?.block_on(tracker(args))
        }
    }
}

fn init_stderr_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(env_filter())
        .init();
}

fn run(runtime: &tokio::runtime::Runtime, args: RunArgs, mut terminal: DefaultTerminal) -> Result<()> {
    let content = std::fs::read(&args.torrent)?;
    let info = TorrentInfo::decode(&content)?;

    let session = runtime.block_on(Session::new_with(SessionConfig {
        listen_addr: Some(args.listen),
        peer_id: None,
    }))?;
    let torrent = runtime.block_on(session.torrent_add_with(
        info,
        TorrentConfig {
            root: args.root,
            use_trackers: !args.no_trackers,
            announce_ip: args.announce_ip,
            port: None,
        },
    ))?;
    for peer in args.peers {
        torrent.connect(peer);
    }

    loop {
        let view = runtime.block_on(torrent.view())?;
        terminal.draw(|frame| ui::render(frame, &view))?;
        if view.state == TorrentViewState::Failed {
            return Err(eyre!("torrent failed, see the log for details"));
        }
        if view.complete() && !args.seed {
            break;
        }
        if event::poll(Duration::from_millis(500))? {
            if let event::Event::Key(key) = event::read()? {
                if matches!(key.code, event::KeyCode::Char('q') | event::KeyCode::Esc) {
                    break;
                }
            }
        }
    }

    torrent.quit();
    // give the `stopped` announce a moment to leave
    runtime.block_on(tokio::time::sleep(Duration::from_millis(500)));
    Ok(())
}

fn create(args: CreateArgs) -> Result<()> {
    let config = TorrentCreatorConfig {
        name: args.name,
        announce: args.announce,
        comment: args.comment,
        piece_length: args.piece_length,
        creator: Some(format!("swarmer {}", env!("CARGO_PKG_VERSION"))),
        ..Default::default()
    };
    let content = TorrentCreator::from_path(&args.path, config)?;
    let info = TorrentInfo::decode(&content)?;
    std::fs::write(&args.output, &content)?;
    tracing::info!(
        name = info.name(),
        info_hash = %info.info_hash(),
        pieces = info.pieces_count(),
        "wrote {}",
        args.output.display()
    );
    Ok(())
}

async fn tracker(args: TrackerArgs) -> Result<()> {
    let registry = TrackerRegistry::new(TrackerConfig {
        interval: Duration::from_secs(args.interval),
        max_peers: args.max_peers,
    });
    let server = TrackerServer::new(registry);
    for path in args.torrents {
        let info = TorrentInfo::decode(&std::fs::read(&path)?)?;
        tracing::info!(name = info.name(), info_hash = %info.info_hash(), "tracking torrent");
        server.track(info.info_hash(), Some(info.name().to_string()));
    }
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    server.serve(listener).await?;
    Ok(())
}
