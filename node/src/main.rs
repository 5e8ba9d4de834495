use clap::{Parser, Subcommand};
use log::{info, warn};
use node::{FrameView, GameArgs, Node, NodeConfig};
use shared::{Direction, NodeRole, SnakeState};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, sleep, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local address for the unicast socket
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Name shown in the roster
    #[arg(short, long, default_value = "player")]
    name: String,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Start a new session and act as its MASTER
    Host {
        /// Session name to announce
        #[arg(short, long, default_value = "snake")]
        game: String,

        #[command(flatten)]
        settings: GameArgs,
    },
    /// Join a session announced on the local network
    Join {
        /// Session name to join
        game: String,

        /// Watch without a snake
        #[arg(long)]
        viewer: bool,

        /// Seconds to wait for the session to be announced
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },
    /// List sessions announced on the local network
    List {
        /// Seconds to listen before printing
        #[arg(long, default_value_t = 3)]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = NodeConfig {
        bind_addr: args.bind,
        ..NodeConfig::default()
    };
    let node = Node::bind(config).await?;

    match args.mode {
        Mode::Host { game, settings } => {
            let id = node.host(&game, &args.name, settings.to_config()?).await?;
            println!("Hosting `{}` as player {} on {}", game, id, node.local_addr());
            play(&node).await;
        }
        Mode::Join { game, viewer, wait } => {
            if !wait_for_session(&node, &game, Duration::from_secs(wait)).await {
                node.shutdown().await;
                return Err(format!("no session `{}` announced", game).into());
            }
            let role = if viewer {
                NodeRole::Viewer
            } else {
                NodeRole::Normal
            };
            let id = node.join(&game, &args.name, role).await?;
            println!("Joined `{}` as player {}", game, id);
            play(&node).await;
        }
        Mode::List { wait } => {
            sleep(Duration::from_secs(wait)).await;
            let sessions = node.available_sessions().await;
            if sessions.is_empty() {
                println!("No sessions found");
            }
            for info in sessions {
                let a = &info.announcement;
                println!(
                    "{:<16} {}x{} food {} delay {}ms players {} {} at {}",
                    a.name,
                    a.config.width,
                    a.config.height,
                    a.config.food_static,
                    a.config.state_delay_ms,
                    a.players.len(),
                    if a.can_join { "open" } else { "full" },
                    info.master_addr
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

async fn wait_for_session(node: &Node, game: &str, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        let sessions = node.available_sessions().await;
        if sessions.iter().any(|info| info.announcement.name == game) {
            return true;
        }
        sleep(Duration::from_millis(200)).await;
    }
    false
}

/// Steers from stdin (w/a/s/d, v to spectate) and prints the score board
/// until ctrl-c
async fn play(node: &Node) {
    println!("Steer with w/a/s/d + Enter, v to watch only, ctrl-c to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut status = interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => handle_input(node, line.trim()).await,
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Failed to read input: {}", e);
                    stdin_open = false;
                }
            },
            _ = status.tick() => {
                if let Some(view) = node.view().await {
                    print_scores(&view);
                }
            }
        }
    }
    info!("Leaving session");
}

async fn handle_input(node: &Node, input: &str) {
    let direction = match input {
        "w" => Direction::Up,
        "s" => Direction::Down,
        "a" => Direction::Left,
        "d" => Direction::Right,
        "v" => {
            if let Err(e) = node.spectate().await {
                warn!("Cannot switch to viewer: {}", e);
            }
            return;
        }
        _ => return,
    };
    if let Err(e) = node.steer(direction).await {
        warn!("Steer failed: {}", e);
    }
}

fn print_scores(view: &FrameView) {
    let alive = view
        .snakes
        .iter()
        .filter(|s| s.state == SnakeState::Alive)
        .count();
    println!(
        "tick {:>5} | {} | {} alive | {} food",
        view.tick,
        view.role,
        alive,
        view.food.len()
    );
    for player in &view.players {
        let marker = if player.id == view.local_id { "*" } else { " " };
        println!(
            "  {}{:<12} {:>4} {}",
            marker, player.name, player.score, player.role
        );
    }
}
