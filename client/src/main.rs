use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use env_logger::Builder;
use log::{info, warn, LevelFilter};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::Write;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;

use client::game::Bot;
use client::network::{fetch_assignment, ServerSession, SessionEvent};
use shared::Grid;

/// Command-line arguments for the bot client.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Assignment address of the directory service
    #[arg(short, long, default_value = "127.0.0.1:7101")]
    directory: String,
    /// Number of updates to submit before disconnecting
    #[arg(short, long, default_value = "50")]
    actions: u32,
    /// Updates per second
    #[arg(short, long, default_value = "2.0")]
    rate: f64,
    /// Hit points of the spawned unit
    #[arg(long, default_value = "10")]
    hit_points: i32,
}

fn init_logger() {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}",
                record.level(),
                record.args()
            )
        })
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger();
    let args = Args::parse();

    let (master_addr, replica_addr) = fetch_assignment(&args.directory).await?;
    info!(
        "assigned master {} and replica {}",
        master_addr,
        replica_addr.as_deref().unwrap_or("none")
    );

    let mirror = Arc::new(Mutex::new(Grid::new()));
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SessionEvent>();

    let (session, client_id) =
        ServerSession::connect_master(&master_addr, Arc::clone(&mirror), events_tx.clone()).await?;

    // The standby session only matters for load balancing and failover; a
    // refused, missing or dying replica is not fatal, so its events are
    // discarded.
    let (standby_tx, _) = mpsc::unbounded_channel::<SessionEvent>();
    let _bootstrap = match &replica_addr {
        Some(addr) => match ServerSession::connect_bootstrap(addr, client_id, standby_tx).await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("bootstrap with {} failed: {}", addr, e);
                None
            }
        },
        None => None,
    };

    let mut bot = Bot::new(client_id, args.hit_points);
    let mut rng = StdRng::from_entropy();
    let mut ticker = interval(Duration::from_secs_f64(1.0 / args.rate));
    let mut submitted = 0u32;

    while submitted < args.actions {
        tokio::select! {
            _ = ticker.tick() => {
                let update = {
                    let grid = mirror.lock().await;
                    bot.next_update(&grid, &mut rng)
                };
                info!("submitting {:?} at ({}, {})", update.kind, update.target.x, update.target.y);
                session.submit(update);
                submitted += 1;
            }
            Some(event) = events_rx.recv() => match event {
                SessionEvent::Committed(update) => {
                    info!("committed {:?} by client {}", update.kind, update.origin);
                }
                SessionEvent::Cell { target, entity } => {
                    info!("cell ({}, {}): {:?}", target.x, target.y, entity);
                }
                SessionEvent::Closed => {
                    warn!("connection lost, giving up");
                    return Ok(());
                }
            }
        }
    }

    // Give in-flight broadcasts a moment before reporting.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let grid = mirror.lock().await;
    info!(
        "done: {} updates submitted, {} entities on the field",
        submitted,
        grid.len()
    );

    Ok(())
}
