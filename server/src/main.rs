use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;

use server::network::{Server, ServerConfig};

/// Command-line arguments for the game server binary.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind and advertise to the cluster
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Port to listen on
    #[arg(short, long, default_value = "7300")]
    port: u16,
    /// Registration address of the directory service
    #[arg(short, long, default_value = "127.0.0.1:7100")]
    directory: String,
    /// Maximum number of concurrent client sessions
    #[arg(long, default_value = "64")]
    max_clients: usize,
}

/// Resolves the address this server advertises to the rest of the cluster.
fn advertised_addr(args: &Args) -> String {
    format!("{}:{}", args.host, args.port)
}

/// Resolves the directory service's registration address.
fn directory_addr(args: &Args) -> String {
    args.directory.clone()
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

    let advertised = advertised_addr(&args);
    let config = ServerConfig {
        advertised_addr: Some(advertised.clone()),
        max_clients: args.max_clients,
        ..ServerConfig::default()
    };

    let server = Server::bind(&advertised, config).await?;
    server.register_with_directory(&directory_addr(&args)).await?;

    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
