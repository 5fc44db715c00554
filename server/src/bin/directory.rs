use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;

use server::directory::{Directory, DirectoryConfig};

/// Command-line arguments for the directory service daemon.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the listeners on
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Port for server registration and control
    #[arg(short, long, default_value = "7100")]
    port: u16,
    /// Port for the one-shot client assignment endpoint
    #[arg(short, long, default_value = "7101")]
    assign_port: u16,
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

    let registration = format!("{}:{}", args.host, args.port);
    let assignment = format!("{}:{}", args.host, args.assign_port);
    let directory = Directory::bind(&registration, &assignment, DirectoryConfig::default()).await?;

    tokio::select! {
        _ = directory.run() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
