use clap::Parser;
use client::console::StdoutConsole;
use client::network::{Client, ClientConfig};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::BufReader;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tracker IP address
    #[arg(short = 's', long, default_value = "127.0.0.1")]
    tracker_ip: Ipv4Addr,

    /// Tracker UDP port
    #[arg(short = 'p', long, default_value_t = 1026, value_parser = clap::value_parser!(u16).range(1..))]
    tracker_port: u16,

    /// Seconds between automatic saves
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    autosave_secs: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = ClientConfig {
        tracker: SocketAddr::from((args.tracker_ip, args.tracker_port)),
        autosave: Duration::from_secs(args.autosave_secs),
    };

    let mut client = Client::bind(config, StdoutConsole).await?;
    client.run(BufReader::new(tokio::io::stdin())).await?;

    Ok(())
}
