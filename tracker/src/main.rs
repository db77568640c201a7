use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tracker::directory::Directory;
use tracker::network::Tracker;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UDP port to answer lookups on
    #[arg(short, long, default_value_t = 1026, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Server list, one `ip tcp_port udp_port` per line
    #[arg(long, default_value = "servers.lst")]
    servers: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let directory = Directory::load(&args.servers)?;
    let mut tracker = Tracker::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port)), directory).await?;

    tokio::select! {
        result = tracker.run() => result?,
        _ = tokio::signal::ctrl_c() => log::info!("Shutting down tracker"),
    }

    Ok(())
}
