use clap::Parser;
use log::info;
use server::network::{Server, ServerConfig};
use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port for players and ring neighbours
    #[arg(short, long, default_value_t = 1026, value_parser = clap::value_parser!(u16).range(1..))]
    tcp_port: u16,

    /// UDP port for player state lookups
    #[arg(short, long, default_value_t = 1027, value_parser = clap::value_parser!(u16).range(1..))]
    udp_port: u16,

    /// Address advertised to the other servers
    #[arg(long, default_value = "127.0.0.1")]
    ip: Ipv4Addr,

    /// Shared peer roster file
    #[arg(long, default_value = "peers.lst")]
    roster: PathBuf,

    /// Directory holding one file per player
    #[arg(long, default_value = "users")]
    users_dir: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let mut server = Server::bind(ServerConfig {
        ip: args.ip,
        tcp_port: args.tcp_port,
        udp_port: args.udp_port,
        roster: args.roster,
        users_dir: args.users_dir,
    })
    .await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
