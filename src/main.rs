//! Eventflow broker binary: create the event system, start the UDP
//! discovery responder and the TCP server, and run until ctrl-c or a
//! remote kill.

use clap::Parser;
use eventflow::net::{responder, serve, sock};
use eventflow::{System, SystemConfig, DEFAULT_PORT};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "eventflow", version, about = "Eventflow: event transfer broker")]
struct Args {
    /// System name; clients must quote it to discover or connect
    #[arg(short, long, default_value = "et_sys")]
    name: String,

    /// TCP server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// UDP discovery port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    udp_port: u16,

    /// Multicast groups to answer discovery on (comma-separated)
    #[arg(short, long)]
    mcast: Option<String>,

    /// Number of events in the pool
    #[arg(short = 'e', long, default_value_t = 2048)]
    nevents: usize,

    /// Size of each event buffer in bytes
    #[arg(short = 's', long, default_value_t = 4096)]
    event_size: u64,

    /// Per-group event quotas (comma-separated, must sum to nevents)
    #[arg(short, long)]
    groups: Option<String>,

    /// Budget of simultaneously oversized events
    #[arg(long, default_value_t = 64)]
    temp_max: usize,
}

fn parse_list<T: std::str::FromStr>(s: &str) -> Option<Vec<T>> {
    s.split(',').map(|p| p.trim().parse().ok()).collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("eventflow=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();

    let mcast_addrs: Vec<Ipv4Addr> = match &args.mcast {
        Some(s) => match parse_list(s) {
            Some(list) => list,
            None => {
                error!("invalid multicast address list");
                return;
            }
        },
        None => Vec::new(),
    };
    let groups: Vec<usize> = match &args.groups {
        Some(s) => match parse_list(s) {
            Some(list) => list,
            None => {
                error!("invalid group quota list");
                return;
            }
        },
        None => Vec::new(),
    };

    let config = SystemConfig {
        name: args.name.clone(),
        nevents: args.nevents,
        event_size: args.event_size,
        groups,
        temp_max: args.temp_max,
        tcp_port: args.port,
        udp_port: args.udp_port,
        mcast_addrs: mcast_addrs.clone(),
        ..Default::default()
    };

    info!("Eventflow broker v{VERSION}");
    let system = match System::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("invalid configuration: {e}");
            return;
        }
    };

    let listener = match sock::tcp_listen(args.port, 0, 0).await {
        Ok(l) => l,
        Err(e) => {
            error!("cannot open TCP port {}: {e}", args.port);
            return;
        }
    };

    // Discovery responder
    {
        let name = args.name.clone();
        let udp_port = args.udp_port;
        let tcp_port = args.port;
        tokio::spawn(async move {
            if let Err(e) = responder(name, udp_port, mcast_addrs, tcp_port).await {
                error!("discovery responder stopped: {e}");
            }
        });
    }

    // TCP server
    {
        let system = system.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(system, listener).await {
                error!("server stopped: {e}");
            }
        });
    }

    // Heartbeat and periodic status
    {
        let system = system.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            let mut ticks: u64 = 0;
            loop {
                interval.tick().await;
                system.beat();
                ticks += 1;
                if ticks % 30 == 0 {
                    let census = system.census();
                    info!(
                        stations = system.station_count(),
                        attachments = system.attachment_count(),
                        free = census.central_new,
                        used = census.central_used,
                        in_flight = census.attached,
                        "status"
                    );
                }
            }
        });
    }

    info!(
        name = %args.name,
        tcp = args.port,
        udp = args.udp_port,
        "broker running"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
        _ = system.notify_kill.notified() => info!("killed by client"),
    }
    system.kill();
}
