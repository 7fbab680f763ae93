//! Drainer: creates (or joins) a station, attaches, and consumes events,
//! reporting throughput. The counterpart of `feeder`.

use clap::Parser;
use eventflow::net::Remote;
use eventflow::{
    CastMode, EtError, HostSpec, Mode, Modify, OpenConfig, StationConfig,
};
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "drainer", version, about = "Eventflow test consumer")]
struct Args {
    /// Broker system name
    #[arg(short, long, default_value = "et_sys")]
    name: String,

    /// Broker host (direct TCP, no discovery)
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Broker TCP port
    #[arg(short, long, default_value_t = eventflow::DEFAULT_PORT)]
    port: u16,

    /// Station to create or join
    #[arg(short, long, default_value = "drain")]
    station: String,

    /// Events per batch
    #[arg(short, long, default_value_t = 16)]
    chunk: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("drainer=info".parse().expect("static directive")),
        )
        .init();
    let args = Args::parse();

    let config = OpenConfig {
        host: HostSpec::Host(args.host.clone()),
        cast: CastMode::Direct,
        server_port: args.port,
        wait: Some(Duration::from_secs(10)),
        ..Default::default()
    };

    let remote = match Remote::open(&args.name, &config).await {
        Ok(r) => r,
        Err(e) => {
            error!("cannot open {}: {e}", args.name);
            return;
        }
    };

    let stat = match remote.station_create(&args.station, &StationConfig::default()).await {
        Ok(id) => id,
        Err(EtError::Exists(id)) => id,
        Err(e) => {
            error!("cannot create station {}: {e}", args.station);
            return;
        }
    };
    let att = match remote.attach(stat).await {
        Ok(a) => a,
        Err(e) => {
            error!("cannot attach: {e}");
            return;
        }
    };
    info!(station = %args.station, stat, att, "draining");

    let mut seen: u64 = 0;
    let mut bytes: u64 = 0;
    let mut mark = Instant::now();

    loop {
        // Read-only gets: the broker puts the events back downstream
        // after streaming them.
        match remote.get_events(att, Mode::Sleep, Modify::None, args.chunk).await {
            Ok(events) => {
                seen += events.len() as u64;
                bytes += events.iter().map(|e| e.length).sum::<u64>();
            }
            Err(EtError::Wakeup) => break,
            Err(e) => {
                error!("get failed: {e}");
                break;
            }
        }
        if mark.elapsed() >= Duration::from_secs(5) {
            info!(seen, kb = bytes / 1024, "drained in last 5s");
            seen = 0;
            bytes = 0;
            mark = Instant::now();
        }
    }

    let _ = remote.detach(att).await;
    let _ = remote.close().await;
}
