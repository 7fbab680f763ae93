//! Feeder: attaches to grand central and pumps events into a broker as
//! fast as it can. Handy for soak-testing a pipeline end to end.

use clap::Parser;
use eventflow::net::Remote;
use eventflow::{CastMode, EtError, HostSpec, Mode, OpenConfig, GRAND_CENTRAL};
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "feeder", version, about = "Eventflow test producer")]
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

    /// Payload bytes per event
    #[arg(short, long, default_value_t = 1024)]
    size: u64,

    /// Events per batch
    #[arg(short, long, default_value_t = 16)]
    chunk: usize,

    /// First control word stamped on every event
    #[arg(long, default_value_t = 0)]
    control: i32,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("feeder=info".parse().expect("static directive")),
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
    let att = match remote.attach(GRAND_CENTRAL).await {
        Ok(a) => a,
        Err(e) => {
            error!("cannot attach to grand central: {e}");
            return;
        }
    };
    info!(att, chunk = args.chunk, size = args.size, "feeding");

    let payload = vec![0xabu8; args.size as usize];
    let mut sent: u64 = 0;
    let mut mark = Instant::now();

    loop {
        let mut events = match remote
            .new_events(att, Mode::Sleep, args.size, args.chunk, None, false)
            .await
        {
            Ok(evs) => evs,
            Err(EtError::Wakeup) => break,
            Err(e) => {
                error!("new failed: {e}");
                break;
            }
        };
        for ev in &mut events {
            if ev.set_data(&payload).is_err() {
                continue;
            }
            ev.control[0] = args.control;
        }
        if let Err(e) = remote.put_events(att, &events).await {
            error!("put failed: {e}");
            break;
        }
        sent += events.len() as u64;
        if mark.elapsed() >= Duration::from_secs(5) {
            info!(sent, rate = sent / 5, "events/s");
            sent = 0;
            mark = Instant::now();
        }
    }

    let _ = remote.detach(att).await;
    let _ = remote.close().await;
}
