//! Discovery integration tests: a live responder and finder talking
//! over loopback, plus the full discover-then-connect open path.

use eventflow::net::{responder, serve, sock, Remote};
use eventflow::{
    CastMode, EtError, HostSpec, OpenConfig, ResponsePolicy, System, SystemConfig,
};
use std::time::Duration;

fn discovery_config(udp_port: u16) -> OpenConfig {
    OpenConfig {
        host: HostSpec::Local,
        cast: CastMode::Broadcast,
        policy: ResponsePolicy::First,
        udp_port,
        tries: 3,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn responder_answers_matching_requests_only() {
    let udp_port = 46001;
    tokio::spawn(async move {
        let _ = responder("disco_sys".into(), udp_port, Vec::new(), 15999).await;
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Garbage and wrong names go unanswered; the retry budget runs out.
    let mut wrong = discovery_config(udp_port);
    wrong.tries = 1;
    assert_eq!(
        eventflow::net::find_broker("other_sys", &wrong).await.unwrap_err(),
        EtError::Timeout
    );

    let response = eventflow::net::find_broker("disco_sys", &discovery_config(udp_port))
        .await
        .expect("response");
    assert_eq!(response.port, 15999);
    assert!(!response.addrs.is_empty());
    assert!(response.cast_ip.is_empty());
    assert_eq!(response.uname, eventflow::net::uname());
    if let Some(bcasts) = &response.bcasts {
        assert_eq!(bcasts.len(), response.addrs.len());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_via_discovery_reaches_the_broker() {
    let udp_port = 46002;
    let system = System::new(SystemConfig {
        name: "disco_open".into(),
        nevents: 16,
        event_size: 512,
        udp_port,
        ..Default::default()
    })
    .expect("system");

    let listener = sock::tcp_listen(0, 0, 0).await.expect("listen");
    let tcp_port = listener.local_addr().expect("addr").port();
    {
        let system = system.clone();
        tokio::spawn(async move {
            let _ = serve(system, listener).await;
        });
    }
    tokio::spawn(async move {
        let _ = responder("disco_open".into(), udp_port, Vec::new(), tcp_port).await;
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let remote = Remote::open("disco_open", &discovery_config(udp_port))
        .await
        .expect("open via discovery");
    assert!(remote.alive().await.expect("alive"));
    assert_eq!(remote.nevents(), 16);
    remote.close().await.expect("close");
}
