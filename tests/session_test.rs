//! Remote-session integration tests: handshake, event transfer over
//! TCP, crash restoration, and cooperative wakeup, all against a real
//! broker on loopback.

use eventflow::net::{serve, sock, Remote};
use eventflow::{
    CastMode, EtError, HostSpec, Mode, Modify, OpenConfig, Priority, RestoreMode, StationConfig,
    System, SystemConfig, GRAND_CENTRAL,
};
use std::sync::Arc;
use std::time::Duration;

async fn start_broker(name: &str, nevents: usize) -> (Arc<System>, u16) {
    let system = System::new(SystemConfig {
        name: name.into(),
        nevents,
        event_size: 2048,
        temp_max: 4,
        ..Default::default()
    })
    .expect("system");

    let listener = sock::tcp_listen(0, 0, 0).await.expect("listen");
    let port = listener.local_addr().expect("addr").port();
    let sys = system.clone();
    tokio::spawn(async move {
        let _ = serve(sys, listener).await;
    });
    (system, port)
}

fn direct(port: u16) -> OpenConfig {
    OpenConfig {
        host: HostSpec::Host("127.0.0.1".into()),
        cast: CastMode::Direct,
        server_port: port,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_and_system_queries() {
    let (_system, port) = start_broker("hs_test", 32).await;
    let remote = Remote::open("hs_test", &direct(port)).await.expect("open");

    assert_eq!(remote.nevents(), 32);
    assert_eq!(remote.event_size(), 2048);
    assert!(remote.alive().await.expect("alive"));
    remote.wait_for_alive().await.expect("wait alive");
    assert_eq!(remote.system_pid().await.expect("pid"), std::process::id());
    assert_eq!(remote.system_stations().await.expect("stations"), 1);
    assert_eq!(remote.system_group_count().await.expect("groups"), 1);
    assert_eq!(remote.system_group_quotas().await.expect("quotas"), vec![32]);
    remote.close().await.expect("close");

    // Asking for a system by the wrong name is refused outright.
    assert!(Remote::open("no_such_sys", &direct(port)).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_modify_round_trip_is_byte_exact() {
    let (system, port) = start_broker("rt_test", 32).await;
    let remote = Remote::open("rt_test", &direct(port)).await.expect("open");

    let stat = remote
        .station_create("mirror", &StationConfig::default())
        .await
        .expect("station");
    let producer = remote.attach(GRAND_CENTRAL).await.expect("gc");
    let consumer = remote.attach(stat).await.expect("att");

    let payload: Vec<u8> = (0..1200u32).map(|i| ((i * 7) % 251) as u8).collect();
    let mut ev = remote
        .new_event(producer, Mode::Sleep, 1200)
        .await
        .expect("new");
    ev.set_data(&payload).expect("data");
    ev.priority = Priority::High;
    ev.byteorder = 0x04030201;
    ev.control = [5, -1, 7, 0, 0, 9];
    remote.put_event(producer, &ev).await.expect("put");

    let got = remote
        .get_event(consumer, Mode::Sleep, Modify::Full)
        .await
        .expect("get");
    assert_eq!(got.length, 1200);
    assert_eq!(got.data, payload);
    assert_eq!(got.priority, Priority::High);
    assert_eq!(got.byteorder, 0x04030201);
    assert_eq!(got.control, [5, -1, 7, 0, 0, 9]);

    remote.put_event(consumer, &got).await.expect("put back");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(system.central_used_count(), 1);
    assert_eq!(
        remote.attachment_events_get(consumer).await.expect("counter"),
        1
    );
    assert_eq!(
        remote.attachment_events_make(producer).await.expect("counter"),
        1
    );
    remote.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_only_batch_get_is_auto_put() {
    let (system, port) = start_broker("ro_test", 64).await;
    let remote = Remote::open("ro_test", &direct(port)).await.expect("open");

    let stat = remote
        .station_create("tap", &StationConfig::default())
        .await
        .expect("station");
    let producer = remote.attach(GRAND_CENTRAL).await.expect("gc");
    let consumer = remote.attach(stat).await.expect("att");

    let mut events = remote
        .new_events(producer, Mode::Sleep, 256, 10, None, false)
        .await
        .expect("new");
    for (i, ev) in events.iter_mut().enumerate() {
        ev.set_data(&vec![i as u8; 256]).expect("data");
    }
    remote.put_events(producer, &events).await.expect("put");

    let mut seen = 0;
    while seen < 10 {
        let got = remote
            .get_events(consumer, Mode::Sleep, Modify::None, 4)
            .await
            .expect("get");
        seen += got.len();
    }

    // The broker puts read-only events back itself; nothing stays
    // checked out and everything drains to grand central.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let census = system.census();
    assert_eq!(census.attached, 0);
    assert_eq!(census.central_used, 10);
    assert_eq!(census.total(), 64);
    remote.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broken_session_restores_events_to_input_head() {
    let (system, port) = start_broker("crash_test", 32).await;
    let remote = Remote::open("crash_test", &direct(port)).await.expect("open");

    let stat = remote
        .station_create(
            "fragile",
            &StationConfig {
                restore_mode: RestoreMode::Input,
                ..Default::default()
            },
        )
        .await
        .expect("station");
    let producer = remote.attach(GRAND_CENTRAL).await.expect("gc");

    let mut events = remote
        .new_events(producer, Mode::Sleep, 64, 10, None, false)
        .await
        .expect("new");
    for (i, ev) in events.iter_mut().enumerate() {
        ev.set_data(&[i as u8; 64]).expect("data");
        ev.control[0] = i as i32;
    }
    remote.put_events(producer, &events).await.expect("put");

    // A second client takes five events for full modification, then its
    // connection dies without a put.
    let doomed = Remote::open("crash_test", &direct(port)).await.expect("open 2");
    let victim = doomed.attach(stat).await.expect("att");
    let taken = doomed
        .get_events(victim, Mode::Sleep, Modify::Full, 5)
        .await
        .expect("get");
    let taken_ids: Vec<i32> = taken.iter().map(|e| e.control[0]).collect();
    assert_eq!(taken_ids, vec![0, 1, 2, 3, 4]);
    drop(doomed);

    // The server notices the dead socket and detaches on its behalf,
    // restoring the five to the head of the input.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(system.station(stat).expect("station").lists().input.len(), 10);

    let successor = remote.attach(stat).await.expect("successor");
    let replay = remote
        .get_events(successor, Mode::Sleep, Modify::None, 10)
        .await
        .expect("replay");
    let replay_ids: Vec<i32> = replay.iter().map(|e| e.control[0]).collect();
    assert_eq!(replay_ids, (0..10).collect::<Vec<i32>>());
    remote.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wake_attachment_unwinds_remote_sleep_get() {
    let (_system, port) = start_broker("wake_test", 16).await;
    let remote = Arc::new(Remote::open("wake_test", &direct(port)).await.expect("open"));

    let stat = remote
        .station_create("silent", &StationConfig::default())
        .await
        .expect("station");
    let consumer = remote.attach(stat).await.expect("att");

    let r = remote.clone();
    let getter = tokio::spawn(async move {
        let started = std::time::Instant::now();
        let out = r.get_event(consumer, Mode::Sleep, Modify::Full).await;
        (out, started.elapsed())
    });

    tokio::time::sleep(Duration::from_millis(700)).await;
    remote.wake_attachment(consumer).await.expect("wake");

    let (out, elapsed) = getter.await.expect("join");
    assert_eq!(out.unwrap_err(), EtError::Wakeup);
    assert!(elapsed < Duration::from_secs(10));
    remote.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn station_surface_over_the_wire() {
    let (_system, port) = start_broker("stat_test", 16).await;
    let remote = Remote::open("stat_test", &direct(port)).await.expect("open");

    let config = StationConfig {
        prescale: 2,
        cue: 8,
        function: "filter_fn".into(),
        lib: "libfilters".into(),
        class: "Filters".into(),
        select_mode: eventflow::SelectMode::Match,
        select: [1, -1, -1, -1, -1, 2],
        ..Default::default()
    };
    let stat = remote.station_create("shaped", &config).await.expect("create");

    assert_eq!(
        remote.station_create("shaped", &config).await.unwrap_err(),
        EtError::Exists(stat)
    );
    assert_eq!(remote.station_exists("shaped").await.expect("exists"), Some(stat));
    assert_eq!(remote.station_exists("ghost").await.expect("exists"), None);

    assert_eq!(remote.station_prescale(stat).await.expect("prescale"), 2);
    assert_eq!(remote.station_cue(stat).await.expect("cue"), 8);
    assert_eq!(
        remote.station_select_words(stat).await.expect("select"),
        [1, -1, -1, -1, -1, 2]
    );
    assert_eq!(remote.station_function(stat).await.expect("func"), "filter_fn");
    assert_eq!(remote.station_lib(stat).await.expect("lib"), "libfilters");
    assert_eq!(remote.station_class(stat).await.expect("class"), "Filters");
    assert_eq!(remote.station_position(stat).await.expect("pos"), (1, 0));

    remote.station_set_prescale(stat, 5).await.expect("set prescale");
    assert_eq!(remote.station_prescale(stat).await.expect("prescale"), 5);
    remote
        .station_set_select_words(stat, &[9, 9, 9, 9, 9, 9])
        .await
        .expect("set select");
    assert_eq!(
        remote.station_select_words(stat).await.expect("select"),
        [9, 9, 9, 9, 9, 9]
    );

    let att = remote.attach(stat).await.expect("att");
    assert!(remote.station_is_attached(stat, att).await.expect("isat"));
    assert_eq!(remote.station_attachments(stat).await.expect("atts"), 1);
    // Removal is refused while attached.
    assert!(remote.station_remove(stat).await.is_err());
    remote.detach(att).await.expect("detach");
    remote.station_remove(stat).await.expect("remove");
    assert_eq!(remote.station_exists("shaped").await.expect("exists"), None);
    remote.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_brings_the_system_down() {
    let (system, port) = start_broker("kill_test", 16).await;
    let remote = Remote::open("kill_test", &direct(port)).await.expect("open");

    remote.kill().await.expect("kill");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!system.alive());

    // The handle marked itself closed.
    assert_eq!(remote.alive().await.unwrap_err(), EtError::Closed);
}
