//! Pipeline integration tests: routing, ordering, restore, and wakeup
//! against an in-process system.

use eventflow::{
    BlockMode, EtError, FlowMode, Mode, ParallelPos, Position, RestoreMode, StationConfig,
    System, SystemConfig, UserMode, GRAND_CENTRAL,
};
use std::sync::Arc;
use std::time::Duration;

fn small_system(nevents: usize) -> Arc<System> {
    System::new(SystemConfig {
        name: "pipe_test".into(),
        nevents,
        event_size: 1024,
        ..Default::default()
    })
    .expect("system")
}

async fn produce(
    system: &Arc<System>,
    att: usize,
    count: usize,
    payload: impl Fn(usize) -> u8,
) {
    for i in 0..count {
        let places = system
            .new_events(att, Mode::Sleep, 1024, 1, None, false)
            .await
            .expect("new");
        {
            let mut ev = system.pool().event(places[0]).expect("event");
            let byte = payload(i);
            ev.data_mut()[..1024].fill(byte);
            ev.set_length(1024).expect("length");
            ev.control[0] = i as i32;
        }
        system.put_events(att, &places).await.expect("put");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_station_echo() {
    let system = small_system(128);
    let stat = system
        .station_create_at(
            "echo",
            StationConfig::default(),
            Position::At(1),
            ParallelPos::End,
        )
        .expect("create");

    let producer = system.attach(GRAND_CENTRAL, 1, "test", "").expect("attach gc");
    let consumer = system.attach(stat, 1, "test", "").expect("attach echo");

    let sys = system.clone();
    let feeder = tokio::spawn(async move {
        produce(&sys, producer, 100, |i| ((i * 7) % 251) as u8).await;
    });

    let mut received = 0;
    while received < 100 {
        let places = system
            .get_events(consumer, Mode::Sleep, 16)
            .await
            .expect("get");
        for &place in &places {
            let ev = system.pool().event(place).expect("event");
            let i = ev.control[0] as usize;
            assert_eq!(ev.length, 1024);
            assert!(ev.data()[..1024].iter().all(|&b| b == ((i * 7) % 251) as u8));
        }
        received += places.len();
        system.put_events(consumer, &places).await.expect("put back");
    }
    feeder.await.expect("feeder");

    assert_eq!(received, 100);
    let census = system.census();
    assert_eq!(census.total(), 128);
    assert_eq!(census.central_used, 100);
    assert_eq!(census.attached, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prescale_keeps_every_third() {
    let system = small_system(64);
    let stat = system
        .station_create_at(
            "sampler",
            StationConfig {
                prescale: 3,
                ..Default::default()
            },
            Position::At(1),
            ParallelPos::End,
        )
        .expect("create");

    let producer = system.attach(GRAND_CENTRAL, 1, "test", "").expect("attach gc");
    let consumer = system.attach(stat, 1, "test", "").expect("attach");

    let sys = system.clone();
    tokio::spawn(async move {
        produce(&sys, producer, 30, |_| 0).await;
    })
    .await
    .expect("feeder");

    let mut seen = Vec::new();
    loop {
        match system
            .get_events(consumer, Mode::Timed(Duration::from_millis(300)), 4)
            .await
        {
            Ok(places) => {
                for &place in &places {
                    seen.push(system.pool().event(place).expect("event").control[0]);
                }
                system.put_events(consumer, &places).await.expect("put");
            }
            Err(EtError::Timeout) => break,
            Err(e) => panic!("get failed: {e}"),
        }
    }

    // First matching event accepted, then every third.
    assert_eq!(seen, vec![0, 3, 6, 9, 12, 15, 18, 21, 24, 27]);
    assert_eq!(system.census().total(), 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parallel_group_round_robin() {
    let system = small_system(128);
    let left = system
        .station_create_at(
            "pair_left",
            StationConfig {
                flow_mode: FlowMode::ParallelHead,
                ..Default::default()
            },
            Position::At(1),
            ParallelPos::End,
        )
        .expect("head");
    let right = system
        .station_create_at(
            "pair_right",
            StationConfig {
                flow_mode: FlowMode::Parallel,
                ..Default::default()
            },
            Position::At(1),
            ParallelPos::End,
        )
        .expect("member");

    let producer = system.attach(GRAND_CENTRAL, 1, "test", "").expect("gc");
    let c_left = system.attach(left, 1, "test", "").expect("left");
    let c_right = system.attach(right, 1, "test", "").expect("right");

    let sys = system.clone();
    tokio::spawn(async move {
        produce(&sys, producer, 100, |_| 0).await;
    })
    .await
    .expect("feeder");

    let drain = |att: usize| {
        let system = system.clone();
        async move {
            let mut seen = Vec::new();
            loop {
                match system
                    .get_events(att, Mode::Timed(Duration::from_millis(300)), 8)
                    .await
                {
                    Ok(places) => {
                        for &p in &places {
                            seen.push(system.pool().event(p).expect("event").control[0]);
                        }
                        system.put_events(att, &places).await.expect("put");
                    }
                    Err(EtError::Timeout) => return seen,
                    Err(e) => panic!("get failed: {e}"),
                }
            }
        }
    };

    let left_seen = drain(c_left).await;
    let right_seen = drain(c_right).await;

    assert_eq!(left_seen.len(), 50);
    assert_eq!(right_seen.len(), 50);
    assert_eq!(left_seen, (0..100).step_by(2).collect::<Vec<i32>>());
    assert_eq!(right_seen, (1..100).step_by(2).collect::<Vec<i32>>());
    assert_eq!(system.census().total(), 128);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn station_input_is_fifo_per_producer() {
    let system = small_system(64);
    let stat = system
        .station_create_at(
            "fifo",
            StationConfig::default(),
            Position::At(1),
            ParallelPos::End,
        )
        .expect("create");
    let producer = system.attach(GRAND_CENTRAL, 1, "test", "").expect("gc");
    let consumer = system.attach(stat, 1, "test", "").expect("att");

    produce(&system, producer, 40, |_| 0).await;

    let mut seen = Vec::new();
    while seen.len() < 40 {
        let places = system.get_events(consumer, Mode::Async, 7).await.expect("get");
        for &p in &places {
            seen.push(system.pool().event(p).expect("event").control[0]);
        }
        system.put_events(consumer, &places).await.expect("put");
    }
    assert_eq!(seen, (0..40).collect::<Vec<i32>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn detach_restores_input_at_the_head() {
    let system = small_system(64);
    let stat = system
        .station_create_at(
            "careful",
            StationConfig {
                restore_mode: RestoreMode::Input,
                ..Default::default()
            },
            Position::At(1),
            ParallelPos::End,
        )
        .expect("create");
    let producer = system.attach(GRAND_CENTRAL, 1, "test", "").expect("gc");
    let consumer = system.attach(stat, 1, "test", "").expect("att");

    produce(&system, producer, 10, |_| 0).await;

    let held = system.get_events(consumer, Mode::Async, 5).await.expect("get");
    let held_ids: Vec<i32> = held
        .iter()
        .map(|&p| system.pool().event(p).expect("event").control[0])
        .collect();
    assert_eq!(held_ids, vec![0, 1, 2, 3, 4]);

    // Detach with five events still checked out; they must return to
    // the head of the input in their original order.
    system.detach(consumer).await.expect("detach");
    assert!(system.attachment(consumer).is_err());

    let fresh = system.attach(stat, 1, "test", "").expect("reattach");
    let replay = system.get_events(fresh, Mode::Async, 10).await.expect("get");
    let replay_ids: Vec<i32> = replay
        .iter()
        .map(|&p| system.pool().event(p).expect("event").control[0])
        .collect();
    assert_eq!(replay_ids, (0..10).collect::<Vec<i32>>());
    assert_eq!(system.census().total(), 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dump_skips_downstream_stations() {
    let system = small_system(32);
    let first = system
        .station_create_at(
            "first",
            StationConfig::default(),
            Position::At(1),
            ParallelPos::End,
        )
        .expect("create");
    let second = system
        .station_create_at(
            "second",
            StationConfig::default(),
            Position::At(2),
            ParallelPos::End,
        )
        .expect("create");
    let producer = system.attach(GRAND_CENTRAL, 1, "test", "").expect("gc");
    let c1 = system.attach(first, 1, "test", "").expect("att1");
    let _c2 = system.attach(second, 1, "test", "").expect("att2");

    produce(&system, producer, 5, |_| 0).await;

    let places = system.get_events(c1, Mode::Async, 5).await.expect("get");
    system.dump_events(c1, &places).await.expect("dump");

    let census = system.census();
    assert_eq!(census.central_used, 5);
    assert_eq!(system.station(second).expect("station").lists().input.len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_user_station_refuses_second_attachment() {
    let system = small_system(16);
    let stat = system
        .station_create_at(
            "solo",
            StationConfig {
                user_mode: UserMode::Single,
                ..Default::default()
            },
            Position::At(1),
            ParallelPos::End,
        )
        .expect("create");
    system.attach(stat, 1, "test", "").expect("first");
    assert_eq!(system.attach(stat, 2, "test", "").unwrap_err(), EtError::Busy);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_station_name_reports_existing_id() {
    let system = small_system(16);
    let stat = system
        .station_create_at(
            "once",
            StationConfig::default(),
            Position::At(1),
            ParallelPos::End,
        )
        .expect("create");
    assert_eq!(
        system
            .station_create_at(
                "once",
                StationConfig::default(),
                Position::End,
                ParallelPos::End
            )
            .unwrap_err(),
        EtError::Exists(stat)
    );
    // A parallel member with clashing policies is refused.
    assert_eq!(
        system
            .station_create_at(
                "mismatched",
                StationConfig {
                    flow_mode: FlowMode::Parallel,
                    block_mode: BlockMode::Nonblocking,
                    ..Default::default()
                },
                Position::At(1),
                ParallelPos::End
            )
            .unwrap_err(),
        EtError::BadArg
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wake_attachment_interrupts_sleep_get() {
    let system = small_system(16);
    let stat = system
        .station_create_at(
            "quiet",
            StationConfig::default(),
            Position::At(1),
            ParallelPos::End,
        )
        .expect("create");
    let consumer = system.attach(stat, 1, "test", "").expect("att");

    let sys = system.clone();
    let waker = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        sys.wake_attachment(consumer).expect("wake");
    });

    let started = std::time::Instant::now();
    let r = system.get_events(consumer, Mode::Sleep, 1).await;
    assert_eq!(r.unwrap_err(), EtError::Wakeup);
    assert!(started.elapsed() < Duration::from_secs(3));
    waker.await.expect("waker");

    // The flag is consumed: the next wait times out normally.
    let r = system
        .get_events(consumer, Mode::Timed(Duration::from_millis(50)), 1)
        .await;
    assert_eq!(r.unwrap_err(), EtError::Timeout);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nonblocking_station_is_skipped_when_full() {
    let system = small_system(32);
    let stat = system
        .station_create_at(
            "lossy",
            StationConfig {
                block_mode: BlockMode::Nonblocking,
                cue: 3,
                ..Default::default()
            },
            Position::At(1),
            ParallelPos::End,
        )
        .expect("create");
    let producer = system.attach(GRAND_CENTRAL, 1, "test", "").expect("gc");
    let _consumer = system.attach(stat, 1, "test", "").expect("att");

    produce(&system, producer, 10, |_| 0).await;

    // Three fit the cue; the remaining seven skip ahead to grand central.
    let census = system.census();
    assert_eq!(census.station_inputs, 3);
    assert_eq!(census.central_used, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_station_backpressures_producer() {
    let system = small_system(32);
    let stat = system
        .station_create_at(
            "narrow",
            StationConfig {
                cue: 2,
                ..Default::default()
            },
            Position::At(1),
            ParallelPos::End,
        )
        .expect("create");
    let producer = system.attach(GRAND_CENTRAL, 1, "test", "").expect("gc");
    let consumer = system.attach(stat, 1, "test", "").expect("att");

    let sys = system.clone();
    let feeder = tokio::spawn(async move {
        produce(&sys, producer, 10, |_| 0).await;
    });

    // Give the producer room to run ahead; the cue must cap the input.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(system.station(stat).expect("station").lists().input.len() <= 2);

    let mut got = 0;
    while got < 10 {
        let places = system.get_events(consumer, Mode::Sleep, 2).await.expect("get");
        got += places.len();
        system.put_events(consumer, &places).await.expect("put");
    }
    feeder.await.expect("feeder");
    assert_eq!(system.census().total(), 32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_events_use_and_release_the_side_budget() {
    let system = System::new(SystemConfig {
        name: "big".into(),
        nevents: 8,
        event_size: 512,
        temp_max: 2,
        ..Default::default()
    })
    .expect("system");
    let producer = system.attach(GRAND_CENTRAL, 1, "test", "").expect("gc");

    let places = system
        .new_events(producer, Mode::Async, 4096, 2, None, false)
        .await
        .expect("new oversized");
    assert_eq!(places.len(), 2);
    assert_eq!(system.pool().oversized_count(), 2);
    for &p in &places {
        assert_eq!(system.pool().event(p).expect("event").memsize(), 4096);
    }

    // Budget exhausted: a third oversized event is refused.
    assert_eq!(
        system
            .new_events(producer, Mode::Async, 4096, 1, None, false)
            .await
            .unwrap_err(),
        EtError::TooBig
    );

    // Dump them; the side buffers drop when the events recycle.
    system.dump_events(producer, &places).await.expect("dump");
    let again = system
        .new_events(producer, Mode::Async, 512, 8, None, false)
        .await
        .expect("new");
    assert_eq!(again.len(), 8);
    assert_eq!(system.pool().oversized_count(), 0);
}
