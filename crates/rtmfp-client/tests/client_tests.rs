//! Client Library Tests (rtmfp-client)
//!
//! Tests for the session orchestrator against a simulated driver:
//! - Handle lifecycle and stale handles
//! - Blocking connect, peer, publish and group calls
//! - Interrupts and teardown
//! - Reading and writing FLV data
//! - Configuration files

use rtmfp_client::{
    ClientError, CloseStatus, Command, Event, EventMask, GroupConfig, Handle, Interrupt, Invoker,
    Parameters, RtmfpConfig, StreamRole,
};
use rtmfp_core::flv::{FlvTag, FLV_HEADER};
use rtmfp_test_utils::{wait_for, Reply, SimulatedDriver, StatusCollector, DEFAULT_CHECK_INTERVAL};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const URL: &str = "rtmfp://127.0.0.1/live";

fn setup() -> (Invoker, Arc<SimulatedDriver>) {
    let driver = SimulatedDriver::new();
    let invoker = Invoker::with_driver(driver.clone(), Parameters::default()).expect("start failed");
    (invoker, driver)
}

fn peer_id() -> String {
    "0123456789abcdef".repeat(4)
}

// ============================================================================
// Handle Lifecycle
// ============================================================================

#[test]
fn test_unknown_handle_not_found() {
    let (invoker, _driver) = setup();
    let handle = Handle::from_raw(0x0001_0007).unwrap();
    assert!(matches!(
        invoker.wait_for_event(handle, Event::Connected.into()),
        Err(ClientError::NotFound(_))
    ));
    assert!(matches!(
        invoker.remove_connection(handle, false),
        Err(ClientError::NotFound(_))
    ));
}

#[test]
fn test_closed_handle_not_found() {
    let (invoker, driver) = setup();
    let handle = invoker.connect(URL, RtmfpConfig::default()).unwrap();
    assert_eq!(
        invoker.remove_connection(handle, false).unwrap(),
        CloseStatus::Closed
    );
    assert!(matches!(
        invoker.add_stream(handle, StreamRole::Play, "cam", true, true, false),
        Err(ClientError::NotFound(_))
    ));
    assert_eq!(driver.command_names(), vec!["connect", "disconnect"]);
}

#[test]
fn test_double_close_is_noop() {
    let (invoker, _driver) = setup();
    let handle = invoker.connect(URL, RtmfpConfig::default()).unwrap();
    assert_eq!(
        invoker.remove_connection(handle, true).unwrap(),
        CloseStatus::Closed
    );
    assert_eq!(
        invoker.remove_connection(handle, true).unwrap(),
        CloseStatus::AlreadyClosed
    );
    assert_eq!(invoker.connection_count(), 0);
}

#[test]
fn test_stale_handle_after_reuse() {
    let (invoker, _driver) = setup();
    let first = invoker.connect(URL, RtmfpConfig::default()).unwrap();
    invoker.remove_connection(first, false).unwrap();
    let second = invoker.connect(URL, RtmfpConfig::default()).unwrap();

    assert_ne!(first, second);
    assert!(matches!(
        invoker.connection_state(first),
        Err(ClientError::NotFound(_))
    ));
    assert!(invoker.connection_state(second).is_ok());
}

#[test]
fn test_close_stream_is_idempotent() {
    let (invoker, _driver) = setup();
    let handle = invoker.connect(URL, RtmfpConfig::default()).unwrap();
    let media = invoker
        .add_stream(handle, StreamRole::Play, "cam", true, true, false)
        .unwrap();

    assert_eq!(invoker.close_stream(handle, media).unwrap(), CloseStatus::Closed);
    assert_eq!(
        invoker.close_stream(handle, media).unwrap(),
        CloseStatus::AlreadyClosed
    );
    assert!(matches!(
        invoker.close_stream(handle, media + 10),
        Err(ClientError::StreamNotFound { .. })
    ));
}

// ============================================================================
// Blocking Calls
// ============================================================================

#[test]
fn test_blocking_connect_waits_for_connected() {
    let (invoker, driver) = setup();
    driver.respond("connect", Event::Connected, Duration::from_millis(50));

    let handle = invoker
        .connect(URL, RtmfpConfig::default().blocking(true))
        .unwrap();
    assert_eq!(
        invoker.connection_state(handle).unwrap(),
        rtmfp_client::ConnectionState::Established
    );
}

#[test]
fn test_blocking_connect_reports_failure() {
    let (invoker, driver) = setup();
    driver.reply(
        "connect",
        Reply::Fail("handshake timeout".to_string()),
        Duration::from_millis(20),
    );

    match invoker.connect(URL, RtmfpConfig::default().blocking(true)) {
        Err(ClientError::ConnectionFailed(reason)) => assert_eq!(reason, "handshake timeout"),
        other => panic!("expected a failure, got {:?}", other),
    }
    // the caller never saw the handle, so nothing may stay behind
    assert_eq!(invoker.connection_count(), 0);
    assert_eq!(driver.command_names(), vec!["connect", "disconnect"]);
}

#[test]
fn test_failed_blocking_peer_play_drops_stream() {
    let (invoker, driver) = setup();
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let handle = invoker
        .connect(
            URL,
            RtmfpConfig::default().with_interrupt(move || flag.load(Ordering::SeqCst)),
        )
        .unwrap();

    let setter = {
        let stop = stop.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.store(true, Ordering::SeqCst);
        })
    };
    assert!(matches!(
        invoker.connect2_peer(handle, &peer_id(), "cam", true),
        Err(ClientError::Interrupted(Interrupt::Application))
    ));
    setter.join().unwrap();

    assert_eq!(invoker.connection_count(), 1);
    assert!(matches!(
        invoker.close_stream(handle, 1),
        Ok(CloseStatus::AlreadyClosed)
    ));
    assert_eq!(
        driver.command_names(),
        vec!["connect", "connect2peer", "closeStream"]
    );
}

#[test]
fn test_blocking_connect2_peer() {
    let (invoker, driver) = setup();
    let delay = Duration::from_millis(200);
    driver.respond("connect2peer", Event::PeerConnected, delay);
    let handle = invoker.connect(URL, RtmfpConfig::default()).unwrap();

    let start = Instant::now();
    let media = invoker
        .connect2_peer(handle, &peer_id(), "cam", true)
        .unwrap();
    assert!(start.elapsed() >= delay, "returned after {:?}", start.elapsed());
    assert_eq!(media, 1);

    let commands = driver.commands();
    assert!(matches!(
        &commands[1],
        Command::ConnectPeer { media_id: 1, peer_id, stream, .. }
            if stream == "cam" && peer_id[..2] == [0x01, 0x23]
    ));
}

#[test]
fn test_connect2_peer_rejects_bad_peer_id() {
    let (invoker, _driver) = setup();
    let handle = invoker.connect(URL, RtmfpConfig::default()).unwrap();
    assert!(matches!(
        invoker.connect2_peer(handle, "not-hex", "cam", false),
        Err(ClientError::InvalidParameter(_))
    ));
}

#[test]
fn test_blocking_publish_waits_for_matching_event() {
    let (invoker, driver) = setup();
    driver.respond("addStream", Event::P2pPublished, Duration::from_millis(30));
    let handle = invoker.connect(URL, RtmfpConfig::default()).unwrap();

    let media = invoker
        .add_stream(handle, StreamRole::P2pPublish, "cam", true, false, true)
        .unwrap();
    assert_eq!(media, 1);
    assert!(matches!(
        invoker.add_stream(handle, StreamRole::Publish, "other", true, true, false),
        Err(ClientError::InvalidConfig(_))
    ));
}

#[test]
fn test_group_player_does_not_block() {
    let (invoker, driver) = setup();
    let handle = invoker.connect(URL, RtmfpConfig::default()).unwrap();
    let group = GroupConfig {
        net_group: "G:010121".to_string(),
        is_blocking: true,
        ..Default::default()
    };

    let media = invoker
        .connect2_group(handle, "cam", &RtmfpConfig::default(), group, true, true, None)
        .unwrap();
    assert_eq!(media, 1);
    assert_eq!(driver.command_names(), vec!["connect", "connect2group"]);
}

#[test]
fn test_blocking_group_publisher() {
    let (invoker, driver) = setup();
    driver.respond("connect2group", Event::GroupConnected, Duration::from_millis(50));
    let handle = invoker.connect(URL, RtmfpConfig::default()).unwrap();
    let group = GroupConfig {
        net_group: "G:010121".to_string(),
        is_publisher: true,
        is_blocking: true,
        ..Default::default()
    };

    let media = invoker
        .connect2_group(
            handle,
            "cam",
            &RtmfpConfig::default(),
            group,
            true,
            true,
            Some("rtmfp://127.0.0.1/fallback/cam"),
        )
        .unwrap();
    assert_eq!(media, 1);
    assert!(matches!(
        &driver.commands()[1],
        Command::ConnectGroup { fallback: Some(_), .. }
    ));
}

#[test]
fn test_invalid_group_config() {
    let (invoker, _driver) = setup();
    let handle = invoker.connect(URL, RtmfpConfig::default()).unwrap();
    let group = GroupConfig {
        net_group: "G:010121".to_string(),
        push_limit: 0,
        ..Default::default()
    };
    assert!(matches!(
        invoker.connect2_group(handle, "cam", &RtmfpConfig::default(), group, true, true, None),
        Err(ClientError::InvalidConfig(_))
    ));
}

// ============================================================================
// Interrupts
// ============================================================================

#[test]
fn test_interrupt_unblocks_every_waiter() {
    let (invoker, driver) = setup();
    let invoker = Arc::new(invoker);
    let handles: Vec<Handle> = (0..3)
        .map(|_| invoker.connect(URL, RtmfpConfig::default()).unwrap())
        .collect();

    let barrier = Arc::new(Barrier::new(4));
    let waiters: Vec<_> = handles
        .iter()
        .map(|&handle| {
            let invoker = invoker.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                invoker.wait_for_event(handle, Event::PeerConnected.into())
            })
        })
        .collect();

    barrier.wait();
    thread::sleep(Duration::from_millis(100));
    invoker.interrupt(Interrupt::Last);

    for waiter in waiters {
        let err = waiter.join().unwrap().unwrap_err();
        assert!(
            err.is_interrupt() || err.is_precondition(),
            "unexpected {:?}",
            err
        );
    }
    assert!(!invoker.is_running());
    assert!(driver.is_stopped());
    assert!(matches!(
        invoker.connect(URL, RtmfpConfig::default()),
        Err(ClientError::Terminated)
    ));
    assert!(invoker.read(handles[0], 1, &mut [0u8; 16]).unwrap_err().is_precondition());
}

#[test]
fn test_application_interrupt_callback() {
    let (invoker, _driver) = setup();
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let config = RtmfpConfig::default().with_interrupt(move || flag.load(Ordering::SeqCst));
    let handle = invoker.connect(URL, config).unwrap();

    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        stop.store(true, Ordering::SeqCst);
    });
    assert!(matches!(
        invoker.wait_for_event(handle, EventMask::PUBLIC),
        Err(ClientError::Interrupted(Interrupt::Application))
    ));
    trigger.join().unwrap();
    assert!(invoker.is_running());
}

#[test]
fn test_wait_consumes_events() {
    let (invoker, driver) = setup();
    let handle = invoker.connect(URL, RtmfpConfig::default()).unwrap();
    let sink = driver.sink().unwrap();
    sink.post(handle, Event::Published);
    sink.post(handle, Event::PeerConnected);

    let fired = invoker
        .wait_for_event(handle, Event::Published | Event::Connected)
        .unwrap();
    assert!(fired.contains(Event::Published));
    assert!(!fired.contains(Event::PeerConnected));

    let fired = invoker
        .wait_for_event(handle, Event::PeerConnected.into())
        .unwrap();
    assert_eq!(fired, EventMask::from(Event::PeerConnected));
}

// ============================================================================
// Media
// ============================================================================

#[test]
fn test_read_yields_flv_header_then_tags() {
    let (invoker, driver) = setup();
    driver.reply(
        "addStream",
        Reply::Media {
            media_id: 1,
            tag: FlvTag {
                kind: 9,
                time: 40,
                data: bytes::Bytes::from_static(&[0x17, 0x01, 0x00]),
            },
        },
        Duration::ZERO,
    );
    let handle = invoker.connect(URL, RtmfpConfig::default()).unwrap();
    let media = invoker
        .add_stream(handle, StreamRole::Play, "cam", true, true, false)
        .unwrap();

    let mut buf = [0u8; 256];
    let mut read = 0;
    assert!(wait_for(
        || {
            read = invoker.read(handle, media, &mut buf).unwrap();
            read > 0
        },
        DEFAULT_CHECK_INTERVAL,
        Duration::from_secs(2),
    ));
    assert_eq!(&buf[..FLV_HEADER.len()], &FLV_HEADER);
    assert_eq!(read, FLV_HEADER.len() + 11 + 3 + 4);
    assert_eq!(buf[FLV_HEADER.len()], 9);
    assert_eq!(invoker.read(handle, media, &mut buf).unwrap(), 0);
}

#[test]
fn test_read_unknown_stream() {
    let (invoker, _driver) = setup();
    let handle = invoker.connect(URL, RtmfpConfig::default()).unwrap();
    assert!(matches!(
        invoker.read(handle, 3, &mut [0u8; 8]),
        Err(ClientError::StreamNotFound { media_id: 3, .. })
    ));
}

#[test]
fn test_write_splits_tags_across_calls() {
    let (invoker, driver) = setup();
    let handle = invoker.connect(URL, RtmfpConfig::default()).unwrap();
    invoker
        .add_stream(handle, StreamRole::Publish, "cam", true, true, false)
        .unwrap();

    let mut stream = FLV_HEADER.to_vec();
    stream.extend_from_slice(&[8, 0, 0, 1, 0, 0, 0x10, 0, 0, 0, 0, 0xAF, 0, 0, 0, 12]);
    let (first, second) = stream.split_at(20);
    assert_eq!(invoker.write(handle, first).unwrap(), first.len());
    assert_eq!(invoker.write(handle, second).unwrap(), second.len());

    let writes: Vec<_> = driver
        .commands()
        .into_iter()
        .filter_map(|command| match command {
            Command::Write { tag, media_id, .. } => Some((media_id, tag)),
            _ => None,
        })
        .collect();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, 1);
    assert_eq!(writes[0].1.kind, 8);
    assert_eq!(writes[0].1.time, 0x10);
}

#[test]
fn test_call_function_targets() {
    let (invoker, driver) = setup();
    let handle = invoker.connect(URL, RtmfpConfig::default()).unwrap();
    invoker
        .call_function(handle, "sendMessage", &["hello"], None)
        .unwrap();
    invoker
        .call_function(handle, "sendMessage", &["hi"], Some(peer_id().as_str()))
        .unwrap();

    let calls: Vec<_> = driver
        .commands()
        .into_iter()
        .filter_map(|command| match command {
            Command::Call { args, peer_id, .. } => Some((args, peer_id.is_some())),
            _ => None,
        })
        .collect();
    assert_eq!(calls, vec![(vec!["hello".to_string()], false), (vec!["hi".to_string()], true)]);
}

#[test]
fn test_status_callback() {
    let (invoker, driver) = setup();
    driver.reply(
        "connect",
        Reply::Status {
            code: "NetConnection.Connect.Success".to_string(),
            description: "Connection succeeded".to_string(),
        },
        Duration::from_millis(10),
    );
    let collector = StatusCollector::new();
    invoker
        .connect(URL, RtmfpConfig::default().with_status(collector.callback()))
        .unwrap();

    assert!(collector.wait_for_count(1, Duration::from_secs(2)));
    assert!(collector.has_code("NetConnection.Connect.Success"));
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_parameters_from_toml() {
    let parameters: Parameters = toml::from_str(
        r#"
        log_level = 7
        socket_receive_size = 262144
        timeout_fallback = 5
        "#,
    )
    .unwrap();
    assert_eq!(parameters.log_level, 7);
    assert_eq!(parameters.socket_receive_size, 262144);
    assert_eq!(parameters.socket_send_size, 0);
    assert_eq!(parameters.timeout_fallback, 5);
}

#[test]
fn test_group_config_from_toml() {
    let group: GroupConfig = toml::from_str(
        r#"
        net_group = "G:010121"
        is_publisher = true
        window_duration = 4000
        "#,
    )
    .unwrap();
    assert!(group.validate().is_ok());
    assert_eq!(group.window_duration, 4000);
    assert_eq!(group.fetch_period, 2500);
    assert_eq!(group.push_limit, 4);
}

#[test]
fn test_parameters_update_on_running_invoker() {
    let (invoker, _driver) = setup();
    invoker
        .update_parameters(|parameters| parameters.set("socketSendSize", "131072"))
        .unwrap();
    assert_eq!(invoker.parameters().socket_send_size, 131072);
    assert!(invoker
        .update_parameters(|parameters| parameters.set_int("bogus", 1))
        .is_err());
}
