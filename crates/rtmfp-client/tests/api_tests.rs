//! Flat API Tests (rtmfp-client)
//!
//! The API drives one process-wide instance, so the whole lifecycle runs in
//! a single test.

use rtmfp_client::api;
use rtmfp_client::{Event, GroupConfig, Interrupt, RtmfpConfig};
use rtmfp_test_utils::{find_available_udp_port, wait_for, DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_api_lifecycle() {
    // before init
    assert_eq!(api::connect("rtmfp://127.0.0.1/live", RtmfpConfig::default()), 0);
    assert_eq!(api::read(1, 1, &mut [0u8; 8]), -1);
    assert!(api::write(1, b"FLV") < 0);

    api::set_int_parameter("TimeoutFallback", 3);
    api::set_parameter("socketReceiveSize", "65536");
    assert_eq!(api::parameters().timeout_fallback, 3);

    let mut config = RtmfpConfig::default().blocking(true);
    let mut group = GroupConfig {
        push_limit: 9,
        ..Default::default()
    };
    let dumps = Arc::new(AtomicUsize::new(0));
    let counter = dumps.clone();
    api::init(
        Some(&mut config),
        Some(&mut group),
        None,
        Some(Arc::new(move |_: &str, _: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );
    assert!(!config.is_blocking);
    assert_eq!(group.push_limit, 4);
    assert_eq!(api::lib_version(), api::LIB_VERSION);
    assert_eq!(api::parameters().socket_receive_size, 65536);

    // nobody listens there: the hello goes out and stays unanswered
    let url = format!("rtmfp://127.0.0.1:{}/live", find_available_udp_port());
    let ctx = api::connect(&url, config.clone());
    assert_ne!(ctx, 0);
    assert!(wait_for(
        || dumps.load(Ordering::SeqCst) > 0,
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    ));

    let media = api::play(ctx, "cam");
    assert_eq!(media, 1);
    assert_eq!(api::read(media, ctx, &mut [0u8; 64]), 0);
    assert_eq!(api::close_stream(ctx, media), 1);
    assert_eq!(api::close_stream(ctx, media), 0);
    assert_eq!(api::call_function(ctx, "ping", &[], None), 1);
    assert_eq!(api::connect2_peer(ctx, "00", "cam", false), 0);

    api::close(ctx, false);
    api::close(ctx, false);
    assert_eq!(api::read(media, ctx, &mut [0u8; 64]), -1);

    assert_eq!(
        api::get_publication_and_url_from_uri("rtmfp://host/app/stream"),
        Some(("rtmfp://host/app".to_string(), "stream".to_string()))
    );

    // an interrupt terminates the instance
    api::interrupt(Interrupt::Application);
    assert_eq!(api::connect(&url, RtmfpConfig::default()), 0);
    assert_eq!(api::wait_for_event(ctx, Event::Connected.into()), 0);

    // and init starts a new one
    api::init(None, None, None, None);
    let ctx = api::connect(&url, RtmfpConfig::default());
    assert_ne!(ctx, 0);
    api::close(ctx, false);
    api::terminate();
}
