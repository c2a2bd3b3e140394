use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

use driftwood::attachment::ImageFile;
use driftwood::config::{DEFAULT_MAX_IMAGE_BYTES, SessionConfig};
use driftwood::protocol::{Message, MessageKind, Sender};
use driftwood::session::machine::{PEER_CONNECTED, PEER_DISCONNECTED};
use driftwood::transport::Role;
use driftwood::transport::loopback::LoopbackNetwork;
use driftwood::{ConnectionSession, ConnectionState, Delivery, SessionError, SessionUpdate};

const WAIT: Duration = Duration::from_secs(5);
const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn session(network: &LoopbackNetwork) -> ConnectionSession {
    session_with(network, SessionConfig::localhost())
}

fn session_with(network: &LoopbackNetwork, config: SessionConfig) -> ConnectionSession {
    ConnectionSession::new(Arc::new(network.clone()), config)
}

async fn wait_for_state(session: &ConnectionSession, want: ConnectionState) {
    let mut state = session.watch_state();
    timeout(WAIT, state.wait_for(|state| *state == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want}, still {}", session.state()))
        .expect("state channel closed");
}

async fn wait_for_log<F>(session: &ConnectionSession, what: &str, done: F) -> Vec<Message>
where
    F: Fn(&[Message]) -> bool,
{
    let result = timeout(WAIT, async {
        loop {
            let messages = session.messages();
            if done(&messages) {
                return messages;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    result.unwrap_or_else(|_| panic!("timed out waiting for {what}: {:?}", session.messages()))
}

async fn connected_pair(network: &LoopbackNetwork) -> (ConnectionSession, ConnectionSession) {
    let alice = session(network);
    let bob = session(network);
    let offer = alice.create_offer().await.expect("create offer");
    let answer = bob.accept_offer(&offer).await.expect("accept offer");
    alice.accept_answer(&answer).await.expect("accept answer");
    wait_for_state(&alice, ConnectionState::Connected).await;
    wait_for_state(&bob, ConnectionState::Connected).await;
    (alice, bob)
}

fn png(len: usize) -> ImageFile {
    let mut bytes = PNG_MAGIC.to_vec();
    bytes.resize(len, 0);
    ImageFile::new(bytes)
}

fn texts(messages: &[Message], sender: Sender) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.kind == MessageKind::Text && m.sender == sender)
        .map(|m| m.content.clone())
        .collect()
}

#[test_timeout::tokio_timeout_test(20)]
async fn offer_answer_exchange_connects_both_sides() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let alice = session(&network);
    let bob = session(&network);
    assert_eq!(alice.state(), ConnectionState::Disconnected);

    let offer = alice.create_offer().await.expect("create offer");
    assert_eq!(alice.state(), ConnectionState::Connecting);
    assert_eq!(alice.role(), Some(Role::Offerer));

    let answer = bob.accept_offer(&offer).await.expect("accept offer");
    assert_eq!(bob.state(), ConnectionState::Connecting);
    assert_eq!(bob.role(), Some(Role::Answerer));

    alice.accept_answer(&answer).await.expect("accept answer");
    wait_for_state(&alice, ConnectionState::Connected).await;
    wait_for_state(&bob, ConnectionState::Connected).await;

    for side in [&alice, &bob] {
        let log = side.messages();
        assert_eq!(log.len(), 1, "{log:?}");
        assert_eq!(log[0].kind, MessageKind::System);
        assert_eq!(log[0].content, PEER_CONNECTED);
    }
}

#[test_timeout::tokio_timeout_test(20)]
async fn sent_text_lands_in_both_logs_with_distinct_ids() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair(&network).await;

    let Delivery::Sent(id) = alice.send("hi").await else {
        panic!("expected the message to be sent");
    };

    let mine = alice.messages();
    let last = mine.last().expect("alice log");
    assert_eq!(last.id, id);
    assert_eq!(
        (last.kind, last.content.as_str(), last.sender),
        (MessageKind::Text, "hi", Sender::Me)
    );

    let theirs = wait_for_log(&bob, "hi", |log| log.len() == 2).await;
    let received = &theirs[1];
    assert_eq!(
        (received.kind, received.content.as_str(), received.sender),
        (MessageKind::Text, "hi", Sender::Peer)
    );
    assert_ne!(received.id, id);
}

#[test_timeout::tokio_timeout_test(20)]
async fn closing_one_side_disconnects_the_other() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair(&network).await;

    bob.close().await;
    assert_eq!(bob.state(), ConnectionState::Disconnected);
    assert!(bob.messages().is_empty());

    wait_for_state(&alice, ConnectionState::Disconnected).await;
    let log = wait_for_log(&alice, "disconnect notice", |log| log.len() == 2).await;
    assert_eq!(log[1].kind, MessageKind::System);
    assert_eq!(log[1].content, PEER_DISCONNECTED);
    assert_eq!(alice.send("anyone?").await, Delivery::Skipped);
}

#[test_timeout::tokio_timeout_test(20)]
async fn close_is_idempotent() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let (alice, _bob) = connected_pair(&network).await;

    alice.close().await;
    let once = (alice.state(), alice.messages());
    alice.close().await;
    assert_eq!((alice.state(), alice.messages()), once);
    assert_eq!(once, (ConnectionState::Disconnected, Vec::new()));

    let fresh = session(&network);
    fresh.close().await;
    fresh.close().await;
    assert_eq!(fresh.state(), ConnectionState::Disconnected);
}

#[test_timeout::tokio_timeout_test(10)]
async fn malformed_offer_token_is_rejected_without_side_effects() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let bob = session(&network);

    let err = bob.accept_offer("not-base64!!").await.unwrap_err();
    assert!(err.is_decode(), "{err:?}");
    assert_eq!(bob.state(), ConnectionState::Disconnected);
    assert_eq!(network.live_links(), 0);
}

#[test_timeout::tokio_timeout_test(10)]
async fn answer_without_offer_is_a_state_error() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let alice = session(&network);

    let err = alice.accept_answer("eyJ9").await.unwrap_err();
    assert!(err.is_state(), "{err:?}");
    assert_eq!(alice.state(), ConnectionState::Disconnected);

    // An answering session has no offer of its own either.
    let offerer = session(&network);
    let bob = session(&network);
    let offer = offerer.create_offer().await.expect("create offer");
    let answer = bob.accept_offer(&offer).await.expect("accept offer");
    let err = bob.accept_answer(&answer).await.unwrap_err();
    assert!(err.is_state(), "{err:?}");
    assert_eq!(bob.state(), ConnectionState::Connecting);
}

#[test_timeout::tokio_timeout_test(10)]
async fn tokens_of_the_wrong_kind_are_decode_errors() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let alice = session(&network);
    let bob = session(&network);

    let offer = alice.create_offer().await.expect("create offer");
    let err = alice.accept_answer(&offer).await.unwrap_err();
    assert!(err.is_decode(), "{err:?}");
    assert_eq!(alice.state(), ConnectionState::Connecting);

    let answer = bob.accept_offer(&offer).await.expect("accept offer");
    let stranger = session(&network);
    let err = stranger.accept_offer(&answer).await.unwrap_err();
    assert!(err.is_decode(), "{err:?}");
    assert_eq!(stranger.state(), ConnectionState::Disconnected);
}

#[test_timeout::tokio_timeout_test(30)]
async fn image_size_ceiling_is_inclusive() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair(&network).await;

    let delivery = alice.send_image(png(DEFAULT_MAX_IMAGE_BYTES)).await;
    assert!(delivery.is_sent(), "{delivery:?}");
    let log = wait_for_log(&bob, "image", |log| log.len() == 2).await;
    assert_eq!(log[1].kind, MessageKind::Image);
    assert!(log[1].content.starts_with("data:image/png;base64,"));

    let delivery = alice.send_image(png(DEFAULT_MAX_IMAGE_BYTES + 1)).await;
    assert!(
        matches!(delivery, Delivery::Rejected(SessionError::Transfer(_))),
        "{delivery:?}"
    );
    let mine = alice.messages();
    let notice = mine.last().expect("alice log");
    assert_eq!(notice.kind, MessageKind::System);
    assert_eq!(notice.content, "Image is too large (max 2MB).");

    sleep(Duration::from_millis(50)).await;
    assert_eq!(bob.messages().len(), 2);
    assert_eq!(alice.state(), ConnectionState::Connected);
}

#[test_timeout::tokio_timeout_test(20)]
async fn unencodable_image_reports_failure_locally() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair(&network).await;

    let delivery = alice
        .send_image(ImageFile::new(b"%PDF-1.7".to_vec()).with_mime("application/pdf"))
        .await;
    assert!(matches!(delivery, Delivery::Rejected(_)), "{delivery:?}");
    let notice = alice.messages().pop().expect("alice log");
    assert_eq!(
        (notice.kind, notice.content.as_str()),
        (MessageKind::System, "Failed to send image.")
    );

    sleep(Duration::from_millis(50)).await;
    assert_eq!(bob.messages().len(), 1);
}

#[test_timeout::tokio_timeout_test(20)]
async fn svg_read_from_disk_is_sent_with_its_extension_type() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair(&network).await;

    let path = std::env::temp_dir().join(format!("driftwood-{}.svg", uuid::Uuid::new_v4()));
    tokio::fs::write(
        &path,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="4" height="4"/>"#,
    )
    .await
    .expect("write svg");
    let file = ImageFile::read(&path).await.expect("read svg");
    let _ = tokio::fs::remove_file(&path).await;
    assert_eq!(file.mime.as_deref(), Some("image/svg+xml"));

    let delivery = alice.send_image(file).await;
    assert!(delivery.is_sent(), "{delivery:?}");
    let mine = alice.messages();
    let sent = mine.last().expect("alice log");
    assert_eq!(sent.kind, MessageKind::Image);
    assert!(sent.content.starts_with("data:image/svg+xml;base64,"), "{}", sent.content);

    let log = wait_for_log(&bob, "svg", |log| log.len() == 2).await;
    assert_eq!(log[1].kind, MessageKind::Image);
    assert_eq!(log[1].content, sent.content);
}

#[test_timeout::tokio_timeout_test(30)]
async fn interleaved_traffic_keeps_order_and_unique_ids() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair(&network).await;
    const ROUNDS: usize = 40;

    for i in 0..ROUNDS {
        assert!(alice.send(&format!("a{i}")).await.is_sent());
        assert!(bob.send(&format!("b{i}")).await.is_sent());
    }

    let expected_a: Vec<_> = (0..ROUNDS).map(|i| format!("a{i}")).collect();
    let expected_b: Vec<_> = (0..ROUNDS).map(|i| format!("b{i}")).collect();
    for (side, mine, theirs) in [
        (&alice, &expected_a, &expected_b),
        (&bob, &expected_b, &expected_a),
    ] {
        let log = wait_for_log(side, "all traffic", |log| {
            log.iter().filter(|m| m.kind == MessageKind::Text).count() == 2 * ROUNDS
        })
        .await;
        assert_eq!(&texts(&log, Sender::Me), mine);
        assert_eq!(&texts(&log, Sender::Peer), theirs);
        let ids: HashSet<_> = log.iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), log.len());
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn blank_or_unconnected_sends_are_skipped() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let alice = session(&network);
    assert_eq!(alice.send("hello").await, Delivery::Skipped);
    assert_eq!(alice.send_image(png(64)).await, Delivery::Skipped);

    let (alice, _bob) = connected_pair(&network).await;
    assert_eq!(alice.send("   ").await, Delivery::Skipped);
    assert_eq!(alice.messages().len(), 1);
}

#[test_timeout::tokio_timeout_test(10)]
async fn failed_transmit_leaves_no_local_entry() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let (alice, _bob) = connected_pair(&network).await;

    network.fail_sends(true);
    let delivery = alice.send("lost").await;
    assert!(
        matches!(delivery, Delivery::Rejected(SessionError::Transfer(_))),
        "{delivery:?}"
    );
    assert_eq!(alice.messages().len(), 1);
    assert_eq!(alice.state(), ConnectionState::Connected);

    network.fail_sends(false);
    assert!(alice.send("found").await.is_sent());
}

#[test_timeout::tokio_timeout_test(10)]
async fn malformed_inbound_frames_are_dropped() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair(&network).await;

    assert!(network.inject(Role::Answerer, "{oops"));
    assert!(network.inject(
        Role::Answerer,
        r#"{"type":"system","content":"Peer connected!"}"#
    ));
    assert!(alice.send("after").await.is_sent());

    let log = wait_for_log(&bob, "valid frame", |log| log.len() == 2).await;
    assert_eq!(log[1].content, "after");
    assert_eq!(bob.state(), ConnectionState::Connected);
}

#[test_timeout::tokio_timeout_test(10)]
async fn close_during_gathering_abandons_the_offer() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let alice = session(&network);
    network.hold_gathering();

    let pending = tokio::spawn({
        let alice = alice.clone();
        async move { alice.create_offer().await }
    });
    wait_for_state(&alice, ConnectionState::Connecting).await;
    alice.close().await;
    network.release_gathering();

    let err = pending.await.expect("join").unwrap_err();
    assert!(err.is_state(), "{err:?}");
    assert_eq!(alice.state(), ConnectionState::Disconnected);
    assert_eq!(network.live_links(), 0);
}

#[test_timeout::tokio_timeout_test(10)]
async fn bounded_gathering_gives_up_and_allows_retry() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let alice = session_with(
        &network,
        SessionConfig::localhost().with_gather_timeout(Duration::from_millis(50)),
    );
    network.hold_gathering();

    let err = alice.create_offer().await.unwrap_err();
    assert!(err.is_negotiation(), "{err:?}");
    assert_eq!(alice.state(), ConnectionState::Disconnected);
    assert_eq!(network.live_links(), 0);

    network.release_gathering();
    alice.create_offer().await.expect("retry");
    assert_eq!(alice.state(), ConnectionState::Connecting);
}

#[test_timeout::tokio_timeout_test(10)]
async fn rejected_answer_fails_the_session() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let alice = session(&network);
    let bob = session(&network);
    let offer = alice.create_offer().await.expect("create offer");
    let answer = bob.accept_offer(&offer).await.expect("accept offer");

    network.fail_remote_descriptions(true);
    let err = alice.accept_answer(&answer).await.unwrap_err();
    assert!(err.is_negotiation(), "{err:?}");
    assert_eq!(alice.state(), ConnectionState::Failed);
    assert!(alice.messages().is_empty());

    // A failed session starts over with a new offer.
    network.fail_remote_descriptions(false);
    alice.create_offer().await.expect("new offer");
    assert_eq!(alice.state(), ConnectionState::Connecting);
}

#[test_timeout::tokio_timeout_test(10)]
async fn transport_failure_tears_the_session_down() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair(&network).await;

    assert!(network.break_link(Role::Offerer));
    wait_for_state(&alice, ConnectionState::Failed).await;
    assert!(alice.messages().is_empty());
    assert_eq!(alice.send("still there?").await, Delivery::Skipped);

    wait_for_state(&bob, ConnectionState::Disconnected).await;
    let log = bob.messages();
    assert_eq!(log.last().map(|m| m.content.as_str()), Some(PEER_DISCONNECTED));
}

#[test_timeout::tokio_timeout_test(10)]
async fn refused_transport_setup_returns_to_disconnected() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let alice = session(&network);

    network.fail_connects(true);
    let err = alice.create_offer().await.unwrap_err();
    assert!(err.is_negotiation(), "{err:?}");
    assert_eq!(alice.state(), ConnectionState::Disconnected);
}

#[test_timeout::tokio_timeout_test(10)]
async fn updates_are_broadcast_in_order() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let alice = session(&network);
    let bob = session(&network);
    let mut updates = alice.subscribe();

    let offer = alice.create_offer().await.expect("create offer");
    let answer = bob.accept_offer(&offer).await.expect("accept offer");
    alice.accept_answer(&answer).await.expect("accept answer");
    wait_for_state(&alice, ConnectionState::Connected).await;
    alice.close().await;

    let mut seen = Vec::new();
    while let Ok(update) = updates.try_recv() {
        seen.push(update);
    }
    assert!(matches!(
        seen.as_slice(),
        [
            SessionUpdate::State(ConnectionState::Connecting),
            SessionUpdate::Appended(_),
            SessionUpdate::State(ConnectionState::Connected),
            SessionUpdate::Cleared,
            SessionUpdate::State(ConnectionState::Disconnected),
        ]
    ), "{seen:?}");
}
