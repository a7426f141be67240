use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::json;
use shared::error::ErrorKind;
use tokio::time::timeout;

use super::*;
use crate::test_support::{eventually, fast_settings, next_remote, ScriptedConnector};

fn frames_of(
    transport: &ChannelTransport,
    topic: Topic,
) -> (Arc<Mutex<Vec<InboundFrame>>>, Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription =
        transport.subscribe(topic, move |frame| sink.lock().expect("sink").push(frame.clone()));
    (seen, subscription)
}

fn transitions_of(
    transport: &ChannelTransport,
) -> (Arc<Mutex<Vec<EpochTransition>>>, Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription =
        transport.on_epoch_change(move |transition| sink.lock().expect("sink").push(*transition));
    (seen, subscription)
}

#[tokio::test]
async fn connect_is_idempotent() {
    let (connector, _remotes) = ScriptedConnector::new(0, 16);
    let transport = ChannelTransport::new(fast_settings(), connector.clone());

    let first = transport.connect().await.expect("connect");
    let second = transport.connect().await.expect("connect again");

    assert_eq!(first, second);
    assert_eq!(first.epoch, ConnectionEpoch(1));
    assert_eq!(connector.opened(), 1);
    assert_eq!(
        transport.state(),
        ConnectionState::Connected {
            epoch: ConnectionEpoch(1)
        }
    );
}

#[tokio::test]
async fn connect_gives_up_after_max_attempts() {
    let (connector, _remotes) = ScriptedConnector::new(10, 16);
    let transport = ChannelTransport::new(fast_settings(), connector.clone());

    let err = transport.connect().await.expect_err("must give up");

    assert_eq!(err.kind(), ErrorKind::ChannelUnavailable);
    assert!(err.is_retryable());
    assert_eq!(transport.state(), ConnectionState::Unavailable);
    assert_eq!(transport.epoch(), None);

    connector.refuse_next(0);
    let handle = transport.connect().await.expect("caller retry succeeds");
    assert_eq!(handle.epoch, ConnectionEpoch(1));
}

#[tokio::test]
async fn connect_retries_with_backoff_before_succeeding() {
    let (connector, _remotes) = ScriptedConnector::new(2, 16);
    let transport = ChannelTransport::new(fast_settings(), connector.clone());
    let mut states = transport.watch_state();

    let handle = transport.connect().await.expect("connect");

    assert_eq!(handle.epoch, ConnectionEpoch(1));
    assert_eq!(connector.opened(), 1);
    assert!(states.has_changed().expect("state sender alive"));
    assert!(states.borrow_and_update().is_connected());
}

#[tokio::test]
async fn frames_reach_every_subscriber_in_receive_order() {
    let (connector, mut remotes) = ScriptedConnector::new(0, 16);
    let transport = ChannelTransport::new(fast_settings(), connector);
    let (first, _s1) = frames_of(&transport, Topic::TerminalOutput);
    let (second, _s2) = frames_of(&transport, Topic::TerminalOutput);
    let (status, _s3) = frames_of(&transport, Topic::TestStatusUpdate);

    transport.connect().await.expect("connect");
    let remote = next_remote(&mut remotes).await;
    for n in 0..5 {
        remote
            .send_raw(Topic::TerminalOutput, json!({ "n": n }))
            .await;
    }
    remote
        .send_raw(Topic::TestStatusUpdate, json!({ "key": "usb_test" }))
        .await;

    eventually("status frame", || status.lock().expect("status").len() == 1).await;
    for seen in [&first, &second] {
        let seen = seen.lock().expect("seen");
        let order: Vec<_> = seen.iter().map(|frame| frame.payload["n"].clone()).collect();
        assert_eq!(order, (0..5).map(|n| json!(n)).collect::<Vec<_>>());
        assert!(seen.iter().all(|frame| frame.epoch == ConnectionEpoch(1)));
    }
}

#[tokio::test]
async fn malformed_and_unknown_frames_are_dropped_without_affecting_others() {
    let (connector, mut remotes) = ScriptedConnector::new(0, 16);
    let transport = ChannelTransport::new(fast_settings(), connector);
    let (seen, _subscription) = frames_of(&transport, Topic::HideDialog);

    transport.connect().await.expect("connect");
    let remote = next_remote(&mut remotes).await;
    remote.send_text("not json at all").await;
    remote
        .send_text(r#"{"topic":"state-changed","payload":{}}"#)
        .await;
    remote.send_raw(Topic::HideDialog, Value::Null).await;

    eventually("hide-dialog frame", || seen.lock().expect("seen").len() == 1).await;
    assert_eq!(transport.malformed_frames(), 2);
}

#[tokio::test]
async fn frames_tagged_with_another_epoch_are_discarded() {
    let (connector, mut remotes) = ScriptedConnector::new(0, 16);
    let transport = ChannelTransport::new(fast_settings(), connector);
    let (seen, _subscription) = frames_of(&transport, Topic::TerminalOutput);

    transport.connect().await.expect("connect");
    let remote = next_remote(&mut remotes).await;
    let stale = WireFrame::new(Topic::TerminalOutput, json!({ "n": "stale" }))
        .with_epoch(ConnectionEpoch(7));
    remote.send_text(stale.encode().expect("encode")).await;
    remote
        .send_raw(Topic::TerminalOutput, json!({ "n": "fresh" }))
        .await;

    eventually("fresh frame", || !seen.lock().expect("seen").is_empty()).await;
    let seen = seen.lock().expect("seen");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].payload["n"], json!("fresh"));
}

#[tokio::test]
async fn publish_requires_a_live_link_and_tags_the_epoch() {
    let (connector, mut remotes) = ScriptedConnector::new(0, 16);
    let transport = ChannelTransport::new(fast_settings(), connector);

    let err = transport
        .publish(Topic::TerminalKey, json!({ "key": "a" }))
        .expect_err("not connected");
    assert_eq!(err.kind(), ErrorKind::ChannelUnavailable);

    transport.connect().await.expect("connect");
    let mut remote = next_remote(&mut remotes).await;
    transport
        .publish(Topic::TerminalKey, json!({ "key": "a" }))
        .expect("publish");

    let frame = remote.recv_frame().await;
    assert_eq!(frame.topic, "terminal-key");
    assert_eq!(frame.epoch, Some(ConnectionEpoch(1)));
    assert_eq!(frame.payload, json!({ "key": "a" }));
}

#[tokio::test]
async fn publish_never_blocks_on_a_full_queue() {
    let (connector, mut remotes) = ScriptedConnector::new(0, 1);
    let transport = ChannelTransport::new(fast_settings(), connector);
    transport.connect().await.expect("connect");
    let _remote = next_remote(&mut remotes).await;

    transport
        .publish(Topic::TerminalKey, json!({ "key": "a" }))
        .expect("first fits");
    let err = transport
        .publish(Topic::TerminalKey, json!({ "key": "b" }))
        .expect_err("queue full");

    assert_eq!(err, SyncError::unavailable("outbound queue full"));
}

#[tokio::test]
async fn link_loss_reconnects_into_a_new_epoch() {
    let (connector, mut remotes) = ScriptedConnector::new(0, 16);
    let transport = ChannelTransport::new(fast_settings(), connector.clone());
    let (transitions, _hooks) = transitions_of(&transport);
    let (seen, _subscription) = frames_of(&transport, Topic::TerminalOutput);

    transport.connect().await.expect("connect");
    let first = next_remote(&mut remotes).await;
    first
        .send_raw(Topic::TerminalOutput, json!({ "from": 1 }))
        .await;
    drop(first);

    let second = next_remote(&mut remotes).await;
    assert_eq!(second.epoch, ConnectionEpoch(2));
    second
        .send_raw(Topic::TerminalOutput, json!({ "from": 2 }))
        .await;

    eventually("frames of both epochs", || seen.lock().expect("seen").len() == 2).await;
    assert_eq!(transport.epoch(), Some(ConnectionEpoch(2)));
    assert_eq!(
        *transitions.lock().expect("transitions"),
        vec![
            EpochTransition::Started {
                epoch: ConnectionEpoch(1),
                previous: None
            },
            EpochTransition::Ended {
                epoch: ConnectionEpoch(1)
            },
            EpochTransition::Started {
                epoch: ConnectionEpoch(2),
                previous: Some(ConnectionEpoch(1))
            },
        ]
    );
    let seen = seen.lock().expect("seen");
    assert_eq!(seen[0].epoch, ConnectionEpoch(1));
    assert_eq!(seen[1].epoch, ConnectionEpoch(2));
    assert_eq!(connector.opened(), 2);
}

#[tokio::test]
async fn background_reconnect_reports_retries_then_recovers() {
    let settings = SyncSettings {
        initial_backoff_ms: 20,
        max_backoff_ms: 40,
        ..fast_settings()
    };
    let (connector, mut remotes) = ScriptedConnector::new(0, 16);
    let transport = ChannelTransport::new(settings, connector.clone());
    transport.connect().await.expect("connect");
    let first = next_remote(&mut remotes).await;

    let mut states = transport.watch_state();
    states.borrow_and_update();
    let recorder = tokio::spawn(async move {
        let mut seen = Vec::new();
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            let recovered = state
                == ConnectionState::Connected {
                    epoch: ConnectionEpoch(2),
                };
            seen.push(state);
            if recovered {
                break;
            }
        }
        seen
    });

    connector.refuse_next(4);
    drop(first);

    let seen = timeout(Duration::from_secs(3), recorder)
        .await
        .expect("recovery timeout")
        .expect("join");
    assert!(seen
        .iter()
        .any(|state| matches!(state, ConnectionState::Reconnecting { attempt: 1, .. })));
    assert!(seen.contains(&ConnectionState::Unavailable));
    assert_eq!(
        seen.last(),
        Some(&ConnectionState::Connected {
            epoch: ConnectionEpoch(2)
        })
    );
    assert_eq!(next_remote(&mut remotes).await.epoch, ConnectionEpoch(2));
    assert_eq!(connector.opened(), 2);
}

#[tokio::test]
async fn disconnect_ends_the_epoch_and_next_connect_advances_it() {
    let (connector, mut remotes) = ScriptedConnector::new(0, 16);
    let transport = ChannelTransport::new(fast_settings(), connector);
    let (transitions, _hooks) = transitions_of(&transport);

    transport.connect().await.expect("connect");
    let mut remote = next_remote(&mut remotes).await;
    transport.disconnect().await;

    assert_eq!(transport.state(), ConnectionState::Disconnected);
    assert_eq!(transport.epoch(), None);
    let closed = tokio::time::timeout(std::time::Duration::from_secs(2), remote.link.inbound.recv())
        .await
        .expect("link close timeout");
    assert!(closed.is_none());

    let handle = transport.connect().await.expect("reconnect");
    assert_eq!(handle.epoch, ConnectionEpoch(2));
    eventually("second start", || transitions.lock().expect("t").len() == 3).await;
    assert_eq!(
        transitions.lock().expect("t")[1],
        EpochTransition::Ended {
            epoch: ConnectionEpoch(1)
        }
    );
}

#[tokio::test]
async fn released_subscription_receives_nothing_further() {
    let (connector, mut remotes) = ScriptedConnector::new(0, 16);
    let transport = ChannelTransport::new(fast_settings(), connector);
    let (kept, _kept_sub) = frames_of(&transport, Topic::TerminalOutput);
    let (dropped, dropped_sub) = frames_of(&transport, Topic::TerminalOutput);
    let detached_id = {
        let (_, subscription) = frames_of(&transport, Topic::TerminalOutput);
        subscription.detach()
    };
    assert_eq!(transport.subscriber_count(Topic::TerminalOutput), 3);

    dropped_sub.unsubscribe();
    assert!(transport.unsubscribe(detached_id));
    assert!(!transport.unsubscribe(detached_id));
    assert_eq!(transport.subscriber_count(Topic::TerminalOutput), 1);

    transport.connect().await.expect("connect");
    let remote = next_remote(&mut remotes).await;
    remote.send_raw(Topic::TerminalOutput, json!({})).await;

    eventually("kept frame", || kept.lock().expect("kept").len() == 1).await;
    assert!(dropped.lock().expect("dropped").is_empty());
}

#[tokio::test]
async fn disposed_transport_refuses_to_connect() {
    let (connector, _remotes) = ScriptedConnector::new(0, 16);
    let transport = ChannelTransport::new(fast_settings(), connector);
    transport.connect().await.expect("connect");

    transport.dispose().await;

    assert_eq!(transport.state(), ConnectionState::Disconnected);
    let err = transport.connect().await.expect_err("disposed");
    assert_eq!(err.kind(), ErrorKind::ChannelUnavailable);
}
