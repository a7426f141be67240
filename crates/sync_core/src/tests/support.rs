use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::ConnectionEpoch,
    error::SyncError,
    protocol::{ConsoleEvent, Topic, WireFrame},
};
use tokio::{sync::mpsc, time::timeout};

use crate::{
    settings::SyncSettings,
    transport::{Connector, Link},
};

/// Orchestrator end of a link handed out by [`ScriptedConnector`].
pub(crate) struct Remote {
    pub epoch: ConnectionEpoch,
    pub link: Link,
}

impl Remote {
    pub async fn send_text(&self, text: impl Into<String>) {
        self.link
            .outbound
            .send(text.into())
            .await
            .expect("console end dropped");
    }

    pub async fn send_raw(&self, topic: Topic, payload: Value) {
        let frame = WireFrame::new(topic, payload).with_epoch(self.epoch);
        self.send_text(frame.encode().expect("encode")).await;
    }

    pub async fn send_event(&self, event: ConsoleEvent) {
        let frame = event.to_frame(Some(self.epoch)).expect("frame");
        self.send_text(frame.encode().expect("encode")).await;
    }

    pub async fn recv_frame(&mut self) -> WireFrame {
        let text = timeout(Duration::from_secs(2), self.link.inbound.recv())
            .await
            .expect("frame timeout")
            .expect("console end closed");
        WireFrame::decode(&text).expect("decode")
    }
}

pub(crate) struct ScriptedConnector {
    refuse: AtomicU32,
    opened: AtomicU32,
    capacity: usize,
    remotes: mpsc::UnboundedSender<Remote>,
}

impl ScriptedConnector {
    pub fn new(refuse_first: u32, capacity: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Remote>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                refuse: AtomicU32::new(refuse_first),
                opened: AtomicU32::new(0),
                capacity,
                remotes,
            }),
            rx,
        )
    }

    pub fn refuse_next(&self, attempts: u32) {
        self.refuse.store(attempts, Ordering::SeqCst);
    }

    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, epoch: ConnectionEpoch) -> Result<Link, SyncError> {
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SyncError::unavailable("connection refused"));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let (local, remote) = Link::pair(self.capacity);
        let _ = self.remotes.send(Remote {
            epoch,
            link: remote,
        });
        Ok(local)
    }
}

pub(crate) fn fast_settings() -> SyncSettings {
    SyncSettings {
        max_connect_attempts: 3,
        initial_backoff_ms: 5,
        max_backoff_ms: 20,
        ..SyncSettings::default()
    }
}

pub(crate) async fn next_remote(remotes: &mut mpsc::UnboundedReceiver<Remote>) -> Remote {
    timeout(Duration::from_secs(2), remotes.recv())
        .await
        .expect("remote timeout")
        .expect("connector dropped")
}

/// Polls `condition` until it holds or two seconds pass.
pub(crate) async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}
