use std::{collections::VecDeque, sync::Mutex};

use chrono::{DateTime, Utc};
use futures::{
    future,
    stream::{self, BoxStream},
    StreamExt,
};
use shared::{domain::ConnectionEpoch, error::SyncError};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

use crate::subscription::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalChunk {
    pub epoch: ConnectionEpoch,
    pub sequence: u64,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalItem {
    Chunk(TerminalChunk),
    /// Chunks `expected..resumed_at` are gone; the stream continues at
    /// `resumed_at`.
    Gap { expected: u64, resumed_at: u64 },
}

impl TerminalItem {
    pub fn chunk(&self) -> Option<&TerminalChunk> {
        match self {
            TerminalItem::Chunk(chunk) => Some(chunk),
            TerminalItem::Gap { .. } => None,
        }
    }

    pub fn gap_error(&self) -> Option<SyncError> {
        match *self {
            TerminalItem::Gap {
                expected,
                resumed_at,
            } => Some(SyncError::GapDetected {
                expected,
                resumed_at,
            }),
            TerminalItem::Chunk(_) => None,
        }
    }
}

struct EpochLog {
    epoch: ConnectionEpoch,
    next_sequence: u64,
    buffer: VecDeque<TerminalChunk>,
    live: Option<broadcast::Sender<TerminalChunk>>,
}

/// Append-only terminal feed for one connection epoch, with a bounded
/// replay buffer and live fan-out to any number of readers.
pub struct TerminalMultiplexer {
    retention: usize,
    log: Mutex<EpochLog>,
}

impl TerminalMultiplexer {
    pub fn new(retention: usize) -> Self {
        let retention = retention.max(1);
        Self {
            retention,
            log: Mutex::new(EpochLog {
                epoch: ConnectionEpoch::default(),
                next_sequence: 0,
                buffer: VecDeque::with_capacity(retention.min(1024)),
                live: Some(live_channel(retention)),
            }),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn epoch(&self) -> ConnectionEpoch {
        lock(&self.log).epoch
    }

    pub fn next_sequence(&self) -> u64 {
        lock(&self.log).next_sequence
    }

    /// Appends `text` at the next sequence of the current epoch.
    pub fn append(&self, text: impl Into<String>) -> TerminalChunk {
        let mut log = lock(&self.log);
        let sequence = log.next_sequence;
        self.push(&mut log, sequence, text.into())
    }

    /// Appends a chunk whose sequence was assigned by the producer.
    /// Already-seen sequences are dropped; a jump forward leaves a hole
    /// that readers observe as a gap.
    pub fn append_at(&self, sequence: u64, text: impl Into<String>) -> Option<TerminalChunk> {
        let mut log = lock(&self.log);
        if sequence < log.next_sequence {
            debug!(sequence, next = log.next_sequence, "dropping duplicate terminal chunk");
            return None;
        }
        if sequence > log.next_sequence {
            warn!(
                expected = log.next_sequence,
                resumed_at = sequence,
                "terminal feed skipped ahead"
            );
        }
        Some(self.push(&mut log, sequence, text.into()))
    }

    /// Starts a fresh epoch. Readers of the previous epoch reach end of stream.
    pub fn reset_epoch(&self, epoch: ConnectionEpoch) {
        let mut log = lock(&self.log);
        log.epoch = epoch;
        log.next_sequence = 0;
        log.buffer.clear();
        log.live = Some(live_channel(self.retention));
        debug!(%epoch, "terminal epoch reset");
    }

    /// Ends every open reader once it has drained what was already
    /// appended. The retained chunks stay readable through `backlog`.
    pub fn finalize_epoch(&self) {
        let mut log = lock(&self.log);
        if log.live.take().is_some() {
            debug!(epoch = %log.epoch, "terminal epoch finalized");
        }
    }

    pub fn backlog(&self) -> Vec<TerminalChunk> {
        lock(&self.log).buffer.iter().cloned().collect()
    }

    pub fn transcript(&self) -> String {
        lock(&self.log)
            .buffer
            .iter()
            .map(|chunk| chunk.text.as_str())
            .collect()
    }

    /// Lazily yields chunks with `sequence >= from` (or from the epoch start)
    /// in order, then follows live appends until the epoch is finalized or
    /// reset. Missing chunks surface as [`TerminalItem::Gap`].
    pub fn subscribe(&self, from: Option<u64>) -> BoxStream<'static, TerminalItem> {
        let start = from.unwrap_or(0);
        let (backlog, receiver) = {
            let log = lock(&self.log);
            let backlog: Vec<TerminalChunk> = log
                .buffer
                .iter()
                .filter(|chunk| chunk.sequence >= start)
                .cloned()
                .collect();
            (backlog, log.live.as_ref().map(broadcast::Sender::subscribe))
        };

        let live = match receiver {
            Some(receiver) => BroadcastStream::new(receiver).boxed(),
            None => stream::empty().boxed(),
        };

        stream::iter(backlog)
            .map(Ok)
            .chain(live)
            .scan(start, |cursor, received| {
                let items = match received {
                    Ok(chunk) => sequence_items(cursor, chunk),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "terminal reader lagged behind live feed");
                        Vec::new()
                    }
                };
                future::ready(Some(items))
            })
            .flat_map(stream::iter)
            .boxed()
    }

    fn push(&self, log: &mut EpochLog, sequence: u64, text: String) -> TerminalChunk {
        let chunk = TerminalChunk {
            epoch: log.epoch,
            sequence,
            text,
            received_at: Utc::now(),
        };
        log.next_sequence = sequence + 1;
        log.buffer.push_back(chunk.clone());
        while log.buffer.len() > self.retention {
            log.buffer.pop_front();
        }
        let live = log
            .live
            .get_or_insert_with(|| live_channel(self.retention));
        let _ = live.send(chunk.clone());
        chunk
    }
}

fn live_channel(retention: usize) -> broadcast::Sender<TerminalChunk> {
    broadcast::channel(retention.clamp(16, 4096)).0
}

/// Orders one received chunk against the reader's cursor. A lagged reader
/// notices the hole on the next chunk it does receive.
fn sequence_items(cursor: &mut u64, chunk: TerminalChunk) -> Vec<TerminalItem> {
    if chunk.sequence < *cursor {
        return Vec::new();
    }
    let mut items = Vec::with_capacity(2);
    if chunk.sequence > *cursor {
        items.push(TerminalItem::Gap {
            expected: *cursor,
            resumed_at: chunk.sequence,
        });
    }
    *cursor = chunk.sequence + 1;
    items.push(TerminalItem::Chunk(chunk));
    items
}

#[cfg(test)]
#[path = "tests/terminal_tests.rs"]
mod tests;
