use std::time::Duration;

use tokio::time::timeout;

use super::*;

async fn next_item(stream: &mut BoxStream<'static, TerminalItem>) -> TerminalItem {
    timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("terminal item timeout")
        .expect("stream ended early")
}

async fn collect_until_end(stream: BoxStream<'static, TerminalItem>) -> Vec<TerminalItem> {
    timeout(Duration::from_secs(2), stream.collect::<Vec<_>>())
        .await
        .expect("stream did not end")
}

fn sequences(items: &[TerminalItem]) -> Vec<u64> {
    items
        .iter()
        .filter_map(|item| item.chunk().map(|chunk| chunk.sequence))
        .collect()
}

#[tokio::test]
async fn subscribe_from_replays_then_follows_live() {
    let terminal = TerminalMultiplexer::new(100);
    for line in ["boot\n", "probe usb\n", "probe hdmi\n", "probe eth\n"] {
        terminal.append(line);
    }

    let mut stream = terminal.subscribe(Some(2));
    terminal.append("done\n");

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(next_item(&mut stream).await);
    }
    assert_eq!(sequences(&seen), vec![2, 3, 4]);
    assert_eq!(seen[2].chunk().map(|c| c.text.as_str()), Some("done\n"));
}

#[tokio::test]
async fn omitted_start_yields_whole_epoch_and_ends_on_finalize() {
    let terminal = TerminalMultiplexer::new(100);
    terminal.append("a");
    terminal.append("b");

    let stream = terminal.subscribe(None);
    terminal.append("c");
    terminal.finalize_epoch();

    let items = collect_until_end(stream).await;
    assert_eq!(sequences(&items), vec![0, 1, 2]);
    assert_eq!(terminal.transcript(), "abc");
}

#[tokio::test]
async fn evicted_chunks_surface_as_gap() {
    let terminal = TerminalMultiplexer::new(3);
    for n in 0..6 {
        terminal.append(format!("line {n}\n"));
    }
    terminal.finalize_epoch();

    let items = collect_until_end(terminal.subscribe(Some(1))).await;
    assert_eq!(
        items[0],
        TerminalItem::Gap {
            expected: 1,
            resumed_at: 3
        }
    );
    assert_eq!(
        items[0].gap_error(),
        Some(SyncError::GapDetected {
            expected: 1,
            resumed_at: 3
        })
    );
    assert_eq!(sequences(&items), vec![3, 4, 5]);
}

#[tokio::test]
async fn lagging_reader_gets_gap_instead_of_silent_skip() {
    let terminal = TerminalMultiplexer::new(16);
    let mut stream = terminal.subscribe(None);
    for n in 0..40 {
        terminal.append(format!("{n}"));
    }

    let first = next_item(&mut stream).await;
    match first {
        TerminalItem::Gap {
            expected,
            resumed_at,
        } => {
            assert_eq!(expected, 0);
            assert!(resumed_at > 0);
        }
        other => panic!("expected gap, got {other:?}"),
    }
    let next = next_item(&mut stream).await;
    assert!(next.chunk().is_some());
}

#[tokio::test]
async fn append_at_drops_duplicates_and_reports_jumps() {
    let terminal = TerminalMultiplexer::new(100);
    let stream = terminal.subscribe(None);

    assert!(terminal.append_at(0, "x").is_some());
    assert!(terminal.append_at(0, "x").is_none());
    assert!(terminal.append_at(1, "y").is_some());
    assert!(terminal.append_at(5, "z").is_some());
    assert_eq!(terminal.next_sequence(), 6);
    terminal.finalize_epoch();

    let items = collect_until_end(stream).await;
    assert_eq!(items.len(), 4);
    assert_eq!(
        items[2],
        TerminalItem::Gap {
            expected: 2,
            resumed_at: 5
        }
    );
    assert_eq!(sequences(&items), vec![0, 1, 5]);
}

#[tokio::test]
async fn new_epoch_never_leaks_previous_chunks() {
    let terminal = TerminalMultiplexer::new(100);
    terminal.reset_epoch(ConnectionEpoch(3));
    for n in 0..=57 {
        terminal.append(format!("e3 {n}\n"));
    }
    let old_reader = terminal.subscribe(Some(57));

    terminal.reset_epoch(ConnectionEpoch(4));
    terminal.append("e4 first\n");

    let old_items = collect_until_end(old_reader).await;
    assert_eq!(sequences(&old_items), vec![57]);

    let mut fresh = terminal.subscribe(None);
    let first = next_item(&mut fresh).await;
    let chunk = first.chunk().expect("chunk");
    assert_eq!(chunk.epoch, ConnectionEpoch(4));
    assert_eq!(chunk.sequence, 0);
    assert_eq!(chunk.text, "e4 first\n");
    assert_eq!(terminal.transcript(), "e4 first\n");
}

#[tokio::test]
async fn reader_of_finalized_epoch_ends_and_append_reopens() {
    let terminal = TerminalMultiplexer::new(10);
    terminal.append("one");
    terminal.finalize_epoch();

    let drained = collect_until_end(terminal.subscribe(None)).await;
    assert_eq!(sequences(&drained), vec![0]);

    terminal.append("two");
    let mut reopened = terminal.subscribe(Some(1));
    let item = next_item(&mut reopened).await;
    assert_eq!(item.chunk().map(|c| c.text.as_str()), Some("two"));
}
