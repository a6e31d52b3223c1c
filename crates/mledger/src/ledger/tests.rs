use crate::cursor::IndividualDeleted;
use crate::factory::ManagedLedgerFactory;
use crate::meta::cursor_path;
use crate::offload::MemoryOffloader;
use crate::stats::LedgerStats;
use super::State;
use bytes::Bytes;
use mledger_common::{
    Error, FactoryConfig, InitialPosition, ManagedLedgerConfig, Position, PositionBound,
};
use mledger_meta_store::{MemoryMetadataStore, MetadataStore, SessionEvent};
use mledger_segment::MemorySegmentStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

struct Env {
    segments: MemorySegmentStore,
    meta: MemoryMetadataStore,
}

impl Env {
    fn new() -> Self {
        Self {
            segments: MemorySegmentStore::new(),
            meta: MemoryMetadataStore::new(),
        }
    }

    fn factory(&self) -> ManagedLedgerFactory {
        self.factory_with(FactoryConfig::default())
    }

    fn factory_with(&self, config: FactoryConfig) -> ManagedLedgerFactory {
        ManagedLedgerFactory::new(
            Arc::new(self.segments.clone()),
            Arc::new(self.meta.clone()),
            config,
        )
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn one_per_segment() -> ManagedLedgerConfig {
    ManagedLedgerConfig::default().with_max_entries_per_segment(1)
}

/// Consumed segments are kept, so background trims leave the ledger alone.
fn retained() -> ManagedLedgerConfig {
    ManagedLedgerConfig::default()
        .with_retention_time_ms(-1)
        .with_retention_size_mb(-1)
}

#[tokio::test]
async fn test_adds_are_ordered_and_counted() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory
        .open_with_config("orders", retained().with_max_entries_per_segment(2))
        .await
        .unwrap();

    let mut positions = Vec::new();
    for i in 0..7 {
        positions.push(ledger.add_entry(format!("entry-{i}")).await.unwrap());
    }
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(ledger.number_of_entries(), 7);
    let counted: u64 = ledger.segments().iter().map(|s| s.entry_count).sum();
    assert_eq!(counted, 7);
    assert_eq!(ledger.total_size(), 7 * 7);
    assert_eq!(ledger.last_entry_position(), positions.last().copied());
    assert_eq!(
        ledger.number_of_entries_between(positions[0]..=positions[6]),
        7
    );
    assert_eq!(
        ledger.read_entry(positions[3]).await.unwrap().data().as_ref(),
        b"entry-3"
    );
}

#[tokio::test]
async fn test_concurrent_adds_complete_in_order() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory
        .open_with_config("orders", retained().with_max_entries_per_segment(1))
        .await
        .unwrap();

    let adds: Vec<_> = (0..10)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.add_entry(format!("{i}")).await })
        })
        .collect();
    let mut positions = Vec::new();
    for add in adds {
        positions.push(add.await.unwrap().unwrap());
    }
    let mut sorted = positions.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), 10);
    assert_eq!(ledger.number_of_entries(), 10);
}

#[tokio::test]
async fn test_reopen_round_trip() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open("orders").await.unwrap();
    let cursor = ledger
        .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    for data in ["a", "bb", "ccc"] {
        ledger.add_entry(data).await.unwrap();
    }
    let read = cursor.read_entries(2).await.unwrap();
    cursor.mark_delete(read[1].position()).await.unwrap();
    let (entries, size) = (ledger.number_of_entries(), ledger.total_size());
    ledger.close().await.unwrap();
    assert_eq!(ledger.state(), State::Closed);
    assert!(ledger.add_entry("late").await.is_err());

    let reopened = factory.open("orders").await.unwrap();
    assert!(!Arc::ptr_eq(&ledger, &reopened));
    assert_eq!(reopened.number_of_entries(), entries);
    assert_eq!(reopened.total_size(), size);

    let cursor = reopened.get_cursor("c1").unwrap();
    assert_eq!(cursor.mark_deleted_position(), read[1].position());
    assert_eq!(cursor.number_of_entries_in_backlog(), 1);
    let rest = cursor.read_entries(10).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].data().as_ref(), b"ccc");
}

#[tokio::test]
async fn test_reopen_after_crash_recovers_counts_from_segment() {
    let env = Env::new();
    let first = env.factory();
    let ledger = first.open_with_config("orders", retained()).await.unwrap();
    for data in ["a", "b"] {
        ledger.add_entry(data).await.unwrap();
    }
    let segment = ledger.current_segment_id().unwrap();

    // A second owner takes over without the first closing.
    let second = env.factory();
    let taken = second.open_with_config("orders", retained()).await.unwrap();
    assert!(env.segments.is_sealed(segment));
    assert_eq!(taken.number_of_entries(), 2);
    assert_ne!(taken.current_segment_id(), Some(segment));
}

#[tokio::test]
async fn test_mark_delete_and_delete_cursor_are_idempotent() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open("orders").await.unwrap();
    let cursor = ledger
        .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    let p = ledger.add_entry("a").await.unwrap();

    let path = cursor_path("orders", "c1");
    cursor.mark_delete(p).await.unwrap();
    let version = env.meta.version(&path);
    cursor.mark_delete(p).await.unwrap();
    assert_eq!(cursor.mark_deleted_position(), p);
    assert_eq!(env.meta.version(&path), version);

    let beyond = Position::new(p.segment_id, p.entry_id + 5);
    assert!(matches!(
        cursor.mark_delete(beyond).await,
        Err(Error::InvalidArgument(_))
    ));

    ledger.delete_cursor("c1").await.unwrap();
    ledger.delete_cursor("c1").await.unwrap();
    assert!(ledger.get_cursor("c1").is_none());
    assert!(cursor.read_entries(1).await.is_err());
}

#[tokio::test]
async fn test_read_count_bounds() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open("orders").await.unwrap();
    let cursor = ledger
        .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    ledger.add_entry("a").await.unwrap();

    assert!(matches!(
        cursor.read_entries(0).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        cursor.read_entries(-1).await,
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(cursor.read_entries(10).await.unwrap().len(), 1);
    assert!(cursor.read_entries(10).await.unwrap().is_empty());
    assert!(!cursor.has_more_entries());

    let past = ledger.last_confirmed_position().next();
    assert!(ledger.read_entries(past, 5).await.unwrap().is_empty());
    assert!(matches!(
        ledger.read_entry(past).await,
        Err(Error::PositionNotFound { .. })
    ));
}

#[tokio::test]
async fn test_cache_is_empty_without_active_cursors() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open("orders").await.unwrap();
    ledger.add_entry("a").await.unwrap();
    assert_eq!(ledger.cache().size(), 0);

    let cursor = ledger.open_cursor("c1").await.unwrap();
    ledger.add_entry("bb").await.unwrap();
    assert_eq!(ledger.cache().size(), 2);

    cursor.set_inactive();
    assert!(!cursor.is_active());
    assert_eq!(ledger.cache().size(), 0);
    ledger.add_entry("ccc").await.unwrap();
    assert_eq!(ledger.cache().size(), 0);
}

#[tokio::test]
async fn test_one_entry_per_segment() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory
        .open_with_config("orders", retained().with_max_entries_per_segment(1))
        .await
        .unwrap();

    let mut positions = Vec::new();
    for data in ["a", "b", "c"] {
        positions.push(ledger.add_entry(data).await.unwrap());
    }
    assert!(positions.iter().all(|p| p.entry_id == 0));
    assert!(positions[0].segment_id < positions[1].segment_id);
    assert!(positions[1].segment_id < positions[2].segment_id);
    let with_entries = ledger
        .segments()
        .iter()
        .filter(|s| s.entry_count == 1)
        .count();
    assert_eq!(with_entries, 3);
    assert!(LedgerStats::get(&ledger.stats().rollovers) >= 2);

    // Reads cross segment boundaries.
    let entries = ledger.read_entries(positions[0], 10).await.unwrap();
    let data: Vec<&[u8]> = entries.iter().map(|e| e.data().as_ref()).collect();
    assert_eq!(data, vec![b"a".as_ref(), b"b", b"c"]);
}

#[tokio::test]
async fn test_backlog_after_partial_ack() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory
        .open_with_config("orders", ManagedLedgerConfig::default().with_max_entries_per_segment(10))
        .await
        .unwrap();
    for data in ["a", "b", "c"] {
        ledger.add_entry(data).await.unwrap();
    }
    let cursor = ledger
        .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(cursor.number_of_entries_in_backlog(), 3);

    let read = cursor.read_entries(2).await.unwrap();
    assert_eq!(read.len(), 2);
    assert_eq!(cursor.number_of_entries(), 1);
    cursor.mark_delete(read[1].position()).await.unwrap();
    assert_eq!(cursor.number_of_entries_in_backlog(), 1);
    assert_eq!(ledger.number_of_active_entries(), 1);
    assert_eq!(ledger.estimated_backlog_size(), 1);
    let rest = cursor.read_entries(5).await.unwrap();
    assert_eq!(rest[0].data().as_ref(), b"c");
}

#[tokio::test]
async fn test_zero_retention_trims_consumed_segments() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open_with_config("orders", one_per_segment()).await.unwrap();
    let cursor = ledger
        .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    let mut last = Position::EARLIEST;
    for data in ["a", "b", "c"] {
        last = ledger.add_entry(data).await.unwrap();
    }
    eventually(|| ledger.current_segment_id() != Some(last.segment_id)).await;

    let entries = cursor.read_entries(10).await.unwrap();
    assert_eq!(entries.len(), 3);
    cursor.mark_delete(last).await.unwrap();
    ledger.trim_consumed_segments().await.unwrap();

    let segments = ledger.segments();
    assert_eq!(segments.len(), 1);
    assert_eq!(Some(segments[0].segment_id), ledger.current_segment_id());
    assert_eq!(ledger.total_size(), 0);
    assert_eq!(ledger.number_of_entries(), 0);
    assert_eq!(env.segments.segment_count(), 1);
    assert!(matches!(
        ledger.read_entry(last).await,
        Err(Error::SegmentNotExist { .. })
    ));
}

#[tokio::test]
async fn test_no_cursors_trims_everything_sealed() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open_with_config("orders", one_per_segment()).await.unwrap();
    let mut last = Position::EARLIEST;
    for data in ["a", "b"] {
        last = ledger.add_entry(data).await.unwrap();
    }
    eventually(|| ledger.current_segment_id() != Some(last.segment_id)).await;
    ledger.trim_consumed_segments().await.unwrap();
    assert_eq!(ledger.segments().len(), 1);
}

#[tokio::test]
async fn test_retention_keeps_segments_until_truncate() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory
        .open_with_config("orders", retained().with_max_entries_per_segment(1))
        .await
        .unwrap();
    let cursor = ledger
        .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    let mut last = Position::EARLIEST;
    for data in ["a", "b", "c"] {
        last = ledger.add_entry(data).await.unwrap();
    }
    eventually(|| ledger.current_segment_id() != Some(last.segment_id)).await;
    cursor.mark_delete(last).await.unwrap();

    ledger.trim_consumed_segments().await.unwrap();
    assert_eq!(ledger.segments().len(), 4);

    ledger.truncate().await.unwrap();
    assert_eq!(ledger.segments().len(), 1);
    assert!(cursor.mark_deleted_position() >= last);
}

#[tokio::test]
async fn test_trim_respects_slowest_cursor() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open_with_config("orders", one_per_segment()).await.unwrap();
    let fast = ledger
        .open_cursor_with("fast", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    let slow = ledger
        .open_cursor_with("slow", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    let mut positions = Vec::new();
    for data in ["a", "b", "c"] {
        positions.push(ledger.add_entry(data).await.unwrap());
    }
    eventually(|| ledger.current_segment_id() != Some(positions[2].segment_id)).await;

    fast.mark_delete(positions[2]).await.unwrap();
    slow.mark_delete(positions[0]).await.unwrap();
    ledger.trim_consumed_segments().await.unwrap();

    let ids: Vec<u64> = ledger.segments().iter().map(|s| s.segment_id).collect();
    assert!(!ids.contains(&positions[0].segment_id));
    assert!(ids.contains(&positions[1].segment_id));
    assert_eq!(slow.number_of_entries_in_backlog(), 2);
}

#[tokio::test]
async fn test_cache_follows_slowest_active_cursor() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open("orders").await.unwrap();
    let a = ledger
        .open_cursor_with("a", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    let b = ledger
        .open_cursor_with("b", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    for data in ["e0", "e1", "e2", "e3"] {
        ledger.add_entry(data).await.unwrap();
    }
    assert_eq!(ledger.cache().size(), 8);

    assert_eq!(a.read_entries(4).await.unwrap().len(), 4);
    assert_eq!(b.read_entries(2).await.unwrap().len(), 2);
    a.set_inactive();
    // b has not read e2 and e3 yet.
    assert_eq!(ledger.cache().size(), 4);
    assert_eq!(ledger.cache().len(), 2);

    let rest = b.read_entries(10).await.unwrap();
    b.mark_delete(rest[1].position()).await.unwrap();
    assert_eq!(ledger.cache().size(), 0);
    b.set_inactive();
    assert_eq!(ledger.cache().size(), 0);
}

#[tokio::test]
async fn test_add_timeout_moves_to_new_segment() {
    let env = Env::new();
    let factory = env.factory();
    let config = ManagedLedgerConfig::default().with_add_entry_timeout(Duration::from_millis(100));
    let ledger = factory.open_with_config("orders", config).await.unwrap();
    let first = ledger.add_entry("a").await.unwrap();

    env.segments.set_hang_appends(true);
    let err = ledger.add_entry("b").await.unwrap_err();
    assert!(err.is_timeout());
    env.segments.set_hang_appends(false);

    let next = ledger.add_entry("c").await.unwrap();
    assert!(next.segment_id > first.segment_id);
    assert_eq!(next.entry_id, 0);
    assert_eq!(ledger.state(), State::LedgerOpened);
}

#[tokio::test]
async fn test_transient_append_failure_is_replayed() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open("orders").await.unwrap();
    let first = ledger.add_entry("a").await.unwrap();

    env.segments.fail_next_appends(1);
    let second = ledger.add_entry("b").await.unwrap();
    assert!(second.segment_id > first.segment_id);
    assert_eq!(
        ledger.read_entry(second).await.unwrap().data().as_ref(),
        b"b"
    );
}

#[tokio::test]
async fn test_second_owner_fences_first() {
    let env = Env::new();
    let first = env.factory();
    let ledger = first.open_with_config("orders", retained()).await.unwrap();
    ledger.add_entry("a").await.unwrap();

    let second = env.factory();
    let other = second.open_with_config("orders", retained()).await.unwrap();

    let err = ledger.add_entry("b").await.unwrap_err();
    assert!(err.is_fenced(), "unexpected error: {err}");
    assert_eq!(ledger.state(), State::Fenced);
    assert!(first.get("orders").is_none());

    let p = other.add_entry("c").await.unwrap();
    assert_eq!(other.number_of_entries(), 2);
    assert_eq!(other.read_entry(p).await.unwrap().data().as_ref(), b"c");
}

#[tokio::test]
async fn test_session_loss_defers_rollover() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory
        .open_with_config("orders", retained().with_max_entries_per_segment(1))
        .await
        .unwrap();
    let first = ledger.add_entry("a").await.unwrap();
    eventually(|| ledger.current_segment_id() != Some(first.segment_id)).await;

    env.meta.trigger_session_event(SessionEvent::SessionLost);
    assert!(!factory.is_metadata_service_available());
    let a = ledger.add_entry("b").await.unwrap();
    let b = ledger.add_entry("c").await.unwrap();
    assert_eq!(a.segment_id, b.segment_id);
    assert_eq!(b.entry_id, 1);
    ledger.trim_consumed_segments().await.unwrap();

    env.meta.trigger_session_event(SessionEvent::SessionReestablished);
    eventually(|| ledger.current_segment_id() != Some(a.segment_id)).await;
    assert_eq!(ledger.number_of_entries(), 3);
}

#[tokio::test]
async fn test_lazy_cursor_recovery() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open("orders").await.unwrap();
    let cursor = ledger
        .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    let p = ledger.add_entry("a").await.unwrap();
    ledger.add_entry("b").await.unwrap();
    cursor.mark_delete(p).await.unwrap();
    ledger.close().await.unwrap();

    let config = ManagedLedgerConfig::default().with_lazy_cursor_recovery(true);
    let reopened = factory.open_with_config("orders", config).await.unwrap();
    let recovered = reopened.open_cursor("c1").await.unwrap();
    assert_eq!(recovered.mark_deleted_position(), p);
    assert_eq!(recovered.number_of_entries_in_backlog(), 1);
    assert_eq!(reopened.get_cursors().len(), 1);
}

#[tokio::test]
async fn test_ledger_and_segment_properties() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open_with_config("orders", retained()).await.unwrap();
    ledger.set_property("owner", "svc-a").await.unwrap();
    ledger
        .set_properties([("tier".to_string(), "hot".to_string())].into())
        .await
        .unwrap();
    ledger.delete_property("tier").await.unwrap();

    let segment = ledger.current_segment_id().unwrap();
    ledger.set_segment_property(segment, "k", "v").await.unwrap();
    assert_eq!(ledger.segment_property(segment, "k").as_deref(), Some("v"));
    assert!(matches!(
        ledger.set_segment_property(9999, "k", "v").await,
        Err(Error::SegmentNotExist { .. })
    ));
    ledger.add_entry("a").await.unwrap();
    ledger.close().await.unwrap();

    let reopened = factory.open_with_config("orders", retained()).await.unwrap();
    let properties = reopened.properties();
    assert_eq!(properties.get("owner").map(String::as_str), Some("svc-a"));
    assert!(!properties.contains_key("tier"));
    assert_eq!(reopened.segment_property(segment, "k").as_deref(), Some("v"));
    reopened.remove_segment_property(segment, "k").await.unwrap();
    assert!(reopened.segment_property(segment, "k").is_none());
}

#[tokio::test]
async fn test_non_durable_cursor() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open("orders").await.unwrap();
    for data in ["a", "b", "c"] {
        ledger.add_entry(data).await.unwrap();
    }
    let cursor = ledger.new_non_durable_cursor(Position::EARLIEST).await.unwrap();
    assert!(!cursor.is_durable());
    assert_eq!(cursor.read_entries(10).await.unwrap().len(), 3);
    let last = ledger.last_confirmed_position();
    cursor.mark_delete(last).await.unwrap();
    assert!(
        env.meta
            .paths()
            .iter()
            .all(|p| !p.ends_with(cursor.name()))
    );
}

#[tokio::test]
async fn test_skip_and_reset() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open("orders").await.unwrap();
    let cursor = ledger
        .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    let mut p = Vec::new();
    for i in 0..6 {
        p.push(ledger.add_entry(format!("{i}")).await.unwrap());
    }

    cursor.skip_entries(2, IndividualDeleted::Include).await.unwrap();
    assert_eq!(cursor.mark_deleted_position(), p[1]);

    cursor.delete(p[3]).await.unwrap();
    assert!(cursor.is_individually_deleted(p[3]));
    assert_eq!(cursor.number_of_entries_in_backlog(), 3);
    cursor.skip_entries(2, IndividualDeleted::Exclude).await.unwrap();
    assert_eq!(cursor.mark_deleted_position(), p[4]);
    assert!(cursor.individually_deleted_ranges().is_empty());
    assert_eq!(cursor.number_of_entries_in_backlog(), 1);

    cursor.reset_cursor(p[1]).await.unwrap();
    assert_eq!(cursor.mark_deleted_position(), p[0]);
    assert_eq!(cursor.read_position(), p[1]);
    assert_eq!(cursor.number_of_entries_in_backlog(), 5);
    let entries = cursor.read_entries(1).await.unwrap();
    assert_eq!(entries[0].data().as_ref(), b"1");

    assert!(cursor.skip_entries(0, IndividualDeleted::Include).await.is_err());
    cursor.clear_backlog().await.unwrap();
    assert_eq!(cursor.number_of_entries_in_backlog(), 0);
    assert_eq!(cursor.mark_deleted_position(), p[5]);
}

#[tokio::test]
async fn test_individual_deletes_advance_mark_delete() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open("orders").await.unwrap();
    let cursor = ledger
        .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    let mut p = Vec::new();
    for i in 0..4 {
        p.push(ledger.add_entry(format!("{i}")).await.unwrap());
    }

    cursor.delete_many(&[p[1], p[2]]).await.unwrap();
    assert_eq!(cursor.individually_deleted_ranges().len(), 1);
    assert!(cursor.is_acknowledged(p[2]));
    assert!(!cursor.is_acknowledged(p[0]));

    let unread = cursor.read_entries(10).await.unwrap();
    let data: Vec<&[u8]> = unread.iter().map(|e| e.data().as_ref()).collect();
    assert_eq!(data, vec![b"0".as_ref(), b"3"]);

    cursor.delete(p[0]).await.unwrap();
    assert_eq!(cursor.mark_deleted_position(), p[2]);
    assert!(cursor.individually_deleted_ranges().is_empty());
}

#[tokio::test]
async fn test_seek_and_rewind() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open("orders").await.unwrap();
    let cursor = ledger
        .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    let mut p = Vec::new();
    for i in 0..3 {
        p.push(ledger.add_entry(format!("{i}")).await.unwrap());
    }
    cursor.seek(p[2]).unwrap();
    assert_eq!(cursor.read_entries(5).await.unwrap().len(), 1);
    cursor.rewind();
    assert_eq!(cursor.read_position(), p[0]);
    assert_eq!(cursor.read_entries(5).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_cursor_state_in_metadata_segment() {
    let env = Env::new();
    let factory = env.factory();
    let config = ManagedLedgerConfig::default().with_max_unacked_ranges_inline(1);
    let ledger = factory.open_with_config("orders", config.clone()).await.unwrap();
    let cursor = ledger
        .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    let mut p = Vec::new();
    for i in 0..6 {
        p.push(ledger.add_entry(format!("{i}")).await.unwrap());
    }
    let data_segments = env.segments.segment_count();
    cursor.delete_many(&[p[1], p[3], p[5]]).await.unwrap();
    assert_eq!(env.segments.segment_count(), data_segments + 1);
    ledger.close().await.unwrap();

    let reopened = factory.open_with_config("orders", config).await.unwrap();
    let cursor = reopened.get_cursor("c1").unwrap();
    assert_eq!(cursor.individually_deleted_ranges().len(), 3);
    assert!(cursor.is_individually_deleted(p[3]));
    assert_eq!(cursor.number_of_entries_in_backlog(), 3);

    reopened.delete_cursor("c1").await.unwrap();
    assert!(env.meta.paths().iter().all(|p| !p.ends_with("/c1")));
}

#[tokio::test]
async fn test_cursor_properties_survive_reopen() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open("orders").await.unwrap();
    let properties = [("group".to_string(), "g1".to_string())].into();
    let cursor = ledger
        .open_cursor_with("c1", InitialPosition::Latest, properties)
        .await
        .unwrap();
    cursor.set_property("offset", "42").await.unwrap();
    cursor.remove_property("group").await.unwrap();
    ledger.close().await.unwrap();

    let reopened = factory.open("orders").await.unwrap();
    let cursor = reopened.open_cursor("c1").await.unwrap();
    let properties = cursor.properties();
    assert_eq!(properties.get("offset").map(String::as_str), Some("42"));
    assert!(!properties.contains_key("group"));
}

#[tokio::test]
async fn test_read_or_wait_wakes_on_add() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open("orders").await.unwrap();
    let cursor = ledger.open_cursor("c1").await.unwrap();

    let waiter = {
        let cursor = Arc::clone(&cursor);
        tokio::spawn(async move { cursor.read_entries_or_wait(10).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());
    ledger.add_entry("wake").await.unwrap();

    let entries = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(entries[0].data().as_ref(), b"wake");
}

#[tokio::test]
async fn test_inactive_segment_rollover() {
    let env = Env::new();
    let config = FactoryConfig {
        inactive_check_interval_ms: 20,
        ..FactoryConfig::default()
    };
    let factory = env.factory_with(config);
    let ledger_config = ManagedLedgerConfig::default()
        .with_inactive_segment_rollover_time(Duration::from_millis(50));
    let ledger = factory.open_with_config("orders", ledger_config).await.unwrap();

    // An empty segment is never rolled over.
    assert!(!ledger.check_inactive_segment_and_rollover());
    let p = ledger.add_entry("a").await.unwrap();
    eventually(|| ledger.current_segment_id() != Some(p.segment_id)).await;
}

#[tokio::test]
async fn test_offload_prefix() {
    let env = Env::new();
    let offloader = MemoryOffloader::new();
    let factory = env.factory().with_offloader(Arc::new(offloader.clone()));
    let ledger = factory
        .open_with_config("orders", retained().with_max_entries_per_segment(1))
        .await
        .unwrap();
    let mut p = Vec::new();
    for data in ["a", "b", "c"] {
        p.push(ledger.add_entry(data).await.unwrap());
    }
    eventually(|| ledger.current_segment_id() != Some(p[2].segment_id)).await;

    let first_kept = ledger
        .offload_prefix(Position::new(p[2].segment_id, 0))
        .await
        .unwrap();
    assert_eq!(first_kept, p[2]);
    assert_eq!(
        offloader.entries("orders", p[0].segment_id),
        Some(vec![Bytes::from_static(b"a")])
    );
    let offloaded = ledger
        .segments()
        .iter()
        .filter(|s| s.offload.is_some())
        .count();
    assert_eq!(offloaded, 2);

    // Dropping an offloaded segment also drops its copy.
    ledger.truncate().await.unwrap();
    assert!(offloader.is_empty());
}

#[tokio::test]
async fn test_position_helpers_over_gaps() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory
        .open_with_config("orders", retained().with_max_entries_per_segment(1))
        .await
        .unwrap();
    let mut p = Vec::new();
    for data in ["a", "b", "c"] {
        p.push(ledger.add_entry(data).await.unwrap());
    }
    assert_eq!(ledger.next_valid_position(p[0]), p[1]);
    assert_eq!(ledger.previous_position(p[2]), p[1]);
    assert_eq!(ledger.count_entries(p[0], p[2]), 2);
    assert_eq!(
        ledger.position_after_n(p[0], 2, PositionBound::StartExcluded),
        p[2]
    );
    assert!(ledger.is_no_messages_after(p[2]));
    assert!(!ledger.is_no_messages_after(p[1]));
}

#[tokio::test]
async fn test_delete_ledger_removes_everything() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open_with_config("orders", one_per_segment()).await.unwrap();
    ledger.open_cursor("c1").await.unwrap();
    for data in ["a", "b"] {
        ledger.add_entry(data).await.unwrap();
    }
    ledger.delete().await.unwrap();
    assert!(env.meta.paths().is_empty());
    assert_eq!(env.segments.segment_count(), 0);
    assert!(factory.get("orders").is_none());
}

#[tokio::test]
async fn test_reads_below_first_segment_report_segment_gone() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open_with_config("orders", one_per_segment()).await.unwrap();
    let cursor = ledger
        .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    let mut positions = Vec::new();
    for data in ["a", "b", "c"] {
        positions.push(ledger.add_entry(data).await.unwrap());
    }
    eventually(|| ledger.current_segment_id() != Some(positions[2].segment_id)).await;
    cursor.mark_delete(positions[2]).await.unwrap();
    ledger.trim_consumed_segments().await.unwrap();

    for p in &positions {
        assert!(matches!(
            ledger.read_entry(*p).await,
            Err(Error::SegmentNotExist { .. })
        ));
    }
    let current = ledger.current_segment_id().unwrap();
    assert!(matches!(
        ledger.read_entry(Position::new(current, 5)).await,
        Err(Error::PositionNotFound { .. })
    ));
    ledger.close().await.unwrap();

    // A fresh instance has no memory of the trim and still reports it.
    let reopened = factory.open_with_config("orders", one_per_segment()).await.unwrap();
    assert!(matches!(
        reopened.read_entry(positions[0]).await,
        Err(Error::SegmentNotExist { .. })
    ));
}

#[tokio::test]
async fn test_failed_rollover_record_drops_new_segment() {
    let env = Env::new();
    let factory = env.factory();
    let config = retained().with_max_entries_per_segment(1);
    let ledger = factory.open_with_config("orders", config.clone()).await.unwrap();
    let a = ledger.add_entry("a").await.unwrap();
    eventually(|| ledger.current_segment_id() != Some(a.segment_id)).await;

    env.meta.fail_next_puts("/managed-ledgers/orders", 1);
    let b = ledger.add_entry("b").await.unwrap();
    eventually(|| ledger.state.lock().needs_new_segment).await;

    let ids: Vec<u64> = ledger.segments().iter().map(|s| s.segment_id).collect();
    assert_eq!(ids, vec![a.segment_id, b.segment_id]);
    assert_eq!(env.segments.segment_count(), 2);
    assert_eq!(ledger.state(), State::LedgerOpened);

    let c = ledger.add_entry("c").await.unwrap();
    assert!(c.segment_id > b.segment_id + 1);
    assert!(ledger.segments().iter().all(|s| s.segment_id != b.segment_id + 1));
    eventually(|| ledger.current_segment_id() != Some(c.segment_id)).await;
    ledger.close().await.unwrap();

    let reopened = factory.open_with_config("orders", config).await.unwrap();
    assert_eq!(reopened.number_of_entries(), 3);
    let cursor = reopened
        .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    let read: Vec<Position> = cursor
        .read_entries(10)
        .await
        .unwrap()
        .iter()
        .map(|e| e.position())
        .collect();
    assert_eq!(read, vec![a, b, c]);
}

#[tokio::test]
async fn test_failed_segment_create_fails_pending_and_retries() {
    let env = Env::new();
    let factory = env.factory();
    let config = retained().with_max_entries_per_segment(1);
    let ledger = factory.open_with_config("orders", config).await.unwrap();
    let a = ledger.add_entry("a").await.unwrap();
    eventually(|| ledger.current_segment_id() != Some(a.segment_id)).await;

    env.segments.fail_next_creates(2);
    let b = ledger.add_entry("b").await.unwrap();
    eventually(|| ledger.state.lock().needs_new_segment).await;

    // The retried rollover fails too and takes the waiting add with it.
    assert!(ledger.add_entry("c").await.is_err());
    assert_eq!(LedgerStats::get(&ledger.stats().adds_failed), 1);

    let d = ledger.add_entry("d").await.unwrap();
    assert!(d.segment_id > b.segment_id);
    assert_eq!(d.entry_id, 0);
    assert_eq!(ledger.state(), State::LedgerOpened);
    assert_eq!(ledger.read_entry(d).await.unwrap().data().as_ref(), b"d");
    assert_eq!(ledger.number_of_entries(), 3);
}

#[tokio::test]
async fn test_segment_read_failure_leaves_cursor_in_place() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open_with_config("orders", retained()).await.unwrap();
    for data in ["a", "b"] {
        ledger.add_entry(data).await.unwrap();
    }
    let cursor = ledger
        .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    let start = cursor.read_position();

    env.segments.fail_next_reads(1);
    assert!(cursor.read_entries(10).await.is_err());
    assert_eq!(cursor.read_position(), start);
    assert_eq!(LedgerStats::get(&ledger.stats().read_failures), 1);

    let entries = cursor.read_entries(10).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].data().as_ref(), b"a");
}

#[tokio::test]
async fn test_read_timeout() {
    let env = Env::new();
    let factory = env.factory();
    let config = retained().with_read_entry_timeout(Duration::from_millis(100));
    let ledger = factory.open_with_config("orders", config).await.unwrap();
    let first = ledger.add_entry("a").await.unwrap();

    env.segments.set_hang_reads(true);
    let err = ledger.read_entry(first).await.unwrap_err();
    assert!(err.is_timeout());
    env.segments.set_hang_reads(false);

    assert_eq!(ledger.read_entry(first).await.unwrap().data().as_ref(), b"a");
}

#[tokio::test]
async fn test_cursor_persist_recovers_from_version_conflict() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory.open_with_config("orders", retained()).await.unwrap();
    let cursor = ledger
        .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    let mut positions = Vec::new();
    for data in ["a", "b", "c"] {
        positions.push(ledger.add_entry(data).await.unwrap());
    }
    cursor.mark_delete(positions[0]).await.unwrap();

    // Rewrite the record with the same content, bumping its version.
    let path = cursor_path("orders", "c1");
    let stored = env.meta.get(&path).await.unwrap().unwrap();
    let bumped = env
        .meta
        .put(&path, stored.value, Some(stored.version))
        .await
        .unwrap();

    cursor.mark_delete(positions[1]).await.unwrap();
    assert_eq!(env.meta.version(&path), Some(bumped + 1));
    ledger.close().await.unwrap();

    let reopened = factory.open_with_config("orders", retained()).await.unwrap();
    let cursor = reopened.get_cursor("c1").unwrap();
    assert_eq!(cursor.mark_deleted_position(), positions[1]);
    assert_eq!(cursor.number_of_entries_in_backlog(), 1);
}

#[tokio::test]
async fn test_cache_budget_is_shared_across_ledgers() {
    let env = Env::new();
    let factory = env.factory_with(FactoryConfig::default().with_cache_max_size_mb(1));
    let orders = factory.open_with_config("orders", retained()).await.unwrap();
    let invoices = factory.open_with_config("invoices", retained()).await.unwrap();
    for ledger in [&orders, &invoices] {
        ledger
            .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
            .await
            .unwrap();
    }
    let payload = Bytes::from(vec![7u8; 300_000]);

    let o0 = orders.add_entry(payload.clone()).await.unwrap();
    let i0 = invoices.add_entry(payload.clone()).await.unwrap();
    let o1 = orders.add_entry(payload.clone()).await.unwrap();
    assert_eq!(factory.cache_manager().size(), 900_000);

    // Over 1 MiB: the oldest insertion goes, whichever ledger owns it.
    let i1 = invoices.add_entry(payload).await.unwrap();
    assert!(!orders.cache().contains(o0));
    assert!(invoices.cache().contains(i0));
    assert!(orders.cache().contains(o1));
    assert!(invoices.cache().contains(i1));
    let manager = factory.cache_manager();
    assert!(manager.size() <= manager.max_size());
    assert_eq!(manager.size(), orders.cache().size() + invoices.cache().size());
    assert_eq!(manager.stats().evicted.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_mark_delete_past_sealed_segment_end() {
    let env = Env::new();
    let factory = env.factory();
    let ledger = factory
        .open_with_config("orders", retained().with_max_entries_per_segment(1))
        .await
        .unwrap();
    let cursor = ledger
        .open_cursor_with("c1", InitialPosition::Earliest, BTreeMap::new())
        .await
        .unwrap();
    let a = ledger.add_entry("a").await.unwrap();
    eventually(|| ledger.current_segment_id() != Some(a.segment_id)).await;
    ledger.add_entry("b").await.unwrap();

    let beyond = Position::new(a.segment_id, 5);
    assert!(matches!(
        cursor.mark_delete(beyond).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        cursor.delete(beyond).await,
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(cursor.number_of_entries_in_backlog(), 2);

    cursor.mark_delete(a).await.unwrap();
    assert_eq!(cursor.number_of_entries_in_backlog(), 1);
}
