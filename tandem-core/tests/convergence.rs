//! Replicas converge no matter how snapshots are delivered.

use tandem_core::{merge_states, Attrs, CaptureMode, DocumentReplica};
use yrs::Any;

fn replica(id: u64) -> DocumentReplica {
    DocumentReplica::with_client_id(id).unwrap()
}

#[test]
fn test_reordered_and_duplicated_delivery_converges() {
    let writers: Vec<DocumentReplica> = (1..=3).map(replica).collect();
    writers[0].push("red ");
    writers[1].push("green ");
    writers[2].push("blue ");
    writers[0].insert(0, ">");
    writers[2].remove_range(0, 1);

    let snapshots: Vec<Vec<u8>> = writers
        .iter()
        .map(|w| w.capture_local_update(CaptureMode::FullState))
        .collect();

    let forward = replica(10);
    for s in &snapshots {
        forward.apply_remote(s).unwrap();
    }

    let shuffled = replica(11);
    for i in [2, 0, 2, 1, 0] {
        shuffled.apply_remote(&snapshots[i]).unwrap();
    }

    assert_eq!(forward.text(), shuffled.text());
    assert_eq!(forward.state_vector(), shuffled.state_vector());
    assert_eq!(forward.pending_len(), 0);
    assert_eq!(shuffled.pending_len(), 0);
}

#[test]
fn test_merged_snapshot_matches_live_merge() {
    let a = replica(1);
    let b = replica(2);
    a.push("shared ");
    b.apply_remote(&a.capture_local_update(CaptureMode::FullState))
        .unwrap();
    b.push("document");

    let bold = Attrs::from([("bold".into(), Any::Bool(true))]);
    a.format(0, 6, bold);

    let merged = merge_states([
        a.capture_local_update(CaptureMode::FullState),
        b.capture_local_update(CaptureMode::FullState),
    ])
    .unwrap();

    let from_snapshot = replica(3);
    from_snapshot.apply_remote(&merged.update).unwrap();
    a.apply_remote(&b.capture_local_update(CaptureMode::FullState))
        .unwrap();

    assert_eq!(from_snapshot.text(), a.text());
    assert_eq!(from_snapshot.state_vector(), merged.state_vector);
}

#[test]
fn test_stale_overwrite_is_restored() {
    let mine = replica(1);
    mine.push("persisted by me");
    let persisted = mine.capture_local_update(CaptureMode::FullState);
    mine.acknowledge(mine.state_vector());
    mine.take_pending();

    // A peer that never saw my write
    let peer = replica(2);
    peer.push("peer text");
    let overwrite = merge_states([peer.capture_local_update(CaptureMode::FullState)]).unwrap();

    mine.apply_remote(&overwrite.update).unwrap();
    assert!(mine.restore_missing(&overwrite.update).unwrap());

    let rewrite = merge_states([
        overwrite.update.as_slice(),
        mine.capture_local_update(CaptureMode::FullState).as_slice(),
    ])
    .unwrap();
    let check = replica(3);
    check.apply_remote(&rewrite.update).unwrap();
    assert!(check.text().contains("persisted by me"));
    assert!(check.text().contains("peer text"));

    let old = replica(4);
    old.apply_remote(&persisted).unwrap();
    assert_eq!(old.text(), "persisted by me");
}

#[test]
fn test_stale_overwrite_of_deletion_is_restored() {
    let mine = replica(1);
    mine.push("hello world");
    let persisted = mine.capture_local_update(CaptureMode::FullState);
    mine.remove_range(5, 6);
    let deleted = mine.capture_local_update(CaptureMode::FullState);
    mine.acknowledge(mine.state_vector());
    mine.take_pending();

    // A peer that read before the deletion was stored merges and writes
    let peer = replica(2);
    peer.apply_remote(&persisted).unwrap();
    peer.push(" again");
    let overwrite = merge_states([
        persisted.as_slice(),
        peer.capture_local_update(CaptureMode::FullState).as_slice(),
    ])
    .unwrap();
    let stale = replica(3);
    stale.apply_remote(&overwrite.update).unwrap();
    assert_eq!(stale.text(), "hello world again");

    mine.apply_remote(&overwrite.update).unwrap();
    assert!(mine.restore_missing(&overwrite.update).unwrap());

    let rewrite = merge_states([
        overwrite.update.as_slice(),
        mine.capture_local_update(CaptureMode::FullState).as_slice(),
    ])
    .unwrap();
    let check = replica(4);
    check.apply_remote(&rewrite.update).unwrap();
    assert_eq!(check.text(), "hello again");
    assert_eq!(check.text(), mine.text());

    // The deletion alone never moved a clock
    assert_eq!(
        merge_states([&deleted]).unwrap().state_vector,
        merge_states([&persisted]).unwrap().state_vector
    );
}
