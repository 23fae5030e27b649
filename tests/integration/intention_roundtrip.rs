#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use treelog::{verify, wire, Intention, IntentionRecord, Snapshot};

fn commit(
    mut txn: Intention,
    pos: u64,
    log: &mut HashMap<u64, IntentionRecord>,
) -> Snapshot {
    let blob = txn.serialize().unwrap();
    txn.set_csn(pos).unwrap();
    log.insert(pos, IntentionRecord::decode(&blob).unwrap());
    txn.into_snapshot().unwrap()
}

#[test]
fn postorder_puts_children_before_their_parent() {
    let mut txn = Intention::new(Snapshot::empty(), 1);
    txn.put(b"b", b"1");
    txn.put(b"a", b"2");
    txn.put(b"c", b"3");

    let blob = txn.serialize().unwrap();
    let record = IntentionRecord::decode(&blob).unwrap();

    assert_eq!(record.tree.len(), 3);
    assert_eq!(&record.tree[0].key[..], b"a");
    assert_eq!(&record.tree[1].key[..], b"c");
    assert_eq!(&record.tree[2].key[..], b"b");
    assert_eq!(record.root_off(), Some(2));

    let root = &record.tree[2];
    assert!(root.left.self_ref);
    assert_eq!(root.left.off, 0);
    assert!(root.right.self_ref);
    assert_eq!(root.right.off, 1);
    assert_eq!(root.left.csn, 0, "intra-intention edges are position-free");

    let leaf = &record.tree[0];
    assert!(leaf.left.nil);
    assert!(leaf.right.nil);
    assert_eq!((leaf.left.csn, leaf.left.off), (0, 0));
}

#[test]
fn descriptions_and_snapshot_csn_ride_in_the_header() {
    let mut log = HashMap::new();
    let mut base = Intention::new(Snapshot::empty(), 1);
    base.put(b"a", b"1");
    let snapshot = commit(base, 4, &mut log);

    let mut txn = Intention::new(snapshot, 2);
    txn.put(b"b", b"2");
    txn.delete(b"z");
    let blob = txn.serialize().unwrap();
    let record = IntentionRecord::decode(&blob).unwrap();

    assert_eq!(record.snapshot, 4);
    assert_eq!(record.description, ["put: b", "del: z"]);
}

#[test]
fn equal_builders_serialize_identically() {
    let build = || {
        let mut txn = Intention::new(Snapshot::empty(), 1);
        for k in 0u32..20 {
            txn.put(format!("{k:02}").as_bytes(), b"v");
        }
        txn.delete(b"07");
        txn.put(b"03", b"w");
        txn.serialize().unwrap()
    };
    assert_eq!(build(), build());
}

#[test]
fn blob_round_trips_the_in_memory_mapping() {
    let mut rng = ChaCha8Rng::seed_from_u64(0xA5A5_5A5A);
    let mut txn = Intention::new(Snapshot::empty(), 1);
    txn.put(b"seed", b"s");
    for _ in 0..200 {
        let key = format!("{:03}", rng.gen_range(0u32..64)).into_bytes();
        if rng.gen_bool(0.7) {
            txn.put(&key, b"v");
        } else {
            txn.delete(&key);
        }
    }

    let in_memory: Vec<_> = verify::collect_inorder(txn.root().unwrap());
    let blob = txn.serialize().unwrap();
    txn.set_csn(1).unwrap();

    let mut log = HashMap::new();
    log.insert(1, IntentionRecord::decode(&blob).unwrap());
    let replayed = wire::collect_inorder(&log, 1).unwrap();
    assert_eq!(replayed, in_memory);
}

#[test]
fn chained_intentions_replay_through_the_log() {
    let mut log = HashMap::new();
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0xDEAD_BEEF);

    let mut snapshot = Snapshot::empty();
    for pos in 1u64..=6 {
        let mut txn = Intention::new(snapshot.clone(), pos);
        let mut touched = false;
        for _ in 0..24 {
            let key = format!("{:02}", rng.gen_range(0u32..32)).into_bytes();
            if rng.gen_bool(0.65) {
                let val = format!("{pos}").into_bytes();
                txn.put(&key, &val);
                model.insert(key, val);
                touched = true;
            } else {
                txn.delete(&key);
                touched |= model.remove(&key).is_some();
            }
        }
        // An unlucky round of misses leaves nothing to commit.
        if txn.is_empty() {
            assert!(!touched);
            continue;
        }
        verify::check_tree(txn.root().unwrap()).unwrap();
        snapshot = commit(txn, pos, &mut log);
        assert_eq!(snapshot.csn(), pos);

        let replayed: Vec<_> = wire::collect_inorder(&log, pos)
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        let want: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        assert_eq!(replayed, want, "replay diverged at position {pos}");
    }
}

#[test]
fn foreign_edges_survive_the_round_trip_unstamped() {
    let mut log = HashMap::new();
    let mut base = Intention::new(Snapshot::empty(), 1);
    for k in [b"a", b"b", b"c", b"d", b"e"] {
        base.put(k, b"0");
    }
    let snapshot = commit(base, 3, &mut log);

    // The second intention is decoded from bytes produced before its own
    // position exists: self edges carry csn 0, foreign edges carry 3.
    let mut txn = Intention::new(snapshot, 2);
    txn.put(b"f", b"1");
    let blob = txn.serialize().unwrap();
    txn.set_csn(7).unwrap();
    let record = IntentionRecord::decode(&blob).unwrap();

    let mut saw_foreign = false;
    for node in &record.tree {
        for edge in [&node.left, &node.right] {
            if edge.self_ref {
                assert_eq!(edge.csn, 0);
            } else if !edge.nil {
                assert_eq!(edge.csn, 3);
                saw_foreign = true;
            }
        }
    }
    assert!(saw_foreign, "expected at least one edge into the base");

    log.insert(7, record);
    let replayed = wire::collect_inorder(&log, 7).unwrap();
    let keys: Vec<_> = replayed
        .iter()
        .map(|(k, _)| String::from_utf8(k.to_vec()).unwrap())
        .collect();
    assert_eq!(keys, ["a", "b", "c", "d", "e", "f"]);
}

#[test]
fn serialized_indices_are_dense_and_parent_dominant() {
    let mut txn = Intention::new(Snapshot::empty(), 1);
    for k in 0u32..33 {
        txn.put(format!("{k:02}").as_bytes(), b"v");
    }
    for k in (0u32..33).step_by(4) {
        txn.delete(format!("{k:02}").as_bytes());
    }
    let root = txn.root().unwrap().clone();
    txn.serialize().unwrap();

    let own = verify::check_field_indices(&root, 1).unwrap();
    let report = verify::check_tree(&root).unwrap();
    assert_eq!(own, report.nodes, "a fresh build owns every surviving node");
}
