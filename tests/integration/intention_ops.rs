#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};

use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use treelog::{verify, Intention, IntentionRecord, NodeRef, Side, Snapshot};

fn entries(txn: &Intention) -> Vec<(String, String)> {
    let Some(root) = txn.root() else {
        return Vec::new();
    };
    verify::collect_inorder(root)
        .into_iter()
        .map(|(k, v)| {
            (
                String::from_utf8(k.to_vec()).unwrap(),
                String::from_utf8(v.to_vec()).unwrap(),
            )
        })
        .collect()
}

fn shape(node: &NodeRef, out: &mut Vec<(Vec<u8>, Vec<u8>, bool, u64)>) {
    if node.is_nil() {
        return;
    }
    out.push((
        node.key().to_vec(),
        node.val().to_vec(),
        node.is_red(),
        node.rid(),
    ));
    shape(&node.child_ref(Side::Left), out);
    shape(&node.child_ref(Side::Right), out);
}

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
fn three_puts_form_a_balanced_tree() {
    let mut txn = Intention::new(Snapshot::empty(), 1);
    txn.put(b"b", b"1");
    txn.put(b"a", b"2");
    txn.put(b"c", b"3");

    assert_eq!(
        entries(&txn),
        [
            ("a".to_string(), "2".to_string()),
            ("b".to_string(), "1".to_string()),
            ("c".to_string(), "3".to_string()),
        ]
    );

    let root = txn.root().unwrap().clone();
    assert_eq!(&root.key()[..], b"b");
    assert!(!root.is_red());
    assert!(root.child_ref(Side::Left).is_red());
    assert!(root.child_ref(Side::Right).is_red());
    verify::check_tree(&root).unwrap();

    let blob = txn.serialize().unwrap();
    let record = IntentionRecord::decode(&blob).unwrap();
    assert_eq!(record.tree.len(), 3);
}

#[test]
fn repeated_put_becomes_an_update() {
    let mut txn = Intention::new(Snapshot::empty(), 1);
    txn.put(b"a", b"1");
    txn.put(b"a", b"2");

    assert_eq!(entries(&txn), [("a".to_string(), "2".to_string())]);
    assert_eq!(txn.descriptions(), ["put: a", "update: a"]);

    let root = txn.root().unwrap();
    assert!(!root.is_red());
    assert!(root.child_ref(Side::Left).is_nil());
    assert!(root.child_ref(Side::Right).is_nil());
}

#[test]
fn delete_keeps_the_tree_valid() {
    let mut txn = Intention::new(Snapshot::empty(), 1);
    txn.put(b"b", b"1");
    txn.put(b"a", b"1");
    txn.put(b"c", b"1");
    txn.delete(b"a");

    assert_eq!(
        entries(&txn),
        [
            ("b".to_string(), "1".to_string()),
            ("c".to_string(), "1".to_string()),
        ]
    );
    verify::check_tree(txn.root().unwrap()).unwrap();
}

#[test]
fn delete_of_a_missing_key_only_logs() {
    let mut txn = Intention::new(Snapshot::empty(), 1);
    txn.put(b"a", b"1");
    txn.delete(b"b");

    assert_eq!(entries(&txn), [("a".to_string(), "1".to_string())]);
    assert_eq!(txn.descriptions(), ["put: a", "del: b"]);
}

#[test]
fn delete_on_an_empty_map_only_logs() {
    let mut txn = Intention::new(Snapshot::empty(), 1);
    txn.delete(b"a");
    assert!(txn.is_empty());
    assert_eq!(txn.descriptions(), ["del: a"]);
}

#[test]
fn first_put_yields_a_black_root() {
    let mut txn = Intention::new(Snapshot::empty(), 1);
    txn.put(b"a", b"1");
    let root = txn.root().unwrap();
    assert!(!root.is_red());
    assert_eq!(root.rid(), 1);
}

#[test]
fn deleting_the_root_of_a_one_node_tree_empties_it() {
    let mut txn = Intention::new(Snapshot::empty(), 1);
    txn.put(b"a", b"1");
    txn.delete(b"a");
    assert!(txn.root().unwrap().is_nil());
    assert!(entries(&txn).is_empty());
}

#[test]
fn sequential_inserts_stay_shallow() {
    let mut txn = Intention::new(Snapshot::empty(), 1);
    for k in 1u8..=7 {
        txn.put(format!("{k}").as_bytes(), b"v");
    }
    let root = txn.root().unwrap().clone();
    let report = verify::check_tree(&root).unwrap();
    assert_eq!(report.nodes, 7);
    assert!(report.depth <= 4, "depth {}", report.depth);

    let blob = txn.serialize().unwrap();
    let record = IntentionRecord::decode(&blob).unwrap();
    assert_eq!(record.tree.len(), 7);
    assert_eq!(verify::check_field_indices(&root, 1).unwrap(), 7);
}

#[test]
fn updating_a_snapshot_entry_copies_only_the_path() {
    let mut log = HashMap::new();
    let mut base = Intention::new(Snapshot::empty(), 1);
    for k in [b"a", b"b", b"c", b"d", b"e"] {
        base.put(k, b"0");
    }
    let snapshot = commit(base, 1, &mut log);

    let mut txn = Intention::new(snapshot, 2);
    txn.put(b"c", b"X");

    let blob = txn.serialize().unwrap();
    let record = IntentionRecord::decode(&blob).unwrap();
    assert!(record.tree.len() <= 3, "own nodes: {}", record.tree.len());
    for node in &record.tree {
        for edge in [&node.left, &node.right] {
            if !edge.nil && !edge.self_ref {
                assert_eq!(edge.csn, 1, "foreign edge must address the base intention");
            }
        }
    }

    let mut expected: Vec<(String, String)> = [b"a", b"b", b"d", b"e"]
        .iter()
        .map(|k| (String::from_utf8(k.to_vec()).unwrap(), "0".to_string()))
        .collect();
    expected.push(("c".to_string(), "X".to_string()));
    expected.sort();
    assert_eq!(entries(&txn), expected);
}

#[test]
fn builders_never_write_through_the_snapshot() {
    let mut log = HashMap::new();
    let mut base = Intention::new(Snapshot::empty(), 1);
    for k in 0u32..64 {
        base.put(format!("{k:03}").as_bytes(), b"base");
    }
    let snapshot = commit(base, 1, &mut log);

    let mut before = Vec::new();
    shape(snapshot.root(), &mut before);

    let mut txn = Intention::new(snapshot.clone(), 2);
    for k in 0u32..64 {
        if k % 3 == 0 {
            txn.delete(format!("{k:03}").as_bytes());
        } else {
            txn.put(format!("{k:03}").as_bytes(), b"changed");
        }
    }
    verify::check_tree(txn.root().unwrap()).unwrap();

    let mut after = Vec::new();
    shape(snapshot.root(), &mut after);
    assert_eq!(before, after, "snapshot tree must be untouched");
}

#[test]
fn random_soak_matches_a_reference_model() {
    let mut rng = ChaCha8Rng::seed_from_u64(0xF00D_CAFE);
    let mut keys: Vec<u32> = (0..48).collect();
    keys.shuffle(&mut rng);

    let mut txn = Intention::new(Snapshot::empty(), 1);
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    for step in 0..600 {
        let key = format!("{:03}", keys[rng.gen_range(0..keys.len())]).into_bytes();
        if rng.gen_bool(0.6) {
            let val = format!("v{step}").into_bytes();
            txn.put(&key, &val);
            model.insert(key, val);
        } else {
            txn.delete(&key);
            model.remove(&key);
        }

        if let Some(root) = txn.root() {
            verify::check_tree(root).unwrap();
            let got: Vec<_> = verify::collect_inorder(root)
                .into_iter()
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .collect();
            let want: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            assert_eq!(got, want, "divergence at step {step}");
        } else {
            assert!(model.is_empty());
        }
    }
}

proptest! {
    #[test]
    fn arbitrary_op_sequences_match_the_model(
        ops in proptest::collection::vec((any::<bool>(), 0u8..24, any::<u8>()), 1..120)
    ) {
        let mut txn = Intention::new(Snapshot::empty(), 1);
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        for (is_put, k, v) in ops {
            let key = vec![b'k', k];
            if is_put {
                txn.put(&key, &[v]);
                model.insert(key, vec![v]);
            } else {
                txn.delete(&key);
                model.remove(&key);
            }

            if let Some(root) = txn.root() {
                verify::check_tree(root).unwrap();
                let got: Vec<_> = verify::collect_inorder(root)
                    .into_iter()
                    .map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .collect();
                let want: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                prop_assert_eq!(got, want);
            } else {
                prop_assert!(model.is_empty());
            }
        }
    }
}
