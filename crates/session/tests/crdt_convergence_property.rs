use std::sync::{Arc, Mutex};

use cowrite_session::engine::doc::{ReplicatedDoc, UpdateSource, DEFAULT_FIELD};
use proptest::prelude::*;

const REPLICAS: usize = 3;

#[derive(Debug, Clone)]
enum Edit {
    /// `at` is scaled onto the current text length.
    Insert { replica: usize, at: u8, text: String },
    Delete { replica: usize, at: u8, len: u8 },
    /// Partial sync between two replicas mid-sequence.
    Sync { from: usize, to: usize },
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        4 => (0..REPLICAS, any::<u8>(), "[a-z0-9 ]{1,6}")
            .prop_map(|(replica, at, text)| Edit::Insert { replica, at, text }),
        2 => (0..REPLICAS, any::<u8>(), 1u8..6)
            .prop_map(|(replica, at, len)| Edit::Delete { replica, at, len }),
        1 => (0..REPLICAS, 0..REPLICAS).prop_map(|(from, to)| Edit::Sync { from, to }),
    ]
}

struct Replica {
    doc: ReplicatedDoc,
    log: Arc<Mutex<Vec<Vec<u8>>>>,
    _subscription: yrs::Subscription,
}

impl Replica {
    fn new(client_id: u64) -> Self {
        let doc = ReplicatedDoc::with_client_id(client_id);
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for_cb = Arc::clone(&log);
        let subscription = doc
            .observe_updates(move |source, update| {
                if source == UpdateSource::Local {
                    log_for_cb.lock().unwrap().push(update.to_vec());
                }
            })
            .unwrap();
        Self { doc, log, _subscription: subscription }
    }
}

fn scaled(at: u8, len: u32) -> u32 {
    (u32::from(at) * (len + 1)) / 256
}

fn apply(replicas: &[Replica], edit: &Edit) {
    match edit {
        Edit::Insert { replica, at, text } => {
            let doc = &replicas[*replica].doc;
            let index = scaled(*at, doc.text_len(DEFAULT_FIELD));
            doc.insert_text(DEFAULT_FIELD, index, text).unwrap();
        }
        Edit::Delete { replica, at, len } => {
            let doc = &replicas[*replica].doc;
            let current = doc.text_len(DEFAULT_FIELD);
            if current == 0 {
                return;
            }
            let index = scaled(*at, current - 1);
            let len = u32::from(*len).min(current - index);
            doc.remove_text(DEFAULT_FIELD, index, len).unwrap();
        }
        Edit::Sync { from, to } if from != to => {
            let diff = replicas[*from]
                .doc
                .encode_diff(&replicas[*to].doc.encode_state_vector())
                .unwrap();
            replicas[*to].doc.apply_update(&diff).unwrap();
        }
        Edit::Sync { .. } => {}
    }
}

/// Deterministic shuffle so a failing case reproduces from its seed.
fn shuffled<T>(mut items: Vec<T>, mut seed: u64) -> Vec<T> {
    for i in (1..items.len()).rev() {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let j = (seed % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
    items
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 96, .. ProptestConfig::default() })]

    #[test]
    fn replicas_converge_regardless_of_delivery_order(
        edits in prop::collection::vec(edit_strategy(), 1..80),
        seed in 1u64..u64::MAX,
    ) {
        let replicas: Vec<Replica> = (0..REPLICAS).map(|i| Replica::new(i as u64 + 1)).collect();
        for edit in &edits {
            apply(&replicas, edit);
        }

        let updates: Vec<Vec<u8>> = replicas
            .iter()
            .flat_map(|replica| replica.log.lock().unwrap().clone())
            .collect();

        let in_order = ReplicatedDoc::with_client_id(100);
        for update in &updates {
            in_order.apply_update(update).unwrap();
        }

        // Shuffled, with every update delivered twice.
        let mut doubled = updates.clone();
        doubled.extend(updates.iter().cloned());
        let scrambled = ReplicatedDoc::with_client_id(101);
        for update in shuffled(doubled, seed) {
            scrambled.apply_update(&update).unwrap();
        }

        let expected = in_order.get_text_string(DEFAULT_FIELD);
        prop_assert_eq!(scrambled.get_text_string(DEFAULT_FIELD), expected.clone());

        for replica in &replicas {
            for update in &updates {
                replica.doc.apply_update(update).unwrap();
            }
            prop_assert_eq!(replica.doc.get_text_string(DEFAULT_FIELD), expected.clone());
        }
    }
}

#[test]
fn concurrent_inserts_at_same_position_keep_both() {
    let replicas: Vec<Replica> = (0..2).map(|i| Replica::new(i as u64 + 1)).collect();
    replicas[0].doc.insert_text(DEFAULT_FIELD, 0, "shared ").unwrap();
    apply(&replicas, &Edit::Sync { from: 0, to: 1 });

    replicas[0].doc.insert_text(DEFAULT_FIELD, 7, "ava").unwrap();
    replicas[1].doc.insert_text(DEFAULT_FIELD, 7, "ben").unwrap();
    apply(&replicas, &Edit::Sync { from: 0, to: 1 });
    apply(&replicas, &Edit::Sync { from: 1, to: 0 });

    let merged = replicas[0].doc.get_text_string(DEFAULT_FIELD);
    assert_eq!(merged, replicas[1].doc.get_text_string(DEFAULT_FIELD));
    assert!(merged.starts_with("shared "));
    assert!(merged.contains("ava") && merged.contains("ben"));
}
