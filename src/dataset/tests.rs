use super::*;
use crate::events::BusEvent;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Deserialize;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

fn open_store() -> (TempDir, DatasetStore) {
    let dir = tempdir().unwrap();
    let store = DatasetStore::open(dir.path().join("dataset.db"), TensorLedger::new()).unwrap();
    (dir, store)
}

fn vectors(ledger: &TensorLedger, count: usize, value: f32) -> Vec<FeatureVector> {
    (0..count)
        .map(|index| ledger.track(vec![value, index as f32, -value]))
        .collect()
}

fn record_events(store: &DatasetStore) -> Arc<Mutex<Vec<StoreEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in StoreEventKind::ALL {
        let seen = Arc::clone(&seen);
        store.events().on(kind, move |event: &StoreEvent| {
            seen.lock().unwrap().push(*event);
        });
    }
    seen
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct DummyModel {
    weights: Vec<f32>,
}

#[test]
fn add_card_inserts_then_renames() {
    let (_dir, store) = open_store();
    let events = record_events(&store);
    store.add_card(ClassKey(1), "cat").unwrap();
    store
        .set_training_inputs(ClassKey(1), vectors(store.ledger(), 3, 1.0))
        .unwrap();
    store.add_card(ClassKey(1), "kitten").unwrap();

    let card = store.get_card(ClassKey(1)).unwrap();
    assert_eq!(card.name, "kitten");
    assert_eq!(card.features.len(), 3);
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            StoreEvent::AddCard { key: ClassKey(1) },
            StoreEvent::ChangeCard { key: ClassKey(1) },
            StoreEvent::ChangeCard { key: ClassKey(1) },
        ]
    );
}

#[test]
fn set_training_inputs_requires_existing_key() {
    let (_dir, store) = open_store();
    let events = record_events(&store);
    let err = store
        .set_training_inputs(ClassKey(9), vectors(store.ledger(), 1, 0.0))
        .unwrap_err();
    assert!(matches!(err, StoreError::UnknownKey(ClassKey(9))));
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(store.ledger().live(), 0);
}

#[test]
fn superseded_features_are_released() {
    let (_dir, store) = open_store();
    store.add_card(ClassKey(0), "cat").unwrap();
    store
        .set_training_inputs(ClassKey(0), vectors(store.ledger(), 5, 1.0))
        .unwrap();
    assert_eq!(store.ledger().live(), 5);
    store
        .set_training_inputs(ClassKey(0), vectors(store.ledger(), 2, 2.0))
        .unwrap();
    assert_eq!(store.ledger().live(), 2);
    assert_eq!(store.sample_count(ClassKey(0)), 2);
}

#[test]
fn remove_card_releases_features_and_notifies() {
    let (_dir, store) = open_store();
    store.add_card(ClassKey(0), "cat").unwrap();
    store
        .set_training_inputs(ClassKey(0), vectors(store.ledger(), 4, 1.0))
        .unwrap();
    let events = record_events(&store);
    store.remove_card(ClassKey(0)).unwrap();
    assert!(store.get_card(ClassKey(0)).is_none());
    assert_eq!(store.ledger().live(), 0);
    assert_eq!(
        *events.lock().unwrap(),
        vec![StoreEvent::DeleteCard { key: ClassKey(0) }]
    );
}

#[test]
fn remove_missing_card_is_silent() {
    let (_dir, store) = open_store();
    store.add_card(ClassKey(1), "dog").unwrap();
    let events = record_events(&store);
    store.remove_card(ClassKey(5)).unwrap();
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(store.len(), 1);
}

#[test]
fn clear_empties_store_and_deletes_model() {
    let (_dir, store) = open_store();
    store.add_card(ClassKey(0), "cat").unwrap();
    store.add_card(ClassKey(1), "dog").unwrap();
    store
        .set_training_inputs(ClassKey(1), vectors(store.ledger(), 3, 1.0))
        .unwrap();
    store
        .save_model(&DummyModel {
            weights: vec![1.0],
        })
        .unwrap();
    let events = record_events(&store);

    store.clear().unwrap();
    assert_eq!(store.len(), 0);
    assert!(store.is_empty());
    assert_eq!(store.ledger().live(), 0);
    assert_eq!(*events.lock().unwrap(), vec![StoreEvent::Reset]);
    let err = store.load_model::<DummyModel>().unwrap_err();
    assert!(matches!(err, StoreError::ModelNotFound(name) if name == MODEL_ARTIFACT_NAME));
    assert_eq!(store.allocate_key().unwrap(), ClassKey(1));
}

#[test]
fn allocated_keys_strictly_increase_across_restarts() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dataset.db");
    let mut issued = Vec::new();
    {
        let store = DatasetStore::open(&path, TensorLedger::new()).unwrap();
        let first = store.allocate_key().unwrap();
        assert_eq!(first, ClassKey(1));
        store.add_card(first, "a").unwrap();
        let second = store.allocate_key().unwrap();
        store.add_card(second, "b").unwrap();
        store.remove_card(second).unwrap();
        issued.extend([first, second]);
    }
    let store = DatasetStore::open(&path, TensorLedger::new()).unwrap();
    let third = store.allocate_key().unwrap();
    issued.push(third);
    assert!(issued.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(third, ClassKey(3));
}

#[test]
fn explicit_keys_bump_the_counter() {
    let (_dir, store) = open_store();
    store.add_card(ClassKey(7), "seven").unwrap();
    assert_eq!(store.allocate_key().unwrap(), ClassKey(8));
}

#[test]
fn random_key_reaches_every_class() {
    let (_dir, store) = open_store();
    let mut rng = StdRng::seed_from_u64(7);
    assert!(matches!(
        store.get_random_with(&mut rng),
        Err(StoreError::EmptyDataset)
    ));
    for key in 0..4 {
        store.add_card(ClassKey(key), &format!("class {key}")).unwrap();
    }
    let mut counts = [0usize; 4];
    let draws = 4_000;
    for _ in 0..draws {
        let key = store.get_random_with(&mut rng).unwrap();
        counts[key.0 as usize] += 1;
    }
    for count in counts {
        let share = count as f64 / draws as f64;
        assert!((share - 0.25).abs() < 0.05, "share {share} too far from uniform");
    }
    assert!(store.contains(store.get_random().unwrap()));
}

#[test]
fn data_and_model_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dataset.db");
    {
        let store = DatasetStore::open(&path, TensorLedger::new()).unwrap();
        store.add_card(ClassKey(2), "owl").unwrap();
        store
            .set_training_inputs(ClassKey(2), vectors(store.ledger(), 3, 0.5))
            .unwrap();
        store
            .save_model(&DummyModel {
                weights: vec![0.25, -1.0],
            })
            .unwrap();
    }
    let ledger = TensorLedger::new();
    let store = DatasetStore::open(&path, ledger.clone()).unwrap();
    let card = store.get_card(ClassKey(2)).unwrap();
    assert_eq!(card.name, "owl");
    assert_eq!(card.features.len(), 3);
    assert_eq!(&card.features[1][..], &[0.5, 1.0, -0.5]);
    assert_eq!(ledger.live(), 3);
    assert_eq!(
        store.load_model::<DummyModel>().unwrap(),
        DummyModel {
            weights: vec![0.25, -1.0]
        }
    );
    assert!(store.remove_model().unwrap());
    assert!(!store.has_model().unwrap());
}

#[test]
fn handlers_observe_committed_state_and_may_write() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dataset.db");
    let store = Arc::new(DatasetStore::open(&path, TensorLedger::new()).unwrap());
    let observed = Arc::new(Mutex::new(Vec::new()));
    {
        let store_ref = Arc::downgrade(&store);
        let observed = Arc::clone(&observed);
        let db_path = path.clone();
        store.events().on(StoreEventKind::AddCard, move |event| {
            let Some(store) = store_ref.upgrade() else {
                return;
            };
            let key = event.key().unwrap();
            let reader = Connection::open(&db_path).unwrap();
            let durable: i64 = reader
                .query_row(
                    "SELECT COUNT(*) FROM cards WHERE card_key = ?1",
                    [i64::from(key.0)],
                    |row| row.get(0),
                )
                .unwrap();
            observed.lock().unwrap().push((event.kind(), durable));
            if key == ClassKey(1) {
                store.add_card(ClassKey(2), "follow-up").unwrap();
            }
        });
    }
    store.add_card(ClassKey(1), "first").unwrap();
    assert_eq!(
        *observed.lock().unwrap(),
        vec![(StoreEventKind::AddCard, 1), (StoreEventKind::AddCard, 1)]
    );
    assert!(store.contains(ClassKey(2)));
}

#[test]
fn failed_transaction_leaves_mirror_untouched() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dataset.db");
    let store = DatasetStore::open(&path, TensorLedger::new()).unwrap();
    store.add_card(ClassKey(0), "cat").unwrap();
    store
        .set_training_inputs(ClassKey(0), vectors(store.ledger(), 2, 1.0))
        .unwrap();

    let saboteur = Connection::open(&path).unwrap();
    saboteur
        .execute_batch(
            "CREATE TRIGGER reject_features BEFORE INSERT ON card_features
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )
        .unwrap();
    let events = record_events(&store);

    let err = store
        .set_training_inputs(ClassKey(0), vectors(store.ledger(), 5, 9.0))
        .unwrap_err();
    assert!(matches!(err, StoreError::Transaction(_)));
    assert!(events.lock().unwrap().is_empty());
    let card = store.get_card(ClassKey(0)).unwrap();
    assert_eq!(card.features.len(), 2);
    assert_eq!(card.features[0][0], 1.0);
    drop(card);
    assert_eq!(store.ledger().live(), 2);

    saboteur
        .execute_batch("DROP TRIGGER reject_features;")
        .unwrap();
    drop(store);
    let reopened = DatasetStore::open(&path, TensorLedger::new()).unwrap();
    assert_eq!(reopened.sample_count(ClassKey(0)), 2);
}

#[test]
fn concurrent_writers_are_serialized() {
    let (_dir, store) = open_store();
    let store = Arc::new(store);
    let events = record_events(&store);
    let handles: Vec<_> = (0..4u32)
        .map(|worker| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for index in 0..10u32 {
                    store
                        .add_card(ClassKey(worker * 100 + index), "card")
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(store.len(), 40);
    assert_eq!(events.lock().unwrap().len(), 40);
}
