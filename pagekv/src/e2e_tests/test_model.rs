//! Randomized operations checked against an in-memory model.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::e2e_tests::helpers::{TestDb, assert_pages_accounted, key};
use crate::storage::{FaultConfig, TransactionError, btree};

type Model = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

const COLLECTIONS: [&str; 3] = ["alpha", "beta", "gamma"];

/// Apply one random transaction. Returns the model it leaves behind if its
/// commit lands, and the commit outcome. Staging never touches storage; only
/// the commit can fail.
fn random_tx(
    t: &TestDb,
    rng: &mut StdRng,
    committed: &Model,
) -> (Model, Result<(), TransactionError>) {
    let mut model = committed.clone();
    let mut tx = t.db.write_tx().unwrap();

    for _ in 0..rng.random_range(1..60) {
        let name = COLLECTIONS[rng.random_range(0..COLLECTIONS.len())];
        let roll = rng.random_range(0..100);

        if roll < 3 {
            if model.remove(name).is_some() {
                tx.delete_collection(name.as_bytes()).unwrap();
            }
            continue;
        }

        if !model.contains_key(name) {
            tx.create_collection(name.as_bytes()).unwrap();
            model.insert(name.to_string(), BTreeMap::new());
        }
        let entries = model.get_mut(name).unwrap();
        let mut c = tx.get_collection(name.as_bytes()).unwrap().unwrap();
        let k = key(rng.random_range(0..400));

        if roll < 70 {
            let len = rng.random_range(0..150);
            let value: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            c.put(k.as_bytes(), &value).unwrap();
            entries.insert(k, value);
        } else {
            let removed = c.remove(k.as_bytes()).unwrap();
            assert_eq!(removed, entries.remove(&k).is_some());
        }
    }

    if rng.random_bool(0.8) {
        let outcome = tx.commit();
        (model, outcome)
    } else {
        let outcome = tx.rollback();
        (committed.clone(), outcome)
    }
}

fn assert_matches_model(t: &TestDb, model: &Model) {
    let mut tx = t.db.read_tx().unwrap();
    let names: Vec<Vec<u8>> = tx.collections().unwrap();
    let expected: Vec<Vec<u8>> = model.keys().map(|n| n.as_bytes().to_vec()).collect();
    assert_eq!(names, expected);

    assert!(btree::verify(&tx, tx.root()).is_ok());
    for (name, entries) in model {
        let root = tx.get_collection(name.as_bytes()).unwrap().unwrap().root();
        assert_eq!(btree::verify(&tx, root).unwrap(), entries.len());

        let c = tx.get_collection(name.as_bytes()).unwrap().unwrap();
        let actual: Vec<(Vec<u8>, Vec<u8>)> = c
            .items()
            .unwrap()
            .into_iter()
            .map(|item| (item.key, item.value))
            .collect();
        let wanted: Vec<(Vec<u8>, Vec<u8>)> = entries
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.clone()))
            .collect();
        assert_eq!(actual, wanted, "collection {name} diverged");
    }
}

#[test]
fn test_random_transactions_match_model() {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let mut t = TestDb::new(50);
    let mut model = Model::new();

    for round in 0..120 {
        let (next, outcome) = random_tx(&t, &mut rng, &model);
        outcome.unwrap();
        model = next;
        assert_matches_model(&t, &model);
        assert_pages_accounted(&t.db);

        if round % 25 == 24 {
            t = t.reopen();
            assert_matches_model(&t, &model);
            assert_pages_accounted(&t.db);
        }
    }
}

#[test]
fn test_random_faults_never_corrupt() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut t = TestDb::new(51);
    let mut model = Model::new();

    for _ in 0..80 {
        t.storage.set_fault_config(FaultConfig {
            write_error_rate: 0.02,
            sync_error_rate: 0.05,
            partial_write_rate: 0.02,
            ..FaultConfig::default()
        });
        let before = t.db.stats().unwrap().tx_id;
        let (staged, outcome) = random_tx(&t, &mut rng, &model);
        t.storage.disarm();

        if outcome.is_ok() {
            model = staged;
            t = t.crash_and_reopen();
        } else if matches!(t.db.write_tx(), Err(TransactionError::NeedsReopen)) {
            // The meta page write failed part way. Without a crash, page 0
            // holds whatever reached it: the new commit or the previous one.
            t = t.reopen();
            if t.db.stats().unwrap().tx_id > before {
                model = staged;
            }
        } else {
            // A failed commit leaves the last durable commit, which is all a
            // crash can show.
            t = t.crash_and_reopen();
        }
        assert_matches_model(&t, &model);
        assert_pages_accounted(&t.db);
    }
}
