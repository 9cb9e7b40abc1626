//! End-to-end lifecycle tests against the public API: host start/checkpoint/stop, restarts over the same backing
//! stores, and concurrent writers racing saves.
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};

use opal_persist::*;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Quest {
    id: String,
    stage: i64,
    rewards: Vec<String>,
}

impl Persisted for Quest {
    fn descriptor() -> Result<EntityDescriptor> {
        let mut b = EntityBuilder::new("world", "quest");
        b.add_text_column("id", true, false)?;
        b.add_integer_column("stage", false, false)?;
        b.add_list_column("rewards", ColumnType::Text)?;
        b.build()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Account {
    id: i64,
    name: String,
}

impl Persisted for Account {
    fn descriptor() -> Result<EntityDescriptor> {
        let mut b = EntityBuilder::new("accounts", "account");
        b.add_integer_column("id", true, false)?;
        b.add_text_column("name", false, false)?;
        b.build()
    }
}

fn quest(id: &str, stage: i64, rewards: &[&str]) -> Quest {
    Quest {
        id: id.into(),
        stage,
        rewards: rewards.iter().map(|s| s.to_string()).collect(),
    }
}

#[test]
fn survives_a_host_restart() {
    opal_logging::log_to_stderr();
    let dir = tempfile::TempDir::new().unwrap();
    let factory = MemoryStoreFactory::new();

    {
        let engine = Engine::new(dir.path().join("data"), factory.clone()).unwrap();
        assert!(engine.put(quest("dragon", 2, &["gold", "sword"])));
        assert!(engine.put(Account {
            id: 7,
            name: "alice".into()
        }));
        engine.save().unwrap();
        assert_eq!(engine.get_schema_list().len(), 2);
        assert_eq!(
            factory.store("world").table_names(),
            vec![
                "quest".to_string(),
                "quest_rewards".to_string(),
                "versions".to_string()
            ]
        );
        engine.disconnect();
    }

    // A fresh engine over the same stores sees everything, lists included.
    let engine = Engine::new(dir.path().join("data"), factory).unwrap();
    let reloaded: Quest = engine.get::<Quest>("dragon").unwrap();
    assert_eq!(reloaded, quest("dragon", 2, &["gold", "sword"]));
    let account: Account = engine.get::<Account>(7i64).unwrap();
    assert_eq!(account.name, "alice");
}

#[test]
fn checkpoint_saves_are_cumulative() {
    opal_logging::log_to_stderr();
    let dir = tempfile::TempDir::new().unwrap();
    let factory = MemoryStoreFactory::new();
    let engine = Engine::new(dir.path().join("data"), factory.clone()).unwrap();

    engine.put(quest("dragon", 1, &[]));
    engine.save().unwrap();
    engine.put(quest("dragon", 2, &["gold"]));
    engine.put(quest("hydra", 1, &[]));
    engine.save().unwrap();

    engine.clear();
    let mut all: Vec<Quest> = vec![];
    engine.get_all(&mut all);
    all.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(all, vec![quest("dragon", 2, &["gold"]), quest("hydra", 1, &[])]);
}

/// Writes racing an engine-wide save are never lost; they land in that pass or the next.
#[test]
fn concurrent_writers_lose_nothing() {
    opal_logging::log_to_stderr();
    let dir = tempfile::TempDir::new().unwrap();
    let factory = MemoryStoreFactory::new();
    let engine = Arc::new(Engine::new(dir.path().join("data"), factory.clone()).unwrap());

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    assert!(engine.put(Account {
                        id: w * 1000 + i,
                        name: format!("acct{}", w * 1000 + i),
                    }));
                }
            })
        })
        .collect();
    let saver = {
        let engine = engine.clone();
        std::thread::spawn(move || {
            for _ in 0..20 {
                engine.save().unwrap();
            }
        })
    };
    for handle in writers {
        handle.join().unwrap();
    }
    saver.join().unwrap();
    engine.save().unwrap();

    // Reload from the backend only.
    engine.clear();
    let mut all: Vec<Account> = vec![];
    engine.get_all(&mut all);
    assert_eq!(all.len(), 200);
}
