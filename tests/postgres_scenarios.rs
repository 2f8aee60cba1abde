//! Dispatcher scenarios against a live PostgreSQL. Ignored by default; run
//! with `DATABASE_URL=... cargo test -- --ignored`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::Notify;
use uuid::Uuid;

use pg_event_ledger::event_sourcing::store::{EventRepository, PostgresEventRepository, PostgresSubscriptionStore};
use pg_event_ledger::event_sourcing::{
    DispatcherConfig, DomainEvent, EncodedEvent, EventHandler, PoisonPolicy, StoredEvent, SubscriptionDispatcher,
};
use pg_event_ledger::utils::RetryConfig;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", content = "data")]
enum Chime {
    Rang(u32),
}

impl DomainEvent for Chime {
    const KINDS: &'static [&'static str] = &["Rang"];

    fn kind(&self) -> &'static str {
        "Rang"
    }
}

fn rang(n: u32) -> Vec<EncodedEvent> {
    vec![EncodedEvent { kind: "Rang".to_string(), payload: json!({ "kind": "Rang", "data": n }) }]
}

#[derive(Default)]
struct Bells {
    heard: Mutex<Vec<u32>>,
}

impl Bells {
    fn heard(&self) -> Vec<u32> {
        self.heard.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler<Chime> for Bells {
    async fn handle(&self, event: Chime, _stored: &StoredEvent) -> anyhow::Result<()> {
        let Chime::Rang(n) = event;
        self.heard.lock().unwrap().push(n);
        Ok(())
    }
}

/// Parks on its first event until released
struct Parked {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl EventHandler<Chime> for Parked {
    async fn handle(&self, _event: Chime, _stored: &StoredEvent) -> anyhow::Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn test_postgres_parked_subscription_does_not_stall_the_others() {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres tests");
    let pool = PgPool::connect(&url).await.unwrap();
    let repository = PostgresEventRepository::new(pool.clone());
    repository.migrate().await.unwrap();

    let kind = format!("Bell-{}", Uuid::new_v4().simple());
    let (slow, fast) = (format!("slow-{kind}"), format!("fast-{kind}"));
    let parked = Arc::new(Parked { entered: Notify::new(), release: Notify::new() });
    let bells = Arc::new(Bells::default());

    let config = DispatcherConfig {
        poll_interval: Duration::from_millis(50),
        initial_delay: Duration::ZERO,
        batch_size: 100,
        retry: RetryConfig::immediate(1),
        poison_policy: PoisonPolicy::DeadLetter,
    };
    let mut dispatcher = SubscriptionDispatcher::new(Arc::new(PostgresSubscriptionStore::new(pool.clone())), config);
    dispatcher.register_handler::<Chime, _>(&slow, &kind, parked.clone()).unwrap();
    dispatcher.register_handler::<Chime, _>(&fast, &kind, bells.clone()).unwrap();
    let dispatcher = Arc::new(dispatcher);

    repository.append(Uuid::new_v4(), &kind, 0, rang(1)).await.unwrap();

    let stuck = {
        let dispatcher = dispatcher.clone();
        let slow = slow.clone();
        tokio::spawn(async move { dispatcher.dispatch(&slow).await })
    };
    parked.entered.notified().await;

    repository.append(Uuid::new_v4(), &kind, 0, rang(2)).await.unwrap();
    for _ in 0..50 {
        dispatcher.dispatch(&fast).await.unwrap();
        if bells.heard().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(bells.heard(), vec![1, 2], "fast subscription must not wait for the parked one");

    parked.release.notify_one();
    let outcome = stuck.await.unwrap().unwrap();
    assert_eq!(outcome.delivered, 1);
}
