//! Several contexts of one origin talking over the shared hub and store.

mod common;

use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use tabsync::{
    Cache, DbEventType, DbSelfDelivery, Event, EventCategory, InsertOptions, Key, Tier,
};

use common::{collector, next_db, origin, quiet, wait_until};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: i64,
    title: String,
}

#[tokio::test]
async fn table_changes_reach_every_context() {
    let dir = tempfile::tempdir().unwrap();
    let origin = origin(&dir, DbSelfDelivery::Always);
    let a = origin.open_context().unwrap();
    let b = origin.open_context().unwrap();
    let (handler_a, mut rx_a) = collector();
    let (handler_b, mut rx_b) = collector();
    a.bus().add_db_event_handler(handler_a);
    b.bus().add_db_event_handler(handler_b);

    let users_a = a.table::<User>("users").unwrap();
    let users_b = b.table::<User>("users").unwrap();
    let key = users_a
        .insert(
            &User {
                id: 1,
                title: "x".into(),
            },
            InsertOptions::new(),
        )
        .unwrap();
    assert_eq!(key, Key::Int(1));

    for rx in [&mut rx_a, &mut rx_b] {
        let data = next_db(rx).await;
        assert_eq!(data.kind, DbEventType::Insert);
        assert_eq!(data.table.as_deref(), Some("users"));
        assert_eq!(data.db.as_deref(), Some("shared"));
        assert_eq!(data.keys, vec![Key::Int(1)]);
    }

    let removed = users_b.remove(1).unwrap();
    assert_eq!(removed, vec![Key::Int(1)]);
    for rx in [&mut rx_a, &mut rx_b] {
        let data = next_db(rx).await;
        assert_eq!(data.kind, DbEventType::Remove);
        assert_eq!(data.table.as_deref(), Some("users"));
        assert_eq!(data.keys, vec![Key::Int(1)]);
    }

    assert_eq!(users_a.count().unwrap(), 0);
    assert_eq!(users_b.count().unwrap(), 0);
    assert!(quiet(&mut rx_a).await.is_empty());
    assert!(quiet(&mut rx_b).await.is_empty());
}

async fn token_invalidation(policy: DbSelfDelivery) -> (Vec<Event>, Vec<Event>) {
    let dir = tempfile::tempdir().unwrap();
    let origin = origin(&dir, policy);
    let a = origin.open_context().unwrap();
    let b = origin.open_context().unwrap();
    let (handler_a, mut rx_a) = collector();
    let (handler_b, mut rx_b) = collector();
    a.bus().add_db_event_handler(handler_a);
    b.bus().add_db_event_handler(handler_b);

    a.cache().insert(Tier::Persistent, "TOKEN", "abc").unwrap();

    let token: Option<String> = b.cache().get(Tier::Persistent, "TOKEN").unwrap();
    assert_eq!(token.as_deref(), Some("abc"));
    (quiet(&mut rx_a).await, quiet(&mut rx_b).await)
}

fn invalidated_keys(events: &[Event]) -> Vec<Vec<Key>> {
    events
        .iter()
        .filter_map(Event::db_data)
        .filter(|data| data.kind == DbEventType::CacheInvalidation)
        .map(|data| data.keys)
        .collect()
}

#[tokio::test]
async fn cache_invalidation_with_default_policy_reaches_self() {
    let (own, remote) = token_invalidation(DbSelfDelivery::Always).await;
    assert_eq!(invalidated_keys(&remote), vec![vec![Key::from("TOKEN")]]);
    assert_eq!(invalidated_keys(&own), vec![vec![Key::from("TOKEN")]]);
}

#[tokio::test]
async fn cache_invalidation_honoring_no_self_skips_sender() {
    let (own, remote) = token_invalidation(DbSelfDelivery::HonorNoSelf).await;
    assert_eq!(invalidated_keys(&remote), vec![vec![Key::from("TOKEN")]]);
    assert!(own.is_empty(), "sender saw {own:?}");
}

#[tokio::test]
async fn one_leader_per_category_and_failover() {
    let dir = tempfile::tempdir().unwrap();
    let origin = origin(&dir, DbSelfDelivery::Always);
    let contexts: Vec<_> = (0..3).map(|_| origin.open_context().unwrap()).collect();

    for category in EventCategory::ALL {
        let settled = wait_until(|| {
            contexts
                .iter()
                .filter(|ctx| ctx.bus().is_leader(category))
                .count()
                == 1
        })
        .await;
        assert!(settled, "{category} never settled on one leader");
    }

    let leader = contexts
        .iter()
        .position(|ctx| ctx.bus().is_db_event_leader())
        .unwrap();
    contexts[leader].close();

    let survivors: Vec<_> = contexts
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != leader)
        .map(|(_, ctx)| ctx)
        .collect();
    let took_over = wait_until(|| {
        survivors
            .iter()
            .filter(|ctx| ctx.bus().is_db_event_leader())
            .count()
            == 1
    })
    .await;
    assert!(took_over, "no survivor took over the db channel");
    assert!(!contexts[leader].bus().is_db_event_leader());
}

#[tokio::test]
async fn leader_only_events_reach_the_leader_alone() {
    let dir = tempfile::tempdir().unwrap();
    let origin = origin(&dir, DbSelfDelivery::Always);
    let a = origin.open_context().unwrap();
    let b = origin.open_context().unwrap();
    let c = origin.open_context().unwrap();
    let all = [&a, &b, &c];
    assert!(
        wait_until(|| all.iter().filter(|ctx| ctx.bus().is_ui_event_leader()).count() == 1).await
    );

    let (handler_b, mut rx_b) = collector();
    let (handler_c, mut rx_c) = collector();
    b.bus().add_ui_event_handler(handler_b);
    c.bus().add_ui_event_handler(handler_c);

    a.bus()
        .broadcast_ui_event(Event::new(EventCategory::Ui).leader_only().no_self())
        .unwrap();

    let seen_b = quiet(&mut rx_b).await.len();
    let seen_c = quiet(&mut rx_c).await.len();
    let expected_b = usize::from(b.bus().is_ui_event_leader());
    let expected_c = usize::from(c.bus().is_ui_event_leader());
    assert_eq!((seen_b, seen_c), (expected_b, expected_c));
}

#[tokio::test]
async fn session_tier_is_shared_memory_tier_is_not() {
    let dir = tempfile::tempdir().unwrap();
    let origin = origin(&dir, DbSelfDelivery::Always);
    let a = origin.open_context().unwrap();
    let b = origin.open_context().unwrap();

    let write = |cache: &Cache| {
        cache.insert(Tier::Session, "step", &3).unwrap();
        cache.insert(Tier::Memory, "draft", "hi").unwrap();
    };
    write(a.cache());

    let step: Option<i32> = b.cache().get(Tier::Session, "step").unwrap();
    let draft: Option<String> = b.cache().get(Tier::Memory, "draft").unwrap();
    assert_eq!(step, Some(3));
    assert_eq!(draft, None);

    assert_eq!(b.cache().clear(Tier::Session).unwrap(), vec!["step".to_string()]);
    let step: Option<i32> = a.cache().get(Tier::Session, "step").unwrap();
    assert_eq!(step, None);
}
