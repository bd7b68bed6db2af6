//! Event bus unit tests

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::bus::{
        BusConfig, BusError, DbEventData, DbEventType, DbSelfDelivery, ElectionState, Event,
        EventBus, EventCategory, EventHandler, Hub,
    };
    use crate::db::Key;

    const QUIET: Duration = Duration::from_millis(150);

    fn fast_config() -> BusConfig {
        BusConfig::default().with_timing(Duration::from_millis(20), Duration::from_millis(100))
    }

    fn collector() -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn EventHandler> = Arc::new(move |event: &Event| {
            let _ = tx.send(event.clone());
        });
        (handler, rx)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("event arrives in time")
            .expect("sender alive")
    }

    async fn settled(a: &EventBus, b: &EventBus, category: EventCategory) -> bool {
        wait_until(|| {
            let states = [a.election_state(category), b.election_state(category)];
            !states.contains(&ElectionState::Candidate) && (a.is_leader(category) ^ b.is_leader(category))
        })
        .await
    }

    // -- local delivery -------------------------------------------------------

    #[tokio::test]
    async fn test_self_delivery_is_synchronous() {
        let hub = Hub::default();
        let bus = EventBus::new(&hub, fast_config());
        let (handler, mut rx) = collector();
        bus.add_ui_event_handler(handler);

        bus.broadcast_ui_event(Event::new(EventCategory::Ui).with_field("x", 1))
            .unwrap();

        let event = rx.try_recv().expect("delivered before broadcast returns");
        assert_eq!(event.kind, EventCategory::Ui);
        assert_eq!(event.data["x"], json!(1));
    }

    #[tokio::test]
    async fn test_no_self_suppresses_local_handlers() {
        let hub = Hub::default();
        let bus = EventBus::new(&hub, fast_config());
        let (handler, mut rx) = collector();
        bus.add_ipc_event_handler(handler);

        bus.broadcast_ipc_event(Event::new(EventCategory::Ipc).no_self())
            .unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_category_method_overrides_kind() {
        let hub = Hub::default();
        let bus = EventBus::new(&hub, fast_config());
        let (handler, mut rx) = collector();
        bus.add_tracking_event_handler(handler);

        bus.broadcast_tracking_event(Event::new(EventCategory::Ui)).unwrap();

        assert_eq!(rx.try_recv().unwrap().kind, EventCategory::Tracking);
    }

    #[tokio::test]
    async fn test_db_self_delivery_policies() {
        let hub = Hub::default();
        let event = DbEventData::cache_invalidation(vec![Key::from("TOKEN")])
            .into_event()
            .no_self();

        let always = EventBus::new(&hub, fast_config());
        let (handler, mut rx) = collector();
        always.add_db_event_handler(handler);
        always.broadcast_db_event(event.clone()).unwrap();
        let data = rx.try_recv().unwrap().db_data().unwrap();
        assert_eq!(data.kind, DbEventType::CacheInvalidation);

        let honor = EventBus::new(
            &hub,
            fast_config().with_db_self_delivery(DbSelfDelivery::HonorNoSelf),
        );
        let (handler, mut rx) = collector();
        honor.add_db_event_handler(handler);
        honor.broadcast_db_event(event).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leader_only_is_ignored_for_self_delivery() {
        let hub = Hub::default();
        let bus = EventBus::new(&hub, fast_config());
        let (handler, mut rx) = collector();
        bus.add_ui_event_handler(handler);

        // Still a candidate, yet its own handler runs.
        assert!(!bus.is_ui_event_leader());
        bus.broadcast_ui_event(Event::new(EventCategory::Ui).leader_only())
            .unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order_and_remove_by_identity() {
        let hub = Hub::default();
        let bus = EventBus::new(&hub, fast_config());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let make = |tag: &'static str| -> Arc<dyn EventHandler> {
            let seen = seen.clone();
            Arc::new(move |_: &Event| seen.lock().unwrap().push(tag))
        };
        let first = make("first");
        let second = make("second");
        bus.add_api_event_handler(first.clone());
        bus.add_api_event_handler(second.clone());
        assert_eq!(bus.handler_count(EventCategory::Api), 2);

        bus.broadcast_api_event(Event::new(EventCategory::Api)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);

        bus.remove_api_event_handler(&first);
        bus.remove_api_event_handler(&first);
        let stranger = make("stranger");
        bus.remove_api_event_handler(&stranger);
        assert_eq!(bus.handler_count(EventCategory::Api), 1);

        seen.lock().unwrap().clear();
        bus.broadcast_api_event(Event::new(EventCategory::Api)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["second"]);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_delivery() {
        let hub = Hub::default();
        let bus = EventBus::new(&hub, fast_config());
        let calls = Arc::new(AtomicUsize::new(0));

        bus.add_ui_event_handler(Arc::new(|_: &Event| panic!("handler blew up")));
        let counter = calls.clone();
        bus.add_ui_event_handler(Arc::new(move |_: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bus.broadcast_ui_event(Event::new(EventCategory::Ui)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_after_close_fails() {
        let hub = Hub::default();
        let bus = EventBus::new(&hub, fast_config());
        bus.close();
        bus.close();

        assert!(bus.is_closed());
        assert_eq!(
            bus.broadcast_db_event(Event::new(EventCategory::Db)),
            Err(BusError::ChannelClosed("db_event".into()))
        );
        assert_eq!(bus.election_state(EventCategory::Db), ElectionState::Dead);
    }

    // -- cross-context delivery ----------------------------------------------

    #[tokio::test]
    async fn test_remote_delivery_reaches_other_context_once() {
        let hub = Hub::default();
        let a = EventBus::new(&hub, fast_config());
        let b = EventBus::new(&hub, fast_config());
        let (on_a, mut rx_a) = collector();
        let (on_b, mut rx_b) = collector();
        a.add_ipc_event_handler(on_a);
        b.add_ipc_event_handler(on_b);

        a.broadcast_ipc_event(Event::new(EventCategory::Ipc).with_field("hello", "tab"))
            .unwrap();

        let received = next_event(&mut rx_b).await;
        assert_eq!(received.data["hello"], json!("tab"));

        // Local delivery only; the transport never echoes back to the sender.
        assert!(rx_a.try_recv().is_ok());
        tokio::time::sleep(QUIET).await;
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_single_context_becomes_leader() {
        let hub = Hub::default();
        let bus = EventBus::new(&hub, fast_config());
        assert_eq!(bus.election_state(EventCategory::Db), ElectionState::Candidate);

        assert!(wait_until(|| EventCategory::ALL.iter().all(|c| bus.is_leader(*c))).await);
    }

    #[tokio::test]
    async fn test_exactly_one_leader_and_failover() {
        let hub = Hub::default();
        let a = EventBus::new(&hub, fast_config());
        let b = EventBus::new(&hub, fast_config());

        assert!(settled(&a, &b, EventCategory::Db).await);
        let (leader, follower) = if a.is_db_event_leader() { (a, b) } else { (b, a) };

        leader.close();
        assert!(wait_until(|| follower.is_db_event_leader()).await);
    }

    #[tokio::test]
    async fn test_leader_only_event_reaches_only_the_leader() {
        let hub = Hub::default();
        let a = EventBus::new(&hub, fast_config());
        let b = EventBus::new(&hub, fast_config());
        assert!(settled(&a, &b, EventCategory::Ui).await);
        let (leader, follower) = if a.is_ui_event_leader() { (a, b) } else { (b, a) };

        let (on_leader, mut rx_leader) = collector();
        let (on_follower, mut rx_follower) = collector();
        leader.add_ui_event_handler(on_leader);
        follower.add_ui_event_handler(on_follower);

        follower
            .broadcast_ui_event(Event::new(EventCategory::Ui).leader_only().no_self())
            .unwrap();
        assert!(next_event(&mut rx_leader).await.leader_only);

        leader
            .broadcast_ui_event(Event::new(EventCategory::Ui).leader_only().no_self())
            .unwrap();
        tokio::time::sleep(QUIET).await;
        assert!(rx_follower.try_recv().is_err());
    }

    // -- wire format ----------------------------------------------------------

    #[test]
    fn test_event_wire_names() {
        let event = Event::new(EventCategory::Db).no_self().with_field("keys", json!([]));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"type": "db_event", "noSelf": true, "leaderOnly": false, "data": {"keys": []}})
        );

        let parsed: Event = serde_json::from_value(json!({"type": "ui_event"})).unwrap();
        assert_eq!(parsed, Event::new(EventCategory::Ui));
    }

    #[test]
    fn test_db_event_data_round_trips_through_event() {
        let data = DbEventData::for_table(
            DbEventType::TableUpgrade,
            "app",
            "todos",
            vec![Key::Int(1), Key::from("a")],
        );
        let event = data.clone().into_event();
        assert_eq!(event.data["type"], json!("TABLE_UPGRADE"));
        assert_eq!(event.db_data(), Some(data));

        let cache = DbEventData::cache_invalidation(vec![]).into_event();
        assert!(!cache.data.contains_key("table"));
        assert_eq!(Event::new(EventCategory::Ui).db_data(), None);
    }
}
