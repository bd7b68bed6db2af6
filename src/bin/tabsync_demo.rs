use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tabsync::{
    AppError, Config, DatabaseSchema, DbEventData, Event, EventCategory, EventHandler,
    InsertOptions, Origin, Tier,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Todo {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    title: String,
    done: bool,
}

#[tokio::main]
async fn main() {
    tabsync::init_tracing();
    if let Err(error) = run().await {
        eprintln!("tabsync demo failed: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let config = Config::from_env()?;
    let schema = DatabaseSchema::new("demo", 1).table("todos", "++id,title,done")?;
    let liveness = config.liveness_timeout();
    let origin = Origin::new(config, schema)?;

    let first = origin.open_context()?;
    let second = origin.open_context()?;

    let listener: Arc<dyn EventHandler> = Arc::new(|event: &Event| {
        if let Some(data) = event.db_data() {
            print_db_event("second", &data);
        }
    });
    second.bus().add_db_event_handler(listener);

    // Let both contexts settle their elections.
    tokio::time::sleep(liveness + Duration::from_millis(100)).await;
    for category in EventCategory::ALL {
        println!(
            "{category:<8} first={} second={}",
            first.bus().election_state(category),
            second.bus().election_state(category)
        );
    }

    let todos = first.table::<Todo>("todos")?;
    let key = todos.insert(
        &Todo {
            id: None,
            title: "write the demo".into(),
            done: false,
        },
        InsertOptions::new(),
    )?;
    println!("first inserted todo {key}");
    first.cache().insert(Tier::Persistent, "TOKEN", "demo-token")?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let seen = second.table::<Todo>("todos")?.count()?;
    println!("second sees {seen} todo(s)");

    first.close();
    tokio::time::sleep(liveness + Duration::from_millis(100)).await;
    println!(
        "after first closed, second leads db: {}",
        second.bus().is_db_event_leader()
    );
    second.close();
    Ok(())
}

fn print_db_event(context: &str, data: &DbEventData) {
    let keys: Vec<String> = data.keys.iter().map(ToString::to_string).collect();
    println!(
        "{context} got {:?} table={} keys=[{}]",
        data.kind,
        data.table.as_deref().unwrap_or("-"),
        keys.join(", ")
    );
}
