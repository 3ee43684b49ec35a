use futures_util::StreamExt;
use recordflow::{Client, MemoryService, Snapshot};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, Level};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub title: String,
    pub completed: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let client = Client::new(MemoryService::new());
    let record = client.record("todos/groceries");

    // Watch the record from a background task
    let watcher = {
        let record = client.record("todos/groceries");
        tokio::spawn(async move {
            let mut updates = record.observe(None);
            while let Some(item) = updates.next().await {
                match item {
                    Ok(Snapshot { id, data, .. }) => info!("todo '{}' is now {}", id, data),
                    Err(err) => {
                        info!("watch ended: {}", err);
                        break;
                    }
                }
            }
        })
    };

    record
        .set(Todo {
            title: "buy groceries".to_string(),
            completed: false,
        })
        .await?;

    record.set_field("completed", json!(true)).await?;

    let snapshot = record.snapshot().await?;
    info!("final state: {}", snapshot.data);

    info!("record exists: {}", record.exists().await?);
    info!("removed: {}", record.remove().await?);
    info!("record exists: {}", record.exists().await?);

    // the deletion closed the watcher's stream
    watcher.await?;

    Ok(())
}
