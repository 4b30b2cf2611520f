//! tablesync Example - Todo Sync
//!
//! Two devices share one remote todo table:
//! - Editing offline and pushing once connected
//! - Resolving a conflicting edit with a push handler
//! - Incremental pulls that only fetch what changed
//! - Deletes travelling as tombstones
//!
//! Run with: cargo run -p todo_sync
//! Set `RUST_LOG=debug` to follow every push and pull step.

use serde_json::{json, Value};
use std::sync::Arc;
use tablesync_engine::{
    MockTransport, OperationAction, PushConflict, PushHandler, SyncConfig, SyncContext,
    SyncResult,
};
use tablesync_store::{
    ColumnType, LocalStore, MemoryStore, Query, Record, RecordId, TableDefinition,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

type Device = SyncContext<MemoryStore, Arc<MockTransport>>;

const TABLE: &str = "todo";
const QUERY_ID: &str = "all-todos";

/// Keeps the local edit but adopts the server's version, so the edit is
/// sent again as an update the server accepts.
struct ClientWins;

impl<S: LocalStore> PushHandler<S> for ClientWins {
    async fn on_conflict(&self, conflict: &PushConflict<S>) -> SyncResult<()> {
        let (Some(server), Some(client)) = (conflict.server_record(), conflict.client_record())
        else {
            return conflict.cancel_record_push().await;
        };
        println!(
            "  [!] conflict on {}: server has {:?}, keeping {:?}",
            conflict.item_id(),
            title(server),
            title(client)
        );

        let mut merged = client.clone();
        if let Some(version) = server.get("version") {
            merged.insert("version".into(), version.clone());
        }
        conflict
            .change_action(OperationAction::Update, Some(merged))
            .await
    }
}

fn todo(title: &str) -> Record {
    let mut record = Record::new();
    record.insert("title".into(), json!(title));
    record.insert("completed".into(), json!(false));
    record
}

fn title(record: &Record) -> &str {
    record.get("title").and_then(Value::as_str).unwrap_or("?")
}

async fn device(transport: &Arc<MockTransport>) -> SyncResult<Device> {
    let device = SyncContext::new(MemoryStore::new(), Arc::clone(transport), SyncConfig::new());
    device.initialize().await?;
    device
        .define_table(
            &TableDefinition::new(TABLE)
                .column("id", ColumnType::String)
                .column("title", ColumnType::String)
                .column("completed", ColumnType::Boolean),
        )
        .await?;
    Ok(device)
}

fn print_todos(name: &str, device: &Device) -> SyncResult<()> {
    let todos = device.read(&Query::new(TABLE).order_by("title"))?;
    println!("  {name}:");
    for todo in &todos.records {
        let status = if todo.get("completed") == Some(&json!(true)) {
            "✓"
        } else {
            "○"
        };
        println!("    {status} {}", title(todo));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("Todo Sync Example");
    println!("=================\n");

    let server = Arc::new(MockTransport::new());
    let phone = device(&server).await?;
    let laptop = device(&server).await?;
    info!("devices ready");
    println!("[OK] Phone and laptop initialized");

    // Offline edits are logged and wait for a connection.
    println!("\n[+] Phone adds todos while offline...");
    server.set_connected(false);
    let milk = phone.insert(TABLE, todo("Buy milk")).await?;
    phone.insert(TABLE, todo("Walk the dog")).await?;
    phone.insert(TABLE, todo("Call mom")).await?;
    println!("  pending operations: {}", phone.pending_operation_count()?);
    if let Err(error) = phone.push().await {
        println!("  push failed: {error}");
    }

    server.set_connected(true);
    let pushed = phone.push().await?;
    println!("[OK] Phone pushed {} operations", pushed.pushed);

    println!("\n[*] Laptop pulls...");
    let pulled = laptop.pull(&Query::new(TABLE), Some(QUERY_ID)).await?;
    println!("[OK] Laptop pulled {} records", pulled.pulled);
    print_todos("laptop", &laptop)?;

    // Both devices edit the same todo; the laptop is first to push.
    println!("\n[~] Both devices edit 'Buy milk'...");
    let milk_id = RecordId::of(&milk).ok_or("todo has no id")?;
    let mut on_laptop = laptop.lookup(TABLE, &milk_id)?.ok_or("missing on laptop")?;
    on_laptop.insert("title".into(), json!("Buy oat milk"));
    laptop.update(TABLE, on_laptop).await?;
    laptop.push().await?;

    let mut on_phone = phone.lookup(TABLE, &milk_id)?.ok_or("missing on phone")?;
    on_phone.insert("title".into(), json!("Buy milk and eggs"));
    on_phone.insert("completed".into(), json!(true));
    phone.update(TABLE, on_phone).await?;

    let result = phone.push_with(&ClientWins).await?;
    println!(
        "[OK] Phone pushed {} operations, {} unresolved conflicts",
        result.pushed,
        result.conflicts.len()
    );

    // Deletes reach other devices as tombstones.
    println!("\n[-] Phone deletes 'Walk the dog'...");
    let dog = phone
        .read(&Query::new(TABLE).filter_eq("title", "Walk the dog"))?
        .records
        .into_iter()
        .next()
        .and_then(|record| RecordId::of(&record))
        .ok_or("missing todo")?;
    phone.delete(TABLE, &dog).await?;
    phone.push().await?;

    println!("\n[*] Laptop pulls again, only changes are fetched...");
    let pulled = laptop.pull(&Query::new(TABLE), Some(QUERY_ID)).await?;
    println!(
        "[OK] pulled {}, upserted {}, deleted {}",
        pulled.pulled, pulled.upserted, pulled.deleted
    );
    print_todos("laptop", &laptop)?;
    print_todos("phone", &phone)?;

    let stats = phone.stats();
    println!("\n[#] Phone summary:");
    println!("  Pushes: {}", stats.pushes_completed);
    println!("  Operations pushed: {}", stats.operations_pushed);
    println!("  Last error: {}", stats.last_error.as_deref().unwrap_or("none"));

    Ok(())
}
