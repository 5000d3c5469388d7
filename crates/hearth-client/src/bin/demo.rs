//! Walk through a short conversation against a local SQLite store and print
//! the resulting views.
//!
//! Uses `HEARTH_DB_PATH` when set, otherwise a fresh file in the system temp
//! directory.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use hearth_client::{init_tracing, Caches, ChatSession, Content, ConversationList, SyncConfig};
use hearth_shared::{ContainerId, UserId};
use hearth_store::{Backend, Container, ContainerKind, Database, Profile};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = SyncConfig::from_env();

    let path = config.db_path.clone().unwrap_or_else(|| {
        std::env::temp_dir().join(format!("hearth-demo-{}.db", std::process::id()))
    });
    let db = Database::open_at(&path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;
    info!(path = %path.display(), "Demo database ready");

    let me = UserId::new();
    let chef = UserId::new();
    db.upsert_profile(&Profile {
        id: me,
        display_name: Some("Ana".into()),
        username: Some("ana".into()),
        avatar_url: None,
    })?;
    db.upsert_profile(&Profile {
        id: chef,
        display_name: Some("Chef".into()),
        username: Some("chef".into()),
        avatar_url: None,
    })?;

    let container = Container {
        id: ContainerId::new(),
        kind: ContainerKind::Direct,
        title: None,
        avatar_url: None,
        created_at: Utc::now(),
    };
    db.create_container(&container)?;
    db.add_member(container.id, me)?;
    db.add_member(container.id, chef)?;

    let backend: Arc<dyn Backend> = Arc::new(db);
    let caches = Caches::new();

    let session = ChatSession::open(
        Arc::clone(&backend),
        caches.clone(),
        config.clone(),
        me,
        container.id,
    )
    .await?;

    session
        .send_message(Content::text("Table 4 wants the tasting menu"), None)
        .await;
    let first = session
        .messages()
        .last()
        .map(|m| m.id.clone())
        .context("sent message missing from the view")?;
    session.edit_message(&first, "Table 4 wants two tasting menus").await;
    session.toggle_reaction(&first, "👍").await;
    session
        .send_message(Content::text("Starting now"), Some(first.clone()))
        .await;

    println!("{}", serde_json::to_string_pretty(&session.view())?);

    let inbox = ConversationList::open(Arc::clone(&backend), caches, config, me).await?;
    inbox.wait_for_unread().await;
    println!("{}", serde_json::to_string_pretty(&inbox.view())?);

    session.close();
    inbox.close();
    Ok(())
}
