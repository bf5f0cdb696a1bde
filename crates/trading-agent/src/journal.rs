use anyhow::{Context, Result};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use tokio::sync::mpsc;
use trading_core::{CoreEvent, Shutdown};

/// Append-only SQLite log of every structured event.
#[derive(Clone)]
pub struct EventJournal {
    db_pool: AnyPool,
}

impl EventJournal {
    pub async fn connect(url: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let db_pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .with_context(|| format!("Failed to open event journal at {}", url))?;
        let journal = Self { db_pool };
        journal.init_tables().await?;
        Ok(journal)
    }

    pub async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS core_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.db_pool)
        .await
        .context("Failed to create core_events table")?;
        Ok(())
    }

    pub async fn append(&self, event: &CoreEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        sqlx::query("INSERT INTO core_events (kind, payload) VALUES (?, ?)")
            .bind(event.kind())
            .bind(payload)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self, kind: &str) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM core_events WHERE kind = ?")
            .bind(kind)
            .fetch_one(&self.db_pool)
            .await?;
        Ok(n)
    }

    /// Drain the event channel until shutdown, then flush what is already queued.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<CoreEvent>, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                next = rx.recv() => match next {
                    Some(event) => self.write(&event).await,
                    None => return,
                },
            }
        }

        let mut flushed = 0usize;
        while let Ok(event) = rx.try_recv() {
            self.write(&event).await;
            flushed += 1;
        }
        tracing::info!("Event journal closed ({} queued events flushed)", flushed);
    }

    async fn write(&self, event: &CoreEvent) {
        if let Err(e) = self.append(event).await {
            tracing::warn!("Failed to journal {} event: {}", event.kind(), e);
        }
    }
}
