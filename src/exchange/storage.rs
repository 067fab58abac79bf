use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::trading::Position;

/// Persistence hooks for positions across restarts.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn load_positions(&self) -> Result<Vec<Position>>;
    /// Insert or replace by position id.
    async fn save_position(&self, position: &Position) -> Result<()>;
}

/// Keeps nothing. Used when persistence is not wanted.
pub struct NullStore;

#[async_trait]
impl PositionStore for NullStore {
    async fn load_positions(&self) -> Result<Vec<Position>> {
        Ok(Vec::new())
    }

    async fn save_position(&self, _position: &Position) -> Result<()> {
        Ok(())
    }
}

/// All positions in one pretty-printed JSON file, rewritten on every save.
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(log_dir: &str) -> Self {
        Self {
            path: Path::new(log_dir).join("paper_positions.json"),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<Position>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }
}

#[async_trait]
impl PositionStore for JsonFileStore {
    async fn load_positions(&self) -> Result<Vec<Position>> {
        let _guard = self.write_lock.lock().await;
        self.read_all().await
    }

    async fn save_position(&self, position: &Position) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let existing = self.read_all().await?;

        let mut order: Vec<Uuid> = existing.iter().map(|p| p.id).collect();
        let mut by_id: HashMap<Uuid, Position> =
            existing.into_iter().map(|p| (p.id, p)).collect();
        if !by_id.contains_key(&position.id) {
            order.push(position.id);
        }
        by_id.insert(position.id, position.clone());
        let all: Vec<Position> = order.iter().filter_map(|id| by_id.remove(id)).collect();

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&all)?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExitReason, PositionStatus, Side};
    use crate::test_helpers::{make_position, temp_log_dir};

    #[tokio::test]
    async fn save_upserts_by_id() {
        let dir = temp_log_dir("store_upsert");
        let store = JsonFileStore::new(&dir);
        assert!(store.load_positions().await.unwrap().is_empty());

        let mut a = make_position(Side::Buy, 100.0, 1.0);
        let b = make_position(Side::Sell, 200.0, 0.5);
        store.save_position(&a).await.unwrap();
        store.save_position(&b).await.unwrap();

        a.status = PositionStatus::Closed;
        a.exit_reason = Some(ExitReason::TakeProfit);
        store.save_position(&a).await.unwrap();

        let loaded = store.load_positions().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, a.id);
        assert_eq!(loaded[0].status, PositionStatus::Closed);
        assert_eq!(loaded[1].id, b.id);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
