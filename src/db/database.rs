use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::db::models::{GenerationInsert, GenerationSettings, UserData};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    sender: mpsc::Sender<GenerationInsert>,
}

impl Database {
    pub async fn init(database_url: &str) -> Result<Self> {
        // Every connection to an in-memory database gets its own empty copy.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS user_settings (\
                user_id INTEGER PRIMARY KEY,\
                steps INTEGER NOT NULL,\
                cfg_scale REAL NOT NULL,\
                width INTEGER NOT NULL,\
                height INTEGER NOT NULL,\
                sampler_name TEXT NOT NULL,\
                model_name TEXT,\
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS saved_prompts (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                user_id INTEGER NOT NULL,\
                position INTEGER NOT NULL,\
                prompt TEXT NOT NULL,\
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,\
                UNIQUE(user_id, prompt)\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS generations (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                user_id INTEGER NOT NULL,\
                chat_id INTEGER NOT NULL,\
                positive TEXT NOT NULL,\
                negative TEXT NOT NULL,\
                status TEXT NOT NULL,\
                detail TEXT,\
                created_at TEXT NOT NULL\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_saved_prompts_user_id ON saved_prompts(user_id);",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_generations_user_id ON generations(user_id);")
            .execute(&pool)
            .await?;

        info!("Database tables created successfully");

        let (sender, receiver) = mpsc::channel(1000);
        let writer_pool = pool.clone();
        tokio::spawn(async move {
            db_writer(writer_pool, receiver).await;
        });

        info!("Database writer task started");

        Ok(Database { pool, sender })
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn queue_len(&self) -> usize {
        self.sender
            .max_capacity()
            .saturating_sub(self.sender.capacity())
    }

    pub async fn get_user_data(&self, user_id: i64) -> Result<UserData> {
        let settings = sqlx::query_as::<_, GenerationSettings>(
            "SELECT steps, cfg_scale, width, height, sampler_name, model_name \
             FROM user_settings WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or_default();

        let saved_prompts = self.saved_prompts(user_id).await?;
        Ok(UserData {
            settings,
            saved_prompts,
        })
    }

    pub async fn put_settings(&self, user_id: i64, settings: &GenerationSettings) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_settings (user_id, steps, cfg_scale, width, height, sampler_name, model_name, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP) \
             ON CONFLICT(user_id) DO UPDATE SET \
                steps = excluded.steps, \
                cfg_scale = excluded.cfg_scale, \
                width = excluded.width, \
                height = excluded.height, \
                sampler_name = excluded.sampler_name, \
                model_name = excluded.model_name, \
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(user_id)
        .bind(settings.steps)
        .bind(settings.cfg_scale)
        .bind(settings.width)
        .bind(settings.height)
        .bind(&settings.sampler_name)
        .bind(&settings.model_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn saved_prompts(&self, user_id: i64) -> Result<Vec<String>> {
        let prompts = sqlx::query_scalar::<_, String>(
            "SELECT prompt FROM saved_prompts WHERE user_id = ? ORDER BY position ASC, id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(prompts)
    }

    /// Returns `false` when the prompt is blank or the list is already full.
    /// A prompt that is already saved counts as stored.
    pub async fn add_saved_prompt(&self, user_id: i64, prompt: &str, max: usize) -> Result<bool> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Ok(false);
        }

        let existing = self.saved_prompts(user_id).await?;
        if existing.iter().any(|saved| saved == prompt) {
            return Ok(true);
        }
        if existing.len() >= max {
            return Ok(false);
        }

        sqlx::query(
            "INSERT OR IGNORE INTO saved_prompts (user_id, position, prompt) \
             VALUES (?, (SELECT COALESCE(MAX(position), -1) + 1 FROM saved_prompts WHERE user_id = ?), ?)",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(prompt)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    /// Removes the prompt at `index` in display order; out-of-range is a no-op.
    pub async fn remove_saved_prompt(&self, user_id: i64, index: usize) -> Result<bool> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM saved_prompts WHERE user_id = ? ORDER BY position ASC, id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let Some(id) = ids.get(index) else {
            return Ok(false);
        };
        sqlx::query("DELETE FROM saved_prompts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    pub async fn queue_generation_record(&self, insert: GenerationInsert) -> Result<()> {
        self.sender
            .send(insert)
            .await
            .map_err(|err| anyhow::anyhow!("Failed to queue generation record: {err}"))
    }

    pub async fn count_generations(&self, user_id: Option<i64>) -> Result<i64> {
        let count = match user_id {
            Some(user_id) => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM generations WHERE user_id = ?")
                    .bind(user_id)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM generations")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    async fn insert_generation(pool: &SqlitePool, insert: &GenerationInsert) -> Result<()> {
        sqlx::query(
            "INSERT INTO generations (user_id, chat_id, positive, negative, status, detail, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(insert.user_id)
        .bind(insert.chat_id)
        .bind(&insert.positive)
        .bind(&insert.negative)
        .bind(&insert.status)
        .bind(&insert.detail)
        .bind(insert.created_at)
        .execute(pool)
        .await?;
        Ok(())
    }
}

async fn db_writer(pool: SqlitePool, mut receiver: mpsc::Receiver<GenerationInsert>) {
    while let Some(insert) = receiver.recv().await {
        if let Err(err) = Database::insert_generation(&pool, &insert).await {
            warn!(
                "Failed to record generation for user {}: {}",
                insert.user_id, err
            );
        }
    }
    info!("Database writer task stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;

    async fn memory_db() -> Database {
        Database::init("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn unknown_user_gets_default_settings() {
        let db = memory_db().await;
        let data = db.get_user_data(42).await.unwrap();
        assert_eq!(data, UserData::default());
    }

    #[tokio::test]
    async fn settings_are_upserted() {
        let db = memory_db().await;
        let mut settings = GenerationSettings::default();
        settings.steps = 40;
        settings.model_name = Some("anything-v5.safetensors".to_string());
        db.put_settings(7, &settings).await.unwrap();

        settings.cfg_scale = 9.5;
        db.put_settings(7, &settings).await.unwrap();

        assert_eq!(db.get_user_data(7).await.unwrap().settings, settings);
        assert_eq!(
            db.get_user_data(8).await.unwrap().settings,
            GenerationSettings::default()
        );
    }

    #[tokio::test]
    async fn saved_prompts_are_bounded_and_deduplicated() {
        let db = memory_db().await;
        assert!(db.add_saved_prompt(1, "masterpiece", 2).await.unwrap());
        assert!(db.add_saved_prompt(1, " masterpiece ", 2).await.unwrap());
        assert!(db.add_saved_prompt(1, "best quality", 2).await.unwrap());
        assert!(!db.add_saved_prompt(1, "third", 2).await.unwrap());
        assert!(!db.add_saved_prompt(1, "   ", 2).await.unwrap());

        assert_eq!(
            db.saved_prompts(1).await.unwrap(),
            vec!["masterpiece", "best quality"]
        );
        assert!(db.saved_prompts(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn removing_by_index_keeps_order() {
        let db = memory_db().await;
        for prompt in ["a", "b", "c"] {
            db.add_saved_prompt(1, prompt, 10).await.unwrap();
        }
        assert!(db.remove_saved_prompt(1, 1).await.unwrap());
        assert!(!db.remove_saved_prompt(1, 5).await.unwrap());
        assert_eq!(db.saved_prompts(1).await.unwrap(), vec!["a", "c"]);

        db.add_saved_prompt(1, "d", 10).await.unwrap();
        assert_eq!(db.saved_prompts(1).await.unwrap(), vec!["a", "c", "d"]);
    }

    #[tokio::test]
    async fn generation_records_are_written_by_background_task() {
        let db = memory_db().await;
        db.queue_generation_record(GenerationInsert {
            user_id: 5,
            chat_id: 5,
            positive: "masterpiece, 1boy".to_string(),
            negative: String::new(),
            status: "success".to_string(),
            detail: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        let mut count = 0;
        for _ in 0..50 {
            count = db.count_generations(Some(5)).await.unwrap();
            if count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(count, 1);
        assert_eq!(db.count_generations(None).await.unwrap(), 1);
        db.health_check().await.unwrap();
    }
}
