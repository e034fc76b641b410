use crate::core::confirm_initialised;
use crate::db::models::LogRecord;
use crate::error::OrchaError;
use serde_json::Value;
use sqlx::types::Json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Writes application log entries to `orcha_logs.logs` under a fixed source.
///
/// Entries are also emitted through `tracing` so they show up on the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogManager {
    source: String,
}

impl LogManager {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub async fn add_entry(
        &self,
        actor: &str,
        category: &str,
        text: &str,
        json: Value,
    ) -> Result<Uuid, OrchaError> {
        match category {
            "error" | "critical" => error!(source = %self.source, actor, "{text}"),
            "warn" | "warning" => warn!(source = %self.source, actor, "{text}"),
            "debug" => debug!(source = %self.source, actor, "{text}"),
            _ => info!(source = %self.source, actor, "{text}"),
        }

        let core = confirm_initialised()?;
        let id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO orcha_logs.logs (created, id, actor, source, category, text, json)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(crate::clock::now())
        .bind(id)
        .bind(actor)
        .bind(&self.source)
        .bind(category)
        .bind(text)
        .bind(Json(json))
        .execute(core.storage().pool())
        .await?;
        Ok(id)
    }

    /// Newest entries for this source first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<LogRecord>, OrchaError> {
        let core = confirm_initialised()?;
        let rows = sqlx::query_as::<_, LogRecord>(
            r#"SELECT created, id, actor, source, category, text, json
               FROM orcha_logs.logs
               WHERE source = $1
               ORDER BY created DESC
               LIMIT $2"#,
        )
        .bind(&self.source)
        .bind(limit)
        .fetch_all(core.storage().pool())
        .await?;
        Ok(rows)
    }
}
