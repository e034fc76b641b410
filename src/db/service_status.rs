//! Service heartbeats. Every call to [`update_status`] appends a row; readers
//! only care about the newest one per `(service_type, service_idf)`.

use crate::core::confirm_initialised;
use crate::db::models::ServiceStatusRecord;
use crate::error::OrchaError;
use chrono::{DateTime, Utc};

pub async fn update_status(
    service_type: &str,
    service_idf: &str,
) -> Result<DateTime<Utc>, OrchaError> {
    let core = confirm_initialised()?;
    let status_time = crate::clock::now();
    sqlx::query(
        r#"INSERT INTO orcha.service_status (service_type, service_idf, status_time)
           VALUES ($1, $2, $3)
           ON CONFLICT DO NOTHING"#,
    )
    .bind(service_type)
    .bind(service_idf)
    .bind(status_time)
    .execute(core.storage().pool())
    .await?;
    Ok(status_time)
}

pub async fn get_latest(
    service_type: &str,
    service_idf: &str,
) -> Result<Option<ServiceStatusRecord>, OrchaError> {
    let core = confirm_initialised()?;
    let row = sqlx::query_as::<_, ServiceStatusRecord>(
        r#"SELECT service_type, service_idf, status_time
           FROM orcha.service_status
           WHERE service_type = $1 AND service_idf = $2
           ORDER BY status_time DESC
           LIMIT 1"#,
    )
    .bind(service_type)
    .bind(service_idf)
    .fetch_optional(core.storage().pool())
    .await?;
    Ok(row)
}
