use crate::config::DatabaseConfig;
use crate::errors::{Error, Result};
use crate::model::{
    CommandRecord, CommandStatus, NewCommand, NewTelemetry, ResolveOutcome, TelemetryRecord,
};
use crate::query::{PageWindow, TelemetryFilter};
use crate::store::{Repository, TelemetrySlice};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::MigrateDatabase;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{info, warn};

const TELEMETRY_COLUMNS: &str = "id, device_id, timestamp, temperature, humidity, co_ppm, \
     dust_density, alarm_status, received_at";

const COMMAND_COLUMNS: &str = "id, device_id, command, request_id, status, sent_at, response";

/// Postgres `invalid_catalog_name`: the database in the URL does not exist.
const MISSING_DATABASE: &str = "3D000";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

fn is_missing_database(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == MISSING_DATABASE)
        .unwrap_or(false)
}

/// Connects with a fixed-delay retry budget, creating the database on the
/// way if the server reports it missing, then applies migrations.
pub async fn make_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let attempts = config.connect_retries.max(1);
    let mut attempt = 0;

    info!("Connecting to database...");
    let pool = loop {
        attempt += 1;
        match PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.url)
            .await
        {
            Ok(pool) => break pool,
            Err(e) if attempt < attempts => {
                warn!(
                    "Database connection attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt, attempts, e, config.connect_retry_delay
                );
                if is_missing_database(&e) {
                    info!("Creating missing database");
                    if let Err(create) = Postgres::create_database(&config.url).await {
                        warn!("Failed to create database: {}", create);
                    }
                }
                tokio::time::sleep(config.connect_retry_delay).await;
            }
            Err(e) => {
                return Err(Error::Startup(format!(
                    "database unreachable after {} attempts: {}",
                    attempts, e
                )));
            }
        }
    };

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(Debug, sqlx::FromRow)]
struct CommandRow {
    id: i64,
    device_id: String,
    command: String,
    request_id: String,
    status: String,
    sent_at: DateTime<Utc>,
    response: Option<String>,
}

impl TryFrom<CommandRow> for CommandRecord {
    type Error = Error;

    fn try_from(row: CommandRow) -> Result<Self> {
        Ok(CommandRecord {
            id: row.id,
            device_id: row.device_id,
            command: row.command.parse()?,
            correlation_id: row.request_id,
            status: row.status.parse()?,
            sent_at: row.sent_at,
            response: row.response,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_filter<'a>(builder: &mut QueryBuilder<'a, Postgres>, filter: &'a TelemetryFilter) {
    let mut separator = " WHERE ";

    if let Some(device_id) = &filter.device_id {
        builder
            .push(separator)
            .push("device_id = ")
            .push_bind(device_id.as_str());
        separator = " AND ";
    }

    if let Some(start) = filter.start {
        builder.push(separator).push("timestamp >= ").push_bind(start);
        separator = " AND ";
    }

    if let Some(end) = filter.end {
        builder.push(separator).push("timestamp <= ").push_bind(end);
    }
}

#[async_trait]
impl Repository for PgRepository {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn save_telemetry(&self, telemetry: NewTelemetry) -> Result<TelemetryRecord> {
        let query = format!(
            r#"
            INSERT INTO sensor_data (device_id, timestamp, temperature, humidity, co_ppm, dust_density, alarm_status, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            TELEMETRY_COLUMNS
        );

        let record = sqlx::query_as::<_, TelemetryRecord>(&query)
            .bind(&telemetry.device_id)
            .bind(telemetry.timestamp)
            .bind(telemetry.temperature)
            .bind(telemetry.humidity)
            .bind(telemetry.co_ppm)
            .bind(telemetry.dust_density)
            .bind(&telemetry.alarm_status)
            .bind(telemetry.received_at)
            .fetch_one(&self.pool)
            .await?;

        Ok(record)
    }

    async fn get_telemetry(&self, id: i64) -> Result<Option<TelemetryRecord>> {
        let query = format!("SELECT {} FROM sensor_data WHERE id = $1", TELEMETRY_COLUMNS);
        let record = sqlx::query_as::<_, TelemetryRecord>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn query_telemetry(
        &self,
        filter: &TelemetryFilter,
        window: &PageWindow,
    ) -> Result<TelemetrySlice> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM sensor_data");
        push_filter(&mut count, filter);
        let total = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        let mut page =
            QueryBuilder::<Postgres>::new(format!("SELECT {} FROM sensor_data", TELEMETRY_COLUMNS));
        push_filter(&mut page, filter);
        page.push(" ORDER BY timestamp DESC LIMIT ")
            .push_bind(i64::from(window.limit))
            .push(" OFFSET ")
            .push_bind(window.offset as i64);

        let records = page
            .build_query_as::<TelemetryRecord>()
            .fetch_all(&self.pool)
            .await?;

        Ok(TelemetrySlice {
            records,
            total: total.max(0) as u64,
        })
    }

    async fn save_command(&self, command: NewCommand) -> Result<CommandRecord> {
        let query = format!(
            r#"
            INSERT INTO command_logs (device_id, command, request_id, status, sent_at, response)
            VALUES ($1, $2, $3, $4, $5, NULL)
            RETURNING {}
            "#,
            COMMAND_COLUMNS
        );

        let row = sqlx::query_as::<_, CommandRow>(&query)
            .bind(&command.device_id)
            .bind(command.command.as_str())
            .bind(&command.correlation_id)
            .bind(CommandStatus::Pending.as_str())
            .bind(command.sent_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Duplicate(format!("request_id {}", command.correlation_id))
                } else {
                    Error::Database(e)
                }
            })?;

        row.try_into()
    }

    async fn resolve_command(
        &self,
        correlation_id: &str,
        status: CommandStatus,
        response: &str,
    ) -> Result<ResolveOutcome> {
        let updated = sqlx::query(
            r#"
            UPDATE command_logs
            SET status = $1, response = $2
            WHERE request_id = $3 AND status = 'pending'
            "#,
        )
        .bind(status.as_str())
        .bind(response)
        .bind(correlation_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() > 0 {
            return Ok(ResolveOutcome::Resolved);
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM command_logs WHERE request_id = $1)")
                .bind(correlation_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(if exists {
            ResolveOutcome::AlreadyResolved
        } else {
            ResolveOutcome::NotFound
        })
    }

    async fn get_command(&self, correlation_id: &str) -> Result<Option<CommandRecord>> {
        let query = format!(
            "SELECT {} FROM command_logs WHERE request_id = $1",
            COMMAND_COLUMNS
        );
        let row = sqlx::query_as::<_, CommandRow>(&query)
            .bind(correlation_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(CommandRecord::try_from).transpose()
    }
}
