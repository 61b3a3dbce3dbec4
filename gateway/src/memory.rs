use crate::errors::{Error, Result};
use crate::model::{
    CommandRecord, CommandStatus, NewCommand, NewTelemetry, ResolveOutcome, TelemetryRecord,
};
use crate::query::{PageWindow, TelemetryFilter};
use crate::store::{Repository, TelemetrySlice};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct State {
    telemetry: Vec<TelemetryRecord>,
    commands: Vec<CommandRecord>,
    by_correlation: HashMap<String, usize>,
}

/// In-process store with the same semantics as the Postgres one.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: RwLock<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn telemetry_count(&self) -> usize {
        self.state.read().await.telemetry.len()
    }

    pub async fn command_count(&self) -> usize {
        self.state.read().await.commands.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn save_telemetry(&self, telemetry: NewTelemetry) -> Result<TelemetryRecord> {
        let mut state = self.state.write().await;
        let record = telemetry.into_record(state.telemetry.len() as i64 + 1);
        state.telemetry.push(record.clone());
        Ok(record)
    }

    async fn get_telemetry(&self, id: i64) -> Result<Option<TelemetryRecord>> {
        let state = self.state.read().await;
        Ok(state.telemetry.iter().find(|r| r.id == id).cloned())
    }

    async fn query_telemetry(
        &self,
        filter: &TelemetryFilter,
        window: &PageWindow,
    ) -> Result<TelemetrySlice> {
        let state = self.state.read().await;
        let mut matching: Vec<&TelemetryRecord> =
            state.telemetry.iter().filter(|r| filter.matches(r)).collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let records = matching
            .into_iter()
            .skip(window.offset as usize)
            .take(window.limit as usize)
            .cloned()
            .collect();

        Ok(TelemetrySlice { records, total })
    }

    async fn save_command(&self, command: NewCommand) -> Result<CommandRecord> {
        let mut state = self.state.write().await;
        if state.by_correlation.contains_key(&command.correlation_id) {
            return Err(Error::Duplicate(format!(
                "request_id {}",
                command.correlation_id
            )));
        }

        let index = state.commands.len();
        let record = command.into_record(index as i64 + 1);
        state
            .by_correlation
            .insert(record.correlation_id.clone(), index);
        state.commands.push(record.clone());
        Ok(record)
    }

    async fn resolve_command(
        &self,
        correlation_id: &str,
        status: CommandStatus,
        response: &str,
    ) -> Result<ResolveOutcome> {
        let mut state = self.state.write().await;
        let Some(index) = state.by_correlation.get(correlation_id).copied() else {
            return Ok(ResolveOutcome::NotFound);
        };

        let record = &mut state.commands[index];
        if record.status != CommandStatus::Pending {
            return Ok(ResolveOutcome::AlreadyResolved);
        }
        record.status = status;
        record.response = Some(response.to_string());
        Ok(ResolveOutcome::Resolved)
    }

    async fn get_command(&self, correlation_id: &str) -> Result<Option<CommandRecord>> {
        let state = self.state.read().await;
        Ok(state
            .by_correlation
            .get(correlation_id)
            .map(|&index| state.commands[index].clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CommandName;
    use crate::query::resolve_window;
    use chrono::{Duration, TimeZone, Utc};

    fn reading(device_id: &str, minute: u32) -> NewTelemetry {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap();
        NewTelemetry {
            device_id: device_id.to_string(),
            timestamp: ts,
            temperature: 20.0 + minute as f64,
            humidity: 50.0,
            co_ppm: 1.0,
            dust_density: 0.01,
            alarm_status: "normal".to_string(),
            received_at: ts + Duration::seconds(1),
        }
    }

    #[test]
    fn test_ids_are_assigned_on_save() {
        tokio_test::block_on(async {
            let repo = MemoryRepository::new();
            let first = repo.save_telemetry(reading("a", 1)).await.unwrap();
            let second = repo.save_telemetry(reading("a", 2)).await.unwrap();
            assert_eq!(first.id, 1);
            assert_eq!(second.id, 2);
            assert_eq!(repo.get_telemetry(2).await.unwrap(), Some(second));
            assert_eq!(repo.get_telemetry(9).await.unwrap(), None);
        });
    }

    #[test]
    fn test_query_orders_newest_first_and_pages() {
        tokio_test::block_on(async {
            let repo = MemoryRepository::new();
            for minute in 0..10 {
                repo.save_telemetry(reading("a", minute)).await.unwrap();
            }

            let slice = repo
                .query_telemetry(&TelemetryFilter::default(), &resolve_window(2, 3, false))
                .await
                .unwrap();

            assert_eq!(slice.total, 10);
            let minutes: Vec<f64> = slice.records.iter().map(|r| r.temperature - 20.0).collect();
            assert_eq!(minutes, vec![6.0, 5.0, 4.0]);
        });
    }

    #[test]
    fn test_duplicate_correlation_id_is_rejected() {
        tokio_test::block_on(async {
            let repo = MemoryRepository::new();
            let command = NewCommand {
                device_id: "a".to_string(),
                command: CommandName::TakePhoto,
                correlation_id: "same".to_string(),
                sent_at: Utc::now(),
            };
            repo.save_command(command.clone()).await.unwrap();
            assert!(matches!(
                repo.save_command(command).await,
                Err(Error::Duplicate(_))
            ));
            assert_eq!(repo.command_count().await, 1);
        });
    }
}
