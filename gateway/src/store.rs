use crate::errors::Result;
use crate::model::{
    CommandRecord, CommandStatus, NewCommand, NewTelemetry, ResolveOutcome, TelemetryRecord,
};
use crate::query::{PageWindow, TelemetryFilter};
use async_trait::async_trait;

/// Rows for one page plus the count of every row the filter matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySlice {
    pub records: Vec<TelemetryRecord>,
    pub total: u64,
}

/// Storage capabilities the gateway needs. Each call is one atomic statement
/// against the backing store, so implementations need no extra locking from callers.
#[async_trait]
pub trait Repository: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn save_telemetry(&self, telemetry: NewTelemetry) -> Result<TelemetryRecord>;

    async fn get_telemetry(&self, id: i64) -> Result<Option<TelemetryRecord>>;

    /// Matching rows ordered by timestamp descending, restricted to `window`.
    async fn query_telemetry(
        &self,
        filter: &TelemetryFilter,
        window: &PageWindow,
    ) -> Result<TelemetrySlice>;

    async fn save_command(&self, command: NewCommand) -> Result<CommandRecord>;

    /// Moves a `pending` command to `status`. Records that already left
    /// `pending` are not touched again.
    async fn resolve_command(
        &self,
        correlation_id: &str,
        status: CommandStatus,
        response: &str,
    ) -> Result<ResolveOutcome>;

    async fn get_command(&self, correlation_id: &str) -> Result<Option<CommandRecord>>;
}
