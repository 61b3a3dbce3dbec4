use crate::errors::{Error, Result};
use crate::model::{Pagination, TelemetryPage, TelemetryRecord};
use crate::store::Repository;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;
/// Ceiling for "most recent N" chart queries.
pub const MAX_FLAT_LIMIT: u32 = 3000;
pub const DEFAULT_WINDOW_MINUTES: i64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryQuery {
    pub device_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub page: u32,
    pub page_size: u32,
    pub skip_pagination: bool,
}

impl TelemetryQuery {
    /// First page of the last 30 minutes, all devices.
    pub fn recent(now: DateTime<Utc>) -> Self {
        Self {
            device_id: None,
            start: Some(now - Duration::minutes(DEFAULT_WINDOW_MINUTES)),
            end: Some(now),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            skip_pagination: false,
        }
    }

    pub fn filter(&self) -> TelemetryFilter {
        TelemetryFilter {
            device_id: self.device_id.clone().filter(|id| !id.is_empty()),
            start: self.start,
            end: self.end,
        }
    }
}

/// Conjunction of the optional predicates; an absent bound matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryFilter {
    pub device_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TelemetryFilter {
    pub fn matches(&self, record: &TelemetryRecord) -> bool {
        if let Some(device_id) = &self.device_id {
            if &record.device_id != device_id {
                return false;
            }
        }
        if let Some(start) = self.start {
            if record.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if record.timestamp > end {
                return false;
            }
        }
        true
    }
}

/// The slice of matching rows a query reads, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub page: u32,
    pub page_size: u32,
    pub offset: u64,
    pub limit: u32,
}

/// Flat mode always reads from the top, so it reports page 1.
pub fn resolve_window(page: u32, page_size: u32, skip_pagination: bool) -> PageWindow {
    let requested = if page_size == 0 {
        DEFAULT_PAGE_SIZE
    } else {
        page_size
    };

    if skip_pagination {
        let limit = requested.min(MAX_FLAT_LIMIT);
        return PageWindow {
            page: 1,
            page_size: limit,
            offset: 0,
            limit,
        };
    }

    let page = page.max(1);
    let page_size = requested.min(MAX_PAGE_SIZE);
    PageWindow {
        page,
        page_size,
        offset: u64::from(page - 1) * u64::from(page_size),
        limit: page_size,
    }
}

pub fn total_pages(total_items: u64, page_size: u32) -> u64 {
    if page_size == 0 {
        return 0;
    }
    let page_size = u64::from(page_size);
    (total_items + page_size - 1) / page_size
}

#[derive(Clone)]
pub struct QueryEngine {
    repo: Arc<dyn Repository>,
}

impl QueryEngine {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    pub async fn list(&self, query: &TelemetryQuery) -> Result<TelemetryPage> {
        let window = resolve_window(query.page, query.page_size, query.skip_pagination);
        let filter = query.filter();

        let slice = self.repo.query_telemetry(&filter, &window).await?;
        debug!(
            total = slice.total,
            returned = slice.records.len(),
            offset = window.offset,
            limit = window.limit,
            "telemetry query"
        );

        Ok(TelemetryPage {
            data: slice.records,
            pagination: Pagination {
                current_page: window.page,
                page_size: window.page_size,
                total_items: slice.total,
                total_pages: total_pages(slice.total, window.page_size),
            },
        })
    }

    pub async fn get(&self, id: i64) -> Result<TelemetryRecord> {
        self.repo
            .get_telemetry(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("telemetry record {}", id)))
    }
}
