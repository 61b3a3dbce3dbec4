use chrono::{DateTime, Duration, TimeZone, Utc};
use gateway::errors::Error;
use gateway::memory::MemoryRepository;
use gateway::model::NewTelemetry;
use gateway::query::{QueryEngine, TelemetryQuery};
use gateway::store::Repository;
use std::sync::Arc;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn reading(device_id: &str, minutes: i64) -> NewTelemetry {
    NewTelemetry {
        device_id: device_id.to_string(),
        timestamp: base() + Duration::minutes(minutes),
        temperature: 21.0 + minutes as f64,
        humidity: 45.0,
        co_ppm: 1.0,
        dust_density: 0.01,
        alarm_status: "normal".to_string(),
        received_at: Utc::now(),
    }
}

/// Two devices, one reading per minute each for `minutes` minutes.
async fn seeded(minutes: i64) -> (Arc<MemoryRepository>, QueryEngine) {
    let repo = Arc::new(MemoryRepository::new());
    for m in 0..minutes {
        repo.save_telemetry(reading("esp32-01", m)).await.unwrap();
        repo.save_telemetry(reading("esp32-02", m)).await.unwrap();
    }
    let engine = QueryEngine::new(repo.clone());
    (repo, engine)
}

fn query() -> TelemetryQuery {
    TelemetryQuery {
        device_id: None,
        start: None,
        end: None,
        page: 1,
        page_size: 20,
        skip_pagination: false,
    }
}

#[tokio::test]
async fn test_device_and_range_filter_newest_first() {
    let (_repo, engine) = seeded(30).await;

    let page = engine
        .list(&TelemetryQuery {
            device_id: Some("esp32-01".to_string()),
            start: Some(base() + Duration::minutes(10)),
            end: Some(base() + Duration::minutes(19)),
            ..query()
        })
        .await
        .unwrap();

    assert_eq!(page.pagination.total_items, 10);
    assert_eq!(page.data.len(), 10);
    assert!(page.data.iter().all(|r| r.device_id == "esp32-01"));
    assert_eq!(page.data[0].timestamp, base() + Duration::minutes(19));
    assert_eq!(page.data[9].timestamp, base() + Duration::minutes(10));
    assert!(page
        .data
        .windows(2)
        .all(|pair| pair[0].timestamp >= pair[1].timestamp));
}

#[tokio::test]
async fn test_pagination_metadata() {
    let (_repo, engine) = seeded(50).await; // 100 rows

    let page = engine
        .list(&TelemetryQuery {
            page: 6,
            page_size: 20,
            ..query()
        })
        .await
        .unwrap();
    assert_eq!(page.pagination.total_items, 100);
    assert_eq!(page.pagination.total_pages, 5);
    assert_eq!(page.pagination.current_page, 6);
    assert!(page.data.is_empty());

    let page = engine
        .list(&TelemetryQuery {
            page: 2,
            page_size: 30,
            ..query()
        })
        .await
        .unwrap();
    assert_eq!(page.pagination.total_pages, 4);
    assert_eq!(page.data.len(), 30);
}

#[tokio::test]
async fn test_page_size_over_limit_is_clamped() {
    let (_repo, engine) = seeded(60).await;

    let page = engine
        .list(&TelemetryQuery {
            page_size: 500,
            ..query()
        })
        .await
        .unwrap();
    assert_eq!(page.pagination.page_size, 100);
    assert_eq!(page.data.len(), 100);
    assert_eq!(page.pagination.total_pages, 2);
}

#[tokio::test]
async fn test_skip_pagination_returns_most_recent_and_ignores_page() {
    let (_repo, engine) = seeded(100).await; // 200 rows

    let page = engine
        .list(&TelemetryQuery {
            page: 7,
            page_size: 150,
            skip_pagination: true,
            ..query()
        })
        .await
        .unwrap();

    assert_eq!(page.data.len(), 150);
    assert_eq!(page.pagination.current_page, 1);
    assert_eq!(page.pagination.total_items, 200);
    assert_eq!(page.pagination.total_pages, 2);
    assert_eq!(page.data[0].timestamp, base() + Duration::minutes(99));
}

#[tokio::test]
async fn test_empty_result() {
    let (_repo, engine) = seeded(5).await;
    let page = engine
        .list(&TelemetryQuery {
            device_id: Some("nobody".to_string()),
            ..query()
        })
        .await
        .unwrap();
    assert!(page.data.is_empty());
    assert_eq!(page.pagination.total_items, 0);
    assert_eq!(page.pagination.total_pages, 0);
}

#[tokio::test]
async fn test_get_by_id() {
    let (_repo, engine) = seeded(2).await;
    let record = engine.get(3).await.unwrap();
    assert_eq!(record.id, 3);
    assert!(matches!(engine.get(999).await, Err(Error::NotFound(_))));
}
