mod common;

use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use cropcast::{
    audit::{AuditLog, LogAction, read_log},
    collect::contract::{Collector, CollectorConfig, FetchRequest, SourceContext},
    collect::sources::indec::IndecCollector,
    http::{HttpClient, HttpConfig},
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path_regex},
};

/// Scenario: the upstream answers 503 on every attempt. With three attempts
/// the collector logs warnings, then one error, and the run envelope carries
/// `success = false` with a max-retries message — nothing is raised across
/// the `run()` boundary.
#[tokio::test]
async fn retry_exhaustion_surfaces_in_result_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"/files/.*"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let (app, _dir) = common::test_config();
    let mut config = CollectorConfig::new("indec", &server.uri()).with_retries(3, 0.01);
    config.rate_limit_per_minute = 100_000.0;
    let ctx = SourceContext::ephemeral(app, common::memory_store(), &config);
    let audit = Arc::clone(&ctx.audit);
    let collector = IndecCollector::with_context(config, ctx);

    let request = FetchRequest::month(2024, 7).with_param("flow", "export");
    let result = collector.run(request).await;

    assert!(!result.success);
    assert!(
        result
            .errors
            .iter()
            .any(|e| e.contains("Max retries (3) exceeded")),
        "errors were: {:?}",
        result.errors
    );
    assert_eq!(result.api_calls_made, 3);

    let records = audit.captured();
    let warnings = records
        .iter()
        .filter(|r| r.details["description"]
            .as_str()
            .is_some_and(|d| d.contains("Server error")))
        .count();
    assert_eq!(warnings, 3);
    let max_retry_errors = records
        .iter()
        .filter(|r| r.action == LogAction::Error)
        .filter(|r| r.details["description"]
            .as_str()
            .is_some_and(|d| d.contains("Max retries")))
        .count();
    assert_eq!(max_retry_errors, 1);
}

/// A release-day 404 is a scheduled-retry reason, not an error.
#[tokio::test]
async fn release_day_404_maps_to_not_published() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let (app, _dir) = common::test_config();
    let mut config = CollectorConfig::new("indec", &server.uri());
    config.rate_limit_per_minute = 100_000.0;
    let ctx = SourceContext::ephemeral(app, common::memory_store(), &config);
    let collector = IndecCollector::with_context(config, ctx);

    let request = FetchRequest::month(2024, 7).with_param("flow", "export");
    let result = collector.run(request).await;

    assert!(!result.success);
    assert!(result.not_published);
    assert!(result.errors.is_empty());
    assert!(result.warnings.iter().any(|w| w.contains("not published")));
}

/// Every audit line is a JSON object with the contract fields and a
/// UTC RFC3339 timestamp. STARTUP precedes API_CALLs precedes SHUTDOWN.
#[tokio::test]
async fn audit_log_lines_honor_the_contract() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("anio;mes;ncm;pais;pnet_kg;fob_usd\n2024;7;12019000;China;100;200\n"),
        )
        .mount(&server)
        .await;

    let (app, _dir) = common::test_config();
    let mut config = CollectorConfig::new("indec", &server.uri());
    config.rate_limit_per_minute = 100_000.0;
    let ctx = SourceContext::new(Arc::clone(&app), common::memory_store(), &config)
        .expect("create context");
    let log_path = ctx.audit.log_path().expect("file-backed audit").to_path_buf();
    let collector = IndecCollector::with_context(config, ctx);

    let request = FetchRequest::month(2024, 7).with_param("flow", "export");
    let result = collector.run(request).await;
    assert!(result.success, "errors: {:?}", result.errors);

    // Log file name shape: {collector}_{YYYY-MM-DD}_{HH-MM-SS}.log
    let file_name = log_path.file_name().unwrap().to_string_lossy().to_string();
    assert!(file_name.starts_with("indec_"));
    assert!(file_name.ends_with(".log"));

    let raw = std::fs::read_to_string(&log_path).unwrap();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let value: serde_json::Value = serde_json::from_str(line).expect("JSON-valid line");
        for field in ["timestamp", "level", "collector", "action", "details", "run_id"] {
            assert!(value.get(field).is_some(), "missing {field} in {line}");
        }
        let ts = value["timestamp"].as_str().unwrap();
        ts.parse::<DateTime<Utc>>().expect("RFC3339 UTC timestamp");
    }

    let records = read_log(&log_path).unwrap();
    let order: Vec<LogAction> = records.iter().map(|r| r.action).collect();
    let startup = order.iter().position(|a| *a == LogAction::Startup).unwrap();
    let first_call = order.iter().position(|a| *a == LogAction::ApiCall).unwrap();
    let save = order.iter().position(|a| *a == LogAction::DataSave).unwrap();
    let shutdown = order.iter().position(|a| *a == LogAction::Shutdown).unwrap();
    assert!(startup < first_call && first_call < save && save < shutdown);
    assert!(records.iter().all(|r| r.run_id == records[0].run_id));
}

/// The session enforces a minimum inter-request gap of
/// `60 / rate_limit_per_minute` seconds.
#[tokio::test]
async fn rate_limit_spaces_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&server)
        .await;

    // 600/min -> 100ms gap.
    let config = HttpConfig {
        rate_limit_per_minute: 600.0,
        ..HttpConfig::default()
    };
    let audit = Arc::new(AuditLog::in_memory("rate_test", "run1"));
    let client = HttpClient::new(config, Arc::clone(&audit), None);

    let started = Instant::now();
    for _ in 0..3 {
        client.get(&server.uri(), &[]).await.unwrap();
    }
    let elapsed = started.elapsed();

    // Two full gaps between three calls.
    assert!(
        elapsed.as_millis() >= 200,
        "requests not spaced: {elapsed:?}"
    );
    let api_calls = audit
        .captured()
        .iter()
        .filter(|r| r.action == LogAction::ApiCall)
        .count();
    assert_eq!(api_calls, 3);
}
