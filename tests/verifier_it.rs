use async_trait::async_trait;
use cropcast::{
    audit::{AuditLog, LogAction, LogLevel},
    error::CropcastResult,
    verify::{Checker, CheckerConfig, FreshFetcher, Severity, VerificationTarget},
};
use serde_json::{Map, Value, json};

struct CannedUpstream {
    fresh: Map<String, Value>,
    available: bool,
}

#[async_trait]
impl FreshFetcher for CannedUpstream {
    async fn fetch_fresh(
        &self,
        _target: &VerificationTarget,
    ) -> CropcastResult<Option<Map<String, Value>>> {
        Ok(self.available.then(|| self.fresh.clone()))
    }
}

/// Write a collector log containing one DATA_SAVE entry and return its path.
fn collector_log(dir: &std::path::Path, saved: Value) -> std::path::PathBuf {
    let audit = AuditLog::create(dir, "epa_echo", "collrun1").unwrap();
    audit.record(
        LogLevel::Info,
        LogAction::Startup,
        json!({"description": "Starting epa_echo"}),
    );
    audit.record(
        LogLevel::Info,
        LogAction::DataSave,
        json!({
            "description": "Saved 1 record",
            "affected_record_ids": ["110000123456"],
            "facility_name": "ACME PROCESSORS",
            "source_endpoint": "https://echo.epa.gov/tools/web-services",
            "verification_url": "https://echo.epa.gov/detailed-facility-report?fid=110000123456",
            "new_values": saved,
        }),
    );
    audit.record(
        LogLevel::Info,
        LogAction::Shutdown,
        json!({"description": "COMPLETE"}),
    );
    audit.log_path().unwrap().to_path_buf()
}

/// Scenario: the saved facility name no longer matches the fresh fetch and
/// the severity rules classify `AIRName` as HIGH.
#[tokio::test]
async fn field_mismatch_classified_by_severity_rules() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = collector_log(
        dir.path(),
        json!({"AIRName": "ACME PROCESSORS", "AIRCity": "AMES"}),
    );

    let checker = Checker::in_memory(
        CheckerConfig::new("epa_echo_checker")
            .full()
            .with_rule("AIRName", Severity::High),
    );
    let upstream = CannedUpstream {
        fresh: json!({"AIRName": "ACME PROCESSING LLC", "AIRCity": "AMES"})
            .as_object()
            .unwrap()
            .clone(),
        available: true,
    };

    let result = checker.check(&log_path, &upstream).await.unwrap();
    assert_eq!(result.records_checked, 1);
    assert_eq!(result.records_mismatched, 1);
    assert_eq!(result.high_severity_count, 1);
    assert!(!result.success);

    let (record_id, mismatches) = &result.mismatches[0];
    assert_eq!(record_id, "110000123456");
    assert_eq!(mismatches[0].field, "AIRName");
    assert_eq!(mismatches[0].severity, Severity::High);

    // VERIFICATION_RESULT line with status=mismatch and the HIGH severity.
    let records = checker.audit().captured();
    let verification = records
        .iter()
        .find(|r| r.action == LogAction::VerificationResult)
        .expect("verification record");
    assert_eq!(verification.details["status"], "mismatch");
    assert_eq!(verification.details["mismatches"][0]["severity"], "HIGH");

    // And the run summary closes with a SHUTDOWN record.
    assert!(records.iter().any(|r| r.action == LogAction::Shutdown));
}

#[tokio::test]
async fn matching_records_and_unavailable_sources_are_counted() {
    let dir = tempfile::tempdir().unwrap();
    let saved = json!({"AIRName": "PRAIRIE ETHANOL", "AIRState": "NE"});
    let log_path = collector_log(dir.path(), saved.clone());

    // Identical upstream: a match.
    let checker = Checker::in_memory(CheckerConfig::new("epa_echo_checker").full());
    let upstream = CannedUpstream {
        fresh: saved.as_object().unwrap().clone(),
        available: true,
    };
    let result = checker.check(&log_path, &upstream).await.unwrap();
    assert_eq!(result.records_matched, 1);
    assert_eq!(result.records_mismatched, 0);
    assert!(result.success);

    // Upstream gone: counted separately, not a mismatch.
    let checker = Checker::in_memory(CheckerConfig::new("epa_echo_checker").full());
    let upstream = CannedUpstream {
        fresh: Map::new(),
        available: false,
    };
    let result = checker.check(&log_path, &upstream).await.unwrap();
    assert_eq!(result.records_source_unavailable, 1);
    assert_eq!(result.records_mismatched, 0);
}
