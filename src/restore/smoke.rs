// Post-restore smoke tests

use crate::artifact::SmokeTestResults;
use crate::db::LiveInstance;
use tracing::{info, warn};

/// Connectivity, a non-zero table count and, when configured, the audit relation.
pub async fn run_smoke_tests(live: &dyn LiveInstance, audit_relation: Option<&str>) -> SmokeTestResults {
    let mut results = SmokeTestResults::default();

    if let Err(e) = live.ping().await {
        results.failures.push(format!("connectivity: {}", e));
        warn!(error = %e, "Restored instance not reachable");
        return results;
    }
    results.connectivity = true;

    match live.table_count().await {
        Ok(0) => {
            results.table_count = Some(0);
            results.failures.push("restored instance has no tables".to_string());
        }
        Ok(n) => results.table_count = Some(n),
        Err(e) => results.failures.push(format!("table count: {}", e)),
    }

    if let Some(relation) = audit_relation {
        match live.relation_exists(relation).await {
            Ok(true) => results.audit_relation = Some(true),
            Ok(false) => {
                results.audit_relation = Some(false);
                results.failures.push(format!("audit relation {} missing", relation));
            }
            Err(e) => results.failures.push(format!("audit relation {}: {}", relation, e)),
        }
    }

    info!(
        passed = results.passed(),
        table_count = ?results.table_count,
        audit_relation = ?results.audit_relation,
        "Smoke tests finished"
    );
    results
}
