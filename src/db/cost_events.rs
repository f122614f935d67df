//! LLM cost events: per-call telemetry, never content.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use uuid::Uuid;

use super::{DbError, Store};
use crate::llm::adapter::LlmTelemetry;

impl Store {
    pub fn insert_cost_event(
        &self,
        user_id: &str,
        telemetry: &LlmTelemetry,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.with_conn(|conn| {
            let id = format!("cost-{}", Uuid::new_v4());
            conn.execute(
                "INSERT INTO cost_events
                    (id, user_id, model_version, prompt_version, input_tokens,
                     output_tokens, estimated_cost_usd, duration_ms, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id,
                    user_id,
                    telemetry.model_version,
                    telemetry.prompt_version,
                    telemetry.input_tokens_est,
                    telemetry.output_tokens_est,
                    telemetry.estimated_cost_usd,
                    telemetry.duration_ms,
                    now.to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    /// Spend across all users over the trailing 24 hours.
    pub fn daily_cost_usd(&self, now: DateTime<Utc>) -> Result<f64, DbError> {
        let cutoff = (now - Duration::hours(24)).to_rfc3339();
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(estimated_cost_usd), 0.0) FROM cost_events
                 WHERE created_at >= ?1",
                params![cutoff],
                |row| row.get(0),
            )
            .map_err(DbError::from)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_store;
    use chrono::TimeZone;

    fn telemetry(cost: f64) -> LlmTelemetry {
        LlmTelemetry {
            model_version: "m".to_string(),
            prompt_version: "p".to_string(),
            input_tokens_est: 100,
            output_tokens_est: 50,
            duration_ms: 120,
            estimated_cost_usd: cost,
        }
    }

    #[test]
    fn test_daily_rollup_ignores_old_events() {
        let store = test_store();
        let now = Utc.with_ymd_and_hms(2025, 11, 10, 12, 0, 0).unwrap();
        store
            .insert_cost_event("u1", &telemetry(0.5), now)
            .expect("insert");
        store
            .insert_cost_event("u1", &telemetry(0.25), now - chrono::Duration::hours(30))
            .expect("insert");

        let total = store.daily_cost_usd(now).expect("rollup");
        assert!((total - 0.5).abs() < 1e-9, "old event excluded, got {}", total);
    }
}
