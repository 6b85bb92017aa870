//! Session database handle.

pub use docverify_core::db::DatabaseError;

docverify_core::define_database!(Database);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_has_every_table() {
        let db = Database::open_in_memory().await.unwrap();
        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(db.pool())
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        for expected in ["analysis_results", "job_leases", "progress_messages", "sessions"] {
            assert!(names.contains(&expected), "missing table {expected}: {names:?}");
        }
    }
}
