use super::{BatchSink, SinkReceipt};
use crate::model::{field_as_string, ExtractionRequest, Record, SourceKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use extractor_core::{DuplicatePolicy, Error, Result};
use metrics::counter;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Parameters bound per record row.
const PARAMS_PER_ROW: usize = 6;
/// PostgreSQL allows 65535 bind parameters per statement.
const ROWS_PER_STATEMENT: usize = 5000;

/// Last completed incremental window for one `(source, owner, repo, entity)`.
#[derive(Debug, Clone, FromRow)]
pub struct Checkpoint {
    pub source: String,
    pub owner: String,
    pub repo: String,
    pub entity: String,
    pub last_fetched_at: DateTime<Utc>,
    pub records_extracted: i64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn for_request(request: &ExtractionRequest, fetched_at: DateTime<Utc>, records: usize) -> Self {
        Self {
            source: request.source.to_string(),
            owner: request.owner.clone(),
            repo: request.repo.clone().unwrap_or_default(),
            entity: request.entity.clone(),
            last_fetched_at: fetched_at,
            records_extracted: records as i64,
            updated_at: Utc::now(),
        }
    }
}

/// Stores records as JSONB rows keyed by source, owner, repo, entity and the
/// request's key field, and keeps per-entity checkpoints.
pub struct PostgresSink {
    pool: PgPool,
    policy: DuplicatePolicy,
}

impl PostgresSink {
    pub fn new(pool: PgPool, policy: DuplicatePolicy) -> Self {
        Self { pool, policy }
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_chunk(
        &self,
        conn: &mut PgConnection,
        request: &ExtractionRequest,
        records: &[Record],
    ) -> Result<usize> {
        let rows: Vec<String> = (0..records.len())
            .map(|row| {
                let placeholders: Vec<String> = (1..=PARAMS_PER_ROW)
                    .map(|i| format!("${}", row * PARAMS_PER_ROW + i))
                    .collect();
                format!("({})", placeholders.join(", "))
            })
            .collect();

        let conflict = match self.policy {
            DuplicatePolicy::Skip => "ON CONFLICT (source, owner, repo, entity, record_key) DO NOTHING",
            DuplicatePolicy::Fail => "",
        };

        let statement = format!(
            r#"
            INSERT INTO extracted_records (source, owner, repo, entity, record_key, payload)
            VALUES {}
            {}
            "#,
            rows.join(", "),
            conflict
        );

        let source = request.source.to_string();
        let repo = request.repo.clone().unwrap_or_default();
        let mut query = sqlx::query(&statement);
        for record in records {
            // Keyless records get a fresh key so they never collide.
            let key = field_as_string(record, &request.key_field)
                .unwrap_or_else(|| format!("generated:{}", Uuid::new_v4()));
            query = query
                .bind(&source)
                .bind(&request.owner)
                .bind(&repo)
                .bind(&request.entity)
                .bind(key)
                .bind(Json(record));
        }

        let result = query.execute(conn).await.map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return Error::SinkWrite(format!(
                        "duplicate {} for {} {}: {}",
                        request.key_field,
                        request.scope(),
                        request.entity,
                        db.message()
                    ));
                }
            }
            Error::Database(e)
        })?;

        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self))]
    pub async fn get_checkpoint(
        &self,
        source: SourceKind,
        owner: &str,
        repo: Option<&str>,
        entity: &str,
    ) -> Result<Option<Checkpoint>> {
        let checkpoint = sqlx::query_as::<_, Checkpoint>(
            r#"
            SELECT source, owner, repo, entity, last_fetched_at, records_extracted, updated_at
            FROM extraction_checkpoints
            WHERE source = $1 AND owner = $2 AND repo = $3 AND entity = $4
            "#,
        )
        .bind(source.to_string())
        .bind(owner)
        .bind(repo.unwrap_or_default())
        .bind(entity)
        .fetch_optional(&self.pool)
        .await?;

        Ok(checkpoint)
    }

    #[instrument(skip(self, checkpoint), fields(source = %checkpoint.source, owner = %checkpoint.owner, entity = %checkpoint.entity))]
    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO extraction_checkpoints (
                source, owner, repo, entity, last_fetched_at, records_extracted, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source, owner, repo, entity) DO UPDATE SET
                last_fetched_at = EXCLUDED.last_fetched_at,
                records_extracted = extraction_checkpoints.records_extracted + EXCLUDED.records_extracted,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&checkpoint.source)
        .bind(&checkpoint.owner)
        .bind(&checkpoint.repo)
        .bind(&checkpoint.entity)
        .bind(checkpoint.last_fetched_at)
        .bind(checkpoint.records_extracted)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await?;

        counter!("extractor_checkpoints_saved").increment(1);

        debug!(
            last_fetched_at = %checkpoint.last_fetched_at,
            records = checkpoint.records_extracted,
            "Saved checkpoint"
        );

        Ok(())
    }
}

#[async_trait]
impl BatchSink for PostgresSink {
    #[instrument(skip(self, request, records), fields(scope = %request.scope(), entity = %request.entity, records = records.len()))]
    async fn sink(&self, request: &ExtractionRequest, records: &[Record]) -> Result<SinkReceipt> {
        // Every chunk of one call commits, or none does.
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for chunk in records.chunks(ROWS_PER_STATEMENT) {
            written += self.insert_chunk(&mut *tx, request, chunk).await?;
        }
        tx.commit().await?;

        let receipt = SinkReceipt {
            written,
            duplicates: records.len() - written,
        };

        debug!(
            total = records.len(),
            written = receipt.written,
            duplicates = receipt.duplicates,
            "Inserted records"
        );

        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{github_request, record};
    use pretty_assertions::assert_eq;

    async fn stored(pool: &PgPool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM extracted_records")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "needs DATABASE_URL"]
    async fn failed_call_keeps_none_of_its_chunks(pool: PgPool) {
        let sink = PostgresSink::new(pool.clone(), DuplicatePolicy::Fail);
        let request = github_request(100);

        // The last record repeats the first, so only the second chunk fails.
        let mut records: Vec<Record> = (1..=ROWS_PER_STATEMENT as u64).map(record).collect();
        records.push(record(1));

        let err = sink.sink(&request, &records).await.unwrap_err();
        assert!(matches!(err, Error::SinkWrite(_)));
        assert_eq!(stored(&pool).await, 0);

        // Retrying the corrected batch finds nothing of its own already stored.
        records.pop();
        let receipt = sink.sink(&request, &records).await.unwrap();
        assert_eq!(receipt, SinkReceipt { written: ROWS_PER_STATEMENT, duplicates: 0 });
        assert_eq!(stored(&pool).await, ROWS_PER_STATEMENT as i64);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "needs DATABASE_URL"]
    async fn skip_policy_counts_known_rows_as_duplicates(pool: PgPool) {
        let sink = PostgresSink::new(pool.clone(), DuplicatePolicy::Skip);
        let request = github_request(100);

        sink.sink(&request, &[record(1), record(2)]).await.unwrap();
        let receipt = sink.sink(&request, &[record(2), record(3)]).await.unwrap();

        assert_eq!(receipt, SinkReceipt { written: 1, duplicates: 1 });
        assert_eq!(stored(&pool).await, 3);
    }
}
