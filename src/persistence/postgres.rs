use crate::domain::{NormalizedEvent, NormalizedMarket};
use crate::error::{PipelineError, Result};
use crate::persistence::models::{
    EventResolution, ExperimentResultInput, ExperimentRunInput, MarketRecord,
    MarketResolutionUpdate, ProcessedEventInput, ProcessedMarketInput, ProcessingFailureInput,
    ProcessingRunInput, ResearchArtifactInput, RunFinalization, UnresolvedQuery,
};
use crate::persistence::repository::{
    MarketRepository, PipelineSession, ProcessingRepository, SessionFactory,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SessionFactory for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn PipelineSession>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSession {
            tx: Mutex::new(Some(tx)),
        }))
    }
}

/// One database transaction; rolled back when dropped uncommitted
pub struct PgSession {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

fn active<'a>(
    slot: &'a mut Option<Transaction<'static, Postgres>>,
) -> Result<&'a mut Transaction<'static, Postgres>> {
    slot.as_mut()
        .ok_or_else(|| PipelineError::Repository("session already committed".to_string()))
}

fn market_record(row: &PgRow) -> Result<MarketRecord> {
    Ok(MarketRecord {
        market_id: row.try_get("market_id")?,
        event_id: row.try_get("event_id")?,
        status: row.try_get("status")?,
        close_time: row.try_get("close_time")?,
        is_resolved: row.try_get("is_resolved")?,
        resolved_at: row.try_get("resolved_at")?,
        resolution_source: row.try_get("resolution_source")?,
        winning_outcome: row.try_get("winning_outcome")?,
        payout_token: row.try_get("payout_token")?,
        resolution_tx_hash: row.try_get("resolution_tx_hash")?,
        resolution_notes: row.try_get("resolution_notes")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

const MARKET_RECORD_COLUMNS: &str = "market_id, event_id, status, close_time, is_resolved, \
     resolved_at, resolution_source, winning_outcome, payout_token, resolution_tx_hash, \
     resolution_notes, last_synced_at";

#[async_trait]
impl ProcessingRepository for PgSession {
    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    async fn create_processing_run(&self, run: &ProcessingRunInput) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query(
            r#"
            INSERT INTO processing_runs (run_id, run_date, window_days, target_date, git_sha, environment, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'running')
            "#,
        )
        .bind(&run.run_id)
        .bind(run.run_date)
        .bind(run.window_days)
        .bind(run.target_date)
        .bind(&run.git_sha)
        .bind(&run.environment)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn ensure_processing_run(&self, run_id: &str) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query(
            r#"
            INSERT INTO processing_runs (run_id, status)
            VALUES ($1, 'replayed')
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(run_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn finalize_processing_run(&self, run_id: &str, finalization: &RunFinalization) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query(
            r#"
            UPDATE processing_runs SET
                status = $2,
                total_markets = $3,
                processed_markets = $4,
                failed_markets = $5,
                finished_at = $6
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(finalization.status.as_str())
        .bind(finalization.total_markets as i64)
        .bind(finalization.processed_markets as i64)
        .bind(finalization.failed_markets as i64)
        .bind(finalization.finished_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn record_processed_event(&self, input: &ProcessedEventInput) -> Result<String> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let row = sqlx::query(
            r#"
            INSERT INTO processed_events (processed_event_id, run_id, event_key, event_id, event_slug, event_title, raw_snapshot)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (run_id, event_key) DO UPDATE SET
                event_id = EXCLUDED.event_id,
                event_slug = EXCLUDED.event_slug,
                event_title = EXCLUDED.event_title,
                raw_snapshot = EXCLUDED.raw_snapshot,
                processed_at = NOW()
            RETURNING processed_event_id
            "#,
        )
        .bind(&input.processed_event_id)
        .bind(&input.run_id)
        .bind(&input.event_key)
        .bind(&input.event_id)
        .bind(&input.event_slug)
        .bind(&input.event_title)
        .bind(&input.raw_snapshot)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row.try_get("processed_event_id")?)
    }

    async fn record_processed_market(&self, input: &ProcessedMarketInput) -> Result<String> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let row = sqlx::query(
            r#"
            INSERT INTO processed_markets (processed_market_id, run_id, processed_event_id, market_id, market_slug, question, close_time, raw_snapshot)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (run_id, market_id) DO UPDATE SET
                processed_event_id = EXCLUDED.processed_event_id,
                market_slug = EXCLUDED.market_slug,
                question = EXCLUDED.question,
                close_time = EXCLUDED.close_time,
                raw_snapshot = EXCLUDED.raw_snapshot,
                processed_at = NOW()
            RETURNING processed_market_id
            "#,
        )
        .bind(&input.processed_market_id)
        .bind(&input.run_id)
        .bind(&input.processed_event_id)
        .bind(&input.market_id)
        .bind(&input.market_slug)
        .bind(&input.question)
        .bind(input.close_time)
        .bind(&input.raw_snapshot)
        .fetch_one(&mut **tx)
        .await?;
        let processed_market_id: String = row.try_get("processed_market_id")?;

        sqlx::query("DELETE FROM processed_contracts WHERE processed_market_id = $1")
            .bind(&processed_market_id)
            .execute(&mut **tx)
            .await?;
        for contract in &input.contracts {
            sqlx::query(
                r#"
                INSERT INTO processed_contracts (processed_market_id, contract_id, name, price, attributes)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&processed_market_id)
            .bind(&contract.contract_id)
            .bind(&contract.name)
            .bind(contract.price)
            .bind(&contract.attributes)
            .execute(&mut **tx)
            .await?;
        }

        debug!(
            "Recorded processed market {} with {} contracts",
            input.market_id,
            input.contracts.len()
        );
        Ok(processed_market_id)
    }

    async fn record_processing_failure(&self, input: &ProcessingFailureInput) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query(
            r#"
            INSERT INTO processing_failures (run_id, market_id, reason, retriable, details)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&input.run_id)
        .bind(&input.market_id)
        .bind(&input.reason)
        .bind(input.retriable)
        .bind(&input.details)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn record_experiment_run(&self, input: &ExperimentRunInput) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query(
            r#"
            INSERT INTO experiment_runs (experiment_run_id, run_id, experiment_name, experiment_version, description, stage, status, started_at, finished_at, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (experiment_run_id) DO UPDATE SET
                experiment_name = EXCLUDED.experiment_name,
                experiment_version = EXCLUDED.experiment_version,
                description = COALESCE(EXCLUDED.description, experiment_runs.description),
                stage = EXCLUDED.stage,
                status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at,
                error_message = EXCLUDED.error_message
            "#,
        )
        .bind(&input.experiment_run_id)
        .bind(&input.run_id)
        .bind(&input.experiment_name)
        .bind(&input.experiment_version)
        .bind(&input.description)
        .bind(input.stage.as_str())
        .bind(&input.status)
        .bind(input.started_at)
        .bind(input.finished_at)
        .bind(&input.error_message)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn ensure_experiment_run(&self, input: &ExperimentRunInput) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query(
            r#"
            INSERT INTO experiment_runs (experiment_run_id, run_id, experiment_name, experiment_version, description, stage, status, started_at, finished_at, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (experiment_run_id) DO NOTHING
            "#,
        )
        .bind(&input.experiment_run_id)
        .bind(&input.run_id)
        .bind(&input.experiment_name)
        .bind(&input.experiment_version)
        .bind(&input.description)
        .bind(input.stage.as_str())
        .bind(&input.status)
        .bind(input.started_at)
        .bind(input.finished_at)
        .bind(&input.error_message)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn record_research_artifact(&self, input: &ResearchArtifactInput) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query(
            r#"
            INSERT INTO research_artifacts (artifact_id, experiment_run_id, processed_market_id, processed_event_id, variant_name, variant_version, artifact_hash, payload, artifact_uri)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (artifact_id) DO UPDATE SET
                processed_market_id = EXCLUDED.processed_market_id,
                processed_event_id = EXCLUDED.processed_event_id,
                variant_name = EXCLUDED.variant_name,
                variant_version = EXCLUDED.variant_version,
                artifact_hash = EXCLUDED.artifact_hash,
                payload = EXCLUDED.payload,
                artifact_uri = EXCLUDED.artifact_uri,
                updated_at = NOW()
            "#,
        )
        .bind(&input.artifact_id)
        .bind(&input.experiment_run_id)
        .bind(&input.processed_market_id)
        .bind(&input.processed_event_id)
        .bind(&input.variant_name)
        .bind(&input.variant_version)
        .bind(&input.artifact_hash)
        .bind(&input.payload)
        .bind(&input.artifact_uri)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn record_experiment_result(&self, input: &ExperimentResultInput) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query(
            r#"
            INSERT INTO experiment_results (result_key, experiment_run_id, processed_market_id, processed_event_id, stage, variant_name, variant_version, source_artifact_id, payload, score, artifact_uri)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (result_key) DO UPDATE SET
                stage = EXCLUDED.stage,
                variant_name = EXCLUDED.variant_name,
                variant_version = EXCLUDED.variant_version,
                source_artifact_id = EXCLUDED.source_artifact_id,
                payload = EXCLUDED.payload,
                score = EXCLUDED.score,
                artifact_uri = EXCLUDED.artifact_uri,
                recorded_at = NOW()
            "#,
        )
        .bind(input.result_key())
        .bind(&input.experiment_run_id)
        .bind(&input.processed_market_id)
        .bind(&input.processed_event_id)
        .bind(input.stage.as_str())
        .bind(&input.variant_name)
        .bind(&input.variant_version)
        .bind(&input.source_artifact_id)
        .bind(&input.payload)
        .bind(input.score)
        .bind(&input.artifact_uri)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

impl PgSession {
    async fn upsert_event_in(
        tx: &mut Transaction<'static, Postgres>,
        event: &NormalizedEvent,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (event_id, slug, title, description, start_time, end_time, icon_url, series_slug, series_title, raw_data, is_resolved, resolved_at, resolution_source)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, COALESCE($11, FALSE), $12, $13)
            ON CONFLICT (event_id) DO UPDATE SET
                slug = EXCLUDED.slug,
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                start_time = EXCLUDED.start_time,
                end_time = EXCLUDED.end_time,
                icon_url = EXCLUDED.icon_url,
                series_slug = EXCLUDED.series_slug,
                series_title = EXCLUDED.series_title,
                raw_data = EXCLUDED.raw_data,
                is_resolved = COALESCE($11, events.is_resolved),
                resolved_at = COALESCE(EXCLUDED.resolved_at, events.resolved_at),
                resolution_source = COALESCE(EXCLUDED.resolution_source, events.resolution_source),
                updated_at = NOW()
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.slug)
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.start_time)
        .bind(event.end_time)
        .bind(&event.icon_url)
        .bind(&event.series_slug)
        .bind(&event.series_title)
        .bind(&event.raw_data)
        .bind(event.is_resolved)
        .bind(event.resolved_at)
        .bind(&event.resolution_source)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MarketRepository for PgSession {
    #[instrument(skip(self, market), fields(market_id = %market.market_id))]
    async fn upsert_market(&self, market: &NormalizedMarket) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;

        let event = market.event.as_ref().filter(|e| !e.event_id.is_empty());
        if let Some(event) = event {
            Self::upsert_event_in(tx, event).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO markets (market_id, event_id, slug, question, category, sub_category, open_time, close_time,
                volume_usd, liquidity_usd, fee_bps, status, description, icon_url, raw_data,
                is_resolved, resolved_at, resolution_source, winning_outcome, payout_token, resolution_tx_hash, resolution_notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                COALESCE($16, FALSE), $17, $18, $19, $20, $21, $22)
            ON CONFLICT (market_id) DO UPDATE SET
                event_id = EXCLUDED.event_id,
                slug = EXCLUDED.slug,
                question = EXCLUDED.question,
                category = EXCLUDED.category,
                sub_category = EXCLUDED.sub_category,
                open_time = EXCLUDED.open_time,
                close_time = EXCLUDED.close_time,
                volume_usd = EXCLUDED.volume_usd,
                liquidity_usd = EXCLUDED.liquidity_usd,
                fee_bps = EXCLUDED.fee_bps,
                status = EXCLUDED.status,
                description = EXCLUDED.description,
                icon_url = EXCLUDED.icon_url,
                raw_data = EXCLUDED.raw_data,
                is_resolved = COALESCE($16, markets.is_resolved),
                resolved_at = COALESCE(EXCLUDED.resolved_at, markets.resolved_at),
                resolution_source = COALESCE(EXCLUDED.resolution_source, markets.resolution_source),
                winning_outcome = COALESCE(EXCLUDED.winning_outcome, markets.winning_outcome),
                payout_token = COALESCE(EXCLUDED.payout_token, markets.payout_token),
                resolution_tx_hash = COALESCE(EXCLUDED.resolution_tx_hash, markets.resolution_tx_hash),
                resolution_notes = COALESCE(EXCLUDED.resolution_notes, markets.resolution_notes)
            "#,
        )
        .bind(&market.market_id)
        .bind(event.map(|e| e.event_id.as_str()))
        .bind(&market.slug)
        .bind(&market.question)
        .bind(&market.category)
        .bind(&market.sub_category)
        .bind(market.open_time)
        .bind(market.close_time)
        .bind(market.volume_usd)
        .bind(market.liquidity_usd)
        .bind(market.fee_bps)
        .bind(&market.status)
        .bind(&market.description)
        .bind(&market.icon_url)
        .bind(&market.raw_data)
        .bind(market.is_resolved)
        .bind(market.resolved_at)
        .bind(&market.resolution_source)
        .bind(&market.winning_outcome)
        .bind(&market.payout_token)
        .bind(&market.resolution_tx_hash)
        .bind(&market.resolution_notes)
        .execute(&mut **tx)
        .await?;

        let contract_ids: Vec<String> = market
            .contracts
            .iter()
            .map(|c| c.contract_id.clone())
            .collect();
        for contract in &market.contracts {
            sqlx::query(
                r#"
                INSERT INTO contracts (contract_id, market_id, name, outcome_type, current_price, confidence, implied_probability, raw_data)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (contract_id) DO UPDATE SET
                    market_id = EXCLUDED.market_id,
                    name = EXCLUDED.name,
                    outcome_type = EXCLUDED.outcome_type,
                    current_price = EXCLUDED.current_price,
                    confidence = EXCLUDED.confidence,
                    implied_probability = EXCLUDED.implied_probability,
                    raw_data = EXCLUDED.raw_data
                "#,
            )
            .bind(&contract.contract_id)
            .bind(&market.market_id)
            .bind(&contract.name)
            .bind(&contract.outcome_type)
            .bind(contract.current_price)
            .bind(contract.confidence)
            .bind(contract.implied_probability)
            .bind(&contract.raw_data)
            .execute(&mut **tx)
            .await?;
        }
        sqlx::query("DELETE FROM contracts WHERE market_id = $1 AND NOT (contract_id = ANY($2))")
            .bind(&market.market_id)
            .bind(&contract_ids)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    async fn upsert_event(&self, event: &NormalizedEvent) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        Self::upsert_event_in(tx, event).await
    }

    async fn fetch_unresolved_markets(&self, query: &UnresolvedQuery) -> Result<Vec<MarketRecord>> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let sql = format!(
            r#"
            SELECT {MARKET_RECORD_COLUMNS}
            FROM markets
            WHERE is_resolved = FALSE
              AND (cardinality($1::text[]) = 0 OR event_id = ANY($1))
              AND ($2::timestamptz IS NULL OR last_synced_at >= $2)
            ORDER BY close_time ASC NULLS LAST, market_id ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(&query.event_ids)
            .bind(query.recent_cutoff)
            .bind(query.limit.filter(|l| *l > 0))
            .fetch_all(&mut **tx)
            .await?;
        rows.iter().map(market_record).collect()
    }

    async fn mark_market_synced(&self, market_id: &str, synced_at: DateTime<Utc>) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query("UPDATE markets SET last_synced_at = $2 WHERE market_id = $1")
            .bind(market_id)
            .bind(synced_at)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn apply_market_resolution(&self, update: &MarketResolutionUpdate) -> Result<bool> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let sql = format!("SELECT {MARKET_RECORD_COLUMNS} FROM markets WHERE market_id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(&update.market_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| {
                PipelineError::Repository(format!("market {} does not exist", update.market_id))
            })?;
        let mut record = market_record(&row)?;
        let changed = record.apply_resolution(update);

        sqlx::query(
            r#"
            UPDATE markets SET
                is_resolved = $2,
                status = $3,
                resolved_at = $4,
                resolution_source = $5,
                winning_outcome = $6,
                payout_token = $7,
                resolution_tx_hash = $8,
                resolution_notes = $9,
                last_synced_at = $10
            WHERE market_id = $1
            "#,
        )
        .bind(&record.market_id)
        .bind(record.is_resolved)
        .bind(&record.status)
        .bind(record.resolved_at)
        .bind(&record.resolution_source)
        .bind(&record.winning_outcome)
        .bind(&record.payout_token)
        .bind(&record.resolution_tx_hash)
        .bind(&record.resolution_notes)
        .bind(update.checked_at)
        .execute(&mut **tx)
        .await?;
        Ok(changed)
    }

    async fn refresh_event_resolution(&self, event_id: &str) -> Result<Option<EventResolution>> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let exists = sqlx::query("SELECT 1 FROM events WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&mut **tx)
            .await?
            .is_some();
        if !exists {
            return Ok(None);
        }

        let sql = format!(
            "SELECT {MARKET_RECORD_COLUMNS} FROM markets WHERE event_id = $1 ORDER BY market_id"
        );
        let rows = sqlx::query(&sql).bind(event_id).fetch_all(&mut **tx).await?;
        let markets = rows.iter().map(market_record).collect::<Result<Vec<_>>>()?;
        let resolution = EventResolution::from_markets(event_id, &markets);

        sqlx::query(
            r#"
            UPDATE events SET
                is_resolved = $2,
                resolved_at = $3,
                resolution_source = $4,
                updated_at = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(resolution.is_resolved)
        .bind(resolution.resolved_at)
        .bind(&resolution.resolution_source)
        .execute(&mut **tx)
        .await?;
        Ok(Some(resolution))
    }
}

#[async_trait]
impl PipelineSession for PgSession {
    async fn commit(&self) -> Result<()> {
        let tx = self.tx.lock().await.take().ok_or_else(|| {
            PipelineError::Repository("session already committed".to_string())
        })?;
        tx.commit().await?;
        debug!("PostgreSQL session committed");
        Ok(())
    }
}
