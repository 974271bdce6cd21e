//! Postgres-backed rate store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fxrates_common::{Currency, CurrencyPair};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{FxError, FxResult};
use crate::store::{ExchangeRate, RateStore, RateUpdate};

/// Rows per multi-row INSERT inside a bulk upsert transaction.
const BATCH_SIZE: usize = 500;

const CREATE_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS exchange_rates (
    id UUID PRIMARY KEY,
    base_currency VARCHAR(3) NOT NULL,
    target_currency VARCHAR(3) NOT NULL,
    rate NUMERIC(20, 10) NOT NULL,
    fetched_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    deleted_at TIMESTAMPTZ
)";

const CREATE_PAIR_INDEX: &str = "\
CREATE UNIQUE INDEX IF NOT EXISTS idx_exchange_rates_pair
    ON exchange_rates (base_currency, target_currency)";

const SELECT_COLUMNS: &str =
    "SELECT id, base_currency, target_currency, rate, fetched_at, created_at, updated_at FROM exchange_rates";

const UPSERT_CONFLICT: &str = " ON CONFLICT (base_currency, target_currency) DO UPDATE SET \
    rate = EXCLUDED.rate, fetched_at = EXCLUDED.fetched_at, \
    updated_at = EXCLUDED.updated_at, deleted_at = NULL";

#[derive(Debug, sqlx::FromRow)]
struct ExchangeRateRow {
    id: Uuid,
    base_currency: String,
    target_currency: String,
    rate: Decimal,
    fetched_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ExchangeRateRow> for ExchangeRate {
    type Error = FxError;

    fn try_from(row: ExchangeRateRow) -> FxResult<Self> {
        let decode = |code: &str| {
            Currency::parse(code).map_err(|e| FxError::persistence("decode row", e))
        };
        Ok(ExchangeRate {
            id: row.id,
            base_currency: decode(&row.base_currency)?,
            target_currency: decode(&row.target_currency)?,
            rate: row.rate,
            fetched_at: row.fetched_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_rows(rows: Vec<ExchangeRateRow>) -> FxResult<Vec<ExchangeRate>> {
    rows.into_iter().map(ExchangeRate::try_from).collect()
}

/// Keep the last update per pair so one INSERT never touches a row twice.
fn dedupe(updates: &[RateUpdate]) -> Vec<&RateUpdate> {
    let mut positions: HashMap<&CurrencyPair, usize> = HashMap::new();
    let mut unique: Vec<&RateUpdate> = Vec::with_capacity(updates.len());
    for update in updates {
        match positions.get(&update.pair) {
            Some(&idx) => unique[idx] = update,
            None => {
                positions.insert(&update.pair, unique.len());
                unique.push(update);
            }
        }
    }
    unique
}

/// Rate store over the `exchange_rates` table.
///
/// Pruned rows are soft-deleted through `deleted_at`; an upsert for the same
/// pair revives the row.
#[derive(Clone)]
pub struct PgRateStore {
    pool: PgPool,
}

impl PgRateStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> FxResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| FxError::persistence("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the table and pair index if they do not exist.
    pub async fn ensure_schema(&self) -> FxResult<()> {
        for statement in [CREATE_TABLE, CREATE_PAIR_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| FxError::persistence("ensure schema", e))?;
        }
        info!("exchange_rates schema ready");
        Ok(())
    }

    fn upsert_builder<'a>(
        updates: impl IntoIterator<Item = &'a RateUpdate>,
        now: DateTime<Utc>,
    ) -> QueryBuilder<'a, Postgres> {
        let mut builder = QueryBuilder::new(
            "INSERT INTO exchange_rates \
             (id, base_currency, target_currency, rate, fetched_at, created_at, updated_at) ",
        );
        builder.push_values(updates, |mut row, update| {
            row.push_bind(Uuid::now_v7())
                .push_bind(update.pair.base.code().to_string())
                .push_bind(update.pair.target.code().to_string())
                .push_bind(update.rate)
                .push_bind(update.fetched_at)
                .push_bind(now)
                .push_bind(now);
        });
        builder.push(UPSERT_CONFLICT);
        builder
    }
}

#[async_trait]
impl RateStore for PgRateStore {
    #[instrument(skip_all, fields(pair = %pair))]
    async fn get_rate(&self, pair: &CurrencyPair) -> FxResult<Option<ExchangeRate>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE base_currency = $1 AND target_currency = $2 AND deleted_at IS NULL"
        );
        let row = sqlx::query_as::<_, ExchangeRateRow>(&sql)
            .bind(pair.base.code())
            .bind(pair.target.code())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| FxError::persistence(format!("get rate {pair}"), e))?;

        row.map(ExchangeRate::try_from).transpose()
    }

    async fn get_rates_for_base(&self, base: &Currency) -> FxResult<Vec<ExchangeRate>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE base_currency = $1 AND deleted_at IS NULL ORDER BY target_currency"
        );
        let rows = sqlx::query_as::<_, ExchangeRateRow>(&sql)
            .bind(base.code())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| FxError::persistence(format!("get rates for base {base}"), e))?;

        decode_rows(rows)
    }

    async fn get_all_rates(&self) -> FxResult<Vec<ExchangeRate>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE deleted_at IS NULL ORDER BY base_currency, target_currency"
        );
        let rows = sqlx::query_as::<_, ExchangeRateRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| FxError::persistence("get all rates", e))?;

        decode_rows(rows)
    }

    #[instrument(skip_all, fields(pair = %update.pair))]
    async fn upsert_rate(&self, update: &RateUpdate) -> FxResult<ExchangeRate> {
        let mut builder = Self::upsert_builder([update], Utc::now());
        builder.push(
            " RETURNING id, base_currency, target_currency, rate, fetched_at, created_at, updated_at",
        );

        let row = builder
            .build_query_as::<ExchangeRateRow>()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| FxError::persistence(format!("upsert rate {}", update.pair), e))?;

        ExchangeRate::try_from(row)
    }

    #[instrument(skip_all, fields(count = updates.len()))]
    async fn bulk_upsert_rates(&self, updates: &[RateUpdate]) -> FxResult<usize> {
        if updates.is_empty() {
            return Ok(0);
        }

        let unique = dedupe(updates);
        let now = Utc::now();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| FxError::persistence("bulk upsert rates", e))?;

        for chunk in unique.chunks(BATCH_SIZE) {
            Self::upsert_builder(chunk.iter().copied(), now)
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| FxError::persistence("bulk upsert rates", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| FxError::persistence("bulk upsert rates", e))?;

        debug!(rows = unique.len(), "Bulk upsert committed");
        Ok(unique.len())
    }

    async fn delete_old_rates(&self, older_than: DateTime<Utc>) -> FxResult<u64> {
        let result = sqlx::query(
            "UPDATE exchange_rates SET deleted_at = $1 WHERE fetched_at < $2 AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|e| FxError::persistence("delete old rates", e))?;

        Ok(result.rows_affected())
    }

    async fn get_latest_fetch_time(&self) -> FxResult<Option<DateTime<Utc>>> {
        sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(fetched_at) FROM exchange_rates WHERE deleted_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| FxError::persistence("get latest fetch time", e))
    }
}
