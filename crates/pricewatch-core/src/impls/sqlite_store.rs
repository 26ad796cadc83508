//! SqlitePriceStore - SQLite による PriceStore 実装（sqlx）
//!
//! 価格・順位カラムは NUMERIC affinity。数値は数値として保存され、
//! "we lead" などのラベルはテキストのまま残る。

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::domain::{Field, RankedRow};
use crate::ports::{PriceStore, StoreError};

const CREATE_PRICES: &str = r#"
    CREATE TABLE IF NOT EXISTS prices (
        part_number  TEXT NOT NULL,
        brand_name   TEXT NOT NULL,
        rank_pos     NUMERIC,
        our_price    NUMERIC,
        leader_code  TEXT,
        leader_price NUMERIC,
        over_code    TEXT,
        over_price   NUMERIC,
        under_code   TEXT,
        under_price  NUMERIC,
        updated_at   TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (part_number, brand_name)
    )
"#;

const CREATE_PART_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_prices_part ON prices(part_number)";

const UPSERT_PRICE: &str = r#"
    INSERT INTO prices
        (part_number, brand_name, rank_pos, our_price,
         leader_code, leader_price, over_code, over_price, under_code, under_price, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
    ON CONFLICT(part_number, brand_name) DO UPDATE SET
        rank_pos     = excluded.rank_pos,
        our_price    = excluded.our_price,
        leader_code  = excluded.leader_code,
        leader_price = excluded.leader_price,
        over_code    = excluded.over_code,
        over_price   = excluded.over_price,
        under_code   = excluded.under_code,
        under_price  = excluded.under_price,
        updated_at   = excluded.updated_at
"#;

const SELECT_COLUMNS: &str = "part_number, brand_name, rank_pos, our_price, leader_code, \
     leader_price, over_code, over_price, under_code, under_price";

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

pub struct SqlitePriceStore {
    pool: SqlitePool,
}

impl SqlitePriceStore {
    /// Open (creating if needed) the database file at `path` and migrate it.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        Self::connect_with(options).await
    }

    /// Connect using a sqlx url such as `sqlite://data/prices.db` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(db_err)?
            .create_if_missing(true);
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_PRICES)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        sqlx::query(CREATE_PART_INDEX)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        info!("prices table ready");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn bind_field<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    cell: &Option<Field>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match cell {
        Some(Field::Number(n)) => query.bind(*n),
        Some(Field::Text(s)) => query.bind(s.clone()),
        None => query.bind(Option::<f64>::None),
    }
}

/// NUMERIC cells come back as integer, real or text depending on what was stored.
fn read_field(row: &SqliteRow, column: &str) -> Result<Option<Field>, StoreError> {
    if let Ok(v) = row.try_get::<Option<i64>, _>(column) {
        return Ok(v.map(|n| Field::Number(n as f64)));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(column) {
        return Ok(v.map(Field::Number));
    }
    let text: Option<String> = row.try_get(column).map_err(db_err)?;
    Ok(text.map(Field::Text))
}

fn read_row(row: &SqliteRow) -> Result<RankedRow, StoreError> {
    Ok(RankedRow {
        part_number: row.try_get("part_number").map_err(db_err)?,
        brand_name: row.try_get("brand_name").map_err(db_err)?,
        rank_pos: read_field(row, "rank_pos")?,
        our_price: read_field(row, "our_price")?,
        leader_code: row.try_get("leader_code").map_err(db_err)?,
        leader_price: read_field(row, "leader_price")?,
        over_code: row.try_get("over_code").map_err(db_err)?,
        over_price: read_field(row, "over_price")?,
        under_code: row.try_get("under_code").map_err(db_err)?,
        under_price: read_field(row, "under_price")?,
    })
}

#[async_trait]
impl PriceStore for SqlitePriceStore {
    async fn exists(&self, part_number: &str, brand_name: &str) -> Result<bool, StoreError> {
        let found = sqlx::query("SELECT 1 FROM prices WHERE part_number = ? AND brand_name = ? LIMIT 1")
            .bind(part_number)
            .bind(brand_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    async fn upsert_batch(&self, rows: &[RankedRow]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            let mut query = sqlx::query(UPSERT_PRICE)
                .bind(row.part_number.clone())
                .bind(row.brand_name.clone());
            query = bind_field(query, &row.rank_pos);
            query = bind_field(query, &row.our_price);
            query = query.bind(row.leader_code.clone());
            query = bind_field(query, &row.leader_price);
            query = query.bind(row.over_code.clone());
            query = bind_field(query, &row.over_price);
            query = query.bind(row.under_code.clone());
            query = bind_field(query, &row.under_price);
            query.execute(&mut *tx).await.map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        debug!(rows = rows.len(), "price batch committed");
        Ok(rows.len())
    }

    async fn find_by_part(&self, part_number: &str) -> Result<Vec<RankedRow>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM prices WHERE part_number = ? ORDER BY brand_name"
        );
        let rows = sqlx::query(&sql)
            .bind(part_number)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(read_row).collect()
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM prices")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let n: i64 = row.try_get("n").map_err(db_err)?;
        Ok(n.max(0) as u64)
    }
}
