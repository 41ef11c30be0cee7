use alloy::primitives::U256;
use anyhow::Context;
use chrono::{DateTime, Utc};
use deadpool_postgres::Transaction as PgTransaction;
use log::{debug, error};
use tokio_postgres::{types::ToSql, Row};

use crate::{
    db::{
        models::{
            Pair, PairVolumeSnapshot, SyncCheckpoint, Token, TokenPriceSnapshot, Transaction,
            VolumeInterval,
        },
        postgres::PostgresClient,
        store::{Store, WriteBatch},
    },
    utils::parse_u256,
};

/// Rows per multi-row INSERT. Widest table has 17 columns, which keeps every
/// statement well under the 65535 bind parameter limit.
const BATCH_SIZE: usize = 500;

/// Raw integers travel as text and are cast server-side.
const NUMERIC: &str = "::text::numeric";

type Param<'a> = &'a (dyn ToSql + Sync);

/// Sanitize a string for PostgreSQL by removing null bytes (0x00)
/// which are invalid in UTF-8 text columns
fn sanitize_string(s: &str) -> String {
    s.replace('\0', "")
}

/// Build `($1, $2::text::numeric, ...), (...)` placeholders for `rows` rows,
/// one cast suffix per column.
fn values_clause(rows: usize, casts: &[&str]) -> String {
    (0..rows)
        .map(|i| {
            let start = i * casts.len() + 1;
            let placeholders: Vec<String> = casts
                .iter()
                .enumerate()
                .map(|(j, cast)| format!("${}{}", start + j, cast))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn numeric(value: U256) -> String {
    value.to_string()
}

fn opt_numeric(value: Option<U256>) -> Option<String> {
    value.map(numeric)
}

fn parse_opt_u256(value: Option<String>) -> anyhow::Result<Option<U256>> {
    value.as_deref().map(parse_u256).transpose()
}

impl Store for PostgresClient {
    async fn load_pairs(&self) -> anyhow::Result<Vec<Pair>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT
                address, token0, token1, token0_symbol, token1_symbol,
                reserve0::text AS reserve0, reserve1::text AS reserve1,
                total_supply::text AS total_supply,
                volume_1h, volume_24h, volume_7d, volume_30d, volume_1y,
                tvl_usd, created_at, updated_at, block_number
            FROM pairflow.pairs
        "#;

        let rows = client.query(query, &[]).await?;
        rows.iter().map(row_to_pair).collect()
    }

    async fn get_tokens(&self, addresses: &[String]) -> anyhow::Result<Vec<Token>> {
        if addresses.is_empty() {
            return Ok(vec![]);
        }

        let client = self.pool.get().await?;
        let query = r#"
            SELECT
                address, symbol, name, decimals, total_supply::text AS total_supply,
                created_at, updated_at
            FROM pairflow.tokens
            WHERE address = ANY($1)
        "#;

        let rows = client.query(query, &[&addresses]).await?;
        rows.iter().map(row_to_token).collect()
    }

    async fn get_price_snapshot_at_or_before(
        &self,
        token: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<TokenPriceSnapshot>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT
                id, token_address, price_usd, fdv_usd, price_change_1h, price_change_24h,
                timestamp, block_number
            FROM pairflow.token_price_snapshots
            WHERE token_address = $1 AND timestamp <= $2
            ORDER BY timestamp DESC, block_number DESC
            LIMIT 1
        "#;

        let row = client.query_opt(query, &[&token, &at]).await?;
        Ok(row.as_ref().map(row_to_price_snapshot))
    }

    async fn get_latest_volume_snapshot(
        &self,
        pair: &str,
        interval: VolumeInterval,
    ) -> anyhow::Result<Option<PairVolumeSnapshot>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT
                id, pair_address, interval, timestamp, volume_usd, tx_count,
                created_at, updated_at
            FROM pairflow.pair_volume_snapshots
            WHERE pair_address = $1 AND interval = $2
            ORDER BY timestamp DESC
            LIMIT 1
        "#;

        let row = client
            .query_opt(query, &[&pair, &interval.as_str()])
            .await?;
        row.as_ref().map(row_to_volume_snapshot).transpose()
    }

    async fn get_volume_snapshot(&self, id: &str) -> anyhow::Result<Option<PairVolumeSnapshot>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT
                id, pair_address, interval, timestamp, volume_usd, tx_count,
                created_at, updated_at
            FROM pairflow.pair_volume_snapshots
            WHERE id = $1
        "#;

        let row = client.query_opt(query, &[&id]).await?;
        row.as_ref().map(row_to_volume_snapshot).transpose()
    }

    async fn get_volume_snapshots_since(
        &self,
        pair: &str,
        interval: VolumeInterval,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<PairVolumeSnapshot>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT
                id, pair_address, interval, timestamp, volume_usd, tx_count,
                created_at, updated_at
            FROM pairflow.pair_volume_snapshots
            WHERE pair_address = $1 AND interval = $2 AND timestamp >= $3
            ORDER BY timestamp
        "#;

        let rows = client
            .query(query, &[&pair, &interval.as_str(), &since])
            .await?;
        rows.iter().map(row_to_volume_snapshot).collect()
    }

    async fn get_existing_transaction_ids(&self, ids: &[String]) -> anyhow::Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id FROM pairflow.transactions WHERE id = ANY($1)",
                &[&ids],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn get_sync_checkpoint(&self, factory: &str) -> anyhow::Result<Option<SyncCheckpoint>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT factory_address, next_block, updated_at
            FROM pairflow.sync_checkpoints
            WHERE factory_address = $1
        "#;

        let row = client.query_opt(query, &[&factory]).await?;
        Ok(row.map(|row| {
            let next_block: i64 = row.get("next_block");
            SyncCheckpoint {
                factory_address: row.get("factory_address"),
                next_block: next_block as u64,
                updated_at: row.get("updated_at"),
            }
        }))
    }

    /// Apply the whole batch in one SQL transaction. Any failure rolls back
    /// every row, the checkpoint included.
    async fn save(&self, batch: &WriteBatch) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut client = self.pool.get().await?;
        let tx = client
            .transaction()
            .await
            .context("Failed to open write transaction")?;

        insert_tokens(&tx, &batch.tokens).await?;
        insert_pairs(&tx, &batch.pairs).await?;
        insert_transactions(&tx, &batch.transactions).await?;
        insert_volume_snapshots(&tx, &batch.volume_snapshots).await?;
        insert_price_snapshots(&tx, &batch.price_snapshots).await?;
        if let Some(checkpoint) = &batch.checkpoint {
            upsert_checkpoint(&tx, checkpoint).await?;
        }

        tx.commit().await.context("Failed to commit write batch")?;

        debug!(
            "Committed {} rows (checkpoint {:?})",
            batch.len(),
            batch.checkpoint.as_ref().map(|c| c.next_block)
        );
        Ok(())
    }
}

// ==================== WRITES ====================

async fn insert_tokens(tx: &PgTransaction<'_>, tokens: &[Token]) -> anyhow::Result<()> {
    const CASTS: [&str; 7] = ["", "", "", "", NUMERIC, "", ""];

    for chunk in tokens.chunks(BATCH_SIZE) {
        let query = format!(
            r#"
            INSERT INTO pairflow.tokens (
                address, symbol, name, decimals, total_supply, created_at, updated_at
            ) VALUES {}
            ON CONFLICT (address) DO UPDATE SET
                symbol = EXCLUDED.symbol,
                name = EXCLUDED.name,
                decimals = EXCLUDED.decimals,
                total_supply = EXCLUDED.total_supply,
                updated_at = EXCLUDED.updated_at
            "#,
            values_clause(chunk.len(), &CASTS)
        );

        // Owned conversions, borrowed by params below
        let owned: Vec<(String, Option<String>, i16, Option<String>)> = chunk
            .iter()
            .map(|t| {
                (
                    sanitize_string(&t.symbol),
                    t.name.as_deref().map(sanitize_string),
                    t.decimals as i16,
                    opt_numeric(t.total_supply),
                )
            })
            .collect();

        let mut params: Vec<Param> = Vec::with_capacity(chunk.len() * CASTS.len());
        for (token, (symbol, name, decimals, supply)) in chunk.iter().zip(&owned) {
            params.push(&token.address);
            params.push(symbol);
            params.push(name);
            params.push(decimals);
            params.push(supply);
            params.push(&token.created_at);
            params.push(&token.updated_at);
        }

        tx.execute(&query, &params).await.map_err(|e| {
            error!("Failed to batch insert {} tokens: {:?}", chunk.len(), e);
            e
        })?;
    }

    Ok(())
}

struct PairRow {
    token0_symbol: String,
    token1_symbol: String,
    reserve0: String,
    reserve1: String,
    total_supply: String,
    block_number: i64,
}

async fn insert_pairs(tx: &PgTransaction<'_>, pairs: &[Pair]) -> anyhow::Result<()> {
    const CASTS: [&str; 17] = [
        "", "", "", "", "", NUMERIC, NUMERIC, NUMERIC, "", "", "", "", "", "", "", "", "",
    ];

    for chunk in pairs.chunks(BATCH_SIZE) {
        let query = format!(
            r#"
            INSERT INTO pairflow.pairs (
                address, token0, token1, token0_symbol, token1_symbol,
                reserve0, reserve1, total_supply,
                volume_1h, volume_24h, volume_7d, volume_30d, volume_1y,
                tvl_usd, created_at, updated_at, block_number
            ) VALUES {}
            ON CONFLICT (address) DO UPDATE SET
                -- Identity (token0, token1, created_at) is immutable
                token0_symbol = EXCLUDED.token0_symbol,
                token1_symbol = EXCLUDED.token1_symbol,
                reserve0 = EXCLUDED.reserve0,
                reserve1 = EXCLUDED.reserve1,
                total_supply = EXCLUDED.total_supply,
                volume_1h = EXCLUDED.volume_1h,
                volume_24h = EXCLUDED.volume_24h,
                volume_7d = EXCLUDED.volume_7d,
                volume_30d = EXCLUDED.volume_30d,
                volume_1y = EXCLUDED.volume_1y,
                tvl_usd = EXCLUDED.tvl_usd,
                updated_at = EXCLUDED.updated_at,
                block_number = EXCLUDED.block_number
            "#,
            values_clause(chunk.len(), &CASTS)
        );

        let rows: Vec<PairRow> = chunk
            .iter()
            .map(|p| PairRow {
                token0_symbol: sanitize_string(&p.token0_symbol),
                token1_symbol: sanitize_string(&p.token1_symbol),
                reserve0: numeric(p.reserve0),
                reserve1: numeric(p.reserve1),
                total_supply: numeric(p.total_supply),
                block_number: p.block_number as i64,
            })
            .collect();

        let mut params: Vec<Param> = Vec::with_capacity(chunk.len() * CASTS.len());
        for (pair, row) in chunk.iter().zip(&rows) {
            params.push(&pair.address);
            params.push(&pair.token0);
            params.push(&pair.token1);
            params.push(&row.token0_symbol);
            params.push(&row.token1_symbol);
            params.push(&row.reserve0);
            params.push(&row.reserve1);
            params.push(&row.total_supply);
            params.push(&pair.volume_1h);
            params.push(&pair.volume_24h);
            params.push(&pair.volume_7d);
            params.push(&pair.volume_30d);
            params.push(&pair.volume_1y);
            params.push(&pair.tvl_usd);
            params.push(&pair.created_at);
            params.push(&pair.updated_at);
            params.push(&row.block_number);
        }

        tx.execute(&query, &params).await.map_err(|e| {
            error!("Failed to batch insert {} pairs: {:?}", chunk.len(), e);
            e
        })?;
    }

    Ok(())
}

struct TransactionRow {
    block_number: i64,
    amount_a: Option<String>,
    amount_b: Option<String>,
    liquidity: Option<String>,
    amount_in: Option<String>,
    amount_out: Option<String>,
}

async fn insert_transactions(
    tx: &PgTransaction<'_>,
    transactions: &[Transaction],
) -> anyhow::Result<()> {
    const CASTS: [&str; 17] = [
        "", "", "", "", "", "", NUMERIC, NUMERIC, NUMERIC, NUMERIC, NUMERIC, "", "", "", "", "",
        "",
    ];

    for chunk in transactions.chunks(BATCH_SIZE) {
        // Transactions are immutable: a replayed id keeps its first write
        let query = format!(
            r#"
            INSERT INTO pairflow.transactions (
                id, pair_address, tx_type, user_address, block_number, timestamp,
                amount_a, amount_b, liquidity, amount_in, amount_out,
                token_in, token_out,
                amount_a_usd, amount_b_usd, amount_in_usd, amount_out_usd
            ) VALUES {}
            ON CONFLICT (id) DO NOTHING
            "#,
            values_clause(chunk.len(), &CASTS)
        );

        let rows: Vec<TransactionRow> = chunk
            .iter()
            .map(|t| TransactionRow {
                block_number: t.block_number as i64,
                amount_a: opt_numeric(t.amount_a),
                amount_b: opt_numeric(t.amount_b),
                liquidity: opt_numeric(t.liquidity),
                amount_in: opt_numeric(t.amount_in),
                amount_out: opt_numeric(t.amount_out),
            })
            .collect();
        let tx_types: Vec<&'static str> = chunk.iter().map(|t| t.tx_type.as_str()).collect();

        let mut params: Vec<Param> = Vec::with_capacity(chunk.len() * CASTS.len());
        for ((t, row), tx_type) in chunk.iter().zip(&rows).zip(&tx_types) {
            params.push(&t.id);
            params.push(&t.pair_address);
            params.push(tx_type);
            params.push(&t.user);
            params.push(&row.block_number);
            params.push(&t.timestamp);
            params.push(&row.amount_a);
            params.push(&row.amount_b);
            params.push(&row.liquidity);
            params.push(&row.amount_in);
            params.push(&row.amount_out);
            params.push(&t.token_in);
            params.push(&t.token_out);
            params.push(&t.amount_a_usd);
            params.push(&t.amount_b_usd);
            params.push(&t.amount_in_usd);
            params.push(&t.amount_out_usd);
        }

        tx.execute(&query, &params).await.map_err(|e| {
            error!("Failed to batch insert {} transactions: {:?}", chunk.len(), e);
            e
        })?;
    }

    Ok(())
}

async fn insert_volume_snapshots(
    tx: &PgTransaction<'_>,
    snapshots: &[PairVolumeSnapshot],
) -> anyhow::Result<()> {
    const CASTS: [&str; 8] = [""; 8];

    for chunk in snapshots.chunks(BATCH_SIZE) {
        let query = format!(
            r#"
            INSERT INTO pairflow.pair_volume_snapshots (
                id, pair_address, interval, timestamp, volume_usd, tx_count,
                created_at, updated_at
            ) VALUES {}
            ON CONFLICT (id) DO UPDATE SET
                volume_usd = EXCLUDED.volume_usd,
                tx_count = EXCLUDED.tx_count,
                updated_at = EXCLUDED.updated_at
            "#,
            values_clause(chunk.len(), &CASTS)
        );

        let intervals: Vec<&'static str> = chunk.iter().map(|s| s.interval.as_str()).collect();

        let mut params: Vec<Param> = Vec::with_capacity(chunk.len() * CASTS.len());
        for (s, interval) in chunk.iter().zip(&intervals) {
            params.push(&s.id);
            params.push(&s.pair_address);
            params.push(interval);
            params.push(&s.timestamp);
            params.push(&s.volume_usd);
            params.push(&s.tx_count);
            params.push(&s.created_at);
            params.push(&s.updated_at);
        }

        tx.execute(&query, &params).await.map_err(|e| {
            error!("Failed to batch insert {} volume snapshots: {:?}", chunk.len(), e);
            e
        })?;
    }

    Ok(())
}

async fn insert_price_snapshots(
    tx: &PgTransaction<'_>,
    snapshots: &[TokenPriceSnapshot],
) -> anyhow::Result<()> {
    const CASTS: [&str; 8] = [""; 8];

    for chunk in snapshots.chunks(BATCH_SIZE) {
        // Snapshots are immutable once written
        let query = format!(
            r#"
            INSERT INTO pairflow.token_price_snapshots (
                id, token_address, price_usd, fdv_usd, price_change_1h, price_change_24h,
                timestamp, block_number
            ) VALUES {}
            ON CONFLICT (id) DO NOTHING
            "#,
            values_clause(chunk.len(), &CASTS)
        );

        let blocks: Vec<i64> = chunk.iter().map(|s| s.block_number as i64).collect();

        let mut params: Vec<Param> = Vec::with_capacity(chunk.len() * CASTS.len());
        for (s, block_number) in chunk.iter().zip(&blocks) {
            params.push(&s.id);
            params.push(&s.token_address);
            params.push(&s.price_usd);
            params.push(&s.fdv_usd);
            params.push(&s.price_change_1h);
            params.push(&s.price_change_24h);
            params.push(&s.timestamp);
            params.push(block_number);
        }

        tx.execute(&query, &params).await.map_err(|e| {
            error!("Failed to batch insert {} price snapshots: {:?}", chunk.len(), e);
            e
        })?;
    }

    Ok(())
}

async fn upsert_checkpoint(
    tx: &PgTransaction<'_>,
    checkpoint: &SyncCheckpoint,
) -> anyhow::Result<()> {
    let query = r#"
        INSERT INTO pairflow.sync_checkpoints (factory_address, next_block, updated_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (factory_address) DO UPDATE SET
            next_block = EXCLUDED.next_block,
            updated_at = EXCLUDED.updated_at
    "#;

    let next_block = checkpoint.next_block as i64;
    tx.execute(
        query,
        &[
            &checkpoint.factory_address,
            &next_block,
            &checkpoint.updated_at,
        ],
    )
    .await
    .context("Failed to update sync checkpoint")?;

    Ok(())
}

// ==================== ROW MAPPING ====================

fn row_to_pair(row: &Row) -> anyhow::Result<Pair> {
    // Lowercase addresses for consistent comparisons
    let address: String = row.get("address");
    let token0: String = row.get("token0");
    let token1: String = row.get("token1");
    let reserve0: String = row.get("reserve0");
    let reserve1: String = row.get("reserve1");
    let total_supply: String = row.get("total_supply");
    let block_number: i64 = row.get("block_number");

    Ok(Pair {
        address: address.to_lowercase(),
        token0: token0.to_lowercase(),
        token1: token1.to_lowercase(),
        token0_symbol: row.get("token0_symbol"),
        token1_symbol: row.get("token1_symbol"),
        reserve0: parse_u256(&reserve0)?,
        reserve1: parse_u256(&reserve1)?,
        total_supply: parse_u256(&total_supply)?,
        volume_1h: row.get("volume_1h"),
        volume_24h: row.get("volume_24h"),
        volume_7d: row.get("volume_7d"),
        volume_30d: row.get("volume_30d"),
        volume_1y: row.get("volume_1y"),
        tvl_usd: row.get("tvl_usd"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        block_number: block_number as u64,
    })
}

fn row_to_token(row: &Row) -> anyhow::Result<Token> {
    let address: String = row.get("address");
    let decimals: i16 = row.get("decimals");

    Ok(Token {
        address: address.to_lowercase(),
        symbol: row.get("symbol"),
        name: row.get("name"),
        decimals: u8::try_from(decimals)
            .with_context(|| format!("token {} has invalid decimals {}", address, decimals))?,
        total_supply: parse_opt_u256(row.get("total_supply"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_price_snapshot(row: &Row) -> TokenPriceSnapshot {
    let block_number: i64 = row.get("block_number");
    TokenPriceSnapshot {
        id: row.get("id"),
        token_address: row.get("token_address"),
        price_usd: row.get("price_usd"),
        fdv_usd: row.get("fdv_usd"),
        price_change_1h: row.get("price_change_1h"),
        price_change_24h: row.get("price_change_24h"),
        timestamp: row.get("timestamp"),
        block_number: block_number as u64,
    }
}

fn row_to_volume_snapshot(row: &Row) -> anyhow::Result<PairVolumeSnapshot> {
    let interval: String = row.get("interval");
    Ok(PairVolumeSnapshot {
        id: row.get("id"),
        pair_address: row.get("pair_address"),
        interval: VolumeInterval::parse(&interval)
            .with_context(|| format!("unknown volume interval {}", interval))?,
        timestamp: row.get("timestamp"),
        volume_usd: row.get("volume_usd"),
        tx_count: row.get("tx_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_clause_numbers_placeholders_per_row() {
        assert_eq!(
            values_clause(2, &["", NUMERIC, ""]),
            "($1, $2::text::numeric, $3), ($4, $5::text::numeric, $6)"
        );
        assert_eq!(values_clause(0, &[""]), "");
    }

    #[test]
    fn test_numeric_text_roundtrip_is_exact() {
        let max = U256::MAX;
        assert_eq!(parse_u256(&numeric(max)).unwrap(), max);
        assert_eq!(parse_opt_u256(None).unwrap(), None);
        assert_eq!(
            parse_opt_u256(opt_numeric(Some(U256::from(42u64)))).unwrap(),
            Some(U256::from(42u64))
        );
    }

    #[test]
    fn test_sanitize_string_strips_nul() {
        assert_eq!(sanitize_string("US\0DC"), "USDC");
    }
}
