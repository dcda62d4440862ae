//! PostgreSQL transaction store

use super::TxStore;
use crate::config::DatabaseConfig;
use crate::error::{TxmError, TxmResult};
use crate::txm::gas::GasPrice;
use crate::txm::models::{
    ensure_state, Attempt, AttemptState, NewTransaction, NonceSyncOutcome, PendingBroadcast,
    Receipt, StateCounts, TrackedTransaction, Transaction, TxState,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Transaction store persisted in PostgreSQL
pub struct PgTxStore {
    pool: PgPool,
}

impl PgTxStore {
    pub async fn new(config: &DatabaseConfig) -> TxmResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables and indexes if they do not exist
    pub async fn run_migrations(&self) -> TxmResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS txm_transactions (
                id UUID PRIMARY KEY,
                seq BIGSERIAL,
                idempotency_key TEXT UNIQUE,
                from_address BYTEA NOT NULL,
                to_address BYTEA NOT NULL,
                value TEXT NOT NULL,
                data BYTEA NOT NULL,
                gas_limit BIGINT NOT NULL,
                payload_hash BYTEA NOT NULL,
                nonce BIGINT,
                state VARCHAR(20) NOT NULL,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            // one live transaction per (sender, nonce)
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_txm_transactions_sender_nonce
            ON txm_transactions (from_address, nonce)
            WHERE nonce IS NOT NULL AND state IN ('in_flight', 'confirmed', 'finalized')
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_txm_transactions_unstarted
            ON txm_transactions (from_address, seq)
            WHERE state = 'unstarted'
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS txm_attempts (
                id UUID PRIMARY KEY,
                seq BIGSERIAL,
                tx_id UUID NOT NULL REFERENCES txm_transactions (id),
                nonce BIGINT NOT NULL,
                gas_price JSONB NOT NULL,
                gas_limit BIGINT NOT NULL,
                hash BYTEA NOT NULL,
                signed_raw BYTEA NOT NULL,
                state VARCHAR(20) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                broadcast_at TIMESTAMPTZ
            )
            "#,
            // at most one current attempt per transaction
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_txm_attempts_current
            ON txm_attempts (tx_id)
            WHERE state IN ('in_flight', 'confirmed')
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS txm_receipts (
                attempt_id UUID PRIMARY KEY REFERENCES txm_attempts (id),
                tx_id UUID NOT NULL REFERENCES txm_transactions (id),
                tx_hash BYTEA NOT NULL,
                block_number BIGINT NOT NULL,
                block_hash BYTEA NOT NULL,
                success BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS txm_nonce_cursors (
                from_address BYTEA PRIMARY KEY,
                next_nonce BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("Database migrations complete");
        Ok(())
    }

    async fn lock_transaction(
        dbtx: &mut sqlx::Transaction<'_, Postgres>,
        id: Uuid,
    ) -> TxmResult<Transaction> {
        let row = sqlx::query("SELECT * FROM txm_transactions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **dbtx)
            .await?
            .ok_or(TxmError::TransactionNotFound { tx_id: id })?;
        tx_from_row(&row)
    }

    async fn insert_attempt(
        dbtx: &mut sqlx::Transaction<'_, Postgres>,
        tx_id: Uuid,
        attempt: &Attempt,
    ) -> TxmResult<()> {
        sqlx::query(
            r#"
            INSERT INTO txm_attempts
                (id, tx_id, nonce, gas_price, gas_limit, hash, signed_raw, state, created_at, broadcast_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'in_flight', $8, $9)
            "#,
        )
        .bind(attempt.id)
        .bind(tx_id)
        .bind(attempt.nonce as i64)
        .bind(Json(attempt.gas_price))
        .bind(attempt.gas_limit as i64)
        .bind(attempt.hash.as_bytes())
        .bind(attempt.signed_raw.to_vec())
        .bind(attempt.created_at)
        .bind(attempt.broadcast_at)
        .execute(&mut **dbtx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TxStore for PgTxStore {
    async fn create_transaction(&self, new: &NewTransaction) -> TxmResult<(Transaction, bool)> {
        let tx = Transaction::from_new(new, Utc::now());

        let inserted = sqlx::query(
            r#"
            INSERT INTO txm_transactions
                (id, idempotency_key, from_address, to_address, value, data, gas_limit,
                 payload_hash, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'unstarted', $9, $9)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(tx.id)
        .bind(&tx.idempotency_key)
        .bind(tx.from.as_bytes())
        .bind(tx.to.as_bytes())
        .bind(tx.value.to_string())
        .bind(tx.data.to_vec())
        .bind(tx.gas_limit as i64)
        .bind(&tx.payload_hash[..])
        .bind(tx.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            debug!("Stored transaction {}", tx.id);
            return Ok((tx, true));
        }

        // only an idempotency key can conflict
        let key = tx.idempotency_key.clone().unwrap_or_default();
        let row = sqlx::query("SELECT * FROM txm_transactions WHERE idempotency_key = $1")
            .bind(&key)
            .fetch_one(&self.pool)
            .await?;
        let existing = tx_from_row(&row)?;

        if existing.payload_hash == tx.payload_hash {
            Ok((existing, false))
        } else {
            Err(TxmError::IdempotencyConflict {
                key,
                existing: existing.id,
            })
        }
    }

    async fn transaction(&self, id: Uuid) -> TxmResult<Option<Transaction>> {
        let row = sqlx::query("SELECT * FROM txm_transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(tx_from_row).transpose()
    }

    async fn next_unstarted(&self, from: Address) -> TxmResult<Option<Transaction>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM txm_transactions
            WHERE from_address = $1 AND state = 'unstarted'
            ORDER BY seq
            LIMIT 1
            "#,
        )
        .bind(from.as_bytes())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(tx_from_row).transpose()
    }

    async fn nonce_cursor(&self, from: Address) -> TxmResult<Option<u64>> {
        let row = sqlx::query("SELECT next_nonce FROM txm_nonce_cursors WHERE from_address = $1")
            .bind(from.as_bytes())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("next_nonce") as u64))
    }

    async fn seed_nonce_cursor(&self, from: Address, nonce: u64) -> TxmResult<u64> {
        sqlx::query(
            r#"
            INSERT INTO txm_nonce_cursors (from_address, next_nonce)
            VALUES ($1, $2)
            ON CONFLICT (from_address) DO NOTHING
            "#,
        )
        .bind(from.as_bytes())
        .bind(nonce as i64)
        .execute(&self.pool)
        .await?;

        self.nonce_cursor(from)
            .await?
            .ok_or_else(|| TxmError::NonceCursorMissing {
                address: format!("{:?}", from),
            })
    }

    async fn sync_nonce_cursor(
        &self,
        from: Address,
        chain_nonce: u64,
    ) -> TxmResult<NonceSyncOutcome> {
        let mut dbtx = self.pool.begin().await?;

        let previous = sqlx::query(
            "SELECT next_nonce FROM txm_nonce_cursors WHERE from_address = $1 FOR UPDATE",
        )
        .bind(from.as_bytes())
        .fetch_optional(&mut *dbtx)
        .await?
        .map(|r| r.get::<i64, _>("next_nonce") as u64);

        let cursor = match previous {
            Some(cursor) if chain_nonce <= cursor => {
                dbtx.commit().await?;
                return Ok(NonceSyncOutcome {
                    previous,
                    current: cursor,
                    lost: Vec::new(),
                });
            }
            Some(cursor) => cursor,
            None => chain_nonce,
        };

        let lost: Vec<Uuid> = sqlx::query(
            r#"
            UPDATE txm_transactions
            SET state = 'fatal_error',
                error = 'nonce ' || nonce || ' consumed outside this node',
                updated_at = NOW()
            WHERE from_address = $1 AND state = 'in_flight' AND nonce >= $2 AND nonce < $3
            RETURNING id
            "#,
        )
        .bind(from.as_bytes())
        .bind(cursor as i64)
        .bind(chain_nonce as i64)
        .fetch_all(&mut *dbtx)
        .await?
        .iter()
        .map(|r| r.get::<Uuid, _>("id"))
        .collect();

        if !lost.is_empty() {
            sqlx::query(
                r#"
                UPDATE txm_attempts SET state = 'errored'
                WHERE tx_id = ANY($1) AND state IN ('in_flight', 'confirmed')
                "#,
            )
            .bind(&lost)
            .execute(&mut *dbtx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO txm_nonce_cursors (from_address, next_nonce, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (from_address)
            DO UPDATE SET next_nonce = GREATEST(txm_nonce_cursors.next_nonce, $2), updated_at = NOW()
            "#,
        )
        .bind(from.as_bytes())
        .bind(chain_nonce as i64)
        .execute(&mut *dbtx)
        .await?;

        dbtx.commit().await?;
        Ok(NonceSyncOutcome {
            previous,
            current: chain_nonce,
            lost,
        })
    }

    async fn commit_first_attempt(&self, tx_id: Uuid, attempt: &Attempt) -> TxmResult<()> {
        let mut dbtx = self.pool.begin().await?;

        let tx = Self::lock_transaction(&mut dbtx, tx_id).await?;
        ensure_state(&tx, &[TxState::Unstarted], TxState::InFlight)?;

        let cursor = sqlx::query(
            "SELECT next_nonce FROM txm_nonce_cursors WHERE from_address = $1 FOR UPDATE",
        )
        .bind(tx.from.as_bytes())
        .fetch_optional(&mut *dbtx)
        .await?
        .map(|r| r.get::<i64, _>("next_nonce") as u64);

        if cursor != Some(attempt.nonce) {
            return Err(TxmError::NonceConflict {
                address: format!("{:?}", tx.from),
                expected: attempt.nonce,
                found: cursor,
            });
        }

        sqlx::query(
            r#"
            UPDATE txm_transactions
            SET nonce = $2, state = 'in_flight', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(tx_id)
        .bind(attempt.nonce as i64)
        .execute(&mut *dbtx)
        .await?;

        Self::insert_attempt(&mut dbtx, tx_id, attempt).await?;

        sqlx::query(
            r#"
            UPDATE txm_nonce_cursors SET next_nonce = $2, updated_at = NOW()
            WHERE from_address = $1
            "#,
        )
        .bind(tx.from.as_bytes())
        .bind((attempt.nonce + 1) as i64)
        .execute(&mut *dbtx)
        .await?;

        dbtx.commit().await?;
        Ok(())
    }

    async fn mark_broadcast(&self, attempt_id: Uuid, at: DateTime<Utc>) -> TxmResult<()> {
        let result = sqlx::query(
            "UPDATE txm_attempts SET broadcast_at = COALESCE(broadcast_at, $2) WHERE id = $1",
        )
        .bind(attempt_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TxmError::Store(format!("attempt {} not found", attempt_id)));
        }
        Ok(())
    }

    async fn unbroadcast_in_flight(
        &self,
        from: Address,
    ) -> TxmResult<Vec<PendingBroadcast>> {
        let attempts = sqlx::query(
            r#"
            SELECT a.*,
                   EXISTS (
                       SELECT 1 FROM txm_attempts p WHERE p.tx_id = a.tx_id AND p.id <> a.id
                   ) AS replacement
            FROM txm_attempts a
            JOIN txm_transactions t ON t.id = a.tx_id
            WHERE t.from_address = $1 AND t.state = 'in_flight'
              AND a.state = 'in_flight' AND a.broadcast_at IS NULL
            ORDER BY t.nonce
            "#,
        )
        .bind(from.as_bytes())
        .fetch_all(&self.pool)
        .await?;

        let mut pending = Vec::with_capacity(attempts.len());
        for row in &attempts {
            let attempt = attempt_from_row(row)?;
            let tx = self
                .transaction(attempt.tx_id)
                .await?
                .ok_or(TxmError::TransactionNotFound {
                    tx_id: attempt.tx_id,
                })?;
            pending.push(PendingBroadcast {
                tx,
                attempt,
                replacement: row.try_get("replacement")?,
            });
        }
        Ok(pending)
    }

    async fn mark_fatal(&self, tx_id: Uuid, reason: &str, release_nonce: bool) -> TxmResult<()> {
        let mut dbtx = self.pool.begin().await?;

        let tx = Self::lock_transaction(&mut dbtx, tx_id).await?;
        ensure_state(&tx, &[TxState::Unstarted, TxState::InFlight], TxState::FatalError)?;

        let mut clear_nonce = false;
        if let (true, TxState::InFlight, Some(n)) = (release_nonce, tx.state, tx.nonce) {
            let rolled_back = sqlx::query(
                r#"
                UPDATE txm_nonce_cursors SET next_nonce = $2, updated_at = NOW()
                WHERE from_address = $1 AND next_nonce = $3
                "#,
            )
            .bind(tx.from.as_bytes())
            .bind(n as i64)
            .bind((n + 1) as i64)
            .execute(&mut *dbtx)
            .await?;

            clear_nonce = rolled_back.rows_affected() == 1;
            if !clear_nonce {
                warn!("Nonce {} of {} is not the latest; keeping it assigned", n, tx_id);
            }
        }

        sqlx::query(
            r#"
            UPDATE txm_transactions
            SET state = 'fatal_error',
                error = $2,
                nonce = CASE WHEN $3 THEN NULL ELSE nonce END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(tx_id)
        .bind(reason)
        .bind(clear_nonce)
        .execute(&mut *dbtx)
        .await?;

        sqlx::query(
            "UPDATE txm_attempts SET state = 'errored' WHERE tx_id = $1 AND state <> 'replaced'",
        )
        .bind(tx_id)
        .execute(&mut *dbtx)
        .await?;

        dbtx.commit().await?;
        Ok(())
    }

    async fn tracked_transactions(&self, from: Address) -> TxmResult<Vec<TrackedTransaction>> {
        let tx_rows = sqlx::query(
            r#"
            SELECT * FROM txm_transactions
            WHERE from_address = $1 AND state IN ('in_flight', 'confirmed')
            ORDER BY nonce
            "#,
        )
        .bind(from.as_bytes())
        .fetch_all(&self.pool)
        .await?;

        let txs = tx_rows.iter().map(tx_from_row).collect::<TxmResult<Vec<_>>>()?;
        if txs.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = txs.iter().map(|tx| tx.id).collect();

        let mut attempts: HashMap<Uuid, Vec<Attempt>> = HashMap::new();
        let attempt_rows = sqlx::query("SELECT * FROM txm_attempts WHERE tx_id = ANY($1) ORDER BY seq")
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?;
        for row in &attempt_rows {
            let attempt = attempt_from_row(row)?;
            attempts.entry(attempt.tx_id).or_default().push(attempt);
        }

        let mut receipts: HashMap<Uuid, Receipt> = HashMap::new();
        let receipt_rows = sqlx::query("SELECT * FROM txm_receipts WHERE tx_id = ANY($1)")
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?;
        for row in &receipt_rows {
            let receipt = receipt_from_row(row)?;
            receipts.insert(receipt.tx_id, receipt);
        }

        Ok(txs
            .into_iter()
            .map(|tx| TrackedTransaction {
                attempts: attempts.remove(&tx.id).unwrap_or_default(),
                receipt: receipts.remove(&tx.id),
                tx,
            })
            .collect())
    }

    async fn replace_attempt(
        &self,
        tx_id: Uuid,
        replaced: Uuid,
        attempt: &Attempt,
    ) -> TxmResult<()> {
        let mut dbtx = self.pool.begin().await?;

        let tx = Self::lock_transaction(&mut dbtx, tx_id).await?;
        ensure_state(&tx, &[TxState::InFlight], TxState::InFlight)?;
        if tx.nonce != Some(attempt.nonce) {
            return Err(TxmError::Store(format!(
                "replacement attempt nonce {} does not match transaction nonce {:?}",
                attempt.nonce, tx.nonce
            )));
        }

        let retired = sqlx::query(
            r#"
            UPDATE txm_attempts SET state = 'replaced'
            WHERE id = $1 AND tx_id = $2 AND state = 'in_flight'
            "#,
        )
        .bind(replaced)
        .bind(tx_id)
        .execute(&mut *dbtx)
        .await?;
        if retired.rows_affected() != 1 {
            return Err(TxmError::Store(format!(
                "attempt {} is not the current attempt of {}",
                replaced, tx_id
            )));
        }

        Self::insert_attempt(&mut dbtx, tx_id, attempt).await?;
        dbtx.commit().await?;
        Ok(())
    }

    async fn record_receipt(&self, receipt: &Receipt, state: TxState) -> TxmResult<()> {
        if !matches!(state, TxState::Confirmed | TxState::Finalized) {
            return Err(TxmError::Store(format!("cannot record a receipt as {}", state)));
        }

        let mut dbtx = self.pool.begin().await?;
        let tx = Self::lock_transaction(&mut dbtx, receipt.tx_id).await?;
        ensure_state(&tx, &[TxState::InFlight, TxState::Confirmed], state)?;

        sqlx::query("DELETE FROM txm_receipts WHERE tx_id = $1")
            .bind(receipt.tx_id)
            .execute(&mut *dbtx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO txm_receipts (attempt_id, tx_id, tx_hash, block_number, block_hash, success)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(receipt.attempt_id)
        .bind(receipt.tx_id)
        .bind(receipt.tx_hash.as_bytes())
        .bind(receipt.block_number as i64)
        .bind(receipt.block_hash.as_bytes())
        .bind(receipt.success)
        .execute(&mut *dbtx)
        .await?;

        // retire the losers first so the current-attempt index never sees two
        sqlx::query(
            r#"
            UPDATE txm_attempts SET state = 'replaced'
            WHERE tx_id = $1 AND id <> $2 AND state IN ('in_flight', 'confirmed')
            "#,
        )
        .bind(receipt.tx_id)
        .bind(receipt.attempt_id)
        .execute(&mut *dbtx)
        .await?;

        sqlx::query("UPDATE txm_attempts SET state = 'confirmed' WHERE id = $1")
            .bind(receipt.attempt_id)
            .execute(&mut *dbtx)
            .await?;

        sqlx::query("UPDATE txm_transactions SET state = $2, updated_at = NOW() WHERE id = $1")
            .bind(receipt.tx_id)
            .bind(state.as_str())
            .execute(&mut *dbtx)
            .await?;

        dbtx.commit().await?;
        Ok(())
    }

    async fn revert_receipt(&self, tx_id: Uuid) -> TxmResult<()> {
        let mut dbtx = self.pool.begin().await?;
        let tx = Self::lock_transaction(&mut dbtx, tx_id).await?;
        ensure_state(&tx, &[TxState::Confirmed], TxState::InFlight)?;

        sqlx::query("DELETE FROM txm_receipts WHERE tx_id = $1")
            .bind(tx_id)
            .execute(&mut *dbtx)
            .await?;

        sqlx::query(
            "UPDATE txm_attempts SET state = 'in_flight' WHERE tx_id = $1 AND state = 'confirmed'",
        )
        .bind(tx_id)
        .execute(&mut *dbtx)
        .await?;

        sqlx::query(
            "UPDATE txm_transactions SET state = 'in_flight', updated_at = NOW() WHERE id = $1",
        )
        .bind(tx_id)
        .execute(&mut *dbtx)
        .await?;

        dbtx.commit().await?;
        Ok(())
    }

    async fn stale_attempts(&self, cutoff: DateTime<Utc>, limit: usize) -> TxmResult<Vec<Attempt>> {
        let rows = sqlx::query(
            r#"
            SELECT a.* FROM txm_attempts a
            JOIN txm_transactions t ON t.id = a.tx_id
            WHERE t.state = 'in_flight' AND a.state = 'in_flight'
              AND COALESCE(a.broadcast_at, a.created_at) < $1
            ORDER BY COALESCE(a.broadcast_at, a.created_at)
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(attempt_from_row).collect()
    }

    async fn state_counts(&self) -> TxmResult<StateCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM txm_transactions GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StateCounts::default();
        for row in rows {
            let state: TxState = row.get::<String, _>("state").parse()?;
            counts.add(state, row.get::<i64, _>("n") as u64);
        }
        Ok(counts)
    }

    async fn health_check(&self) -> TxmResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn address(bytes: &[u8]) -> TxmResult<Address> {
    if bytes.len() != 20 {
        return Err(TxmError::Store(format!("invalid address length {}", bytes.len())));
    }
    Ok(Address::from_slice(bytes))
}

fn hash(bytes: &[u8]) -> TxmResult<H256> {
    if bytes.len() != 32 {
        return Err(TxmError::Store(format!("invalid hash length {}", bytes.len())));
    }
    Ok(H256::from_slice(bytes))
}

fn tx_from_row(row: &PgRow) -> TxmResult<Transaction> {
    let value: String = row.try_get("value")?;
    let payload_hash = hash(&row.try_get::<Vec<u8>, _>("payload_hash")?)?;

    Ok(Transaction {
        id: row.try_get("id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        from: address(&row.try_get::<Vec<u8>, _>("from_address")?)?,
        to: address(&row.try_get::<Vec<u8>, _>("to_address")?)?,
        value: U256::from_dec_str(&value)
            .map_err(|e| TxmError::Store(format!("invalid value {}: {}", value, e)))?,
        data: Bytes::from(row.try_get::<Vec<u8>, _>("data")?),
        gas_limit: row.try_get::<i64, _>("gas_limit")? as u64,
        payload_hash: payload_hash.0,
        nonce: row.try_get::<Option<i64>, _>("nonce")?.map(|n| n as u64),
        state: row.try_get::<String, _>("state")?.parse()?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn attempt_from_row(row: &PgRow) -> TxmResult<Attempt> {
    let gas_price: Json<GasPrice> = row.try_get("gas_price")?;
    let state: AttemptState = row.try_get::<String, _>("state")?.parse()?;

    Ok(Attempt {
        id: row.try_get("id")?,
        tx_id: row.try_get("tx_id")?,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        gas_price: gas_price.0,
        gas_limit: row.try_get::<i64, _>("gas_limit")? as u64,
        hash: hash(&row.try_get::<Vec<u8>, _>("hash")?)?,
        signed_raw: Bytes::from(row.try_get::<Vec<u8>, _>("signed_raw")?),
        state,
        created_at: row.try_get("created_at")?,
        broadcast_at: row.try_get("broadcast_at")?,
    })
}

fn receipt_from_row(row: &PgRow) -> TxmResult<Receipt> {
    Ok(Receipt {
        tx_id: row.try_get("tx_id")?,
        attempt_id: row.try_get("attempt_id")?,
        tx_hash: hash(&row.try_get::<Vec<u8>, _>("tx_hash")?)?,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        block_hash: hash(&row.try_get::<Vec<u8>, _>("block_hash")?)?,
        success: row.try_get("success")?,
    })
}

#[cfg(test)]
#[async_trait]
impl super::conformance::CursorOverride for PgTxStore {
    async fn overwrite_cursor(&self, from: Address, nonce: u64) {
        sqlx::query(
            r#"
            INSERT INTO txm_nonce_cursors (from_address, next_nonce)
            VALUES ($1, $2)
            ON CONFLICT (from_address) DO UPDATE SET next_nonce = $2, updated_at = NOW()
            "#,
        )
        .bind(from.as_bytes())
        .bind(nonce as i64)
        .execute(&self.pool)
        .await
        .unwrap();
    }
}
