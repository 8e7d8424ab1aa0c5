use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};

use super::models::*;
use super::store::LedgerStore;
use crate::config::PurgePolicy;
use crate::error::{AppError, AppResult, LedgerError};

const RECORD_COLUMNS: &str =
    "request_hash, user_address, nonce, input_fee, output_fee, fee, created_at, processed, skip_until";

const ACCOUNT_COLUMNS: &str = "user_address, lock_balance::TEXT AS lock_balance, \
     unsettled_fee::TEXT AS unsettled_fee, last_balance_check_time, signer, skip_until, \
     created_at, updated_at";

// Output metering is finished once output_fee holds a non-zero value.
const ELIGIBLE_PREDICATE: &str = "processed = FALSE \
     AND (skip_until IS NULL OR skip_until <= $1) \
     AND (output_fee !~ '^(0x)?0*$' OR created_at <= $2) \
     AND ($3::TEXT IS NULL OR user_address = $3)";

/// Postgres ledger - the durable source of truth for pending fees
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_insert_error(err: sqlx::Error, request_hash: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            LedgerError::DuplicateRecord(request_hash.to_string()).into()
        }
        _ => err.into(),
    }
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    // ========== RECORD OPERATIONS ==========

    async fn insert_record(&self, record: &PendingUsageRecord) -> AppResult<()> {
        let fee = record.fee_amount()?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO pending_usage_records
                (request_hash, user_address, nonce, input_fee, output_fee, fee, created_at, processed, skip_until)
            VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, NULL)
            "#,
        )
        .bind(&record.request_hash)
        .bind(&record.user_address)
        .bind(&record.nonce)
        .bind(&record.input_fee)
        .bind(&record.output_fee)
        .bind(&record.fee)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_insert_error(e, &record.request_hash))?;

        sqlx::query(
            r#"
            INSERT INTO ledger_accounts (user_address, unsettled_fee)
            VALUES ($1, $2::NUMERIC)
            ON CONFLICT (user_address) DO UPDATE
            SET unsettled_fee = ledger_accounts.unsettled_fee + EXCLUDED.unsettled_fee,
                updated_at = NOW()
            "#,
        )
        .bind(&record.user_address)
        .bind(fee.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_eligible_records(
        &self,
        filter: &RecordFilter,
    ) -> AppResult<Vec<PendingUsageRecord>> {
        let sql = format!(
            "SELECT {} FROM pending_usage_records WHERE {} ORDER BY created_at ASC, request_hash ASC",
            RECORD_COLUMNS, ELIGIBLE_PREDICATE
        );
        let records = sqlx::query_as::<_, PendingUsageRecord>(&sql)
            .bind(filter.as_of)
            .bind(filter.old_request_cutoff)
            .bind(filter.user.as_deref())
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn count_eligible_records(&self, filter: &RecordFilter) -> AppResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM pending_usage_records WHERE {}",
            ELIGIBLE_PREDICATE
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(filter.as_of)
            .bind(filter.old_request_cutoff)
            .bind(filter.user.as_deref())
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }

    async fn list_unprocessed_records(&self) -> AppResult<Vec<PendingUsageRecord>> {
        let sql = format!(
            "SELECT {} FROM pending_usage_records WHERE processed = FALSE ORDER BY created_at ASC, request_hash ASC",
            RECORD_COLUMNS
        );
        let records = sqlx::query_as::<_, PendingUsageRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn update_skip_until(
        &self,
        request_hashes: &[String],
        until: DateTime<Utc>,
    ) -> AppResult<u64> {
        if request_hashes.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE pending_usage_records
            SET skip_until = $2
            WHERE request_hash = ANY($1)
            "#,
        )
        .bind(request_hashes)
        .bind(until)
        .execute(&self.pool)
        .await?;

        debug!("⏸️  Marked {} records to skip until {}", result.rows_affected(), until);
        Ok(result.rows_affected())
    }

    async fn clear_expired_skip_until(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let mut tx = self.pool.begin().await?;

        let records = sqlx::query(
            "UPDATE pending_usage_records SET skip_until = NULL WHERE skip_until IS NOT NULL AND skip_until <= $1",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let accounts = sqlx::query(
            "UPDATE ledger_accounts SET skip_until = NULL WHERE skip_until IS NOT NULL AND skip_until <= $1",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(records + accounts)
    }

    async fn delete_settled_records(&self, request_hashes: &[String]) -> AppResult<u64> {
        if request_hashes.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE pending_usage_records SET processed = TRUE WHERE request_hash = ANY($1)")
            .bind(request_hashes)
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query(
            "DELETE FROM pending_usage_records WHERE processed = TRUE AND request_hash = ANY($1)",
        )
        .bind(request_hashes)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(deleted)
    }

    async fn purge_user_records(
        &self,
        user: &str,
        reason: &str,
        policy: PurgePolicy,
        at: DateTime<Utc>,
    ) -> AppResult<u64> {
        let mut tx = self.pool.begin().await?;

        if policy == PurgePolicy::DeadLetter {
            sqlx::query(
                r#"
                INSERT INTO settlement_dead_letters
                    (request_hash, user_address, nonce, input_fee, output_fee, fee, created_at, reason, dead_lettered_at)
                SELECT request_hash, user_address, nonce, input_fee, output_fee, fee, created_at, $2, $3
                FROM pending_usage_records
                WHERE user_address = $1
                ON CONFLICT (request_hash) DO NOTHING
                "#,
            )
            .bind(user)
            .bind(reason)
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }

        let purged = sqlx::query("DELETE FROM pending_usage_records WHERE user_address = $1")
            .bind(user)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        info!("🗑️  Purged {} records for {} ({:?}): {}", purged, user, policy, reason);
        Ok(purged)
    }

    async fn list_dead_letters(&self, user: Option<&str>) -> AppResult<Vec<DeadLetterRecord>> {
        let records = sqlx::query_as::<_, DeadLetterRecord>(
            r#"
            SELECT request_hash, user_address, nonce, input_fee, output_fee, fee, created_at, reason, dead_lettered_at
            FROM settlement_dead_letters
            WHERE ($1::TEXT IS NULL OR user_address = $1)
            ORDER BY dead_lettered_at DESC, created_at ASC
            "#,
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn reset_unsettled_fees(&self) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE ledger_accounts SET unsettled_fee = 0, updated_at = NOW() WHERE unsettled_fee <> 0",
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ========== ACCOUNT OPERATIONS ==========

    async fn get_account(&self, user: &str) -> AppResult<Option<LedgerAccount>> {
        let sql = format!(
            "SELECT {} FROM ledger_accounts WHERE user_address = $1",
            ACCOUNT_COLUMNS
        );
        let account = sqlx::query_as::<_, LedgerAccount>(&sql)
            .bind(user)
            .fetch_optional(&self.pool)
            .await?;

        Ok(account)
    }

    async fn upsert_account(
        &self,
        account: &SyncedAccount,
        at: DateTime<Utc>,
    ) -> AppResult<LedgerAccount> {
        let sql = format!(
            r#"
            INSERT INTO ledger_accounts (user_address, lock_balance, signer, last_balance_check_time)
            VALUES ($1, $2::NUMERIC, $3, $4)
            ON CONFLICT (user_address) DO UPDATE
            SET lock_balance = EXCLUDED.lock_balance,
                signer = EXCLUDED.signer,
                last_balance_check_time = EXCLUDED.last_balance_check_time,
                updated_at = NOW()
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        );
        let row = sqlx::query_as::<_, LedgerAccount>(&sql)
            .bind(&account.user_address)
            .bind(account.lock_balance.to_string())
            .bind(&account.signer)
            .bind(at)
            .fetch_one(&self.pool)
            .await?;

        Ok(row)
    }

    async fn sync_accounts(
        &self,
        accounts: &[SyncedAccount],
        at: DateTime<Utc>,
    ) -> AppResult<SyncStats> {
        let mut tx = self.pool.begin().await?;

        let existing: HashSet<String> =
            sqlx::query_scalar::<_, String>("SELECT user_address FROM ledger_accounts")
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .collect();

        let mut stats = SyncStats::default();
        for account in accounts {
            sqlx::query(
                r#"
                INSERT INTO ledger_accounts (user_address, lock_balance, signer, last_balance_check_time)
                VALUES ($1, $2::NUMERIC, $3, $4)
                ON CONFLICT (user_address) DO UPDATE
                SET lock_balance = EXCLUDED.lock_balance,
                    signer = EXCLUDED.signer,
                    last_balance_check_time = EXCLUDED.last_balance_check_time,
                    updated_at = NOW()
                "#,
            )
            .bind(&account.user_address)
            .bind(account.lock_balance.to_string())
            .bind(&account.signer)
            .bind(at)
            .execute(&mut *tx)
            .await?;

            if existing.contains(&account.user_address) {
                stats.updated += 1;
            } else {
                stats.added += 1;
            }
        }

        let keep: Vec<String> = accounts.iter().map(|a| a.user_address.clone()).collect();
        stats.removed = sqlx::query("DELETE FROM ledger_accounts WHERE NOT (user_address = ANY($1))")
            .bind(&keep)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(stats)
    }

    async fn list_accounts_at_risk(
        &self,
        filter: &AccountRiskFilter,
    ) -> AppResult<Vec<LedgerAccount>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM ledger_accounts
            WHERE unsettled_fee > 0
              AND ((lock_balance - unsettled_fee) < $1::NUMERIC
                   OR ($2::TIMESTAMPTZ IS NOT NULL
                       AND (last_balance_check_time IS NULL OR last_balance_check_time < $2)))
            ORDER BY user_address
            "#,
            ACCOUNT_COLUMNS
        );
        let accounts = sqlx::query_as::<_, LedgerAccount>(&sql)
            .bind(filter.lock_balance_threshold.to_string())
            .bind(filter.stale_before)
            .fetch_all(&self.pool)
            .await?;

        Ok(accounts)
    }

    // ========== IN-FLIGHT JOURNAL ==========

    async fn record_inflight(&self, entries: &[InFlightSettlement]) -> AppResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO settlement_inflight (user_address, nonce, total_fee, request_hashes, created_at)
                VALUES ($1, $2::NUMERIC, $3::NUMERIC, $4, $5)
                ON CONFLICT (user_address) DO UPDATE
                SET nonce = EXCLUDED.nonce,
                    total_fee = EXCLUDED.total_fee,
                    request_hashes = EXCLUDED.request_hashes,
                    created_at = EXCLUDED.created_at
                "#,
            )
            .bind(&entry.user_address)
            .bind(&entry.nonce)
            .bind(&entry.total_fee)
            .bind(&entry.request_hashes)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_inflight(&self) -> AppResult<Vec<InFlightSettlement>> {
        let entries = sqlx::query_as::<_, InFlightSettlement>(
            r#"
            SELECT user_address, nonce::TEXT AS nonce, total_fee::TEXT AS total_fee, request_hashes, created_at
            FROM settlement_inflight
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn clear_inflight(&self, users: &[String]) -> AppResult<u64> {
        if users.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM settlement_inflight WHERE user_address = ANY($1)")
            .bind(users)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
