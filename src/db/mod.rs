//! SQLite-backed document store for users, groups, memberships and
//! settlements.
//!
//! The store is the source of truth for every lifecycle invariant:
//! - one open membership per user, via a partial unique index
//! - one non-left membership per (user, group), via a second partial index
//! - status changes are conditional updates on the expected status
//! - compound changes (switch, approve, settle) run in one transaction
//!
//! Transactions issue their first write before any read so SQLite takes the
//! write lock up front.

mod rows;

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{LifecycleError, Result};
use crate::models::{
    Group, IbStatus, Member, MemberStatus, Settlement, SettlementStatus, TradingStatus, User,
};

pub use rows::{StoredGroup, StoredMember, StoredSettlement, StoredUser};

const OPEN_STATUSES: &str = "('pending', 'active', 'paused')";

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `database_url` and run
    /// migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // Each in-memory connection is its own database, so pin exactly one.
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        let db = Self { pool };
        db.run_migrations().await?;

        debug!(url = %database_url, "Database ready");
        Ok(db)
    }

    /// Fresh private in-memory database.
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                role TEXT NOT NULL,
                group_id TEXT,
                ib_status TEXT NOT NULL DEFAULT 'not_changed',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                group_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                company_name TEXT NOT NULL,
                referral_code TEXT NOT NULL UNIQUE,
                api_key TEXT NOT NULL UNIQUE,
                trading_status TEXT NOT NULL DEFAULT 'paused',
                status TEXT NOT NULL DEFAULT 'active',
                profit_sharing_percentage TEXT NOT NULL,
                settlement_cycle TEXT NOT NULL,
                settlement_hold TEXT,
                total_members INTEGER NOT NULL DEFAULT 0,
                active_members INTEGER NOT NULL DEFAULT 0,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS members (
                member_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                group_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                broker TEXT NOT NULL,
                server TEXT NOT NULL,
                status TEXT NOT NULL,
                opening_balance TEXT NOT NULL,
                current_balance TEXT NOT NULL,
                profit_till_date TEXT NOT NULL DEFAULT '0',
                allocation_model TEXT NOT NULL DEFAULT 'ratio',
                allocation_value TEXT NOT NULL DEFAULT '1',
                approved_by TEXT,
                rejection_reason TEXT,
                copy_start_date TEXT,
                left_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(user_id),
                FOREIGN KEY (group_id) REFERENCES groups(group_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_members_one_open \
             ON members(user_id) WHERE status IN {}",
            OPEN_STATUSES
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_members_user_group \
             ON members(user_id, group_id) WHERE status <> 'left'",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_members_group ON members(group_id, status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settlements (
                settlement_id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL,
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL,
                gross_profit TEXT NOT NULL,
                profit_sharing_percentage TEXT NOT NULL,
                amount_due TEXT NOT NULL,
                amount_paid TEXT NOT NULL,
                payment_method TEXT NOT NULL,
                payment_reference TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                submitted_by TEXT NOT NULL,
                decided_by TEXT,
                decided_at TEXT,
                auto_pause_triggered BOOLEAN NOT NULL DEFAULT 0,
                resume_time TEXT,
                remarks TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (group_id) REFERENCES groups(group_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_settlements_status ON settlements(status, group_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Users ====================

    /// Insert or update a user's profile. Never touches `group_id` or
    /// `ib_status`; those move only through lifecycle operations.
    pub async fn save_user(&self, user: &User) -> Result<User> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, name, role, group_id, ib_status, created_at, updated_at)
            VALUES (?, ?, ?, NULL, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                name = excluded.name,
                role = excluded.role,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&user.user_id)
        .bind(&user.name)
        .bind(user.role.as_str())
        .bind(user.ib_status.as_str())
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;

        self.get_user(&user.user_id).await
    }

    pub async fn get_user(&self, user_id: &str) -> Result<User> {
        let mut conn = self.pool.acquire().await?;
        fetch_user(&mut conn, user_id).await
    }

    /// Set the IB status. Returns the status it replaced.
    pub async fn set_ib_status(&self, user_id: &str, status: IbStatus) -> Result<IbStatus> {
        let previous = self.get_user(user_id).await?.ib_status;

        let result = sqlx::query(
            "UPDATE users SET ib_status = ?, updated_at = ? WHERE user_id = ? AND ib_status = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(user_id)
        .bind(previous.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LifecycleError::conflict("user", user_id));
        }
        Ok(previous)
    }

    // ==================== Groups ====================

    pub async fn insert_group(&self, group: &Group) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO groups (
                group_id, name, company_name, referral_code, api_key, trading_status,
                status, profit_sharing_percentage, settlement_cycle, total_members,
                active_members, created_by, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?)
            "#,
        )
        .bind(&group.group_id)
        .bind(&group.name)
        .bind(&group.company_name)
        .bind(&group.referral_code)
        .bind(&group.api_key)
        .bind(group.trading_status.as_str())
        .bind(group.status.as_str())
        .bind(group.profit_sharing_percentage.to_string())
        .bind(group.settlement_cycle.as_str())
        .bind(&group.created_by)
        .bind(group.created_at)
        .bind(group.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a group, including soft-deleted ones.
    pub async fn get_group(&self, group_id: &str) -> Result<Group> {
        let mut conn = self.pool.acquire().await?;
        fetch_group(&mut conn, group_id).await
    }

    /// Resolve a non-deleted group by referral code or API key.
    pub async fn find_group_by_code(&self, code: &str) -> Result<Option<Group>> {
        let row = sqlx::query_as::<_, StoredGroup>(
            r#"
            SELECT * FROM groups
            WHERE (referral_code = ? OR api_key = ?) AND status = 'active'
            LIMIT 1
            "#,
        )
        .bind(code)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Group::try_from).transpose()
    }

    pub async fn list_groups(&self, include_deleted: bool) -> Result<Vec<Group>> {
        let rows = sqlx::query_as::<_, StoredGroup>(
            "SELECT * FROM groups WHERE ? OR status = 'active' ORDER BY created_at",
        )
        .bind(include_deleted)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Group::try_from).collect()
    }

    /// Conditionally move a live group from `expected` to `target`.
    /// Conditional trading-status move from `expected` to `target`.
    ///
    /// With `respect_settlement_hold`, a group held paused by a settlement
    /// fails with `AwaitingSettlement` instead of moving. Moving to active
    /// releases the hold.
    pub async fn update_trading_status(
        &self,
        group_id: &str,
        expected: TradingStatus,
        target: TradingStatus,
        respect_settlement_hold: bool,
    ) -> Result<Group> {
        let mut tx = self.pool.begin().await?;

        let release = if target == TradingStatus::Active {
            ", settlement_hold = NULL"
        } else {
            ""
        };
        let hold = if respect_settlement_hold {
            " AND settlement_hold IS NULL"
        } else {
            ""
        };
        let sql = format!(
            r#"
            UPDATE groups SET trading_status = ?, updated_at = ?{}
            WHERE group_id = ? AND trading_status = ? AND status = 'active'{}
            "#,
            release, hold
        );

        let result = sqlx::query(&sql)
            .bind(target.as_str())
            .bind(Utc::now())
            .bind(group_id)
            .bind(expected.as_str())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            let current = fetch_group(&mut tx, group_id).await?;
            let held = respect_settlement_hold
                && current.trading_status == expected
                && !current.is_deleted();
            if held {
                if let Some(settlement_id) = current.settlement_hold {
                    return Err(LifecycleError::AwaitingSettlement {
                        group_id: group_id.to_string(),
                        settlement_id,
                    });
                }
            }
            return Err(LifecycleError::conflict("group", group_id));
        }

        let group = fetch_group(&mut tx, group_id).await?;
        tx.commit().await?;
        Ok(group)
    }

    /// Replace the group's API key if it still equals `current_key`.
    pub async fn rotate_api_key(
        &self,
        group_id: &str,
        current_key: &str,
        new_key: &str,
    ) -> Result<Group> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE groups SET api_key = ?, updated_at = ?
            WHERE group_id = ? AND api_key = ? AND status = 'active'
            "#,
        )
        .bind(new_key)
        .bind(Utc::now())
        .bind(group_id)
        .bind(current_key)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let group = fetch_group(&mut tx, group_id).await?;
            if group.is_deleted() {
                return Err(LifecycleError::not_found("group", group_id));
            }
            return Err(LifecycleError::conflict("group", group_id));
        }

        let group = fetch_group(&mut tx, group_id).await?;
        tx.commit().await?;
        Ok(group)
    }

    /// Change the live percentage. Settlements keep their own snapshot.
    pub async fn update_profit_share(&self, group_id: &str, percentage: Decimal) -> Result<Group> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE groups SET profit_sharing_percentage = ?, updated_at = ?
            WHERE group_id = ? AND status = 'active'
            "#,
        )
        .bind(percentage.to_string())
        .bind(Utc::now())
        .bind(group_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LifecycleError::not_found("group", group_id));
        }

        let group = fetch_group(&mut tx, group_id).await?;
        tx.commit().await?;
        Ok(group)
    }

    /// Soft delete a group with no open memberships.
    ///
    /// Returns `false` when the group was already deleted.
    pub async fn soft_delete_group(&self, group_id: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE groups SET status = 'deleted', updated_at = ?
            WHERE group_id = ? AND status = 'active'
              AND NOT EXISTS (
                  SELECT 1 FROM members WHERE group_id = ? AND status IN {}
              )
            "#,
            OPEN_STATUSES
        ))
        .bind(Utc::now())
        .bind(group_id)
        .bind(group_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let group = self.get_group(group_id).await?;
        if group.is_deleted() {
            return Ok(false);
        }

        let open_members = count_open_members(&self.pool, group_id).await?;
        if open_members > 0 {
            return Err(LifecycleError::GroupHasMembers {
                group_id: group_id.to_string(),
                open_members,
            });
        }
        Err(LifecycleError::conflict("group", group_id))
    }

    // ==================== Members ====================

    pub async fn get_member(&self, member_id: &str) -> Result<Member> {
        let mut conn = self.pool.acquire().await?;
        fetch_member(&mut conn, member_id).await
    }

    /// The user's pending, active or paused membership, if any.
    pub async fn find_open_member(&self, user_id: &str) -> Result<Option<Member>> {
        let mut conn = self.pool.acquire().await?;
        fetch_open_member(&mut conn, user_id).await
    }

    pub async fn list_members(
        &self,
        group_id: Option<&str>,
        status: Option<MemberStatus>,
    ) -> Result<Vec<Member>> {
        let rows = sqlx::query_as::<_, StoredMember>(
            r#"
            SELECT * FROM members
            WHERE (? IS NULL OR group_id = ?) AND (? IS NULL OR status = ?)
            ORDER BY created_at
            "#,
        )
        .bind(group_id)
        .bind(group_id)
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Member::try_from).collect()
    }

    /// Insert a pending membership, optionally retiring `replace` in the same
    /// transaction.
    ///
    /// The partial unique indexes decide races: a losing insert rolls back
    /// and reports the membership that won.
    pub async fn create_membership(&self, member: &Member, replace: Option<&Member>) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        if let Some(prior) = replace {
            let result = sqlx::query(
                r#"
                UPDATE members SET status = 'left', left_at = ?, updated_at = ?
                WHERE member_id = ? AND status = ?
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(&prior.member_id)
            .bind(prior.status.as_str())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(LifecycleError::conflict("member", &prior.member_id));
            }

            clear_user_group(&mut tx, &prior.user_id, &prior.group_id).await?;
            recompute_counters(&mut tx, &prior.group_id).await?;
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO members (
                member_id, user_id, group_id, account_id, broker, server, status,
                opening_balance, current_balance, profit_till_date, allocation_model,
                allocation_value, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&member.member_id)
        .bind(&member.user_id)
        .bind(&member.group_id)
        .bind(&member.account_id)
        .bind(&member.broker)
        .bind(&member.server)
        .bind(member.status.as_str())
        .bind(member.opening_balance.to_string())
        .bind(member.current_balance.to_string())
        .bind(member.profit_till_date.to_string())
        .bind(member.allocation.model.as_str())
        .bind(member.allocation.value.to_string())
        .bind(member.created_at)
        .bind(member.updated_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                tx.rollback().await?;
                return Err(self.membership_conflict(member).await);
            }
            Err(err) => return Err(err.into()),
        }

        recompute_counters(&mut tx, &member.group_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn membership_conflict(&self, member: &Member) -> LifecycleError {
        let existing = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT member_id FROM members
            WHERE user_id = ? AND status <> 'left'
            ORDER BY (group_id = ?) DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(&member.user_id)
        .bind(&member.group_id)
        .fetch_optional(&self.pool)
        .await;

        match existing {
            Ok(Some((member_id,))) => LifecycleError::AlreadyInGroup {
                user_id: member.user_id.clone(),
                member_id,
            },
            // The winner left again before we looked; the caller may retry.
            Ok(None) => LifecycleError::conflict("member", &member.user_id),
            Err(err) => err.into(),
        }
    }

    /// pending -> active, pointing the user at the group.
    pub async fn approve_membership(&self, member: &Member, approver: &str) -> Result<Member> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE members SET
                status = 'active',
                approved_by = ?,
                copy_start_date = COALESCE(copy_start_date, ?),
                updated_at = ?
            WHERE member_id = ? AND status = 'pending'
            "#,
        )
        .bind(approver)
        .bind(now)
        .bind(now)
        .bind(&member.member_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LifecycleError::conflict("member", &member.member_id));
        }

        let result = sqlx::query(
            r#"
            UPDATE users SET group_id = ?, updated_at = ?
            WHERE user_id = ? AND (group_id IS NULL OR group_id = ?)
            "#,
        )
        .bind(&member.group_id)
        .bind(now)
        .bind(&member.user_id)
        .bind(&member.group_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LifecycleError::conflict("user", &member.user_id));
        }

        recompute_counters(&mut tx, &member.group_id).await?;
        let approved = fetch_member(&mut tx, &member.member_id).await?;
        tx.commit().await?;
        Ok(approved)
    }

    /// pending -> rejected.
    pub async fn reject_membership(&self, member: &Member, reason: Option<&str>) -> Result<Member> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE members SET status = 'rejected', rejection_reason = ?, updated_at = ?
            WHERE member_id = ? AND status = 'pending'
            "#,
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(&member.member_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LifecycleError::conflict("member", &member.member_id));
        }

        recompute_counters(&mut tx, &member.group_id).await?;
        let rejected = fetch_member(&mut tx, &member.member_id).await?;
        tx.commit().await?;
        Ok(rejected)
    }

    /// Any non-left status -> left, releasing the user's group pointer.
    pub async fn leave_membership(&self, member: &Member) -> Result<Member> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE members SET status = 'left', left_at = ?, updated_at = ?
            WHERE member_id = ? AND status = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&member.member_id)
        .bind(member.status.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LifecycleError::conflict("member", &member.member_id));
        }

        clear_user_group(&mut tx, &member.user_id, &member.group_id).await?;
        recompute_counters(&mut tx, &member.group_id).await?;
        let left = fetch_member(&mut tx, &member.member_id).await?;
        tx.commit().await?;
        Ok(left)
    }

    /// Conditional status change between approved states (pause / resume).
    pub async fn set_member_status(
        &self,
        member: &Member,
        target: MemberStatus,
    ) -> Result<Member> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE members SET status = ?, updated_at = ?
            WHERE member_id = ? AND status = ?
            "#,
        )
        .bind(target.as_str())
        .bind(Utc::now())
        .bind(&member.member_id)
        .bind(member.status.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LifecycleError::conflict("member", &member.member_id));
        }

        recompute_counters(&mut tx, &member.group_id).await?;
        let updated = fetch_member(&mut tx, &member.member_id).await?;
        tx.commit().await?;
        Ok(updated)
    }

    // ==================== Settlements ====================

    /// Insert a pending settlement. With `auto_pause`, an active group is
    /// paused in the same transaction and the settlement records it.
    pub async fn insert_settlement(
        &self,
        settlement: &Settlement,
        auto_pause: bool,
    ) -> Result<Settlement> {
        let mut tx = self.pool.begin().await?;

        let mut paused = false;
        if auto_pause {
            let result = sqlx::query(
                r#"
                UPDATE groups SET trading_status = 'paused', settlement_hold = ?, updated_at = ?
                WHERE group_id = ? AND trading_status = 'active' AND status = 'active'
                "#,
            )
            .bind(&settlement.settlement_id)
            .bind(Utc::now())
            .bind(&settlement.group_id)
            .execute(&mut *tx)
            .await?;
            paused = result.rows_affected() == 1;
        }

        sqlx::query(
            r#"
            INSERT INTO settlements (
                settlement_id, group_id, period_start, period_end, gross_profit,
                profit_sharing_percentage, amount_due, amount_paid, payment_method,
                payment_reference, status, submitted_by, auto_pause_triggered,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&settlement.settlement_id)
        .bind(&settlement.group_id)
        .bind(settlement.period_start)
        .bind(settlement.period_end)
        .bind(settlement.gross_profit.to_string())
        .bind(settlement.profit_sharing_percentage.to_string())
        .bind(settlement.amount_due.to_string())
        .bind(settlement.amount_paid.to_string())
        .bind(&settlement.payment_method)
        .bind(&settlement.payment_reference)
        .bind(settlement.status.as_str())
        .bind(&settlement.submitted_by)
        .bind(paused)
        .bind(settlement.created_at)
        .bind(settlement.updated_at)
        .execute(&mut *tx)
        .await?;

        let stored = fetch_settlement(&mut tx, &settlement.settlement_id).await?;
        tx.commit().await?;
        Ok(stored)
    }

    pub async fn get_settlement(&self, settlement_id: &str) -> Result<Settlement> {
        let mut conn = self.pool.acquire().await?;
        fetch_settlement(&mut conn, settlement_id).await
    }

    pub async fn list_settlements(
        &self,
        status: Option<SettlementStatus>,
        group_id: Option<&str>,
    ) -> Result<Vec<Settlement>> {
        let rows = sqlx::query_as::<_, StoredSettlement>(
            r#"
            SELECT * FROM settlements
            WHERE (? IS NULL OR status = ?) AND (? IS NULL OR group_id = ?)
            ORDER BY created_at
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .bind(group_id)
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Settlement::try_from).collect()
    }

    /// pending -> processing.
    pub async fn mark_settlement_processing(&self, settlement_id: &str) -> Result<Settlement> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE settlements SET status = 'processing', updated_at = ?
            WHERE settlement_id = ? AND status = 'pending'
            "#,
        )
        .bind(Utc::now())
        .bind(settlement_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LifecycleError::conflict("settlement", settlement_id));
        }

        let settlement = fetch_settlement(&mut tx, settlement_id).await?;
        tx.commit().await?;
        Ok(settlement)
    }

    /// Approve a settlement still in `expected`.
    ///
    /// `resume` carries the group transition to apply alongside; if the group
    /// is no longer in its expected state the whole approval rolls back.
    pub async fn approve_settlement(
        &self,
        settlement: &Settlement,
        approver: &str,
        resume: Option<(TradingStatus, TradingStatus)>,
    ) -> Result<Settlement> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE settlements SET
                status = 'approved',
                decided_by = ?,
                decided_at = ?,
                resume_time = ?,
                updated_at = ?
            WHERE settlement_id = ? AND status = ?
            "#,
        )
        .bind(approver)
        .bind(now)
        .bind(resume.map(|_| now))
        .bind(now)
        .bind(&settlement.settlement_id)
        .bind(settlement.status.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LifecycleError::conflict("settlement", &settlement.settlement_id));
        }

        if let Some((from, to)) = resume {
            let result = sqlx::query(
                r#"
                UPDATE groups SET trading_status = ?, settlement_hold = NULL, updated_at = ?
                WHERE group_id = ? AND trading_status = ? AND status = 'active'
                  AND settlement_hold IS NOT NULL
                "#,
            )
            .bind(to.as_str())
            .bind(now)
            .bind(&settlement.group_id)
            .bind(from.as_str())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(LifecycleError::conflict("group", &settlement.group_id));
            }
        }

        let approved = fetch_settlement(&mut tx, &settlement.settlement_id).await?;
        tx.commit().await?;
        Ok(approved)
    }

    /// Reject a settlement still in `expected`, recording the reason.
    pub async fn reject_settlement(
        &self,
        settlement: &Settlement,
        decider: &str,
        reason: &str,
    ) -> Result<Settlement> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE settlements SET
                status = 'rejected',
                decided_by = ?,
                decided_at = ?,
                remarks = CASE WHEN remarks IS NULL THEN ? ELSE remarks || char(10) || ? END,
                updated_at = ?
            WHERE settlement_id = ? AND status = ?
            "#,
        )
        .bind(decider)
        .bind(now)
        .bind(reason)
        .bind(reason)
        .bind(now)
        .bind(&settlement.settlement_id)
        .bind(settlement.status.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LifecycleError::conflict("settlement", &settlement.settlement_id));
        }

        let rejected = fetch_settlement(&mut tx, &settlement.settlement_id).await?;
        tx.commit().await?;
        Ok(rejected)
    }

    /// Append an audit remark. Allowed at any status.
    pub async fn annotate_settlement(&self, settlement_id: &str, remark: &str) -> Result<Settlement> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE settlements SET
                remarks = CASE WHEN remarks IS NULL THEN ? ELSE remarks || char(10) || ? END,
                updated_at = ?
            WHERE settlement_id = ?
            "#,
        )
        .bind(remark)
        .bind(remark)
        .bind(Utc::now())
        .bind(settlement_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LifecycleError::not_found("settlement", settlement_id));
        }

        let settlement = fetch_settlement(&mut tx, settlement_id).await?;
        tx.commit().await?;
        Ok(settlement)
    }
}

// ==================== Connection helpers ====================

async fn fetch_user(conn: &mut SqliteConnection, user_id: &str) -> Result<User> {
    let row = sqlx::query_as::<_, StoredUser>("SELECT * FROM users WHERE user_id = ?")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;

    row.ok_or_else(|| LifecycleError::not_found("user", user_id))?
        .try_into()
}

async fn fetch_group(conn: &mut SqliteConnection, group_id: &str) -> Result<Group> {
    let row = sqlx::query_as::<_, StoredGroup>("SELECT * FROM groups WHERE group_id = ?")
        .bind(group_id)
        .fetch_optional(&mut *conn)
        .await?;

    row.ok_or_else(|| LifecycleError::not_found("group", group_id))?
        .try_into()
}

async fn fetch_member(conn: &mut SqliteConnection, member_id: &str) -> Result<Member> {
    let row = sqlx::query_as::<_, StoredMember>("SELECT * FROM members WHERE member_id = ?")
        .bind(member_id)
        .fetch_optional(&mut *conn)
        .await?;

    row.ok_or_else(|| LifecycleError::not_found("member", member_id))?
        .try_into()
}

async fn fetch_open_member(conn: &mut SqliteConnection, user_id: &str) -> Result<Option<Member>> {
    let row = sqlx::query_as::<_, StoredMember>(&format!(
        "SELECT * FROM members WHERE user_id = ? AND status IN {}",
        OPEN_STATUSES
    ))
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(Member::try_from).transpose()
}

async fn fetch_settlement(conn: &mut SqliteConnection, settlement_id: &str) -> Result<Settlement> {
    let row =
        sqlx::query_as::<_, StoredSettlement>("SELECT * FROM settlements WHERE settlement_id = ?")
            .bind(settlement_id)
            .fetch_optional(&mut *conn)
            .await?;

    row.ok_or_else(|| LifecycleError::not_found("settlement", settlement_id))?
        .try_into()
}

async fn count_open_members(pool: &SqlitePool, group_id: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(&format!(
        "SELECT COUNT(*) FROM members WHERE group_id = ? AND status IN {}",
        OPEN_STATUSES
    ))
    .bind(group_id)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// Clear the user's pointer only if it still names `group_id`.
async fn clear_user_group(conn: &mut SqliteConnection, user_id: &str, group_id: &str) -> Result<()> {
    sqlx::query("UPDATE users SET group_id = NULL, updated_at = ? WHERE user_id = ? AND group_id = ?")
        .bind(Utc::now())
        .bind(user_id)
        .bind(group_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn recompute_counters(conn: &mut SqliteConnection, group_id: &str) -> Result<()> {
    sqlx::query(&format!(
        r#"
        UPDATE groups SET
            total_members = (
                SELECT COUNT(*) FROM members WHERE group_id = ? AND status IN {}
            ),
            active_members = (
                SELECT COUNT(*) FROM members WHERE group_id = ? AND status = 'active'
            ),
            updated_at = ?
        WHERE group_id = ?
        "#,
        OPEN_STATUSES
    ))
    .bind(group_id)
    .bind(group_id)
    .bind(Utc::now())
    .bind(group_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
