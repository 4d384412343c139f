//! SQLite-based marketplace store.
//!
//! The claim race is closed twice: `create_claim` runs its checks inside a
//! `BEGIN IMMEDIATE` transaction, and the schema carries unique indexes for
//! one-claim-per-task and one-active-claim-per-user. A unique violation on
//! insert is reported as the matching business error.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::MarketStore;
use crate::marketplace::earnings::{HistoryTotals, PaidClaim};
use crate::marketplace::error::MarketError;
use crate::marketplace::lifecycle::{self, ClaimTransition};
use crate::marketplace::types::{
    Category, Claim, ClaimStatus, Difficulty, PaymentStatus, Role, Task, UserAccount, Verdict,
};

const DB_FILE: &str = "marketplace.db";

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'user',
    successful_tasks_count INTEGER NOT NULL DEFAULT 0,
    failed_tasks_count INTEGER NOT NULL DEFAULT 0,
    total_earnings_cents INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS categories (
    id TEXT PRIMARY KEY NOT NULL,
    admin_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    is_premium INTEGER NOT NULL DEFAULT 0,
    expires_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_categories_listing ON categories(is_active, is_premium, created_at);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    category_id TEXT NOT NULL,
    admin_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    difficulty TEXT NOT NULL DEFAULT 'easy',
    reward_cents INTEGER NOT NULL,
    external_link TEXT NOT NULL,
    auxiliary_text TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (category_id) REFERENCES categories(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_tasks_category ON tasks(category_id);
CREATE INDEX IF NOT EXISTS idx_tasks_active_expires ON tasks(is_active, expires_at);

CREATE TABLE IF NOT EXISTS user_tasks (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'taken',
    taken_at TEXT NOT NULL,
    completed_at TEXT,
    expires_at TEXT NOT NULL,
    proof1_ref TEXT,
    proof2_ref TEXT,
    payment_status TEXT NOT NULL DEFAULT 'pending',
    admin_notes TEXT,
    updated_at TEXT NOT NULL,
    UNIQUE (user_id, task_id),
    FOREIGN KEY (user_id) REFERENCES users(id),
    FOREIGN KEY (task_id) REFERENCES tasks(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_user_tasks_task ON user_tasks(task_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_user_tasks_one_active
    ON user_tasks(user_id) WHERE status NOT IN ('completed', 'failed');
CREATE INDEX IF NOT EXISTS idx_user_tasks_status_expires ON user_tasks(status, expires_at);
CREATE INDEX IF NOT EXISTS idx_user_tasks_paid ON user_tasks(user_id, payment_status, completed_at);
"#;

const TASK_COLUMNS: &str = "t.id, t.category_id, t.admin_id, t.title, t.description, t.difficulty,
    t.reward_cents, t.external_link, t.auxiliary_text, t.is_active, t.expires_at, t.created_at";

const CLAIM_COLUMNS: &str = "ut.id, ut.user_id, ut.task_id, ut.status, ut.taken_at, ut.completed_at,
    ut.expires_at, ut.proof1_ref, ut.proof2_ref, ut.payment_status, ut.admin_notes";

const USER_COLUMNS: &str = "id, name, role, successful_tasks_count, failed_tasks_count,
    total_earnings_cents, created_at";

const CATEGORY_COLUMNS: &str =
    "id, admin_id, name, description, is_active, is_premium, expires_at, created_at";

pub struct SqliteMarketStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMarketStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, MarketError> {
        let db_path = base_dir.join(DB_FILE);

        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| MarketError::storage(format!("Failed to create store dir: {}", e)))?;

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            conn.execute_batch(SCHEMA)?;
            tracing::debug!(path = %db_path.display(), "Opened marketplace database");
            Ok::<_, MarketError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, MarketError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, MarketError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Column encoding
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed-width UTC text, so string order matches time order.
fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error(idx: &str, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, format!("{}: {}", idx, msg).into())
}

fn get_ts(row: &Row<'_>, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(col, e.to_string()))
}

fn get_opt_ts(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_error(col, e.to_string()))
    })
    .transpose()
}

fn get_uuid(row: &Row<'_>, col: &str) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(col)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(col, e.to_string()))
}

fn get_cents(row: &Row<'_>, col: &str) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(col)?;
    u64::try_from(raw).map_err(|e| conversion_error(col, e.to_string()))
}

fn get_enum<T>(row: &Row<'_>, col: &str, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(col)?;
    parse(&raw).ok_or_else(|| conversion_error(col, format!("unknown value '{}'", raw)))
}

fn to_i64(value: u64) -> Result<i64, MarketError> {
    i64::try_from(value).map_err(|_| MarketError::storage(format!("value {} out of range", value)))
}

/// LIMIT/OFFSET value. Anything past `i64::MAX` already means "no rows".
fn to_sql_count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserAccount> {
    Ok(UserAccount {
        id: get_uuid(row, "id")?,
        name: row.get("name")?,
        role: get_enum(row, "role", Role::parse)?,
        successful_tasks_count: get_cents(row, "successful_tasks_count")?,
        failed_tasks_count: get_cents(row, "failed_tasks_count")?,
        total_earnings_cents: get_cents(row, "total_earnings_cents")?,
        created_at: get_ts(row, "created_at")?,
    })
}

fn category_from_row(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: get_uuid(row, "id")?,
        admin_id: get_uuid(row, "admin_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        is_active: row.get("is_active")?,
        is_premium: row.get("is_premium")?,
        expires_at: get_opt_ts(row, "expires_at")?,
        created_at: get_ts(row, "created_at")?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: get_uuid(row, "id")?,
        category_id: get_uuid(row, "category_id")?,
        admin_id: get_uuid(row, "admin_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        difficulty: get_enum(row, "difficulty", Difficulty::parse)?,
        reward_cents: get_cents(row, "reward_cents")?,
        external_link: row.get("external_link")?,
        auxiliary_text: row.get("auxiliary_text")?,
        is_active: row.get("is_active")?,
        expires_at: get_ts(row, "expires_at")?,
        created_at: get_ts(row, "created_at")?,
    })
}

fn claim_from_row(row: &Row<'_>) -> rusqlite::Result<Claim> {
    Ok(Claim {
        id: get_uuid(row, "id")?,
        user_id: get_uuid(row, "user_id")?,
        task_id: get_uuid(row, "task_id")?,
        status: get_enum(row, "status", ClaimStatus::parse)?,
        taken_at: get_ts(row, "taken_at")?,
        completed_at: get_opt_ts(row, "completed_at")?,
        expires_at: get_ts(row, "expires_at")?,
        proof1_ref: row.get("proof1_ref")?,
        proof2_ref: row.get("proof2_ref")?,
        payment_status: get_enum(row, "payment_status", PaymentStatus::parse)?,
        admin_notes: row.get("admin_notes")?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Row access shared by plain reads and transactions
// ─────────────────────────────────────────────────────────────────────────────

fn load_user(conn: &Connection, id: Uuid) -> Result<Option<UserAccount>, MarketError> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id.to_string()], user_from_row)
        .optional()?)
}

fn load_task(conn: &Connection, id: Uuid) -> Result<Option<Task>, MarketError> {
    let sql = format!("SELECT {} FROM tasks t WHERE t.id = ?1", TASK_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id.to_string()], task_from_row)
        .optional()?)
}

fn load_claim(conn: &Connection, id: Uuid) -> Result<Option<Claim>, MarketError> {
    let sql = format!("SELECT {} FROM user_tasks ut WHERE ut.id = ?1", CLAIM_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id.to_string()], claim_from_row)
        .optional()?)
}

fn load_active_claim(conn: &Connection, user_id: Uuid) -> Result<Option<Claim>, MarketError> {
    let sql = format!(
        "SELECT {} FROM user_tasks ut
         WHERE ut.user_id = ?1 AND ut.status NOT IN ('completed', 'failed')
         LIMIT 1",
        CLAIM_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![user_id.to_string()], claim_from_row)
        .optional()?)
}

fn write_claim_state(conn: &Connection, claim: &Claim, now: DateTime<Utc>) -> Result<(), MarketError> {
    // taken_at and expires_at are fixed at creation and never rewritten.
    conn.execute(
        "UPDATE user_tasks
         SET status = ?2, completed_at = ?3, proof1_ref = ?4, proof2_ref = ?5,
             payment_status = ?6, admin_notes = ?7, updated_at = ?8
         WHERE id = ?1",
        params![
            claim.id.to_string(),
            claim.status.as_str(),
            claim.completed_at.as_ref().map(fmt_ts),
            claim.proof1_ref,
            claim.proof2_ref,
            claim.payment_status.as_str(),
            claim.admin_notes,
            fmt_ts(&now),
        ],
    )?;
    Ok(())
}

fn write_user_totals(conn: &Connection, user: &UserAccount) -> Result<(), MarketError> {
    conn.execute(
        "UPDATE users
         SET successful_tasks_count = ?2, failed_tasks_count = ?3, total_earnings_cents = ?4
         WHERE id = ?1",
        params![
            user.id.to_string(),
            to_i64(user.successful_tasks_count)?,
            to_i64(user.failed_tasks_count)?,
            to_i64(user.total_earnings_cents)?,
        ],
    )?;
    Ok(())
}

/// Map a unique-constraint failure on claim insert to the business error it
/// stands for. Anything else stays an infrastructure failure.
fn classify_insert_error(err: rusqlite::Error) -> MarketError {
    match &err {
        rusqlite::Error::SqliteFailure(e, msg) if e.code == ErrorCode::ConstraintViolation => {
            classify_constraint(msg.as_deref().unwrap_or(""))
                .unwrap_or_else(|| MarketError::storage(&err))
        }
        _ => MarketError::storage(&err),
    }
}

fn classify_constraint(message: &str) -> Option<MarketError> {
    if !message.contains("UNIQUE") {
        return None;
    }
    if message.contains("user_tasks.task_id") {
        Some(MarketError::TaskAlreadyTaken)
    } else if message.contains("user_tasks.user_id") {
        Some(MarketError::AlreadyHasActiveTask)
    } else {
        None
    }
}

#[async_trait]
impl MarketStore for SqliteMarketStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn insert_user(&self, user: &UserAccount) -> Result<(), MarketError> {
        let user = user.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO users (id, name, role, successful_tasks_count, failed_tasks_count,
                                    total_earnings_cents, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    user.id.to_string(),
                    user.name,
                    user.role.as_str(),
                    to_i64(user.successful_tasks_count)?,
                    to_i64(user.failed_tasks_count)?,
                    to_i64(user.total_earnings_cents)?,
                    fmt_ts(&user.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<UserAccount>, MarketError> {
        self.with_conn(move |conn| load_user(conn, id)).await
    }

    async fn set_user_totals(&self, id: Uuid, totals: HistoryTotals) -> Result<UserAccount, MarketError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut user = load_user(&tx, id)?.ok_or(MarketError::NotFound("user"))?;
            user.successful_tasks_count = totals.successful_tasks_count;
            user.failed_tasks_count = totals.failed_tasks_count;
            user.total_earnings_cents = totals.total_earnings_cents;
            write_user_totals(&tx, &user)?;
            tx.commit()?;
            Ok(user)
        })
        .await
    }

    async fn insert_category(&self, category: &Category) -> Result<(), MarketError> {
        let category = category.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO categories (id, admin_id, name, description, is_active, is_premium,
                                         expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    category.id.to_string(),
                    category.admin_id.to_string(),
                    category.name,
                    category.description,
                    category.is_active,
                    category.is_premium,
                    category.expires_at.as_ref().map(fmt_ts),
                    fmt_ts(&category.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_category(&self, id: Uuid) -> Result<Option<Category>, MarketError> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM categories WHERE id = ?1", CATEGORY_COLUMNS);
            Ok(conn
                .query_row(&sql, params![id.to_string()], category_from_row)
                .optional()?)
        })
        .await
    }

    async fn list_listed_categories(&self, now: DateTime<Utc>) -> Result<Vec<Category>, MarketError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM categories
                 WHERE is_active = 1 AND (expires_at IS NULL OR expires_at > ?1)
                 ORDER BY is_premium DESC, created_at DESC",
                CATEGORY_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let categories = stmt
                .query_map(params![fmt_ts(&now)], category_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(categories)
        })
        .await
    }

    async fn insert_task(&self, task: &Task) -> Result<(), MarketError> {
        let task = task.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let category_exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM categories WHERE id = ?1)",
                params![task.category_id.to_string()],
                |row| row.get(0),
            )?;
            if !category_exists {
                return Err(MarketError::NotFound("category"));
            }
            tx.execute(
                "INSERT INTO tasks (id, category_id, admin_id, title, description, difficulty,
                                    reward_cents, external_link, auxiliary_text, is_active,
                                    expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    task.id.to_string(),
                    task.category_id.to_string(),
                    task.admin_id.to_string(),
                    task.title,
                    task.description,
                    task.difficulty.as_str(),
                    to_i64(task.reward_cents)?,
                    task.external_link,
                    task.auxiliary_text,
                    task.is_active,
                    fmt_ts(&task.expires_at),
                    fmt_ts(&task.created_at),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, MarketError> {
        self.with_conn(move |conn| load_task(conn, id)).await
    }

    async fn update_task_availability(
        &self,
        id: Uuid,
        is_active: bool,
        expires_at: DateTime<Utc>,
    ) -> Result<Task, MarketError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE tasks SET is_active = ?2, expires_at = ?3 WHERE id = ?1",
                params![id.to_string(), is_active, fmt_ts(&expires_at)],
            )?;
            if updated == 0 {
                return Err(MarketError::NotFound("task"));
            }
            let task = load_task(&tx, id)?.ok_or(MarketError::NotFound("task"))?;
            tx.commit()?;
            Ok(task)
        })
        .await
    }

    async fn list_available_tasks(
        &self,
        category_id: Option<Uuid>,
        now: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Task>, MarketError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM tasks t
                 WHERE t.is_active = 1 AND t.expires_at > ?1
                   AND (?2 IS NULL OR t.category_id = ?2)
                   AND NOT EXISTS (SELECT 1 FROM user_tasks ut WHERE ut.task_id = t.id)
                 ORDER BY t.created_at DESC, t.id DESC
                 LIMIT ?3 OFFSET ?4",
                TASK_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map(
                    params![
                        fmt_ts(&now),
                        category_id.map(|id| id.to_string()),
                        to_sql_count(limit),
                        to_sql_count(offset)
                    ],
                    task_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
        .await
    }

    async fn count_available_tasks(
        &self,
        category_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<usize, MarketError> {
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks t
                 WHERE t.is_active = 1 AND t.expires_at > ?1
                   AND (?2 IS NULL OR t.category_id = ?2)
                   AND NOT EXISTS (SELECT 1 FROM user_tasks ut WHERE ut.task_id = t.id)",
                params![fmt_ts(&now), category_id.map(|id| id.to_string())],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as usize)
        })
        .await
    }

    async fn create_claim(
        &self,
        user_id: Uuid,
        task_id: Uuid,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Claim, MarketError> {
        self.with_conn(move |conn| {
            // IMMEDIATE takes the write lock up front, so no other connection can
            // slip a claim in between our checks and our insert.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let active = load_active_claim(&tx, user_id)?;
            let task_claimed: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM user_tasks WHERE task_id = ?1)",
                params![task_id.to_string()],
                |row| row.get(0),
            )?;
            let task = load_task(&tx, task_id)?;
            lifecycle::check_claim(active.as_ref(), task_claimed, task.as_ref(), now)?;

            let claim = lifecycle::open_claim(user_id, task_id, now, window);
            tx.execute(
                "INSERT INTO user_tasks (id, user_id, task_id, status, taken_at, expires_at,
                                         payment_status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?5)",
                params![
                    claim.id.to_string(),
                    claim.user_id.to_string(),
                    claim.task_id.to_string(),
                    claim.status.as_str(),
                    fmt_ts(&claim.taken_at),
                    fmt_ts(&claim.expires_at),
                    claim.payment_status.as_str(),
                ],
            )
            .map_err(classify_insert_error)?;
            tx.commit()?;
            Ok(claim)
        })
        .await
    }

    async fn get_claim(&self, id: Uuid) -> Result<Option<Claim>, MarketError> {
        self.with_conn(move |conn| load_claim(conn, id)).await
    }

    async fn find_claim(&self, user_id: Uuid, task_id: Uuid) -> Result<Option<Claim>, MarketError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM user_tasks ut WHERE ut.user_id = ?1 AND ut.task_id = ?2",
                CLAIM_COLUMNS
            );
            Ok(conn
                .query_row(
                    &sql,
                    params![user_id.to_string(), task_id.to_string()],
                    claim_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn active_claim(&self, user_id: Uuid) -> Result<Option<Claim>, MarketError> {
        self.with_conn(move |conn| load_active_claim(conn, user_id)).await
    }

    async fn transition_claim(
        &self,
        claim_id: Uuid,
        transition: ClaimTransition,
        now: DateTime<Utc>,
    ) -> Result<Claim, MarketError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut claim = load_claim(&tx, claim_id)?.ok_or(MarketError::NotFound("claim"))?;
            lifecycle::apply_transition(&mut claim, &transition, now)?;
            write_claim_state(&tx, &claim, now)?;
            tx.commit()?;
            Ok(claim)
        })
        .await
    }

    async fn finalize_claim(
        &self,
        claim_id: Uuid,
        verdict: Verdict,
        now: DateTime<Utc>,
    ) -> Result<(Claim, UserAccount), MarketError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut claim = load_claim(&tx, claim_id)?.ok_or(MarketError::NotFound("claim"))?;
            let task = load_task(&tx, claim.task_id)?.ok_or(MarketError::NotFound("task"))?;
            let mut user = load_user(&tx, claim.user_id)?.ok_or(MarketError::NotFound("user"))?;

            lifecycle::apply_verdict(&mut claim, &mut user, task.reward_cents, &verdict, now)?;

            write_claim_state(&tx, &claim, now)?;
            write_user_totals(&tx, &user)?;
            tx.commit()?;
            Ok((claim, user))
        })
        .await
    }

    async fn list_lapsed_claims(&self, now: DateTime<Utc>) -> Result<Vec<Claim>, MarketError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM user_tasks ut
                 WHERE ut.status IN ('taken', 'proof2_requested') AND ut.expires_at < ?1
                 ORDER BY ut.expires_at ASC",
                CLAIM_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let claims = stmt
                .query_map(params![fmt_ts(&now)], claim_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(claims)
        })
        .await
    }

    async fn list_paid_claims(
        &self,
        user_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PaidClaim>, MarketError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {}, t.title AS task_title, t.category_id AS task_category_id,
                        t.reward_cents AS task_reward_cents
                 FROM user_tasks ut JOIN tasks t ON t.id = ut.task_id
                 WHERE ut.user_id = ?1 AND ut.payment_status = 'success'
                 ORDER BY ut.completed_at DESC
                 LIMIT ?2 OFFSET ?3",
                CLAIM_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let paid = stmt
                .query_map(
                    params![user_id.to_string(), to_sql_count(limit), to_sql_count(offset)],
                    |row| {
                        Ok(PaidClaim {
                            claim: claim_from_row(row)?,
                            task_title: row.get("task_title")?,
                            category_id: get_uuid(row, "task_category_id")?,
                            reward_cents: get_cents(row, "task_reward_cents")?,
                        })
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(paid)
        })
        .await
    }

    async fn sum_paid_since(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<u64, MarketError> {
        self.with_conn(move |conn| {
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(t.reward_cents), 0)
                 FROM user_tasks ut JOIN tasks t ON t.id = ut.task_id
                 WHERE ut.user_id = ?1 AND ut.payment_status = 'success'
                   AND ut.completed_at >= ?2",
                params![user_id.to_string(), fmt_ts(&since)],
                |row| row.get(0),
            )?;
            Ok(total.max(0) as u64)
        })
        .await
    }

    async fn history_totals(&self, user_id: Uuid) -> Result<HistoryTotals, MarketError> {
        self.with_conn(move |conn| {
            let (successes, failures, earnings): (i64, i64, i64) = conn.query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN ut.status = 'completed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN ut.status = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN ut.payment_status = 'success' THEN t.reward_cents ELSE 0 END), 0)
                 FROM user_tasks ut JOIN tasks t ON t.id = ut.task_id
                 WHERE ut.user_id = ?1",
                params![user_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            Ok(HistoryTotals {
                successful_tasks_count: successes.max(0) as u64,
                failed_tasks_count: failures.max(0) as u64,
                total_earnings_cents: earnings.max(0) as u64,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_classify_constraint_messages() {
        assert_eq!(
            classify_constraint("UNIQUE constraint failed: user_tasks.task_id"),
            Some(MarketError::TaskAlreadyTaken)
        );
        assert_eq!(
            classify_constraint("UNIQUE constraint failed: user_tasks.user_id, user_tasks.task_id"),
            Some(MarketError::TaskAlreadyTaken)
        );
        assert_eq!(
            classify_constraint("UNIQUE constraint failed: user_tasks.user_id"),
            Some(MarketError::AlreadyHasActiveTask)
        );
        assert_eq!(classify_constraint("FOREIGN KEY constraint failed"), None);
    }

    #[test]
    fn test_timestamp_text_orders_like_time() {
        let a = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let b = a + Duration::nanoseconds(5);
        let c = a + Duration::seconds(1);
        assert!(fmt_ts(&a) < fmt_ts(&b));
        assert!(fmt_ts(&b) < fmt_ts(&c));
        assert_eq!(fmt_ts(&a).len(), fmt_ts(&b).len());
    }

    async fn seed(store: &SqliteMarketStore, now: DateTime<Utc>) -> (Task, Vec<UserAccount>) {
        let admin = UserAccount::new("admin", Role::Admin, now);
        store.insert_user(&admin).await.unwrap();
        let category = Category {
            id: Uuid::new_v4(),
            admin_id: admin.id,
            name: "Groups".to_string(),
            description: None,
            is_active: true,
            is_premium: false,
            expires_at: None,
            created_at: now,
        };
        store.insert_category(&category).await.unwrap();
        let task = Task {
            id: Uuid::new_v4(),
            category_id: category.id,
            admin_id: admin.id,
            title: "hot".to_string(),
            description: "race me".to_string(),
            difficulty: Difficulty::Hard,
            reward_cents: 1000,
            external_link: "https://chat.example/hot".to_string(),
            auxiliary_text: None,
            is_active: true,
            expires_at: now + Duration::hours(1),
            created_at: now,
        };
        store.insert_task(&task).await.unwrap();
        let mut users = Vec::new();
        for i in 0..8 {
            let user = UserAccount::new(format!("racer-{}", i), Role::User, now);
            store.insert_user(&user).await.unwrap();
            users.push(user);
        }
        (task, users)
    }

    /// Separate connections to one database file still admit a single winner.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_grab_race_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let first = Arc::new(SqliteMarketStore::new(dir.path().to_path_buf()).await.unwrap());
        let (task, users) = seed(&first, now).await;
        let second = Arc::new(SqliteMarketStore::new(dir.path().to_path_buf()).await.unwrap());

        let attempts = users.iter().enumerate().map(|(i, user)| {
            let store = if i % 2 == 0 {
                Arc::clone(&first)
            } else {
                Arc::clone(&second)
            };
            let user_id = user.id;
            let task_id = task.id;
            tokio::spawn(async move {
                store
                    .create_claim(user_id, task_id, now, Duration::minutes(10))
                    .await
            })
        });
        let results: Vec<_> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(MarketError::TaskAlreadyTaken))));
    }

    #[tokio::test]
    async fn test_unique_index_backstops_direct_insert() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let store = SqliteMarketStore::new(dir.path().to_path_buf()).await.unwrap();
        let (task, users) = seed(&store, now).await;
        store
            .create_claim(users[0].id, task.id, now, Duration::minutes(10))
            .await
            .unwrap();

        // Bypass the transactional checks and hit the index directly.
        let second_user = users[1].id;
        let err = store
            .with_conn(move |conn| {
                let claim = lifecycle::open_claim(second_user, task.id, now, Duration::minutes(10));
                conn.execute(
                    "INSERT INTO user_tasks (id, user_id, task_id, status, taken_at, expires_at,
                                             payment_status, updated_at)
                     VALUES (?1, ?2, ?3, 'taken', ?4, ?5, 'pending', ?4)",
                    params![
                        claim.id.to_string(),
                        claim.user_id.to_string(),
                        claim.task_id.to_string(),
                        fmt_ts(&claim.taken_at),
                        fmt_ts(&claim.expires_at),
                    ],
                )
                .map_err(classify_insert_error)?;
                Ok(())
            })
            .await;
        assert_eq!(err, Err(MarketError::TaskAlreadyTaken));
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let task = {
            let store = SqliteMarketStore::new(dir.path().to_path_buf()).await.unwrap();
            let (task, users) = seed(&store, now).await;
            store
                .create_claim(users[0].id, task.id, now, Duration::minutes(10))
                .await
                .unwrap();
            task
        };
        let store = SqliteMarketStore::new(dir.path().to_path_buf()).await.unwrap();
        assert!(store.is_persistent());
        assert_eq!(store.get_task(task.id).await.unwrap(), Some(task));
        assert_eq!(store.count_available_tasks(None, now).await.unwrap(), 0);
    }
}
