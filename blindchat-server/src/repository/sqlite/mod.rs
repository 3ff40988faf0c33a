//! SQLite implementation of `UserRepository`.
//!
//! Records survive restarts; sessions do not (see `reset_sessions`).
//!
//! # Schema Versioning
//!
//! The `schema_version` table tracks the applied schema. To change the
//! schema, increment `CURRENT_SCHEMA_VERSION` and add a step to
//! `run_migrations()`. Steps run in order from the stored version.
//!
//! # Atomicity
//!
//! Compound operations run inside an IMMEDIATE transaction, which takes the
//! write lock up front so a concurrent writer cannot slip in between the
//! read and the write.


use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use blindchat_core::{transition, AccountId, ActivePairing, MessageRef, StatusEvent, UserStatus};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::warn;

use super::{
    CoupleOutcome, CreateOutcome, PairingCheck, RepositoryError, UserRecord, UserRepository,
};

/// Current schema version.
const CURRENT_SCHEMA_VERSION: i64 = 2;

/// SQLite-backed user repository.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite calls
/// without blocking the async runtime.
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// The database is configured with `journal_mode = WAL`,
    /// `synchronous = FULL` and `busy_timeout = 5000ms`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RepositoryError::storage(
                        "create database directory",
                        format!("{}: {}", parent.display(), e),
                    )
                })?;
                restrict_permissions(parent, 0o700);
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        if !is_in_memory && !path_str.is_empty() {
            restrict_permissions(path_ref, 0o600);
        }

        // SQLite silently stays in DELETE mode on filesystems without shared
        // memory support, so the mode actually applied has to be checked.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!("SQLite returned '{}' instead of 'wal'", journal_mode),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure database", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new in-memory SQLite repository (for testing).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "database schema version {} is newer than supported version {}",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }
        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    user_id INTEGER PRIMARY KEY,
                    status TEXT NOT NULL DEFAULT 'idle'
                        CHECK (status IN ('idle', 'in_search', 'coupled', 'partner_left')),
                    partner_id INTEGER,
                    search_seq INTEGER
                );

                CREATE INDEX IF NOT EXISTS idx_users_waiting
                    ON users(search_seq) WHERE status = 'in_search';
                CREATE INDEX IF NOT EXISTS idx_users_partner
                    ON users(partner_id) WHERE partner_id IS NOT NULL;
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        if from_version < 2 {
            // Message id in the user's chat where their latest search began.
            conn.execute_batch("ALTER TABLE users ADD COLUMN thread_floor INTEGER;")
                .map_err(|e| RepositoryError::storage("migration v2", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| RepositoryError::storage(operation, "connection mutex poisoned"))?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        warn!(
            "Failed to set restrictive permissions on {}: {}",
            path.display(),
            e
        );
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) {}

// =============================================================================
// Row helpers
// =============================================================================

/// Convert an account id to i64 for SQLite storage.
fn account_to_i64(id: AccountId, operation: &'static str) -> Result<i64, RepositoryError> {
    i64::try_from(id.0).map_err(|_| {
        RepositoryError::storage(
            operation,
            format!("account id {} exceeds maximum storable value", id),
        )
    })
}

/// Convert a stored i64 back to an account id.
fn i64_to_account(value: i64) -> Result<AccountId, RepositoryError> {
    u64::try_from(value)
        .map(AccountId)
        .map_err(|_| RepositoryError::corruption(format!("negative account id {}", value)))
}

fn i64_to_count(value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| RepositoryError::corruption(format!("row count {}", value)))
}

fn sql_error(operation: &'static str) -> impl Fn(rusqlite::Error) -> RepositoryError {
    move |e| RepositoryError::storage(operation, e.to_string())
}

fn read_record(
    conn: &Connection,
    id: AccountId,
    operation: &'static str,
) -> Result<Option<UserRecord>, RepositoryError> {
    let raw_id = account_to_i64(id, operation)?;
    let row: Option<(String, Option<i64>)> = conn
        .query_row(
            "SELECT status, partner_id FROM users WHERE user_id = ?1",
            params![raw_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(sql_error(operation))?;

    let Some((status, partner)) = row else {
        return Ok(None);
    };
    let status: UserStatus = status
        .parse()
        .map_err(|e| RepositoryError::corruption(format!("status of user {}: {}", id, e)))?;
    let partner = partner.map(i64_to_account).transpose()?;

    Ok(Some(UserRecord {
        id,
        status,
        partner,
    }))
}

/// Write a status, keeping the waiting order in step.
fn write_status(
    conn: &Connection,
    id: AccountId,
    current: UserStatus,
    status: UserStatus,
    operation: &'static str,
) -> Result<(), RepositoryError> {
    let raw_id = account_to_i64(id, operation)?;
    let sql = match (current, status) {
        (UserStatus::InSearch, UserStatus::InSearch) => return Ok(()),
        (_, UserStatus::InSearch) => {
            "UPDATE users
             SET status = ?2,
                 search_seq = (SELECT COALESCE(MAX(search_seq), 0) + 1 FROM users)
             WHERE user_id = ?1"
        }
        _ => "UPDATE users SET status = ?2, search_seq = NULL WHERE user_id = ?1",
    };
    conn.execute(sql, params![raw_id, status.as_str()])
        .map_err(sql_error(operation))?;
    Ok(())
}

fn write_partner(
    conn: &Connection,
    id: AccountId,
    partner: Option<AccountId>,
    operation: &'static str,
) -> Result<(), RepositoryError> {
    let raw_id = account_to_i64(id, operation)?;
    let raw_partner = partner
        .map(|p| account_to_i64(p, operation))
        .transpose()?;
    conn.execute(
        "UPDATE users SET partner_id = ?2 WHERE user_id = ?1",
        params![raw_id, raw_partner],
    )
    .map_err(sql_error(operation))?;
    Ok(())
}

/// Mark `partner` as abandoned by `leaver`, if it still points back.
fn abandon(
    conn: &Connection,
    partner: AccountId,
    leaver: AccountId,
    operation: &'static str,
) -> Result<(), RepositoryError> {
    let Some(record) = read_record(conn, partner, operation)? else {
        return Ok(());
    };
    if record.partner != Some(leaver) {
        return Ok(());
    }
    let next = if record.status == UserStatus::Coupled {
        transition(record.status, StatusEvent::PartnerExited)?
    } else {
        record.status
    };
    write_partner(conn, partner, None, operation)?;
    write_status(conn, partner, record.status, next, operation)
}

fn read_thread_floor(
    conn: &Connection,
    id: AccountId,
    operation: &'static str,
) -> Result<Option<MessageRef>, RepositoryError> {
    let raw_id = account_to_i64(id, operation)?;
    let floor: Option<Option<i64>> = conn
        .query_row(
            "SELECT thread_floor FROM users WHERE user_id = ?1",
            params![raw_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql_error(operation))?;
    floor
        .flatten()
        .map(|raw| {
            i32::try_from(raw).map(MessageRef).map_err(|_| {
                RepositoryError::corruption(format!("thread floor {} of user {}", raw, id))
            })
        })
        .transpose()
}

fn is_available(record: Option<&UserRecord>) -> bool {
    record.is_some_and(|r| r.status == UserStatus::InSearch && r.partner.is_none())
}

// =============================================================================
// UserRepository trait implementation
// =============================================================================

#[async_trait]
impl UserRepository for SqliteRepository {
    async fn create(&self, id: AccountId) -> Result<CreateOutcome, RepositoryError> {
        let raw_id = account_to_i64(id, "create")?;
        self.with_conn("create", move |conn| {
            let inserted = conn
                .execute(
                    "INSERT INTO users (user_id, status) VALUES (?1, 'idle')
                     ON CONFLICT(user_id) DO NOTHING",
                    params![raw_id],
                )
                .map_err(sql_error("create"))?;
            Ok(if inserted == 1 {
                CreateOutcome::Created
            } else {
                CreateOutcome::AlreadyExists
            })
        })
        .await
    }

    async fn get(&self, id: AccountId) -> Result<Option<UserRecord>, RepositoryError> {
        self.with_conn("get", move |conn| read_record(conn, id, "get"))
            .await
    }

    async fn get_status(&self, id: AccountId) -> Result<UserStatus, RepositoryError> {
        self.get(id)
            .await?
            .map(|r| r.status)
            .ok_or(RepositoryError::NotFound(id))
    }

    async fn set_status(&self, id: AccountId, status: UserStatus) -> Result<(), RepositoryError> {
        self.with_conn("set_status", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error("set_status"))?;
            let record =
                read_record(&tx, id, "set_status")?.ok_or(RepositoryError::NotFound(id))?;
            write_status(&tx, id, record.status, status, "set_status")?;
            tx.commit().map_err(sql_error("set_status"))
        })
        .await
    }

    async fn begin_search(&self, id: AccountId, since: MessageRef) -> Result<(), RepositoryError> {
        self.with_conn("begin_search", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error("begin_search"))?;
            let record =
                read_record(&tx, id, "begin_search")?.ok_or(RepositoryError::NotFound(id))?;
            let next = transition(record.status, StatusEvent::SearchRequested)?;
            write_status(&tx, id, record.status, next, "begin_search")?;
            tx.execute(
                "UPDATE users SET thread_floor = ?2 WHERE user_id = ?1",
                params![account_to_i64(id, "begin_search")?, since.0],
            )
            .map_err(sql_error("begin_search"))?;
            tx.commit().map_err(sql_error("begin_search"))
        })
        .await
    }

    async fn check_pairing(&self, id: AccountId) -> Result<PairingCheck, RepositoryError> {
        self.with_conn("check_pairing", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error("check_pairing"))?;
            let Some(record) = read_record(&tx, id, "check_pairing")? else {
                return Ok(PairingCheck::Unpaired);
            };

            match record.partner {
                Some(partner) if record.status == UserStatus::Coupled => {
                    let points_back = read_record(&tx, partner, "check_pairing")?.is_some_and(
                        |p| p.status == UserStatus::Coupled && p.partner == Some(id),
                    );
                    if points_back {
                        let since = read_thread_floor(&tx, id, "check_pairing")?;
                        return Ok(PairingCheck::Active(ActivePairing::new(partner, since)));
                    }
                }
                None if record.status != UserStatus::Coupled => {
                    return Ok(PairingCheck::Unpaired);
                }
                _ => {}
            }

            if let Some(partner) = record.partner {
                abandon(&tx, partner, id, "check_pairing")?;
            }
            write_partner(&tx, id, None, "check_pairing")?;
            if record.status == UserStatus::Coupled {
                let idle = transition(record.status, StatusEvent::ExitRequested)?;
                write_status(&tx, id, record.status, idle, "check_pairing")?;
            }
            tx.commit().map_err(sql_error("check_pairing"))?;
            Ok(PairingCheck::Repaired(record))
        })
        .await
    }

    async fn get_partner(&self, id: AccountId) -> Result<Option<AccountId>, RepositoryError> {
        Ok(self.get(id).await?.and_then(|r| r.partner))
    }

    async fn set_pairing(&self, a: AccountId, b: AccountId) -> Result<(), RepositoryError> {
        if a == b {
            return Err(RepositoryError::SelfPairing(a));
        }
        self.with_conn("set_pairing", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error("set_pairing"))?;
            for (id, other) in [(a, b), (b, a)] {
                let record =
                    read_record(&tx, id, "set_pairing")?.ok_or(RepositoryError::NotFound(id))?;
                if record.partner.is_some_and(|p| p != other) {
                    return Err(RepositoryError::AlreadyPaired(id));
                }
            }
            write_partner(&tx, a, Some(b), "set_pairing")?;
            write_partner(&tx, b, Some(a), "set_pairing")?;
            tx.commit().map_err(sql_error("set_pairing"))
        })
        .await
    }

    async fn clear_pairing(&self, id: AccountId) -> Result<Option<AccountId>, RepositoryError> {
        self.with_conn("clear_pairing", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error("clear_pairing"))?;
            let Some(partner) = read_record(&tx, id, "clear_pairing")?.and_then(|r| r.partner)
            else {
                return Ok(None);
            };
            write_partner(&tx, id, None, "clear_pairing")?;
            let points_back = read_record(&tx, partner, "clear_pairing")?
                .is_some_and(|r| r.partner == Some(id));
            if points_back {
                write_partner(&tx, partner, None, "clear_pairing")?;
            }
            tx.commit().map_err(sql_error("clear_pairing"))?;
            Ok(Some(partner))
        })
        .await
    }

    async fn delete(&self, id: AccountId) -> Result<Option<UserRecord>, RepositoryError> {
        self.with_conn("delete", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error("delete"))?;
            let Some(record) = read_record(&tx, id, "delete")? else {
                return Ok(None);
            };
            if let Some(partner) = record.partner {
                abandon(&tx, partner, id, "delete")?;
            }
            tx.execute(
                "DELETE FROM users WHERE user_id = ?1",
                params![account_to_i64(id, "delete")?],
            )
            .map_err(sql_error("delete"))?;
            tx.commit().map_err(sql_error("delete"))?;
            Ok(Some(record))
        })
        .await
    }

    async fn count_total(&self) -> Result<u64, RepositoryError> {
        self.with_conn("count_total", |conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
                .map_err(sql_error("count_total"))?;
            i64_to_count(count)
        })
        .await
    }

    async fn count_paired(&self) -> Result<u64, RepositoryError> {
        self.with_conn("count_paired", |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM users
                     WHERE status = 'coupled' AND partner_id IS NOT NULL
                       AND user_id < partner_id",
                    [],
                    |row| row.get(0),
                )
                .map_err(sql_error("count_paired"))?;
            i64_to_count(count)
        })
        .await
    }

    async fn next_waiting(&self, exclude: AccountId) -> Result<Option<AccountId>, RepositoryError> {
        let raw_exclude = account_to_i64(exclude, "next_waiting")?;
        self.with_conn("next_waiting", move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT user_id FROM users
                     WHERE status = 'in_search' AND user_id != ?1
                     ORDER BY search_seq ASC
                     LIMIT 1",
                    params![raw_exclude],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_error("next_waiting"))?;
            found.map(i64_to_account).transpose()
        })
        .await
    }

    async fn try_couple(
        &self,
        requester: AccountId,
        candidate: AccountId,
    ) -> Result<CoupleOutcome, RepositoryError> {
        self.with_conn("try_couple", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error("try_couple"))?;

            if !is_available(read_record(&tx, requester, "try_couple")?.as_ref()) {
                return Ok(CoupleOutcome::RequesterUnavailable);
            }
            if candidate == requester
                || !is_available(read_record(&tx, candidate, "try_couple")?.as_ref())
            {
                return Ok(CoupleOutcome::CandidateUnavailable);
            }

            let coupled = transition(UserStatus::InSearch, StatusEvent::Matched)?;
            for (id, other) in [(requester, candidate), (candidate, requester)] {
                write_partner(&tx, id, Some(other), "try_couple")?;
                write_status(&tx, id, UserStatus::InSearch, coupled, "try_couple")?;
            }
            tx.commit().map_err(sql_error("try_couple"))?;
            Ok(CoupleOutcome::Paired)
        })
        .await
    }

    async fn end_pairing(&self, leaver: AccountId) -> Result<Option<AccountId>, RepositoryError> {
        self.with_conn("end_pairing", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error("end_pairing"))?;
            let Some(record) = read_record(&tx, leaver, "end_pairing")? else {
                return Ok(None);
            };
            if record.status != UserStatus::Coupled {
                return Ok(None);
            }

            let idle = transition(record.status, StatusEvent::ExitRequested)?;
            if let Some(partner) = record.partner {
                abandon(&tx, partner, leaver, "end_pairing")?;
            }
            write_partner(&tx, leaver, None, "end_pairing")?;
            write_status(&tx, leaver, record.status, idle, "end_pairing")?;
            tx.commit().map_err(sql_error("end_pairing"))?;
            Ok(record.partner)
        })
        .await
    }

    async fn reset_sessions(&self) -> Result<u64, RepositoryError> {
        self.with_conn("reset_sessions", |conn| {
            let changed = conn
                .execute(
                    "UPDATE users
                     SET status = 'idle', partner_id = NULL, search_seq = NULL, thread_floor = NULL
                     WHERE status != 'idle' OR partner_id IS NOT NULL OR search_seq IS NOT NULL",
                    [],
                )
                .map_err(sql_error("reset_sessions"))?;
            Ok(changed as u64)
        })
        .await
    }
}
