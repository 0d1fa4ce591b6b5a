use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::Inserted;
use super::schema;
use crate::crypto::random_bytes;
use crate::error::{Error, Result};
use crate::janitor::Sweeper;

/// Fresh identifiers are retried this many times on a unique-constraint hit.
const INSERT_ATTEMPTS: usize = 3;

/// `dt_limit` text format. Lexicographic order matches time order.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Result of redeeming an access key.
#[derive(Debug, PartialEq)]
pub enum GetResult {
    /// View counted; the record has views left.
    Value(Vec<u8>),
    /// Final view; the record was deleted in the same transaction.
    Burned(Vec<u8>),
    /// Unknown, expired or already consumed.
    NotFound,
}

impl GetResult {
    pub fn into_ciphertext(self) -> Option<Vec<u8>> {
        match self {
            GetResult::Value(data) | GetResult::Burned(data) => Some(data),
            GetResult::NotFound => None,
        }
    }
}

/// Thread-safe handle to the SQLite store.
///
/// A single connection sits behind a mutex, so every transaction runs alone
/// and callers queue instead of contending for the file lock.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and bring the schema up to date.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite database {}", path.display()))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "sqlite journal mode");
        Self::init(conn)
    }

    /// Private in-memory database, for tests and throwaway instances.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory sqlite")?)
    }

    fn init(mut conn: Connection) -> anyhow::Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::migrations()
            .to_latest(&mut conn)
            .context("run schema migrations")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Store `ciphertext` for at most `view_limit` reads within `lifetime`.
    pub fn insert(&self, ciphertext: &[u8], view_limit: u32, lifetime: Duration) -> Result<Inserted> {
        self.insert_at(ciphertext, view_limit, lifetime, Utc::now(), &CancellationToken::new())
    }

    /// [`insert`](Self::insert) on behalf of a request that may be abandoned.
    /// Once `cancel` fires nothing is committed and `Error::Timeout` is
    /// returned.
    pub fn insert_cancellable(
        &self,
        ciphertext: &[u8],
        view_limit: u32,
        lifetime: Duration,
        cancel: &CancellationToken,
    ) -> Result<Inserted> {
        self.insert_at(ciphertext, view_limit, lifetime, Utc::now(), cancel)
    }

    pub fn insert_at(
        &self,
        ciphertext: &[u8],
        view_limit: u32,
        lifetime: Duration,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Inserted> {
        self.insert_with(ciphertext, view_limit, lifetime, now, cancel, || {
            Ok((new_id()?, new_id()?))
        })
    }

    fn insert_with<F>(
        &self,
        ciphertext: &[u8],
        view_limit: u32,
        lifetime: Duration,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        mut ids: F,
    ) -> Result<Inserted>
    where
        F: FnMut() -> Result<(Uuid, Uuid)>,
    {
        let lifetime = chrono::Duration::from_std(lifetime)
            .map_err(|_| Error::MalformedInput("lifetime out of range"))?;
        let expires_at = now + lifetime;
        let view_limit = view_limit.max(1);

        let mut conn = self.conn.lock();
        for attempt in 1..=INSERT_ATTEMPTS {
            let (access_key, deletion_key) = ids()?;
            ensure_live(cancel)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_live(cancel)?;
            let res = tx.execute(
                r#"INSERT INTO "denote" ("key", "data", "view_limit", "dt_limit", "rm_key")
                   VALUES (?1, ?2, ?3, ?4, ?5)"#,
                params![
                    access_key,
                    ciphertext,
                    view_limit,
                    timestamp(expires_at),
                    deletion_key
                ],
            );
            match res {
                Ok(_) => {
                    ensure_live(cancel)?;
                    tx.commit()?;
                    debug!(view_limit, expires_at = %expires_at, "stored secret");
                    return Ok(Inserted {
                        access_key,
                        deletion_key,
                        expires_at,
                    });
                }
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    warn!(attempt, "identifier collision on insert, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Conflict(INSERT_ATTEMPTS))
    }

    /// Redeem one view of the record behind `access_key`.
    ///
    /// Select, increment and conditional delete run in one IMMEDIATE
    /// transaction. The ciphertext is read before any mutation, so the final
    /// permitted reader still gets it while the row disappears.
    pub fn get(&self, access_key: &Uuid) -> Result<GetResult> {
        self.get_at(access_key, Utc::now(), &CancellationToken::new())
    }

    /// [`get`](Self::get) on behalf of a request that may be abandoned. A
    /// cancelled read rolls back and leaves the view count untouched.
    pub fn get_cancellable(&self, access_key: &Uuid, cancel: &CancellationToken) -> Result<GetResult> {
        self.get_at(access_key, Utc::now(), cancel)
    }

    pub fn get_at(
        &self,
        access_key: &Uuid,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<GetResult> {
        let mut conn = self.conn.lock();
        ensure_live(cancel)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_live(cancel)?;

        let row = tx
            .query_row(
                r#"SELECT "data", "view_count", "view_limit"
                   FROM "denote"
                   WHERE "key" = ?1 AND ?2 < "dt_limit""#,
                params![access_key, timestamp(now)],
                |r| {
                    Ok((
                        r.get::<_, Vec<u8>>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((data, view_count, view_limit)) = row else {
            return Ok(GetResult::NotFound);
        };

        let view_count = view_count + 1;
        let result = if view_count < view_limit {
            tx.execute(
                r#"UPDATE "denote" SET "view_count" = ?1 WHERE "key" = ?2"#,
                params![view_count, access_key],
            )?;
            GetResult::Value(data)
        } else {
            tx.execute(r#"DELETE FROM "denote" WHERE "key" = ?1"#, params![access_key])?;
            debug!("burned after final view");
            GetResult::Burned(data)
        };
        ensure_live(cancel)?;
        tx.commit()?;
        Ok(result)
    }

    /// Delete the record owning `deletion_key`. Returns true if it existed.
    pub fn delete(&self, deletion_key: &Uuid) -> Result<bool> {
        self.delete_cancellable(deletion_key, &CancellationToken::new())
    }

    pub fn delete_cancellable(&self, deletion_key: &Uuid, cancel: &CancellationToken) -> Result<bool> {
        let mut conn = self.conn.lock();
        ensure_live(cancel)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_live(cancel)?;
        let removed = tx.execute(
            r#"DELETE FROM "denote" WHERE "rm_key" = ?1"#,
            params![deletion_key],
        )?;
        ensure_live(cancel)?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Remove every record whose expiry is at or before `now`, whatever its
    /// view count. Returns the number of rows removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            r#"DELETE FROM "denote" WHERE "dt_limit" <= ?1"#,
            params![timestamp(now)],
        )?;
        if removed > 0 {
            info!(removed, "swept expired secrets");
        }
        Ok(removed)
    }

    /// Number of stored records, expired-but-unswept ones included.
    #[cfg(test)]
    fn len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(r#"SELECT COUNT(*) FROM "denote""#, [], |r| r.get(0))?;
        Ok(n as usize)
    }

    #[cfg(test)]
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Cheap liveness check for `/health`.
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
        Ok(())
    }
}

impl Sweeper for Store {
    fn sweep_expired(&self) -> Result<usize> {
        self.sweep(Utc::now())
    }
}

/// Abandoned requests must not start or commit a transaction.
fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Timeout);
    }
    Ok(())
}

fn new_id() -> Result<Uuid> {
    Ok(uuid::Builder::from_random_bytes(random_bytes()?).into_uuid())
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn uncancelled() -> CancellationToken {
        CancellationToken::new()
    }

    const HOUR: Duration = Duration::from_secs(3600);

    fn make_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    #[test]
    fn insert_get_burn() {
        let (s, _dir) = make_store();
        let ins = s.insert(b"ciphertext", 1, HOUR).unwrap();
        assert_ne!(ins.access_key, ins.deletion_key);
        assert_eq!(ins.access_key.get_version_num(), 4);
        assert_eq!(ins.deletion_key.get_version_num(), 4);

        assert_eq!(
            s.get(&ins.access_key).unwrap(),
            GetResult::Burned(b"ciphertext".to_vec())
        );
        assert_eq!(s.get(&ins.access_key).unwrap(), GetResult::NotFound);
        assert!(s.is_empty().unwrap());
    }

    #[test]
    fn exactly_view_limit_reads_succeed() {
        let (s, _dir) = make_store();
        let ins = s.insert(b"ct", 3, HOUR).unwrap();
        assert_eq!(s.get(&ins.access_key).unwrap(), GetResult::Value(b"ct".to_vec()));
        assert_eq!(s.get(&ins.access_key).unwrap(), GetResult::Value(b"ct".to_vec()));
        assert_eq!(s.get(&ins.access_key).unwrap(), GetResult::Burned(b"ct".to_vec()));
        assert_eq!(s.get(&ins.access_key).unwrap(), GetResult::NotFound);
    }

    #[test]
    fn concurrent_reads_never_exceed_limit() {
        let (s, _dir) = make_store();
        let limit = 4;
        let ins = s.insert(b"shared", limit, HOUR).unwrap();

        let successes = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..=limit)
                .map(|_| {
                    let s = s.clone();
                    let key = ins.access_key;
                    scope.spawn(move || s.get(&key).unwrap().into_ciphertext())
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .inspect(|ct| assert_eq!(ct, b"shared"))
                .count()
        });

        assert_eq!(successes, limit as usize);
        assert_eq!(s.get(&ins.access_key).unwrap(), GetResult::NotFound);
    }

    #[test]
    fn expired_record_is_not_found_before_sweep() {
        let (s, _dir) = make_store();
        let created = Utc::now() - chrono::Duration::hours(2);
        let ins = s.insert_at(b"old", 5, HOUR, created, &uncancelled()).unwrap();
        assert_eq!(s.get(&ins.access_key).unwrap(), GetResult::NotFound);
        // still on disk until the sweep runs
        assert_eq!(s.len().unwrap(), 1);
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        let (s, _dir) = make_store();
        let now = Utc::now();
        let ins = s.insert_at(b"edge", 5, HOUR, now, &uncancelled()).unwrap();
        assert_eq!(
            s.get_at(&ins.access_key, ins.expires_at, &uncancelled()).unwrap(),
            GetResult::NotFound
        );
        assert!(matches!(
            s.get_at(
                &ins.access_key,
                ins.expires_at - chrono::Duration::seconds(1),
                &uncancelled()
            )
            .unwrap(),
            GetResult::Value(_)
        ));
    }

    #[test]
    fn sweep_removes_only_expired_and_is_idempotent() {
        let (s, _dir) = make_store();
        let now = Utc::now();
        let old = s
            .insert_at(b"a", 3, HOUR, now - chrono::Duration::hours(2), &uncancelled())
            .unwrap();
        let edge = s
            .insert_at(b"b", 3, HOUR, now - chrono::Duration::hours(1), &uncancelled())
            .unwrap();
        let live = s.insert_at(b"c", 3, HOUR, now, &uncancelled()).unwrap();

        assert_eq!(s.sweep(now).unwrap(), 2);
        assert_eq!(s.sweep(now).unwrap(), 0);
        assert_eq!(s.len().unwrap(), 1);

        assert_eq!(s.get_at(&old.access_key, now, &uncancelled()).unwrap(), GetResult::NotFound);
        assert_eq!(s.get_at(&edge.access_key, now, &uncancelled()).unwrap(), GetResult::NotFound);
        assert!(matches!(
            s.get_at(&live.access_key, now, &uncancelled()).unwrap(),
            GetResult::Value(_)
        ));
    }

    #[test]
    fn delete_by_deletion_key() {
        let (s, _dir) = make_store();
        let ins = s.insert(b"x", 2, HOUR).unwrap();
        // the access key is not a deletion capability
        assert!(!s.delete(&ins.access_key).unwrap());
        assert!(s.delete(&ins.deletion_key).unwrap());
        assert_eq!(s.get(&ins.access_key).unwrap(), GetResult::NotFound);
        assert!(!s.delete(&ins.deletion_key).unwrap());
    }

    #[test]
    fn collision_is_retried_with_fresh_ids() {
        let (s, _dir) = make_store();
        let first = s.insert(b"one", 1, HOUR).unwrap();

        let mut calls = 0;
        let ins = s
            .insert_with(b"two", 1, HOUR, Utc::now(), &uncancelled(), || {
                calls += 1;
                if calls == 1 {
                    Ok((first.access_key, Uuid::new_v4()))
                } else {
                    Ok((Uuid::new_v4(), Uuid::new_v4()))
                }
            })
            .unwrap();
        assert_eq!(calls, 2);
        assert_ne!(ins.access_key, first.access_key);
        assert_eq!(s.len().unwrap(), 2);
    }

    #[test]
    fn persistent_collision_gives_up() {
        let (s, _dir) = make_store();
        let first = s.insert(b"one", 1, HOUR).unwrap();
        let res = s.insert_with(b"two", 1, HOUR, Utc::now(), &uncancelled(), || {
            Ok((Uuid::new_v4(), first.deletion_key))
        });
        assert!(matches!(res, Err(Error::Conflict(INSERT_ATTEMPTS))));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reopen.db");
        let ins = Store::open(&path).unwrap().insert(b"persist", 1, HOUR).unwrap();
        let s = Store::open(&path).unwrap();
        assert_eq!(
            s.get(&ins.access_key).unwrap(),
            GetResult::Burned(b"persist".to_vec())
        );
    }

    #[test]
    fn cancelled_read_leaves_view_count() {
        let (s, _dir) = make_store();
        let ins = s.insert(b"once", 1, HOUR).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            s.get_cancellable(&ins.access_key, &cancel),
            Err(Error::Timeout)
        ));
        assert_eq!(
            s.get(&ins.access_key).unwrap(),
            GetResult::Burned(b"once".to_vec())
        );
    }

    #[test]
    fn cancelled_insert_and_delete_change_nothing() {
        let (s, _dir) = make_store();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            s.insert_cancellable(b"x", 1, HOUR, &cancel),
            Err(Error::Timeout)
        ));
        assert!(s.is_empty().unwrap());

        let ins = s.insert(b"kept", 1, HOUR).unwrap();
        assert!(matches!(
            s.delete_cancellable(&ins.deletion_key, &cancel),
            Err(Error::Timeout)
        ));
        assert_eq!(s.len().unwrap(), 1);
    }

    #[test]
    fn read_cancelled_while_waiting_for_lock_rolls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locked.db");
        let s = Store::open(&path).unwrap();
        let ins = s.insert(b"guarded", 1, HOUR).unwrap();

        // a second connection holds the write lock
        let other = Connection::open(&path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE").unwrap();

        let cancel = CancellationToken::new();
        let reader = {
            let s = s.clone();
            let cancel = cancel.clone();
            let key = ins.access_key;
            std::thread::spawn(move || s.get_cancellable(&key, &cancel))
        };
        std::thread::sleep(Duration::from_millis(100));
        cancel.cancel();
        std::thread::sleep(Duration::from_millis(100));
        other.execute_batch("COMMIT").unwrap();

        assert!(matches!(reader.join().unwrap(), Err(Error::Timeout)));
        assert_eq!(
            s.get(&ins.access_key).unwrap(),
            GetResult::Burned(b"guarded".to_vec())
        );
    }

    #[test]
    fn in_memory_store_works() {
        let s = Store::open_in_memory().unwrap();
        s.ping().unwrap();
        let ins = s.insert(b"mem", 1, HOUR).unwrap();
        assert!(s.get(&ins.access_key).unwrap().into_ciphertext().is_some());
    }
}
