use super::{CheckpointError, Result};
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use std::process::Command;
        Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Extract the owner PID from a DuckDB lock error ("... (PID 12345) ...").
fn extract_pid_from_lock_error(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + "(PID ".len();
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

fn wal_path(db_path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.wal", db_path.display()))
}

fn remove_lock_files(db_path: &Path) -> std::io::Result<()> {
    let wal = wal_path(db_path);
    let lock = PathBuf::from(format!("{}.lock", db_path.display()));

    if wal.exists() {
        std::fs::remove_file(&wal)?;
        info!(path = %wal.display(), "removed stale checkpoint WAL file");
    }
    if lock.exists() {
        std::fs::remove_file(&lock)?;
        info!(path = %lock.display(), "removed stale checkpoint lock file");
    }
    Ok(())
}

/// Open the database file, running one recovery pass when the first attempt
/// fails. Failure after recovery is returned to the caller.
fn open_with_recovery(path: &Path) -> Result<Connection> {
    let err = match Connection::open(path) {
        Ok(conn) => return Ok(conn),
        Err(e) => e,
    };
    let error_msg = err.to_string();

    if error_msg.contains("Could not set lock") {
        warn!(error = %error_msg, "checkpoint database lock detected");
        match extract_pid_from_lock_error(&error_msg) {
            Some(pid) if !is_process_running(pid) => {
                warn!(pid, "lock owner is not running, removing stale lock files");
            }
            Some(pid) => {
                error!(pid, "lock owner is still running, cannot open checkpoint store");
                return Err(err.into());
            }
            None => return Err(err.into()),
        }
    } else {
        // A torn write-ahead log is the common leftover of a killed agent.
        warn!(error = %error_msg, path = %path.display(), "checkpoint open failed, attempting recovery");
    }

    remove_lock_files(path)?;
    info!("retrying checkpoint database open after recovery");
    Ok(Connection::open(path)?)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS checkpoint (
            key VARCHAR PRIMARY KEY,
            value BLOB NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Process-wide durable map from composite key to opaque bytes.
///
/// Every call returns [`CheckpointError::NotInitialized`] until the store is
/// opened and after it is closed. Calls run on the blocking thread pool.
#[derive(Default)]
pub struct CheckpointStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl CheckpointStore {
    /// An unopened store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `<dir>/<file>`, creating the directory when missing.
    pub fn open_at(dir: impl AsRef<Path>, file: &str) -> Result<Self> {
        let store = Self::new();
        store.open(dir.as_ref().join(file), dir.as_ref())?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    fn open(&self, path: PathBuf, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let conn = open_with_recovery(&path)?;
        init_schema(&conn)?;
        *self.conn.lock().map_err(|_| CheckpointError::Poisoned)? = Some(conn);
        info!(path = %path.display(), "checkpoint store opened");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Close the underlying database. Later calls fail with `NotInitialized`.
    pub fn close(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| CheckpointError::Poisoned)?.take();
        if let Some(conn) = conn {
            if let Err((_, e)) = conn.close() {
                return Err(e.into());
            }
            info!("checkpoint store closed");
        }
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| CheckpointError::Poisoned)?;
            let conn = guard.as_ref().ok_or(CheckpointError::NotInitialized)?;
            f(conn)
        })
        .await?
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let key = key.to_string();
        let value = value.to_vec();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO checkpoint (key, value) VALUES (?, ?)",
                duckdb::params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    /// Returns `Ok(None)` when the key does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT value FROM checkpoint WHERE key = ?")?;
            let mut rows = stmt.query(duckdb::params![key])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get(0)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Delete one key. Deleting a missing key is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM checkpoint WHERE key = ?", duckdb::params![key])?;
            Ok(())
        })
        .await
    }

    pub async fn delete_many(&self, keys: Vec<String>) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("DELETE FROM checkpoint WHERE key = ?")?;
            let mut deleted = 0;
            for key in keys {
                deleted += stmt.execute(duckdb::params![key])?;
            }
            Ok(deleted)
        })
        .await
    }

    /// Every entry, ordered by key.
    pub async fn iterate(&self) -> Result<Vec<(String, Vec<u8>)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM checkpoint ORDER BY key")?;
            let mut rows = stmt.query([])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                entries.push((row.get(0)?, row.get(1)?));
            }
            Ok(entries)
        })
        .await
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM checkpoint ORDER BY key")?;
            let mut rows = stmt.query([])?;
            let mut keys = Vec::new();
            while let Some(row) = rows.next()? {
                keys.push(row.get(0)?);
            }
            Ok(keys)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = CheckpointStore::in_memory().unwrap();

        store.put("p^k1", b"v1").await.unwrap();
        assert_eq!(store.get("p^k1").await.unwrap(), Some(b"v1".to_vec()));

        store.put("p^k1", b"v2").await.unwrap();
        assert_eq!(store.get("p^k1").await.unwrap(), Some(b"v2".to_vec()));

        store.delete("p^k1").await.unwrap();
        assert_eq!(store.get("p^k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_iterate_is_ordered() {
        let store = CheckpointStore::in_memory().unwrap();
        store.put("b^x", b"2").await.unwrap();
        store.put("a^x", b"1").await.unwrap();

        let entries = store.iterate().await.unwrap();
        assert_eq!(
            entries,
            vec![
                ("a^x".to_string(), b"1".to_vec()),
                ("b^x".to_string(), b"2".to_vec())
            ]
        );
    }

    #[tokio::test]
    async fn test_not_initialized() {
        let store = CheckpointStore::new();
        assert!(matches!(
            store.get("p^k").await,
            Err(CheckpointError::NotInitialized)
        ));

        let store = CheckpointStore::in_memory().unwrap();
        store.close().unwrap();
        assert!(matches!(
            store.put("p^k", b"v").await,
            Err(CheckpointError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_reopen_keeps_entries() {
        let dir = TempDir::new().unwrap();

        let store = CheckpointStore::open_at(dir.path(), "checkpoint").unwrap();
        store.put("nginx^offset", &[1, 2, 3]).await.unwrap();
        store.close().unwrap();

        let store = CheckpointStore::open_at(dir.path(), "checkpoint").unwrap();
        assert_eq!(
            store.get("nginx^offset").await.unwrap(),
            Some(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_extract_pid_from_lock_error() {
        let msg = "IO Error: Could not set lock on file \"x\": Conflicting lock is held in /bin/agent (PID 4242) by user";
        assert_eq!(extract_pid_from_lock_error(msg), Some(4242));
        assert_eq!(extract_pid_from_lock_error("no pid here"), None);
    }
}
