use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{now_ms, CacheBackend, StoredResponse};
use crate::{CacheError, RequestKey};

/// Database schema version, tracked in `PRAGMA user_version`.
const SCHEMA_VERSION: i32 = 2;

/// Durable backend on a single SQLite file.
///
/// Blocking database calls run on tokio's blocking pool.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let conn = Connection::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "Opened cache database");
        Self::init(conn)
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            migrate_database(&mut conn, version)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&mut Connection) -> Result<T, CacheError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CacheError::Unavailable("connection lock poisoned".to_string()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

fn migrate_database(conn: &mut Connection, from_version: i32) -> Result<(), CacheError> {
    if from_version < 1 {
        // Fresh databases start at the current version.
        return create_schema(conn);
    }

    if from_version < 2 {
        migrate_to_v2(conn)?;
    }

    Ok(())
}

fn create_schema(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS caches (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entries (
            cache TEXT NOT NULL REFERENCES caches(name) ON DELETE CASCADE,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            response_url TEXT,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            stored_at INTEGER NOT NULL,
            vary TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (cache, method, url)
        );

        PRAGMA user_version = 2;
        "#,
    )?;
    Ok(())
}

/// Version 2 keeps header values as bytes and records `Vary` inputs.
fn migrate_to_v2(conn: &mut Connection) -> Result<(), CacheError> {
    let tx = conn.transaction()?;
    tx.execute(
        "ALTER TABLE entries ADD COLUMN vary TEXT NOT NULL DEFAULT '[]'",
        [],
    )?;

    let rows = {
        let mut stmt = tx.prepare("SELECT cache, method, url, headers FROM entries")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    for (cache, method, url, headers) in rows {
        let text: Vec<(String, String)> = serde_json::from_str(&headers)?;
        let raw: Vec<(String, Vec<u8>)> = text
            .into_iter()
            .map(|(name, value)| (name, value.into_bytes()))
            .collect();
        tx.execute(
            "UPDATE entries SET headers = ?1 WHERE cache = ?2 AND method = ?3 AND url = ?4",
            params![serde_json::to_string(&raw)?, cache, method, url],
        )?;
    }

    tx.execute_batch("PRAGMA user_version = 2;")?;
    tx.commit()?;
    debug!("Migrated cache database to schema v2");
    Ok(())
}

fn ensure_cache(conn: &Connection, name: &str) -> Result<(), CacheError> {
    conn.execute(
        "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?1, ?2)",
        params![name, now_ms() as i64],
    )?;
    Ok(())
}

#[async_trait]
impl CacheBackend for SqliteBackend {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        let name = name.to_string();
        self.call(move |conn| ensure_cache(conn, &name)).await
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        let name = name.to_string();
        self.call(move |conn| {
            let found = conn
                .query_row("SELECT 1 FROM caches WHERE name = ?1", [&name], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let name = name.to_string();
        self.call(move |conn| {
            let removed = conn.execute("DELETE FROM caches WHERE name = ?1", [&name])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.call(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM caches ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn get(
        &self,
        name: &str,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, CacheError> {
        let name = name.to_string();
        let key = key.clone();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT response_url, status, headers, body, stored_at, vary
                     FROM entries WHERE cache = ?1 AND method = ?2 AND url = ?3",
                    params![name, key.method, key.url],
                    |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()?;

            let Some((url, status, headers, body, stored_at, vary)) = row else {
                return Ok(None);
            };

            let status = u16::try_from(status).map_err(|_| {
                CacheError::Corrupt(format!("{key} has status {status} in cache {name}"))
            })?;

            Ok(Some(StoredResponse {
                url,
                status,
                headers: serde_json::from_str(&headers)?,
                body: Bytes::from(body),
                vary: serde_json::from_str(&vary)?,
                stored_at_ms: stored_at as u64,
            }))
        })
        .await
    }

    async fn put(
        &self,
        name: &str,
        key: RequestKey,
        response: StoredResponse,
    ) -> Result<(), CacheError> {
        let name = name.to_string();
        self.call(move |conn| {
            let headers = serde_json::to_string(&response.headers)?;
            let vary = serde_json::to_string(&response.vary)?;
            let tx = conn.transaction()?;
            ensure_cache(&tx, &name)?;
            tx.execute(
                "INSERT INTO entries
                     (cache, method, url, response_url, status, headers, body, stored_at, vary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (cache, method, url) DO UPDATE SET
                     response_url = excluded.response_url,
                     status = excluded.status,
                     headers = excluded.headers,
                     body = excluded.body,
                     stored_at = excluded.stored_at,
                     vary = excluded.vary",
                params![
                    name,
                    key.method,
                    key.url,
                    response.url,
                    response.status as i64,
                    headers,
                    response.body.as_ref(),
                    response.stored_at_ms as i64,
                    vary,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, name: &str, key: &RequestKey) -> Result<bool, CacheError> {
        let name = name.to_string();
        let key = key.clone();
        self.call(move |conn| {
            let removed = conn.execute(
                "DELETE FROM entries WHERE cache = ?1 AND method = ?2 AND url = ?3",
                params![name, key.method, key.url],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn entries(&self, name: &str) -> Result<Vec<RequestKey>, CacheError> {
        let name = name.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT method, url FROM entries WHERE cache = ?1 ORDER BY method, url",
            )?;
            let keys = stmt
                .query_map([&name], |row| {
                    Ok(RequestKey {
                        method: row.get(0)?,
                        url: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn key(path: &str) -> RequestKey {
        RequestKey::for_url(&Url::parse(&format!("https://app.example{path}")).unwrap())
    }

    fn entry(body: &'static [u8]) -> StoredResponse {
        StoredResponse {
            url: Some("https://app.example/".to_string()),
            status: 200,
            headers: vec![("content-type".to_string(), b"text/html".to_vec())],
            body: Bytes::from_static(body),
            vary: vec![("accept-language".to_string(), Some(b"en".to_vec()))],
            stored_at_ms: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_put_get_and_overwrite() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.put("v1", key("/"), entry(b"one")).await.unwrap();
        backend.put("v1", key("/"), entry(b"two")).await.unwrap();

        let stored = backend.get("v1", &key("/")).await.unwrap().unwrap();
        assert_eq!(stored, entry(b"two"));
        assert_eq!(backend.entries("v1").await.unwrap(), vec![key("/")]);
    }

    #[tokio::test]
    async fn test_delete_cascades_entries() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.put("v1", key("/a"), entry(b"a")).await.unwrap();
        backend.open("v2").await.unwrap();

        assert!(backend.delete("v1").await.unwrap());
        assert!(!backend.delete("v1").await.unwrap());
        assert_eq!(backend.keys().await.unwrap(), vec!["v2".to_string()]);
        assert!(backend.get("v1", &key("/a")).await.unwrap().is_none());
        assert!(backend.entries("v1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.db");

        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend.put("v1", key("/index.html"), entry(b"shell")).await.unwrap();
        }

        let backend = SqliteBackend::open(&path).unwrap();
        assert!(backend.has("v1").await.unwrap());
        let stored = backend.get("v1", &key("/index.html")).await.unwrap().unwrap();
        assert_eq!(stored.body, Bytes::from_static(b"shell"));
    }

    #[tokio::test]
    async fn test_remove_entry() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.put("v1", key("/a"), entry(b"a")).await.unwrap();
        assert!(backend.remove("v1", &key("/a")).await.unwrap());
        assert!(!backend.remove("v1", &key("/a")).await.unwrap());
    }

    #[tokio::test]
    async fn test_raw_header_bytes_survive() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let mut raw = entry(b"x");
        raw.headers.push(("x-raw".to_string(), b"caf\xe9".to_vec()));
        backend.put("v1", key("/raw"), raw.clone()).await.unwrap();

        assert_eq!(backend.get("v1", &key("/raw")).await.unwrap(), Some(raw));
    }

    #[tokio::test]
    async fn test_out_of_range_status_is_reported() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.put("v1", key("/bad"), entry(b"x")).await.unwrap();
        backend
            .conn
            .lock()
            .unwrap()
            .execute("UPDATE entries SET status = 70000", [])
            .unwrap();

        let err = backend.get("v1", &key("/bad")).await.unwrap_err();
        assert!(matches!(err, CacheError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_migrates_v1_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.db");

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                r#"
                CREATE TABLE caches (name TEXT PRIMARY KEY, created_at INTEGER NOT NULL);
                CREATE TABLE entries (
                    cache TEXT NOT NULL REFERENCES caches(name) ON DELETE CASCADE,
                    method TEXT NOT NULL,
                    url TEXT NOT NULL,
                    response_url TEXT,
                    status INTEGER NOT NULL,
                    headers TEXT NOT NULL,
                    body BLOB NOT NULL,
                    stored_at INTEGER NOT NULL,
                    PRIMARY KEY (cache, method, url)
                );
                INSERT INTO caches VALUES ('v1', 0);
                INSERT INTO entries VALUES (
                    'v1', 'GET', 'https://app.example/', NULL, 200,
                    '[["content-type","text/html"]]', x'3c703e', 0
                );
                PRAGMA user_version = 1;
                "#,
            )
            .unwrap();
        }

        let backend = SqliteBackend::open(&path).unwrap();
        let stored = backend.get("v1", &key("/")).await.unwrap().unwrap();
        assert_eq!(
            stored.headers,
            vec![("content-type".to_string(), b"text/html".to_vec())]
        );
        assert!(stored.vary.is_empty());
        assert_eq!(stored.body, Bytes::from_static(b"<p>"));
    }
}
