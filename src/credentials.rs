//! Storage for the single administrator credential.
//!
//! The store holds exactly one row, keyed by a fixed id, containing a salted
//! Argon2 hash. Nothing else about the account is persisted.

use std::path::Path;

use anyhow::{Context, Result};
use libsql::{Builder, Connection, params};

use crate::security::{hash_password, verify_password};

const CREDENTIAL_ROW_ID: i64 = 1;

pub struct CredentialStore {
    conn: Connection,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    // journal_mode answers with the resulting mode, so it cannot go through execute.
    let mut rows = conn
        .query("PRAGMA journal_mode=WAL", params![])
        .await
        .context("enabling WAL journal")?;
    while rows.next().await?.is_some() {}
    conn.execute("PRAGMA synchronous=NORMAL", params![])
        .await
        .context("setting synchronous mode")?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS password (
            id INTEGER PRIMARY KEY,
            password TEXT NOT NULL
        );
        "#,
    )
    .await?;
    Ok(())
}

fn is_remote_url(url: &str) -> bool {
    ["libsql://", "http://", "https://", "wss://", "ws://"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
}

impl CredentialStore {
    /// Connects using a `DATABASE_URL`-style string. Remote URLs go through
    /// the libsql HTTP client, anything else is treated as a local SQLite path.
    pub async fn open(url: &str, auth_token: &str) -> Result<Self> {
        let url = url.trim();
        if is_remote_url(url) {
            let db = Builder::new_remote(url.to_string(), auth_token.to_string())
                .build()
                .await
                .with_context(|| format!("connecting to credential store {url}"))?;
            let conn = db.connect()?;
            ensure_schema(&conn).await?;
            return Ok(Self { conn });
        }

        let path = Path::new(url.strip_prefix("file:").unwrap_or(url));
        Self::open_local(path).await
    }

    pub async fn open_local(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating credential directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening credential DB {}", path.display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    pub async fn stored_hash(&self) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT password FROM password WHERE id = ?1",
                params![CREDENTIAL_ROW_ID],
            )
            .await
            .context("reading credential row")?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(row.get::<String>(0)?))
    }

    /// Overwrites (or creates) the credential row with an already hashed value.
    pub async fn replace_hash(&self, hash: &str) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO password (id, password) VALUES (?1, ?2)
                ON CONFLICT(id) DO UPDATE SET password = excluded.password
                "#,
                params![CREDENTIAL_ROW_ID, hash],
            )
            .await
            .context("writing credential row")?;
        Ok(())
    }

    pub async fn set_password(&self, plain: &str) -> Result<()> {
        let hash = hash_password(plain)?;
        self.replace_hash(&hash).await
    }

    /// Seeds the credential row from a plaintext password unless one exists.
    /// Returns whether a row was written.
    pub async fn seed_if_empty(&self, plain: &str) -> Result<bool> {
        if self.stored_hash().await?.is_some() {
            return Ok(false);
        }
        self.set_password(plain).await?;
        Ok(true)
    }

    /// Checks a login attempt. A missing row and a wrong password are
    /// indistinguishable to the caller.
    pub async fn verify(&self, candidate: &str) -> Result<bool> {
        Ok(self
            .stored_hash()
            .await?
            .is_some_and(|hash| verify_password(&hash, candidate)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn create_store() -> Result<(tempfile::TempDir, CredentialStore)> {
        let dir = tempdir()?;
        let path = dir.path().join("creds/test.db");
        let store = CredentialStore::open_local(&path).await?;
        Ok((dir, store))
    }

    #[tokio::test]
    async fn open_creates_db_file_and_table() -> Result<()> {
        let (dir, store) = create_store().await?;
        assert!(dir.path().join("creds/test.db").exists());
        let mut rows = store
            .conn
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                ["password"],
            )
            .await?;
        let exists: Option<String> = rows
            .next()
            .await?
            .map(|row| row.get::<String>(0))
            .transpose()?;
        assert_eq!(exists.as_deref(), Some("password"));
        Ok(())
    }

    #[tokio::test]
    async fn local_file_survives_reopen_in_wal_mode() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("stage.db");

        let store = CredentialStore::open(path.to_str().expect("utf-8 path"), "").await?;
        assert!(store.seed_if_empty("hunter2").await?);
        let mut rows = store.conn.query("PRAGMA journal_mode", params![]).await?;
        let mode: String = rows.next().await?.expect("journal mode row").get(0)?;
        assert_eq!(mode.to_ascii_lowercase(), "wal");
        drop(rows);
        drop(store);

        let reopened = CredentialStore::open_local(&path).await?;
        assert!(reopened.verify("hunter2").await?);
        assert!(!reopened.verify("hunter3").await?);
        assert!(!reopened.seed_if_empty("other").await?);
        Ok(())
    }

    #[tokio::test]
    async fn open_accepts_file_prefixed_urls() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("prefixed.db");
        let url = format!("file:{}", path.display());
        let store = CredentialStore::open(&url, "").await?;
        assert!(store.stored_hash().await?.is_none());
        assert!(path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn verify_fails_without_a_row() -> Result<()> {
        let (_dir, store) = create_store().await?;
        assert!(!store.verify("anything").await?);
        Ok(())
    }

    #[tokio::test]
    async fn seed_writes_only_once() -> Result<()> {
        let (_dir, store) = create_store().await?;
        assert!(store.seed_if_empty("first").await?);
        assert!(!store.seed_if_empty("second").await?);
        assert!(store.verify("first").await?);
        assert!(!store.verify("second").await?);
        Ok(())
    }

    #[tokio::test]
    async fn set_password_replaces_previous_hash() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store.set_password("old").await?;
        let before = store.stored_hash().await?.expect("hash stored");

        store.set_password("new").await?;
        let after = store.stored_hash().await?.expect("hash stored");

        assert_ne!(before, after);
        assert!(store.verify("new").await?);
        assert!(!store.verify("old").await?);
        Ok(())
    }

    #[tokio::test]
    async fn stored_value_is_never_plaintext() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store.set_password("plaintext-secret").await?;
        let stored = store.stored_hash().await?.expect("hash stored");
        assert!(!stored.contains("plaintext-secret"));
        Ok(())
    }

    #[test]
    fn remote_url_detection() {
        assert!(is_remote_url("libsql://db.example.turso.io"));
        assert!(is_remote_url("https://db.example.com"));
        assert!(!is_remote_url("/var/lib/stage/creds.db"));
        assert!(!is_remote_url("file:creds.db"));
    }
}
