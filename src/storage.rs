use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::credentials::{CredentialStore, Credentials};

const THEME_KEY: &str = "theme";

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThemePreference {
    #[default]
    System,
    Light,
    Dark,
}

impl ThemePreference {
    pub fn as_i64(self) -> i64 {
        match self {
            ThemePreference::System => 0,
            ThemePreference::Light => 1,
            ThemePreference::Dark => 2,
        }
    }

    /// Unknown stored values fall back to following the system.
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => ThemePreference::Light,
            2 => ThemePreference::Dark,
            _ => ThemePreference::System,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThemePreference::System => "system",
            ThemePreference::Light => "light",
            ThemePreference::Dark => "dark",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "system" => Some(ThemePreference::System),
            "light" => Some(ThemePreference::Light),
            "dark" => Some(ThemePreference::Dark),
            _ => None,
        }
    }
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    pub fn theme(&self) -> Result<ThemePreference> {
        let conn = self.conn.lock();
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM preferences WHERE key = ?1",
                params![THEME_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("storage: query theme preference")?;
        Ok(value.map(ThemePreference::from_i64).unwrap_or_default())
    }

    pub fn set_theme(&self, theme: ThemePreference) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO preferences (key, value) VALUES (?1, ?2)
ON CONFLICT(key) DO UPDATE SET value = excluded.value
"#,
            params![THEME_KEY, theme.as_i64()],
        )
        .context("storage: write theme preference")?;
        Ok(())
    }

    fn write_column(&self, column: Column, token: &str) -> Result<()> {
        let sql = match column {
            Column::Access => {
                r#"
INSERT INTO credentials (id, access_token, refresh_token, updated_at) VALUES (1, ?1, NULL, ?2)
ON CONFLICT(id) DO UPDATE SET access_token = excluded.access_token, updated_at = excluded.updated_at
"#
            }
            Column::Refresh => {
                r#"
INSERT INTO credentials (id, access_token, refresh_token, updated_at) VALUES (1, NULL, ?1, ?2)
ON CONFLICT(id) DO UPDATE SET refresh_token = excluded.refresh_token, updated_at = excluded.updated_at
"#
            }
        };
        let conn = self.conn.lock();
        conn.execute(sql, params![token, Utc::now().timestamp()])
            .with_context(|| format!("storage: write {} token", column.name()))?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Column {
    Access,
    Refresh,
}

impl Column {
    fn name(self) -> &'static str {
        match self {
            Column::Access => "access",
            Column::Refresh => "refresh",
        }
    }
}

impl CredentialStore for Store {
    fn read(&self) -> Result<Credentials> {
        let conn = self.conn.lock();
        let creds = conn
            .query_row(
                "SELECT access_token, refresh_token FROM credentials WHERE id = 1",
                [],
                |row| {
                    Ok(Credentials {
                        access_token: row.get(0)?,
                        refresh_token: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("storage: query credentials")?;
        Ok(creds.unwrap_or_default())
    }

    fn write_access_token(&self, token: &str) -> Result<()> {
        self.write_column(Column::Access, token)
    }

    fn write_refresh_token(&self, token: &str) -> Result<()> {
        self.write_column(Column::Refresh, token)
    }

    fn write_pair(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO credentials (id, access_token, refresh_token, updated_at) VALUES (1, ?1, ?2, ?3)
ON CONFLICT(id) DO UPDATE SET
  access_token = excluded.access_token,
  refresh_token = excluded.refresh_token,
  updated_at = excluded.updated_at
"#,
            params![access_token, refresh_token, Utc::now().timestamp()],
        )
        .context("storage: write credential pair")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM credentials", [])
            .context("storage: clear credentials")?;
        Ok(())
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let migrations = migrations();
    for (idx, sql) in migrations.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![
                version,
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::from_secs(0))
                    .as_secs() as i64,
            ],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![
        r#"
CREATE TABLE IF NOT EXISTS credentials (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  access_token TEXT,
  refresh_token TEXT,
  updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS preferences (
  key TEXT PRIMARY KEY,
  value INTEGER NOT NULL
);
"#,
    ]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("alris").join("state.db"))
}
