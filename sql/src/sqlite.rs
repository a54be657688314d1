use std::{path::Path, str::FromStr};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::Result;

/// Name of the database file inside a store directory.
pub const DB_FILE_NAME: &str = "passport.sqlite3";

/// How to handle outstanding database migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Migrations {
    /// Apply migrations after opening connection
    Apply,
    /// Do nothing
    Skip,
}

#[derive(Clone, Debug)]
/// The sqlite pool is split into a writer and a reader pool.
/// Wrapper around the sqlx::SqlitePool
pub struct SqlitePool {
    writer: sqlx::SqlitePool,
    reader: sqlx::SqlitePool,
}

#[derive(Clone, Debug)]
pub struct SqliteOpts {
    /// Value to use for the sqlite cache_size pragma
    /// Use the negative version, which represents Kib e.g. 20000 = 20 Mb
    /// Or the postive version, representing pages
    /// None means the default is used.
    pub cache_size: Option<i64>,
    /// Number of connections in the read only pool (default 4)
    pub max_ro_connections: u32,
}

impl Default for SqliteOpts {
    fn default() -> Self {
        Self {
            cache_size: None,
            max_ro_connections: 4,
        }
    }
}

impl SqlitePool {
    /// Connect to the sqlite database at the given path. Creates the database if it does not exist.
    /// Uses WAL journal mode.
    pub async fn connect(path: &str, opts: SqliteOpts, migrate: Migrations) -> Result<Self> {
        let conn_opts = SqliteConnectOptions::from_str(path)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true)
            .optimize_on_close(true, None)
            .foreign_keys(true);

        let conn_opts = if let Some(cache) = opts.cache_size {
            conn_opts.pragma("cache_size", cache.to_string())
        } else {
            conn_opts
        };

        let writer = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(conn_opts.clone())
            .await?;

        if migrate == Migrations::Apply {
            sqlx::migrate!("../migrations/sqlite")
                .run(&writer)
                .await
                .map_err(sqlx::Error::from)?;
        }

        // An in-memory database lives inside a single connection, so readers share the writer.
        let reader = if path.contains(":memory:") {
            writer.clone()
        } else {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(opts.max_ro_connections)
                .connect_with(conn_opts.read_only(true))
                .await?
        };

        Ok(Self { writer, reader })
    }

    /// Open (or create) the database file inside `dir`.
    pub async fn connect_dir(dir: &Path, opts: SqliteOpts) -> Result<Self> {
        let path = dir.join(DB_FILE_NAME);
        Self::connect(
            &format!("sqlite://{}", path.display()),
            opts,
            Migrations::Apply,
        )
        .await
    }

    /// Creates an in-memory database. Useful for testing. Automatically applies migrations since all memory databases start empty
    /// and are not shared between connections.
    pub async fn connect_in_memory() -> Result<Self> {
        SqlitePool::connect(":memory:", SqliteOpts::default(), Migrations::Apply).await
    }

    /// Get a reference to the writer database pool. The writer pool has only one connection.
    pub fn writer(&self) -> &sqlx::SqlitePool {
        &self.writer
    }

    /// Get a reference to the reader database pool. The reader pool has many connections.
    pub fn reader(&self) -> &sqlx::SqlitePool {
        &self.reader
    }
}
