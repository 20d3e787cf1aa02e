use std::str::FromStr;

use std::time::Duration;

use sqlx::{
    Error, Pool, Sqlite,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};
use utils::assets::db_path;

pub mod models;

#[derive(Clone)]
pub struct DBService {
    pub pool: Pool<Sqlite>,
}

impl DBService {
    fn pool_options() -> SqlitePoolOptions {
        SqlitePoolOptions::new()
            .max_connections(20)
            .min_connections(1)
            .idle_timeout(Duration::from_secs(300))
            .acquire_timeout(Duration::from_secs(30))
    }

    fn connect_options() -> Result<SqliteConnectOptions, Error> {
        let database_url = format!("sqlite://{}", db_path().to_string_lossy());
        Ok(SqliteConnectOptions::from_str(&database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .synchronous(SqliteSynchronous::Normal))
    }

    pub async fn new() -> Result<DBService, Error> {
        let pool = Self::pool_options()
            .connect_with(Self::connect_options()?)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        sqlx::query("PRAGMA optimize").execute(&pool).await?;
        Ok(DBService { pool })
    }

    /// In-memory database with migrations applied. A single connection is
    /// required: each `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<DBService, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::from_str("sqlite::memory:")?
                    .foreign_keys(true),
            )
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(DBService { pool })
    }
}
