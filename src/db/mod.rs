//! Database module
//!
//! Summary tables live in a DuckDB file. The batch commands open it
//! read-write; the API opens it read-only and runs every query on a cloned
//! connection inside `spawn_blocking`.

pub mod charts;
pub mod discovery;
pub mod query;
pub mod schema;
pub mod summaries;
pub mod verify;

use duckdb::{AccessMode, Config, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{AppError, Result};

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    id: Uuid,
}

impl Database {
    /// Open (or create) the database for writing summaries.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let settings = Config::default()
            .threads(i64::from(config.threads))?
            .max_memory(&config.memory_limit)?;
        let conn = Connection::open_with_flags(&config.path, settings)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_read_only(path: &Path) -> Result<Self> {
        let settings = Config::default().access_mode(AccessMode::ReadOnly)?;
        let conn = Connection::open_with_flags(path, settings)?;
        Ok(Self::from_connection(conn))
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            id: Uuid::new_v4(),
        }
    }

    /// Distinguishes databases in cache keys
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// A new connection to the same database instance.
    pub fn connection(&self) -> Result<Connection> {
        let conn = self.conn.lock().map_err(|_| AppError::Poisoned)?;
        Ok(conn.try_clone()?)
    }

    /// Run blocking database work off the async runtime.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.connection()?;
        tokio::task::spawn_blocking(move || f(&conn)).await?
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Seed data shared by the query tests

    use super::*;

    /// In-memory database with every summary table created and a small,
    /// hand-checked data set covering 2022-11-01..=2022-11-03.
    pub fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection().unwrap();
        schema::create_all(&conn).unwrap();
        conn.execute_batch(SEED).unwrap();
        db
    }

    pub const SEED: &str = r#"
        INSERT INTO daily_stats VALUES
            ('2022-11-01', 100, 3, 2, 2),
            ('2022-11-02', 150, 3, 2, 2),
            ('2022-11-03', 60, 2, 2, 2);

        INSERT INTO daily_country_attacks VALUES
            ('2022-11-01', 'China', 70),
            ('2022-11-01', 'United States', 30),
            ('2022-11-02', 'China', 50),
            ('2022-11-02', 'United States', 100),
            ('2022-11-03', 'China', 40),
            ('2022-11-03', 'Unknown', 20);

        INSERT INTO daily_asn_attacks VALUES
            ('2022-11-01', 'AS4134', 'Chinanet', 'China', 70),
            ('2022-11-01', 'AS14061', 'DigitalOcean', 'United States', 30),
            ('2022-11-02', 'AS4134', 'Chinanet', 'China', 50),
            ('2022-11-02', 'AS14061', 'DigitalOcean', 'United States', 100),
            ('2022-11-03', 'AS4134', 'Chinanet', 'China', 40);

        INSERT INTO daily_ip_attacks VALUES
            ('2022-11-01', '1.1.1.1', 'China', 'Chinanet', 50),
            ('2022-11-01', '2.2.2.2', 'China', 'Chinanet', 20),
            ('2022-11-01', '3.3.3.3', 'United States', 'DigitalOcean', 30),
            ('2022-11-02', '1.1.1.1', 'China', 'Chinanet', 50),
            ('2022-11-02', '3.3.3.3', 'United States', 'DigitalOcean', 100),
            ('2022-11-03', '1.1.1.1', 'China', 'Chinanet', 40),
            ('2022-11-03', '4.4.4.4', 'Unknown', 'Unknown', 20);

        INSERT INTO daily_username_attacks VALUES
            ('2022-11-01', 'root', 'China', 'Chinanet', 70),
            ('2022-11-01', 'admin', 'United States', 'DigitalOcean', 30),
            ('2022-11-02', 'root', 'China', 'Chinanet', 50),
            ('2022-11-02', 'admin', 'United States', 'DigitalOcean', 100),
            ('2022-11-03', 'root', 'China', 'Chinanet', 40),
            ('2022-11-03', 'admin', 'Unknown', 'Unknown', 20);

        INSERT INTO daily_ip_username_attacks VALUES
            ('2022-11-01', '1.1.1.1', 'root', 'China', 'Chinanet', 50),
            ('2022-11-01', '2.2.2.2', 'root', 'China', 'Chinanet', 20),
            ('2022-11-01', '3.3.3.3', 'admin', 'United States', 'DigitalOcean', 30),
            ('2022-11-02', '1.1.1.1', 'root', 'China', 'Chinanet', 50),
            ('2022-11-02', '3.3.3.3', 'admin', 'United States', 'DigitalOcean', 100),
            ('2022-11-03', '1.1.1.1', 'root', 'China', 'Chinanet', 40),
            ('2022-11-03', '4.4.4.4', 'admin', 'Unknown', 'Unknown', 20);

        INSERT INTO hourly_patterns VALUES (0, 200, 3), (13, 110, 2);

        INSERT INTO volatile_country_summary VALUES
            ('United States', 233.33, '2022-11-02', 100, 30),
            ('China', 28.57, '2022-11-02', 50, 70);

        INSERT INTO volatile_asn_summary VALUES
            ('DigitalOcean', 233.33, '2022-11-02', 100, 30),
            ('Chinanet', 28.57, '2022-11-02', 50, 70);

        INSERT INTO volatile_ip_summary VALUES
            ('3.3.3.3', 233.33, '2022-11-02', 100, 30),
            ('1.1.1.1', 20.0, '2022-11-03', 40, 50);

        INSERT INTO volatile_username_summary VALUES
            ('admin', 233.33, '2022-11-02', 100, 30),
            ('root', 28.57, '2022-11-02', 50, 70);
    "#;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cloned_connections_share_the_database() {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .unwrap()
            .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1), (2)")
            .unwrap();

        let total: i64 = db
            .run(|conn| Ok(conn.query_row("SELECT SUM(x) FROM t", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(total, 3);
    }

    #[test]
    fn databases_have_distinct_ids() {
        let a = Database::open_in_memory().unwrap();
        let b = Database::open_in_memory().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attacks.db");
        let config = DatabaseConfig {
            path: path.clone(),
            ..Default::default()
        };
        {
            let db = Database::open(&config).unwrap();
            schema::create_all(&db.connection().unwrap()).unwrap();
        }

        let db = Database::open_read_only(&path).unwrap();
        let conn = db.connection().unwrap();
        assert!(conn
            .execute_batch("INSERT INTO hourly_patterns VALUES (1, 1, 1)")
            .is_err());
    }
}
