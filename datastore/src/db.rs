use anyhow::{Context, Result};
use diesel::connection::SimpleConnection;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection, Pool};
use diesel::sqlite::SqliteConnection;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

/// Applies the SQLCipher key and session pragmas when a connection is
/// handed out. `PRAGMA key` must run before any other statement touches
/// the file or SQLCipher reports the database as corrupt.
#[derive(Debug)]
struct EncryptedConnection {
    key: String,
}

impl CustomizeConnection<SqliteConnection, r2d2::Error> for EncryptedConnection {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        let key = self.key.replace('\'', "''");
        conn.batch_execute(&format!(
            "PRAGMA key = '{key}';\n\
             PRAGMA journal_mode = WAL;\n\
             PRAGMA busy_timeout = 5000;\n\
             PRAGMA foreign_keys = ON;"
        ))
        .map_err(r2d2::Error::QueryError)
    }
}

/// Opens the encrypted store. The pool is capped at one connection: the
/// datastore is the sole writer and a single handle serializes every
/// transaction against the file.
pub fn create_pool(database_path: &str, encryption_key: &str) -> Result<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_path);
    let pool = r2d2::Pool::builder()
        .max_size(1)
        .connection_customizer(Box::new(EncryptedConnection {
            key: encryption_key.to_string(),
        }))
        .build(manager)
        .context("Failed to open encrypted database")?;

    Ok(pool)
}

#[cfg(test)]
pub(crate) fn test_pool() -> DbPool {
    let pool = create_pool(":memory:", "test-key").expect("in-memory pool");
    let mut conn = pool.get().expect("connection");
    let results = crate::migrations::run_all(&mut conn).expect("migrations");
    assert!(!results.is_empty());
    pool
}
