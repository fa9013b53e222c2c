use duckdb::Connection;
use parking_lot::Mutex;
use r2d2::ManageConnection;

/// Hands out connections that all share one DuckDB database instance.
///
/// DuckDB allows a single instance per database file inside a process, so
/// pooled connections are cloned from a base connection instead of reopening
/// the file. This also lets `:memory:` databases be pooled.
pub struct DuckDBConnectionManager {
    connection_string: String,
    base: Mutex<Connection>,
}

impl DuckDBConnectionManager {
    pub fn new(connection_string: String) -> Result<Self, duckdb::Error> {
        let base = if connection_string == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(&connection_string)?
        };

        Ok(Self {
            connection_string,
            base: Mutex::new(base),
        })
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

impl ManageConnection for DuckDBConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.base.lock().try_clone()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute("SELECT 1", [])?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}
