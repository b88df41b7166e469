//! Connection provider for SQLite.

use crate::connection::{SqliteConfig, SqliteConnection};
use asupersync::{Cx, Outcome};
use sqlgate_core::{BoxFuture, ConnectionProvider, Error, LinkRole, LinkTarget, RawConnection};

/// Opens a fresh [`SqliteConnection`] per checkout.
///
/// SQLite has no replicas, so master and slave targets open the same file.
/// A target schema is not attached automatically; qualify tables with a
/// schema the caller has attached itself.
///
/// An in-memory `path` gives every connection its own private database,
/// which makes transactions on separate connections invisible to each
/// other. Use a file for anything that suspends a transaction.
#[derive(Debug, Clone)]
pub struct SqliteProvider {
    config: SqliteConfig,
}

impl SqliteProvider {
    pub fn new(config: SqliteConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    /// Open a connection outside the provider contract (schema setup).
    pub fn open(&self) -> Result<SqliteConnection, Error> {
        SqliteConnection::open(&self.config)
    }
}

impl ConnectionProvider for SqliteProvider {
    fn engine(&self) -> &'static str {
        "sqlite"
    }

    fn acquire<'a>(
        &'a self,
        cx: &'a Cx,
        target: &'a LinkTarget,
    ) -> BoxFuture<'a, Outcome<Box<dyn RawConnection>, Error>> {
        let outcome = if let Some(reason) = cx.cancel_reason() {
            Outcome::Cancelled(reason)
        } else {
            if target.role == LinkRole::Slave {
                tracing::trace!(path = %self.config.path, "SQLite has no replicas; reading from the main file");
            }
            match SqliteConnection::open(&self.config) {
                Ok(conn) => {
                    let conn: Box<dyn RawConnection> = Box::new(conn);
                    Outcome::Ok(conn)
                }
                Err(e) => Outcome::Err(e),
            }
        };
        Box::pin(async move { outcome })
    }
}
