use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::ConfigSecret;

/// Connection settings of the Postgres database holding migration records.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PgConnectionConfig {
    /// Hostname or IP address of the Postgres server.
    pub host: String,
    /// Port number on which the Postgres server is listening.
    pub port: u16,
    /// Name of the database to connect to.
    pub name: String,
    /// Username for authenticating with the Postgres server.
    pub username: String,
    /// Password for the specified user, redacted in debug output.
    #[serde(default)]
    pub password: Option<ConfigSecret>,
    /// Whether connections must be encrypted.
    #[serde(default)]
    pub require_ssl: bool,
}

/// Converts connection settings into client specific connect options.
pub trait IntoConnectOptions<Output> {
    /// Returns options for connecting to the server without selecting a database.
    ///
    /// Useful for administrative operations like database creation.
    fn without_db(&self) -> Output;

    /// Returns options for connecting to the configured database.
    fn with_db(&self) -> Output;
}

impl IntoConnectOptions<PgConnectOptions> for PgConnectionConfig {
    fn without_db(&self) -> PgConnectOptions {
        let ssl_mode = if self.require_ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        let options = PgConnectOptions::new_without_pgpass()
            .host(&self.host)
            .username(&self.username)
            .port(self.port)
            .ssl_mode(ssl_mode);

        if let Some(password) = &self.password {
            options.password(password.expose())
        } else {
            options
        }
    }

    fn with_db(&self) -> PgConnectOptions {
        let options: PgConnectOptions = self.without_db();
        options.database(&self.name)
    }
}
