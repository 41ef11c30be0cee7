use std::time::Duration;

use anyhow::Context;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use log::{info, warn};
use tokio_postgres::NoTls;

use crate::config::PostgresSettings;

/// Schema applied by [`PostgresClient::migrate`].
const SCHEMA: &str = include_str!("../../../schema/postgres.sql");

/// Connection attempts before giving up at startup.
const CONNECT_ATTEMPTS: u32 = 3;

/// First retry delay; doubles on every further attempt.
const CONNECT_BACKOFF: Duration = Duration::from_millis(200);

/// Split a SQL script into statements on top-level `;`.
///
/// Semicolons inside `$$ ... $$` bodies and `--` line comments do not end a
/// statement. Comment-only fragments are dropped.
fn split_sql_statements(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut in_dollar_quote = false;
    let mut i = 0;

    // '$', '-', '\n' and ';' are ASCII, so byte offsets stay on char boundaries
    while i < bytes.len() {
        match bytes[i] {
            b'$' if bytes.get(i + 1) == Some(&b'$') => {
                in_dollar_quote = !in_dollar_quote;
                i += 2;
                continue;
            },
            b'-' if !in_dollar_quote && bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            },
            b';' if !in_dollar_quote => {
                push_statement(&mut statements, &sql[start..i]);
                start = i + 1;
            },
            _ => {},
        }
        i += 1;
    }
    push_statement(&mut statements, &sql[start..]);

    statements
}

fn push_statement<'a>(statements: &mut Vec<&'a str>, fragment: &'a str) {
    let has_sql = fragment
        .lines()
        .map(str::trim)
        .any(|line| !line.is_empty() && !line.starts_with("--"));
    if has_sql {
        statements.push(fragment.trim());
    }
}

/// PostgreSQL-backed [`Store`](crate::db::store::Store).
///
/// Holds pairs, tokens, transactions, price and volume snapshots and the
/// sync checkpoint. Connections come from a `deadpool-postgres` pool.
#[derive(Clone)]
pub struct PostgresClient {
    pub pool: Pool,
}

impl PostgresClient {
    /// Build the pool and make sure the database answers, retrying with
    /// exponential backoff while it comes up.
    pub async fn new(settings: &PostgresSettings) -> anyhow::Result<Self> {
        info!(
            "Connecting to PostgreSQL at {}:{}/{}",
            settings.host, settings.port, settings.database
        );

        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&settings.host)
            .port(settings.port)
            .user(&settings.user)
            .password(&settings.password)
            .dbname(&settings.database);

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(settings.pool_size)
            .build()
            .context("Failed to create PostgreSQL connection pool")?;

        let mut delay = CONNECT_BACKOFF;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match pool.get().await {
                Ok(_) => {
                    info!("Connected to PostgreSQL (pool size {})", settings.pool_size);
                    return Ok(Self { pool });
                },
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    warn!(
                        "PostgreSQL not reachable (attempt {}/{}): {}. Retrying in {:?}",
                        attempt, CONNECT_ATTEMPTS, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                },
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("PostgreSQL not reachable after {} attempts", CONNECT_ATTEMPTS)
                    });
                },
            }
        }

        anyhow::bail!("PostgreSQL connection attempts exhausted")
    }

    /// Apply the bundled schema. Every statement is idempotent.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        let statements = split_sql_statements(SCHEMA);
        info!("Applying {} schema statements", statements.len());

        for stmt in statements {
            client
                .batch_execute(stmt)
                .await
                .with_context(|| format!("Failed to execute migration statement: {}", stmt))?;
        }

        info!("PostgreSQL schema is up to date");
        Ok(())
    }
}
