//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.
//! On first run against a database written by one of the earlier triage
//! scripts (a `processed_emails` table keyed by `gmail_id`, or keyed by
//! `email_id` without `action_required`, and no `_migrations`), the old rows
//! are carried over into the new schema and marked as digested.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "processed_emails",
        sql: r#"
            CREATE TABLE IF NOT EXISTS processed_emails (
                email_id TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                sender TEXT NOT NULL,
                category TEXT NOT NULL,
                priority TEXT NOT NULL,
                summary TEXT NOT NULL DEFAULT '',
                amount TEXT,
                action_required INTEGER NOT NULL DEFAULT 0,
                processed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processed_emails_priority
                ON processed_emails(priority);
            CREATE INDEX IF NOT EXISTS idx_processed_emails_processed_at
                ON processed_emails(processed_at);
        "#,
    },
    Migration {
        version: 2,
        name: "digest_deliveries",
        sql: r#"
            CREATE TABLE IF NOT EXISTS digest_deliveries (
                email_id TEXT PRIMARY KEY,
                delivered_at TEXT NOT NULL
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    // Move the old table aside so V1 can create the new shape.
    let legacy = if current_version == 0 {
        legacy_key_column(conn).await?
    } else {
        None
    };
    if legacy.is_some() {
        conn.execute("ALTER TABLE processed_emails RENAME TO processed_emails_legacy", ())
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!("Failed to rename legacy table: {e}"))
            })?;
        tracing::info!("Legacy processed_emails table detected, importing after migration");
    }

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    if let Some(key) = legacy {
        import_legacy_rows(conn, key).await?;
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Run a `COUNT(*)` over the columns of `processed_emails`.
async fn processed_emails_columns(
    conn: &Connection,
    sql: &str,
    params: impl libsql::params::IntoParams,
) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query(sql, params)
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to check legacy table: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to read legacy check: {e}")))?;

    match row {
        Some(row) => Ok(row.get(0).unwrap_or(0)),
        None => Ok(0),
    }
}

/// Key column of a pre-existing `processed_emails` table in an older shape.
///
/// `gmail_id` marks one earlier schema. A table keyed by `email_id` but
/// lacking `action_required` is the other. Any other unknown shape fails
/// loudly instead of being left under a recorded V1.
async fn legacy_key_column(conn: &Connection) -> Result<Option<&'static str>, DatabaseError> {
    const ALL: &str = "SELECT COUNT(*) FROM pragma_table_info('processed_emails')";
    const NAMED: &str =
        "SELECT COUNT(*) FROM pragma_table_info('processed_emails') WHERE name = ?1";

    if processed_emails_columns(conn, ALL, ()).await? == 0 {
        return Ok(None);
    }
    if processed_emails_columns(conn, NAMED, libsql::params!["gmail_id"]).await? > 0 {
        return Ok(Some("gmail_id"));
    }
    if processed_emails_columns(conn, NAMED, libsql::params!["action_required"]).await? > 0 {
        return Ok(None);
    }
    if processed_emails_columns(conn, NAMED, libsql::params!["email_id"]).await? > 0 {
        return Ok(Some("email_id"));
    }
    Err(DatabaseError::Migration(
        "processed_emails exists with an unrecognised schema".to_string(),
    ))
}

/// Copy legacy rows into the new table. They were already handled by the
/// old tool, so they also get a digest delivery and never reappear.
async fn import_legacy_rows(conn: &Connection, key: &'static str) -> Result<(), DatabaseError> {
    let sql = format!(
        "INSERT OR IGNORE INTO processed_emails
            (email_id, subject, sender, category, priority, summary, amount,
             action_required, processed_at)
         SELECT {key},
                COALESCE(subject, ''),
                COALESCE(sender, ''),
                COALESCE(category, 'notificacion'),
                COALESCE(priority, 'sin_prioridad'),
                COALESCE(summary, ''),
                amount,
                CASE WHEN priority = 'urgente' THEN 1 ELSE 0 END,
                COALESCE(strftime('%Y-%m-%dT%H:%M:%S.000000Z', processed_at),
                         strftime('%Y-%m-%dT%H:%M:%S.000000Z', 'now'))
         FROM processed_emails_legacy;
         INSERT OR IGNORE INTO digest_deliveries (email_id, delivered_at)
         SELECT {key}, strftime('%Y-%m-%dT%H:%M:%S.000000Z', 'now')
         FROM processed_emails_legacy;
         DROP TABLE processed_emails_legacy;"
    );
    conn.execute_batch(&sql)
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to import legacy rows: {e}")))?;
    tracing::info!("Imported legacy processed_emails rows");
    Ok(())
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn count(conn: &Connection, sql: &str) -> i64 {
        let mut rows = conn.query(sql, ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get(0).unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &["processed_emails", "digest_deliveries", "_migrations"] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let n: i64 = row.get(0).unwrap();
            assert_eq!(n, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn legacy_rows_are_imported_and_digested() {
        let conn = test_conn().await;
        conn.execute_batch(
            "CREATE TABLE processed_emails (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                gmail_id TEXT UNIQUE NOT NULL,
                subject TEXT,
                sender TEXT,
                category TEXT,
                priority TEXT,
                summary TEXT,
                amount TEXT,
                processed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                notified BOOLEAN DEFAULT 0
            );
            INSERT INTO processed_emails (gmail_id, subject, sender, category, priority, summary, amount)
                VALUES ('g1', 'Pago', 'banco@x.com', 'pago', 'urgente', 'Pago de $10', '$10.00');
            INSERT INTO processed_emails (gmail_id, subject, sender, category, priority)
                VALUES ('g2', 'Promo', 'banco@x.com', 'promocion', 'sin_prioridad');",
        )
        .await
        .unwrap();

        run_migrations(&conn).await.unwrap();

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM processed_emails").await, 2);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM digest_deliveries").await, 2);
        assert_eq!(
            count(
                &conn,
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'processed_emails_legacy'"
            )
            .await,
            0
        );
        assert_eq!(
            count(
                &conn,
                "SELECT action_required FROM processed_emails WHERE email_id = 'g1'"
            )
            .await,
            1
        );
    }

    #[tokio::test]
    async fn email_id_keyed_legacy_table_is_imported() {
        let conn = test_conn().await;
        conn.execute_batch(
            "CREATE TABLE processed_emails (
                email_id TEXT PRIMARY KEY,
                subject TEXT,
                sender TEXT,
                category TEXT,
                priority TEXT,
                summary TEXT,
                amount TEXT,
                processed_at TIMESTAMP,
                notified BOOLEAN DEFAULT 0
            );
            INSERT INTO processed_emails (email_id, subject, sender, category, priority, processed_at)
                VALUES ('e1', 'Cargo', 'banco@x.com', 'movimiento', 'normal', '2024-05-01 10:00:00');",
        )
        .await
        .unwrap();

        run_migrations(&conn).await.unwrap();

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM processed_emails WHERE email_id = 'e1'").await, 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM digest_deliveries").await, 1);
        assert_eq!(
            count(
                &conn,
                "SELECT COUNT(*) FROM pragma_table_info('processed_emails') WHERE name = 'action_required'"
            )
            .await,
            1
        );
    }

    #[tokio::test]
    async fn unrecognised_existing_table_fails_migration() {
        let conn = test_conn().await;
        conn.execute("CREATE TABLE processed_emails (id INTEGER PRIMARY KEY)", ())
            .await
            .unwrap();

        let err = run_migrations(&conn).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Migration(_)), "{err:?}");
        assert_eq!(get_current_version(&conn).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        let v1: i64 = row1.get(0).unwrap();
        let n1: String = row1.get(1).unwrap();
        assert_eq!(v1, 1);
        assert_eq!(n1, "processed_emails");

        let row2 = rows.next().await.unwrap().unwrap();
        let n2: String = row2.get(1).unwrap();
        assert_eq!(n2, "digest_deliveries");
    }
}
