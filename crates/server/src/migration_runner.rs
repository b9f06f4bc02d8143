//! Embedded SQL migrations, tracked in `schema_versions`.

use std::collections::HashSet;
use std::path::Path;

use rusqlite::{params, Connection};
use tracing::{info, warn};

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "001_conversations",
    sql: include_str!("../migrations/001_conversations.sql"),
}];

/// Open the database with the pragmas every connection uses.
pub fn open_connection(db_path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(conn)
}

/// Bring the schema up to date. Returns how many migrations ran.
pub fn run_migrations(conn: &mut Connection) -> anyhow::Result<usize> {
    apply_pending(conn, MIGRATIONS)
}

fn apply_pending(conn: &mut Connection, migrations: &[Migration]) -> anyhow::Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )?;
    let done = applied_versions(conn)?;

    let mut ran = 0;
    for migration in migrations.iter().filter(|m| !done.contains(&m.version)) {
        // Schema change and version row commit together or not at all.
        let tx = conn.transaction()?;
        if let Err(e) = tx.execute_batch(migration.sql) {
            warn!(
                component = "migrations",
                event = "migration.failed",
                version = migration.version,
                name = migration.name,
                error = %e,
            );
            anyhow::bail!("migration {} ({}) failed: {e}", migration.version, migration.name);
        }
        tx.execute(
            "INSERT INTO schema_versions (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;
        info!(
            component = "migrations",
            event = "migration.applied",
            version = migration.version,
            name = migration.name,
        );
        ran += 1;
    }

    info!(
        component = "migrations",
        event = "migrations.checked",
        known = migrations.len(),
        ran,
    );
    Ok(ran)
}

fn applied_versions(conn: &Connection) -> rusqlite::Result<HashSet<i64>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_versions")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut conn = open_connection(&tmp.path().join("test.db")).unwrap();

        assert_eq!(run_migrations(&mut conn).unwrap(), MIGRATIONS.len());
        assert_eq!(run_migrations(&mut conn).unwrap(), 0);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('conversations', 'messages')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[test]
    fn failed_migration_records_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut conn = open_connection(&tmp.path().join("test.db")).unwrap();
        let broken = [
            Migration {
                version: 1,
                name: "001_ok",
                sql: "CREATE TABLE a (id INTEGER PRIMARY KEY);",
            },
            Migration {
                version: 2,
                name: "002_broken",
                sql: "CREATE TABLE b (id INTEGER PRIMARY KEY); NOT SQL;",
            },
        ];

        let err = apply_pending(&mut conn, &broken).unwrap_err();
        assert!(err.to_string().contains("002_broken"));
        assert_eq!(applied_versions(&conn).unwrap(), HashSet::from([1]));

        let b_exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'b'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(b_exists, 0);
    }
}
