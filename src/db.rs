use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::extract::rules::Link;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating database directory {}", dir.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("opening database {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sites (
            id         INTEGER PRIMARY KEY,
            url        TEXT UNIQUE NOT NULL,
            added_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- A row here means the site has been seen at least once
        CREATE TABLE IF NOT EXISTS site_state (
            site_id    INTEGER PRIMARY KEY REFERENCES sites(id) ON DELETE CASCADE,
            checked_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS snapshot_articles (
            id         INTEGER PRIMARY KEY,
            site_id    INTEGER NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
            url        TEXT NOT NULL,
            title      TEXT NOT NULL,
            position   INTEGER NOT NULL,
            UNIQUE(site_id, url)
        );
        CREATE INDEX IF NOT EXISTS idx_snapshot_site ON snapshot_articles(site_id);

        CREATE TABLE IF NOT EXISTS checks (
            id           INTEGER PRIMARY KEY,
            site_id      INTEGER NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
            url          TEXT NOT NULL,
            status       TEXT NOT NULL CHECK(status IN ('ok','failed')),
            attempts     INTEGER NOT NULL,
            articles     INTEGER,
            new_articles INTEGER,
            error_kind   TEXT,
            error        TEXT,
            latency_ms   INTEGER NOT NULL,
            checked_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_checks_site ON checks(site_id);
        CREATE INDEX IF NOT EXISTS idx_checks_kind ON checks(error_kind);
        ",
    )?;
    Ok(())
}

// ── Sites ──

pub struct SiteRow {
    pub id: i64,
    pub url: String,
    pub added_at: String,
    pub last_checked: Option<String>,
    pub articles: usize,
}

/// Returns false when the site was already monitored.
pub fn add_site(conn: &Connection, url: &str) -> Result<bool> {
    let n = conn.execute("INSERT OR IGNORE INTO sites (url) VALUES (?1)", [url])?;
    Ok(n > 0)
}

pub fn remove_site(conn: &Connection, url: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM sites WHERE url = ?1", [url])?;
    Ok(n > 0)
}

pub fn list_sites(conn: &Connection) -> Result<Vec<SiteRow>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.url, s.added_at, st.checked_at,
                (SELECT COUNT(*) FROM snapshot_articles a WHERE a.site_id = s.id)
         FROM sites s
         LEFT JOIN site_state st ON st.site_id = s.id
         ORDER BY s.id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SiteRow {
                id: row.get(0)?,
                url: row.get(1)?,
                added_at: row.get(2)?,
                last_checked: row.get(3)?,
                articles: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Snapshots ──

/// Article URLs from the last successful check; `None` if the site was never seen.
pub fn load_snapshot(conn: &Connection, site_id: i64) -> Result<Option<Vec<String>>> {
    let seen: Option<i64> = conn
        .query_row(
            "SELECT site_id FROM site_state WHERE site_id = ?1",
            [site_id],
            |r| r.get(0),
        )
        .optional()?;
    if seen.is_none() {
        return Ok(None);
    }
    let mut stmt =
        conn.prepare("SELECT url FROM snapshot_articles WHERE site_id = ?1 ORDER BY position")?;
    let urls = stmt
        .query_map([site_id], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(Some(urls))
}

// ── Checks ──

pub struct CheckRow {
    pub site_id: i64,
    pub url: String,
    /// Current articles on success; `None` leaves the snapshot untouched.
    pub articles: Option<Vec<Link>>,
    pub new_articles: usize,
    pub attempts: u32,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub latency_ms: i64,
}

/// Record a check and, on success, replace the site's snapshot.
pub fn save_check(conn: &Connection, row: &CheckRow) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO checks
         (site_id, url, status, attempts, articles, new_articles, error_kind, error, latency_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            row.site_id,
            row.url,
            if row.articles.is_some() { "ok" } else { "failed" },
            row.attempts,
            row.articles.as_ref().map(|a| a.len() as i64),
            row.articles.as_ref().map(|_| row.new_articles as i64),
            row.error_kind,
            row.error,
            row.latency_ms,
        ],
    )?;

    if let Some(articles) = &row.articles {
        tx.execute("DELETE FROM snapshot_articles WHERE site_id = ?1", [row.site_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO snapshot_articles (site_id, url, title, position)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (i, a) in articles.iter().enumerate() {
                stmt.execute(rusqlite::params![row.site_id, a.url, a.title, i as i64])?;
            }
        }
        tx.execute(
            "INSERT INTO site_state (site_id) VALUES (?1)
             ON CONFLICT(site_id) DO UPDATE SET checked_at = datetime('now')",
            [row.site_id],
        )?;
    }
    tx.commit()?;
    Ok(())
}

// ── Stats ──

pub struct Stats {
    pub sites: usize,
    pub articles: usize,
    pub checks: usize,
    pub failed: usize,
    pub failures_by_kind: Vec<(String, usize)>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let sites: usize = conn.query_row("SELECT COUNT(*) FROM sites", [], |r| r.get(0))?;
    let articles: usize =
        conn.query_row("SELECT COUNT(*) FROM snapshot_articles", [], |r| r.get(0))?;
    let checks: usize = conn.query_row("SELECT COUNT(*) FROM checks", [], |r| r.get(0))?;
    let failed: usize = conn.query_row(
        "SELECT COUNT(*) FROM checks WHERE status = 'failed'",
        [],
        |r| r.get(0),
    )?;
    let mut stmt = conn.prepare(
        "SELECT error_kind, COUNT(*) FROM checks
         WHERE status = 'failed' AND error_kind IS NOT NULL
         GROUP BY error_kind ORDER BY COUNT(*) DESC, error_kind",
    )?;
    let failures_by_kind = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stats {
        sites,
        articles,
        checks,
        failed,
        failures_by_kind,
    })
}
