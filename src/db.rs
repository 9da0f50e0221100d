use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::warn;

use crate::fetch::ListingEntry;
use crate::structure::normalize;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS postings (
            id           INTEGER PRIMARY KEY,
            site         TEXT NOT NULL,
            company_name TEXT NOT NULL,
            title        TEXT NOT NULL,
            url          TEXT NOT NULL,
            description  TEXT,
            created_at   TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at   TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(site, company_name, title)
        );
        CREATE INDEX IF NOT EXISTS idx_postings_url ON postings(url);
        CREATE INDEX IF NOT EXISTS idx_postings_site ON postings(site);

        CREATE TABLE IF NOT EXISTS check_records (
            id          INTEGER PRIMARY KEY,
            posting_id  INTEGER NOT NULL REFERENCES postings(id),
            check_date  TEXT NOT NULL,
            http_status INTEGER,
            UNIQUE(posting_id, check_date)
        );
        CREATE INDEX IF NOT EXISTS idx_checks_date ON check_records(check_date);

        CREATE TABLE IF NOT EXISTS site_state (
            site       TEXT PRIMARY KEY,
            last_page  INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    conn.execute_batch(&normalize::schema_sql())?;
    Ok(())
}

fn day(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

// ── Postings ──

#[derive(Debug, Clone)]
pub struct Posting {
    pub id: i64,
    pub site: String,
    pub company_name: String,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
}

impl Posting {
    pub fn has_description(&self) -> bool {
        self.description.as_deref().is_some_and(|d| !d.is_empty())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertReport {
    pub added: usize,
    pub existing: usize,
    pub checks_added: usize,
    pub url_updates: usize,
    pub failed: usize,
}

enum Upserted {
    Added,
    Existing { url_changed: bool, checked: bool },
}

/// Store one page of listing entries. Each entry runs in its own savepoint so
/// a bad entry is skipped without losing the rest of the batch.
///
/// The write lock is taken up front: entries read before they write, and a
/// read snapshot cannot be upgraded once another site's task has committed.
pub fn upsert_listings(
    conn: &mut Connection,
    entries: &[ListingEntry],
    today: NaiveDate,
) -> Result<UpsertReport> {
    let today = day(today);
    let mut report = UpsertReport::default();
    let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    for entry in entries {
        let sp = tx.savepoint()?;
        match upsert_one(&sp, entry, &today) {
            Ok(outcome) => {
                sp.commit()?;
                match outcome {
                    Upserted::Added => {
                        report.added += 1;
                        report.checks_added += 1;
                    }
                    Upserted::Existing {
                        url_changed,
                        checked,
                    } => {
                        report.existing += 1;
                        report.url_updates += url_changed as usize;
                        report.checks_added += checked as usize;
                    }
                }
            }
            Err(e) => {
                drop(sp);
                warn!(
                    site = %entry.site,
                    title = %entry.title,
                    "Skipping listing entry: {:#}", e
                );
                report.failed += 1;
            }
        }
    }

    tx.commit()?;
    Ok(report)
}

fn upsert_one(conn: &Connection, entry: &ListingEntry, today: &str) -> Result<Upserted> {
    let existing: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, url FROM postings WHERE site = ?1 AND company_name = ?2 AND title = ?3",
            params![entry.site, entry.company, entry.title],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match existing {
        Some((id, url)) => {
            let url_changed = url != entry.url;
            if url_changed {
                conn.execute(
                    "UPDATE postings SET url = ?2, updated_at = datetime('now') WHERE id = ?1",
                    params![id, entry.url],
                )?;
            }
            let checked = conn.execute(
                "INSERT OR IGNORE INTO check_records (posting_id, check_date) VALUES (?1, ?2)",
                params![id, today],
            )? > 0;
            Ok(Upserted::Existing {
                url_changed,
                checked,
            })
        }
        None => {
            let holder: Option<i64> = conn
                .query_row(
                    "SELECT id FROM postings WHERE url = ?1",
                    params![entry.url],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(other) = holder {
                bail!("url {} already belongs to posting {}", entry.url, other);
            }
            conn.execute(
                "INSERT INTO postings (site, company_name, title, url) VALUES (?1, ?2, ?3, ?4)",
                params![entry.site, entry.company, entry.title, entry.url],
            )?;
            let id = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO check_records (posting_id, check_date) VALUES (?1, ?2)",
                params![id, today],
            )?;
            Ok(Upserted::Added)
        }
    }
}

pub fn load_posting(conn: &Connection, id: i64) -> Result<Option<Posting>> {
    let posting = conn
        .query_row(
            "SELECT id, site, company_name, title, url, description FROM postings WHERE id = ?1",
            params![id],
            |row| {
                Ok(Posting {
                    id: row.get(0)?,
                    site: row.get(1)?,
                    company_name: row.get(2)?,
                    title: row.get(3)?,
                    url: row.get(4)?,
                    description: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(posting)
}

/// Write a description unless the posting already has one.
pub fn fill_description(conn: &Connection, id: i64, text: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE postings SET description = ?2, updated_at = datetime('now')
         WHERE id = ?1 AND (description IS NULL OR description = '')",
        params![id, text],
    )?;
    Ok(n > 0)
}

// ── Checks ──

/// Create today's check for a posting, or overwrite its status.
pub fn record_check(
    conn: &Connection,
    posting_id: i64,
    today: NaiveDate,
    status: Option<u16>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO check_records (posting_id, check_date, http_status) VALUES (?1, ?2, ?3)
         ON CONFLICT(posting_id, check_date) DO UPDATE SET http_status = excluded.http_status",
        params![posting_id, day(today), status],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Description is null or empty.
    MissingDescription,
    /// Last status-bearing check was 200, or the posting was never fetched.
    AliveOnly,
    All,
}

#[derive(Debug, Clone)]
pub struct PostingRef {
    pub id: i64,
    pub url: String,
    pub has_description: bool,
}

pub fn postings_for_details(
    conn: &Connection,
    site: &str,
    selection: Selection,
) -> Result<Vec<PostingRef>> {
    let filter = match selection {
        Selection::MissingDescription => "AND (p.description IS NULL OR p.description = '')",
        Selection::AliveOnly => {
            "AND (
                NOT EXISTS (SELECT 1 FROM check_records c
                            WHERE c.posting_id = p.id AND c.http_status IS NOT NULL)
                OR (SELECT c.http_status FROM check_records c
                    WHERE c.posting_id = p.id AND c.http_status IS NOT NULL
                    ORDER BY c.check_date DESC LIMIT 1) = 200
            )"
        }
        Selection::All => "",
    };
    let sql = format!(
        "SELECT p.id, p.url, (p.description IS NOT NULL AND p.description <> '')
         FROM postings p WHERE p.site = ?1 {} ORDER BY p.id",
        filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![site], |row| {
            Ok(PostingRef {
                id: row.get(0)?,
                url: row.get(1)?,
                has_description: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Site state ──

pub fn site_bound(conn: &Connection, site: &str) -> Result<Option<u32>> {
    let bound = conn
        .query_row(
            "SELECT last_page FROM site_state WHERE site = ?1",
            params![site],
            |row| row.get(0),
        )
        .optional()?;
    Ok(bound)
}

pub fn save_site_bound(conn: &Connection, site: &str, last_page: u32) -> Result<()> {
    conn.execute(
        "INSERT INTO site_state (site, last_page) VALUES (?1, ?2)
         ON CONFLICT(site) DO UPDATE SET last_page = excluded.last_page, updated_at = datetime('now')",
        params![site, last_page],
    )?;
    Ok(())
}

// ── Structuring ──

/// Postings with a description and no extracted detail, grouped by site in
/// id order, at most `per_site` from each site.
pub fn unstructured_by_site(
    conn: &Connection,
    per_site: Option<usize>,
) -> Result<Vec<(String, Vec<i64>)>> {
    let mut stmt = conn.prepare(
        "SELECT p.site, p.id FROM postings p
         WHERE p.description IS NOT NULL AND p.description <> ''
           AND NOT EXISTS (SELECT 1 FROM job_details d WHERE d.posting_id = p.id)
         ORDER BY p.site, p.id",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut grouped: Vec<(String, Vec<i64>)> = Vec::new();
    for (site, id) in rows {
        match grouped.last_mut() {
            Some((s, ids)) if *s == site => {
                if per_site.map_or(true, |n| ids.len() < n) {
                    ids.push(id);
                }
            }
            _ => {
                if per_site != Some(0) {
                    grouped.push((site, vec![id]));
                }
            }
        }
    }
    Ok(grouped)
}

// ── Stats ──

pub struct Stats {
    pub postings: i64,
    pub with_description: i64,
    pub structured: i64,
    pub checks: i64,
    pub checks_today: i64,
    pub per_site: Vec<SiteStats>,
}

pub struct SiteStats {
    pub site: String,
    pub postings: i64,
    pub with_description: i64,
    pub last_page: Option<u32>,
}

pub fn get_stats(conn: &Connection, today: NaiveDate) -> Result<Stats> {
    let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };

    let postings = count("SELECT COUNT(*) FROM postings")?;
    let with_description =
        count("SELECT COUNT(*) FROM postings WHERE description IS NOT NULL AND description <> ''")?;
    let structured = count("SELECT COUNT(*) FROM job_details")?;
    let checks = count("SELECT COUNT(*) FROM check_records")?;
    let checks_today = conn.query_row(
        "SELECT COUNT(*) FROM check_records WHERE check_date = ?1",
        params![day(today)],
        |r| r.get(0),
    )?;

    let mut stmt = conn.prepare(
        "SELECT p.site, COUNT(*),
                SUM(CASE WHEN p.description IS NOT NULL AND p.description <> '' THEN 1 ELSE 0 END),
                s.last_page
         FROM postings p LEFT JOIN site_state s ON s.site = p.site
         GROUP BY p.site ORDER BY p.site",
    )?;
    let per_site = stmt
        .query_map([], |row| {
            Ok(SiteStats {
                site: row.get(0)?,
                postings: row.get(1)?,
                with_description: row.get(2)?,
                last_page: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Stats {
        postings,
        with_description,
        structured,
        checks,
        checks_today,
        per_site,
    })
}

#[cfg(test)]
pub mod testing {
    use super::*;

    pub fn memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    pub fn entry(site: &str, company: &str, title: &str, url: &str) -> ListingEntry {
        ListingEntry {
            site: site.into(),
            url: url.into(),
            title: title.into(),
            company: company.into(),
        }
    }

    pub fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }

    pub fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }
}
