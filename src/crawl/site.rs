use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::Connection;
use tracing::{debug, info};

use super::discovery::{self, PageCounter};
use super::pacing::Pacer;
use super::robots;
use super::CrawlOptions;
use crate::db;
use crate::fetch::{fetch_listing, Fetch};
use crate::rules::SiteRules;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Stage {
    #[default]
    Pending,
    ResolvingPolicy,
    DiscoveringBound,
    Scraping {
        page: u32,
        total: u32,
    },
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Pending => write!(f, "waiting"),
            Stage::ResolvingPolicy => write!(f, "reading robots.txt"),
            Stage::DiscoveringBound => write!(f, "finding last page"),
            Stage::Scraping { page, total } => write!(f, "page {}/{}", page, total),
            Stage::Done => write!(f, "done"),
            Stage::Failed => write!(f, "failed"),
        }
    }
}

/// What one site task publishes to the shared progress table.
#[derive(Debug, Clone, Default)]
pub struct SiteStatus {
    pub site: String,
    pub stage: Stage,
    pub entries: usize,
    pub added: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SiteReport {
    pub site: String,
    pub delay: Duration,
    pub last_page: u32,
    pub pages: u32,
    pub entries: usize,
    pub added: usize,
    pub existing: usize,
    pub checks_added: usize,
    /// Known postings seen at a new URL.
    pub url_updates: usize,
    pub failed_entries: usize,
    pub elapsed: Duration,
}

/// Counts listing entries per page, paced like every other request to the site.
struct ListingCounter<'a> {
    fetcher: &'a dyn Fetch,
    rules: &'a SiteRules,
    pacer: &'a mut Pacer,
}

#[async_trait]
impl PageCounter for ListingCounter<'_> {
    async fn count(&mut self, page: u32) -> usize {
        let url = self.rules.page_url(page);
        let (fetcher, rules) = (self.fetcher, self.rules);
        self.pacer
            .run(|delay| fetch_listing(fetcher, &url, &rules.name, &rules.listing, delay))
            .await
            .len()
    }
}

/// Crawl one site end to end: resolve its crawl delay, find the last listing
/// page, then store every page's entries as soon as the page is read.
pub async fn crawl_site(
    fetcher: &dyn Fetch,
    conn: &mut Connection,
    rules: &SiteRules,
    opts: &CrawlOptions,
    today: NaiveDate,
    on_status: &(dyn Fn(&SiteStatus) + Sync),
) -> Result<SiteReport> {
    let started = Instant::now();
    let mut status = SiteStatus {
        site: rules.name.clone(),
        ..Default::default()
    };

    status.stage = Stage::ResolvingPolicy;
    on_status(&status);
    let delay =
        robots::resolve_delay(fetcher, &rules.name, &opts.user_agent, opts.default_delay).await;
    info!(site = %rules.name, ?delay, "Crawl delay resolved");
    let mut pacer = Pacer::new(delay);

    status.stage = Stage::DiscoveringBound;
    on_status(&status);
    let hint = db::site_bound(conn, &rules.name)?;
    let found = {
        let mut counter = ListingCounter {
            fetcher,
            rules,
            pacer: &mut pacer,
        };
        discovery::discover(&mut counter, opts.max_page, opts.lookahead, hint).await
    };
    info!(
        site = %rules.name,
        last_page = found.last_page,
        probes = found.probes,
        "Listing bound found"
    );
    db::save_site_bound(conn, &rules.name, found.last_page)?;

    let mut report = SiteReport {
        site: rules.name.clone(),
        delay,
        last_page: found.last_page,
        ..Default::default()
    };

    for page in 1..=found.last_page {
        status.stage = Stage::Scraping {
            page,
            total: found.last_page,
        };
        on_status(&status);

        let url = rules.page_url(page);
        // Storing is part of the paced step, so its time counts as work.
        let conn = &mut *conn;
        let (found_entries, stored) = pacer
            .run(|delay| async move {
                let entries =
                    fetch_listing(fetcher, &url, &rules.name, &rules.listing, delay).await;
                let stored = if entries.is_empty() {
                    None
                } else {
                    Some(db::upsert_listings(conn, &entries, today))
                };
                (entries.len(), stored)
            })
            .await;
        report.pages += 1;
        report.entries += found_entries;
        debug!(site = %rules.name, page, entries = found_entries, "page read");
        let Some(stored) = stored else {
            continue;
        };

        let stored =
            stored.with_context(|| format!("storing page {} of {}", page, rules.name))?;
        report.added += stored.added;
        report.existing += stored.existing;
        report.checks_added += stored.checks_added;
        report.url_updates += stored.url_updates;
        report.failed_entries += stored.failed;

        status.entries = report.entries;
        status.added = report.added;
    }

    status.stage = Stage::Done;
    on_status(&status);
    report.elapsed = started.elapsed();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::db::testing::{count, date, memory};
    use crate::fetch::testing::{card_selectors, listing_html, FakeFetcher};
    use crate::rules::SiteRules;

    fn board() -> SiteRules {
        SiteRules {
            name: "https://board.test".into(),
            pagination: "https://board.test/jobs?page={page}".into(),
            listing: card_selectors(),
            details: vec![],
        }
    }

    fn three_pages() -> FakeFetcher {
        FakeFetcher::default()
            .with("https://board.test/jobs?page=1", 200, &listing_html(1, 2))
            .with("https://board.test/jobs?page=2", 200, &listing_html(2, 2))
            .with("https://board.test/jobs?page=3", 200, &listing_html(3, 0))
    }

    fn opts() -> CrawlOptions {
        CrawlOptions {
            user_agent: "JobTaker".into(),
            default_delay: Duration::ZERO,
            max_page: 500,
            lookahead: 1,
        }
    }

    #[tokio::test]
    async fn crawl_is_idempotent_within_a_day() {
        let fetcher = three_pages();
        let mut conn = memory();
        let today = date("2026-03-02");

        let first = crawl_site(&fetcher, &mut conn, &board(), &opts(), today, &|_| {})
            .await
            .unwrap();
        assert_eq!(first.last_page, 2);
        assert_eq!(first.pages, 2);
        assert_eq!(first.entries, 4);
        assert_eq!(first.added, 4);
        assert_eq!(first.checks_added, 4);
        assert_eq!(count(&conn, "postings"), 4);
        assert_eq!(count(&conn, "check_records"), 4);
        assert_eq!(db::site_bound(&conn, "https://board.test").unwrap(), Some(2));

        let again = crawl_site(&fetcher, &mut conn, &board(), &opts(), today, &|_| {})
            .await
            .unwrap();
        assert_eq!(again.last_page, 2);
        assert_eq!(again.added, 0);
        assert_eq!(again.existing, 4);
        assert_eq!(again.checks_added, 0);
        assert_eq!(count(&conn, "postings"), 4);
        assert_eq!(count(&conn, "check_records"), 4);
    }

    #[tokio::test]
    async fn next_day_adds_checks_only() {
        let fetcher = three_pages();
        let mut conn = memory();
        crawl_site(&fetcher, &mut conn, &board(), &opts(), date("2026-03-02"), &|_| {})
            .await
            .unwrap();
        let next = crawl_site(&fetcher, &mut conn, &board(), &opts(), date("2026-03-03"), &|_| {})
            .await
            .unwrap();
        assert_eq!(next.added, 0);
        assert_eq!(next.checks_added, 4);
        assert_eq!(count(&conn, "postings"), 4);
        assert_eq!(count(&conn, "check_records"), 8);
    }

    #[tokio::test]
    async fn empty_site_stores_nothing() {
        let fetcher = FakeFetcher::default();
        let mut conn = memory();
        let report = crawl_site(&fetcher, &mut conn, &board(), &opts(), date("2026-03-02"), &|_| {})
            .await
            .unwrap();
        assert_eq!(report.last_page, 0);
        assert_eq!(report.pages, 0);
        assert_eq!(count(&conn, "postings"), 0);
        assert_eq!(fetcher.hits("https://board.test/jobs?page=1"), 1);
    }

    #[tokio::test]
    async fn publishes_stages_in_order() {
        let fetcher = three_pages();
        let mut conn = memory();
        let seen = Mutex::new(Vec::new());
        let record = |s: &SiteStatus| seen.lock().unwrap().push(s.stage);
        crawl_site(&fetcher, &mut conn, &board(), &opts(), date("2026-03-02"), &record)
            .await
            .unwrap();

        assert_eq!(
            seen.into_inner().unwrap(),
            vec![
                Stage::ResolvingPolicy,
                Stage::DiscoveringBound,
                Stage::Scraping { page: 1, total: 2 },
                Stage::Scraping { page: 2, total: 2 },
                Stage::Done,
            ]
        );
    }

    #[tokio::test]
    async fn robots_delay_is_used() {
        let fetcher = three_pages().with(
            "https://board.test/robots.txt",
            200,
            "User-agent: JobTaker\nCrawl-delay: 0.01\n",
        );
        let mut conn = memory();
        let report = crawl_site(&fetcher, &mut conn, &board(), &opts(), date("2026-03-02"), &|_| {})
            .await
            .unwrap();
        assert!(report.delay > Duration::ZERO && report.delay < Duration::from_millis(20));
        assert_eq!(report.added, 4);
    }
}
