use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use indicatif::MultiProgress;
use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use crate::crawl::pacing::Pacer;
use crate::crawl::robots;
use crate::db::{self, PostingRef, Selection};
use crate::fetch::{fetch_detail, DetailFetch, Fetch};
use crate::progress::{self, Progress};
use crate::rules::SiteRules;

#[derive(Debug, Clone)]
pub struct DetailOptions {
    pub user_agent: String,
    pub default_delay: Duration,
    pub selection: Selection,
    /// At most this many postings per site.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct DetailReport {
    pub site: String,
    pub selected: usize,
    /// Pages where the selectors found text.
    pub content: usize,
    /// Pages that loaded but matched nothing.
    pub empty: usize,
    pub failed: usize,
    /// Descriptions written.
    pub updated: usize,
    /// Text found, but the posting already had a description.
    pub skipped_had_description: usize,
    /// Postings whose result could not be stored.
    pub errors: usize,
    pub elapsed: Duration,
}

/// Write what one detail fetch produced: the description when the posting has
/// none yet, and today's check with the observed status. One commit per posting.
fn store(
    conn: &Connection,
    posting: &PostingRef,
    fetched: &DetailFetch,
    today: NaiveDate,
) -> Result<bool> {
    let tx = conn.unchecked_transaction()?;
    let updated = match fetched {
        DetailFetch::Content { text, .. } => db::fill_description(&tx, posting.id, text)?,
        _ => false,
    };
    db::record_check(&tx, posting.id, today, fetched.status())?;
    tx.commit()?;
    Ok(updated)
}

/// Fetch detail pages for one site's selected postings, strictly one after another.
pub async fn refresh_site(
    fetcher: &dyn Fetch,
    conn: &mut Connection,
    rules: &SiteRules,
    opts: &DetailOptions,
    today: NaiveDate,
    on_step: &(dyn Fn(usize, usize) + Sync),
) -> Result<DetailReport> {
    let started = Instant::now();
    let mut postings = db::postings_for_details(conn, &rules.name, opts.selection)?;
    if let Some(limit) = opts.limit {
        postings.truncate(limit);
    }

    let mut report = DetailReport {
        site: rules.name.clone(),
        selected: postings.len(),
        ..Default::default()
    };
    if postings.is_empty() {
        debug!(site = %rules.name, "no postings selected");
        return Ok(report);
    }
    if rules.details.is_empty() {
        warn!("{} has no detail selectors; only checks will be recorded", rules.name);
    }

    let delay =
        robots::resolve_delay(fetcher, &rules.name, &opts.user_agent, opts.default_delay).await;
    info!(site = %rules.name, postings = postings.len(), ?delay, "Fetching details");
    let mut pacer = Pacer::new(delay);

    for (i, posting) in postings.iter().enumerate() {
        on_step(i, postings.len());
        // Storing is part of the paced step, so its time counts as work.
        let conn = &mut *conn;
        let (fetched, stored) = pacer
            .run(|delay| async move {
                let fetched = fetch_detail(fetcher, &posting.url, &rules.details, delay).await;
                let stored = store(conn, posting, &fetched, today);
                (fetched, stored)
            })
            .await;

        match &fetched {
            DetailFetch::Content { .. } => report.content += 1,
            DetailFetch::NoContent { .. } => report.empty += 1,
            DetailFetch::Failed { .. } => report.failed += 1,
        }

        match stored {
            Ok(true) => report.updated += 1,
            Ok(false) => {
                if matches!(fetched, DetailFetch::Content { .. }) {
                    report.skipped_had_description += 1;
                }
            }
            Err(e) => {
                warn!("Could not store details of posting {}: {:#}", posting.id, e);
                report.errors += 1;
            }
        }
        debug!(
            posting = posting.id,
            status = ?fetched.status(),
            had_description = posting.has_description,
            "detail checked"
        );
    }
    on_step(postings.len(), postings.len());

    report.elapsed = started.elapsed();
    Ok(report)
}

/// Run the detail stage for every site concurrently, one task and connection per site.
pub async fn run(
    db_path: &Path,
    fetcher: Arc<dyn Fetch>,
    sites: Vec<SiteRules>,
    opts: &DetailOptions,
    today: NaiveDate,
    multi: &MultiProgress,
) -> Result<Vec<DetailReport>> {
    let progress = Arc::new(Progress::new(vec![(0usize, 0usize); sites.len()]));

    let mut set = tokio::task::JoinSet::new();
    for (slot, rules) in sites.into_iter().enumerate() {
        let fetcher = Arc::clone(&fetcher);
        let progress = Arc::clone(&progress);
        let db_path = db_path.to_path_buf();
        let opts = opts.clone();
        let pb = progress::task_bar(multi, &rules.name, 0)?;

        set.spawn(async move {
            let on_step = |done: usize, total: usize| {
                pb.set_length(total as u64);
                pb.set_position(done as u64);
                progress.update(slot, |p| *p = (done, total));
            };

            let result: Result<DetailReport> = async {
                let mut conn = db::connect(&db_path)
                    .with_context(|| format!("cannot open database for {}", rules.name))?;
                refresh_site(fetcher.as_ref(), &mut conn, &rules, &opts, today, &on_step).await
            }
            .await;

            match &result {
                Ok(r) => pb.finish_with_message(format!(
                    "{} filled, {} empty, {} failed",
                    r.updated, r.empty, r.failed
                )),
                Err(e) => pb.abandon_with_message(format!("failed: {}", e)),
            }
            (rules.name, result)
        });
    }

    let mut reports = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(report))) => reports.push(report),
            Ok((site, Err(e))) => error!("Detail stage for {} failed: {:#}", site, e),
            Err(e) => error!("Detail task panicked: {}", e),
        }
    }

    let unfinished = progress
        .snapshot()
        .into_iter()
        .filter(|(done, total)| done < total)
        .count();
    if unfinished > 0 {
        warn!("{} site(s) stopped before finishing", unfinished);
    }
    reports.sort_by(|a, b| a.site.cmp(&b.site));
    Ok(reports)
}
