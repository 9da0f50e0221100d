pub mod discovery;
pub mod pacing;
pub mod robots;
pub mod site;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use indicatif::MultiProgress;
use tracing::{error, info};

use crate::config::Settings;
use crate::db;
use crate::fetch::Fetch;
use crate::progress::{self, Progress};
use crate::rules::SiteRules;
use site::{SiteReport, SiteStatus, Stage};

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub user_agent: String,
    pub default_delay: Duration,
    pub max_page: u32,
    pub lookahead: u32,
}

impl CrawlOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            user_agent: settings.user_agent.clone(),
            default_delay: settings.default_delay(),
            max_page: settings.max_page,
            lookahead: settings.lookahead,
        }
    }
}

#[derive(Debug, Default)]
pub struct CrawlSummary {
    pub reports: Vec<SiteReport>,
    /// Sites whose task stopped early, with the reason.
    pub failed: Vec<(String, String)>,
}

impl CrawlSummary {
    pub fn added(&self) -> usize {
        self.reports.iter().map(|r| r.added).sum()
    }

    pub fn entries(&self) -> usize {
        self.reports.iter().map(|r| r.entries).sum()
    }
}

/// Crawl every site concurrently, one task and one database connection per
/// site. A failing site never stops the others.
pub async fn run(
    db_path: &Path,
    fetcher: Arc<dyn Fetch>,
    sites: Vec<SiteRules>,
    opts: &CrawlOptions,
    today: NaiveDate,
    multi: &MultiProgress,
) -> Result<CrawlSummary> {
    let progress = Arc::new(Progress::new(
        sites
            .iter()
            .map(|s| SiteStatus {
                site: s.name.clone(),
                ..Default::default()
            })
            .collect(),
    ));

    let mut set = tokio::task::JoinSet::new();
    for (slot, rules) in sites.into_iter().enumerate() {
        let fetcher = Arc::clone(&fetcher);
        let progress = Arc::clone(&progress);
        let db_path = db_path.to_path_buf();
        let opts = opts.clone();
        let pb = progress::task_bar(multi, &rules.name, 0)?;

        set.spawn(async move {
            let on_status = |s: &SiteStatus| {
                if let Stage::Scraping { page, total } = s.stage {
                    pb.set_length(total as u64);
                    pb.set_position(page.saturating_sub(1) as u64);
                }
                pb.set_message(format!("{} ({} new)", s.stage, s.added));
                progress.update(slot, |p| *p = s.clone());
            };

            let result: Result<SiteReport> = async {
                let mut conn = db::connect(&db_path)
                    .with_context(|| format!("cannot open database for {}", rules.name))?;
                site::crawl_site(fetcher.as_ref(), &mut conn, &rules, &opts, today, &on_status)
                    .await
            }
            .await;

            match &result {
                Ok(report) => {
                    pb.set_position(report.pages as u64);
                    pb.finish_with_message(format!(
                        "done: {} pages, {} new",
                        report.pages, report.added
                    ));
                }
                Err(e) => {
                    progress.update(slot, |p| p.stage = Stage::Failed);
                    pb.abandon_with_message(format!("failed: {}", e));
                }
            }
            (rules.name, result)
        });
    }

    let mut summary = CrawlSummary::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(report))) => summary.reports.push(report),
            Ok((site, Err(e))) => {
                error!("Crawl of {} failed: {:#}", site, e);
                summary.failed.push((site, format!("{:#}", e)));
            }
            Err(e) => error!("Crawl task panicked: {}", e),
        }
    }

    for status in progress.snapshot() {
        if !matches!(status.stage, Stage::Done | Stage::Failed) {
            summary
                .failed
                .push((status.site, format!("stopped while {}", status.stage)));
        }
    }
    summary.reports.sort_by(|a, b| a.site.cmp(&b.site));
    info!(
        sites = summary.reports.len(),
        failed = summary.failed.len(),
        added = summary.added(),
        "Crawl finished"
    );
    Ok(summary)
}
