mod config;
mod crawl;
mod db;
mod details;
mod fetch;
mod progress;
mod rules;
mod structure;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use config::Settings;
use crawl::CrawlOptions;
use db::Selection;
use details::{DetailOptions, DetailReport};
use fetch::{Fetch, HttpFetcher};
use structure::llm::ChatClient;
use structure::StructureOptions;

#[derive(Parser)]
#[command(name = "job_scraper", about = "Crawl job boards and structure postings with an LLM")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Crawl listing pages of every configured site
    Crawl,
    /// Fetch descriptions for postings that have none
    Details {
        /// Max postings per site (default: all)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Re-check postings that were alive on their last check
    Recheck {
        /// Re-check every posting, not only alive ones
        #[arg(long)]
        all: bool,
        /// Max postings per site (default: all)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Extract structured details from descriptions
    Structure {
        /// Max postings per site (default: all pending)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Concurrent workers (default from settings)
        #[arg(long)]
        workers: Option<usize>,
        /// Jobs a worker takes from the queue at once (default from settings)
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Show corpus statistics
    Stats,
    /// Print the structured details of one posting as JSON
    Show {
        /// Posting id
        id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load()?;
    let today = chrono::Local::now().date_naive();

    let result = match cli.command {
        Commands::Init => {
            open_db(&settings)?;
            println!("Database ready at {}", settings.db_path.display());
            Ok(())
        }
        Commands::Crawl => {
            open_db(&settings)?;
            let sites = rules::load(&settings.rules_path)?;
            println!("Crawling {} sites...", sites.len());

            let multi = MultiProgress::new();
            let summary = crawl::run(
                &settings.db_path,
                http_fetcher(&settings)?,
                sites,
                &CrawlOptions::from_settings(&settings),
                today,
                &multi,
            )
            .await?;

            println!(
                "\n{:<32} | {:>6} | {:>9} | {:>5} | {:>7} | {:>5} | {:>8} | {:>5} | {:>6} | {:>8}",
                "Site", "Delay", "Last page", "Pages", "Entries", "New", "Existing", "Moved",
                "Failed", "Time"
            );
            println!("{}", "-".repeat(120));
            for r in &summary.reports {
                println!(
                    "{:<32} | {:>5.1}s | {:>9} | {:>5} | {:>7} | {:>5} | {:>8} | {:>5} | {:>6} | {:>8}",
                    truncate(&r.site, 32),
                    r.delay.as_secs_f64(),
                    r.last_page,
                    r.pages,
                    r.entries,
                    r.added,
                    r.existing,
                    r.url_updates,
                    r.failed_entries,
                    format_duration(r.elapsed)
                );
            }
            for (site, reason) in &summary.failed {
                println!("{:<32} | FAILED: {}", truncate(site, 32), reason);
            }
            println!(
                "\n{} entries seen, {} new postings.",
                summary.entries(),
                summary.added()
            );
            Ok(())
        }
        Commands::Details { limit } => {
            run_details(&settings, Selection::MissingDescription, limit, today).await
        }
        Commands::Recheck { all, limit } => {
            let selection = if all {
                Selection::All
            } else {
                Selection::AliveOnly
            };
            run_details(&settings, selection, limit, today).await
        }
        Commands::Structure {
            limit,
            workers,
            batch_size,
        } => {
            open_db(&settings)?;
            let client = ChatClient::from_settings(&settings)?;
            let opts = StructureOptions {
                workers: workers.unwrap_or(settings.workers).max(1),
                batch_size: batch_size.unwrap_or(settings.batch_size).max(1),
                per_site_limit: limit,
                max_chars: settings.max_body_chars,
            };

            let pb = ProgressBar::new(0);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
                    .progress_chars("=> "),
            );
            let s = structure::run(
                &settings.db_path,
                Arc::new(client),
                &opts,
                &settings.error_log_dir,
                pb,
            )
            .await?;

            if s.total == 0 {
                println!("Nothing to structure. Run 'details' first.");
                return Ok(());
            }
            println!("\nPending per site:");
            for (site, n) in &s.per_site {
                println!("  {:<40} {:>6}", truncate(site, 40), n);
            }
            println!("\nPer worker:");
            for (i, w) in s.per_worker.iter().enumerate() {
                println!(
                    "  #{:<2} {:>5} jobs | structured {:>5} | skipped {:>4} | failed {:>4} | last site {}",
                    i,
                    w.done(),
                    w.structured,
                    w.skipped_existing + w.skipped_missing,
                    w.failed,
                    w.site.as_deref().unwrap_or("-")
                );
            }
            println!(
                "\nStructured {} of {} ({} already done, {} without description, {} failed).",
                s.structured, s.total, s.skipped_existing, s.skipped_missing, s.failed
            );
            if let Some(path) = &s.log_path {
                println!("Failures logged to {}", path.display());
            }
            Ok(())
        }
        Commands::Stats => {
            let conn = open_db(&settings)?;
            let s = db::get_stats(&conn, today)?;
            println!("Postings:          {}", s.postings);
            println!("With description:  {}", s.with_description);
            println!("Structured:        {}", s.structured);
            println!("Checks:            {}", s.checks);
            println!("Checked today:     {}", s.checks_today);
            if !s.per_site.is_empty() {
                println!(
                    "\n{:<40} | {:>8} | {:>11} | {:>9}",
                    "Site", "Postings", "Description", "Last page"
                );
                println!("{}", "-".repeat(78));
                for site in &s.per_site {
                    let last = site
                        .last_page
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".into());
                    println!(
                        "{:<40} | {:>8} | {:>11} | {:>9}",
                        truncate(&site.site, 40),
                        site.postings,
                        site.with_description,
                        last
                    );
                }
            }
            Ok(())
        }
        Commands::Show { id } => {
            let conn = open_db(&settings)?;
            let posting = db::load_posting(&conn, id)?
                .with_context(|| format!("No posting with id {}", id))?;
            println!(
                "#{} [{}] {} | {} | {}",
                posting.id, posting.site, posting.title, posting.company_name, posting.url
            );
            match structure::normalize::load_detail(&conn, id)? {
                Some(detail) => println!("{}", serde_json::to_string_pretty(&detail)?),
                None => println!("Not structured yet."),
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn open_db(settings: &Settings) -> anyhow::Result<rusqlite::Connection> {
    let conn = db::connect(&settings.db_path)?;
    db::init_schema(&conn)?;
    Ok(conn)
}

fn http_fetcher(settings: &Settings) -> anyhow::Result<Arc<dyn Fetch>> {
    let fetcher = HttpFetcher::new(&settings.user_agent, settings.request_timeout())?;
    Ok(Arc::new(fetcher))
}

async fn run_details(
    settings: &Settings,
    selection: Selection,
    limit: Option<usize>,
    today: chrono::NaiveDate,
) -> anyhow::Result<()> {
    open_db(settings)?;
    let sites = rules::load(&settings.rules_path)?;
    let opts = DetailOptions {
        user_agent: settings.user_agent.clone(),
        default_delay: settings.default_delay(),
        selection,
        limit,
    };

    let multi = MultiProgress::new();
    let reports = details::run(
        &settings.db_path,
        http_fetcher(settings)?,
        sites,
        &opts,
        today,
        &multi,
    )
    .await?;

    println!(
        "\n{:<32} | {:>8} | {:>7} | {:>5} | {:>6} | {:>6} | {:>4} | {:>8}",
        "Site", "Selected", "Content", "Empty", "Failed", "Filled", "Kept", "Time"
    );
    println!("{}", "-".repeat(100));
    for r in &reports {
        println!(
            "{:<32} | {:>8} | {:>7} | {:>5} | {:>6} | {:>6} | {:>4} | {:>8}",
            truncate(&r.site, 32),
            r.selected,
            r.content,
            r.empty,
            r.failed,
            r.updated,
            r.skipped_had_description,
            format_duration(r.elapsed)
        );
    }
    let errors: usize = reports.iter().map(|r: &DetailReport| r.errors).sum();
    if errors > 0 {
        println!("{} postings could not be saved; see log output.", errors);
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
