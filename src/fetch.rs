use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::rules::ListingSelectors;

static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, Clone)]
pub struct RawPage {
    pub status: u16,
    pub body: String,
}

impl RawPage {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to read body: {0}")]
    Body(String),
}

/// A page source. Production code uses [`HttpFetcher`]; tests serve pages from memory.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn get(&self, url: &str) -> Result<RawPage, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn get(&self, url: &str) -> Result<RawPage, FetchError> {
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Transport(e.to_string())
            }
        })?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Body(e.to_string())
            }
        })?;
        Ok(RawPage { status, body })
    }
}

/// A posting as seen on a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub site: String,
    pub url: String,
    pub title: String,
    pub company: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetailFetch {
    Content { status: u16, text: String },
    /// The page loaded but none of the selectors matched any text.
    NoContent { status: u16 },
    Failed { status: Option<u16> },
}

impl DetailFetch {
    pub fn status(&self) -> Option<u16> {
        match self {
            DetailFetch::Content { status, .. } | DetailFetch::NoContent { status } => {
                Some(*status)
            }
            DetailFetch::Failed { status } => *status,
        }
    }
}

// ── Fetching ──

pub async fn fetch_listing(
    fetcher: &dyn Fetch,
    url: &str,
    site: &str,
    selectors: &ListingSelectors,
    delay: Duration,
) -> Vec<ListingEntry> {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    match fetcher.get(url).await {
        Ok(page) if page.is_success() => parse_listing(&page.body, url, site, selectors),
        Ok(page) => {
            warn!("Listing {} returned HTTP {}", url, page.status);
            Vec::new()
        }
        Err(e) => {
            warn!("Listing {} failed: {}", url, e);
            Vec::new()
        }
    }
}

pub async fn fetch_detail(
    fetcher: &dyn Fetch,
    url: &str,
    selectors: &[String],
    delay: Duration,
) -> DetailFetch {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    match fetcher.get(url).await {
        Ok(page) if page.is_success() => match parse_detail(&page.body, selectors) {
            Some(text) => DetailFetch::Content {
                status: page.status,
                text,
            },
            None => {
                debug!("No content matched on {}", url);
                DetailFetch::NoContent {
                    status: page.status,
                }
            }
        },
        Ok(page) => {
            warn!("Detail {} returned HTTP {}", url, page.status);
            DetailFetch::Failed {
                status: Some(page.status),
            }
        }
        Err(e) => {
            warn!("Detail {} failed: {}", url, e);
            DetailFetch::Failed { status: None }
        }
    }
}

// ── Parsing ──

fn compile(selector: &str) -> Option<Selector> {
    match Selector::parse(selector) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Invalid selector {:?}: {}", selector, e);
            None
        }
    }
}

fn collapse(text: &str) -> String {
    WS_RE.replace_all(text, " ").trim().to_string()
}

fn inline_text(el: ElementRef) -> String {
    collapse(&el.text().collect::<String>())
}

/// Text of each non-blank text node, one per line.
fn block_text(el: ElementRef) -> String {
    el.text()
        .map(collapse)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn resolve(page_url: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    match Url::parse(page_url).and_then(|u| u.join("/")) {
        Ok(origin) => origin.join(href).ok().map(String::from),
        Err(_) => Url::parse(href).ok().map(String::from),
    }
}

/// Extract listing entries. Cards missing a link, title or company are dropped.
pub fn parse_listing(
    html: &str,
    page_url: &str,
    site: &str,
    selectors: &ListingSelectors,
) -> Vec<ListingEntry> {
    let (Some(card_sel), Some(url_sel), Some(title_sel), Some(company_sel)) = (
        compile(&selectors.job_card),
        compile(&selectors.job_url),
        compile(&selectors.job_title),
        compile(&selectors.company_name),
    ) else {
        return Vec::new();
    };

    let doc = Html::parse_document(html);
    let mut entries = Vec::new();

    for card in doc.select(&card_sel) {
        let url = card
            .select(&url_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| resolve(page_url, href));
        let title = card.select(&title_sel).next().map(inline_text);
        let company = card.select(&company_sel).next().map(|el| {
            match el.value().attr("alt") {
                Some(alt) if el.value().name() == "img" && !alt.trim().is_empty() => {
                    alt.trim().to_string()
                }
                _ => inline_text(el),
            }
        });

        if let (Some(url), Some(title), Some(company)) = (url, title, company) {
            if !title.is_empty() && !company.is_empty() {
                entries.push(ListingEntry {
                    site: site.to_string(),
                    url,
                    title,
                    company,
                });
            }
        }
    }
    entries
}

/// Concatenate the text of every element matched by any selector.
/// Returns `None` when nothing non-blank matched.
pub fn parse_detail(html: &str, selectors: &[String]) -> Option<String> {
    let doc = Html::parse_document(html);
    let mut parts = Vec::new();

    for sel in selectors.iter().filter_map(|s| compile(s)) {
        for el in doc.select(&sel) {
            let text = block_text(el);
            if !text.is_empty() {
                parts.push(text);
            }
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory page source; unknown URLs answer 404.
    #[derive(Default)]
    pub struct FakeFetcher {
        pages: HashMap<String, (u16, String)>,
        pub requests: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        pub fn with(mut self, url: &str, status: u16, body: &str) -> Self {
            self.pages.insert(url.to_string(), (status, body.to_string()));
            self
        }

        pub fn hits(&self, url: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|u| u.as_str() == url)
                .count()
        }
    }

    #[async_trait]
    impl Fetch for FakeFetcher {
        async fn get(&self, url: &str) -> Result<RawPage, FetchError> {
            self.requests.lock().unwrap().push(url.to_string());
            match self.pages.get(url) {
                Some((status, body)) => Ok(RawPage {
                    status: *status,
                    body: body.clone(),
                }),
                None => Ok(RawPage {
                    status: 404,
                    body: String::new(),
                }),
            }
        }
    }

    /// Build a listing page with `n` cards in the `div.card` layout.
    pub fn listing_html(page: u32, n: usize) -> String {
        let mut html = String::from("<html><body><div id=\"results\">");
        for i in 0..n {
            html.push_str(&format!(
                "<div class=\"card\"><a class=\"title\" href=\"/jobs/{page}-{i}\">Job {page}-{i}</a>\
                 <span class=\"company\">Company {i}</span></div>"
            ));
        }
        html.push_str("</div></body></html>");
        html
    }

    pub fn card_selectors() -> ListingSelectors {
        ListingSelectors {
            job_card: "div.card".into(),
            job_url: "a.title".into(),
            job_title: "a.title".into(),
            company_name: "span.company".into(),
        }
    }
}
