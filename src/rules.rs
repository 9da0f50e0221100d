use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

const PAGE_PLACEHOLDER: &str = "{page}";

/// One site's crawl rules, as stored in the rule document.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteRules {
    /// Site identity; also the base URL robots.txt is resolved against.
    pub name: String,
    pub pagination: String,
    #[serde(flatten)]
    pub listing: ListingSelectors,
    #[serde(default)]
    pub details: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingSelectors {
    pub job_card: String,
    pub job_url: String,
    pub job_title: String,
    pub company_name: String,
}

impl SiteRules {
    pub fn page_url(&self, page: u32) -> String {
        self.pagination.replace(PAGE_PLACEHOLDER, &page.to_string())
    }
}

pub fn load(path: &Path) -> Result<Vec<SiteRules>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rules file {}", path.display()))?;
    parse(&raw).with_context(|| format!("Invalid rules file {}", path.display()))
}

pub fn parse(raw: &str) -> Result<Vec<SiteRules>> {
    let rules: Vec<SiteRules> = serde_json::from_str(raw)?;
    for r in &rules {
        if r.name.trim().is_empty() {
            bail!("site rule with empty name");
        }
        if !r.pagination.contains(PAGE_PLACEHOLDER) {
            bail!("pagination for {} has no {} placeholder", r.name, PAGE_PLACEHOLDER);
        }
    }
    Ok(rules)
}
