//! robots.txt crawl-delay resolution.

use std::time::Duration;

use tracing::debug;
use url::Url;

use crate::fetch::Fetch;

/// Crawl-delay directives of a robots.txt, grouped by user-agent.
#[derive(Debug, Clone, Default)]
pub struct RobotsTxt {
    groups: Vec<Group>,
}

#[derive(Debug, Clone, Default)]
struct Group {
    /// Lowercased agent tokens this group applies to.
    agents: Vec<String>,
    crawl_delay: Option<f64>,
}

impl RobotsTxt {
    pub fn parse(content: &str) -> Self {
        let mut groups: Vec<Group> = Vec::new();
        let mut current = Group::default();
        // A run of User-agent lines opens one group; the first other directive closes the run.
        let mut in_agent_run = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match key.trim().to_lowercase().as_str() {
                "user-agent" => {
                    if !in_agent_run {
                        if !current.agents.is_empty() {
                            groups.push(std::mem::take(&mut current));
                        }
                        in_agent_run = true;
                    }
                    current.agents.push(value.to_lowercase());
                }
                "crawl-delay" => {
                    in_agent_run = false;
                    match value.parse::<f64>() {
                        Ok(d) if d.is_finite() && d >= 0.0 => current.crawl_delay = Some(d),
                        _ => debug!("Ignoring unparsable Crawl-delay {:?}", value),
                    }
                }
                _ => in_agent_run = false,
            }
        }
        if !current.agents.is_empty() {
            groups.push(current);
        }
        Self { groups }
    }

    /// Delay for `user_agent`: exact agent match first, then a group whose
    /// token is contained in the agent name, then `*`.
    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        let agent = user_agent.to_lowercase();
        let exact = self.find(|a| a == agent);
        let partial = || self.find(|a| a != "*" && !a.is_empty() && agent.contains(a));
        let wildcard = || self.find(|a| a == "*");

        exact
            .or_else(partial)
            .or_else(wildcard)
            .and_then(|g| g.crawl_delay)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    fn find(&self, pred: impl Fn(&str) -> bool) -> Option<&Group> {
        self.groups
            .iter()
            .find(|g| g.agents.iter().any(|a| pred(a)) && g.crawl_delay.is_some())
    }
}

/// `scheme://host[:port]/robots.txt` for a site; bare hosts get `http://`.
pub fn robots_url(site: &str) -> Option<String> {
    let site = site.trim();
    let parsed = Url::parse(site)
        .ok()
        .filter(|u| u.has_host())
        .or_else(|| Url::parse(&format!("http://{}", site)).ok())?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{}:{}/robots.txt", parsed.scheme(), host, port),
        None => format!("{}://{}/robots.txt", parsed.scheme(), host),
    })
}

/// Resolve the crawl delay for a site. Any failure falls back to `default`.
pub async fn resolve_delay(
    fetcher: &dyn Fetch,
    site: &str,
    user_agent: &str,
    default: Duration,
) -> Duration {
    let Some(url) = robots_url(site) else {
        debug!("Cannot derive robots.txt URL for {}", site);
        return default;
    };
    match fetcher.get(&url).await {
        Ok(page) if page.is_success() => RobotsTxt::parse(&page.body)
            .crawl_delay(user_agent)
            .unwrap_or(default),
        Ok(page) => {
            debug!("{} returned HTTP {}", url, page.status);
            default
        }
        Err(e) => {
            debug!("{} unavailable: {}", url, e);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::FakeFetcher;

    const ROBOTS: &str = r#"
# comment
User-agent: *
Disallow: /private/
Crawl-delay: 2

User-agent: JobTaker
User-agent: OtherBot
Allow: /
Crawl-delay: 0.5

User-agent: slowbot
Crawl-delay: 10
"#;

    #[test]
    fn exact_agent_group() {
        let r = RobotsTxt::parse(ROBOTS);
        assert_eq!(r.crawl_delay("JobTaker"), Some(Duration::from_millis(500)));
        assert_eq!(r.crawl_delay("otherbot"), Some(Duration::from_millis(500)));
    }

    #[test]
    fn substring_then_wildcard() {
        let r = RobotsTxt::parse(ROBOTS);
        assert_eq!(r.crawl_delay("SlowBot/2.1"), Some(Duration::from_secs(10)));
        assert_eq!(r.crawl_delay("Unknown"), Some(Duration::from_secs(2)));
    }

    #[test]
    fn missing_or_bad_delay() {
        assert_eq!(RobotsTxt::parse("").crawl_delay("JobTaker"), None);
        let r = RobotsTxt::parse("User-agent: *\nCrawl-delay: soon\n");
        assert_eq!(r.crawl_delay("JobTaker"), None);
        let r = RobotsTxt::parse("User-agent: *\nCrawl-delay: -4\n");
        assert_eq!(r.crawl_delay("JobTaker"), None);
    }

    #[tokio::test]
    async fn absurd_delay_uses_default() {
        let r = RobotsTxt::parse("User-agent: *\nCrawl-delay: 1e30\n");
        assert_eq!(r.crawl_delay("JobTaker"), None);

        let default = Duration::from_secs(1);
        let f = FakeFetcher::default().with(
            "https://a.com/robots.txt",
            200,
            "User-agent: *\nCrawl-delay: 1e30\n",
        );
        assert_eq!(
            resolve_delay(&f, "https://a.com", "JobTaker", default).await,
            default
        );
    }

    #[test]
    fn robots_urls() {
        assert_eq!(
            robots_url("https://jobs.example.com/search?q=1").as_deref(),
            Some("https://jobs.example.com/robots.txt")
        );
        assert_eq!(
            robots_url("http://localhost:8080").as_deref(),
            Some("http://localhost:8080/robots.txt")
        );
        assert_eq!(
            robots_url("jobs.example.com").as_deref(),
            Some("http://jobs.example.com/robots.txt")
        );
    }

    #[tokio::test]
    async fn falls_back_to_default() {
        let default = Duration::from_secs(1);
        let empty = FakeFetcher::default();
        assert_eq!(
            resolve_delay(&empty, "https://a.com", "JobTaker", default).await,
            default
        );

        let f = FakeFetcher::default().with("https://a.com/robots.txt", 200, ROBOTS);
        assert_eq!(
            resolve_delay(&f, "https://a.com", "JobTaker", default).await,
            Duration::from_millis(500)
        );
    }
}
