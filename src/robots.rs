//! robots.txt parsing and a per-authority gate for bot user agents.
//!
//! [`RobotsTxt`] understands `User-agent` groups (several agents may share a group, and
//! `MyBot/1.0` addresses `MyBot`), `Allow`/`Disallow` with `*` and `$` patterns,
//! `Crawl-delay` and `Sitemap`. The most specific (longest) matching rule decides; on a tie
//! `Allow` wins.
//!
//! [`RobotsTxtHandler`] fetches robots.txt once per `scheme://host[:port]` through a
//! [`RobotsTxtFetcher`] (normally the loader itself) and memoizes the result for the rest of
//! the run. A failed fetch or an unreadable file is remembered as "allow everything".

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use robotstxt::DefaultMatcher;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::LoadError;
use crate::http::Response;
use crate::user_agent::UserAgent;

const ROBOTS_PATH: &str = "/robots.txt";

#[derive(Debug, Clone, Default, PartialEq)]
struct Group {
    agents: Vec<String>,
    has_directives: bool,
    crawl_delay: Option<f64>,
}

/// A parsed robots.txt file.
///
/// `Allow`/`Disallow` matching is delegated to [`robotstxt::DefaultMatcher`]; the groups kept
/// here only answer which agents are addressed, `Crawl-delay` and `Sitemap`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RobotsTxt {
    content: String,
    groups: Vec<Group>,
    sitemaps: Vec<String>,
}

impl RobotsTxt {
    /// Parses robots.txt content. Unknown directives and malformed lines are ignored.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut robots = Self {
            content: content.to_string(),
            ..Self::default()
        };
        let mut current: Option<Group> = None;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match key.trim().to_ascii_lowercase().as_str() {
                "user-agent" => {
                    if current.as_ref().is_some_and(|g| g.has_directives) {
                        robots.groups.extend(current.take());
                    }
                    current
                        .get_or_insert_with(Group::default)
                        .agents
                        .push(agent_token(value));
                }
                "allow" | "disallow" => {
                    if let Some(group) = current.as_mut() {
                        group.has_directives = true;
                    }
                }
                "crawl-delay" => {
                    if let Some(group) = current.as_mut() {
                        group.has_directives = true;
                        if let Ok(delay) = value.parse::<f64>() {
                            group.crawl_delay = Some(delay);
                        }
                    }
                }
                "sitemap" => {
                    if !value.is_empty() {
                        robots.sitemaps.push(value.to_string());
                    }
                }
                _ => {}
            }
        }
        robots.groups.extend(current);
        robots
    }

    /// Groups that apply to `product_token`: its own groups, else (unless `ignore_wildcard`)
    /// the `*` groups.
    fn groups_for(&self, product_token: &str, ignore_wildcard: bool) -> Vec<&Group> {
        let token = agent_token(product_token);
        let own: Vec<&Group> = self
            .groups
            .iter()
            .filter(|g| g.agents.iter().any(|agent| *agent == token))
            .collect();
        if !own.is_empty() || ignore_wildcard {
            return own;
        }
        self.groups
            .iter()
            .filter(|g| g.agents.iter().any(|agent| agent == "*"))
            .collect()
    }

    /// Whether `product_token` may fetch `url`.
    ///
    /// With `ignore_wildcard`, a file without a group naming the bot allows everything.
    #[must_use]
    pub fn is_allowed(&self, url: &Url, product_token: &str, ignore_wildcard: bool) -> bool {
        if ignore_wildcard && self.groups_for(product_token, true).is_empty() {
            return true;
        }
        // A group naming the bot always takes precedence over `*` in the matcher.
        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&self.content, product_token, url.as_str())
    }

    /// `Crawl-delay` in seconds for `product_token`, if declared.
    #[must_use]
    pub fn crawl_delay(&self, product_token: &str, ignore_wildcard: bool) -> Option<f64> {
        self.groups_for(product_token, ignore_wildcard)
            .into_iter()
            .find_map(|g| g.crawl_delay)
    }

    /// `Sitemap` URLs in declaration order.
    #[must_use]
    pub fn sitemaps(&self) -> &[String] {
        &self.sitemaps
    }
}

/// The product token of a `User-agent` value (`MyBot/1.0` -> `mybot`), or `*`.
fn agent_token(value: &str) -> String {
    let value = value.trim();
    if value.starts_with('*') {
        return "*".to_string();
    }
    value
        .chars()
        .take_while(|c| c.is_ascii_alphabetic() || *c == '-' || *c == '_')
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Something that can load a robots.txt URL, bypassing the robots check itself.
#[async_trait]
pub trait RobotsTxtFetcher: Send + Sync {
    /// Loads `url` (an authority's `/robots.txt`).
    async fn fetch_robots_txt(&self, url: &Url) -> Result<Response, LoadError>;
}

/// Why a robots.txt could not be used.
#[derive(Debug, thiserror::Error)]
pub enum RobotsError {
    #[error("failed to load robots.txt: {0}")]
    Load(#[from] LoadError),
    #[error("robots.txt returned status {0}")]
    Status(u16),
    #[error("robots.txt is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

type RobotsSlot = Arc<OnceCell<Option<Arc<RobotsTxt>>>>;

/// Memoizing robots.txt gate for one user agent.
#[derive(Debug)]
pub struct RobotsTxtHandler {
    user_agent: UserAgent,
    ignore_wildcard: bool,
    cache: DashMap<String, RobotsSlot>,
}

impl RobotsTxtHandler {
    #[must_use]
    pub fn new(user_agent: UserAgent) -> Self {
        Self {
            user_agent,
            ignore_wildcard: false,
            cache: DashMap::new(),
        }
    }

    /// Only rules addressed to the bot's own product token count; `*` groups are ignored.
    #[must_use]
    pub fn ignore_wildcard_rules(mut self) -> Self {
        self.ignore_wildcard = true;
        self
    }

    #[must_use]
    pub fn user_agent(&self) -> &UserAgent {
        &self.user_agent
    }

    /// Whether the configured user agent may load `url`.
    ///
    /// Always `true` for non-bot user agents and for robots.txt URLs themselves.
    #[instrument(skip(self, fetcher), fields(url = %url))]
    pub async fn is_allowed(&self, url: &Url, fetcher: &dyn RobotsTxtFetcher) -> bool {
        let Some(token) = self.user_agent.product_token() else {
            return true;
        };
        if url.path() == ROBOTS_PATH {
            return true;
        }
        let Some(robots) = self.robots_for(url, fetcher).await else {
            return true;
        };
        let allowed = robots.is_allowed(url, token, self.ignore_wildcard);
        if !allowed {
            debug!(url = %url, token, "robots.txt disallows url");
        }
        allowed
    }

    /// `Sitemap` URLs declared in the robots.txt of `url`'s authority.
    pub async fn sitemaps(&self, url: &Url, fetcher: &dyn RobotsTxtFetcher) -> Vec<String> {
        self.robots_for(url, fetcher)
            .await
            .map(|robots| robots.sitemaps().to_vec())
            .unwrap_or_default()
    }

    /// `Crawl-delay` (seconds) addressed to this bot in `url`'s robots.txt.
    pub async fn crawl_delay(&self, url: &Url, fetcher: &dyn RobotsTxtFetcher) -> Option<f64> {
        let token = self.user_agent.product_token()?;
        self.robots_for(url, fetcher)
            .await?
            .crawl_delay(token, self.ignore_wildcard)
    }

    async fn robots_for(&self, url: &Url, fetcher: &dyn RobotsTxtFetcher) -> Option<Arc<RobotsTxt>> {
        let authority = authority(url)?;
        // Clone the slot so the DashMap shard lock is released before awaiting.
        let slot = self.cache.entry(authority.clone()).or_default().value().clone();
        slot.get_or_init(|| async {
            match fetch_and_parse(&authority, fetcher).await {
                Ok(robots) => Some(Arc::new(robots)),
                Err(e) => {
                    warn!(authority = %authority, error = %e, "robots.txt unavailable - allowing all");
                    None
                }
            }
        })
        .await
        .clone()
    }
}

async fn fetch_and_parse(authority: &str, fetcher: &dyn RobotsTxtFetcher) -> Result<RobotsTxt, RobotsError> {
    let robots_url = Url::parse(&format!("{authority}{ROBOTS_PATH}"))
        .map_err(|_| LoadError::invalid_url(authority))?;
    let response = fetcher.fetch_robots_txt(&robots_url).await?;
    match response.status {
        200..=299 => Ok(RobotsTxt::parse(&String::from_utf8(response.body)?)),
        // No robots.txt (or not visible to us) means no restrictions.
        400..=499 => {
            debug!(authority, status = response.status, "no robots.txt - allowing all");
            Ok(RobotsTxt::default())
        }
        status => Err(RobotsError::Status(status)),
    }
}

/// `scheme://host[:port]` of a URL, the robots.txt cache key.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use crawler_core::robots::authority;
///
/// let url = Url::parse("https://example.com:8443/a?b").unwrap();
/// assert_eq!(authority(&url).as_deref(), Some("https://example.com:8443"));
/// ```
#[must_use]
pub fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    const ROBOTS: &str = "\
# comment
User-agent: *
Disallow: /private/
Allow: /private/open
Crawl-delay: 2

User-agent: MyBot
User-agent: OtherBot
Disallow: /no-bots
Disallow: /*.pdf$

Sitemap: https://example.com/sitemap.xml
Sitemap: https://example.com/news.xml
";

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    struct StubFetcher {
        response: Result<Response, u16>,
        calls: AtomicU32,
    }

    impl StubFetcher {
        fn ok(status: u16, body: &str) -> Self {
            Self {
                response: Ok(Response::new(status).with_body(body)),
                calls: AtomicU32::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                response: Err(0),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl RobotsTxtFetcher for StubFetcher {
        async fn fetch_robots_txt(&self, url: &Url) -> Result<Response, LoadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(url.path(), "/robots.txt");
            self.response
                .clone()
                .map_err(|_| LoadError::Timeout { url: url.to_string() })
        }
    }

    #[test]
    fn test_wildcard_group_rules() {
        let robots = RobotsTxt::parse(ROBOTS);
        assert!(!robots.is_allowed(&url("https://example.com/private/x"), "SomeBot", false));
        assert!(robots.is_allowed(&url("https://example.com/private/open"), "SomeBot", false));
        assert!(robots.is_allowed(&url("https://example.com/public"), "SomeBot", false));
    }

    #[test]
    fn test_own_group_replaces_wildcard_group() {
        let robots = RobotsTxt::parse(ROBOTS);
        // MyBot has its own group, so the * group does not apply.
        assert!(robots.is_allowed(&url("https://example.com/private/x"), "mybot", false));
        assert!(!robots.is_allowed(&url("https://example.com/no-bots/page"), "MyBot", false));
        assert!(!robots.is_allowed(&url("https://example.com/no-bots/page"), "OtherBot", false));
    }

    #[test]
    fn test_wildcard_and_anchor_patterns() {
        let robots = RobotsTxt::parse(ROBOTS);
        assert!(!robots.is_allowed(&url("https://example.com/docs/file.pdf"), "MyBot", false));
        assert!(robots.is_allowed(&url("https://example.com/docs/file.pdf?x=1"), "MyBot", false));
        assert!(robots.is_allowed(&url("https://example.com/docs/file.pdfx"), "MyBot", false));
    }

    #[test]
    fn test_ignore_wildcard_rules() {
        let robots = RobotsTxt::parse(ROBOTS);
        assert!(robots.is_allowed(&url("https://example.com/private/x"), "SomeBot", true));
        assert!(!robots.is_allowed(&url("https://example.com/no-bots"), "MyBot", true));
    }

    #[test]
    fn test_longest_match_wins_and_allow_wins_ties() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow: /a\nAllow: /a\nDisallow: /a/b/c\nAllow: /a/b\n");
        assert!(robots.is_allowed(&url("https://example.com/a"), "x", false));
        assert!(robots.is_allowed(&url("https://example.com/a/b"), "x", false));
        assert!(!robots.is_allowed(&url("https://example.com/a/b/c"), "x", false));
    }

    #[test]
    fn test_empty_disallow_allows_everything() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow:\n");
        assert!(robots.is_allowed(&url("https://example.com/anything"), "x", false));
    }

    #[test]
    fn test_crawl_delay_and_sitemaps() {
        let robots = RobotsTxt::parse(ROBOTS);
        assert_eq!(robots.crawl_delay("AnyBot", false), Some(2.0));
        assert_eq!(robots.crawl_delay("MyBot", false), None);
        assert_eq!(
            robots.sitemaps(),
            ["https://example.com/sitemap.xml", "https://example.com/news.xml"]
        );
    }

    #[test]
    fn test_non_ascii_rule_matches_encoded_path() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow: /ä\n");
        assert!(!robots.is_allowed(&url("https://example.com/ä"), "x", false));
        assert!(!robots.is_allowed(&url("https://example.com/%C3%A4/page"), "x", false));
        assert!(robots.is_allowed(&url("https://example.com/a"), "x", false));
    }

    #[test]
    fn test_versioned_agent_line_addresses_product_token() {
        let robots = RobotsTxt::parse("User-agent: MyBot/1.0\nDisallow: /\n");
        assert!(!robots.is_allowed(&url("https://example.com/a"), "MyBot", false));
        assert!(!robots.is_allowed(&url("https://example.com/a"), "MyBot", true));
        assert!(robots.is_allowed(&url("https://example.com/a"), "OtherBot", false));
    }

    #[test]
    fn test_query_is_part_of_the_matched_target() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow: /search?q=\n");
        assert!(!robots.is_allowed(&url("https://example.com/search?q=rust"), "x", false));
        assert!(robots.is_allowed(&url("https://example.com/search"), "x", false));
    }

    #[test]
    fn test_agent_token() {
        assert_eq!(agent_token("MyBot/1.0"), "mybot");
        assert_eq!(agent_token(" Googlebot-News "), "googlebot-news");
        assert_eq!(agent_token("*"), "*");
    }

    #[tokio::test]
    async fn test_handler_fetches_once_per_authority() {
        let fetcher = StubFetcher::ok(200, ROBOTS);
        let handler = RobotsTxtHandler::new(UserAgent::bot("SomeBot"));

        assert!(!handler.is_allowed(&url("https://example.com/private/a"), &fetcher).await);
        assert!(handler.is_allowed(&url("https://example.com/ok"), &fetcher).await);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        handler.is_allowed(&url("https://example.com:8443/ok"), &fetcher).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_allows_plain_agents_and_robots_url() {
        let fetcher = StubFetcher::ok(200, "User-agent: *\nDisallow: /\n");
        let plain = RobotsTxtHandler::new(UserAgent::new("Mozilla/5.0"));
        assert!(plain.is_allowed(&url("https://example.com/x"), &fetcher).await);

        let bot = RobotsTxtHandler::new(UserAgent::bot("SomeBot"));
        assert!(bot.is_allowed(&url("https://example.com/robots.txt"), &fetcher).await);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(!bot.is_allowed(&url("https://example.com/x"), &fetcher).await);
    }

    #[tokio::test]
    async fn test_handler_failures_allow_all_and_are_memoized() {
        let fetcher = StubFetcher::failing();
        let handler = RobotsTxtHandler::new(UserAgent::bot("SomeBot"));
        assert!(handler.is_allowed(&url("https://example.com/a"), &fetcher).await);
        assert!(handler.is_allowed(&url("https://example.com/b"), &fetcher).await);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        let server_error = StubFetcher::ok(500, "User-agent: *\nDisallow: /\n");
        let handler = RobotsTxtHandler::new(UserAgent::bot("SomeBot"));
        assert!(handler.is_allowed(&url("https://example.com/a"), &server_error).await);

        let missing = StubFetcher::ok(404, "User-agent: *\nDisallow: /\n");
        let handler = RobotsTxtHandler::new(UserAgent::bot("SomeBot"));
        assert!(handler.is_allowed(&url("https://example.com/a"), &missing).await);
    }

    #[tokio::test]
    async fn test_handler_sitemaps_and_crawl_delay() {
        let fetcher = StubFetcher::ok(200, ROBOTS);
        let handler = RobotsTxtHandler::new(UserAgent::bot("SomeBot"));
        let sitemaps = handler.sitemaps(&url("https://example.com/"), &fetcher).await;
        assert_eq!(sitemaps.len(), 2);
        assert_eq!(
            handler.crawl_delay(&url("https://example.com/"), &fetcher).await,
            Some(2.0)
        );

        let ignoring = RobotsTxtHandler::new(UserAgent::bot("SomeBot")).ignore_wildcard_rules();
        assert_eq!(ignoring.crawl_delay(&url("https://example.com/"), &fetcher).await, None);
    }

    #[test]
    fn test_authority() {
        assert_eq!(
            authority(&url("https://example.com/path?q#f")).as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            authority(&url("http://localhost:8080/x")).as_deref(),
            Some("http://localhost:8080")
        );
        assert_eq!(authority(&url("data:text/plain,hi")), None);
    }
}
