use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::crawler::fetch::Fetcher;

/// A compiled allow/disallow value
#[derive(Debug, Clone)]
pub struct RobotsPattern {
    raw: String,
    regex: Regex,
}

impl RobotsPattern {
    /// Compile a robots.txt path value.
    ///
    /// `*` matches any run of characters and a trailing `$` pins the end.
    /// Otherwise the value must be followed by the end of the path, `/` or
    /// `?`, so `/admin` covers `/admin/x` and `/admin?x` but not `/admin2`.
    /// Values ending in `/` or `*` are plain prefixes.
    pub fn compile(raw: &str) -> Option<Self> {
        let pattern = if raw == "/" {
            // Matches everything
            "^".to_string()
        } else if let Some(body) = raw.strip_suffix('$') {
            format!("^{}$", Self::translate(body))
        } else if raw.ends_with('/') || raw.ends_with('*') {
            format!("^{}", Self::translate(raw))
        } else {
            format!("^{}(?:[/?]|$)", Self::translate(raw))
        };

        match Regex::new(&pattern) {
            Ok(regex) => Some(Self { raw: raw.to_string(), regex }),
            Err(e) => {
                warn!("Invalid robots pattern '{}': {}", raw, e);
                None
            }
        }
    }

    fn translate(value: &str) -> String {
        regex::escape(value).replace(r"\*", ".*")
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// Rules that apply to our user agent on one domain
#[derive(Debug, Clone)]
pub struct RobotsData {
    pub allow: Vec<RobotsPattern>,
    pub disallow: Vec<RobotsPattern>,
    /// Crawl-delay in seconds
    pub wait_time: f64,
    pub last_access: DateTime<Utc>,
}

impl Default for RobotsData {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            disallow: Vec::new(),
            wait_time: 0.0,
            last_access: Utc::now(),
        }
    }
}

impl RobotsData {
    /// Whether `path` is excluded by these rules.
    ///
    /// The first disallow rule (file order) that matches decides the path is
    /// excluded unless some matching allow rule has strictly longer raw text.
    pub fn is_excluded(&self, path: &str) -> bool {
        let Some(disallow) = self.disallow.iter().find(|rule| rule.is_match(path)) else {
            return false;
        };

        let overridden = self
            .allow
            .iter()
            .any(|rule| rule.is_match(path) && rule.raw.len() > disallow.raw.len());

        !overridden
    }
}

/// Per-domain robots.txt cache and evaluator
pub struct RobotsEngine {
    user_agent: String,
    respect_rules: bool,
    domains: DashMap<String, RobotsData>,
    fetcher: Option<Arc<dyn Fetcher>>,
    max_age: ChronoDuration,
}

impl RobotsEngine {
    pub fn new(user_agent: &str, respect_rules: bool, max_age: Duration) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            respect_rules,
            domains: DashMap::new(),
            fetcher: None,
            max_age: ChronoDuration::from_std(max_age).unwrap_or_else(|_| ChronoDuration::hours(1)),
        }
    }

    /// Enable fetching robots.txt for unknown domains
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn respects_rules(&self) -> bool {
        self.respect_rules
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub fn is_known(&self, domain: &str) -> bool {
        self.domains.contains_key(domain)
    }

    /// Parse robots.txt text into the rules for our user agent.
    ///
    /// Only the first section whose User-agent matches is used; parsing stops
    /// at the next User-agent line after a match.
    pub fn parse(&self, content: &str) -> RobotsData {
        let mut data = RobotsData::default();
        let mut in_section = false;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            // Inline comments
            let value = value.split('#').next().unwrap_or("").trim();

            if key == "user-agent" {
                if in_section {
                    break;
                }
                in_section = self.agent_matches(value);
                continue;
            }

            if !in_section {
                continue;
            }

            match key.as_str() {
                "disallow" if !value.is_empty() => {
                    if let Some(pattern) = RobotsPattern::compile(value) {
                        data.disallow.push(pattern);
                    }
                }
                "allow" if !value.is_empty() => {
                    if let Some(pattern) = RobotsPattern::compile(value) {
                        data.allow.push(pattern);
                    }
                }
                "crawl-delay" => match value.parse::<f64>() {
                    Ok(delay) if delay >= 0.0 => data.wait_time = delay,
                    _ => debug!("Ignoring invalid crawl-delay: {}", value),
                },
                _ => {}
            }
        }

        data
    }

    fn agent_matches(&self, agent: &str) -> bool {
        if agent.eq_ignore_ascii_case(&self.user_agent) {
            return true;
        }
        if !agent.contains('*') {
            return false;
        }

        let pattern = format!("^{}$", regex::escape(agent).replace(r"\*", ".*"));
        RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map(|regex| regex.is_match(&self.user_agent))
            .unwrap_or(false)
    }

    /// Register (or replace) the rules of a domain from robots.txt text
    pub fn register(&self, domain: &str, content: &str) {
        let data = self.parse(content);
        debug!(
            "Registered robots rules for {}: {} disallow, {} allow, delay {}s",
            domain,
            data.disallow.len(),
            data.allow.len(),
            data.wait_time
        );
        self.domains.insert(domain.to_string(), data);
    }

    /// Whether `path` on a known domain is excluded; unknown domains are not
    pub fn is_excluded(&self, domain: &str, path: &str) -> bool {
        if !self.respect_rules {
            return false;
        }

        match self.domains.get_mut(domain) {
            Some(mut data) => {
                data.last_access = Utc::now();
                data.is_excluded(path)
            }
            None => false,
        }
    }

    /// Crawl-delay of a domain in seconds; 0 if unknown or rules are ignored
    pub fn get_wait_time(&self, domain: &str) -> f64 {
        if !self.respect_rules {
            return 0.0;
        }

        match self.domains.get_mut(domain) {
            Some(mut data) => {
                data.last_access = Utc::now();
                data.wait_time
            }
            None => 0.0,
        }
    }

    /// Check a full URL, fetching the domain's robots.txt first if needed
    pub async fn is_url_excluded(&self, url: &Url, fetch_if_missing: bool) -> bool {
        if !self.respect_rules {
            return false;
        }

        let Some(domain) = domain_of(url) else {
            return false;
        };

        if fetch_if_missing && !self.is_known(&domain) {
            self.fetch_rules(url.scheme(), &domain).await;
        }

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        self.is_excluded(&domain, &path)
    }

    /// Fetch and cache `{scheme}://{domain}/robots.txt`. Failures cache an
    /// empty rule set so the fetch is not retried until it expires.
    pub async fn fetch_rules(&self, scheme: &str, domain: &str) {
        let Some(fetcher) = &self.fetcher else {
            return;
        };

        let robots_url = format!("{}://{}/robots.txt", scheme, domain);
        match fetcher.fetch(&robots_url).await {
            Ok(page) if page.is_success() => self.register(domain, &page.body),
            Ok(page) => {
                debug!("No robots.txt at {} (status {})", robots_url, page.status);
                self.domains.insert(domain.to_string(), RobotsData::default());
            }
            Err(e) => {
                warn!("Failed to fetch {}: {}", robots_url, e);
                self.domains.insert(domain.to_string(), RobotsData::default());
            }
        }
    }

    /// Drop cached domains idle for longer than the max age
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.domains.len();
        self.domains.retain(|_, data| now - data.last_access <= self.max_age);
        let removed = before - self.domains.len();
        if removed > 0 {
            debug!("Expired robots rules for {} domains", removed);
        }
        removed
    }

    /// Run `sweep_expired` every `interval` until shutdown
    pub fn spawn_expiry_sweep(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_expired(Utc::now());
                    }
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            info!("Robots expiry sweep stopped");
        })
    }
}

/// Domain key used for robots rules: host plus explicit port
pub fn domain_of(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_lowercase();
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}
