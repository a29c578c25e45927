use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, warn};
use url::Url;

use crate::cli::config::CrawlerSettings;

/// Admission policy for discovered URLs: scheme, domain and pattern checks
pub struct UrlFilter {
    /// Compiled regex patterns for URL inclusion
    include_patterns: Vec<Regex>,

    /// Compiled regex patterns for URL exclusion
    exclude_patterns: Vec<Regex>,

    /// Allowed domains for crawling (if empty, any domain is allowed)
    allowed_domains: HashSet<String>,
}

fn compile_patterns(patterns: &[String], kind: &str) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("Invalid {} pattern '{}': {}", kind, pattern, e);
                None
            }
        })
        .collect()
}

impl UrlFilter {
    pub fn new(settings: &CrawlerSettings) -> Self {
        Self {
            include_patterns: compile_patterns(&settings.url_patterns.include, "include"),
            exclude_patterns: compile_patterns(&settings.url_patterns.exclude, "exclude"),
            allowed_domains: settings
                .allowed_domains
                .iter()
                .map(|domain| domain.to_lowercase())
                .collect(),
        }
    }

    /// Normalize `url` and return it if it may enter the frontier
    pub fn admit(&self, url: &str) -> Option<String> {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Skipping invalid URL {}: {}", url, e);
                return None;
            }
        };

        if !matches!(parsed.scheme(), "http" | "https") {
            debug!("Skipping non-http URL: {}", url);
            return None;
        }

        let normalized = normalize(&parsed);

        if !self.allowed_domains.is_empty() {
            let Some(host) = parsed.host_str().map(str::to_lowercase) else {
                debug!("Skipping URL without host: {}", normalized);
                return None;
            };
            let allowed = self
                .allowed_domains
                .iter()
                .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)));
            if !allowed {
                debug!("Skipping URL from non-allowed domain: {}", host);
                return None;
            }
        }

        if self.exclude_patterns.iter().any(|pattern| pattern.is_match(&normalized)) {
            debug!("Skipping URL matching exclusion pattern: {}", normalized);
            return None;
        }

        if !self.include_patterns.is_empty()
            && !self.include_patterns.iter().any(|pattern| pattern.is_match(&normalized))
        {
            debug!("Skipping URL not matching any inclusion pattern: {}", normalized);
            return None;
        }

        Some(normalized)
    }

    /// Admit every URL of a batch, dropping repeats within the batch
    pub fn admit_all<'a, I>(&self, urls: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut seen = HashSet::new();
        urls.into_iter()
            .filter_map(|url| self.admit(url))
            .filter(|url| seen.insert(url.clone()))
            .collect()
    }
}

/// Canonical form used as the frontier identity of a URL
pub fn normalize(url: &Url) -> String {
    let mut normalized = url.clone();

    // Remove default ports
    if let Some(port) = normalized.port() {
        if (normalized.scheme() == "http" && port == 80) || (normalized.scheme() == "https" && port == 443) {
            let _ = normalized.set_port(None);
        }
    }

    if let Some(host) = normalized.host_str().map(str::to_lowercase) {
        let _ = normalized.set_host(Some(&host));
    }

    // Sort query parameters by key
    if let Some(query) = normalized.query().filter(|q| !q.is_empty()).map(str::to_string) {
        let mut params: Vec<&str> = query.split('&').collect();
        let name = |pair: &str| pair.split('=').next().unwrap_or("").to_string();
        params.sort_by(|a, b| name(a).cmp(&name(b)));
        normalized.set_query(Some(&params.join("&")));
    }

    normalized.set_fragment(None);
    normalized.to_string()
}
