use scraper::{Html, Selector};
use std::collections::HashSet;
use url::Url;

/// Turns downloaded content into candidate URLs
pub trait LinkExtractor: Send + Sync {
    fn extract(&self, base: &Url, content: &str) -> Vec<String>;
}

/// Extracts absolute http(s) links from `a[href]` elements
pub struct HtmlLinkExtractor {
    selector: Selector,
}

impl HtmlLinkExtractor {
    pub fn new() -> Self {
        Self {
            selector: Selector::parse("a[href]").expect("anchor selector"),
        }
    }
}

impl Default for HtmlLinkExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkExtractor for HtmlLinkExtractor {
    fn extract(&self, base: &Url, content: &str) -> Vec<String> {
        let document = Html::parse_document(content);
        let mut seen = HashSet::new();

        document
            .select(&self.selector)
            .filter_map(|element| element.value().attr("href"))
            .filter_map(|href| base.join(href.trim()).ok())
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .map(|mut url| {
                url.set_fragment(None);
                url.to_string()
            })
            .filter(|url| seen.insert(url.clone()))
            .collect()
    }
}
