use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::cli::config::CrawlerSettings;
use crate::crawler::extract::LinkExtractor;
use crate::crawler::fetch::Fetcher;
use crate::crawler::filter::UrlFilter;
use crate::crawler::robots::{domain_of, RobotsEngine};
use crate::crawler::task::CrawlOutcome;
use crate::crawler::work_manager::WorkManager;
use crate::network::worker::WorkerConnection;
use crate::utils::metrics::MetricsCollector;

/// Wait between frontier polls when a host-fed frontier is empty
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Where crawl outcomes go
pub enum Dispatch {
    /// Standalone: outcomes update the local frontier
    Local(UrlFilter),
    /// Worker: outcomes are reported to the host, which owns eligibility
    Remote(Arc<WorkerConnection>),
}

/// Drives the crawl: frontier, robots, politeness, fetch, extract, dispatch
pub struct CrawlerController {
    settings: CrawlerSettings,
    work: Arc<WorkManager>,
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<dyn LinkExtractor>,
    robots: Arc<RobotsEngine>,
    dispatch: Dispatch,
    metrics: MetricsCollector,
    last_fetch: DashMap<String, Instant>,
    page_limit: Option<usize>,
}

impl CrawlerController {
    pub fn new(
        settings: CrawlerSettings,
        work: Arc<WorkManager>,
        fetcher: Arc<dyn Fetcher>,
        extractor: Arc<dyn LinkExtractor>,
        robots: Arc<RobotsEngine>,
        dispatch: Dispatch,
    ) -> Self {
        Self {
            settings,
            work,
            fetcher,
            extractor,
            robots,
            dispatch,
            metrics: MetricsCollector::new(),
            last_fetch: DashMap::new(),
            page_limit: None,
        }
    }

    /// Stop after this many fetch attempts
    pub fn with_page_limit(mut self, limit: Option<usize>) -> Self {
        self.page_limit = limit;
        self
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Crawl until shutdown, the page limit, or (standalone only) an empty
    /// frontier
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut attempted = 0usize;
        info!("Crawl loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.page_limit.map_or(false, |limit| attempted >= limit) {
                info!("Page limit of {} reached", attempted);
                break;
            }

            let Some(url) = self.work.get_next().await? else {
                match self.dispatch {
                    Dispatch::Local(_) => {
                        info!("Frontier exhausted");
                        break;
                    }
                    Dispatch::Remote(_) => {
                        tokio::select! {
                            _ = tokio::time::sleep(IDLE_POLL) => continue,
                            _ = shutdown.changed() => break,
                        }
                    }
                }
            };

            attempted += 1;
            let outcome = self.crawl_one(&url).await;
            self.deliver(outcome).await?;
        }

        self.metrics.log_summary().await;
        Ok(())
    }

    /// Crawl a single URL; failures become an unsuccessful outcome
    pub async fn crawl_one(&self, url: &str) -> CrawlOutcome {
        let failed = || CrawlOutcome {
            url: url.to_string(),
            success: false,
            found_urls: Vec::new(),
        };

        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Skipping unparsable URL {}: {}", url, e);
                return failed();
            }
        };

        if self.robots.is_url_excluded(&parsed, true).await {
            debug!("Excluded by robots.txt: {}", url);
            self.metrics.record_robots_exclusion().await;
            return failed();
        }

        self.wait_politely(&parsed).await;

        let timer = self.metrics.start_timer();
        let page = match self.fetcher.fetch(url).await {
            Ok(page) => page,
            Err(e) => {
                warn!("Fetch failed for {}: {:#}", url, e);
                self.metrics.record_failure(timer.end()).await;
                return failed();
            }
        };

        let success = page.is_success();
        self.metrics
            .record_fetch(page.status, success, timer.end(), page.body.len())
            .await;

        if !success {
            debug!("{} returned status {}", url, page.status);
            return failed();
        }

        let found_urls = if page.is_html() {
            // Relative links resolve against the final URL after redirects
            let base = Url::parse(&page.url).unwrap_or(parsed);
            self.extractor.extract(&base, &page.body)
        } else {
            Vec::new()
        };
        self.metrics.record_links(found_urls.len()).await;
        debug!("Crawled {} ({} links)", url, found_urls.len());

        CrawlOutcome {
            url: url.to_string(),
            success: true,
            found_urls,
        }
    }

    /// Sleep until the domain's delay since the previous fetch has passed.
    /// The delay is the larger of robots.txt Crawl-delay and the configured
    /// politeness delay.
    async fn wait_politely(&self, url: &Url) {
        let Some(domain) = domain_of(url) else {
            return;
        };

        let crawl_delay = Duration::from_secs_f64(self.robots.get_wait_time(&domain).max(0.0));
        let delay = crawl_delay.max(self.settings.politeness_delay());

        if let Some(last) = self.last_fetch.get(&domain).map(|entry| *entry) {
            let elapsed = last.elapsed();
            if elapsed < delay {
                tokio::time::sleep(delay - elapsed).await;
            }
        }
        self.last_fetch.insert(domain, Instant::now());
    }

    async fn deliver(&self, outcome: CrawlOutcome) -> Result<()> {
        match &self.dispatch {
            Dispatch::Local(filter) => {
                self.work.report_result(&outcome.url, outcome.success).await?;

                let mut eligible = Vec::new();
                for url in filter.admit_all(&outcome.found_urls) {
                    if self.work.is_eligible_for_crawl(&url).await? {
                        eligible.push(url);
                    }
                }
                if !eligible.is_empty() {
                    debug!("Queueing {} new URLs from {}", eligible.len(), outcome.url);
                    self.work.add_many(eligible).await?;
                }
            }
            Dispatch::Remote(connection) => {
                if let Err(e) = connection.report(&outcome).await {
                    // The host reclaims the assignment when the connection drops
                    warn!("{:#}", e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::extract::HtmlLinkExtractor;
    use crate::crawler::fetch::{FetchedPage, HttpFetcher, MockFetcher};
    use crate::crawler::work_manager::FrontierRole;
    use crate::storage::{Collection, MemoryStore, RecordStore};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings() -> CrawlerSettings {
        CrawlerSettings {
            politeness_delay: 0,
            ..CrawlerSettings::default()
        }
    }

    async fn frontier(seeds: &[String]) -> (Arc<WorkManager>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let work = WorkManager::new(store.clone(), 10, false, FrontierRole::Authoritative)
            .await
            .unwrap();
        work.initialize(seeds).await.unwrap();
        (Arc::new(work), store)
    }

    fn controller(work: Arc<WorkManager>, fetcher: Arc<dyn Fetcher>) -> CrawlerController {
        let settings = settings();
        let robots = Arc::new(
            RobotsEngine::new(&settings.user_agent, true, Duration::from_secs(60)).with_fetcher(fetcher.clone()),
        );
        let filter = UrlFilter::new(&settings);
        CrawlerController::new(
            settings,
            work,
            fetcher,
            Arc::new(HtmlLinkExtractor::new()),
            robots,
            Dispatch::Local(filter),
        )
    }

    fn html(links: &[&str]) -> String {
        let anchors: String = links.iter().map(|l| format!(r#"<a href="{}">x</a>"#, l)).collect();
        format!("<html><body>{}</body></html>", anchors)
    }

    #[tokio::test]
    async fn standalone_crawl_follows_links_until_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private\n"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(html(&["/a", "/private/x", "/a#frag"]), "text/html"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(html(&["/"]), "text/html"),
            )
            .mount(&server)
            .await;

        let start = format!("{}/", server.uri());
        let (work, store) = frontier(&[start]).await;
        let fetcher = Arc::new(HttpFetcher::new("HiveCrawlerTest/1.0", Duration::from_secs(5)).unwrap());
        let controller = controller(work.clone(), fetcher);

        let (_tx, rx) = watch::channel(false);
        controller.run(rx).await.unwrap();

        let metrics = controller.metrics().get_metrics().await;
        assert_eq!(metrics.pages_crawled, 2);
        assert_eq!(metrics.robots_excluded, 1);
        assert_eq!(store.count(Collection::CrawledHistory).await.unwrap(), 2);
        assert_eq!(work.total_work_count(), 0);
    }

    #[tokio::test]
    async fn page_limit_stops_the_loop() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(|url| {
            if url.ends_with("/robots.txt") {
                return Err(anyhow::anyhow!("no robots"));
            }
            Ok(FetchedPage {
                url: url.to_string(),
                status: 200,
                content_type: Some("text/html".to_string()),
                body: html(&["/next-1", "/next-2"]),
            })
        });

        let (work, _store) = frontier(&["https://example.com/".to_string()]).await;
        let controller = controller(work.clone(), Arc::new(fetcher)).with_page_limit(Some(1));

        let (_tx, rx) = watch::channel(false);
        controller.run(rx).await.unwrap();

        let metrics = controller.metrics().get_metrics().await;
        assert_eq!(metrics.pages_crawled, 1);
        assert_eq!(metrics.links_discovered, 2);
        assert_eq!(work.total_work_count(), 2);
    }

    #[tokio::test]
    async fn failed_fetch_is_an_unsuccessful_outcome() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(|url| {
            Ok(FetchedPage {
                url: url.to_string(),
                status: 500,
                content_type: None,
                body: String::new(),
            })
        });

        let (work, _store) = frontier(&[]).await;
        let controller = controller(work, Arc::new(fetcher));

        let outcome = controller.crawl_one("https://example.com/broken").await;
        assert!(!outcome.success);
        assert!(outcome.found_urls.is_empty());
        assert_eq!(controller.metrics().get_metrics().await.pages_failed, 1);
    }

    #[tokio::test]
    async fn raised_shutdown_stops_before_taking_work() {
        let (work, _store) = frontier(&["https://example.com/".to_string()]).await;
        let controller = controller(work.clone(), Arc::new(MockFetcher::new()));

        let (tx, rx) = watch::channel(true);
        controller.run(rx).await.unwrap();
        drop(tx);

        // Nothing was taken from the frontier
        assert_eq!(work.total_work_count(), 1);
    }
}
