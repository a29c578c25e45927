use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tracing::info;

/// Crawl counters shared by the crawl loop
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<CrawlMetrics>>,
}

/// Snapshot of crawl counters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CrawlMetrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    /// Pages fetched with a success status
    pub pages_crawled: usize,

    /// Fetch errors and non-success statuses
    pub pages_failed: usize,

    /// URLs skipped because robots.txt excludes them
    pub robots_excluded: usize,

    /// Links found on crawled pages
    pub links_discovered: usize,

    /// Bytes downloaded
    pub bytes_downloaded: usize,

    /// Total fetch time in milliseconds
    pub fetch_time_ms: u64,

    /// HTTP status code counts
    pub status_codes: HashMap<u16, usize>,
}

impl CrawlMetrics {
    pub fn total_fetches(&self) -> usize {
        self.pages_crawled + self.pages_failed
    }

    /// Fetches per second since collection started
    pub fn rate(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = (now - self.start_time).num_milliseconds().max(1) as f64 / 1000.0;
        self.total_fetches() as f64 / elapsed
    }

    pub fn average_fetch_ms(&self) -> u64 {
        match self.total_fetches() {
            0 => 0,
            n => self.fetch_time_ms / n as u64,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let metrics = CrawlMetrics {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    /// Record a completed fetch
    pub async fn record_fetch(&self, status: u16, success: bool, duration_ms: u64, bytes: usize) {
        let mut metrics = self.metrics.lock().await;

        if success {
            metrics.pages_crawled += 1;
        } else {
            metrics.pages_failed += 1;
        }
        metrics.bytes_downloaded += bytes;
        metrics.fetch_time_ms += duration_ms;
        *metrics.status_codes.entry(status).or_default() += 1;
    }

    /// Record a fetch that never produced a response
    pub async fn record_failure(&self, duration_ms: u64) {
        let mut metrics = self.metrics.lock().await;
        metrics.pages_failed += 1;
        metrics.fetch_time_ms += duration_ms;
    }

    pub async fn record_robots_exclusion(&self) {
        self.metrics.lock().await.robots_excluded += 1;
    }

    pub async fn record_links(&self, count: usize) {
        self.metrics.lock().await.links_discovered += count;
    }

    /// Start timing a request
    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer {
            start: Instant::now(),
        }
    }

    /// Get all metrics
    pub async fn get_metrics(&self) -> CrawlMetrics {
        self.metrics.lock().await.clone()
    }

    /// Write a one-line summary to the log
    pub async fn log_summary(&self) {
        let metrics = self.get_metrics().await;
        info!(
            "Crawled {} pages ({} failed, {} excluded by robots.txt), {} links, {} bytes, {:.2} pages/s, avg fetch {} ms",
            metrics.pages_crawled,
            metrics.pages_failed,
            metrics.robots_excluded,
            metrics.links_discovered,
            metrics.bytes_downloaded,
            metrics.rate(Utc::now()),
            metrics.average_fetch_ms()
        );
    }
}

/// Request timer for measuring request durations
pub struct RequestTimer {
    /// Start time of the request
    start: Instant,
}

impl RequestTimer {
    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn counters_accumulate() {
        let collector = MetricsCollector::new();
        collector.record_fetch(200, true, 40, 1000).await;
        collector.record_fetch(404, false, 20, 10).await;
        collector.record_failure(30).await;
        collector.record_robots_exclusion().await;
        collector.record_links(7).await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.pages_crawled, 1);
        assert_eq!(metrics.pages_failed, 2);
        assert_eq!(metrics.robots_excluded, 1);
        assert_eq!(metrics.links_discovered, 7);
        assert_eq!(metrics.bytes_downloaded, 1010);
        assert_eq!(metrics.status_codes.get(&404), Some(&1));
        assert_eq!(metrics.average_fetch_ms(), 30);
    }

    #[test]
    fn rate_is_fetches_per_second() {
        let start = Utc::now();
        let metrics = CrawlMetrics {
            start_time: start,
            pages_crawled: 10,
            ..Default::default()
        };
        assert_eq!(metrics.rate(start + Duration::seconds(5)), 2.0);
    }
}
