pub mod backlog;
pub mod controller;
pub mod extract;
pub mod fetch;
pub mod filter;
pub mod robots;
pub mod task;
pub mod work_manager;

// Re-export common types
pub use backlog::{Backlog, BacklogMode};
pub use controller::{CrawlerController, Dispatch};
pub use extract::{HtmlLinkExtractor, LinkExtractor};
pub use fetch::{FetchedPage, Fetcher, HttpFetcher};
pub use filter::UrlFilter;
pub use robots::{RobotsData, RobotsEngine};
pub use task::{CrawlOutcome, WorkItem};
pub use work_manager::{FrontierRole, WorkManager};
