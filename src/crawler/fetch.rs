use anyhow::{Result, Context};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::debug;

/// A downloaded resource
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    /// Final URL after redirects
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl FetchedPage {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map_or(true, |ct| ct.contains("html"))
    }
}

/// Fetches pages and robots.txt files
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

/// HTTP fetcher backed by reqwest
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        debug!("Fetching: {}", url);

        let response = self.client.get(url)
            .send()
            .await
            .context(format!("Failed to fetch URL: {}", url))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response.headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        let body = response.text()
            .await
            .context(format!("Failed to read response body: {}", url))?;

        Ok(FetchedPage {
            url: final_url,
            status,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use wiremock::matchers::{method, path};

    #[tokio::test]
    async fn fetches_body_status_and_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<html>hi</html>", "text/html; charset=utf-8"),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new("TestBot/1.0", Duration::from_secs(5)).unwrap();
        let page = fetcher.fetch(&format!("{}/page", server.uri())).await.unwrap();

        assert!(page.is_success());
        assert!(page.is_html());
        assert_eq!(page.body, "<html>hi</html>");
    }

    #[tokio::test]
    async fn reports_error_status_without_failing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new("TestBot/1.0", Duration::from_secs(5)).unwrap();
        let page = fetcher.fetch(&format!("{}/missing", server.uri())).await.unwrap();

        assert_eq!(page.status, 404);
        assert!(!page.is_success());
    }

    #[test]
    fn pages_without_content_type_count_as_html() {
        let page = FetchedPage {
            url: "https://example.com/".to_string(),
            status: 200,
            content_type: None,
            body: String::new(),
        };
        assert!(page.is_html());
    }
}
