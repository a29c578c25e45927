use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::crawler::task::CrawlOutcome;
use crate::network::handler::MessageHandler;
use crate::network::handshake::join_host;
use crate::network::message::{MessageType, NetworkMessage};

/// Instructions a host sends to a worker
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    Work(String),
    Disconnect,
}

/// A worker's authenticated connection to its host
pub struct WorkerConnection {
    client_id: String,
    handler: Arc<MessageHandler>,
    commands: tokio::sync::Mutex<mpsc::UnboundedReceiver<HostCommand>>,
}

impl WorkerConnection {
    /// Connect to `address` and complete the join handshake
    pub async fn connect(
        address: &str,
        password: Option<&str>,
        previous_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .context(format!("Timed out connecting to host {}", address))?
            .context(format!("Failed to connect to host {}", address))?;
        let _ = stream.set_nodelay(true);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handler = MessageHandler::with_callback(
            stream,
            address,
            Arc::new(move |message: &NetworkMessage| match message.kind {
                MessageType::Work => match message.text() {
                    Some(url) => {
                        let _ = commands_tx.send(HostCommand::Work(url.to_string()));
                    }
                    None => debug!("Ignoring Work message without a URL"),
                },
                MessageType::Disconnect => {
                    let _ = commands_tx.send(HostCommand::Disconnect);
                }
                MessageType::ResultsReceived => {
                    debug!("Host acknowledged results for {}", message.text().unwrap_or_default());
                }
                _ => {}
            }),
        );
        handler.start();

        let client_id = match join_host(&handler, password, previous_id, timeout).await {
            Ok(id) => id,
            Err(e) => {
                handler.dispose().await;
                return Err(e).context(format!("Handshake with host {} failed", address));
            }
        };

        info!("Connected to host {} as {}", address, client_id);
        Ok(Self {
            client_id,
            handler,
            commands: tokio::sync::Mutex::new(commands_rx),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_closed(&self) -> bool {
        self.handler.is_closed()
    }

    /// Next instruction from the host; `None` once the connection is gone
    pub async fn next_command(&self) -> Option<HostCommand> {
        let mut commands = self.commands.lock().await;
        tokio::select! {
            biased;
            command = commands.recv() => command,
            _ = self.handler.closed() => commands.try_recv().ok(),
        }
    }

    /// Send the outcome of a crawled URL to the host
    pub async fn report(&self, outcome: &CrawlOutcome) -> Result<()> {
        let message = NetworkMessage::results_ready(outcome)?;
        self.handler
            .send(&message)
            .await
            .context(format!("Failed to report results for {}", outcome.url))
    }

    pub async fn close(&self) {
        self.handler.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::{CrawlerSettings, HostSettings};
    use crate::crawler::filter::UrlFilter;
    use crate::crawler::work_manager::{FrontierRole, WorkManager};
    use crate::network::host::Host;
    use crate::storage::MemoryStore;

    const WAIT: Duration = Duration::from_secs(5);

    async fn host(password: Option<&str>, seeds: &[&str]) -> (Arc<Host>, String, Arc<WorkManager>) {
        let store = Arc::new(MemoryStore::new());
        let work = Arc::new(
            WorkManager::new(store, 100, false, FrontierRole::Authoritative)
                .await
                .unwrap(),
        );
        let seeds: Vec<String> = seeds.iter().map(|s| s.to_string()).collect();
        work.initialize(&seeds).await.unwrap();

        let settings = HostSettings {
            listen_address: "127.0.0.1:0".to_string(),
            password: password.map(str::to_string),
            work_backoff: 20,
            ..HostSettings::default()
        };
        let host = Arc::new(Host::new(settings, work.clone(), UrlFilter::new(&CrawlerSettings::default())));
        let addr = host.start().await.unwrap();
        (host, addr.to_string(), work)
    }

    async fn next(connection: &WorkerConnection) -> Option<HostCommand> {
        tokio::time::timeout(WAIT, connection.next_command()).await.unwrap()
    }

    #[tokio::test]
    async fn receives_work_and_reports_results() {
        let (host, addr, work) = host(Some("pw"), &["https://example.com/"]).await;
        let connection = WorkerConnection::connect(&addr, Some("pw"), None, WAIT).await.unwrap();

        assert_eq!(next(&connection).await, Some(HostCommand::Work("https://example.com/".to_string())));

        connection
            .report(&CrawlOutcome {
                url: "https://example.com/".to_string(),
                success: true,
                found_urls: vec!["https://example.com/next".to_string()],
            })
            .await
            .unwrap();

        assert_eq!(
            next(&connection).await,
            Some(HostCommand::Work("https://example.com/next".to_string()))
        );

        host.stop().await;
        assert_eq!(next(&connection).await, Some(HostCommand::Disconnect));
        assert_eq!(next(&connection).await, None);
        assert_eq!(work.total_work_count(), 1);
    }

    #[tokio::test]
    async fn rejected_handshake_is_an_error() {
        let (host, addr, _work) = host(Some("pw"), &[]).await;
        assert!(WorkerConnection::connect(&addr, Some("nope"), None, WAIT).await.is_err());
        assert!(host.registry().is_empty());
        host.stop().await;
    }

    #[tokio::test]
    async fn reconnect_keeps_the_same_id() {
        let (host, addr, _work) = host(None, &[]).await;
        let first = WorkerConnection::connect(&addr, None, None, WAIT).await.unwrap();
        let id = first.client_id().to_string();

        let online_count = |expected: usize| {
            let registry = host.registry().clone();
            tokio::time::timeout(WAIT, async move {
                while registry.online_count() != expected {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };
        online_count(1).await.unwrap();
        first.close().await;
        online_count(0).await.unwrap();

        let second = WorkerConnection::connect(&addr, None, Some(id.as_str()), WAIT).await.unwrap();
        assert_eq!(second.client_id(), id);
        host.stop().await;
    }
}
