use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cli::config::HostSettings;
use crate::crawler::filter::UrlFilter;
use crate::crawler::task::CrawlOutcome;
use crate::crawler::work_manager::WorkManager;
use crate::network::handler::MessageHandler;
use crate::network::handshake::{accept_client, hash_password};
use crate::network::message::{MessageType, NetworkMessage};
use crate::network::picker::{ClientPicker, FirstIdlePicker};
use crate::network::registry::{ClientEvent, ClientInfo, ClientRegistry};

/// A result reported by a worker, waiting for the results task
struct ResultReport {
    client_id: String,
    handler: Arc<MessageHandler>,
    outcome: CrawlOutcome,
}

/// Owns the frontier on behalf of connected workers: accepts and
/// authenticates connections, hands out work, and folds results back in
pub struct Host {
    settings: HostSettings,
    password_hash: Option<String>,
    work: Arc<WorkManager>,
    filter: UrlFilter,
    registry: Arc<ClientRegistry>,
    picker: Arc<dyn ClientPicker>,
    shutdown: watch::Sender<bool>,
    results_tx: mpsc::UnboundedSender<ResultReport>,
    results_rx: Mutex<Option<mpsc::UnboundedReceiver<ResultReport>>>,
    /// URL that could not be placed; it goes out before any new work
    retry: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Host {
    pub fn new(settings: HostSettings, work: Arc<WorkManager>, filter: UrlFilter) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let password_hash = settings
            .password
            .as_deref()
            .filter(|password| !password.is_empty())
            .map(hash_password);

        Self {
            settings,
            password_hash,
            work,
            filter,
            registry: Arc::new(ClientRegistry::new()),
            picker: Arc::new(FirstIdlePicker),
            shutdown,
            results_tx,
            results_rx: Mutex::new(Some(results_rx)),
            retry: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Replace the default first-idle picking strategy
    pub fn with_picker(mut self, picker: Arc<dyn ClientPicker>) -> Self {
        self.picker = picker;
        self
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.registry.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.registry.subscribe()
    }

    /// Bind the listener and start the background loops
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        if self.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("Host already started");
        }

        let listener = TcpListener::bind(&self.settings.listen_address)
            .await
            .context(format!("Failed to bind {}", self.settings.listen_address))?;
        let local_addr = listener.local_addr().context("Failed to read listener address")?;

        let results_rx = self
            .results_rx
            .lock()
            .take()
            .context("Results channel already taken")?;

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(self).accept_loop(listener)));
        tasks.push(tokio::spawn(Arc::clone(self).sweep_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).distribution_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).results_loop(results_rx)));

        info!("Host listening on {}", local_addr);
        Ok(local_addr)
    }

    fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `duration` unless shutdown comes first; false on shutdown
    async fn pause(&self, duration: Duration) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = shutdown.changed() => false,
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {}", addr);
                        tokio::spawn(Arc::clone(&self).handle_connection(stream, addr));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        if !self.pause(self.settings.work_backoff()).await {
                            break;
                        }
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("Accept loop stopped");
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }

        let endpoint = addr.to_string();
        let handler = MessageHandler::new(stream, endpoint.clone());
        let registry = Arc::clone(&self.registry);

        let accepted = accept_client(
            &handler,
            self.password_hash.as_deref(),
            self.settings.handshake_timeout(),
            |id| registry.can_resume(id),
            |id| registry.exists(id),
        )
        .await;

        let accepted = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Handshake with {} failed: {}", endpoint, e);
                if let Err(e) = handler.send(&NetworkMessage::reject(&e.to_string())).await {
                    debug!("Could not send Reject to {}: {}", endpoint, e);
                }
                handler.dispose().await;
                return;
            }
        };

        if self.is_stopping() {
            let _ = handler.send(&NetworkMessage::disconnect()).await;
            handler.dispose().await;
            return;
        }

        let client_id = accepted.client_id;
        let results_tx = self.results_tx.clone();
        let callback_id = client_id.clone();
        let callback_handler = Arc::downgrade(&handler);
        handler.set_callback(Arc::new(move |message: &NetworkMessage| {
            if !message.is(MessageType::ResultsReady) {
                return;
            }
            let Some(handler) = callback_handler.upgrade() else {
                return;
            };
            match message.payload_as::<CrawlOutcome>() {
                Ok(outcome) => {
                    let _ = results_tx.send(ResultReport {
                        client_id: callback_id.clone(),
                        handler,
                        outcome,
                    });
                }
                Err(e) => warn!("Malformed results from {}: {}", callback_id, e),
            }
        }));

        if !self.admit(&client_id, &endpoint, &handler).await {
            return;
        }

        handler.closed().await;
        self.registry.mark_offline(&client_id, &handler);
        handler.dispose().await;
    }

    /// Register a connection that completed the handshake. Returns false
    /// when the connection was turned away and disposed.
    async fn admit(&self, client_id: &str, endpoint: &str, handler: &Arc<MessageHandler>) -> bool {
        let Some(registration) = self.registry.register(client_id, endpoint, Arc::clone(handler)) else {
            if let Err(e) = handler.send(&NetworkMessage::reject("Client id already in use")).await {
                debug!("Could not send Reject to {}: {}", endpoint, e);
            }
            handler.dispose().await;
            return false;
        };
        if let Some(url) = registration.orphaned_url {
            self.requeue(url).await;
        }

        // stop() may have drained the registry before this entry went in
        if self.is_stopping() {
            self.registry.mark_offline(client_id, handler);
            let _ = handler.send(&NetworkMessage::disconnect()).await;
            handler.dispose().await;
            return false;
        }
        true
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.sweep_interval());
        let mut shutdown = self.shutdown.subscribe();
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_stale_clients(Utc::now()).await,
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }

        debug!("Sweep loop stopped");
    }

    /// Remove clients offline for longer than the max age and return their
    /// outstanding work to the frontier
    pub async fn sweep_stale_clients(&self, now: DateTime<Utc>) {
        let max_age = ChronoDuration::from_std(self.settings.client_max_age())
            .unwrap_or_else(|_| ChronoDuration::seconds(i64::MAX / 1000));

        for removed in self.registry.sweep_stale(now, max_age) {
            if let Some(url) = removed.orphaned_url {
                self.requeue(url).await;
            }
            info!("Removed stale client {}", removed.id);
            self.registry.publish(ClientEvent::Removed { id: removed.id });
        }
    }

    async fn distribution_loop(self: Arc<Self>) {
        let backoff = self.settings.work_backoff();

        loop {
            if self.is_stopping() {
                break;
            }

            if self.registry.online_count() == 0 {
                if !self.pause(backoff).await {
                    break;
                }
                continue;
            }

            let retried = self.retry.lock().take();
            let url = match retried {
                Some(url) => url,
                None => match self.work.get_next().await {
                    Ok(Some(url)) => url,
                    Ok(None) => {
                        if !self.pause(backoff).await {
                            break;
                        }
                        continue;
                    }
                    Err(e) => {
                        error!("Failed to take work from the frontier: {:#}", e);
                        if !self.pause(backoff).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            let Some((client_id, handler)) = self.registry.pick(self.picker.as_ref()) else {
                *self.retry.lock() = Some(url);
                if !self.pause(backoff).await {
                    break;
                }
                continue;
            };

            self.registry.assign(&client_id, &url);
            match handler.send(&NetworkMessage::work(&url)).await {
                Ok(()) => debug!("Sent {} to {}", url, client_id),
                Err(e) => {
                    warn!("Failed to send work to {}: {}", client_id, e);
                    self.registry.unassign(&client_id, &url);
                    *self.retry.lock() = Some(url);
                }
            }
        }

        info!("Distribution loop stopped");
    }

    async fn results_loop(self: Arc<Self>, mut results: mpsc::UnboundedReceiver<ResultReport>) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                report = results.recv() => match report {
                    Some(report) => self.process_result(report).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        // Results that already arrived are still folded in
        while let Ok(report) = results.try_recv() {
            self.process_result(report).await;
        }

        debug!("Results loop stopped");
    }

    async fn process_result(&self, report: ResultReport) {
        let ResultReport {
            client_id,
            handler,
            outcome,
        } = report;

        if let Err(e) = self.fold_result(&client_id, &outcome).await {
            error!("Failed to record results for {} from {}: {:#}", outcome.url, client_id, e);
            return;
        }

        if let Err(e) = handler.send(&NetworkMessage::results_received(&outcome.url)).await {
            debug!("Could not acknowledge results to {}: {}", client_id, e);
        }
    }

    async fn fold_result(&self, client_id: &str, outcome: &CrawlOutcome) -> Result<()> {
        self.registry.complete(client_id, &outcome.url);
        self.work.report_result(&outcome.url, outcome.success).await?;

        let mut eligible = Vec::new();
        for url in self.filter.admit_all(&outcome.found_urls) {
            if self.work.is_eligible_for_crawl(&url).await? {
                eligible.push(url);
            }
        }

        debug!(
            "{} reported {} ({} links, {} new)",
            client_id,
            outcome.url,
            outcome.found_urls.len(),
            eligible.len()
        );

        if !eligible.is_empty() {
            self.work.add_many(eligible).await?;
        }
        Ok(())
    }

    async fn requeue(&self, url: String) {
        debug!("Returning {} to the frontier", url);
        if let Err(e) = self.work.add_one(url.clone()).await {
            error!("Failed to return {} to the frontier: {:#}", url, e);
        }
    }

    /// Stop all loops, tell every client to disconnect, and return all
    /// outstanding work to the frontier. Safe to call more than once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Stopping host");
        self.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Host task ended abnormally: {}", e);
            }
        }

        let (handlers, mut orphaned) = self.registry.disconnect_all();
        for handler in handlers {
            if let Err(e) = handler.send(&NetworkMessage::disconnect()).await {
                debug!("Could not notify {}: {}", handler.peer(), e);
            }
            handler.dispose().await;
        }

        orphaned.extend(self.retry.lock().take());
        for url in orphaned {
            self.requeue(url).await;
        }

        info!("Host stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::CrawlerSettings;
    use crate::crawler::work_manager::FrontierRole;
    use crate::network::error::HandshakeError;
    use crate::network::handshake::join_host;
    use crate::network::message::read_frame;
    use crate::storage::{Collection, MemoryStore, RecordStore};
    use tokio::io::duplex;
    use tokio::sync::mpsc::UnboundedReceiver;

    const WAIT: Duration = Duration::from_secs(5);

    fn settings(password: Option<&str>) -> HostSettings {
        HostSettings {
            listen_address: "127.0.0.1:0".to_string(),
            password: password.map(str::to_string),
            client_max_age: 60,
            sweep_interval: 3600,
            work_backoff: 20,
            handshake_timeout: 2,
        }
    }

    async fn frontier(seeds: &[&str]) -> (Arc<WorkManager>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let work = WorkManager::new(store.clone(), 100, false, FrontierRole::Authoritative)
            .await
            .unwrap();
        let seeds: Vec<String> = seeds.iter().map(|s| s.to_string()).collect();
        work.initialize(&seeds).await.unwrap();
        (Arc::new(work), store)
    }

    async fn start_host(password: Option<&str>, seeds: &[&str]) -> (Arc<Host>, SocketAddr, Arc<WorkManager>, Arc<MemoryStore>) {
        let (work, store) = frontier(seeds).await;
        let host = Arc::new(Host::new(
            settings(password),
            work.clone(),
            UrlFilter::new(&CrawlerSettings::default()),
        ));
        let addr = host.start().await.unwrap();
        (host, addr, work, store)
    }

    /// Connect a raw worker whose every message lands in a channel
    async fn connect(
        addr: SocketAddr,
        password: Option<&str>,
        previous_id: Option<&str>,
    ) -> Result<(Arc<MessageHandler>, String, UnboundedReceiver<NetworkMessage>), HandshakeError> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = MessageHandler::with_callback(
            stream,
            addr.to_string(),
            Arc::new(move |message: &NetworkMessage| {
                let _ = tx.send(message.clone());
            }),
        );
        handler.start();
        let id = join_host(&handler, password, previous_id, WAIT).await?;
        Ok((handler, id, rx))
    }

    async fn next_of(rx: &mut UnboundedReceiver<NetworkMessage>, kind: MessageType) -> NetworkMessage {
        loop {
            let message = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            if message.is(kind) {
                return message;
            }
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn worker_receives_work_and_results_feed_the_frontier() {
        let (host, addr, work, store) = start_host(Some("secret"), &["https://example.com/"]).await;

        let (handler, id, mut rx) = connect(addr, Some("secret"), None).await.unwrap();
        assert_eq!(id.len(), 12);

        let work_message = next_of(&mut rx, MessageType::Work).await;
        assert_eq!(work_message.text(), Some("https://example.com/"));
        wait_until(|| host.registry().get(&id).map_or(false, |c| c.assigned_url.is_some())).await;

        let outcome = CrawlOutcome {
            url: "https://example.com/".to_string(),
            success: true,
            found_urls: vec![
                "https://example.com/a".to_string(),
                "https://example.com/".to_string(),
                "mailto:x@example.com".to_string(),
            ],
        };
        handler.send(&NetworkMessage::results_ready(&outcome).unwrap()).await.unwrap();

        let ack = next_of(&mut rx, MessageType::ResultsReceived).await;
        assert_eq!(ack.text(), Some("https://example.com/"));
        assert_eq!(store.count(Collection::CrawledHistory).await.unwrap(), 1);

        // Only the new link comes back as work
        let next = next_of(&mut rx, MessageType::Work).await;
        assert_eq!(next.text(), Some("https://example.com/a"));

        let info = host.registry().get(&id).unwrap();
        assert_eq!(info.crawled_count, 1);
        assert_eq!(info.work_count, 2);

        host.stop().await;
        next_of(&mut rx, MessageType::Disconnect).await;

        // The unfinished assignment went back to the frontier
        assert_eq!(work.total_work_count(), 1);
        host.stop().await;
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_without_registration() {
        let (host, addr, _work, _store) = start_host(Some("secret"), &[]).await;

        let Err(err) = connect(addr, Some("guess"), None).await else {
            panic!("wrong password was accepted");
        };
        assert!(matches!(err, HandshakeError::Rejected(_)));
        assert!(host.registry().is_empty());

        host.stop().await;
    }

    #[tokio::test]
    async fn reconnect_resumes_identity_and_returns_lost_work() {
        let (host, addr, work, _store) = start_host(None, &["https://example.com/"]).await;
        let mut events = host.subscribe();

        let (first, id, mut rx) = connect(addr, None, None).await.unwrap();
        next_of(&mut rx, MessageType::Work).await;
        wait_until(|| host.registry().get(&id).map_or(false, |c| c.assigned_url.is_some())).await;

        first.dispose().await;
        wait_until(|| host.registry().online_count() == 0).await;

        let (_second, resumed_id, mut rx) = connect(addr, None, Some(id.as_str())).await.unwrap();
        assert_eq!(resumed_id, id);
        assert_eq!(host.registry().len(), 1);

        // The orphaned URL is handed out again
        let again = next_of(&mut rx, MessageType::Work).await;
        assert_eq!(again.text(), Some("https://example.com/"));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&ClientEvent::Left { id: id.clone() }));
        assert!(seen.contains(&ClientEvent::Joined { id: id.clone(), resumed: true }));

        host.stop().await;
        assert_eq!(work.total_work_count(), 1);
    }

    #[tokio::test]
    async fn stale_sweep_reclaims_assigned_work() {
        let (host, addr, work, _store) = start_host(None, &["https://example.com/"]).await;
        let mut events = host.subscribe();

        let (handler, id, mut rx) = connect(addr, None, None).await.unwrap();
        next_of(&mut rx, MessageType::Work).await;
        wait_until(|| host.registry().get(&id).map_or(false, |c| c.assigned_url.is_some())).await;

        handler.dispose().await;
        wait_until(|| host.registry().online_count() == 0).await;
        let left_at = host.registry().get(&id).unwrap().last_connected;

        host.sweep_stale_clients(left_at + ChronoDuration::seconds(60)).await;
        assert!(host.registry().exists(&id));
        assert_eq!(work.total_work_count(), 0);

        host.sweep_stale_clients(left_at + ChronoDuration::seconds(61)).await;
        assert!(!host.registry().exists(&id));
        assert_eq!(work.total_work_count(), 1);

        let mut removed = false;
        while let Ok(event) = events.try_recv() {
            removed |= event == ClientEvent::Removed { id: id.clone() };
        }
        assert!(removed);

        host.stop().await;
    }

    #[tokio::test]
    async fn concurrent_resume_keeps_one_connection_per_id() {
        let (host, addr, _work, _store) = start_host(None, &[]).await;

        let (first, id, _rx) = connect(addr, None, None).await.unwrap();
        first.dispose().await;
        wait_until(|| host.registry().online_count() == 0).await;

        // Two reconnects with the same id both passed the offline check
        let (winner, _winner_peer) = duplex(4096);
        let (loser, mut loser_peer) = duplex(4096);
        let winner = MessageHandler::new(winner, "10.0.0.1:1");
        let loser = MessageHandler::new(loser, "10.0.0.1:2");

        assert!(host.admit(&id, "10.0.0.1:1", &winner).await);
        assert!(!host.admit(&id, "10.0.0.1:2", &loser).await);

        let reply = read_frame(&mut loser_peer).await.unwrap();
        assert!(reply.is(MessageType::Reject));
        assert!(loser.is_closed());
        assert!(!winner.is_closed());

        let info = host.registry().get(&id).unwrap();
        assert!(info.online);
        assert_eq!(info.remote_endpoint, "10.0.0.1:1");
        assert_eq!(host.registry().len(), 1);

        host.stop().await;
    }

    #[tokio::test]
    async fn client_admitted_during_stop_is_sent_away() {
        let (host, _addr, _work, _store) = start_host(None, &[]).await;
        host.stop().await;

        let (late, mut late_peer) = duplex(4096);
        let late = MessageHandler::new(late, "10.0.0.9:1");
        assert!(!host.admit("late-client", "10.0.0.9:1", &late).await);

        let reply = read_frame(&mut late_peer).await.unwrap();
        assert!(reply.is(MessageType::Disconnect));
        assert!(late.is_closed());
        assert_eq!(host.registry().online_count(), 0);
    }

    #[tokio::test]
    async fn work_waits_for_an_idle_worker() {
        let (host, addr, work, _store) =
            start_host(None, &["https://example.com/1", "https://example.com/2"]).await;

        let (_handler, _id, mut rx) = connect(addr, None, None).await.unwrap();
        let first = next_of(&mut rx, MessageType::Work).await;
        assert_eq!(first.text(), Some("https://example.com/1"));

        // The single worker is busy, so the second URL is held for retry
        wait_until(|| work.total_work_count() == 0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        host.stop().await;
        assert_eq!(work.total_work_count(), 2);
    }
}
