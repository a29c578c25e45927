use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cli::config::{CrawlerConfig, CrawlerSettings, WorkerIdentity};
use crate::crawler::controller::{CrawlerController, Dispatch};
use crate::crawler::extract::HtmlLinkExtractor;
use crate::crawler::fetch::{Fetcher, HttpFetcher};
use crate::crawler::filter::UrlFilter;
use crate::crawler::robots::RobotsEngine;
use crate::crawler::work_manager::{FrontierRole, WorkManager};
use crate::network::host::Host;
use crate::network::worker::{HostCommand, WorkerConnection};
use crate::storage::open_store;

/// Run a host until Ctrl-C
pub async fn host(profile: Option<String>, listen: Option<String>, password: Option<String>) -> Result<()> {
    let mut config = CrawlerConfig::load(profile.as_deref())?;

    // Override configuration with command line parameters if provided
    if let Some(listen) = listen {
        config.host.listen_address = listen;
    }
    if password.is_some() {
        config.host.password = password;
    }
    if config.host.password.is_none() {
        warn!("No password configured; any worker may join");
    }

    let filter = UrlFilter::new(&config.crawler);
    let seeds = filter.admit_all(&config.crawler.seed_urls);

    let store = open_store(&config.storage, "host")
        .await
        .context("Failed to open record store")?;
    let work = Arc::new(
        WorkManager::new(
            store,
            config.crawler.memory_limit_count,
            config.crawler.depth_first,
            FrontierRole::Authoritative,
        )
        .await?,
    );
    work.initialize(&seeds).await?;

    let host = Arc::new(Host::new(config.host.clone(), work.clone(), filter));
    let address = host.start().await?;
    info!("Host ready on {} with {} URLs queued; press Ctrl-C to stop", address, work.total_work_count());

    let mut events = host.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!("Client event: {:?}", event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!("Missed {} client events", missed)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Ctrl-C received");

    host.stop().await;
    event_log.abort();
    work.dispose().await?;

    info!("{} URLs left in the frontier", work.total_work_count());
    Ok(())
}

/// Crawl for a host, reconnecting until Ctrl-C
pub async fn worker(profile: Option<String>, host: Option<String>, password: Option<String>) -> Result<()> {
    let mut config = CrawlerConfig::load(profile.as_deref())?;

    // Override configuration with command line parameters if provided
    if let Some(host) = host {
        config.worker.host_address = host;
    }
    if password.is_some() {
        config.worker.password = password;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let interrupt = spawn_interrupt_listener(shutdown_tx.clone());

    let (fetcher, robots) = crawl_stack(&config.crawler)?;
    let sweep = robots
        .clone()
        .spawn_expiry_sweep(config.crawler.robots_sweep_interval(), shutdown_rx.clone());
    let identity = WorkerIdentity::default_location();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match worker_session(&config, &identity, fetcher.clone(), robots.clone(), shutdown_rx.clone()).await {
            Ok(()) => info!("Session with {} ended", config.worker.host_address),
            Err(e) => warn!("{:#}", e),
        }

        if *shutdown_rx.borrow() {
            break;
        }

        let delay = config.worker.reconnect_delay();
        info!("Reconnecting in {:?}", delay);
        let mut shutdown = shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    shutdown_tx.send_replace(true);
    let _ = sweep.await;
    interrupt.abort();
    Ok(())
}

/// One connection to the host: join, crawl what it hands out, clean up
async fn worker_session(
    config: &CrawlerConfig,
    identity: &WorkerIdentity,
    fetcher: Arc<dyn Fetcher>,
    robots: Arc<RobotsEngine>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let previous_id = identity.load();
    let connection = Arc::new(
        WorkerConnection::connect(
            &config.worker.host_address,
            config.worker.password.as_deref(),
            previous_id.as_deref(),
            config.worker.handshake_timeout(),
        )
        .await?,
    );
    if let Err(e) = identity.save(connection.client_id()) {
        warn!("Could not remember worker id: {:#}", e);
    }

    let store = open_store(&config.storage, "worker")
        .await
        .context("Failed to open record store")?;
    let work = Arc::new(
        WorkManager::new(
            store,
            config.crawler.memory_limit_count,
            config.crawler.depth_first,
            FrontierRole::HostFed,
        )
        .await?,
    );

    // Feeds the local frontier and ends the session when the host goes away
    let (session_tx, session_rx) = watch::channel(false);
    let pump = {
        let connection = connection.clone();
        let work = work.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    command = connection.next_command() => match command {
                        Some(HostCommand::Work(url)) => {
                            if let Err(e) = work.add_one(url).await {
                                warn!("Failed to queue work from host: {:#}", e);
                                break;
                            }
                        }
                        Some(HostCommand::Disconnect) => {
                            info!("Host asked us to disconnect");
                            break;
                        }
                        None => {
                            info!("Connection to host closed");
                            break;
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            session_tx.send_replace(true);
        })
    };

    let controller = CrawlerController::new(
        config.crawler.clone(),
        work.clone(),
        fetcher,
        Arc::new(HtmlLinkExtractor::new()),
        robots,
        Dispatch::Remote(connection.clone()),
    );
    let result = controller.run(session_rx).await;

    connection.close().await;
    let _ = pump.await;
    work.dispose().await?;
    result
}

/// Crawl from the given URLs on this machine only
pub async fn crawl(urls: Vec<String>, profile: Option<String>, depth_first: bool, limit: Option<usize>) -> Result<()> {
    let mut config = CrawlerConfig::load(profile.as_deref())?;

    // Override configuration with command line parameters if provided
    if depth_first {
        config.crawler.depth_first = true;
    }

    let filter = UrlFilter::new(&config.crawler);
    let mut seeds = config.crawler.seed_urls.clone();
    seeds.extend(urls);
    let seeds = filter.admit_all(&seeds);

    let store = open_store(&config.storage, "crawl")
        .await
        .context("Failed to open record store")?;
    let work = Arc::new(
        WorkManager::new(
            store,
            config.crawler.memory_limit_count,
            config.crawler.depth_first,
            FrontierRole::Authoritative,
        )
        .await?,
    );
    work.initialize(&seeds).await?;

    if work.total_work_count() == 0 {
        warn!("Nothing to crawl: no new seed URLs and no saved frontier");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let interrupt = spawn_interrupt_listener(shutdown_tx.clone());

    let (fetcher, robots) = crawl_stack(&config.crawler)?;
    let sweep = robots
        .clone()
        .spawn_expiry_sweep(config.crawler.robots_sweep_interval(), shutdown_rx.clone());

    let controller = CrawlerController::new(
        config.crawler.clone(),
        work.clone(),
        fetcher,
        Arc::new(HtmlLinkExtractor::new()),
        robots,
        Dispatch::Local(filter),
    )
    .with_page_limit(limit);
    let result = controller.run(shutdown_rx).await;

    shutdown_tx.send_replace(true);
    let _ = sweep.await;
    interrupt.abort();

    work.dispose().await?;
    result
}

/// HTTP fetcher and robots engine shared by every crawl loop of a process
fn crawl_stack(settings: &CrawlerSettings) -> Result<(Arc<dyn Fetcher>, Arc<RobotsEngine>)> {
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(&settings.user_agent, settings.fetch_timeout())?);
    let robots = Arc::new(
        RobotsEngine::new(&settings.user_agent, settings.respect_robots_txt, settings.robots_max_age())
            .with_fetcher(fetcher.clone()),
    );
    Ok((fetcher, robots))
}

/// Raise the shutdown flag on Ctrl-C
fn spawn_interrupt_listener(shutdown: Arc<watch::Sender<bool>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, finishing the current page");
                shutdown.send_replace(true);
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    })
}

/// List all available configuration profiles
pub fn list_profiles() -> Result<()> {
    let profiles = CrawlerConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Show a profile, creating it with defaults if it does not exist
pub fn manage_profile(profile_name: String) -> Result<()> {
    match CrawlerConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{}", serde_yaml::to_string(&config).context("Failed to serialize configuration")?);
        }
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = CrawlerConfig::default();
            config.save_as_profile(&profile_name)?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub fn show_config() -> Result<()> {
    let config = CrawlerConfig::load_default()?;
    println!("Current configuration:");
    println!("{}", serde_yaml::to_string(&config).context("Failed to serialize configuration")?);

    Ok(())
}
