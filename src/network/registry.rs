use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::network::handler::MessageHandler;
use crate::network::picker::ClientPicker;

const EVENT_CAPACITY: usize = 256;

/// Host-side view of one worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub online: bool,
    pub last_connected: DateTime<Utc>,
    pub remote_endpoint: String,
    pub assigned_url: Option<String>,
    pub work_count: u64,
    pub crawled_count: u64,
    pub handshake_completed: bool,
    pub active: bool,
}

impl ClientInfo {
    pub fn new(id: &str, remote_endpoint: &str) -> Self {
        Self {
            id: id.to_string(),
            online: true,
            last_connected: Utc::now(),
            remote_endpoint: remote_endpoint.to_string(),
            assigned_url: None,
            work_count: 0,
            crawled_count: 0,
            handshake_completed: true,
            active: true,
        }
    }
}

/// Client lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Joined { id: String, resumed: bool },
    Left { id: String },
    Removed { id: String },
}

struct RegisteredClient {
    info: ClientInfo,
    handler: Option<Arc<MessageHandler>>,
}

/// Outcome of registering a connection that completed the handshake
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub resumed: bool,
    /// Assignment left over from the previous connection of this id
    pub orphaned_url: Option<String>,
}

/// Client removed by the stale sweep
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedClient {
    pub id: String,
    pub orphaned_url: Option<String>,
}

/// Roster of connected and recently connected workers
pub struct ClientRegistry {
    clients: Mutex<Vec<RegisteredClient>>,
    events: broadcast::Sender<ClientEvent>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            clients: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub fn exists(&self, id: &str) -> bool {
        self.clients.lock().iter().any(|client| client.info.id == id)
    }

    /// Known clients may resume their id only while offline
    pub fn can_resume(&self, id: &str) -> bool {
        self.clients
            .lock()
            .iter()
            .any(|client| client.info.id == id && !client.info.online)
    }

    /// Add a connection that completed the handshake, replacing an offline
    /// entry with the same id in place. Returns `None` when another online
    /// connection already holds the id.
    pub fn register(&self, id: &str, remote_endpoint: &str, handler: Arc<MessageHandler>) -> Option<Registration> {
        let registration = {
            let mut clients = self.clients.lock();
            match clients.iter_mut().find(|client| client.info.id == id) {
                Some(existing) if existing.info.online => {
                    warn!("Client id {} from {} is already in use", id, remote_endpoint);
                    return None;
                }
                Some(existing) => {
                    let orphaned_url = existing.info.assigned_url.take();
                    existing.info = ClientInfo {
                        work_count: existing.info.work_count,
                        crawled_count: existing.info.crawled_count,
                        ..ClientInfo::new(id, remote_endpoint)
                    };
                    existing.handler = Some(handler);
                    Registration {
                        resumed: true,
                        orphaned_url,
                    }
                }
                None => {
                    clients.push(RegisteredClient {
                        info: ClientInfo::new(id, remote_endpoint),
                        handler: Some(handler),
                    });
                    Registration {
                        resumed: false,
                        orphaned_url: None,
                    }
                }
            }
        };

        info!("Client {} joined from {}", id, remote_endpoint);
        self.publish(ClientEvent::Joined {
            id: id.to_string(),
            resumed: registration.resumed,
        });
        Some(registration)
    }

    /// Mark a client offline if `handler` is still its current connection
    pub fn mark_offline(&self, id: &str, handler: &Arc<MessageHandler>) -> bool {
        let changed = {
            let mut clients = self.clients.lock();
            match clients.iter_mut().find(|client| client.info.id == id) {
                Some(client)
                    if client.info.online
                        && client.handler.as_ref().map_or(false, |current| Arc::ptr_eq(current, handler)) =>
                {
                    client.info.online = false;
                    client.info.last_connected = Utc::now();
                    client.handler = None;
                    true
                }
                _ => false,
            }
        };

        if changed {
            info!("Client {} went offline", id);
            self.publish(ClientEvent::Left { id: id.to_string() });
        }
        changed
    }

    /// Remove offline clients whose last connection is older than `max_age`.
    ///
    /// Callers return each orphaned URL to the frontier and then publish
    /// `ClientEvent::Removed`.
    pub fn sweep_stale(&self, now: DateTime<Utc>, max_age: ChronoDuration) -> Vec<RemovedClient> {
        let mut clients = self.clients.lock();
        let mut removed = Vec::new();

        clients.retain_mut(|client| {
            let stale = !client.info.online && now - client.info.last_connected > max_age;
            if stale {
                removed.push(RemovedClient {
                    id: client.info.id.clone(),
                    orphaned_url: client.info.assigned_url.take(),
                });
            }
            !stale
        });

        if !removed.is_empty() {
            debug!("Swept {} stale clients", removed.len());
        }
        removed
    }

    /// Choose a destination for the next URL
    pub fn pick(&self, picker: &dyn ClientPicker) -> Option<(String, Arc<MessageHandler>)> {
        let clients = self.clients.lock();
        let chosen = picker.pick(&mut clients.iter().map(|client| &client.info))?.id.clone();
        let handler = clients
            .iter()
            .find(|client| client.info.id == chosen)
            .and_then(|client| client.handler.clone())?;
        Some((chosen, handler))
    }

    /// Record that `url` was handed to a client
    pub fn assign(&self, id: &str, url: &str) -> bool {
        let mut clients = self.clients.lock();
        match clients.iter_mut().find(|client| client.info.id == id) {
            Some(client) => {
                client.info.assigned_url = Some(url.to_string());
                client.info.work_count += 1;
                true
            }
            None => false,
        }
    }

    /// Clear an assignment that was never delivered
    pub fn unassign(&self, id: &str, url: &str) {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.iter_mut().find(|client| client.info.id == id) {
            if client.info.assigned_url.as_deref() == Some(url) {
                client.info.assigned_url = None;
                client.info.work_count = client.info.work_count.saturating_sub(1);
            }
        }
    }

    /// Record a reported result; clears the assignment if it matches
    pub fn complete(&self, id: &str, url: &str) -> bool {
        let mut clients = self.clients.lock();
        match clients.iter_mut().find(|client| client.info.id == id) {
            Some(client) => {
                if client.info.assigned_url.as_deref() == Some(url) {
                    client.info.assigned_url = None;
                }
                client.info.crawled_count += 1;
                true
            }
            None => false,
        }
    }

    pub fn set_active(&self, id: &str, active: bool) -> bool {
        let mut clients = self.clients.lock();
        match clients.iter_mut().find(|client| client.info.id == id) {
            Some(client) => {
                client.info.active = active;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<ClientInfo> {
        self.clients
            .lock()
            .iter()
            .find(|client| client.info.id == id)
            .map(|client| client.info.clone())
    }

    pub fn snapshot(&self) -> Vec<ClientInfo> {
        self.clients.lock().iter().map(|client| client.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn online_count(&self) -> usize {
        self.clients.lock().iter().filter(|client| client.info.online).count()
    }

    /// Detach every live connection and collect outstanding assignments
    pub fn disconnect_all(&self) -> (Vec<Arc<MessageHandler>>, Vec<String>) {
        let mut clients = self.clients.lock();
        let now = Utc::now();
        let mut handlers = Vec::new();
        let mut orphaned = Vec::new();

        for client in clients.iter_mut() {
            if let Some(handler) = client.handler.take() {
                handlers.push(handler);
            }
            if let Some(url) = client.info.assigned_url.take() {
                orphaned.push(url);
            }
            if client.info.online {
                client.info.online = false;
                client.info.last_connected = now;
            }
        }

        (handlers, orphaned)
    }
}
