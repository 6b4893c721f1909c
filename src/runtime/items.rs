//! Versioned config-item distribution.
//!
//! Each client (a resource such as a service) has named items with a
//! requested and an applied version. Requesting an update bumps the
//! requested version and emits a [`ConfigUpdate`] event. Whoever handles the
//! event marks the version applied. Waiters poll until every item they care
//! about is applied or the retry budget runs out.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::error::{ConfigItemError, CorralError, Result};

/// Resource type name used for service clients.
pub const SERVICE_RESOURCE_TYPE: &str = "service";

/// A resource that config items are tracked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Client {
    /// Resource type, for example `service`.
    pub resource_type: String,
    /// Resource id.
    pub resource_id: i64,
}

impl Client {
    /// Creates a client for any resource.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, resource_id: i64) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id,
        }
    }

    /// Creates a client for a service.
    #[must_use]
    pub fn service(service_id: i64) -> Self {
        Self::new(SERVICE_RESOURCE_TYPE, service_id)
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.resource_id)
    }
}

/// Version of a config item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemVersion(pub u64);

impl fmt::Display for ItemVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One item of an update request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigUpdateItem {
    /// Item name.
    pub name: String,
    /// Version to wait for; filled in by `update_config`.
    pub requested_version: Option<ItemVersion>,
    /// Create the item at version 1 if it does not exist.
    pub apply: bool,
    /// Bump the requested version.
    pub increment: bool,
    /// Wait only until requested and applied agree.
    pub check_in_sync_only: bool,
}

impl ConfigUpdateItem {
    /// Creates an item that is applied and incremented.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requested_version: None,
            apply: true,
            increment: true,
            check_in_sync_only: false,
        }
    }

    /// Creates an item that waits for a known version without bumping it.
    #[must_use]
    pub fn at_version(name: impl Into<String>, version: Option<ItemVersion>) -> Self {
        Self {
            name: name.into(),
            requested_version: version,
            apply: false,
            increment: false,
            check_in_sync_only: version.is_none(),
        }
    }

    /// Creates an item that only checks whether it is in sync.
    #[must_use]
    pub fn in_sync(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requested_version: None,
            apply: false,
            increment: false,
            check_in_sync_only: true,
        }
    }
}

/// A request to update items on one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigUpdateRequest {
    /// Target client.
    pub client: Client,
    /// Items to update or wait for.
    pub items: Vec<ConfigUpdateItem>,
}

impl ConfigUpdateRequest {
    /// Creates an empty request for a client.
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self {
            client,
            items: Vec::new(),
        }
    }

    /// Adds an item.
    #[must_use]
    pub fn with_item(mut self, item: ConfigUpdateItem) -> Self {
        self.items.push(item);
        self
    }
}

/// Event asking a client to apply items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigUpdate {
    /// Event id, echoed in the reply.
    pub id: Uuid,
    /// Resource type of the target client.
    pub resource_type: String,
    /// Resource id of the target client, absent for broadcast events.
    pub resource_id: Option<i64>,
    /// Items to apply.
    pub items: Vec<ConfigUpdateItem>,
}

impl ConfigUpdate {
    /// Creates an event for a client.
    #[must_use]
    pub fn for_client(client: &Client, items: Vec<ConfigUpdateItem>) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource_type: client.resource_type.clone(),
            resource_id: Some(client.resource_id),
            items,
        }
    }

    /// Target client, if the event names one.
    #[must_use]
    pub fn client(&self) -> Option<Client> {
        self.resource_id.map(|id| Client::new(self.resource_type.clone(), id))
    }
}

/// Trait for config-item status managers.
#[async_trait]
pub trait ConfigItemManager: Send + Sync {
    /// Creates or bumps the requested versions of the request's items and
    /// emits an update for the ones that changed.
    ///
    /// Fills in `requested_version` on every item.
    async fn update_config(&self, request: &mut ConfigUpdateRequest) -> Result<()>;

    /// Waits until every item of the request is applied.
    ///
    /// Fails with [`ConfigItemError::Timeout`] carrying the still-pending
    /// items once the retry budget is spent.
    async fn wait_for(&self, request: &ConfigUpdateRequest) -> Result<()>;

    /// Requested version of an item.
    async fn get_requested_version(&self, client: &Client, item: &str) -> Result<Option<ItemVersion>>;

    /// Applied version of an item.
    async fn get_applied_version(&self, client: &Client, item: &str) -> Result<Option<ItemVersion>>;

    /// Marks a version applied. Never lowers the applied version.
    ///
    /// Returns true if the applied version changed.
    async fn set_applied(&self, client: &Client, item: &str, version: ItemVersion) -> Result<bool>;

    /// Re-emits updates for every item whose requested and applied versions
    /// differ. Returns the number of clients notified.
    async fn resync(&self) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, Default)]
struct ItemStatus {
    requested: u64,
    applied: Option<u64>,
}

/// In-memory config-item status table.
#[derive(Debug)]
pub struct InMemoryConfigItems {
    statuses: Mutex<HashMap<(Client, String), ItemStatus>>,
    tx: mpsc::UnboundedSender<ConfigUpdate>,
    retries: u32,
    poll_interval: Duration,
}

impl InMemoryConfigItems {
    /// Creates a status table and the receiver its update events go to.
    #[must_use]
    pub fn new(config: &ManagerConfig) -> (Self, mpsc::UnboundedReceiver<ConfigUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let items = Self {
            statuses: Mutex::new(HashMap::new()),
            tx,
            retries: config.item_wait_retries,
            poll_interval: Duration::from_millis(config.item_wait_timeout_millis),
        };
        (items, rx)
    }

    fn trigger(&self, client: &Client, items: Vec<ConfigUpdateItem>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        debug!(
            "Requesting update of {:?} on {client}",
            items.iter().map(|i| i.name.as_str()).collect::<Vec<_>>()
        );
        self.tx
            .send(ConfigUpdate::for_client(client, items))
            .map_err(|_| CorralError::ConfigItem(ConfigItemError::ChannelClosed))
    }

    async fn needs_updating(&self, request: &ConfigUpdateRequest) -> Vec<ConfigUpdateItem> {
        let statuses = self.statuses.lock().await;
        let mut pending = Vec::new();

        for item in &request.items {
            let Some(status) = statuses.get(&(request.client.clone(), item.name.clone())) else {
                warn!(
                    "Waiting on config item [{}] on client [{}] but it is not applied",
                    item.name, request.client
                );
                continue;
            };

            let waiting = if item.check_in_sync_only {
                status.applied != Some(status.requested)
            } else if let Some(ItemVersion(requested)) = item.requested_version {
                status.applied.is_none_or(|applied| requested > applied)
            } else {
                false
            };

            if waiting {
                debug!(
                    "Waiting on [{}] on [{}], requested {} applied {:?}",
                    item.name, request.client, status.requested, status.applied
                );
                pending.push(item.clone());
            }
        }
        pending
    }
}

#[async_trait]
impl ConfigItemManager for InMemoryConfigItems {
    async fn update_config(&self, request: &mut ConfigUpdateRequest) -> Result<()> {
        let mut to_trigger = Vec::new();
        {
            let mut statuses = self.statuses.lock().await;
            for item in &mut request.items {
                let key = (request.client.clone(), item.name.clone());
                let mut modified = false;
                let mut requested = item.requested_version;

                if !statuses.contains_key(&key) && item.apply {
                    let status = statuses.entry(key.clone()).or_default();
                    status.requested += 1;
                    requested = Some(ItemVersion(status.requested));
                    modified = true;
                }

                if requested.is_none() && item.increment {
                    let status = statuses.entry(key.clone()).or_default();
                    status.requested += 1;
                    requested = Some(ItemVersion(status.requested));
                    modified = true;
                }

                if requested.is_none() {
                    requested = statuses.get(&key).map(|s| ItemVersion(s.requested));
                }

                item.requested_version = requested;
                if modified {
                    to_trigger.push(item.clone());
                }
            }
        }

        self.trigger(&request.client, to_trigger)
    }

    async fn wait_for(&self, request: &ConfigUpdateRequest) -> Result<()> {
        let mut attempt = 0;
        loop {
            let pending = self.needs_updating(request).await;
            if pending.is_empty() {
                return Ok(());
            }

            if attempt >= self.retries {
                let pending: Vec<String> = pending.into_iter().map(|i| i.name).collect();
                info!("Timeout waiting for {pending:?} on [{}]", request.client);
                return Err(CorralError::ConfigItem(ConfigItemError::Timeout {
                    client: request.client.to_string(),
                    pending,
                }));
            }

            attempt += 1;
            self.trigger(&request.client, pending)?;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn get_requested_version(&self, client: &Client, item: &str) -> Result<Option<ItemVersion>> {
        Ok(self
            .statuses
            .lock()
            .await
            .get(&(client.clone(), item.to_string()))
            .map(|s| ItemVersion(s.requested)))
    }

    async fn get_applied_version(&self, client: &Client, item: &str) -> Result<Option<ItemVersion>> {
        Ok(self
            .statuses
            .lock()
            .await
            .get(&(client.clone(), item.to_string()))
            .and_then(|s| s.applied)
            .map(ItemVersion))
    }

    async fn set_applied(&self, client: &Client, item: &str, version: ItemVersion) -> Result<bool> {
        let mut statuses = self.statuses.lock().await;
        let Some(status) = statuses.get_mut(&(client.clone(), item.to_string())) else {
            return Ok(false);
        };

        if status.applied.is_some_and(|applied| applied >= version.0) {
            return Ok(false);
        }
        status.applied = Some(version.0);
        debug!("Applied {item} {version} on [{client}]");
        Ok(true)
    }

    async fn resync(&self) -> Result<usize> {
        let out_of_sync: BTreeMap<Client, Vec<String>> = {
            let statuses = self.statuses.lock().await;
            let mut grouped: BTreeMap<Client, Vec<String>> = BTreeMap::new();
            for ((client, name), status) in statuses.iter() {
                if status.applied != Some(status.requested) {
                    grouped.entry(client.clone()).or_default().push(name.clone());
                }
            }
            grouped
        };

        for (client, names) in &out_of_sync {
            info!("Requesting update of item(s) {names:?} on [{client}]");
            let items = names.iter().map(ConfigUpdateItem::in_sync).collect();
            self.trigger(client, items)?;
        }
        Ok(out_of_sync.len())
    }
}
