use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::callback::{
    same_callback, AsyncEventType, CallbackRef, ContextHubMessage, DebugCallback, NanoappInfo,
};
use crate::client_id::{ClientId, Pid, SYSTEM_CLIENT_ID, VENDOR_CLIENT_ID_MAX, VENDOR_CLIENT_ID_MIN};
use crate::config::ClientManagerConfig;
use crate::endpoint::{
    mutate, original_endpoint_id, owning_client_id, BROADCAST_HOST_ENDPOINT_ID,
    SYSTEM_ENDPOINT_ID_LIMIT, VENDOR_ENDPOINT_ID_LIMIT,
};
use crate::error::{HostError, Result};
use crate::liveness::{LivenessMonitor, ProcessWatcher};
use crate::mapping::ClientIdMapping;
use crate::pending::{
    FragmentedLoadTransaction, LoadFragment, PendingOperationTracker, PendingTransaction,
};

/// One logical host client.
///
/// Entries are created the first time a uuid is seen and never removed;
/// death only resets the connection fields.
#[derive(Clone)]
pub struct HalClient {
    pub client_id: ClientId,
    pub uuid: Uuid,
    /// `None` while disconnected.
    pub pid: Option<Pid>,
    /// Present iff connected.
    pub callback: Option<CallbackRef>,
    /// Endpoint ids as the client numbers them (unmutated).
    pub endpoint_ids: BTreeSet<u16>,
}

impl HalClient {
    fn new(uuid: Uuid, client_id: ClientId) -> Self {
        Self {
            client_id,
            uuid,
            pid: None,
            callback: None,
            endpoint_ids: BTreeSet::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.callback.is_some()
    }

    fn disconnect(&mut self) -> Option<(Pid, CallbackRef)> {
        let pid = self.pid.take();
        let callback = self.callback.take();
        self.endpoint_ids.clear();
        pid.zip(callback)
    }
}

impl fmt::Debug for HalClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HalClient")
            .field("client_id", &self.client_id)
            .field("uuid", &self.uuid)
            .field("pid", &self.pid)
            .field("callback", &DebugCallback(&self.callback))
            .field("endpoint_ids", &self.endpoint_ids)
            .finish()
    }
}

struct State {
    clients: Vec<HalClient>,
    mapping: ClientIdMapping,
    pending: PendingOperationTracker,
}

impl State {
    fn by_pid_mut(&mut self, pid: Pid) -> Option<&mut HalClient> {
        self.clients.iter_mut().find(|client| client.pid == Some(pid))
    }

    fn by_pid(&self, pid: Pid) -> Option<&HalClient> {
        self.clients.iter().find(|client| client.pid == Some(pid))
    }

    fn by_client_id(&self, client_id: ClientId) -> Option<&HalClient> {
        self.clients
            .iter()
            .find(|client| client.client_id == client_id)
    }

    fn by_uuid(&self, uuid: &Uuid) -> Option<&HalClient> {
        self.clients.iter().find(|client| client.uuid == *uuid)
    }

    fn connected_callbacks(&self) -> Vec<CallbackRef> {
        self.clients
            .iter()
            .filter_map(|client| client.callback.clone())
            .collect()
    }
}

/// Multiplexes host processes onto the shared hub link.
///
/// Assigns every client a stable id keyed by its uuid, tags endpoint ids
/// with it, and serializes load/unload operations. All state sits behind one
/// mutex; client callbacks are invoked only after it is released.
pub struct ClientManager {
    config: ClientManagerConfig,
    liveness: Arc<dyn LivenessMonitor>,
    state: Mutex<State>,
}

impl ClientManager {
    /// Create a manager, restoring known clients from the mapping file.
    pub fn new(config: ClientManagerConfig, liveness: Arc<dyn LivenessMonitor>) -> Self {
        let mapping = ClientIdMapping::load(&config.mapping_path);
        let clients = mapping
            .iter()
            .map(|(uuid, client_id)| HalClient::new(uuid, client_id))
            .collect();
        let pending = PendingOperationTracker::new(config.transaction_timeout);
        Self {
            config,
            liveness,
            state: Mutex::new(State {
                clients,
                mapping,
                pending,
            }),
        }
    }

    /// Create a manager whose clients are watched by a [`ProcessWatcher`].
    pub fn with_process_watcher(config: ClientManagerConfig, poll_interval: Duration) -> Arc<Self> {
        Arc::new_cyclic(|manager: &Weak<ClientManager>| {
            let manager = manager.clone();
            let watcher = ProcessWatcher::new(poll_interval, move |pid| {
                if let Some(manager) = manager.upgrade() {
                    manager.handle_client_death(pid);
                }
            });
            Self::new(config, Arc::new(watcher))
        })
    }

    pub fn config(&self) -> &ClientManagerConfig {
        &self.config
    }

    /// Register `callback` for the client `uuid` running as `pid`.
    ///
    /// Reuses the persisted id for `uuid`, or assigns and persists a new one.
    /// A different client still recorded under `pid` is disconnected first.
    /// Nothing changes if linking or persisting fails.
    pub fn register_callback(
        &self,
        pid: Pid,
        callback: CallbackRef,
        uuid: Uuid,
    ) -> Result<ClientId> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let known = state.mapping.get(&uuid);
        let client_id = match known {
            Some(client_id) => client_id,
            None => self.allocate_client_id(state, &uuid)?,
        };

        if !self.liveness.link(pid, &callback) {
            warn!(pid, %uuid, "failed to link client liveness");
            return Err(HostError::LinkFailed(pid));
        }
        if known.is_none() {
            if let Err(err) = state.mapping.insert(uuid, client_id) {
                self.liveness.unlink(pid, &callback);
                return Err(err);
            }
            info!(%uuid, client_id, "assigned new client id");
        }

        for stale in state
            .clients
            .iter_mut()
            .filter(|client| client.pid == Some(pid) && client.uuid != uuid)
        {
            info!(pid, client_id = stale.client_id, "pid now belongs to another client");
            if let Some((old_pid, old)) = stale.disconnect() {
                self.liveness.unlink(old_pid, &old);
            }
        }

        match state.clients.iter_mut().find(|client| client.uuid == uuid) {
            Some(client) => {
                if let Some(old) = client.callback.take() {
                    if let Some(old_pid) = client.pid {
                        self.liveness.unlink(old_pid, &old);
                    }
                    if same_callback(&old, &callback) {
                        debug!(pid, client_id, "callback registered again");
                    }
                }
                if client.pid != Some(pid) {
                    client.endpoint_ids.clear();
                }
                client.pid = Some(pid);
                client.callback = Some(callback);
            }
            None => {
                let mut client = HalClient::new(uuid, client_id);
                client.pid = Some(pid);
                client.callback = Some(callback);
                state.clients.push(client);
            }
        }

        info!(pid, client_id, %uuid, "client registered");
        Ok(client_id)
    }

    /// The client running as `pid` died.
    ///
    /// Its id and uuid are kept so a reconnect recovers the same identity.
    pub fn handle_client_death(&self, pid: Pid) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(client) = state.by_pid_mut(pid) else {
            warn!(pid, "death reported for unknown pid");
            return;
        };
        let client_id = client.client_id;
        if let Some((pid, callback)) = client.disconnect() {
            self.liveness.unlink(pid, &callback);
        }
        if let Some(dropped) = state.pending.reset_for_client(client_id) {
            info!(
                client_id,
                kind = ?dropped.kind,
                transaction_id = dropped.transaction_id,
                "dropping transaction of dead client"
            );
        }
        info!(pid, client_id, "client disconnected");
    }

    /// The hub restarted. Connected clients are told; disconnected ones are
    /// skipped.
    pub fn handle_chre_restart(&self) {
        let callbacks = {
            let mut state = self.lock();
            if let Some(dropped) = state.pending.clear() {
                info!(
                    kind = ?dropped.kind,
                    transaction_id = dropped.transaction_id,
                    "dropping transaction interrupted by restart"
                );
            }
            state.connected_callbacks()
        };
        info!(clients = callbacks.len(), "hub restarted");
        for callback in callbacks {
            callback.handle_context_hub_async_event(AsyncEventType::Restarted);
        }
    }

    pub fn get_client_id(&self, pid: Pid) -> Option<ClientId> {
        self.lock().by_pid(pid).map(|client| client.client_id)
    }

    /// Persisted id of `uuid`, connected or not.
    pub fn get_client_id_for_uuid(&self, uuid: &Uuid) -> Option<ClientId> {
        self.lock().mapping.get(uuid)
    }

    pub fn get_callback(&self, client_id: ClientId) -> Option<CallbackRef> {
        self.lock()
            .by_client_id(client_id)
            .and_then(|client| client.callback.clone())
    }

    /// Snapshot of every known client.
    pub fn clients(&self) -> Vec<HalClient> {
        self.lock().clients.clone()
    }

    /// Record an endpoint opened by `pid`.
    ///
    /// Ordinary clients are limited to ids below
    /// [`VENDOR_ENDPOINT_ID_LIMIT`].
    pub fn register_endpoint_id(&self, pid: Pid, endpoint_id: u16) -> Result<()> {
        let system_uuid = self.config.system_server_uuid;
        let mut state = self.lock();
        let client = state.by_pid_mut(pid).ok_or(HostError::UnknownPid(pid))?;
        let limit = endpoint_limit(client, &system_uuid);
        if endpoint_id >= limit {
            return Err(HostError::EndpointIdOutOfRange {
                client_id: client.client_id,
                endpoint_id,
                limit,
            });
        }
        if !client.endpoint_ids.insert(endpoint_id) {
            debug!(pid, endpoint_id, "endpoint already registered");
        }
        Ok(())
    }

    pub fn remove_endpoint_id(&self, pid: Pid, endpoint_id: u16) -> Result<()> {
        let mut state = self.lock();
        let client = state.by_pid_mut(pid).ok_or(HostError::UnknownPid(pid))?;
        if !client.endpoint_ids.remove(&endpoint_id) {
            return Err(HostError::EndpointNotRegistered { pid, endpoint_id });
        }
        Ok(())
    }

    /// Endpoint ids `pid` has open, unmutated.
    pub fn connected_endpoints(&self, pid: Pid) -> Option<Vec<u16>> {
        self.lock()
            .by_pid(pid)
            .map(|client| client.endpoint_ids.iter().copied().collect())
    }

    /// Rewrite an endpoint id from `pid` into the shared namespace.
    pub fn mutate_endpoint_id_from_host(&self, pid: Pid, endpoint_id: u16) -> Result<u16> {
        let system_uuid = self.config.system_server_uuid;
        let state = self.lock();
        let client = state.by_pid(pid).ok_or(HostError::UnknownPid(pid))?;
        let limit = endpoint_limit(client, &system_uuid);
        if endpoint_id >= limit {
            return Err(HostError::EndpointIdOutOfRange {
                client_id: client.client_id,
                endpoint_id,
                limit,
            });
        }
        if client.uuid == system_uuid {
            return Ok(endpoint_id);
        }
        Ok(mutate(endpoint_id, client.client_id))
    }

    /// The endpoint id the owning process knows.
    pub fn convert_to_original_endpoint_id(&self, endpoint_id: u16) -> u16 {
        original_endpoint_id(endpoint_id)
    }

    /// Callback of the client owning a (possibly mutated) endpoint id.
    pub fn get_callback_for_endpoint(&self, endpoint_id: u16) -> Option<CallbackRef> {
        let state = self.lock();
        let client = match owning_client_id(endpoint_id) {
            Some(client_id) => state.by_client_id(client_id),
            None => state.by_uuid(&self.config.system_server_uuid),
        };
        let Some(client) = client else {
            warn!(endpoint_id, "no client owns endpoint");
            return None;
        };
        if !client.endpoint_ids.contains(&original_endpoint_id(endpoint_id)) {
            warn!(
                endpoint_id,
                client_id = client.client_id,
                "endpoint unknown to its client or disconnected"
            );
        }
        client.callback.clone()
    }

    /// Deliver `message` to every connected client.
    pub fn send_message_for_all_callbacks(&self, message: &ContextHubMessage, permissions: &[String]) {
        let callbacks = self.lock().connected_callbacks();
        for callback in callbacks {
            callback.handle_context_hub_message(message, permissions);
        }
    }

    /// Deliver a hub message to the client owning its host endpoint.
    ///
    /// The endpoint id is restored before delivery. Returns `false` when no
    /// connected client owns it.
    pub fn route_message_to_host(&self, mut message: ContextHubMessage, permissions: &[String]) -> bool {
        if message.host_endpoint_id == BROADCAST_HOST_ENDPOINT_ID {
            self.send_message_for_all_callbacks(&message, permissions);
            return true;
        }
        let Some(callback) = self.get_callback_for_endpoint(message.host_endpoint_id) else {
            warn!(
                host_endpoint_id = message.host_endpoint_id,
                nanoapp_id = message.nanoapp_id,
                "dropping message for disconnected client"
            );
            return false;
        };
        message.host_endpoint_id = original_endpoint_id(message.host_endpoint_id);
        callback.handle_context_hub_message(&message, permissions);
        true
    }

    /// Report the terminal result of a load or unload and clear it.
    pub fn deliver_transaction_result(&self, client_id: ClientId, transaction_id: u32, success: bool) -> bool {
        let callback = {
            let mut state = self.lock();
            state.pending.reset_pending(client_id, transaction_id);
            state
                .by_client_id(client_id)
                .and_then(|client| client.callback.clone())
        };
        match callback {
            Some(callback) => {
                callback.handle_transaction_result(transaction_id, success);
                true
            }
            None => {
                warn!(client_id, transaction_id, "transaction result for disconnected client");
                false
            }
        }
    }

    pub fn deliver_nanoapp_info(&self, client_id: ClientId, apps: &[NanoappInfo]) -> bool {
        let Some(callback) = self.get_callback(client_id) else {
            warn!(client_id, "app list for disconnected client");
            return false;
        };
        callback.handle_nanoapp_info(apps);
        true
    }

    /// Start a load on behalf of `pid`.
    pub fn register_pending_load(&self, pid: Pid, transaction: FragmentedLoadTransaction) -> Result<()> {
        let mut state = self.lock();
        let client_id = state.by_pid(pid).ok_or(HostError::UnknownPid(pid))?.client_id;
        state
            .pending
            .register_pending_load(client_id, transaction, Instant::now())
    }

    /// Start an unload on behalf of `pid`.
    pub fn register_pending_unload(&self, pid: Pid, transaction_id: u32) -> Result<()> {
        let mut state = self.lock();
        let client_id = state.by_pid(pid).ok_or(HostError::UnknownPid(pid))?.client_id;
        state
            .pending
            .register_pending_unload(client_id, transaction_id, Instant::now())
    }

    pub fn reset_pending_transaction(&self, client_id: ClientId, transaction_id: u32) -> bool {
        self.lock().pending.reset_pending(client_id, transaction_id)
    }

    /// Next fragment of the pending load, after `current_fragment_id` was
    /// acknowledged.
    pub fn next_fragmented_load_request(
        &self,
        client_id: ClientId,
        transaction_id: u32,
        current_fragment_id: u32,
    ) -> Option<LoadFragment> {
        self.lock().pending.next_fragment(
            client_id,
            transaction_id,
            current_fragment_id,
            Instant::now(),
        )
    }

    pub fn pending_transaction(&self) -> Option<PendingTransaction> {
        self.lock().pending.pending().cloned()
    }

    fn allocate_client_id(&self, state: &State, uuid: &Uuid) -> Result<ClientId> {
        let exhausted = HostError::ClientIdsExhausted {
            max_clients: self.config.max_clients,
        };
        if state.mapping.len() >= self.config.max_clients {
            return Err(exhausted);
        }
        if *uuid == self.config.system_server_uuid && !state.mapping.contains_id(SYSTEM_CLIENT_ID) {
            return Ok(SYSTEM_CLIENT_ID);
        }
        (VENDOR_CLIENT_ID_MIN..=VENDOR_CLIENT_ID_MAX)
            .find(|&client_id| !state.mapping.contains_id(client_id))
            .ok_or(exhausted)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn endpoint_limit(client: &HalClient, system_uuid: &Uuid) -> u16 {
    if client.uuid == *system_uuid {
        SYSTEM_ENDPOINT_ID_LIMIT
    } else {
        VENDOR_ENDPOINT_ID_LIMIT
    }
}
