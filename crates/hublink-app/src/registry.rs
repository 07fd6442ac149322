use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::endpoint::{Endpoint, EndpointDescriptor};
use crate::error::{AppError, Result};
use crate::header::{Handle, HANDLE_NEGOTIATED_RANGE_START, HANDLE_NONE};

/// A live registration: handle, descriptor and dispatch capabilities.
pub struct RegisteredEndpoint {
    pub handle: Handle,
    pub descriptor: EndpointDescriptor,
    pub endpoint: Arc<dyn Endpoint>,
}

impl fmt::Debug for RegisteredEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredEndpoint")
            .field("handle", &self.handle)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Handle-keyed table of registered endpoints.
///
/// Read-mostly: the dispatch thread looks endpoints up under a shared lock
/// while registration and teardown take the exclusive lock briefly. Lookups
/// hand out `Arc`s, so an endpoint unregistered mid-dispatch stays alive
/// until the dispatch finishes.
pub struct EndpointRegistry {
    entries: RwLock<BTreeMap<Handle, Arc<RegisteredEndpoint>>>,
    capacity: usize,
}

impl EndpointRegistry {
    /// Create a registry with room for `capacity` negotiated handles.
    pub fn new(capacity: usize) -> Self {
        let max = usize::from(Handle::MAX - HANDLE_NEGOTIATED_RANGE_START) + 1;
        Self {
            entries: RwLock::new(BTreeMap::new()),
            capacity: capacity.min(max),
        }
    }

    /// Register at the lowest free negotiated handle.
    pub fn register(
        &self,
        descriptor: EndpointDescriptor,
        endpoint: Arc<dyn Endpoint>,
    ) -> Result<Handle> {
        let mut entries = self.write();
        ensure_unique_uuid(&entries, &descriptor)?;

        let handle = (0..self.capacity)
            .map(|offset| HANDLE_NEGOTIATED_RANGE_START + offset as Handle)
            .find(|handle| !entries.contains_key(handle))
            .ok_or(AppError::RegistryFull {
                capacity: self.capacity,
            })?;

        insert(&mut entries, handle, descriptor, endpoint);
        Ok(handle)
    }

    /// Register at a specific handle (predefined endpoints such as loopback).
    pub fn register_at(
        &self,
        handle: Handle,
        descriptor: EndpointDescriptor,
        endpoint: Arc<dyn Endpoint>,
    ) -> Result<Handle> {
        if handle == HANDLE_NONE || !self.is_assignable(handle) {
            return Err(AppError::InvalidHandle(handle));
        }

        let mut entries = self.write();
        if entries.contains_key(&handle) {
            return Err(AppError::HandleInUse(handle));
        }
        ensure_unique_uuid(&entries, &descriptor)?;

        insert(&mut entries, handle, descriptor, endpoint);
        Ok(handle)
    }

    /// Remove a registration. Returns the removed entry, if any.
    pub fn unregister(&self, handle: Handle) -> Option<Arc<RegisteredEndpoint>> {
        let removed = self.write().remove(&handle);
        if removed.is_some() {
            debug!(handle, "endpoint unregistered");
        }
        removed
    }

    /// Look up the endpoint registered at `handle`.
    pub fn lookup(&self, handle: Handle) -> Option<Arc<RegisteredEndpoint>> {
        self.read().get(&handle).cloned()
    }

    /// Snapshot of every live registration, in handle order.
    pub fn entries(&self) -> Vec<Arc<RegisteredEndpoint>> {
        self.read().values().cloned().collect()
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Negotiated handle capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_assignable(&self, handle: Handle) -> bool {
        handle < HANDLE_NEGOTIATED_RANGE_START
            || usize::from(handle - HANDLE_NEGOTIATED_RANGE_START) < self.capacity
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<Handle, Arc<RegisteredEndpoint>>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<Handle, Arc<RegisteredEndpoint>>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn ensure_unique_uuid(
    entries: &BTreeMap<Handle, Arc<RegisteredEndpoint>>,
    descriptor: &EndpointDescriptor,
) -> Result<()> {
    if entries
        .values()
        .any(|entry| entry.descriptor.uuid == descriptor.uuid)
    {
        return Err(AppError::DuplicateUuid(descriptor.uuid));
    }
    Ok(())
}

fn insert(
    entries: &mut BTreeMap<Handle, Arc<RegisteredEndpoint>>,
    handle: Handle,
    descriptor: EndpointDescriptor,
    endpoint: Arc<dyn Endpoint>,
) {
    info!(
        handle,
        kind = ?descriptor.kind,
        uuid = %descriptor.uuid,
        version = %descriptor.version,
        name = descriptor.name.as_deref().unwrap_or(""),
        "endpoint registered"
    );
    entries.insert(
        handle,
        Arc::new(RegisteredEndpoint {
            handle,
            descriptor,
            endpoint,
        }),
    );
}
