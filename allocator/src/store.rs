//! Per-namespace NodePort bookkeeping.
//!
//! The store maps each configured namespace to its sub-range and the set of
//! ports currently assigned within it. One exclusive lock guards the whole
//! map: every operation validates against the current state first and only
//! then mutates, so a rejected call never leaves a partial batch behind.
//!
//! Each allocated port optionally records the UID of the Service it was
//! assigned to. Ports seeded from the startup inventory carry no owner;
//! [`Store::assign`] uses the owner to recognize API-server retries that
//! re-submit a port the same Service already holds.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::error::{InvalidRange, StoreError};

pub type Port = u16;

/// Lowest port the cluster hands out to NodePort Services.
pub const NODE_PORT_MIN: Port = 30000;
/// Highest port the cluster hands out to NodePort Services.
pub const NODE_PORT_MAX: Port = 32767;

/// An inclusive sub-range `[min, max]` of the cluster NodePort space.
///
/// Immutable once registered for a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    min: Port,
    max: Port,
}

impl PortRange {
    pub fn new(min: Port, max: Port) -> Result<Self, InvalidRange> {
        if min > max || min < NODE_PORT_MIN || max > NODE_PORT_MAX {
            return Err(InvalidRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> Port {
        self.min
    }

    pub fn max(&self) -> Port {
        self.max
    }

    pub fn contains(&self, port: Port) -> bool {
        (self.min..=self.max).contains(&port)
    }

    /// Two inclusive intervals overlap iff each starts at or before the
    /// other ends.
    pub fn overlaps(&self, other: PortRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

#[derive(Debug)]
struct Entry {
    range: PortRange,
    /// Port -> UID of the owning Service, when known.
    allocated: BTreeMap<Port, Option<String>>,
}

/// Thread-safe map of namespace -> (sub-range, allocated ports).
///
/// Share via `Arc<Store>`; all mutation funnels through the inner lock and
/// no lock is held across I/O.
#[derive(Debug, Default)]
pub struct Store {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a namespace with its sub-range. Entries are never removed.
    pub fn register_namespace(&self, namespace: &str, range: PortRange) -> Result<(), StoreError> {
        let mut entries = self.locked();
        if entries.contains_key(namespace) {
            return Err(StoreError::AlreadyExists {
                namespace: namespace.to_string(),
            });
        }
        entries.insert(
            namespace.to_string(),
            Entry {
                range,
                allocated: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Mark a batch of ports as allocated, without an owner.
    ///
    /// The whole batch is validated against the current state before any
    /// port is added: one out-of-range or already-allocated port rejects
    /// the call and leaves the store unchanged.
    pub fn seed_ports(&self, namespace: &str, ports: &[Port]) -> Result<(), StoreError> {
        let mut entries = self.locked();
        let entry = get_entry(&mut entries, namespace)?;

        let mut batch = BTreeSet::new();
        for &port in ports {
            if !entry.range.contains(port) {
                return Err(StoreError::OutOfRange {
                    namespace: namespace.to_string(),
                    port,
                    range: entry.range,
                });
            }
            if entry.allocated.contains_key(&port) || !batch.insert(port) {
                return Err(StoreError::DoubleAllocation {
                    namespace: namespace.to_string(),
                    port,
                });
            }
        }
        for port in batch {
            entry.allocated.insert(port, None);
        }
        Ok(())
    }

    /// Return ports to the free pool. Releasing a free port is a no-op.
    pub fn release(&self, namespace: &str, ports: &[Port]) -> Result<(), StoreError> {
        let mut entries = self.locked();
        let entry = get_entry(&mut entries, namespace)?;
        for port in ports {
            entry.allocated.remove(port);
        }
        Ok(())
    }

    /// Reserve a specific free port inside the namespace sub-range.
    pub fn reserve(&self, namespace: &str, port: Port) -> Result<(), StoreError> {
        let mut entries = self.locked();
        let entry = get_entry(&mut entries, namespace)?;
        if !entry.range.contains(port) {
            return Err(StoreError::OutOfRange {
                namespace: namespace.to_string(),
                port,
                range: entry.range,
            });
        }
        if entry.allocated.contains_key(&port) {
            return Err(StoreError::Taken {
                namespace: namespace.to_string(),
                port,
            });
        }
        entry.allocated.insert(port, None);
        Ok(())
    }

    /// Reserve and return the smallest free port in the namespace sub-range.
    pub fn allocate_any(&self, namespace: &str) -> Result<Port, StoreError> {
        let mut entries = self.locked();
        let entry = get_entry(&mut entries, namespace)?;
        let port = lowest_free(namespace, entry)?;
        entry.allocated.insert(port, None);
        Ok(port)
    }

    /// Does `port` lie inside the namespace sub-range? False for unknown
    /// namespaces.
    pub fn in_range(&self, namespace: &str, port: Port) -> bool {
        self.locked()
            .get(namespace)
            .is_some_and(|entry| entry.range.contains(port))
    }

    /// The namespace sub-range, if one is configured.
    pub fn lookup(&self, namespace: &str) -> Option<PortRange> {
        self.locked().get(namespace).map(|entry| entry.range)
    }

    /// Snapshot of the allocated ports of a namespace, ascending.
    pub fn allocated_ports(&self, namespace: &str) -> Vec<Port> {
        self.locked()
            .get(namespace)
            .map(|entry| entry.allocated.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Resolve one admission request's ports in index order, atomically.
    ///
    /// For each requested port: `None` (unset in the Service spec) takes the
    /// lowest free port; an in-range free port is reserved as-is; an
    /// in-range port already held by `uid` is kept unchanged (the request is
    /// a retry or a no-op update of the same Service); anything else falls
    /// back to the lowest free port. Runs under a single critical section so
    /// concurrent admissions cannot observe the same free port, and rolls
    /// back every reservation made by this call before reporting
    /// [`StoreError::Exhausted`].
    pub fn assign(
        &self,
        namespace: &str,
        uid: &str,
        requested: &[Option<Port>],
    ) -> Result<Vec<Port>, StoreError> {
        let mut entries = self.locked();
        let entry = get_entry(&mut entries, namespace)?;

        let mut reserved_here: Vec<Port> = Vec::new();
        // ports already given to an earlier index of this same request; a
        // later entry naming one of them must be moved, not kept
        let mut in_request: BTreeSet<Port> = BTreeSet::new();
        let mut assigned = Vec::with_capacity(requested.len());
        for &want in requested {
            let kept = match want {
                Some(port) if entry.range.contains(port) && !in_request.contains(&port) => {
                    let held_by_us = match entry.allocated.get(&port) {
                        None => {
                            entry.allocated.insert(port, Some(uid.to_string()));
                            reserved_here.push(port);
                            true
                        }
                        Some(owner) => owner.as_deref() == Some(uid),
                    };
                    held_by_us.then_some(port)
                }
                _ => None,
            };
            let port = match kept {
                Some(port) => port,
                None => match lowest_free(namespace, entry) {
                    Ok(port) => {
                        entry.allocated.insert(port, Some(uid.to_string()));
                        reserved_here.push(port);
                        port
                    }
                    Err(e) => {
                        for port in reserved_here {
                            entry.allocated.remove(&port);
                        }
                        return Err(e);
                    }
                },
            };
            in_request.insert(port);
            assigned.push(port);
        }
        Ok(assigned)
    }
}

fn get_entry<'a>(
    entries: &'a mut HashMap<String, Entry>,
    namespace: &str,
) -> Result<&'a mut Entry, StoreError> {
    entries
        .get_mut(namespace)
        .ok_or_else(|| StoreError::UnknownNamespace {
            namespace: namespace.to_string(),
        })
}

/// Smallest free port, scanning the sub-range in ascending order.
fn lowest_free(namespace: &str, entry: &Entry) -> Result<Port, StoreError> {
    (entry.range.min()..=entry.range.max())
        .find(|port| !entry.allocated.contains_key(port))
        .ok_or_else(|| StoreError::Exhausted {
            namespace: namespace.to_string(),
            range: entry.range,
        })
}
