//! Generic multi-tenant resource pool.
//!
//! One pool caches one resource kind, keyed by table name. Pools come in
//! two flavors: exclusive pools (table writers) allow at most one checked
//! out resource per table, shared pools (readers, metadata views, wal
//! writers) hand out as many as callers ask for and cache the returned
//! ones for reuse. A table-level `lock` makes the entry unavailable until
//! `unlock`; it only succeeds while nothing is checked out.
//!
//! Checked-out resources travel in a [`PooledHandle`] guard that returns
//! them to the idle set on drop. Construction of a missing resource runs
//! outside the map lock; the slot is reserved first so a concurrent
//! exclusive checkout or lock fails fast instead of blocking.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;

use heron_common::error::{EngineError, EngineResult};
use heron_common::types::PoolKind;

/// Pool lifecycle notifications, delivered synchronously on the thread
/// that triggered them. Listeners must not call back into the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    Get,
    Create,
    Return,
    Lock,
    Unlock,
    Evict,
}

pub trait PoolListener: Send + Sync {
    fn on_event(&self, kind: PoolKind, event: PoolEvent, table_name: &str);
}

/// Observable pool statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub checkouts: u64,
    pub creates: u64,
    pub returns: u64,
    pub evictions: u64,
    pub rejections: u64,
    /// Cached resources across all tables.
    pub idle: usize,
    /// Checked-out resources across all tables.
    pub busy: usize,
}

struct PoolCounters {
    checkouts: AtomicU64,
    creates: AtomicU64,
    returns: AtomicU64,
    evictions: AtomicU64,
    rejections: AtomicU64,
}

impl PoolCounters {
    fn new() -> Self {
        Self {
            checkouts: AtomicU64::new(0),
            creates: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }
}

struct IdleSlot<R> {
    resource: R,
    released_at: Instant,
}

struct PoolEntry<R> {
    /// Set while the table is locked on this pool.
    lock_reason: Option<String>,
    /// Thread that took the lock; diagnostics only, unlock is not owner
    /// checked.
    lock_owner: Option<ThreadId>,
    busy: usize,
    /// Reason of the live checkout; exclusive pools only.
    busy_reason: Option<String>,
    idle: Vec<IdleSlot<R>>,
}

impl<R> Default for PoolEntry<R> {
    fn default() -> Self {
        Self {
            lock_reason: None,
            lock_owner: None,
            busy: 0,
            busy_reason: None,
            idle: Vec::new(),
        }
    }
}

type Factory<R> = dyn Fn(&str) -> EngineResult<R> + Send + Sync;

struct PoolShared<R: Send + 'static> {
    kind: PoolKind,
    exclusive: bool,
    idle_ttl: Duration,
    entries: DashMap<String, PoolEntry<R>>,
    factory: Box<Factory<R>>,
    listener: RwLock<Option<Arc<dyn PoolListener>>>,
    counters: PoolCounters,
    closed: AtomicBool,
}

pub struct Pool<R: Send + 'static> {
    shared: Arc<PoolShared<R>>,
}

impl<R: Send + 'static> Clone for Pool<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: Send + 'static> Pool<R> {
    pub fn new(
        kind: PoolKind,
        exclusive: bool,
        idle_ttl: Duration,
        factory: impl Fn(&str) -> EngineResult<R> + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                kind,
                exclusive,
                idle_ttl,
                entries: DashMap::new(),
                factory: Box::new(factory),
                listener: RwLock::new(None),
                counters: PoolCounters::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.shared.kind
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn PoolListener>>) {
        *self.shared.listener.write() = listener;
    }

    /// Checks out a resource for `table_name`, reusing a cached one when
    /// available. `reason` is recorded as the busy reason on exclusive
    /// pools and surfaces in rejection messages.
    pub fn get(&self, table_name: &str, reason: &str) -> EngineResult<PooledHandle<R>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(EngineError::CriticalState(format!(
                "{} pool is closed",
                self.shared.kind
            )));
        }

        enum Checkout<R> {
            Reuse(R),
            Construct,
        }

        let plan = {
            let mut entry = self.shared.entries.entry(table_name.to_string()).or_default();
            if let Some(held) = &entry.lock_reason {
                let held = held.clone();
                drop(entry);
                self.shared.counters.rejections.fetch_add(1, Ordering::Relaxed);
                return Err(EngineError::busy(held));
            }
            if self.shared.exclusive && entry.busy > 0 {
                let held = entry
                    .busy_reason
                    .clone()
                    .unwrap_or_else(|| format!("busy {}", self.shared.kind));
                drop(entry);
                self.shared.counters.rejections.fetch_add(1, Ordering::Relaxed);
                return Err(EngineError::busy(held));
            }
            // Reserve before constructing so a racing lock or exclusive
            // get sees the slot as taken.
            entry.busy += 1;
            if self.shared.exclusive {
                entry.busy_reason = Some(reason.to_string());
            }
            match entry.idle.pop() {
                Some(slot) => Checkout::Reuse(slot.resource),
                None => Checkout::Construct,
            }
        };

        let resource = match plan {
            Checkout::Reuse(resource) => resource,
            Checkout::Construct => match (self.shared.factory)(table_name) {
                Ok(resource) => {
                    self.shared.counters.creates.fetch_add(1, Ordering::Relaxed);
                    self.emit(PoolEvent::Create, table_name);
                    resource
                }
                Err(e) => {
                    self.cancel_reservation(table_name);
                    return Err(e);
                }
            },
        };

        self.shared.counters.checkouts.fetch_add(1, Ordering::Relaxed);
        self.emit(PoolEvent::Get, table_name);
        Ok(PooledHandle {
            resource: Some(resource),
            shared: Arc::clone(&self.shared),
            table_name: table_name.to_string(),
            keep: true,
        })
    }

    /// Locks `table_name` on this pool. Returns `None` on success or the
    /// reason the table is currently unavailable. Cached idle resources
    /// are evicted so a locked table holds nothing open.
    pub fn lock(&self, table_name: &str, reason: &str) -> Option<String> {
        let evicted;
        {
            let mut entry = self.shared.entries.entry(table_name.to_string()).or_default();
            if let Some(held) = &entry.lock_reason {
                return Some(held.clone());
            }
            if entry.busy > 0 {
                return Some(
                    entry
                        .busy_reason
                        .clone()
                        .unwrap_or_else(|| format!("busy {}", self.shared.kind)),
                );
            }
            entry.lock_reason = Some(reason.to_string());
            entry.lock_owner = Some(thread::current().id());
            evicted = std::mem::take(&mut entry.idle);
        }
        let evicted = evicted.len();
        if evicted > 0 {
            self.shared
                .counters
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            self.emit(PoolEvent::Evict, table_name);
        }
        self.emit(PoolEvent::Lock, table_name);
        None
    }

    /// Unlock variant for callers still holding a checked-out handle.
    /// With `new_table` the handle is discarded so the next checkout
    /// reopens from disk; otherwise it returns to the idle set.
    pub fn unlock_with(&self, handle: PooledHandle<R>, new_table: bool) {
        let table_name = handle.table_name().to_string();
        if new_table {
            handle.close_now();
            self.unlock(&table_name);
        } else {
            self.unlock(&table_name);
            drop(handle);
        }
    }

    /// Releases the table-level lock. Unlocking a table that is not
    /// locked is a no-op.
    pub fn unlock(&self, table_name: &str) {
        let unlocked = match self.shared.entries.get_mut(table_name) {
            Some(mut entry) => {
                entry.lock_owner = None;
                entry.lock_reason.take().is_some()
            }
            None => false,
        };
        self.drop_entry_if_unused(table_name);
        if unlocked {
            self.emit(PoolEvent::Unlock, table_name);
        }
    }

    pub fn is_locked(&self, table_name: &str) -> bool {
        self.shared
            .entries
            .get(table_name)
            .map(|e| e.lock_reason.is_some())
            .unwrap_or(false)
    }

    pub fn lock_reason(&self, table_name: &str) -> Option<String> {
        self.shared
            .entries
            .get(table_name)
            .and_then(|e| e.lock_reason.clone())
    }

    pub fn busy_count(&self, table_name: &str) -> usize {
        self.shared
            .entries
            .get(table_name)
            .map(|e| e.busy)
            .unwrap_or(0)
    }

    pub fn idle_count(&self, table_name: &str) -> usize {
        self.shared
            .entries
            .get(table_name)
            .map(|e| e.idle.len())
            .unwrap_or(0)
    }

    /// Evicts idle resources older than the pool's TTL. Returns whether
    /// anything was evicted.
    pub fn release_inactive(&self) -> bool {
        let now = Instant::now();
        let mut evicted: Vec<(String, usize)> = Vec::new();
        for mut entry in self.shared.entries.iter_mut() {
            if entry.lock_reason.is_some() {
                continue;
            }
            let before = entry.idle.len();
            let ttl = self.shared.idle_ttl;
            entry.idle.retain(|slot| now.duration_since(slot.released_at) < ttl);
            let dropped = before - entry.idle.len();
            if dropped > 0 {
                evicted.push((entry.key().clone(), dropped));
            }
        }
        self.gc_entries();
        let useful = !evicted.is_empty();
        for (table, dropped) in evicted {
            self.shared
                .counters
                .evictions
                .fetch_add(dropped as u64, Ordering::Relaxed);
            self.emit(PoolEvent::Evict, &table);
            tracing::debug!(
                pool = %self.shared.kind,
                table = %table,
                count = dropped,
                "evicted idle resources"
            );
        }
        useful
    }

    /// Evicts every idle resource regardless of age.
    pub fn release_all(&self) -> bool {
        let mut evicted: Vec<(String, usize)> = Vec::new();
        for mut entry in self.shared.entries.iter_mut() {
            if entry.idle.is_empty() {
                continue;
            }
            evicted.push((entry.key().clone(), entry.idle.len()));
            entry.idle.clear();
        }
        self.gc_entries();
        let useful = !evicted.is_empty();
        for (table, dropped) in evicted {
            self.shared
                .counters
                .evictions
                .fetch_add(dropped as u64, Ordering::Relaxed);
            self.emit(PoolEvent::Evict, &table);
        }
        useful
    }

    /// Marks the pool closed and evicts the idle set. Outstanding handles
    /// stay usable; their resources are dropped on return instead of
    /// cached.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.release_all();
    }

    pub fn stats(&self) -> PoolStats {
        let mut idle = 0;
        let mut busy = 0;
        for entry in self.shared.entries.iter() {
            idle += entry.idle.len();
            busy += entry.busy;
        }
        PoolStats {
            checkouts: self.shared.counters.checkouts.load(Ordering::Relaxed),
            creates: self.shared.counters.creates.load(Ordering::Relaxed),
            returns: self.shared.counters.returns.load(Ordering::Relaxed),
            evictions: self.shared.counters.evictions.load(Ordering::Relaxed),
            rejections: self.shared.counters.rejections.load(Ordering::Relaxed),
            idle,
            busy,
        }
    }

    fn cancel_reservation(&self, table_name: &str) {
        if let Some(mut entry) = self.shared.entries.get_mut(table_name) {
            entry.busy = entry.busy.saturating_sub(1);
            if self.shared.exclusive {
                entry.busy_reason = None;
            }
        }
        self.drop_entry_if_unused(table_name);
    }

    fn drop_entry_if_unused(&self, table_name: &str) {
        self.shared.entries.remove_if(table_name, |_, e| {
            e.lock_reason.is_none() && e.busy == 0 && e.idle.is_empty()
        });
    }

    fn gc_entries(&self) {
        self.shared
            .entries
            .retain(|_, e| e.lock_reason.is_some() || e.busy > 0 || !e.idle.is_empty());
    }

    fn emit(&self, event: PoolEvent, table_name: &str) {
        let listener = self.shared.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_event(self.shared.kind, event, table_name);
        }
    }
}

/// A checked-out resource. Returns itself to the pool's idle set on drop
/// unless the pool has been closed, the table is locked, or the handle
/// was discarded with [`PooledHandle::close_now`].
pub struct PooledHandle<R: Send + 'static> {
    resource: Option<R>,
    shared: Arc<PoolShared<R>>,
    table_name: String,
    keep: bool,
}

impl<R: Send + 'static> PooledHandle<R> {
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Drops the resource instead of caching it for reuse.
    pub fn close_now(mut self) {
        self.keep = false;
    }
}

impl<R: Send + 'static> fmt::Debug for PooledHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandle")
            .field("pool", &self.shared.kind)
            .field("table", &self.table_name)
            .finish_non_exhaustive()
    }
}

impl<R: Send + 'static> Deref for PooledHandle<R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.resource.as_ref().expect("resource present until drop")
    }
}

impl<R: Send + 'static> DerefMut for PooledHandle<R> {
    fn deref_mut(&mut self) -> &mut R {
        self.resource.as_mut().expect("resource present until drop")
    }
}

impl<R: Send + 'static> Drop for PooledHandle<R> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        let closed = self.shared.closed.load(Ordering::Acquire);
        let mut discard = Some(resource);
        if let Some(mut entry) = self.shared.entries.get_mut(&self.table_name) {
            entry.busy = entry.busy.saturating_sub(1);
            if self.shared.exclusive {
                entry.busy_reason = None;
            }
            if self.keep && !closed && entry.lock_reason.is_none() {
                if let Some(resource) = discard.take() {
                    entry.idle.push(IdleSlot {
                        resource,
                        released_at: Instant::now(),
                    });
                }
            }
        }
        // Resource drop happens outside the map guard.
        drop(discard);
        self.shared.entries.remove_if(&self.table_name, |_, e| {
            e.lock_reason.is_none() && e.busy == 0 && e.idle.is_empty()
        });
        self.shared.counters.returns.fetch_add(1, Ordering::Relaxed);
        let listener = self.shared.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_event(self.shared.kind, PoolEvent::Return, &self.table_name);
        }
    }
}
