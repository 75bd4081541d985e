//! Packet dispatch to listeners and pending replies
//!
//! Listener sets are copy-on-write: writers clone the current list, modify
//! the clone and swap it in, while the dispatch path iterates an `Arc`
//! snapshot without holding any lock. Registration from caller threads can
//! therefore never race with a notification in progress.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, trace};

use crate::error::{DccError, Result};
use crate::packet::{Packet, Transport};

/// Handle returned by every registration
pub type ListenerId = u64;

/// What the link reports to its listeners
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A packet was received and passed its integrity checks
    Packet(Arc<Packet>),
    /// The byte stream lost synchronisation; a partial frame was dropped
    LinkError,
}

/// Callback receiving link events
pub type Listener = Arc<dyn Fn(&LinkEvent) + Send + Sync>;

/// A registered one-shot reply waiting for its packet
pub trait PendingSlot: Send + Sync {
    /// Offer a received packet; `true` once the slot is settled and can be
    /// dropped from the registry
    fn offer(&self, packet: &Arc<Packet>) -> bool;

    /// Settle the slot with an error; `false` if it was already settled
    fn fail(&self, error: DccError) -> bool;
}

struct ListenerSet<T> {
    entries: RwLock<Arc<Vec<(ListenerId, T)>>>,
}

impl<T: Clone> ListenerSet<T> {
    fn new() -> Self {
        ListenerSet {
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn snapshot(&self) -> Arc<Vec<(ListenerId, T)>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn insert(&self, id: ListenerId, item: T) {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push((id, item));
        *guard = Arc::new(next);
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !guard.iter().any(|(i, _)| *i == id) {
            return false;
        }
        let next: Vec<_> = guard.iter().filter(|(i, _)| *i != id).cloned().collect();
        *guard = Arc::new(next);
        true
    }

    fn drain(&self) -> Arc<Vec<(ListenerId, T)>> {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(Vec::new()))
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[derive(Clone)]
struct GroupListener {
    transport: Transport,
    group: u8,
    listener: Listener,
}

/// Routes received packets of one link
///
/// Pending replies see a packet first, then general listeners, then the
/// listeners registered for the packet's (transport, group).
pub struct Dispatcher {
    next_id: AtomicU64,
    closed: AtomicBool,
    listeners: ListenerSet<Listener>,
    group_listeners: ListenerSet<GroupListener>,
    pending: ListenerSet<Arc<dyn PendingSlot>>,
}

impl Dispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Dispatcher {
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            listeners: ListenerSet::new(),
            group_listeners: ListenerSet::new(),
            pending: ListenerSet::new(),
        }
    }

    fn allocate_id(&self) -> ListenerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Receive every link event
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LinkEvent) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.listeners.insert(id, Arc::new(listener));
        id
    }

    /// Receive packets of one command group
    pub fn add_group_listener<F>(&self, transport: Transport, group: u8, listener: F) -> ListenerId
    where
        F: Fn(&LinkEvent) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.group_listeners.insert(
            id,
            GroupListener {
                transport,
                group,
                listener: Arc::new(listener),
            },
        );
        id
    }

    /// Remove a general or group listener; unknown ids are ignored
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id) || self.group_listeners.remove(id)
    }

    /// Number of general and group listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len() + self.group_listeners.len()
    }

    /// Register a pending reply
    ///
    /// Fails with [`DccError::ConnectionClosed`] once the dispatcher is closed.
    pub fn register_reply(&self, slot: Arc<dyn PendingSlot>) -> Result<ListenerId> {
        let id = self.allocate_id();
        self.pending.insert(id, slot);
        // close() may have drained the set just before this insert
        if self.is_closed() {
            self.pending.remove(id);
            return Err(DccError::ConnectionClosed);
        }
        Ok(id)
    }

    /// Drop a pending reply; calling it again is a no-op
    pub fn unregister_reply(&self, id: ListenerId) -> bool {
        self.pending.remove(id)
    }

    /// Number of replies still waiting
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Deliver a received packet
    pub fn dispatch(&self, packet: Packet) {
        let packet = Arc::new(packet);
        trace!("dispatch {}", packet);

        for (id, slot) in self.pending.snapshot().iter() {
            if slot.offer(&packet) {
                debug!("reply {} resolved by {}", id, packet);
                self.pending.remove(*id);
            }
        }

        let event = LinkEvent::Packet(packet.clone());
        for (_, listener) in self.listeners.snapshot().iter() {
            listener(&event);
        }
        for (_, entry) in self.group_listeners.snapshot().iter() {
            if entry.transport == packet.transport() && entry.group == packet.group() {
                (entry.listener)(&event);
            }
        }
    }

    /// Tell general listeners the stream lost synchronisation
    pub fn link_error(&self) {
        for (_, listener) in self.listeners.snapshot().iter() {
            listener(&LinkEvent::LinkError);
        }
    }

    /// Fail every pending reply with [`DccError::ConnectionClosed`] and refuse
    /// new ones
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = self.pending.drain();
        debug!("dispatcher closed, failing {} pending replies", pending.len());
        for (_, slot) in pending.iter() {
            slot.fail(DccError::ConnectionClosed);
        }
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
