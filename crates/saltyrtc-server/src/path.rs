//! Paths: the routing fabric.
//!
//! A path is the shared context between one initiator and its
//! responders, keyed by the initiator's long-term public key. Slot
//! `0x01` belongs to the initiator, `0x02..=0xff` to responders.
//!
//! Membership mutations (register, remove) go through [`PathMap`] and
//! run under its write lock, so that pruning an empty path can never
//! race a client registering on it; lookups only take the per-path slot
//! lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;
use tracing::debug;

use saltyrtc_core::{ProtocolError, KEY_LENGTH};

use crate::session::ClientSession;

const INITIATOR_SLOT: u8 = 0x01;
const FIRST_RESPONDER_SLOT: u8 = 0x02;

pub struct Path {
    initiator_key: [u8; KEY_LENGTH],
    number: u32,
    slots: Mutex<HashMap<u8, Arc<ClientSession>>>,
}

impl Path {
    fn new(initiator_key: [u8; KEY_LENGTH], number: u32) -> Self {
        Path {
            initiator_key,
            number,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(&self) -> &[u8; KEY_LENGTH] {
        &self.initiator_key
    }

    /// Path number, used for log correlation only.
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn initiator(&self) -> Option<Arc<ClientSession>> {
        self.slots().get(&INITIATOR_SLOT).cloned()
    }

    /// Look up a responder. Fails unless `id` lies in the responder
    /// range; an empty slot is `None`.
    pub fn responder(&self, id: u8) -> Result<Option<Arc<ClientSession>>, ProtocolError> {
        if id < FIRST_RESPONDER_SLOT {
            return Err(ProtocolError::Message(format!(
                "invalid responder identifier {id:#04x}"
            )));
        }
        Ok(self.slots().get(&id).cloned())
    }

    /// Occupied responder slot ids, ascending.
    pub fn responder_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self
            .slots()
            .keys()
            .copied()
            .filter(|&id| id >= FIRST_RESPONDER_SLOT)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// All connected responders.
    pub fn responders(&self) -> Vec<Arc<ClientSession>> {
        self.slots()
            .iter()
            .filter(|(&id, _)| id >= FIRST_RESPONDER_SLOT)
            .map(|(_, session)| session.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Put `initiator` into slot `0x01`, returning the displaced
    /// previous occupant, if any.
    fn set_initiator(&self, initiator: Arc<ClientSession>) -> Option<Arc<ClientSession>> {
        self.slots().insert(INITIATOR_SLOT, initiator)
    }

    /// Assign the lowest free responder slot.
    fn add_responder(&self, responder: Arc<ClientSession>) -> Result<u8, ProtocolError> {
        let mut slots = self.slots();
        for id in FIRST_RESPONDER_SLOT..=0xff {
            if !slots.contains_key(&id) {
                slots.insert(id, responder);
                return Ok(id);
            }
        }
        Err(ProtocolError::SlotsFull)
    }

    /// Clear whichever slot holds `session`. Returns whether a slot was
    /// cleared; removing an absent session is a no-op.
    fn remove(&self, session: &Arc<ClientSession>) -> bool {
        let mut slots = self.slots();
        let occupied = slots
            .iter()
            .find(|(_, candidate)| Arc::ptr_eq(candidate, session))
            .map(|(&id, _)| id);
        match occupied {
            Some(id) => {
                slots.remove(&id);
                true
            }
            None => false,
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<u8, Arc<ClientSession>>> {
        // Never held across an await point.
        self.slots.lock().expect("slot table poisoned")
    }
}

/// The process-wide table of paths.
pub struct PathMap {
    inner: RwLock<HashMap<[u8; KEY_LENGTH], Arc<Path>>>,
    next_number: AtomicU32,
}

impl PathMap {
    pub fn new() -> Self {
        PathMap {
            inner: RwLock::new(HashMap::new()),
            next_number: AtomicU32::new(1),
        }
    }

    /// Resolve the path for `initiator_key`, creating it if absent.
    pub async fn get_or_create(&self, initiator_key: [u8; KEY_LENGTH]) -> Arc<Path> {
        let mut paths = self.inner.write().await;
        paths
            .entry(initiator_key)
            .or_insert_with(|| {
                let number = self.next_number.fetch_add(1, Ordering::Relaxed);
                debug!(path = number, "created path");
                Arc::new(Path::new(initiator_key, number))
            })
            .clone()
    }

    /// Register an authenticated initiator, returning the displaced
    /// previous initiator, if any.
    pub async fn register_initiator(
        &self,
        path: &Arc<Path>,
        session: &Arc<ClientSession>,
    ) -> Option<Arc<ClientSession>> {
        let mut paths = self.inner.write().await;
        // The path may have been pruned while this client was still in
        // its handshake; registration resurrects it.
        paths.entry(*path.key()).or_insert_with(|| path.clone());
        path.set_initiator(session.clone())
    }

    /// Register an authenticated responder, returning its slot.
    pub async fn register_responder(
        &self,
        path: &Arc<Path>,
        session: &Arc<ClientSession>,
    ) -> Result<u8, ProtocolError> {
        let mut paths = self.inner.write().await;
        paths.entry(*path.key()).or_insert_with(|| path.clone());
        path.add_responder(session.clone())
    }

    /// Remove `session` from `path` and prune the path if it became
    /// empty. Returns whether the session actually occupied a slot.
    pub async fn remove(&self, path: &Arc<Path>, session: &Arc<ClientSession>) -> bool {
        let mut paths = self.inner.write().await;
        let removed = path.remove(session);
        if path.is_empty() {
            if let Some(current) = paths.get(path.key()) {
                if Arc::ptr_eq(current, path) {
                    paths.remove(path.key());
                    debug!(path = path.number(), "removed empty path");
                }
            }
        }
        removed
    }

    pub async fn contains(&self, initiator_key: &[u8; KEY_LENGTH]) -> bool {
        self.inner.read().await.contains_key(initiator_key)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

impl Default for PathMap {
    fn default() -> Self {
        Self::new()
    }
}
