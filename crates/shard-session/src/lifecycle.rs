use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use shard_backend::{BackendFamily, DeterministicFamily, FixedDistributionFamily};
use tracing::{debug, info, warn};

use crate::config::ModelReference;
use crate::error::{Result, SessionError};
use crate::session::Session;

/// Opaque, copyable reference to a session owned by a `Runtime`.
///
/// The generation changes every time a slot is reused, so a stale id from a
/// destroyed session never reaches the slot's new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    index: u32,
    generation: u32,
}

impl SessionId {
    /// Pack into a non-zero integer suitable for crossing a C boundary.
    pub fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Inverse of `to_raw`. Returns `None` for 0, which is never issued.
    pub fn from_raw(raw: u64) -> Option<SessionId> {
        let generation = (raw >> 32) as u32;
        if generation == 0 {
            return None;
        }
        Some(SessionId {
            index: raw as u32,
            generation,
        })
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

type SharedSession = Arc<Mutex<Option<Session>>>;

struct FamilyEntry {
    family: Arc<dyn BackendFamily>,
    live: usize,
}

struct Occupant {
    session: SharedSession,
    family: String,
}

struct Slot {
    generation: u32,
    occupant: Option<Occupant>,
}

#[derive(Default)]
struct Slots {
    entries: Vec<Slot>,
    free: Vec<u32>,
}

/// Owns every live session and the process-wide state of each backend family.
///
/// A family is bootstrapped when its first session is created and torn down
/// when its last session is destroyed. Creation and destruction may be called
/// from any thread; operations on one session are serialized by that
/// session's own lock, so distinct sessions never contend.
pub struct Runtime {
    families: Mutex<HashMap<String, FamilyEntry>>,
    slots: Mutex<Slots>,
}

impl Runtime {
    /// A runtime with no families registered.
    pub fn new() -> Self {
        Self {
            families: Mutex::new(HashMap::new()),
            slots: Mutex::new(Slots::default()),
        }
    }

    /// A runtime with the `deterministic` and `fixed` stub families.
    pub fn with_default_families() -> Self {
        let runtime = Self::new();
        {
            let mut families = lock(&runtime.families);
            for family in [
                Arc::new(DeterministicFamily) as Arc<dyn BackendFamily>,
                Arc::new(FixedDistributionFamily),
            ] {
                families.insert(family.name().to_string(), FamilyEntry { family, live: 0 });
            }
        }
        runtime
    }

    /// Make a family selectable by its scheme name.
    ///
    /// Replacing a family that still has live sessions is refused.
    pub fn register_family(&self, family: impl BackendFamily + 'static) -> Result<()> {
        let name = family.name().to_string();
        let mut families = lock(&self.families);
        if let Some(existing) = families.get(&name) {
            if existing.live > 0 {
                return Err(SessionError::InvalidArgument(format!(
                    "family {} has {} live sessions",
                    name, existing.live
                )));
            }
        }
        debug!(family = %name, "registered backend family");
        families.insert(
            name,
            FamilyEntry {
                family: Arc::new(family),
                live: 0,
            },
        );
        Ok(())
    }

    /// Create a session from a model reference.
    ///
    /// Bootstraps the selected family first if this is its only session.
    /// On failure no session exists and the family's refcount is unchanged.
    pub fn create(&self, reference: &str) -> Result<SessionId> {
        let reference = ModelReference::parse(reference)?;
        let family = self.acquire_family(&reference.scheme)?;
        // Given back on any early exit, a panic in `open` included.
        let lease = FamilyLease {
            runtime: self,
            scheme: &reference.scheme,
        };

        let backend = family.open(&reference.config).map_err(|e| {
            warn!(scheme = %reference.scheme, error = %e, "failed to open backend");
            SessionError::Initialization(e.to_string())
        })?;

        let id = self.insert(Occupant {
            session: Arc::new(Mutex::new(Some(Session::new(backend)))),
            family: reference.scheme.clone(),
        })?;
        std::mem::forget(lease);
        info!(session = %id, scheme = %reference.scheme, model = %reference.config.model, "created session");
        Ok(id)
    }

    /// Destroy a session. Returns `false` if `id` is unknown or stale, which
    /// makes a second destroy of the same id a no-op.
    pub fn destroy(&self, id: SessionId) -> bool {
        let occupant = {
            let mut slots = lock(&self.slots);
            let Some(slot) = slots.entries.get_mut(id.index as usize) else {
                return false;
            };
            if slot.generation != id.generation {
                return false;
            }
            let Some(occupant) = slot.occupant.take() else {
                return false;
            };
            slot.generation = next_generation(slot.generation);
            slots.free.push(id.index);
            occupant
        };

        // Waits for an in-flight operation, then drops the backend before
        // the family can be torn down.
        let session = lock(&occupant.session).take();
        drop(session);
        self.release_family(&occupant.family);
        info!(session = %id, "destroyed session");
        true
    }

    /// Run `f` with exclusive access to the session behind `id`.
    pub fn with_session<R>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut Session) -> Result<R>,
    ) -> Result<R> {
        let shared = self.lookup(id)?;
        let mut guard = shared.lock().map_err(|_| SessionError::Poisoned)?;
        match guard.as_mut() {
            Some(session) => f(session),
            None => Err(unknown_session(id)),
        }
    }

    /// Number of sessions currently alive.
    pub fn live_sessions(&self) -> usize {
        lock(&self.slots)
            .entries
            .iter()
            .filter(|slot| slot.occupant.is_some())
            .count()
    }

    /// Live sessions of the named family; 0 for unknown families.
    pub fn family_refcount(&self, name: &str) -> usize {
        lock(&self.families).get(name).map_or(0, |e| e.live)
    }

    fn lookup(&self, id: SessionId) -> Result<SharedSession> {
        let slots = lock(&self.slots);
        slots
            .entries
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.occupant.as_ref())
            .map(|occupant| Arc::clone(&occupant.session))
            .ok_or_else(|| unknown_session(id))
    }

    fn insert(&self, occupant: Occupant) -> Result<SessionId> {
        let mut slots = lock(&self.slots);
        if let Some(index) = slots.free.pop() {
            let slot = &mut slots.entries[index as usize];
            slot.occupant = Some(occupant);
            return Ok(SessionId {
                index,
                generation: slot.generation,
            });
        }
        let index = u32::try_from(slots.entries.len())
            .map_err(|_| SessionError::Internal("session table is full".to_string()))?;
        slots.entries.push(Slot {
            generation: 1,
            occupant: Some(occupant),
        });
        Ok(SessionId {
            index,
            generation: 1,
        })
    }

    /// Bump the family's refcount, bootstrapping it on the 0 -> 1 edge.
    fn acquire_family(&self, scheme: &str) -> Result<Arc<dyn BackendFamily>> {
        let mut families = lock(&self.families);
        let entry = families.get_mut(scheme).ok_or_else(|| {
            SessionError::Initialization(format!("no backend family registered for {}", scheme))
        })?;
        if entry.live == 0 {
            entry
                .family
                .bootstrap()
                .map_err(|e| SessionError::Initialization(e.to_string()))?;
            debug!(family = scheme, "bootstrapped backend family");
        }
        entry.live += 1;
        Ok(Arc::clone(&entry.family))
    }

    /// Drop the family's refcount, tearing it down on the 1 -> 0 edge.
    fn release_family(&self, scheme: &str) {
        let mut families = lock(&self.families);
        let Some(entry) = families.get_mut(scheme) else {
            return;
        };
        entry.live = entry.live.saturating_sub(1);
        if entry.live == 0 {
            entry.family.teardown();
            debug!(family = scheme, "tore down backend family");
        }
    }
}

/// A family refcount taken by `create` that is given back unless forgotten.
struct FamilyLease<'a> {
    runtime: &'a Runtime,
    scheme: &'a str,
}

impl Drop for FamilyLease<'_> {
    fn drop(&mut self) {
        self.runtime.release_family(self.scheme);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::with_default_families()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let slots = std::mem::take(&mut *lock(&self.slots));
        for occupant in slots.entries.into_iter().filter_map(|s| s.occupant) {
            drop(lock(&occupant.session).take());
        }
        for (name, entry) in lock(&self.families).iter_mut() {
            if entry.live > 0 {
                debug!(family = %name, live = entry.live, "tearing down family on runtime drop");
                entry.live = 0;
                entry.family.teardown();
            }
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("live_sessions", &self.live_sessions())
            .finish()
    }
}

fn next_generation(generation: u32) -> u32 {
    match generation.wrapping_add(1) {
        0 => 1,
        g => g,
    }
}

fn unknown_session(id: SessionId) -> SessionError {
    SessionError::InvalidArgument(format!("unknown session {}", id))
}

/// Lock a runtime table. The tables are only mutated in short sections that
/// cannot panic halfway, so a poisoned lock still guards consistent data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
