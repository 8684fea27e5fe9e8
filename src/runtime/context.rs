//! Shared session state
//!
//! Units communicate through a [`SessionContext`]: a set of committed
//! variables and a capability registry. A running unit never writes to it
//! directly. It gets a [`UnitScope`] that reads the committed state and
//! stages its own writes; the engine merges the staged writes of succeeded
//! units at the end of each wave.
//!
//! Visibility rule: a write staged during wave N is visible to every unit
//! of wave N+1 and later, and to no other unit of wave N.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::domain::UnitId;

#[derive(Debug, Default)]
struct Committed {
    vars: BTreeMap<String, String>,

    /// Capability name -> publishing unit
    capabilities: BTreeMap<String, UnitId>,
}

/// Writes a unit made while running, not yet visible to anyone else
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedWrites {
    pub vars: Vec<(String, String)>,
    pub capabilities: Vec<String>,
}

impl StagedWrites {
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty() && self.capabilities.is_empty()
    }
}

/// Committed state of one session
#[derive(Debug, Default)]
pub struct SessionContext {
    state: RwLock<Committed>,
}

impl SessionContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn read(&self) -> RwLockReadGuard<'_, Committed> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Committed> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads a committed variable
    pub fn var(&self, key: &str) -> Option<String> {
        self.read().vars.get(key).cloned()
    }

    /// Returns a copy of every committed variable
    pub fn vars(&self) -> BTreeMap<String, String> {
        self.read().vars.clone()
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.read().capabilities.contains_key(name)
    }

    /// Returns the unit that published a capability
    pub fn provider_of(&self, name: &str) -> Option<UnitId> {
        self.read().capabilities.get(name).cloned()
    }

    /// Returns a copy of the capability registry
    pub fn capabilities(&self) -> BTreeMap<String, UnitId> {
        self.read().capabilities.clone()
    }

    /// Opens a staging scope for one unit execution
    pub fn scope(self: &Arc<Self>, unit_id: UnitId) -> UnitScope {
        UnitScope {
            unit_id,
            committed: Arc::clone(self),
            staged: Arc::new(Mutex::new(StagedWrites::default())),
        }
    }

    /// Merges a succeeded unit's writes
    ///
    /// Variables overwrite earlier values. A capability keeps its first
    /// publisher; a second unit publishing the same name is ignored.
    pub fn commit(&self, unit_id: &UnitId, staged: StagedWrites) {
        if staged.is_empty() {
            return;
        }

        let mut state = self.write();
        for (key, value) in staged.vars {
            state.vars.insert(key, value);
        }
        for name in staged.capabilities {
            match state.capabilities.get(&name) {
                Some(existing) if existing != unit_id => {
                    tracing::warn!(capability = %name, unit = %unit_id, provider = %existing, "capability already published, keeping first provider");
                }
                Some(_) => {}
                None => {
                    state.capabilities.insert(name, unit_id.clone());
                }
            }
        }
    }
}

/// Handle through which a running unit reads and writes session state
///
/// Cloning the scope shares the staging buffer.
#[derive(Debug, Clone)]
pub struct UnitScope {
    unit_id: UnitId,
    committed: Arc<SessionContext>,
    staged: Arc<Mutex<StagedWrites>>,
}

impl UnitScope {
    fn staged(&self) -> MutexGuard<'_, StagedWrites> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn unit_id(&self) -> &UnitId {
        &self.unit_id
    }

    /// Stages a variable
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.staged().vars.push((key.into(), value.into()));
    }

    /// Stages a capability to publish on success
    pub fn provide(&self, name: impl Into<String>) {
        let name = name.into();
        let mut staged = self.staged();
        if !staged.capabilities.contains(&name) {
            staged.capabilities.push(name);
        }
    }

    /// Reads a variable, seeing this unit's own staged writes first
    pub fn var(&self, key: &str) -> Option<String> {
        let own = self
            .staged()
            .vars
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone());
        own.or_else(|| self.committed.var(key))
    }

    /// Committed variables overlaid with this unit's staged writes
    pub fn visible_vars(&self) -> BTreeMap<String, String> {
        let mut vars = self.committed.vars();
        for (k, v) in &self.staged().vars {
            vars.insert(k.clone(), v.clone());
        }
        vars
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.committed.has_capability(name)
    }

    pub fn provider_of(&self, name: &str) -> Option<UnitId> {
        self.committed.provider_of(name)
    }

    /// Takes the staged writes, leaving the buffer empty
    pub fn take_staged(&self) -> StagedWrites {
        std::mem::take(&mut *self.staged())
    }
}
