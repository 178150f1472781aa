//! Thread-safe registry of guests known to this control-plane instance.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use hvplane_shared::errors::{HvError, HvResult};
use serde::Serialize;

use crate::vm::os::OsFamily;
use crate::vm::state::LifecycleState;

/// One guest virtual machine and its last confirmed lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Guest {
    pub name: String,
    pub os: OsFamily,
    pub state: LifecycleState,
}

impl Guest {
    pub fn new(name: impl Into<String>, os: OsFamily, state: LifecycleState) -> Self {
        Self {
            name: name.into(),
            os,
            state,
        }
    }
}

/// Tracks guests and their recorded state.
///
/// # Design
///
/// - **Shared ownership**: Cloneable via `Arc`, handed to the controller and the accelerator pool
/// - **Concurrent access**: RwLock allows multiple readers, single writer
/// - **Single writer per guest**: only lifecycle transitions update a guest's state,
///   after the host confirmed the change
#[derive(Clone, Default)]
pub struct VmRegistry {
    inner: Arc<RwLock<HashMap<String, Guest>>>,
}

impl std::fmt::Debug for VmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmRegistry").finish()
    }
}

impl VmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new guest.
    ///
    /// # Errors
    ///
    /// Returns error if a guest with this name is already registered.
    pub fn register(&self, guest: Guest) -> HvResult<()> {
        let mut guests = self
            .inner
            .write()
            .map_err(|e| HvError::Internal(format!("registry lock poisoned: {}", e)))?;

        if guests.contains_key(&guest.name) {
            return Err(HvError::Internal(format!(
                "guest {} already registered",
                guest.name
            )));
        }

        tracing::debug!(guest = %guest.name, os = %guest.os, state = %guest.state, "Registering guest");
        guests.insert(guest.name.clone(), guest);
        Ok(())
    }

    /// Record a confirmed state change.
    pub fn update_state(&self, name: &str, new_state: LifecycleState) -> HvResult<()> {
        let mut guests = self
            .inner
            .write()
            .map_err(|e| HvError::Internal(format!("registry lock poisoned: {}", e)))?;

        let guest = guests
            .get_mut(name)
            .ok_or_else(|| HvError::NotFound(format!("guest {}", name)))?;

        tracing::debug!(
            guest = %name,
            old_state = %guest.state,
            new_state = %new_state,
            "Updating guest state"
        );
        guest.state = new_state;
        Ok(())
    }

    /// Get a guest by name. Returns `Ok(None)` if it is not registered.
    pub fn get(&self, name: &str) -> HvResult<Option<Guest>> {
        let guests = self
            .inner
            .read()
            .map_err(|e| HvError::Internal(format!("registry lock poisoned: {}", e)))?;
        Ok(guests.get(name).cloned())
    }

    /// Recorded state; unknown guests are `Undefined`.
    pub fn state(&self, name: &str) -> HvResult<LifecycleState> {
        Ok(self
            .get(name)?
            .map(|g| g.state)
            .unwrap_or(LifecycleState::Undefined))
    }

    /// All guests, sorted by name.
    pub fn list(&self) -> HvResult<Vec<Guest>> {
        let guests = self
            .inner
            .read()
            .map_err(|e| HvError::Internal(format!("registry lock poisoned: {}", e)))?;

        let mut list: Vec<Guest> = guests.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    /// Remove a guest once it no longer exists on the host.
    ///
    /// # Errors
    ///
    /// Returns error if the guest is unknown or still recorded as `Running`.
    pub fn remove(&self, name: &str) -> HvResult<Guest> {
        let mut guests = self
            .inner
            .write()
            .map_err(|e| HvError::Internal(format!("registry lock poisoned: {}", e)))?;

        match guests.get(name) {
            Some(guest) if guest.state.is_running() => {
                return Err(HvError::invalid_state(name, guest.state, "remove"));
            }
            Some(_) => {}
            None => return Err(HvError::NotFound(format!("guest {}", name))),
        }

        tracing::debug!(guest = %name, "Removing guest from registry");
        guests
            .remove(name)
            .ok_or_else(|| HvError::NotFound(format!("guest {}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest(name: &str, state: LifecycleState) -> Guest {
        Guest::new(name, OsFamily::Linux, state)
    }

    #[test]
    fn test_register_and_get() {
        let registry = VmRegistry::new();
        registry
            .register(guest("g1", LifecycleState::Defined))
            .unwrap();

        let retrieved = registry.get("g1").unwrap().unwrap();
        assert_eq!(retrieved.state, LifecycleState::Defined);
        assert_eq!(retrieved.os, OsFamily::Linux);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = VmRegistry::new();
        registry
            .register(guest("g1", LifecycleState::Defined))
            .unwrap();
        let result = registry.register(guest("g1", LifecycleState::Running));

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("already registered")
        );
    }

    #[test]
    fn test_update_state() {
        let registry = VmRegistry::new();
        registry
            .register(guest("g1", LifecycleState::Defined))
            .unwrap();
        registry
            .update_state("g1", LifecycleState::Running)
            .unwrap();
        assert_eq!(registry.state("g1").unwrap(), LifecycleState::Running);
    }

    #[test]
    fn test_update_unknown_guest_fails() {
        let registry = VmRegistry::new();
        let err = registry
            .update_state("ghost", LifecycleState::Running)
            .unwrap_err();
        assert!(matches!(err, HvError::NotFound(_)));
    }

    #[test]
    fn test_unknown_guest_is_undefined() {
        let registry = VmRegistry::new();
        assert_eq!(registry.state("nope").unwrap(), LifecycleState::Undefined);
        assert!(registry.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_list_sorted_by_name() {
        let registry = VmRegistry::new();
        for name in ["c", "a", "b"] {
            registry
                .register(guest(name, LifecycleState::Defined))
                .unwrap();
        }
        let names: Vec<_> = registry
            .list()
            .unwrap()
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cannot_remove_running_guest() {
        let registry = VmRegistry::new();
        registry
            .register(guest("g1", LifecycleState::Running))
            .unwrap();
        let err = registry.remove("g1").unwrap_err();
        assert!(err.is_state_error());

        registry
            .update_state("g1", LifecycleState::Defined)
            .unwrap();
        registry.remove("g1").unwrap();
        assert!(registry.get("g1").unwrap().is_none());
    }
}
