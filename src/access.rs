use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tracing::{info, warn};

use crate::backend::epoch_seconds;

/// Active deny-list membership for an identifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenyEntry {
    /// Absolute expiry in epoch seconds; `None` for a permanent entry.
    pub expires_at: Option<f64>,
}

/// Allow-set and deny-set consulted ahead of every strategy evaluation.
///
/// Both sets are in-process. Deny entries may carry an expiry and clear
/// themselves once observed past it; allow entries are unconditional.
pub struct AccessControl {
    allow: RwLock<HashSet<String>>,
    deny: RwLock<HashMap<String, Option<f64>>>,
}

impl AccessControl {
    pub fn new() -> Self {
        Self {
            allow: RwLock::new(HashSet::new()),
            deny: RwLock::new(HashMap::new()),
        }
    }

    /// Add an identifier to the allow set (bypasses all limits).
    pub fn add_allow(&self, identifier: &str) {
        if identifier.is_empty() {
            warn!("Attempted to allow-list empty identifier");
            return;
        }
        self.allow.write().unwrap().insert(identifier.to_string());
        info!("Added to allow list: {}", identifier);
    }

    pub fn remove_allow(&self, identifier: &str) -> bool {
        let removed = self.allow.write().unwrap().remove(identifier);
        if removed {
            info!("Removed from allow list: {}", identifier);
        }
        removed
    }

    pub fn is_allowed(&self, identifier: &str) -> bool {
        self.allow.read().unwrap().contains(identifier)
    }

    /// Add an identifier to the deny set. A `ttl` of 0 denies
    /// permanently. The expiry is anchored to the wall clock; callers
    /// driving their own clock use [`deny_until`](Self::deny_until).
    pub fn add_deny(&self, identifier: &str, ttl: f64) {
        let expires_at = (ttl > 0.0).then(|| epoch_seconds() + ttl);
        self.deny_until(identifier, expires_at);
    }

    /// Deny an identifier until an absolute instant (`None` denies
    /// permanently). The instant lives on whatever clock the caller
    /// later passes to the expiry checks.
    pub fn deny_until(&self, identifier: &str, expires_at: Option<f64>) {
        if identifier.is_empty() {
            warn!("Attempted to deny-list empty identifier");
            return;
        }
        self.deny
            .write()
            .unwrap()
            .insert(identifier.to_string(), expires_at);
        match expires_at {
            Some(at) => warn!("Added to deny list until {:.0}: {}", at, identifier),
            None => warn!("Added to permanent deny list: {}", identifier),
        }
    }

    pub fn remove_deny(&self, identifier: &str) -> bool {
        let removed = self.deny.write().unwrap().remove(identifier).is_some();
        if removed {
            info!("Removed from deny list: {}", identifier);
        }
        removed
    }

    /// Active deny-list membership, if any.
    pub fn is_denied(&self, identifier: &str) -> Option<DenyEntry> {
        self.deny_state(identifier, epoch_seconds())
    }

    pub(crate) fn deny_state(&self, identifier: &str, now: f64) -> Option<DenyEntry> {
        {
            let deny = self.deny.read().unwrap();
            match deny.get(identifier) {
                None => return None,
                Some(None) => return Some(DenyEntry { expires_at: None }),
                Some(Some(expiry)) if *expiry > now => {
                    return Some(DenyEntry {
                        expires_at: Some(*expiry),
                    })
                }
                Some(Some(_)) => {}
            }
        }

        // Entry expired; clear it under the write lock, re-checking in
        // case of a concurrent re-deny.
        let mut deny = self.deny.write().unwrap();
        if matches!(deny.get(identifier), Some(Some(expiry)) if *expiry <= now) {
            deny.remove(identifier);
            info!("Deny entry expired: {}", identifier);
        }
        None
    }

    pub fn allow_count(&self) -> usize {
        self.allow.read().unwrap().len()
    }

    pub fn deny_count(&self) -> usize {
        self.deny.read().unwrap().len()
    }
}

impl Default for AccessControl {
    fn default() -> Self {
        Self::new()
    }
}
