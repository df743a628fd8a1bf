//! Cluster Membership View
//!
//! The active (voting) and passive (learner) member sets plus the local
//! server's identity. The view is mutated only by applying committed
//! configuration and membership entries, so every replica walks through the
//! same sequence of views at the same log positions.

use copycat_core::Address;
use tracing::debug;

/// One server's view of the cluster.
#[derive(Debug, Clone)]
pub struct Cluster {
    local: Address,
    local_id: u64,
    active: Vec<Address>,
    passive: Vec<Address>,
    /// Log index of the last applied configuration-affecting entry.
    config_index: u64,
}

impl Cluster {
    pub fn new(local: Address, active: Vec<Address>, passive: Vec<Address>) -> Self {
        let local_id = local.id();
        Self {
            local,
            local_id,
            active,
            passive,
            config_index: 0,
        }
    }

    pub fn local(&self) -> &Address {
        &self.local
    }

    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    /// Quorum size over the active members: ⌊N/2⌋ + 1.
    pub fn quorum(&self) -> usize {
        self.active.len() / 2 + 1
    }

    pub fn active_members(&self) -> &[Address] {
        &self.active
    }

    pub fn passive_members(&self) -> &[Address] {
        &self.passive
    }

    /// Active members excluding the local server.
    pub fn active_peers(&self) -> Vec<Address> {
        self.active
            .iter()
            .filter(|a| a.id() != self.local_id)
            .cloned()
            .collect()
    }

    /// Every member except the local server, passive included: the
    /// replication targets for a leader.
    pub fn replication_peers(&self) -> Vec<Address> {
        self.active
            .iter()
            .chain(self.passive.iter())
            .filter(|a| a.id() != self.local_id)
            .cloned()
            .collect()
    }

    pub fn is_active(&self, id: u64) -> bool {
        self.active.iter().any(|a| a.id() == id)
    }

    pub fn is_passive(&self, id: u64) -> bool {
        self.passive.iter().any(|a| a.id() == id)
    }

    pub fn is_local_active(&self) -> bool {
        self.is_active(self.local_id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.is_active(id) || self.is_passive(id)
    }

    /// Address of a member by id, if known.
    pub fn address_of(&self, id: u64) -> Option<&Address> {
        self.active
            .iter()
            .chain(self.passive.iter())
            .find(|a| a.id() == id)
    }

    /// Index of the configuration currently in force.
    pub fn config_index(&self) -> u64 {
        self.config_index
    }

    /// Replace the whole view (ConfigurationEntry application).
    pub fn set_view(&mut self, index: u64, active: Vec<Address>, passive: Vec<Address>) {
        debug!(index, active = active.len(), passive = passive.len(), "configuration applied");
        self.active = active;
        self.passive = passive;
        self.config_index = index;
    }

    /// A joining member enters the passive set.
    pub fn join(&mut self, index: u64, member: Address) {
        if !self.contains(member.id()) {
            self.passive.push(member);
        }
        self.config_index = index;
    }

    /// A leaving member is removed from both sets.
    pub fn leave(&mut self, index: u64, member: &Address) {
        let id = member.id();
        self.active.retain(|a| a.id() != id);
        self.passive.retain(|a| a.id() != id);
        self.config_index = index;
    }

    /// Promote a passive member to voting.
    pub fn promote(&mut self, index: u64, member: &Address) {
        let id = member.id();
        self.passive.retain(|a| a.id() != id);
        if !self.is_active(id) {
            self.active.push(member.clone());
        }
        self.config_index = index;
    }

    /// Demote a voting member to passive.
    pub fn demote(&mut self, index: u64, member: &Address) {
        let id = member.id();
        self.active.retain(|a| a.id() != id);
        if !self.is_passive(id) {
            self.passive.push(member.clone());
        }
        self.config_index = index;
    }
}
