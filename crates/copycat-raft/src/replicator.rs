//! Per-Peer Replication State
//!
//! The leader tracks, for every replication peer, the next index to send,
//! the highest index known replicated (`match_index`), whether an append is
//! in flight (`committing` — at most one outstanding request per peer), and
//! the last time the peer acknowledged an append (`commit_time`, backing the
//! leader's lease).
//!
//! Quorum math lives here: the commit candidate is the quorum-th largest
//! match index with the leader counted as implicitly matched at its own last
//! index, the global index is the minimum match across peers, and the lease
//! time is the quorum-th most recent acknowledgment.

use copycat_core::Address;

use crate::cluster::Cluster;

/// Replication state for one peer.
#[derive(Debug)]
pub struct PeerState {
    pub id: u64,
    pub address: Address,

    /// Next log index to send.
    pub next_index: u64,

    /// Highest index known replicated on the peer.
    pub match_index: u64,

    /// Whether an append request is outstanding.
    pub committing: bool,

    /// Last acknowledgment time (ms since epoch).
    pub commit_time: u64,
}

impl PeerState {
    fn new(address: Address, last_index: u64, now: u64) -> Self {
        Self {
            id: address.id(),
            address,
            next_index: last_index.max(1),
            match_index: 0,
            committing: false,
            commit_time: now,
        }
    }
}

/// The leader's set of replication peers.
#[derive(Debug, Default)]
pub struct Replicator {
    peers: Vec<PeerState>,
}

impl Replicator {
    pub fn new(cluster: &Cluster, last_index: u64, now: u64) -> Self {
        let mut replicator = Self { peers: Vec::new() };
        replicator.update(cluster, last_index, now);
        replicator
    }

    /// Reconcile the peer set with the cluster view: drop departed members,
    /// add new ones. Existing peer progress is preserved.
    pub fn update(&mut self, cluster: &Cluster, last_index: u64, now: u64) {
        let targets = cluster.replication_peers();
        self.peers.retain(|p| targets.iter().any(|a| a.id() == p.id));
        for address in targets {
            if !self.peers.iter().any(|p| p.id == address.id()) {
                self.peers.push(PeerState::new(address, last_index, now));
            }
        }
    }

    pub fn peers(&self) -> &[PeerState] {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut [PeerState] {
        &mut self.peers
    }

    pub fn peer_mut(&mut self, id: u64) -> Option<&mut PeerState> {
        self.peers.iter_mut().find(|p| p.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// The highest index replicated on a quorum of **active** members, the
    /// leader included: the quorum-th largest of the active peers' match
    /// indexes plus the leader's own last index.
    pub fn quorum_match(&self, cluster: &Cluster, last_index: u64) -> u64 {
        let mut matches: Vec<u64> = self
            .peers
            .iter()
            .filter(|p| cluster.is_active(p.id))
            .map(|p| p.match_index)
            .collect();
        matches.push(last_index);
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = cluster.quorum();
        if quorum == 0 || quorum > matches.len() {
            return 0;
        }
        matches[quorum - 1]
    }

    /// The minimum match index across all peers: everything at or below it
    /// is replicated everywhere and safe for major compaction. With no
    /// peers, everything the leader has qualifies.
    pub fn global_index(&self, last_index: u64) -> u64 {
        self.peers
            .iter()
            .map(|p| p.match_index)
            .min()
            .unwrap_or(last_index)
    }

    /// The last time a quorum of active members (leader included, counted at
    /// `now`) had acknowledged the leader. Backs the linearizable lease.
    pub fn quorum_commit_time(&self, cluster: &Cluster, now: u64) -> u64 {
        let mut times: Vec<u64> = self
            .peers
            .iter()
            .filter(|p| cluster.is_active(p.id))
            .map(|p| p.commit_time)
            .collect();
        times.push(now);
        times.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = cluster.quorum();
        if quorum == 0 || quorum > times.len() {
            return 0;
        }
        times[quorum - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        Address::new("localhost", port)
    }

    fn cluster(active: u16) -> Cluster {
        Cluster::new(addr(1), (1..=active).map(addr).collect(), vec![])
    }

    fn set_match(replicator: &mut Replicator, address: &Address, match_index: u64) {
        replicator.peer_mut(address.id()).unwrap().match_index = match_index;
    }

    #[test]
    fn test_single_node_commits_its_own_tail() {
        let cluster = cluster(1);
        let replicator = Replicator::new(&cluster, 5, 0);
        assert!(replicator.is_empty());
        assert_eq!(replicator.quorum_match(&cluster, 5), 5);
        assert_eq!(replicator.global_index(5), 5);
    }

    #[test]
    fn test_three_node_quorum_match() {
        let cluster = cluster(3);
        let mut replicator = Replicator::new(&cluster, 10, 0);
        assert_eq!(replicator.peers().len(), 2);

        // No acknowledgments yet: only the leader has the tail.
        assert_eq!(replicator.quorum_match(&cluster, 10), 0);

        set_match(&mut replicator, &addr(2), 7);
        assert_eq!(replicator.quorum_match(&cluster, 10), 7);

        set_match(&mut replicator, &addr(3), 9);
        assert_eq!(replicator.quorum_match(&cluster, 10), 9);
    }

    #[test]
    fn test_five_node_quorum_match() {
        let cluster = cluster(5);
        let mut replicator = Replicator::new(&cluster, 20, 0);
        set_match(&mut replicator, &addr(2), 20);
        set_match(&mut replicator, &addr(3), 15);
        set_match(&mut replicator, &addr(4), 10);
        set_match(&mut replicator, &addr(5), 5);
        // Sorted: 20(leader), 20, 15, 10, 5 → quorum 3 → third largest = 15.
        assert_eq!(replicator.quorum_match(&cluster, 20), 15);
    }

    #[test]
    fn test_global_index_is_minimum() {
        let cluster = cluster(3);
        let mut replicator = Replicator::new(&cluster, 10, 0);
        set_match(&mut replicator, &addr(2), 7);
        set_match(&mut replicator, &addr(3), 3);
        assert_eq!(replicator.global_index(10), 3);
    }

    #[test]
    fn test_passive_peers_replicate_but_do_not_count() {
        let cluster = Cluster::new(addr(1), vec![addr(1), addr(2), addr(3)], vec![addr(4)]);
        let mut replicator = Replicator::new(&cluster, 10, 0);
        assert_eq!(replicator.peers().len(), 3, "passive peers are replicated");

        set_match(&mut replicator, &addr(4), 10);
        assert_eq!(
            replicator.quorum_match(&cluster, 10),
            0,
            "passive acknowledgment does not advance commitment"
        );
        set_match(&mut replicator, &addr(2), 10);
        assert_eq!(replicator.quorum_match(&cluster, 10), 10);
        // The global bound still honors the slowest replica of any kind.
        assert_eq!(replicator.global_index(10), 0);
    }

    #[test]
    fn test_update_tracks_membership() {
        let mut view = cluster(3);
        let mut replicator = Replicator::new(&view, 10, 0);
        set_match(&mut replicator, &addr(2), 9);

        view.join(11, addr(4));
        view.promote(12, &addr(4));
        replicator.update(&view, 10, 0);
        assert_eq!(replicator.peers().len(), 3);
        assert_eq!(
            replicator.peer_mut(addr(2).id()).unwrap().match_index,
            9,
            "existing progress preserved"
        );

        view.leave(13, &addr(2));
        replicator.update(&view, 10, 0);
        assert!(replicator.peer_mut(addr(2).id()).is_none());
    }

    #[test]
    fn test_quorum_commit_time() {
        let cluster = cluster(3);
        let mut replicator = Replicator::new(&cluster, 0, 100);
        replicator.peer_mut(addr(2).id()).unwrap().commit_time = 400;
        replicator.peer_mut(addr(3).id()).unwrap().commit_time = 200;
        // Times: now=500(leader), 400, 200 → quorum 2 → second = 400.
        assert_eq!(replicator.quorum_commit_time(&cluster, 500), 400);
    }
}
