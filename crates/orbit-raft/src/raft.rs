//! Raft Consensus Algorithm Implementation
//!
//! All mutable consensus state of a node sits behind one mutex which is
//! never held across an await point. Network calls are made from spawned
//! tasks that snapshot what they need under the lock, release it, and take
//! it again to process the reply.
//!
//! Membership is part of the log: an `AddVoter` entry changes the voter set
//! as soon as it is appended, and truncating it away reverts the change.

use crate::error::{RaftError, Result};
use crate::log::{EntryPayload, NodeId, RaftLog, Snapshot};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftRequest, RaftResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::node::{RaftRpcHandler, RaftTransport};
use crate::state_machine::StateMachine;
use crate::storage::{HardState, RaftStorage};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Configuration for a Raft node
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's ID
    pub node_id: NodeId,
    /// Minimum election timeout
    pub election_timeout_min: Duration,
    /// Maximum election timeout
    pub election_timeout_max: Duration,
    /// Heartbeat interval (should be much less than election timeout)
    pub heartbeat_interval: Duration,
    /// How often timers are checked
    pub tick_interval: Duration,
    /// How long a proposer waits for its entry to be applied
    pub apply_timeout: Duration,
    /// Maximum entries per AppendEntries request
    pub max_append_entries: usize,
    /// Applied entries kept in the log before it is compacted; 0 disables
    pub snapshot_threshold: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: "node1".to_string(),
            election_timeout_min: Duration::from_millis(1000),
            election_timeout_max: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_millis(300),
            tick_interval: Duration::from_millis(50),
            apply_timeout: Duration::from_secs(10),
            max_append_entries: 256,
            snapshot_threshold: 4096,
        }
    }
}

/// Node state in the Raft cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
}

/// Point-in-time view of a node, for status endpoints and metrics.
#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub state: NodeState,
    pub current_term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub snapshot_index: u64,
    pub members: BTreeMap<NodeId, String>,
}

/// Result delivered to a proposer: the state machine response for command
/// entries, nothing for membership entries.
type Applied<R> = Result<Option<R>>;

struct Waiter<R> {
    term: u64,
    tx: oneshot::Sender<Applied<R>>,
}

struct RaftState<R> {
    current_term: u64,
    voted_for: Option<NodeId>,
    role: NodeState,
    leader_id: Option<NodeId>,
    commit_index: u64,
    last_applied: u64,
    log: RaftLog,
    members: BTreeMap<NodeId, String>,

    // Leader state
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    last_broadcast: Option<Instant>,

    // Candidate state
    votes: HashSet<NodeId>,

    last_heartbeat: Instant,
    election_timeout: Duration,
    waiters: BTreeMap<u64, Waiter<R>>,
    storage: Option<RaftStorage>,
}

impl<R> RaftState<R> {
    fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    fn save_hard_state(&mut self) {
        let hard_state = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        };
        if let Some(storage) = self.storage.as_mut() {
            if let Err(e) = storage.save_hard_state(&hard_state) {
                error!("Failed to persist raft hard state: {}", e);
            }
        }
    }

    /// Persist log entries from `from` to the tail.
    fn save_entries(&mut self, from: u64) {
        if let Some(storage) = self.storage.as_mut() {
            let entries = self.log.entries_from(from, usize::MAX);
            if let Err(e) = storage.append(&entries) {
                error!("Failed to persist raft log entries: {}", e);
            }
        }
    }

    fn rewrite_log(&mut self) {
        if let Some(storage) = self.storage.as_mut() {
            if let Err(e) = storage.rewrite_log(self.log.iter()) {
                error!("Failed to rewrite raft log: {}", e);
            }
        }
    }

    fn save_snapshot(&mut self) {
        if let (Some(storage), Some(snapshot)) = (self.storage.as_mut(), self.log.snapshot()) {
            if let Err(e) = storage.save_snapshot(snapshot) {
                error!("Failed to persist raft snapshot: {}", e);
                return;
            }
            if let Err(e) = storage.rewrite_log(self.log.iter()) {
                error!("Failed to rewrite raft log: {}", e);
            }
        }
    }

    /// Become a follower, adopting `term` if it is newer.
    fn step_down(&mut self, term: u64, leader_id: Option<NodeId>, election_timeout: Duration) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.save_hard_state();
        }
        if self.role != NodeState::Follower {
            info!("Stepping down to follower in term {}", self.current_term);
        }
        self.role = NodeState::Follower;
        self.leader_id = leader_id;
        self.votes.clear();
        self.last_heartbeat = Instant::now();
        self.election_timeout = election_timeout;
    }

    /// Fail proposers whose entries at `index` or later were discarded.
    fn fail_waiters_from(&mut self, index: u64) {
        let failed = self.waiters.split_off(&index);
        for (_, waiter) in failed {
            let _ = waiter.tx.send(Err(RaftError::NotLeader {
                leader_id: self.leader_id.clone(),
            }));
        }
    }

    fn membership_change_pending(&self) -> bool {
        self.log
            .iter()
            .any(|e| {
                e.index > self.commit_index && matches!(e.payload, EntryPayload::AddVoter { .. })
            })
    }
}

/// What a replication request carried, needed to interpret the reply.
enum Sent {
    Entries { prev_log_index: u64, count: u64 },
    Snapshot { last_included_index: u64 },
}

/// Main Raft consensus implementation
pub struct Raft<SM: StateMachine> {
    config: RaftConfig,
    state: Mutex<RaftState<SM::Response>>,
    state_machine: Arc<SM>,
    transport: Arc<dyn RaftTransport>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl<SM: StateMachine> Raft<SM> {
    /// Create a node, recovering term, vote, snapshot and log from `storage`
    /// when given. The node is inert until [`Raft::start`].
    pub fn new(
        config: RaftConfig,
        state_machine: Arc<SM>,
        transport: Arc<dyn RaftTransport>,
        storage: Option<RaftStorage>,
    ) -> Result<Arc<Self>> {
        let recovered = match &storage {
            Some(storage) => storage.recover()?,
            None => Default::default(),
        };

        if let Some(snapshot) = &recovered.snapshot {
            state_machine
                .restore(&snapshot.data)
                .map_err(RaftError::StateMachine)?;
        }

        let log = RaftLog::restore(recovered.snapshot, recovered.entries);
        let applied = log.snapshot_index();
        let members = log.members();

        if log.last_index() > 0 {
            info!(
                "Recovered raft log: term {}, snapshot at {}, last index {}",
                recovered.hard_state.current_term,
                applied,
                log.last_index()
            );
        }

        let election_timeout = random_election_timeout(&config);
        let state = RaftState {
            current_term: recovered.hard_state.current_term,
            voted_for: recovered.hard_state.voted_for,
            role: NodeState::Follower,
            leader_id: None,
            commit_index: applied,
            last_applied: applied,
            log,
            members,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_broadcast: None,
            votes: HashSet::new(),
            last_heartbeat: Instant::now(),
            election_timeout,
            waiters: BTreeMap::new(),
            storage,
        };

        Ok(Arc::new(Self {
            config,
            state: Mutex::new(state),
            state_machine,
            transport,
            ticker: Mutex::new(None),
        }))
    }

    /// Start the timer loop driving elections and heartbeats
    pub fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.tick_interval;
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(raft) => raft.tick(),
                    None => break,
                }
            }
        }));

        info!("Raft node {} started", self.config.node_id);
    }

    /// Stop the timer loop and fail every pending proposal
    pub fn shutdown(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
        let mut st = self.state.lock();
        st.role = NodeState::Follower;
        st.leader_id = None;
        for (_, waiter) in std::mem::take(&mut st.waiters) {
            let _ = waiter.tx.send(Err(RaftError::Shutdown));
        }
        info!("Raft node {} stopped", self.config.node_id);
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn state_machine(&self) -> &Arc<SM> {
        &self.state_machine
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().role == NodeState::Leader
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.state.lock().leader_id.clone()
    }

    pub fn current_term(&self) -> u64 {
        self.state.lock().current_term
    }

    /// Voters as of the tail of this node's log
    pub fn members(&self) -> BTreeMap<NodeId, String> {
        self.state.lock().members.clone()
    }

    pub fn status(&self) -> RaftStatus {
        let st = self.state.lock();
        RaftStatus {
            node_id: self.config.node_id.clone(),
            state: st.role,
            current_term: st.current_term,
            leader_id: st.leader_id.clone(),
            commit_index: st.commit_index,
            last_applied: st.last_applied,
            last_log_index: st.log.last_index(),
            snapshot_index: st.log.snapshot_index(),
            members: st.members.clone(),
        }
    }

    /// Seed a brand-new cluster with this node as its only voter and make
    /// it leader.
    pub fn bootstrap(&self, address: impl Into<String>) -> Result<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;

        if st.log.last_index() > 0 || !st.members.is_empty() {
            return Err(RaftError::AlreadyBootstrapped);
        }

        st.current_term += 1;
        st.voted_for = Some(self.config.node_id.clone());
        st.save_hard_state();

        let index = st.log.push(
            st.current_term,
            EntryPayload::AddVoter {
                node_id: self.config.node_id.clone(),
                address: address.into(),
            },
        );
        st.save_entries(index);
        st.members = st.log.members();

        info!("Bootstrapped cluster with {} as sole voter", self.config.node_id);
        self.become_leader(st);
        Ok(())
    }

    /// Propose a command and wait until it has been committed and applied
    /// on this node.
    pub async fn submit(self: &Arc<Self>, command: Vec<u8>) -> Result<SM::Response> {
        let (index, rx) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;

            if st.role != NodeState::Leader {
                return Err(RaftError::NotLeader {
                    leader_id: st.leader_id.clone(),
                });
            }

            let index = st.log.push(st.current_term, EntryPayload::Command(command));
            st.save_entries(index);
            let (tx, rx) = oneshot::channel();
            st.waiters.insert(
                index,
                Waiter {
                    term: st.current_term,
                    tx,
                },
            );
            debug!("Proposed entry {} in term {}", index, st.current_term);

            self.advance_commit(st);
            self.apply_committed(st);
            (index, rx)
        };

        self.broadcast();

        match self.wait_applied(index, rx).await? {
            Some(response) => Ok(response),
            None => Err(RaftError::StateMachine(format!(
                "entry {} produced no response",
                index
            ))),
        }
    }

    /// Add a voter to the cluster once it answers a ping. Returns after the
    /// membership entry is committed.
    pub async fn add_voter(self: &Arc<Self>, node_id: NodeId, address: String) -> Result<()> {
        self.check_can_add(&node_id)?;

        match self.transport.send(&address, RaftRequest::Ping).await {
            Ok(RaftResponse::Pong { .. }) => {}
            Ok(other) => {
                return Err(RaftError::Unreachable {
                    address,
                    reason: format!("unexpected reply {:?}", other),
                })
            }
            Err(e) => {
                return Err(RaftError::Unreachable {
                    address,
                    reason: e.to_string(),
                })
            }
        }

        let (index, rx) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            self.check_can_add_locked(st, &node_id)?;

            let index = st.log.push(
                st.current_term,
                EntryPayload::AddVoter {
                    node_id: node_id.clone(),
                    address: address.clone(),
                },
            );
            st.save_entries(index);
            st.members = st.log.members();
            st.next_index.insert(node_id.clone(), 1);
            st.match_index.insert(node_id.clone(), 0);

            let (tx, rx) = oneshot::channel();
            st.waiters.insert(
                index,
                Waiter {
                    term: st.current_term,
                    tx,
                },
            );
            (index, rx)
        };

        info!("Adding voter {} at {}", node_id, address);
        self.broadcast();
        self.wait_applied(index, rx).await.map(|_| ())
    }

    /// Compact the log up to the last applied entry. Returns the index the
    /// snapshot covers.
    pub fn snapshot(&self) -> Result<u64> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        self.compact(st)?;
        Ok(st.log.snapshot_index())
    }

    fn check_can_add(&self, node_id: &str) -> Result<()> {
        let st = self.state.lock();
        self.check_can_add_locked(&st, node_id)
    }

    fn check_can_add_locked(&self, st: &RaftState<SM::Response>, node_id: &str) -> Result<()> {
        if st.role != NodeState::Leader {
            return Err(RaftError::NotLeader {
                leader_id: st.leader_id.clone(),
            });
        }
        if st.members.contains_key(node_id) {
            return Err(RaftError::AlreadyMember(node_id.to_string()));
        }
        if st.membership_change_pending() {
            return Err(RaftError::ConfigChangeInProgress);
        }
        Ok(())
    }

    async fn wait_applied(
        &self,
        index: u64,
        rx: oneshot::Receiver<Applied<SM::Response>>,
    ) -> Applied<SM::Response> {
        match tokio::time::timeout(self.config.apply_timeout, rx).await {
            Ok(Ok(applied)) => applied,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => {
                self.state.lock().waiters.remove(&index);
                warn!("Entry {} was not applied within {:?}", index, self.config.apply_timeout);
                Err(RaftError::Timeout)
            }
        }
    }

    fn random_timeout(&self) -> Duration {
        random_election_timeout(&self.config)
    }

    fn tick(self: &Arc<Self>) {
        enum Action {
            Idle,
            Heartbeat,
            Election,
        }

        let action = {
            let st = self.state.lock();
            match st.role {
                NodeState::Leader => {
                    let due = st
                        .last_broadcast
                        .map_or(true, |t| t.elapsed() >= self.config.heartbeat_interval);
                    if due {
                        Action::Heartbeat
                    } else {
                        Action::Idle
                    }
                }
                NodeState::Follower | NodeState::Candidate => {
                    // Only voters campaign; a node waiting to be added stays quiet.
                    if st.members.contains_key(&self.config.node_id)
                        && st.last_heartbeat.elapsed() >= st.election_timeout
                    {
                        Action::Election
                    } else {
                        Action::Idle
                    }
                }
            }
        };

        match action {
            Action::Idle => {}
            Action::Heartbeat => self.broadcast(),
            Action::Election => self.start_election(),
        }
    }

    fn start_election(self: &Arc<Self>) {
        let (term, request, peers) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;

            st.current_term += 1;
            st.role = NodeState::Candidate;
            st.voted_for = Some(self.config.node_id.clone());
            st.leader_id = None;
            st.votes = HashSet::from([self.config.node_id.clone()]);
            st.last_heartbeat = Instant::now();
            st.election_timeout = self.random_timeout();
            st.save_hard_state();

            info!("Starting election for term {}", st.current_term);

            if st.votes.len() >= st.majority() {
                self.become_leader(st);
                return;
            }

            let request = RequestVoteRequest {
                term: st.current_term,
                candidate_id: self.config.node_id.clone(),
                last_log_index: st.log.last_index(),
                last_log_term: st.log.last_term(),
            };
            (st.current_term, request, self.peers(st))
        };

        for (peer, address) in peers {
            let raft = Arc::clone(self);
            let request = request.clone();
            tokio::spawn(async move {
                match raft.transport.send(&address, RaftRequest::RequestVote(request)).await {
                    Ok(RaftResponse::RequestVote(response)) => {
                        raft.on_vote_response(peer, term, response)
                    }
                    Ok(other) => debug!("Unexpected vote reply from {}: {:?}", peer, other),
                    Err(e) => debug!("Vote request to {} failed: {}", peer, e),
                }
            });
        }
    }

    fn on_vote_response(self: &Arc<Self>, peer: NodeId, term: u64, response: RequestVoteResponse) {
        let won = {
            let mut guard = self.state.lock();
            let st = &mut *guard;

            if response.term > st.current_term {
                st.step_down(response.term, None, self.random_timeout());
                return;
            }
            if st.role != NodeState::Candidate
                || st.current_term != term
                || !response.vote_granted
            {
                return;
            }

            debug!("Received vote from {} for term {}", peer, term);
            if st.members.contains_key(&peer) {
                st.votes.insert(peer);
            }
            if st.votes.len() >= st.majority() {
                self.become_leader(st);
                true
            } else {
                false
            }
        };

        if won {
            self.broadcast();
        }
    }

    fn become_leader(&self, st: &mut RaftState<SM::Response>) {
        st.role = NodeState::Leader;
        st.leader_id = Some(self.config.node_id.clone());
        st.votes.clear();
        st.last_broadcast = None;

        let next = st.log.last_index() + 1;
        st.next_index.clear();
        st.match_index.clear();
        for peer in st.members.keys().filter(|id| **id != self.config.node_id) {
            st.next_index.insert(peer.clone(), next);
            st.match_index.insert(peer.clone(), 0);
        }

        let index = st.log.push(st.current_term, EntryPayload::Blank);
        st.save_entries(index);

        info!(
            "Node {} became leader for term {}",
            self.config.node_id, st.current_term
        );

        self.advance_commit(st);
        self.apply_committed(st);
    }

    fn peers(&self, st: &RaftState<SM::Response>) -> Vec<(NodeId, String)> {
        st.members
            .iter()
            .filter(|(id, _)| **id != self.config.node_id)
            .map(|(id, address)| (id.clone(), address.clone()))
            .collect()
    }

    /// Send AppendEntries (or a snapshot) to every peer
    fn broadcast(self: &Arc<Self>) {
        let peers = {
            let mut st = self.state.lock();
            if st.role != NodeState::Leader {
                return;
            }
            st.last_broadcast = Some(Instant::now());
            self.peers(&st)
        };

        for (peer, address) in peers {
            self.replicate(peer, address);
        }
    }

    fn replicate(self: &Arc<Self>, peer: NodeId, address: String) {
        let raft = Arc::clone(self);
        tokio::spawn(async move { raft.replicate_to(peer, address).await });
    }

    async fn replicate_to(self: Arc<Self>, peer: NodeId, address: String) {
        let (term, request, sent) = {
            let st = self.state.lock();
            if st.role != NodeState::Leader {
                return;
            }

            let next = st
                .next_index
                .get(&peer)
                .copied()
                .unwrap_or(st.log.last_index() + 1);

            match st.log.snapshot() {
                Some(snapshot) if next <= snapshot.last_included_index => {
                    let request = RaftRequest::InstallSnapshot(InstallSnapshotRequest {
                        term: st.current_term,
                        leader_id: self.config.node_id.clone(),
                        last_included_index: snapshot.last_included_index,
                        last_included_term: snapshot.last_included_term,
                        members: snapshot.members.clone(),
                        data: snapshot.data.clone(),
                    });
                    let sent = Sent::Snapshot {
                        last_included_index: snapshot.last_included_index,
                    };
                    (st.current_term, request, sent)
                }
                _ => {
                    let prev_log_index = next - 1;
                    let entries = st.log.entries_from(next, self.config.max_append_entries);
                    let sent = Sent::Entries {
                        prev_log_index,
                        count: entries.len() as u64,
                    };
                    let request = RaftRequest::AppendEntries(AppendEntriesRequest {
                        term: st.current_term,
                        leader_id: self.config.node_id.clone(),
                        prev_log_index,
                        prev_log_term: st.log.term_at(prev_log_index).unwrap_or(0),
                        entries,
                        leader_commit: st.commit_index,
                    });
                    (st.current_term, request, sent)
                }
            }
        };

        let response = self.transport.send(&address, request).await;

        let again = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            match (response, sent) {
                (
                    Ok(RaftResponse::AppendEntries(resp)),
                    Sent::Entries {
                        prev_log_index,
                        count,
                    },
                ) => {
                    self.on_append_response(st, &peer, term, prev_log_index, count, resp)
                }
                (
                    Ok(RaftResponse::InstallSnapshot(resp)),
                    Sent::Snapshot {
                        last_included_index,
                    },
                ) => {
                    self.on_snapshot_response(st, &peer, term, last_included_index, resp)
                }
                (Ok(other), _) => {
                    debug!("Unexpected replication reply from {}: {:?}", peer, other);
                    false
                }
                (Err(e), _) => {
                    debug!("Replication to {} failed: {}", peer, e);
                    false
                }
            }
        };

        if again {
            self.replicate(peer, address);
        }
    }

    /// Returns whether more should be sent to the peer right away.
    fn on_append_response(
        &self,
        st: &mut RaftState<SM::Response>,
        peer: &str,
        term: u64,
        prev_log_index: u64,
        count: u64,
        response: AppendEntriesResponse,
    ) -> bool {
        if response.term > st.current_term {
            st.step_down(response.term, None, self.random_timeout());
            return false;
        }
        if st.role != NodeState::Leader || st.current_term != term {
            return false;
        }

        if response.success {
            let matched = prev_log_index + count;
            let match_index = st.match_index.entry(peer.to_string()).or_insert(0);
            *match_index = (*match_index).max(matched);
            let next_index = st.next_index.entry(peer.to_string()).or_insert(1);
            *next_index = (*next_index).max(matched + 1);
            let next = *next_index;

            self.advance_commit(st);
            self.apply_committed(st);
            next <= st.log.last_index()
        } else {
            let hint = response.mismatch_index.unwrap_or(prev_log_index).max(1);
            let next_index = st.next_index.entry(peer.to_string()).or_insert(1);
            if hint < *next_index {
                debug!("Log mismatch with {}, retrying from {}", peer, hint);
                *next_index = hint;
                true
            } else {
                false
            }
        }
    }

    fn on_snapshot_response(
        &self,
        st: &mut RaftState<SM::Response>,
        peer: &str,
        term: u64,
        last_included_index: u64,
        response: InstallSnapshotResponse,
    ) -> bool {
        if response.term > st.current_term {
            st.step_down(response.term, None, self.random_timeout());
            return false;
        }
        if st.role != NodeState::Leader || st.current_term != term {
            return false;
        }

        let match_index = st.match_index.entry(peer.to_string()).or_insert(0);
        *match_index = (*match_index).max(last_included_index);
        let next_index = st.next_index.entry(peer.to_string()).or_insert(1);
        *next_index = (*next_index).max(last_included_index + 1);
        let next = *next_index;

        self.advance_commit(st);
        self.apply_committed(st);
        next <= st.log.last_index()
    }

    /// Commit the highest current-term entry stored on a majority of voters.
    fn advance_commit(&self, st: &mut RaftState<SM::Response>) {
        if st.role != NodeState::Leader {
            return;
        }

        let majority = st.majority();
        let mut n = st.log.last_index();
        while n > st.commit_index {
            if st.log.term_at(n) != Some(st.current_term) {
                // Earlier terms only commit indirectly.
                break;
            }
            let replicated = st
                .members
                .keys()
                .filter(|id| {
                    if **id == self.config.node_id {
                        true
                    } else {
                        st.match_index.get(*id).copied().unwrap_or(0) >= n
                    }
                })
                .count();
            if replicated >= majority {
                debug!("Commit index advanced to {}", n);
                st.commit_index = n;
                break;
            }
            n -= 1;
        }
    }

    /// Apply committed entries in order and resolve their proposers.
    fn apply_committed(&self, st: &mut RaftState<SM::Response>) {
        while st.last_applied < st.commit_index {
            let index = st.last_applied + 1;
            let (term, response) = match st.log.get_entry(index) {
                Some(entry) => {
                    let response = match &entry.payload {
                        EntryPayload::Command(command) => {
                            Some(self.state_machine.apply(index, command))
                        }
                        EntryPayload::Blank | EntryPayload::AddVoter { .. } => None,
                    };
                    (entry.term, response)
                }
                None => {
                    error!("Committed entry {} is missing from the log", index);
                    break;
                }
            };
            st.last_applied = index;

            if let Some(waiter) = st.waiters.remove(&index) {
                let outcome = if waiter.term == term {
                    Ok(response)
                } else {
                    Err(RaftError::NotLeader {
                        leader_id: st.leader_id.clone(),
                    })
                };
                let _ = waiter.tx.send(outcome);
            }
        }

        let threshold = self.config.snapshot_threshold;
        if threshold > 0 && st.last_applied - st.log.snapshot_index() >= threshold {
            if let Err(e) = self.compact(st) {
                error!("Failed to compact raft log: {}", e);
            }
        }
    }

    fn compact(&self, st: &mut RaftState<SM::Response>) -> Result<()> {
        let index = st.last_applied;
        if index <= st.log.snapshot_index() {
            return Ok(());
        }

        let data = self
            .state_machine
            .snapshot()
            .map_err(RaftError::StateMachine)?;
        if st.log.compact(index, data) {
            st.save_snapshot();
            info!("Compacted raft log through index {}", index);
        }
        Ok(())
    }

    /// Handle AppendEntries RPC
    pub fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut guard = self.state.lock();
        let st = &mut *guard;

        if req.term < st.current_term {
            return AppendEntriesResponse {
                term: st.current_term,
                success: false,
                mismatch_index: None,
            };
        }

        if req.term > st.current_term || st.role != NodeState::Follower {
            st.step_down(req.term, Some(req.leader_id.clone()), self.random_timeout());
        }
        st.leader_id = Some(req.leader_id.clone());
        st.last_heartbeat = Instant::now();

        let term = st.current_term;
        let snapshot_index = st.log.snapshot_index();
        let reject = |mismatch_index: u64| AppendEntriesResponse {
            term,
            success: false,
            mismatch_index: Some(mismatch_index),
        };

        if req.prev_log_index > st.log.last_index() {
            return reject(st.log.last_index() + 1);
        }

        // Entries at or behind the snapshot are committed, so they match.
        if req.prev_log_index >= snapshot_index {
            if let Some(local_term) = st.log.term_at(req.prev_log_index) {
                if local_term != req.prev_log_term {
                    // Skip back over the whole conflicting term at once.
                    let mut hint = req.prev_log_index;
                    while hint > snapshot_index + 1
                        && st.log.term_at(hint - 1) == Some(local_term)
                    {
                        hint -= 1;
                    }
                    return reject(hint.max(1));
                }
            }
        }

        let last_new = req.prev_log_index + req.entries.len() as u64;
        let mut first_new = None;
        let mut truncated = false;
        let mut membership_changed = false;

        for entry in req.entries {
            if entry.index <= st.log.snapshot_index() {
                continue;
            }
            match st.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => continue,
                Some(_) => {
                    warn!("Discarding conflicting entries from index {}", entry.index);
                    st.log.truncate_from(entry.index);
                    st.fail_waiters_from(entry.index);
                    truncated = true;
                    membership_changed = true;
                }
                None => {}
            }
            if matches!(entry.payload, EntryPayload::AddVoter { .. }) {
                membership_changed = true;
            }
            first_new.get_or_insert(entry.index);
            st.log.append(vec![entry]);
        }

        if truncated {
            st.rewrite_log();
        } else if let Some(from) = first_new {
            st.save_entries(from);
        }
        if membership_changed {
            st.members = st.log.members();
        }

        let commit = req.leader_commit.min(last_new);
        if commit > st.commit_index {
            st.commit_index = commit;
            self.apply_committed(st);
        }

        AppendEntriesResponse {
            term,
            success: true,
            mismatch_index: None,
        }
    }

    /// Handle RequestVote RPC
    pub fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        let mut guard = self.state.lock();
        let st = &mut *guard;

        if req.term < st.current_term {
            return RequestVoteResponse {
                term: st.current_term,
                vote_granted: false,
            };
        }

        if req.term > st.current_term {
            st.step_down(req.term, None, self.random_timeout());
        }

        let up_to_date = req.last_log_term > st.log.last_term()
            || (req.last_log_term == st.log.last_term()
                && req.last_log_index >= st.log.last_index());
        let can_vote = st
            .voted_for
            .as_ref()
            .map_or(true, |voted| *voted == req.candidate_id);

        let vote_granted = up_to_date && can_vote;
        if vote_granted {
            debug!("Granting vote to {} for term {}", req.candidate_id, st.current_term);
            st.voted_for = Some(req.candidate_id);
            st.save_hard_state();
            st.last_heartbeat = Instant::now();
        }

        RequestVoteResponse {
            term: st.current_term,
            vote_granted,
        }
    }

    /// Handle InstallSnapshot RPC
    pub fn handle_install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
        let mut guard = self.state.lock();
        let st = &mut *guard;

        if req.term < st.current_term {
            return InstallSnapshotResponse {
                term: st.current_term,
            };
        }

        if req.term > st.current_term || st.role != NodeState::Follower {
            st.step_down(req.term, Some(req.leader_id.clone()), self.random_timeout());
        }
        st.leader_id = Some(req.leader_id.clone());
        st.last_heartbeat = Instant::now();

        let response = InstallSnapshotResponse {
            term: st.current_term,
        };

        if req.last_included_index <= st.last_applied {
            return response;
        }

        if let Err(e) = self.state_machine.restore(&req.data) {
            error!("Failed to restore snapshot from {}: {}", req.leader_id, e);
            return response;
        }

        let index = req.last_included_index;
        st.log.install_snapshot(Snapshot {
            last_included_index: index,
            last_included_term: req.last_included_term,
            members: req.members,
            data: req.data,
        });
        st.members = st.log.members();
        st.commit_index = st.commit_index.max(index);
        st.last_applied = index;

        // Anything still waiting at or below the snapshot has an unknown outcome.
        let remaining = st.waiters.split_off(&(index + 1));
        let covered = std::mem::replace(&mut st.waiters, remaining);
        for (_, waiter) in covered {
            let _ = waiter.tx.send(Err(RaftError::NotLeader {
                leader_id: st.leader_id.clone(),
            }));
        }

        st.save_snapshot();
        info!("Installed snapshot through index {} from {}", index, req.leader_id);

        response
    }
}

impl<SM: StateMachine> RaftRpcHandler for Raft<SM> {
    fn handle(&self, request: RaftRequest) -> RaftResponse {
        match request {
            RaftRequest::AppendEntries(req) => {
                RaftResponse::AppendEntries(self.handle_append_entries(req))
            }
            RaftRequest::RequestVote(req) => {
                RaftResponse::RequestVote(self.handle_request_vote(req))
            }
            RaftRequest::InstallSnapshot(req) => {
                RaftResponse::InstallSnapshot(self.handle_install_snapshot(req))
            }
            RaftRequest::Ping => RaftResponse::Pong {
                node_id: self.config.node_id.clone(),
                term: self.current_term(),
            },
        }
    }
}

fn random_election_timeout(config: &RaftConfig) -> Duration {
    let min = config.election_timeout_min.as_millis() as u64;
    let max = (config.election_timeout_max.as_millis() as u64).max(min);
    Duration::from_millis(fastrand::u64(min..=max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogEntry;
    use crate::node::MemoryRouter;
    use crate::state_machine::{create_set_command, MemoryStateMachine};
    use tempfile::TempDir;

    fn test_config(node_id: &str) -> RaftConfig {
        RaftConfig {
            node_id: node_id.to_string(),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            tick_interval: Duration::from_millis(10),
            apply_timeout: Duration::from_secs(2),
            max_append_entries: 64,
            snapshot_threshold: 0,
        }
    }

    fn log_entries(raft: &Raft<MemoryStateMachine>) -> Vec<LogEntry> {
        raft.state.lock().log.iter().cloned().collect()
    }

    fn single_node(
        config: RaftConfig,
        storage: Option<RaftStorage>,
    ) -> Arc<Raft<MemoryStateMachine>> {
        let router = MemoryRouter::new();
        let transport = Arc::new(router.transport(config.node_id.clone()));
        Raft::new(config, Arc::new(MemoryStateMachine::new()), transport, storage).unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_makes_leader() {
        let raft = single_node(test_config("a"), None);
        raft.bootstrap("a:1").unwrap();

        assert!(raft.is_leader());
        assert_eq!(raft.leader_id().as_deref(), Some("a"));
        let status = raft.status();
        assert_eq!(status.current_term, 1);
        assert_eq!(status.commit_index, 2);
        assert_eq!(status.members.len(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_twice_is_rejected() {
        let raft = single_node(test_config("a"), None);
        raft.bootstrap("a:1").unwrap();
        assert!(matches!(raft.bootstrap("a:1"), Err(RaftError::AlreadyBootstrapped)));
    }

    #[tokio::test]
    async fn test_submit_as_follower() {
        let raft = single_node(test_config("a"), None);
        let result = raft.submit(create_set_command("k", vec![1]).unwrap()).await;
        assert!(matches!(result, Err(RaftError::NotLeader { leader_id: None })));
    }

    #[tokio::test]
    async fn test_single_node_submit_applies() {
        let raft = single_node(test_config("a"), None);
        raft.bootstrap("a:1").unwrap();

        let previous = raft.submit(create_set_command("k", vec![1]).unwrap()).await.unwrap();
        assert_eq!(previous, Ok(None));
        let previous = raft.submit(create_set_command("k", vec![2]).unwrap()).await.unwrap();
        assert_eq!(previous, Ok(Some(vec![1])));

        assert_eq!(raft.state_machine().get("k"), Some(vec![2]));
        assert_eq!(raft.state_machine().applied_indexes(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_add_existing_member_is_rejected() {
        let raft = single_node(test_config("a"), None);
        raft.bootstrap("a:1").unwrap();
        let result = raft.add_voter("a".to_string(), "a:1".to_string()).await;
        assert!(matches!(result, Err(RaftError::AlreadyMember(_))));
    }

    #[tokio::test]
    async fn test_add_unreachable_voter_is_rejected() {
        let raft = single_node(test_config("a"), None);
        raft.bootstrap("a:1").unwrap();
        let result = raft.add_voter("b".to_string(), "b:1".to_string()).await;
        assert!(matches!(result, Err(RaftError::Unreachable { .. })));
        assert_eq!(raft.members().len(), 1);
    }

    #[tokio::test]
    async fn test_unbootstrapped_node_never_campaigns() {
        let raft = single_node(test_config("a"), None);
        raft.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(raft.current_term(), 0);
        assert!(!raft.is_leader());
        raft.shutdown();
    }

    #[tokio::test]
    async fn test_manual_snapshot_compacts_log() {
        let raft = single_node(test_config("a"), None);
        raft.bootstrap("a:1").unwrap();
        for i in 0..5u8 {
            raft.submit(create_set_command(format!("k{}", i), vec![i]).unwrap())
                .await
                .unwrap()
                .unwrap();
        }

        assert_eq!(raft.snapshot().unwrap(), 7);
        assert!(log_entries(&raft).is_empty());
        assert_eq!(raft.status().members.len(), 1);
    }

    #[tokio::test]
    async fn test_automatic_snapshot_threshold() {
        let mut config = test_config("a");
        config.snapshot_threshold = 4;
        let raft = single_node(config, None);
        raft.bootstrap("a:1").unwrap();
        for i in 0..3u8 {
            raft.submit(create_set_command("k", vec![i]).unwrap()).await.unwrap().unwrap();
        }
        assert!(raft.status().snapshot_index >= 4);
    }

    #[tokio::test]
    async fn test_restart_recovers_from_storage() {
        let temp_dir = TempDir::new().unwrap();

        {
            let storage = RaftStorage::open(temp_dir.path()).unwrap();
            let raft = single_node(test_config("a"), Some(storage));
            raft.bootstrap("a:1").unwrap();
            raft.submit(create_set_command("k1", vec![1]).unwrap()).await.unwrap().unwrap();
            raft.snapshot().unwrap();
            raft.submit(create_set_command("k2", vec![2]).unwrap()).await.unwrap().unwrap();
            raft.shutdown();
        }

        let storage = RaftStorage::open(temp_dir.path()).unwrap();
        let raft = single_node(test_config("a"), Some(storage));
        let status = raft.status();
        assert_eq!(status.current_term, 1);
        assert_eq!(status.snapshot_index, 3);
        assert_eq!(status.last_log_index, 4);
        assert_eq!(status.members.len(), 1);
        // Restored from the snapshot; the tail applies once re-elected.
        assert_eq!(raft.state_machine().get("k1"), Some(vec![1]));
        assert!(matches!(raft.bootstrap("a:1"), Err(RaftError::AlreadyBootstrapped)));

        raft.start();
        let deadline = Instant::now() + Duration::from_secs(3);
        while !raft.is_leader() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(raft.is_leader());
        assert_eq!(raft.current_term(), 2);
        assert_eq!(raft.state_machine().get("k2"), Some(vec![2]));
        raft.shutdown();
    }

    #[test]
    fn test_append_entries_rejects_stale_term() {
        let raft = single_node(test_config("a"), None);
        raft.handle_request_vote(RequestVoteRequest {
            term: 5,
            candidate_id: "b".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        });

        let response = raft.handle_append_entries(AppendEntriesRequest {
            term: 3,
            leader_id: "c".to_string(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        });
        assert!(!response.success);
        assert_eq!(response.term, 5);
    }

    #[test]
    fn test_vote_granted_once_per_term() {
        let raft = single_node(test_config("a"), None);
        let vote = |candidate: &str| {
            raft.handle_request_vote(RequestVoteRequest {
                term: 2,
                candidate_id: candidate.to_string(),
                last_log_index: 0,
                last_log_term: 0,
            })
        };
        assert!(vote("b").vote_granted);
        assert!(vote("b").vote_granted);
        assert!(!vote("c").vote_granted);
    }

    #[test]
    fn test_vote_denied_to_stale_log() {
        let raft = single_node(test_config("a"), None);
        raft.handle_append_entries(AppendEntriesRequest {
            term: 2,
            leader_id: "b".to_string(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry {
                term: 2,
                index: 1,
                payload: EntryPayload::Blank,
            }],
            leader_commit: 0,
        });

        let response = raft.handle_request_vote(RequestVoteRequest {
            term: 3,
            candidate_id: "c".to_string(),
            last_log_index: 5,
            last_log_term: 1,
        });
        assert!(!response.vote_granted);
        assert_eq!(response.term, 3);
    }

    #[test]
    fn test_follower_truncates_conflicting_entries() {
        let raft = single_node(test_config("a"), None);
        let entry = |term, index| LogEntry {
            term,
            index,
            payload: EntryPayload::Command(vec![index as u8]),
        };

        raft.handle_append_entries(AppendEntriesRequest {
            term: 1,
            leader_id: "b".to_string(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1), entry(1, 2), entry(1, 3)],
            leader_commit: 1,
        });

        // A new leader disagrees from index 2 on.
        let response = raft.handle_append_entries(AppendEntriesRequest {
            term: 2,
            leader_id: "c".to_string(),
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![entry(2, 2)],
            leader_commit: 2,
        });
        assert!(response.success);

        let terms: Vec<u64> = log_entries(&raft).iter().map(|e| e.term).collect();
        assert_eq!(terms, vec![1, 2]);
        assert_eq!(raft.status().commit_index, 2);
        assert_eq!(raft.leader_id().as_deref(), Some("c"));
    }

    #[test]
    fn test_mismatch_hint_skips_conflicting_term() {
        let raft = single_node(test_config("a"), None);
        let entries = (1..=4)
            .map(|index| LogEntry {
                term: 1,
                index,
                payload: EntryPayload::Blank,
            })
            .collect();
        raft.handle_append_entries(AppendEntriesRequest {
            term: 1,
            leader_id: "b".to_string(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries,
            leader_commit: 0,
        });

        let response = raft.handle_append_entries(AppendEntriesRequest {
            term: 3,
            leader_id: "c".to_string(),
            prev_log_index: 4,
            prev_log_term: 2,
            entries: vec![],
            leader_commit: 0,
        });
        assert!(!response.success);
        assert_eq!(response.mismatch_index, Some(1));

        let response = raft.handle_append_entries(AppendEntriesRequest {
            term: 3,
            leader_id: "c".to_string(),
            prev_log_index: 9,
            prev_log_term: 3,
            entries: vec![],
            leader_commit: 0,
        });
        assert_eq!(response.mismatch_index, Some(5));
    }
}
