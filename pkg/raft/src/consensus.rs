use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::errors::*;
use crate::protos::{
	AppendEntriesRequest, AppendEntriesResponse, AppliedMap, HeartbeatRequest, HeartbeatResponse,
	KeyValue, LogEntry, LogEntryData, LogIndex, RequestVoteRequest, RequestVoteResponse, ServerId,
	Term, Value,
};
use crate::storage::StorageDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Follower,
	Candidate,
	Leader,
}

struct State {
	role: Role,
	/// Populated only while `role == Candidate`: who has granted a vote
	/// this term, including ourselves.
	votes: HashSet<ServerId>,
	commit_index: LogIndex,
	last_applied: LogIndex,
	applied: AppliedMap,
}

/// The pure, synchronous heart of the engine: role transitions, the
/// RequestVote/AppendEntries acceptance rules, and commit-index
/// arithmetic. It owns no sockets and starts no threads; `engine.rs`
/// drives it against real timers and a real network.
pub struct ConsensusModule {
	pub id: ServerId,
	storage: Arc<dyn StorageDriver>,
	cluster_size: usize,
	state: Mutex<State>,
}

impl ConsensusModule {
	pub fn new(id: ServerId, storage: Arc<dyn StorageDriver>, cluster_size: usize) -> Self {
		let applied = storage.rebuild_applied_map();
		ConsensusModule {
			id,
			storage,
			cluster_size,
			state: Mutex::new(State {
				role: Role::Follower,
				votes: HashSet::new(),
				commit_index: 0,
				last_applied: 0,
				applied,
			}),
		}
	}

	pub fn majority(&self) -> usize {
		self.cluster_size / 2 + 1
	}

	/// Gives `engine.rs` access to the same storage handle for building
	/// outbound replication requests without duplicating a second copy
	/// of term/index bookkeeping.
	pub fn storage_handle(&self) -> &Arc<dyn StorageDriver> {
		&self.storage
	}

	pub fn current_term(&self) -> Term {
		self.storage.current_term()
	}

	pub fn role(&self) -> Role {
		self.state.lock().unwrap().role
	}

	pub fn is_leader(&self) -> bool {
		self.role() == Role::Leader
	}

	pub fn commit_index(&self) -> LogIndex {
		self.state.lock().unwrap().commit_index
	}

	pub fn last_applied(&self) -> LogIndex {
		self.state.lock().unwrap().last_applied
	}

	pub fn get(&self, key: &[u8]) -> Option<Value> {
		self.state.lock().unwrap().applied.get(key).cloned()
	}

	/// Adopts `term` and reverts to Follower if `term` is strictly
	/// greater than the current term. Returns true if a transition
	/// happened. Called on every inbound and outbound RPC's term field.
	pub fn observe_term(&self, term: Term) -> Result<bool> {
		if term > self.current_term() {
			info!("node {} adopting term {} (was {})", self.id, term, self.current_term());
			self.storage.set_current_term(term)?;
			self.storage.set_voted_for(None)?;
			let mut st = self.state.lock().unwrap();
			st.role = Role::Follower;
			st.votes.clear();
			return Ok(true);
		}
		Ok(false)
	}

	/// Begins a new election: increments the term, votes for self, and
	/// returns the request to broadcast to every peer.
	pub fn become_candidate(&self) -> Result<RequestVoteRequest> {
		let new_term = self.current_term() + 1;
		self.storage.set_current_term(new_term)?;
		self.storage.set_voted_for(Some(self.id))?;

		{
			let mut st = self.state.lock().unwrap();
			st.role = Role::Candidate;
			st.votes.clear();
			st.votes.insert(self.id);
		}

		let last_index = self.storage.last_index();
		let last_term = self.storage.term_at(last_index);

		Ok(RequestVoteRequest {
			term: new_term,
			candidate_id: self.id,
			last_log_index: last_index,
			last_log_term: last_term,
		})
	}

	/// Records a vote granted by `from` for the current term. Returns
	/// true exactly once: the first time the tally crosses a majority.
	pub fn record_vote(&self, from: ServerId, term: Term) -> bool {
		let mut st = self.state.lock().unwrap();
		if st.role != Role::Candidate || term != self.current_term() {
			return false;
		}
		let was_majority = st.votes.len() >= self.majority();
		st.votes.insert(from);
		!was_majority && st.votes.len() >= self.majority()
	}

	/// True if the self-vote cast on entering candidacy already meets
	/// the majority threshold (a single-node cluster never needs to
	/// wait on any peer's reply).
	pub fn has_standing_majority(&self) -> bool {
		let st = self.state.lock().unwrap();
		st.role == Role::Candidate && st.votes.len() >= self.majority()
	}

	/// Transitions to Leader. The caller (the engine) is responsible for
	/// resetting per-peer `next_index`/`match_index` bookkeeping.
	pub fn become_leader(&self) {
		let mut st = self.state.lock().unwrap();
		st.role = Role::Leader;
		st.votes.clear();
	}

	pub fn become_follower(&self) {
		let mut st = self.state.lock().unwrap();
		st.role = Role::Follower;
		st.votes.clear();
	}

	/// Appends a command at the leader's current term. Fails if this
	/// node is not the leader.
	pub fn append_command(&self, command: KeyValue) -> Result<LogIndex> {
		if !self.is_leader() {
			bail!(ErrorKind::NotLeader);
		}
		let term = self.current_term();
		self.storage.append(term, LogEntryData::Command(command))
	}

	pub fn append_noop(&self) -> Result<LogIndex> {
		if !self.is_leader() {
			bail!(ErrorKind::NotLeader);
		}
		let term = self.current_term();
		self.storage.append(term, LogEntryData::Noop)
	}

	pub fn request_vote(&self, req: &RequestVoteRequest) -> Result<RequestVoteResponse> {
		self.observe_term(req.term)?;
		let current_term = self.current_term();

		if req.term < current_term {
			return Ok(RequestVoteResponse { term: current_term, vote_granted: false });
		}

		let voted_for = self.storage.voted_for();
		let already_voted_elsewhere = matches!(voted_for, Some(v) if v != req.candidate_id);

		let last_index = self.storage.last_index();
		let last_term = self.storage.term_at(last_index);
		let candidate_up_to_date = req.last_log_term > last_term
			|| (req.last_log_term == last_term && req.last_log_index >= last_index);

		let grant = !already_voted_elsewhere && candidate_up_to_date;
		if grant {
			self.storage.set_voted_for(Some(req.candidate_id))?;
		}
		info!(
			"node {} {} vote for {} in term {}",
			self.id,
			if grant { "granted" } else { "refused" },
			req.candidate_id,
			current_term
		);

		Ok(RequestVoteResponse { term: current_term, vote_granted: grant })
	}

	pub fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse> {
		self.observe_term(req.term)?;
		let current_term = self.current_term();
		if req.term < current_term {
			return Ok(HeartbeatResponse { term: current_term, success: false });
		}
		self.become_follower();
		Ok(HeartbeatResponse { term: current_term, success: true })
	}

	/// Implements the follower-side AppendEntries rule of 4.4, including
	/// the refusal to overwrite an already-committed suffix (Q3) and the
	/// requirement that the follower only ever sets `commit_index` from
	/// `leader_commit`, never the leader-side majority logic (Q2).
	pub fn append_entries(&self, req: &AppendEntriesRequest) -> Result<AppendEntriesResponse> {
		self.observe_term(req.term)?;
		let current_term = self.current_term();

		if req.term < current_term {
			return Ok(AppendEntriesResponse {
				term: current_term,
				success: false,
				last_log_index: self.storage.last_index(),
			});
		}

		self.become_follower();

		if req.prev_log_index > 0 {
			match self.storage.get(req.prev_log_index) {
				Some(entry) if entry.term == req.prev_log_term => {}
				_ => {
					return Ok(AppendEntriesResponse {
						term: current_term,
						success: false,
						last_log_index: self.storage.last_index(),
					});
				}
			}
		}

		if !req.entries.is_empty() {
			let commit_index = self.state.lock().unwrap().commit_index;
			let first_new_index = req.entries[0].index;
			if first_new_index <= commit_index {
				// Refuses to touch an index already known to be committed
				// locally unless the incoming entry is identical there.
				let conflicts = req.entries.iter().any(|e| {
					e.index <= commit_index
						&& self.storage.get(e.index).map(|existing| existing.term) != Some(e.term)
				});
				if conflicts {
					return Ok(AppendEntriesResponse {
						term: current_term,
						success: false,
						last_log_index: self.storage.last_index(),
					});
				}
			}
			self.storage.append_many(first_new_index, &req.entries)?;
		}

		let last_new_index = if req.entries.is_empty() {
			req.prev_log_index
		} else {
			req.entries.last().unwrap().index
		};

		if req.leader_commit > self.state.lock().unwrap().commit_index {
			let new_commit = req.leader_commit.min(last_new_index);
			let mut st = self.state.lock().unwrap();
			if new_commit > st.commit_index {
				st.commit_index = new_commit;
			}
		}

		self.apply_committed();

		Ok(AppendEntriesResponse {
			term: current_term,
			success: true,
			last_log_index: self.storage.last_index(),
		})
	}

	/// Leader-side commit advancement (Q2 fix): given the set of
	/// `match_index` values across the cluster (including the leader's
	/// own `last_index`), advances `commit_index` to the highest index
	/// replicated on a majority whose entry is from the leader's current
	/// term. Entries from earlier terms are committed only transitively,
	/// once a current-term entry at a higher index is committed.
	pub fn advance_commit_index(&self, match_indices: &[LogIndex]) -> Option<LogIndex> {
		if !self.is_leader() {
			return None;
		}
		let current_term = self.current_term();
		let mut sorted = match_indices.to_vec();
		sorted.sort_unstable_by(|a, b| b.cmp(a));

		let majority_index = sorted.get(self.majority() - 1).copied().unwrap_or(0);
		if majority_index == 0 {
			return None;
		}
		let entry_term = self.storage.get(majority_index).map(|e| e.term);
		if entry_term != Some(current_term) {
			return None;
		}

		let mut st = self.state.lock().unwrap();
		if majority_index > st.commit_index {
			st.commit_index = majority_index;
			info!("node {} advanced commit_index to {}", self.id, majority_index);
			Some(majority_index)
		} else {
			None
		}
	}

	/// Applies any entries between `last_applied` and `commit_index`, in
	/// order, and returns the key/value pairs that were applied.
	pub fn apply_committed(&self) -> Vec<KeyValue> {
		let (from, to) = {
			let st = self.state.lock().unwrap();
			(st.last_applied + 1, st.commit_index)
		};
		if from > to {
			return Vec::new();
		}

		let mut applied = Vec::new();
		for entry in self.storage.range(from, to) {
			if let LogEntryData::Command(kv) = entry.data {
				debug!("node {} applying {:?} at index {}", self.id, kv, entry.index);
				let mut st = self.state.lock().unwrap();
				st.applied.insert(kv.key.as_bytes(), kv.value.clone());
				applied.push(kv);
			}
		}

		let mut st = self.state.lock().unwrap();
		st.last_applied = to;
		applied
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::storage::InMemoryStorage;

	fn module(id: ServerId, cluster_size: usize) -> ConsensusModule {
		ConsensusModule::new(id, Arc::new(InMemoryStorage::new()), cluster_size)
	}

	#[test]
	fn single_node_cluster_majority_is_one() {
		let m = module(1, 1);
		assert_eq!(m.majority(), 1);
		m.become_candidate().unwrap();
		assert!(m.record_vote(1, m.current_term()));
	}

	#[test]
	fn vote_refused_for_stale_log() {
		let m = module(1, 3);
		// Build up a log of length 2 locally.
		m.storage.append(1, LogEntryData::Noop).unwrap();
		m.storage.append(1, LogEntryData::Noop).unwrap();

		let req = RequestVoteRequest { term: 2, candidate_id: 2, last_log_index: 1, last_log_term: 1 };
		let resp = m.request_vote(&req).unwrap();
		assert!(!resp.vote_granted);
	}

	#[test]
	fn vote_granted_to_up_to_date_candidate() {
		let m = module(1, 3);
		let req = RequestVoteRequest { term: 1, candidate_id: 2, last_log_index: 0, last_log_term: 0 };
		let resp = m.request_vote(&req).unwrap();
		assert!(resp.vote_granted);
	}

	#[test]
	fn append_entries_rejects_log_mismatch() {
		let m = module(1, 3);
		let req = AppendEntriesRequest {
			term: 1,
			leader_id: 2,
			prev_log_index: 5,
			prev_log_term: 1,
			entries: vec![],
			leader_commit: 0,
		};
		let resp = m.append_entries(&req).unwrap();
		assert!(!resp.success);
	}

	#[test]
	fn commit_advances_only_on_current_term_majority() {
		let m = module(1, 3);
		m.storage.set_current_term(1).unwrap();
		m.storage.append(1, LogEntryData::Noop).unwrap();
		m.become_leader();

		// Only one of three (self) replicated so far: no majority yet.
		assert_eq!(m.advance_commit_index(&[1]), None);
		// Two of three: majority, same term as leader's: commits.
		assert_eq!(m.advance_commit_index(&[1, 1, 0]), Some(1));
	}

	#[test]
	fn apply_committed_updates_map_in_order() {
		let m = module(1, 1);
		m.storage.set_current_term(1).unwrap();
		let kv = KeyValue { key: Value::String("a".into()), value: Value::Number(7) };
		m.storage.append(1, LogEntryData::Command(kv.clone())).unwrap();
		m.become_leader();
		m.advance_commit_index(&[1]);
		let applied = m.apply_committed();
		assert_eq!(applied, vec![kv]);
		assert_eq!(m.get(&Value::String("a".into()).as_bytes()), Some(Value::Number(7)));
	}

	#[test]
	fn append_entries_refuses_to_overwrite_committed_suffix() {
		let m = module(1, 3);
		m.storage.set_current_term(1).unwrap();
		m.storage.append(1, LogEntryData::Noop).unwrap();
		m.become_leader();
		m.advance_commit_index(&[1]);
		assert_eq!(m.commit_index(), 1);
		m.become_follower();

		let conflicting = AppendEntriesRequest {
			term: 1,
			leader_id: 2,
			prev_log_index: 0,
			prev_log_term: 0,
			entries: vec![LogEntry { index: 1, term: 2, data: LogEntryData::Noop }],
			leader_commit: 0,
		};
		let resp = m.append_entries(&conflicting).unwrap();
		assert!(!resp.success);
	}
}
