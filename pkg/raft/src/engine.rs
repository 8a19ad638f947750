use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::Rng;

use crate::config::Configuration;
use crate::consensus::{ConsensusModule, Role};
use crate::errors::*;
use crate::peer::{Peer, PeerList};
use crate::protos::{AppendEntriesRequest, KeyValue, LogIndex, Message, ServerId, Value};
use crate::rpc::{MessageHandler, RpcClient, RpcServer, RpcServerHandle};
use crate::storage::StorageDriver;
use crate::worker_pool::WorkerPool;

const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(75);
const RPC_TIMEOUT: Duration = Duration::from_millis(100);
const ELECTION_TIMEOUT_MIN_MS: u64 = 150;
const ELECTION_TIMEOUT_MAX_MS: u64 = 300;
const PUT_TIMEOUT: Duration = Duration::from_millis(1000);

fn random_election_timeout() -> Duration {
	let millis = rand::thread_rng().gen_range(ELECTION_TIMEOUT_MIN_MS, ELECTION_TIMEOUT_MAX_MS);
	Duration::from_millis(millis)
}

/// The thread harness that drives a `ConsensusModule` and a `KvService`
/// against a real network: a follower-timeout thread, a leader heartbeat
/// thread, and the RPC listener wired up in `rpc.rs`. The consensus rules
/// themselves stay in `consensus.rs`; everything here is scheduling and
/// I/O.
pub struct ConsensusDriver {
	pub id: ServerId,
	pub module: Arc<ConsensusModule>,
	peers: Arc<PeerList>,
	pool: Arc<WorkerPool>,
	config: Configuration,
	last_leader_contact: Mutex<Instant>,
	election_timeout: Mutex<Duration>,
	shutdown: Arc<AtomicBool>,
	/// Woken whenever commit/apply progress or a role change might satisfy
	/// a blocked `put`; avoids polling with a sleep loop.
	progress: Condvar,
	progress_lock: Mutex<()>,
	rpc_server: Mutex<Option<RpcServerHandle>>,
}

impl ConsensusDriver {
	pub fn new(
		id: ServerId,
		storage: Arc<dyn StorageDriver>,
		peer_addresses: Vec<(ServerId, String)>,
		config: Configuration,
	) -> Arc<ConsensusDriver> {
		let peers: Vec<Arc<Peer>> = peer_addresses
			.into_iter()
			.map(|(peer_id, addr)| Arc::new(Peer::new(peer_id, addr)))
			.collect();
		let peer_list = Arc::new(PeerList::new(peers));
		let cluster_size = peer_list.cluster_size();

		let module = Arc::new(ConsensusModule::new(id, storage, cluster_size));
		let pool = WorkerPool::new(config.worker_pool_size, config.wait_queue_size);

		Arc::new(ConsensusDriver {
			id,
			module,
			peers: peer_list,
			pool,
			config,
			last_leader_contact: Mutex::new(Instant::now()),
			election_timeout: Mutex::new(random_election_timeout()),
			shutdown: Arc::new(AtomicBool::new(false)),
			progress: Condvar::new(),
			progress_lock: Mutex::new(()),
			rpc_server: Mutex::new(None),
		})
	}

	fn wake_progress(&self) {
		self.progress.notify_all();
	}

	/// Binds the peer listener and starts the follower-timeout and
	/// leader-heartbeat background threads.
	pub fn start(self: &Arc<Self>, bind_address: &str) -> Result<()> {
		let handle = RpcServer::start(bind_address, self.clone() as Arc<dyn MessageHandler>)?;
		*self.rpc_server.lock().unwrap() = Some(handle);

		let driver = self.clone();
		std::thread::Builder::new()
			.name("kayak-election-timer".into())
			.spawn(move || driver.election_timer_loop())
			.expect("failed to spawn election timer thread");

		let driver = self.clone();
		std::thread::Builder::new()
			.name("kayak-leader-tick".into())
			.spawn(move || driver.leader_tick_loop())
			.expect("failed to spawn leader tick thread");

		Ok(())
	}

	/// Stops accepting new RPC connections, wakes any thread blocked in
	/// `put`, and tears down the worker pool. Safe to call more than once.
	pub fn stop(&self) {
		self.shutdown.store(true, Ordering::SeqCst);
		if let Some(mut handle) = self.rpc_server.lock().unwrap().take() {
			handle.stop();
		}
		self.wake_progress();
		self.pool.stop();
	}

	fn reset_election_timer(&self) {
		*self.last_leader_contact.lock().unwrap() = Instant::now();
		*self.election_timeout.lock().unwrap() = random_election_timeout();
	}

	fn dial(address: &str) -> Result<RpcClient> {
		RpcClient::dial(address, RPC_TIMEOUT)
	}

	fn election_timer_loop(self: Arc<Self>) {
		while !self.shutdown.load(Ordering::SeqCst) {
			std::thread::sleep(Duration::from_millis(20));
			if self.module.role() == Role::Leader {
				continue;
			}
			let elapsed = self.last_leader_contact.lock().unwrap().elapsed();
			let timeout = *self.election_timeout.lock().unwrap();
			if elapsed >= timeout {
				self.reset_election_timer();
				self.start_election();
			}
		}
	}

	fn leader_tick_loop(self: Arc<Self>) {
		while !self.shutdown.load(Ordering::SeqCst) {
			std::thread::sleep(HEARTBEAT_INTERVAL);
			if self.module.role() == Role::Leader {
				self.replicate_once();
			}
		}
	}

	/// Runs one election round: broadcasts `RequestVote`, then blocks on
	/// a majority signal with the election timeout as its deadline
	/// rather than polling a shared vote counter (fixes the busy-loop
	/// named in item 1 of the design notes).
	fn start_election(self: &Arc<Self>) {
		let req = match self.module.become_candidate() {
			Ok(req) => req,
			Err(_) => return,
		};
		let term = req.term;
		info!("node {} starting election for term {}", self.id, term);

		if self.module.has_standing_majority() {
			self.promote_to_leader();
			return;
		}

		let (tx, rx) = channel::<()>();

		for peer in self.peers.iter() {
			let peer_for_job = peer.clone();
			let peer_for_done = peer.clone();
			let module = self.module.clone();
			let req = req.clone();
			let tx = tx.clone();
			let self_id = self.id;

			self.pool.enqueue(
				move || {
					peer_for_job.with_client(ConsensusDriver::dial, |client| {
						client.call(&Message::RequestVote(req.clone()))
					})
				},
				move |result| match result {
					Ok(Message::RequestVoteReply(resp)) => {
						let _ = module.observe_term(resp.term);
						if resp.vote_granted && module.record_vote(peer_for_done.id, term) {
							let _ = tx.send(());
						}
					}
					Ok(_) => {}
					Err(e) => warn!("node {} vote request to peer {} failed: {}", self_id, peer_for_done.id, e),
				},
			);
		}

		let timeout = *self.election_timeout.lock().unwrap();
		match rx.recv_timeout(timeout) {
			Ok(()) => self.promote_to_leader(),
			Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
				info!("node {} abandoned election for term {}: no majority before timeout", self.id, term);
			}
		}
	}

	fn promote_to_leader(&self) {
		if self.module.role() != Role::Candidate {
			return;
		}
		info!("node {} became leader for term {}", self.id, self.module.current_term());
		self.module.become_leader();
		let last_index = self.module.storage_handle().last_index();
		for peer in self.peers.iter() {
			peer.reset_for_new_term(last_index);
		}
		// A leader always has at least one entry of its own term so that
		// commit advancement has something current-term to point at.
		let _ = self.module.append_noop();
		self.replicate_once();
	}

	/// Sends one round of AppendEntries/Heartbeat to every peer in
	/// parallel, then advances commit_index once replies come back. A
	/// peer that is already caught up to commit_index gets a bare
	/// Heartbeat instead of an (empty but non-trivial) AppendEntries, the
	/// same ping-vs-append split the original driver makes in
	/// `registerNode`.
	fn replicate_once(self: &Arc<Self>) {
		if self.peers.is_empty() {
			self.try_advance_commit();
			return;
		}

		let commit_index = self.module.commit_index();

		for peer in self.peers.iter() {
			let term = self.module.current_term();
			let leader_id = self.id;

			if peer.match_index() == commit_index {
				let peer_for_job = peer.clone();
				let peer_for_done = peer.clone();
				let driver = self.clone();

				self.pool.enqueue(
					move || {
						let request = crate::protos::HeartbeatRequest { term, leader_id };
						peer_for_job.with_client(ConsensusDriver::dial, |client| client.call(&Message::Heartbeat(request.clone())))
					},
					move |result| match result {
						Ok(Message::HeartbeatReply(resp)) => {
							let _ = driver.module.observe_term(resp.term);
							if !resp.success {
								debug!("node {} heartbeat to peer {} stale, will resend full entries", driver.id, peer_for_done.id);
							}
						}
						Ok(_) => {}
						Err(e) => {
							warn!("node {} heartbeat to peer {} failed: {}", driver.id, peer_for_done.id, e);
						}
					},
				);
				continue;
			}

			let driver = self.clone();
			let next_index = peer.next_index();
			let prev_log_index = next_index.saturating_sub(1);
			let prev_log_term = driver.module.storage_handle().term_at(prev_log_index);
			let last_index = driver.module.storage_handle().last_index();
			let batch_end = last_index.min(next_index + driver.config.max_log_batch - 1);
			let entries = if next_index > last_index {
				Vec::new()
			} else {
				driver.module.storage_handle().range(next_index, batch_end)
			};

			let peer_for_job = peer.clone();
			let peer_for_done = peer.clone();
			let leader_commit = driver.module.commit_index();
			let driver_for_done = driver.clone();

			self.pool.enqueue(
				move || {
					let request = AppendEntriesRequest {
						term,
						leader_id,
						prev_log_index,
						prev_log_term,
						entries,
						leader_commit,
					};
					peer_for_job.with_client(ConsensusDriver::dial, |client| {
						client.call(&Message::AppendEntries(request.clone()))
					})
				},
				move |result| match result {
					Ok(Message::AppendEntriesReply(resp)) => {
						let _ = driver_for_done.module.observe_term(resp.term);
						if resp.success {
							peer_for_done.record_success(resp.last_log_index);
							driver_for_done.try_advance_commit();
						} else {
							debug!("node {} log mismatch with peer {}, backing off next_index", driver_for_done.id, peer_for_done.id);
							peer_for_done.decrement_next_index();
						}
					}
					Ok(_) => {}
					Err(e) => {
						warn!("node {} replication to peer {} failed: {}", driver_for_done.id, peer_for_done.id, e);
					}
				},
			);
		}
	}

	fn try_advance_commit(&self) {
		let mut match_indices: Vec<LogIndex> = self.peers.iter().map(|p| p.match_index()).collect();
		match_indices.push(self.module.storage_handle().last_index());
		if self.module.advance_commit_index(&match_indices).is_some() {
			self.module.apply_committed();
			self.wake_progress();
		}
	}

	/// Appends `pairs` to the leader's log, fans them out immediately,
	/// and blocks (with a deadline, never a spin loop) until a majority
	/// has acknowledged them or leadership is lost.
	pub fn put(self: &Arc<Self>, pairs: Vec<KeyValue>) -> Result<Vec<KeyValue>> {
		if !self.module.is_leader() {
			bail!(ErrorKind::NotLeader);
		}

		if pairs.is_empty() {
			return Ok(Vec::new());
		}

		let mut first_index = 0;
		let mut last_index = 0;
		for pair in pairs {
			let index = self.module.append_command(pair)?;
			if first_index == 0 {
				first_index = index;
			}
			last_index = index;
		}

		self.replicate_once();

		let satisfied = |driver: &Self| {
			!driver.module.is_leader() || (driver.module.commit_index() >= last_index && driver.module.last_applied() >= last_index)
		};

		if !satisfied(self) {
			let guard = self.progress_lock.lock().unwrap();
			let _ = self
				.progress
				.wait_timeout_while(guard, PUT_TIMEOUT, |_| !satisfied(self))
				.unwrap();
		}

		if self.module.commit_index() >= last_index && self.module.last_applied() >= last_index {
			return Ok(self
				.module
				.storage_handle()
				.range(first_index, last_index)
				.into_iter()
				.filter_map(|e| match e.data {
					crate::protos::LogEntryData::Command(kv) => Some(kv),
					_ => None,
				})
				.collect());
		}
		bail!(ErrorKind::MajorityLost);
	}

	pub fn get(&self, key: &Value) -> Result<Value> {
		self.module.get(&key.as_bytes()).ok_or_else(|| Error::from(ErrorKind::KeyNotFound))
	}
}

impl MessageHandler for ConsensusDriver {
	fn handle(&self, msg: Message) -> Message {
		let reply = self.dispatch(msg);
		// Any inbound RPC can demote a leader via a higher term, which
		// may be exactly what a blocked `put` is waiting to learn.
		self.wake_progress();
		reply
	}
}

impl ConsensusDriver {
	fn dispatch(&self, msg: Message) -> Message {
		match msg {
			Message::RequestVote(req) => match self.module.request_vote(&req) {
				Ok(resp) => {
					if resp.vote_granted {
						self.reset_election_timer();
					}
					Message::RequestVoteReply(resp)
				}
				Err(e) => {
					warn!("node {} failed to handle RequestVote: {}", self.id, e);
					Message::RequestVoteReply(crate::protos::RequestVoteResponse {
						term: self.module.current_term(),
						vote_granted: false,
					})
				}
			},
			Message::AppendEntries(req) => match self.module.append_entries(&req) {
				Ok(resp) => {
					if resp.success {
						self.reset_election_timer();
					}
					Message::AppendEntriesReply(resp)
				}
				Err(e) => {
					warn!("node {} failed to handle AppendEntries: {}", self.id, e);
					Message::AppendEntriesReply(crate::protos::AppendEntriesResponse {
						term: self.module.current_term(),
						success: false,
						last_log_index: self.module.storage_handle().last_index(),
					})
				}
			},
			Message::Heartbeat(req) => match self.module.heartbeat(&req) {
				Ok(resp) => {
					if resp.success {
						self.reset_election_timer();
					}
					Message::HeartbeatReply(resp)
				}
				Err(e) => {
					warn!("node {} failed to handle Heartbeat: {}", self.id, e);
					Message::HeartbeatReply(crate::protos::HeartbeatResponse {
						term: self.module.current_term(),
						success: false,
					})
				}
			},
			// Replies arriving here would mean a peer dialed us back on
			// the same connection instead of using the request/response
			// framing; not expected from a conformant client.
			other => other,
		}
	}
}
