use std::sync::{Arc, Mutex};

use crate::protos::{LogIndex, ServerId};
use crate::rpc::RpcClient;

/// A single cluster member as seen from the local node. The lock
/// serializes calls to this peer so that only one RPC to it is ever in
/// flight at a time and its bookkeeping never races against itself.
pub struct Peer {
	pub id: ServerId,
	pub address: String,
	inner: Mutex<PeerInner>,
}

struct PeerInner {
	client: Option<RpcClient>,
	/// First index not yet known to be present on this peer's log.
	next_index: LogIndex,
	/// Highest index known to be replicated on this peer.
	match_index: LogIndex,
}

impl Peer {
	pub fn new(id: ServerId, address: String) -> Self {
		Peer {
			id,
			address,
			inner: Mutex::new(PeerInner {
				client: None,
				next_index: 1,
				match_index: 0,
			}),
		}
	}

	pub fn next_index(&self) -> LogIndex {
		self.inner.lock().unwrap().next_index
	}

	pub fn match_index(&self) -> LogIndex {
		self.inner.lock().unwrap().match_index
	}

	pub fn set_next_index(&self, value: LogIndex) {
		self.inner.lock().unwrap().next_index = value;
	}

	pub fn decrement_next_index(&self) {
		let mut inner = self.inner.lock().unwrap();
		inner.next_index = inner.next_index.saturating_sub(1).max(1);
	}

	/// Records a successful AppendEntries reply: the follower's commit
	/// index becomes both bookkeeping values at once.
	pub fn record_success(&self, replicated_through: LogIndex) {
		let mut inner = self.inner.lock().unwrap();
		inner.match_index = replicated_through;
		inner.next_index = replicated_through + 1;
	}

	/// Resets bookkeeping for a newly elected leader: nothing is known to
	/// be present on any peer beyond what it already had.
	pub fn reset_for_new_term(&self, last_log_index: LogIndex) {
		let mut inner = self.inner.lock().unwrap();
		inner.next_index = last_log_index + 1;
		inner.match_index = 0;
	}

	/// Runs `f` with the peer's lock held and a mutable reference to its
	/// cached client handle, dialing it lazily if absent. A failed call
	/// should clear the handle so the next call redials.
	pub fn with_client<F, R>(&self, dial: impl FnOnce(&str) -> crate::errors::Result<RpcClient>, f: F) -> crate::errors::Result<R>
	where
		F: FnOnce(&mut RpcClient) -> crate::errors::Result<R>,
	{
		let mut inner = self.inner.lock().unwrap();
		if inner.client.is_none() {
			inner.client = Some(dial(&self.address)?);
		}
		let result = {
			let client = inner.client.as_mut().unwrap();
			f(client)
		};
		if result.is_err() {
			inner.client = None;
		}
		result
	}
}

/// The fixed set of other members in the cluster (excludes the local
/// node). Stored as a plain vector of peer values rather than a graph of
/// heap-allocated cross references between the engine and its peers.
pub struct PeerList {
	peers: Vec<Arc<Peer>>,
}

impl PeerList {
	pub fn new(peers: Vec<Arc<Peer>>) -> Self {
		PeerList { peers }
	}

	pub fn iter(&self) -> impl Iterator<Item = &Arc<Peer>> {
		self.peers.iter()
	}

	pub fn len(&self) -> usize {
		self.peers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.peers.is_empty()
	}

	/// Total cluster size including the local node.
	pub fn cluster_size(&self) -> usize {
		self.peers.len() + 1
	}

	pub fn majority(&self) -> usize {
		self.cluster_size() / 2 + 1
	}
}
