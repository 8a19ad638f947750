//! End-to-end scenarios that drive several `ConsensusDriver`s against each
//! other over real loopback TCP, exercising leader election and log
//! replication the way a deployed cluster would (§8's S2/S3).

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kayak_raft::config::Configuration;
use kayak_raft::engine::ConsensusDriver;
use kayak_raft::kv::KvService;
use kayak_raft::protos::{Request, Value};
use kayak_raft::storage::InMemoryStorage;

fn spin_up_cluster(ports: &[u16]) -> Vec<Arc<ConsensusDriver>> {
	let addresses: Vec<String> = ports.iter().map(|p| format!("127.0.0.1:{}", p)).collect();

	addresses
		.iter()
		.enumerate()
		.map(|(i, addr)| {
			let id = (i + 1) as u64;
			let peer_addresses: Vec<(u64, String)> = addresses
				.iter()
				.enumerate()
				.filter(|(j, _)| *j != i)
				.map(|(j, a)| ((j + 1) as u64, a.clone()))
				.collect();

			let storage = Arc::new(InMemoryStorage::new());
			let driver = ConsensusDriver::new(id, storage, peer_addresses, Configuration::default());
			driver.start(addr).expect("node should bind its RPC listener");
			driver
		})
		.collect()
}

fn wait_for_leader(drivers: &[Arc<ConsensusDriver>], timeout: Duration) -> Option<Arc<ConsensusDriver>> {
	let deadline = Instant::now() + timeout;
	while Instant::now() < deadline {
		if let Some(leader) = drivers.iter().find(|d| d.module.is_leader()) {
			return Some(leader.clone());
		}
		thread::sleep(Duration::from_millis(20));
	}
	None
}

fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
	let deadline = Instant::now() + timeout;
	while Instant::now() < deadline {
		if condition() {
			return true;
		}
		thread::sleep(Duration::from_millis(20));
	}
	condition()
}

#[test]
fn three_node_cluster_elects_a_leader_and_replicates_put() {
	let drivers = spin_up_cluster(&[18101, 18102, 18103]);

	let leader = wait_for_leader(&drivers, Duration::from_secs(3)).expect("cluster should elect exactly one leader");
	assert_eq!(drivers.iter().filter(|d| d.module.is_leader()).count(), 1);

	let service = KvService::new(leader.clone());
	let reply = service.handle(Request {
		path: "/put".to_string(),
		data: vec![Value::String("x".to_string()), Value::Number(7)],
	});
	assert_eq!(reply.status, 0, "put through the leader should succeed: {}", reply.message);

	let converged = wait_until(
		|| {
			drivers
				.iter()
				.all(|d| d.get(&Value::String("x".to_string())).map(|v| v == Value::Number(7)).unwrap_or(false))
		},
		Duration::from_secs(2),
	);
	assert!(converged, "every node should eventually apply the committed entry");

	for driver in &drivers {
		driver.stop();
	}
}

#[test]
fn cluster_elects_a_new_leader_after_the_old_one_stops() {
	let drivers = spin_up_cluster(&[18201, 18202, 18203]);

	let first_leader = wait_for_leader(&drivers, Duration::from_secs(3)).expect("cluster should elect a first leader");
	first_leader.stop();

	let survivors: Vec<Arc<ConsensusDriver>> = drivers.iter().filter(|d| !Arc::ptr_eq(d, &first_leader)).cloned().collect();

	let second_leader =
		wait_for_leader(&survivors, Duration::from_secs(3)).expect("surviving nodes should elect a new leader");
	assert_ne!(second_leader.id, first_leader.id);

	for driver in &survivors {
		driver.stop();
	}
}
