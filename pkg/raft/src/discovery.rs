use std::net::ToSocketAddrs;

use crate::config::Configuration;
use crate::errors::*;

/// Resolves the cluster's peer addresses from `config`, either from the
/// static `seed_peers` list or by resolving `service_name`'s DNS A-records
/// to `ip:raft_port`, matching whichever discovery mode is configured.
pub fn resolve_peers(config: &Configuration) -> Result<Vec<String>> {
	if !config.peer_discovery {
		return Ok(config.seed_peers.clone());
	}

	let lookup = format!("{}:0", config.service_name);
	let addrs = lookup
		.to_socket_addrs()
		.map_err(|e| ErrorKind::Transport(format!("resolving {}: {}", config.service_name, e)))?;

	let peers = addrs
		.map(|addr| format!("{}:{}", addr.ip(), config.raft_port))
		.collect::<Vec<_>>();

	Ok(peers)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn static_seed_peers_pass_through_unchanged() {
		let mut config = Configuration::default();
		config.peer_discovery = false;
		config.seed_peers = vec!["10.0.0.1:9090".to_string(), "10.0.0.2:9090".to_string()];

		let peers = resolve_peers(&config).unwrap();
		assert_eq!(peers, config.seed_peers);
	}
}
