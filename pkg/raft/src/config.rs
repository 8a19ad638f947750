use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::errors::*;

/// Loaded in ascending precedence: built-in defaults, `raft.json` in the
/// working directory if present, then environment variables named by the
/// uppercase form of the field.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Configuration {
	pub kayak_port: String,
	pub raft_port: String,
	pub log_level: String,
	pub max_log_batch: u64,
	pub worker_pool_size: usize,
	pub wait_queue_size: usize,
	pub peer_discovery: bool,
	pub service_name: String,
	pub seed_peers: Vec<String>,
}

impl Default for Configuration {
	fn default() -> Self {
		Configuration {
			kayak_port: "8080".to_string(),
			raft_port: "9090".to_string(),
			log_level: "info".to_string(),
			max_log_batch: 50,
			worker_pool_size: 4,
			wait_queue_size: 1000,
			peer_discovery: false,
			service_name: "kayakdb".to_string(),
			seed_peers: Vec::new(),
		}
	}
}

impl Configuration {
	/// Loads defaults, layers a `raft.json` file if it exists, then
	/// layers environment variable overrides. A missing file is not an
	/// error; a present-but-malformed file is.
	pub fn load(raft_json_path: impl AsRef<Path>) -> Result<Configuration> {
		let mut config = Configuration::default();

		let path = raft_json_path.as_ref();
		if path.exists() {
			let body = fs::read_to_string(path)
				.map_err(|e| ErrorKind::Config(format!("reading {}: {}", path.display(), e)))?;
			config = serde_json::from_str(&body)
				.map_err(|e| ErrorKind::Config(format!("parsing {}: {}", path.display(), e)))?;
		}

		config.apply_env_overrides()?;
		Ok(config)
	}

	fn apply_env_overrides(&mut self) -> Result<()> {
		if let Some(v) = env_var("KAYAK_PORT") {
			self.kayak_port = v;
		}
		if let Some(v) = env_var("RAFT_PORT") {
			self.raft_port = v;
		}
		if let Some(v) = env_var("LOG_LEVEL") {
			self.log_level = v;
		}
		if let Some(v) = env_var("MAX_LOG_BATCH") {
			self.max_log_batch = parse_field("MAX_LOG_BATCH", &v)?;
		}
		if let Some(v) = env_var("WORKER_POOL_SIZE") {
			self.worker_pool_size = parse_field("WORKER_POOL_SIZE", &v)?;
		}
		if let Some(v) = env_var("WAIT_QUEUE_SIZE") {
			self.wait_queue_size = parse_field("WAIT_QUEUE_SIZE", &v)?;
		}
		if let Some(v) = env_var("PEER_DISCOVERY") {
			self.peer_discovery = parse_field("PEER_DISCOVERY", &v)?;
		}
		if let Some(v) = env_var("SERVICE_NAME") {
			self.service_name = v;
		}
		if let Some(v) = env_var("SEED_PEERS") {
			self.seed_peers = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
		}
		Ok(())
	}
}

fn env_var(name: &str) -> Option<String> {
	env::var(name).ok()
}

fn parse_field<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
	value.parse().map_err(|_| Error::from(ErrorKind::Config(format!("{} has an invalid value: {}", name, value))))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_the_documented_values() {
		let config = Configuration::default();
		assert_eq!(config.kayak_port, "8080");
		assert_eq!(config.raft_port, "9090");
		assert_eq!(config.max_log_batch, 50);
		assert_eq!(config.worker_pool_size, 4);
		assert!(!config.peer_discovery);
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let config = Configuration::load("/nonexistent/path/raft.json").unwrap();
		assert_eq!(config.kayak_port, "8080");
	}
}
