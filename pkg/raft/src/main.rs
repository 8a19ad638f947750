//! A minimal example binary that wires a `ConsensusDriver` and a
//! `KvService` together against the TCP transport of `rpc.rs`, for local
//! manual testing of the consensus core. It speaks no client wire
//! protocol of its own (that remains out of scope, see SPEC_FULL.md
//! section 1) — the operator drives it with line-oriented commands on
//! stdin instead.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use clap::{App, Arg};

use kayak_raft::config::Configuration;
use kayak_raft::engine::ConsensusDriver;
use kayak_raft::kv::KvService;
use kayak_raft::protos::{Request, Value};
use kayak_raft::storage::InMemoryStorage;

fn main() {
	let matches = App::new("kayakd")
		.about("Example consensus node backed by kayak_raft")
		.arg(
			Arg::with_name("id")
				.long("id")
				.value_name("N")
				.help("1-based position of this node within the configured seed_peers list")
				.required(true)
				.takes_value(true),
		)
		.arg(
			Arg::with_name("config")
				.long("config")
				.value_name("PATH")
				.help("Path to a raft.json configuration file")
				.default_value("raft.json")
				.takes_value(true),
		)
		.get_matches();

	let config = Configuration::load(matches.value_of("config").unwrap()).expect("failed to load configuration");

	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level)).init();

	let id: u64 = matches.value_of("id").unwrap().parse().expect("--id must be a positive integer");

	let peers = kayak_raft::discovery::resolve_peers(&config).expect("failed to resolve peers");
	if id == 0 || (id as usize) > peers.len() {
		panic!("--id must be between 1 and {} (the size of seed_peers)", peers.len());
	}

	let self_address = peers[(id - 1) as usize].clone();
	let peer_addresses: Vec<(u64, String)> = peers
		.iter()
		.enumerate()
		.filter(|(i, _)| *i as u64 != id - 1)
		.map(|(i, addr)| (i as u64 + 1, addr.clone()))
		.collect();

	let storage = Arc::new(InMemoryStorage::new());
	let driver = ConsensusDriver::new(id, storage, peer_addresses, config);
	driver.start(&self_address).expect("failed to start consensus driver");

	let shutdown_driver = driver.clone();
	ctrlc::set_handler(move || shutdown_driver.stop()).expect("failed to install interrupt handler");

	let service = KvService::new(driver);
	run_stdin_loop(&service);
}

/// Accepts `get <key>` and `put <key> <value>` lines on stdin and prints
/// the resulting reply; keys and values are always treated as strings.
/// Just enough of a harness to poke the consensus core by hand.
fn run_stdin_loop(service: &KvService) {
	let stdin = io::stdin();
	print!("> ");
	io::stdout().flush().ok();

	for line in stdin.lock().lines() {
		let line = match line {
			Ok(l) => l,
			Err(_) => break,
		};
		let parts: Vec<&str> = line.trim().split_whitespace().collect();

		let request = match parts.as_slice() {
			["get", key] => Some(Request { path: "/get".to_string(), data: vec![Value::String((*key).to_string())] }),
			["put", key, value] => Some(Request {
				path: "/put".to_string(),
				data: vec![Value::String((*key).to_string()), Value::String((*value).to_string())],
			}),
			[] => None,
			_ => {
				println!("usage: get <key> | put <key> <value>");
				None
			}
		};

		if let Some(request) = request {
			let reply = service.handle(request);
			if reply.status == 0 {
				for kv in &reply.data {
					println!("{} = {}", kv.key.as_string(), kv.value.as_string());
				}
			} else {
				println!("error: {}", reply.message);
			}
		}

		print!("> ");
		io::stdout().flush().ok();
	}
}
