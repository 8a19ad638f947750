use std::sync::Arc;

use crate::engine::ConsensusDriver;
use crate::errors::*;
use crate::protos::{KeyValue, Reply, Request};

/// Translates a decoded client `Request` into a call against the
/// consensus driver and shapes the result as a `Reply`. The wire framing
/// that produces the `Request` in the first place is out of scope here;
/// this is the boundary the core actually owns.
pub struct KvService {
	driver: Arc<ConsensusDriver>,
}

impl KvService {
	pub fn new(driver: Arc<ConsensusDriver>) -> Self {
		KvService { driver }
	}

	pub fn handle(&self, request: Request) -> Reply {
		match request.path.as_str() {
			"/get" => self.handle_get(request),
			"/put" => self.handle_put(request),
			other => Reply::error(format!("unrecognized path: {}", other)),
		}
	}

	fn handle_get(&self, request: Request) -> Reply {
		let key = match request.data.into_iter().next() {
			Some(k) => k,
			None => return Reply::error("/get requires exactly one key"),
		};

		match self.driver.get(&key) {
			Ok(value) => Reply::ok(vec![KeyValue { key, value }]),
			Err(e) => Reply::error(e.to_string()),
		}
	}

	fn handle_put(&self, request: Request) -> Reply {
		if request.data.len() % 2 != 0 || request.data.is_empty() {
			return Reply::error("/put requires one or more key/value pairs");
		}

		let mut pairs = Vec::with_capacity(request.data.len() / 2);
		let mut iter = request.data.into_iter();
		while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
			pairs.push(KeyValue { key, value });
		}

		match self.driver.put(pairs) {
			Ok(applied) => Reply::ok(applied),
			Err(e) => Reply::error(e.to_string()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Configuration;
	use crate::protos::Value;
	use crate::storage::InMemoryStorage;
	use std::sync::Arc;
	use std::time::Duration;

	fn single_node_service() -> KvService {
		let storage = Arc::new(InMemoryStorage::new());
		let driver = ConsensusDriver::new(1, storage, Vec::new(), Configuration::default());
		driver.start("127.0.0.1:0").unwrap();
		// Give the election timer thread a moment to elect this lone node.
		std::thread::sleep(Duration::from_millis(400));
		KvService::new(driver)
	}

	#[test]
	fn put_then_get_round_trips() {
		let service = single_node_service();

		let put_reply = service.handle(Request {
			path: "/put".to_string(),
			data: vec![Value::String("x".to_string()), Value::Number(1)],
		});
		assert_eq!(put_reply.status, 0);

		let get_reply = service.handle(Request {
			path: "/get".to_string(),
			data: vec![Value::String("x".to_string())],
		});
		assert_eq!(get_reply.status, 0);
		assert_eq!(get_reply.data[0].value, Value::Number(1));
	}

	#[test]
	fn get_missing_key_is_an_error_reply() {
		let service = single_node_service();
		let reply = service.handle(Request {
			path: "/get".to_string(),
			data: vec![Value::String("missing".to_string())],
		});
		assert_ne!(reply.status, 0);
	}

	#[test]
	fn unknown_path_is_an_error_reply() {
		let service = single_node_service();
		let reply = service.handle(Request { path: "/delete".to_string(), data: vec![] });
		assert_ne!(reply.status, 0);
	}
}
