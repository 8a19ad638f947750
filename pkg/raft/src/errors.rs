error_chain! {
	foreign_links {
		Io(::std::io::Error);
		Encode(::rmp_serde::encode::Error);
		Decode(::rmp_serde::decode::Error);
		Json(::serde_json::Error);
	}

	errors {
		StaleTerm(seen: u64, current: u64) {
			description("rpc carried a term older than the receiver's current term")
			display("stale term: saw {}, currently at {}", seen, current)
		}

		LogMismatch(index: u64) {
			description("no matching entry at the given prev_log_index")
			display("log mismatch at index {}", index)
		}

		NotLeader {
			description("operation requires the leader role")
			display("not the leader")
		}

		MajorityLost {
			description("leadership or a majority of acknowledgements was lost before a write completed")
			display("majority lost before write completed")
		}

		KeyNotFound {
			description("no value applied at this key")
			display("key not found")
		}

		Transport(msg: String) {
			description("peer dial or call failed")
			display("transport error: {}", msg)
		}

		Storage(msg: String) {
			description("persistence failed")
			display("storage error: {}", msg)
		}

		Config(msg: String) {
			description("configuration could not be loaded")
			display("config error: {}", msg)
		}
	}
}
