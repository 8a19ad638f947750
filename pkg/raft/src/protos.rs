use std::collections::HashMap;

/// Type used to uniquely identify a single cluster member: the 1-based
/// position of a node within its configured `seed_peers` list, not a
/// randomly generated id (see DESIGN.md for why).
pub type ServerId = u64;

pub type Term = u64;

/// 1-based position in the log. Index 0 means "no entry".
pub type LogIndex = u64;


/// A tagged value stored against a key, or carried as a client's argument.
///
/// Replaces the reflection-driven `Type` polymorphism of the system this
/// was derived from with an explicit union: every place that used to do a
/// runtime type assertion is now a match.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Value {
	Bool(bool),
	/// Stored and compared by its big-endian byte representation so that
	/// two `Number` values never need a sign-aware comparison.
	Number(i64),
	String(String),
	Bytes(Vec<u8>),
}

impl Value {
	pub fn as_string(&self) -> String {
		match self {
			Value::Bool(b) => b.to_string(),
			Value::Number(n) => n.to_string(),
			Value::String(s) => s.clone(),
			Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
		}
	}

	pub fn as_bytes(&self) -> Vec<u8> {
		match self {
			Value::Bool(b) => vec![if *b { 1 } else { 0 }],
			Value::Number(n) => {
				let u: u64 = kayak_core::FlipSign::flip(*n);
				u.to_be_bytes().to_vec()
			}
			Value::String(s) => s.as_bytes().to_vec(),
			Value::Bytes(b) => b.clone(),
		}
	}
}

/// A key/value pair. Doubles as the unit of client write intent and as the
/// payload of a committed log entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KeyValue {
	pub key: Value,
	pub value: Value,
}

/// What a single log entry carries. `Noop` occupies an index without any
/// effect on the key-value map; it is appended once by a new leader so
/// that it has at least one entry of its own term to replicate.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum LogEntryData {
	Noop,
	Command(KeyValue),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
	pub index: LogIndex,
	pub term: Term,
	pub data: LogEntryData,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppendEntriesRequest {
	pub term: Term,
	pub leader_id: ServerId,
	pub prev_log_index: LogIndex,
	pub prev_log_term: Term,
	pub entries: Vec<LogEntry>,
	pub leader_commit: LogIndex,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppendEntriesResponse {
	pub term: Term,
	pub success: bool,
	/// The responder's commit index after applying this call, used by the
	/// leader to advance `match_index` without a second round trip.
	pub last_log_index: LogIndex,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestVoteRequest {
	pub term: Term,
	pub candidate_id: ServerId,
	pub last_log_index: LogIndex,
	pub last_log_term: Term,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestVoteResponse {
	pub term: Term,
	pub vote_granted: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HeartbeatRequest {
	pub term: Term,
	pub leader_id: ServerId,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HeartbeatResponse {
	pub term: Term,
	pub success: bool,
}

/// Envelope placed on the wire by the transport in `rpc.rs`. One frame
/// carries exactly one of these.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Message {
	RequestVote(RequestVoteRequest),
	RequestVoteReply(RequestVoteResponse),
	AppendEntries(AppendEntriesRequest),
	AppendEntriesReply(AppendEntriesResponse),
	Heartbeat(HeartbeatRequest),
	HeartbeatReply(HeartbeatResponse),
}

/// Client-facing request, decoded before it reaches the core (the framing
/// and wire encoding of this layer is out of scope; see SPEC_FULL.md 4.2).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request {
	pub path: String,
	pub data: Vec<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Reply {
	pub status: i32,
	pub message: String,
	pub data: Vec<KeyValue>,
}

impl Reply {
	pub fn ok(data: Vec<KeyValue>) -> Self {
		Reply { status: 0, message: String::new(), data }
	}

	pub fn error(message: impl Into<String>) -> Self {
		Reply { status: 1, message: message.into(), data: Vec::new() }
	}
}

/// A map from raw key bytes to the last value applied at that key.
pub type AppliedMap = HashMap<Vec<u8>, Value>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn number_round_trips_through_as_bytes() {
		let positive = Value::Number(42);
		let negative = Value::Number(-42);

		assert_ne!(positive.as_bytes(), negative.as_bytes());
		assert_eq!(positive.as_bytes().len(), 8);
		assert_eq!(negative.as_bytes().len(), 8);

		let decode = |bytes: &[u8]| -> i64 {
			let mut buf = [0u8; 8];
			buf.copy_from_slice(bytes);
			let u = u64::from_be_bytes(buf);
			kayak_core::FlipSign::flip(u)
		};
		assert_eq!(decode(&positive.as_bytes()), 42);
		assert_eq!(decode(&negative.as_bytes()), -42);
	}

	#[test]
	fn number_preserves_big_endian_ordering_for_comparison() {
		let small = Value::Number(1).as_bytes();
		let large = Value::Number(2).as_bytes();
		assert!(small < large);
	}

	#[test]
	fn bool_as_bytes_is_a_single_byte() {
		assert_eq!(Value::Bool(true).as_bytes(), vec![1]);
		assert_eq!(Value::Bool(false).as_bytes(), vec![0]);
	}

	#[test]
	fn string_as_bytes_and_as_string_round_trip() {
		let v = Value::String("hello".to_string());
		assert_eq!(v.as_bytes(), b"hello".to_vec());
		assert_eq!(v.as_string(), "hello");
	}

	#[test]
	fn bytes_as_string_is_lossy_utf8() {
		let v = Value::Bytes(vec![0xff, 0xfe]);
		assert_eq!(v.as_bytes(), vec![0xff, 0xfe]);
		assert!(v.as_string().contains('\u{FFFD}'));
	}

	#[test]
	fn number_as_string_is_decimal() {
		assert_eq!(Value::Number(-7).as_string(), "-7");
	}
}
