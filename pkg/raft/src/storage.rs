use std::sync::Mutex;

use crate::errors::*;
use crate::protos::{AppliedMap, KeyValue, LogEntry, LogEntryData, LogIndex, ServerId, Term, Value};

/// Narrow capability surface a consensus driver needs from persistence.
/// A production driver is expected to group its writes into a single
/// durable transaction before returning; the in-memory driver below is the
/// conformant baseline used by tests and the example binary.
pub trait StorageDriver: Send + Sync {
	fn current_term(&self) -> Term;
	fn set_current_term(&self, term: Term) -> Result<()>;

	fn voted_for(&self) -> Option<ServerId>;
	fn set_voted_for(&self, id: Option<ServerId>) -> Result<()>;

	/// Appends a single entry (its term already set) and returns the
	/// index it was assigned.
	fn append(&self, term: Term, data: LogEntryData) -> Result<LogIndex>;

	/// Overwrites the log starting at `start_index`, truncating any
	/// conflicting suffix first. Fails if `start_index` would leave a
	/// gap (`start_index > last_index() + 1`).
	fn append_many(&self, start_index: LogIndex, entries: &[LogEntry]) -> Result<()>;

	/// `1 <= index <= last_index()`; anything else returns `None` rather
	/// than reading out of bounds.
	fn get(&self, index: LogIndex) -> Option<LogEntry>;

	/// Inclusive range; empty if `hi < lo` or the log is shorter than `lo`.
	fn range(&self, lo: LogIndex, hi: LogIndex) -> Vec<LogEntry>;

	fn last_index(&self) -> LogIndex;

	/// Term of the entry at `index`, or 0 for index 0.
	fn term_at(&self, index: LogIndex) -> Term {
		if index == 0 {
			0
		} else {
			self.get(index).map(|e| e.term).unwrap_or(0)
		}
	}

	/// Replays the full log into a fresh applied map, used on startup by
	/// a driver backed by durable storage. The in-memory driver has
	/// nothing to replay and returns an empty map.
	fn rebuild_applied_map(&self) -> AppliedMap;
}

struct InMemoryState {
	current_term: Term,
	voted_for: Option<ServerId>,
	log: Vec<LogEntry>,
}

pub struct InMemoryStorage {
	state: Mutex<InMemoryState>,
}

impl InMemoryStorage {
	pub fn new() -> Self {
		InMemoryStorage {
			state: Mutex::new(InMemoryState {
				current_term: 0,
				voted_for: None,
				log: Vec::new(),
			}),
		}
	}
}

impl Default for InMemoryStorage {
	fn default() -> Self {
		Self::new()
	}
}

impl StorageDriver for InMemoryStorage {
	fn current_term(&self) -> Term {
		self.state.lock().unwrap().current_term
	}

	fn set_current_term(&self, term: Term) -> Result<()> {
		self.state.lock().unwrap().current_term = term;
		Ok(())
	}

	fn voted_for(&self) -> Option<ServerId> {
		self.state.lock().unwrap().voted_for
	}

	fn set_voted_for(&self, id: Option<ServerId>) -> Result<()> {
		self.state.lock().unwrap().voted_for = id;
		Ok(())
	}

	fn append(&self, term: Term, data: LogEntryData) -> Result<LogIndex> {
		let mut st = self.state.lock().unwrap();
		let index = st.log.len() as LogIndex + 1;
		st.log.push(LogEntry { index, term, data });
		Ok(index)
	}

	fn append_many(&self, start_index: LogIndex, entries: &[LogEntry]) -> Result<()> {
		let mut st = self.state.lock().unwrap();
		let last = st.log.len() as LogIndex;
		if start_index > last + 1 {
			bail!(ErrorKind::Storage(format!(
				"append_many: gap at index {} (log ends at {})",
				start_index, last
			)));
		}
		st.log.truncate((start_index - 1) as usize);
		st.log.extend_from_slice(entries);
		Ok(())
	}

	fn get(&self, index: LogIndex) -> Option<LogEntry> {
		if index == 0 {
			return None;
		}
		let st = self.state.lock().unwrap();
		if index > st.log.len() as LogIndex {
			return None;
		}
		st.log.get((index - 1) as usize).cloned()
	}

	fn range(&self, lo: LogIndex, hi: LogIndex) -> Vec<LogEntry> {
		if hi < lo {
			return Vec::new();
		}
		let st = self.state.lock().unwrap();
		let last = st.log.len() as LogIndex;
		let hi = hi.min(last);
		if lo == 0 || lo > hi {
			return Vec::new();
		}
		st.log[(lo - 1) as usize..hi as usize].to_vec()
	}

	fn last_index(&self) -> LogIndex {
		self.state.lock().unwrap().log.len() as LogIndex
	}

	fn rebuild_applied_map(&self) -> AppliedMap {
		let st = self.state.lock().unwrap();
		let mut map = AppliedMap::new();
		for entry in st.log.iter() {
			if let LogEntryData::Command(KeyValue { key, value }) = &entry.data {
				map.insert(key.as_bytes(), value_or_clone(value));
			}
		}
		map
	}
}

fn value_or_clone(v: &Value) -> Value {
	v.clone()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn append_assigns_sequential_indices() {
		let s = InMemoryStorage::new();
		assert_eq!(s.append(1, LogEntryData::Noop).unwrap(), 1);
		assert_eq!(s.append(1, LogEntryData::Noop).unwrap(), 2);
		assert_eq!(s.last_index(), 2);
	}

	#[test]
	fn get_out_of_bounds_returns_none() {
		let s = InMemoryStorage::new();
		s.append(1, LogEntryData::Noop).unwrap();
		assert!(s.get(0).is_none());
		assert!(s.get(2).is_none());
		assert!(s.get(1).is_some());
	}

	#[test]
	fn append_many_truncates_conflicting_suffix() {
		let s = InMemoryStorage::new();
		s.append(1, LogEntryData::Noop).unwrap();
		s.append(1, LogEntryData::Noop).unwrap();
		s.append(1, LogEntryData::Noop).unwrap();

		let replacement = vec![LogEntry { index: 2, term: 2, data: LogEntryData::Noop }];
		s.append_many(2, &replacement).unwrap();

		assert_eq!(s.last_index(), 2);
		assert_eq!(s.get(2).unwrap().term, 2);
	}

	#[test]
	fn append_many_rejects_gap() {
		let s = InMemoryStorage::new();
		let entries = vec![LogEntry { index: 5, term: 1, data: LogEntryData::Noop }];
		assert!(s.append_many(5, &entries).is_err());
	}

	#[test]
	fn range_is_inclusive_and_clamped() {
		let s = InMemoryStorage::new();
		for _ in 0..5 {
			s.append(1, LogEntryData::Noop).unwrap();
		}
		assert_eq!(s.range(2, 4).len(), 3);
		assert_eq!(s.range(4, 100).len(), 2);
		assert_eq!(s.range(0, 0).len(), 0);
	}
}
