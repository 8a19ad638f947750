use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// A unit of work: a closure with no arguments, plus an optional closure
/// run on the same worker thread once the first one returns. The result
/// of the main closure is passed straight into the completion closure, so
/// there is no reflection-based argument packing to get wrong at runtime.
type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounds the concurrency of outbound RPC fan-out. `enqueue` blocks once
/// the wait queue is full, which is the pool's only backpressure
/// mechanism.
pub struct WorkerPool {
	sender: Mutex<Option<SyncSender<Job>>>,
	workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
	pub fn new(worker_count: usize, wait_queue_size: usize) -> Arc<WorkerPool> {
		let (tx, rx) = sync_channel::<Job>(wait_queue_size);
		let rx = Arc::new(Mutex::new(rx));

		let mut workers = Vec::with_capacity(worker_count);
		for id in 0..worker_count {
			let rx = rx.clone();
			workers.push(
				thread::Builder::new()
					.name(format!("kayak-worker-{}", id))
					.spawn(move || worker_loop(rx))
					.expect("failed to spawn worker thread"),
			);
		}

		Arc::new(WorkerPool {
			sender: Mutex::new(Some(tx)),
			workers: Mutex::new(workers),
		})
	}

	/// Runs `job` on a worker thread, invoking `on_done` with its result
	/// once it completes. Blocks the caller if the wait queue is full.
	/// Silently drops the job if the pool has already been stopped.
	pub fn enqueue<R, F, D>(&self, job: F, on_done: D)
	where
		R: Send + 'static,
		F: FnOnce() -> R + Send + 'static,
		D: FnOnce(R) + Send + 'static,
	{
		let boxed: Job = Box::new(move || {
			let result = job();
			on_done(result);
		});

		let guard = self.sender.lock().unwrap();
		if let Some(tx) = guard.as_ref() {
			let _ = tx.send(boxed);
		}
	}

	/// Signals every worker to finish its current job and exit, then
	/// joins them. Jobs still sitting in the queue after this call are
	/// dropped without running.
	pub fn stop(&self) {
		{
			let mut guard = self.sender.lock().unwrap();
			*guard = None;
		}
		let mut workers = self.workers.lock().unwrap();
		for handle in workers.drain(..) {
			let _ = handle.join();
		}
	}
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>) {
	loop {
		let job = {
			let rx = rx.lock().unwrap();
			rx.recv()
		};
		match job {
			Ok(job) => job(),
			Err(_) => return,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	#[test]
	fn jobs_run_and_completion_sees_result() {
		let pool = WorkerPool::new(2, 8);
		let sum = Arc::new(AtomicUsize::new(0));

		for i in 0..10 {
			let sum = sum.clone();
			pool.enqueue(move || i * 2, move |doubled| {
				sum.fetch_add(doubled, Ordering::SeqCst);
			});
		}

		// give the workers a moment to drain; enqueue itself is async.
		thread::sleep(Duration::from_millis(100));
		pool.stop();

		assert_eq!(sum.load(Ordering::SeqCst), (0..10).map(|i| i * 2).sum());
	}
}
