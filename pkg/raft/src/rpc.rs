use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::warn;

use crate::errors::*;
use crate::protos::Message;

/// Reads one length-prefixed, MessagePack-encoded `Message` off `stream`.
fn read_frame(stream: &mut TcpStream) -> Result<Message> {
	let mut len_buf = [0u8; 4];
	stream.read_exact(&mut len_buf)?;
	let len = u32::from_be_bytes(len_buf) as usize;

	let mut body = vec![0u8; len];
	stream.read_exact(&mut body)?;

	let msg = rmp_serde::from_read_ref(&body)?;
	Ok(msg)
}

/// Writes one length-prefixed, MessagePack-encoded `Message` to `stream`.
fn write_frame(stream: &mut TcpStream, msg: &Message) -> Result<()> {
	let body = rmp_serde::to_vec(msg)?;
	let len = body.len() as u32;
	stream.write_all(&len.to_be_bytes())?;
	stream.write_all(&body)?;
	stream.flush()?;
	Ok(())
}

/// A reusable, lazily dialed connection to one peer's RPC listen address.
/// Owned by that peer under its lock (see `peer.rs`); a failed call drops
/// the connection so the next call redials.
pub struct RpcClient {
	stream: TcpStream,
}

impl RpcClient {
	pub fn dial(address: &str, timeout: Duration) -> Result<RpcClient> {
		let stream = TcpStream::connect(address)
			.map_err(|e| ErrorKind::Transport(format!("dial {}: {}", address, e)))?;
		stream.set_read_timeout(Some(timeout)).ok();
		stream.set_write_timeout(Some(timeout)).ok();
		stream.set_nodelay(true).ok();
		Ok(RpcClient { stream })
	}

	pub fn call(&mut self, request: &Message) -> Result<Message> {
		write_frame(&mut self.stream, request)
			.map_err(|e| Error::from(ErrorKind::Transport(format!("send: {}", e))))?;
		read_frame(&mut self.stream).map_err(|e| Error::from(ErrorKind::Transport(format!("recv: {}", e))))
	}
}

/// A handler invoked once per received `Message`, returning the reply to
/// send back on the same connection. Implemented by the consensus engine.
pub trait MessageHandler: Send + Sync {
	fn handle(&self, msg: Message) -> Message;
}

/// Listens for peer connections and dispatches each frame on a connection
/// to `handler`, one thread per accepted connection, matching the
/// thread-per-peer-link model the rest of the engine assumes.
pub struct RpcServer;

/// A running listener. Dropping this without calling `stop` leaves the
/// listener thread running; `stop` is the only supported shutdown path.
pub struct RpcServerHandle {
	shutdown: Arc<AtomicBool>,
	local_addr: std::net::SocketAddr,
	listener_thread: Option<JoinHandle<()>>,
}

impl RpcServerHandle {
	/// Stops accepting new connections and waits for the listener thread
	/// to exit. `accept()` has no timeout of its own, so shutdown works by
	/// flipping the flag and then dialing the listener once ourselves to
	/// unblock it.
	pub fn stop(&mut self) {
		self.shutdown.store(true, Ordering::SeqCst);
		let _ = TcpStream::connect_timeout(&self.local_addr, Duration::from_millis(200));
		if let Some(thread) = self.listener_thread.take() {
			let _ = thread.join();
		}
	}
}

impl RpcServer {
	pub fn start(bind_address: &str, handler: Arc<dyn MessageHandler>) -> Result<RpcServerHandle> {
		let listener = TcpListener::bind(bind_address)
			.map_err(|e| ErrorKind::Transport(format!("bind {}: {}", bind_address, e)))?;
		let local_addr = listener
			.local_addr()
			.map_err(|e| ErrorKind::Transport(format!("local_addr: {}", e)))?;

		let shutdown = Arc::new(AtomicBool::new(false));
		let thread_shutdown = shutdown.clone();

		let listener_thread = std::thread::Builder::new()
			.name("kayak-rpc-listener".into())
			.spawn(move || {
				for incoming in listener.incoming() {
					if thread_shutdown.load(Ordering::SeqCst) {
						return;
					}
					let stream = match incoming {
						Ok(s) => s,
						Err(_) => continue,
					};
					let handler = handler.clone();
					std::thread::spawn(move || serve_connection(stream, handler));
				}
			})
			.expect("failed to spawn rpc listener thread");

		Ok(RpcServerHandle { shutdown, local_addr, listener_thread: Some(listener_thread) })
	}
}

fn serve_connection(mut stream: TcpStream, handler: Arc<dyn MessageHandler>) {
	loop {
		let msg = match read_frame(&mut stream) {
			Ok(m) => m,
			Err(e) => {
				warn!("closing peer connection after frame decode failure: {}", e);
				return;
			}
		};
		let reply = handler.handle(msg);
		if let Err(e) = write_frame(&mut stream, &reply) {
			warn!("closing peer connection after write failure: {}", e);
			return;
		}
	}
}
