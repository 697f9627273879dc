//! One logical connection to a remote node.
//!
//! A link owns up to two TCP streams: the outbound stream this node
//! dialed (requests leave here, their replies come back here) and the
//! inbound stream the remote dialed (owned by the link's request handler
//! task). The outbound mutex serializes one full request-plus-reply
//! exchange; the inbound path never takes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::chord_id::ChordId;
use crate::error::{Error, Result};
use crate::handler;
use crate::identity::{NodeIdentity, IDENTITY_LEN};
use crate::ring::RingState;
use crate::wire::{self, Header, MessageType};

/// How long a dial may take before the link counts as unreachable.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an outbound caller waits for its reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of [`PeerLink::ensure_outbound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectStatus {
	/// A fresh connection was opened and the `Identify` frame sent.
	Connected,
	/// The outbound stream was already open.
	AlreadyConnected,
	/// The remote could not be reached; the slot stays empty.
	Failed,
}

pub(crate) struct PeerLink {
	/// The owning node's identity, stamped into every outgoing header.
	local: NodeIdentity,
	/// Who is on the other end.
	identity: NodeIdentity,
	/// Held across one full request-plus-reply exchange.
	outbound: tokio::sync::Mutex<Option<TcpStream>>,
	/// True while a request handler task owns an inbound stream.
	inbound_open: AtomicBool,
	handler: Mutex<Option<JoinHandle<()>>>,
}

impl PeerLink {
	pub(crate) fn new(local: NodeIdentity, identity: NodeIdentity) -> Arc<Self> {
		Arc::new(PeerLink {
			local,
			identity,
			outbound: tokio::sync::Mutex::new(None),
			inbound_open: AtomicBool::new(false),
			handler: Mutex::new(None),
		})
	}

	pub(crate) fn identity(&self) -> NodeIdentity {
		self.identity
	}

	pub(crate) fn has_inbound(&self) -> bool {
		self.inbound_open.load(Ordering::SeqCst)
	}

	/// Opens the outbound stream if it is not open yet and identifies
	/// this node to the remote listener.
	pub(crate) async fn ensure_outbound(&self) -> ConnectStatus {
		if self.identity.port == 0 {
			return ConnectStatus::Failed;
		}
		let mut guard = self.outbound.lock().await;
		if guard.is_some() {
			return ConnectStatus::AlreadyConnected;
		}
		let mut stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(self.identity.addr())).await {
			Ok(Ok(stream)) => stream,
			Ok(Err(e)) => {
				debug!(peer = %self.identity, error = %e, "connect failed");
				return ConnectStatus::Failed;
			}
			Err(_) => {
				debug!(peer = %self.identity, "connect timed out");
				return ConnectStatus::Failed;
			}
		};
		let frame = wire::encode_frame(self.local, MessageType::Identify, &[]);
		if let Err(e) = stream.write_all(&frame).await {
			debug!(peer = %self.identity, error = %e, "identify failed");
			return ConnectStatus::Failed;
		}
		*guard = Some(stream);
		ConnectStatus::Connected
	}

	/// Closes the outbound stream. Safe to call when it is not open.
	pub(crate) async fn close_outbound(&self) {
		self.outbound.lock().await.take();
	}

	/// Probes the remote. An open outbound stream is heartbeat-checked;
	/// failing that, an attached inbound stream counts as proof of life.
	pub(crate) async fn is_alive(&self) -> bool {
		let has_outbound = self.outbound.lock().await.is_some();
		if has_outbound {
			match self.request(MessageType::Heartbeat, &[]).await {
				Ok((header, _)) if header.kind == MessageType::HeartbeatReply => return true,
				Ok((header, _)) => {
					warn!(peer = %self.identity, kind = ?header.kind, "unexpected heartbeat reply");
					self.close_outbound().await;
				}
				Err(e) => {
					debug!(peer = %self.identity, error = %e, "heartbeat failed");
				}
			}
		}
		self.has_inbound()
	}

	/// Tells the remote "I am your predecessor" and returns the
	/// predecessor identity it answers with.
	pub(crate) async fn get_predecessor_from_remote(&self) -> Result<NodeIdentity> {
		let payload = self.local.to_wire();
		let (header, body) = self.request(MessageType::UpdatePredecessor, &payload).await?;
		self.expect_identity(header, body, MessageType::Predecessor, "Predecessor").await
	}

	/// Asks the remote to resolve the node responsible for `key`.
	pub(crate) async fn search_for_key(&self, key: ChordId) -> Result<NodeIdentity> {
		let (header, body) = self.request(MessageType::Search, &wire::id_payload(key)).await?;
		self.expect_identity(header, body, MessageType::SearchNodeResponse, "SearchNodeResponse")
			.await
	}

	/// Fetches the value stored under `key` on the remote, if any.
	pub(crate) async fn request_data(&self, key: ChordId) -> Result<Option<Vec<u8>>> {
		let (header, body) = self.request(MessageType::DataRequest, &wire::id_payload(key)).await?;
		match header.kind {
			MessageType::DataAnswer => Ok(Some(body.unwrap_or_default())),
			MessageType::DataNotFound => Ok(None),
			got => {
				self.close_outbound().await;
				Err(Error::UnexpectedReply { expected: "DataAnswer", got })
			}
		}
	}

	/// Hands a value to the remote for storage. `Ok(false)` means the
	/// remote does not consider itself responsible.
	pub(crate) async fn add_data(&self, value: &[u8]) -> Result<bool> {
		let (header, _) = self.request(MessageType::DataAdd, value).await?;
		match header.kind {
			MessageType::DataAddSuccess => Ok(true),
			MessageType::DataAddFailed => Ok(false),
			got => {
				self.close_outbound().await;
				Err(Error::UnexpectedReply { expected: "DataAddSuccess", got })
			}
		}
	}

	/// One synchronous exchange on the outbound stream: send the request,
	/// block for the reply. Any failure closes the stream; the caller
	/// sees a connection-level error and the next `ensure_outbound`
	/// starts from scratch.
	async fn request(&self, kind: MessageType, payload: &[u8]) -> Result<(Header, Option<Vec<u8>>)> {
		let mut guard = self.outbound.lock().await;
		let stream = guard.as_mut().ok_or(Error::NotConnected)?;
		let frame = wire::encode_frame(self.local, kind, payload);
		if let Err(e) = stream.write_all(&frame).await {
			*guard = None;
			return Err(e.into());
		}
		match timeout(REPLY_TIMEOUT, wire::read_frame(stream)).await {
			Ok(Ok(reply)) => Ok(reply),
			Ok(Err(e)) => {
				*guard = None;
				Err(e)
			}
			Err(_) => {
				*guard = None;
				Err(Error::Timeout)
			}
		}
	}

	async fn expect_identity(
		&self,
		header: Header,
		body: Option<Vec<u8>>,
		want: MessageType,
		want_name: &'static str,
	) -> Result<NodeIdentity> {
		if header.kind != want {
			self.close_outbound().await;
			return Err(Error::UnexpectedReply { expected: want_name, got: header.kind });
		}
		match body {
			Some(bytes) => NodeIdentity::from_wire(&bytes),
			None => Err(Error::PayloadSize { expected: IDENTITY_LEN, got: 0 }),
		}
	}

	/// Attaches `stream` as this link's inbound side and (re)starts the
	/// request handler task on it. A previous handler is stopped first.
	pub(crate) fn attach_inbound(self: &Arc<Self>, ring: Weak<RingState>, stream: TcpStream) {
		let mut slot = self.handler.lock().expect("handler slot poisoned");
		if let Some(old) = slot.take() {
			old.abort();
		}
		self.inbound_open.store(true, Ordering::SeqCst);
		let link = Arc::clone(self);
		*slot = Some(tokio::spawn(handler::run(ring, link, stream)));
	}

	pub(crate) fn clear_inbound(&self) {
		self.inbound_open.store(false, Ordering::SeqCst);
	}

	/// Stops the handler task, joins it, and closes both directions.
	pub(crate) async fn shutdown(&self) {
		let handle = self.handler.lock().expect("handler slot poisoned").take();
		if let Some(handle) = handle {
			handle.abort();
			let _ = handle.await;
		}
		self.inbound_open.store(false, Ordering::SeqCst);
		self.close_outbound().await;
	}
}

impl std::fmt::Debug for PeerLink {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PeerLink")
			.field("identity", &self.identity)
			.field("inbound_open", &self.has_inbound())
			.finish()
	}
}
