//! The public face of one chord node: constructors, the join sequence,
//! and the put/get/status surface a host program drives.

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::info;

use crate::chord_id::{self, ChordId};
use crate::error::{Error, Result};
use crate::identity::NodeIdentity;
use crate::listener;
use crate::peer::{ConnectStatus, PeerLink};
use crate::ring::{KeyRange, RingState};
use crate::stabilizer;

/// One node of the ring: authoritative for its responsibility arc,
/// routing everything else to its peers.
///
/// Dropping the handle does not stop the node; call
/// [`ChordNode::shutdown`] for an orderly stop.
pub struct ChordNode {
	ring: Arc<RingState>,
	listener: JoinHandle<()>,
	stabilizer: JoinHandle<()>,
}

/// Where a value ended up after a [`ChordNode::put`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutOutcome {
	/// The key the value hashes to.
	pub key: ChordId,
	/// The node now holding the value.
	pub node: NodeIdentity,
}

/// The answer to a [`ChordNode::get`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOutcome {
	/// The node the lookup resolved to.
	pub node: NodeIdentity,
	/// The stored bytes, or `None` if that node holds nothing under the
	/// key.
	pub value: Option<Vec<u8>>,
}

/// A point-in-time snapshot of one node's view of the ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
	/// This node.
	pub identity: NodeIdentity,
	/// The clockwise neighbor, when known.
	pub successor: Option<NodeIdentity>,
	/// The counter-clockwise neighbor, when known.
	pub predecessor: Option<NodeIdentity>,
	/// The arc of keys this node answers for.
	pub range: KeyRange,
	/// Every peer this node holds a link to, neighbors included.
	pub peers: Vec<NodeIdentity>,
}

impl ChordNode {
	/// Starts a solo ring: this node owns the whole circle until someone
	/// joins. The node id is drawn at random.
	pub async fn new(ip: Ipv4Addr, port: u16) -> Result<Self> {
		Self::with_id(rand::random(), ip, port).await
	}

	/// Starts a solo ring with an explicitly configured id, for
	/// deployments that must place nodes deterministically.
	pub async fn with_id(id: ChordId, ip: Ipv4Addr, port: u16) -> Result<Self> {
		Self::start(NodeIdentity { id, ip, port }, None).await
	}

	/// Starts a node and joins the ring reachable at the bootstrap
	/// address. Any failure while joining aborts the construction.
	pub async fn new_joining(
		ip: Ipv4Addr,
		port: u16,
		bootstrap_ip: Ipv4Addr,
		bootstrap_port: u16,
	) -> Result<Self> {
		Self::new_joining_with_id(rand::random(), ip, port, bootstrap_ip, bootstrap_port).await
	}

	/// [`ChordNode::new_joining`] with an explicitly configured id.
	pub async fn new_joining_with_id(
		id: ChordId,
		ip: Ipv4Addr,
		port: u16,
		bootstrap_ip: Ipv4Addr,
		bootstrap_port: u16,
	) -> Result<Self> {
		Self::start(NodeIdentity { id, ip, port }, Some((bootstrap_ip, bootstrap_port))).await
	}

	async fn start(local: NodeIdentity, bootstrap: Option<(Ipv4Addr, u16)>) -> Result<Self> {
		let socket = listener::bind(local.port)?;
		let ring = RingState::new(local);
		info!(identity = %local, "node listening");
		let listener = tokio::spawn(listener::run(Arc::clone(&ring), socket));

		if let Some((ip, port)) = bootstrap {
			if let Err(e) = join(&ring, ip, port).await {
				listener.abort();
				return Err(e);
			}
		}

		let stabilizer = tokio::spawn(stabilizer::run(Arc::clone(&ring)));
		Ok(ChordNode { ring, listener, stabilizer })
	}

	/// This node's identity.
	pub fn identity(&self) -> NodeIdentity {
		self.ring.local_identity()
	}

	/// Routes `value` to the node responsible for its key and stores it
	/// there. Re-putting the same value overwrites in place.
	pub async fn put(&self, value: Vec<u8>) -> Result<PutOutcome> {
		let key = chord_id::key_of(&value);
		if self.ring.store_if_owned(value.clone()) {
			return Ok(PutOutcome { key, node: self.identity() });
		}

		let owner = self.ring.search(self.identity().id, key).await;
		if owner.id == self.identity().id {
			// the search dead-ended on us, and the key is not ours
			return Err(Error::ValueRejected);
		}
		let link = self.ring.find_or_create_peer(owner);
		link.ensure_outbound().await;
		if link.add_data(&value).await? {
			Ok(PutOutcome { key, node: owner })
		} else {
			Err(Error::ValueRejected)
		}
	}

	/// Resolves the node responsible for `key` and fetches the value
	/// stored under it, if any.
	pub async fn get(&self, key: ChordId) -> Result<GetOutcome> {
		if self.ring.key_in_my_arc(key) {
			return Ok(GetOutcome { node: self.identity(), value: self.ring.lookup_local(key) });
		}

		let owner = self.ring.search(self.identity().id, key).await;
		if owner.id == self.identity().id {
			// dead end; the local store is the best answer there is
			return Ok(GetOutcome { node: owner, value: self.ring.lookup_local(key) });
		}
		let link = self.ring.find_or_create_peer(owner);
		link.ensure_outbound().await;
		let value = link.request_data(key).await?;
		Ok(GetOutcome { node: owner, value })
	}

	/// Snapshot of the key/value pairs stored on this node.
	pub fn list_local(&self) -> Vec<(ChordId, Vec<u8>)> {
		self.ring.list_local()
	}

	/// This node's current view of the ring.
	pub fn status(&self) -> NodeStatus {
		NodeStatus {
			identity: self.identity(),
			successor: self.ring.successor().map(|link| link.identity()),
			predecessor: self.ring.predecessor().map(|link| link.identity()),
			range: self.ring.current_range(),
			peers: self.ring.known_peers().iter().map(|link| link.identity()).collect(),
		}
	}

	/// Orderly stop: background tasks first, then every peer link.
	pub async fn shutdown(self) {
		self.listener.abort();
		self.stabilizer.abort();
		let _ = self.listener.await;
		let _ = self.stabilizer.await;
		self.ring.shutdown_links().await;
		info!(identity = %self.ring.local_identity(), "node stopped");
	}
}

/// The one-shot bootstrap: ask a known peer who our successor is, adopt
/// it, and leave finding the predecessor to the stabilizer.
async fn join(ring: &Arc<RingState>, ip: Ipv4Addr, port: u16) -> Result<()> {
	// the bootstrap node's id is unknown; zero marks the throwaway link
	let bootstrap = NodeIdentity { id: 0, ip, port };
	let link = PeerLink::new(ring.local_identity(), bootstrap);
	if link.ensure_outbound().await == ConnectStatus::Failed {
		return Err(Error::BootstrapUnreachable(bootstrap.addr()));
	}
	let successor = link
		.search_for_key(ring.local_identity().id)
		.await
		.map_err(|e| Error::BootstrapLookup(Box::new(e)))?;
	link.close_outbound().await;
	info!(successor = %successor, "found our place in the ring");

	let succ_link = ring.find_or_create_peer(successor);
	ring.set_successor(Some(succ_link.clone()));
	// we may already be handed keys by the successor, but must not claim
	// anything it still thinks it owns
	ring.set_range(KeyRange {
		from: successor.id.wrapping_add(1),
		to: ring.local_identity().id,
	});
	succ_link.ensure_outbound().await;
	Ok(())
}
