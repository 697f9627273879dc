//! Ring state: this node's identity, its neighbors on the circle, the
//! responsibility arc and the local value store.
//!
//! All locks here are short-held and never survive across an `.await`;
//! peer links are cloned out of their slots before any network call.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::chord_id::{self, ChordId, KEY_BITS};
use crate::identity::NodeIdentity;
use crate::peer::PeerLink;

/// The contiguous arc of the identifier circle this node is the
/// authoritative owner of, traversed clockwise from `from` to `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
	/// First id the arc covers.
	pub from: ChordId,
	/// Last id the arc covers; always this node's own id.
	pub to: ChordId,
}

impl KeyRange {
	/// The arc covering every id on the circle.
	pub(crate) fn whole_ring() -> Self {
		KeyRange { from: 0, to: chord_id::highest_id() }
	}

	/// Tests membership of `key`, accounting for the wrap past zero.
	pub fn contains(&self, key: ChordId) -> bool {
		if self.from <= self.to {
			key >= self.from && key <= self.to
		} else {
			key >= self.from || key <= self.to
		}
	}
}

pub(crate) struct RingState {
	local: NodeIdentity,
	successor: Mutex<Option<Arc<PeerLink>>>,
	predecessor: Mutex<Option<Arc<PeerLink>>>,
	range: Mutex<KeyRange>,
	/// Values this node is responsible for. Only ring-state code touches
	/// this map, always under its lock.
	store: Mutex<BTreeMap<ChordId, Vec<u8>>>,
	/// Values whose handoff to a new predecessor failed; still served
	/// locally, retried by the stabilizer.
	parked: Mutex<BTreeMap<ChordId, Vec<u8>>>,
	/// Every peer link this node holds, successor and predecessor
	/// included.
	peers: Mutex<Vec<Arc<PeerLink>>>,
	/// Routing shortcut table, one slot per bit plus one. Reserved:
	/// entries point at self until fix-fingers maintenance exists, and
	/// lookups walk successors instead.
	#[allow(dead_code)]
	fingers: Mutex<Vec<NodeIdentity>>,
}

impl RingState {
	pub(crate) fn new(local: NodeIdentity) -> Arc<Self> {
		Arc::new(RingState {
			local,
			successor: Mutex::new(None),
			predecessor: Mutex::new(None),
			range: Mutex::new(KeyRange::whole_ring()),
			store: Mutex::new(BTreeMap::new()),
			parked: Mutex::new(BTreeMap::new()),
			peers: Mutex::new(Vec::new()),
			fingers: Mutex::new(vec![local; (KEY_BITS + 1) as usize]),
		})
	}

	pub(crate) fn local_identity(&self) -> NodeIdentity {
		self.local
	}

	pub(crate) fn current_range(&self) -> KeyRange {
		*self.range.lock().expect("range lock poisoned")
	}

	/// Used once, by the join sequence: until the true predecessor is
	/// known, claim nothing the successor still thinks it owns.
	pub(crate) fn set_range(&self, range: KeyRange) {
		*self.range.lock().expect("range lock poisoned") = range;
	}

	pub(crate) fn key_in_my_arc(&self, key: ChordId) -> bool {
		self.current_range().contains(key)
	}

	pub(crate) fn successor(&self) -> Option<Arc<PeerLink>> {
		self.successor.lock().expect("successor lock poisoned").clone()
	}

	pub(crate) fn set_successor(&self, link: Option<Arc<PeerLink>>) {
		*self.successor.lock().expect("successor lock poisoned") = link;
	}

	pub(crate) fn predecessor(&self) -> Option<Arc<PeerLink>> {
		self.predecessor.lock().expect("predecessor lock poisoned").clone()
	}

	pub(crate) fn clear_predecessor(&self) {
		*self.predecessor.lock().expect("predecessor lock poisoned") = None;
	}

	/// Resolves the node responsible for `key`, forwarding along the
	/// ring when it is not this one. `searching_id` is the node the
	/// request came from; the search is never sent back to it.
	///
	/// Forwarding failures are swallowed: the own identity comes back as
	/// a best-effort answer and the caller observes the wrong-node
	/// outcome on its next step.
	pub(crate) async fn search(&self, searching_id: ChordId, key: ChordId) -> NodeIdentity {
		if self.key_in_my_arc(key) {
			return self.local;
		}

		// the requester may have skipped past a predecessor it does not
		// know about yet; route backwards in that case
		if let Some(pred) = self.predecessor() {
			let pred_id = pred.identity().id;
			if pred_id != searching_id && chord_id::is_between(key, searching_id, pred_id) {
				pred.ensure_outbound().await;
				return match pred.search_for_key(key).await {
					Ok(found) => found,
					Err(e) => {
						warn!(key, peer = %pred.identity(), error = %e, "search via predecessor failed");
						self.local
					}
				};
			}
		}

		if let Some(succ) = self.successor() {
			if succ.identity().id != searching_id {
				return match succ.search_for_key(key).await {
					Ok(found) => found,
					Err(e) => {
						warn!(key, peer = %succ.identity(), error = %e, "search via successor failed");
						self.local
					}
				};
			}
		}

		// nowhere left to forward; answering with ourselves at least
		// lets a joining node establish contact
		self.local
	}

	/// Considers `candidate` as a new predecessor and always answers
	/// with the identity of whoever holds the slot afterwards, so the
	/// caller learns whether it was accepted.
	pub(crate) async fn update_predecessor(&self, candidate: NodeIdentity) -> NodeIdentity {
		let accept = match self.predecessor() {
			None => true,
			Some(current) => {
				let current_id = current.identity().id;
				if current_id > self.local.id {
					// the predecessor arc wraps past zero: the candidate
					// fits either below us or above the old predecessor
					candidate.id < self.local.id || candidate.id > current_id
				} else {
					candidate.id > current_id && candidate.id < self.local.id
				}
			}
		};
		if accept {
			self.set_predecessor(candidate).await;
		}
		match self.predecessor() {
			Some(pred) => pred.identity(),
			None => self.local,
		}
	}

	/// Installs `candidate` as predecessor, narrows the responsibility
	/// arc and hands over every key that fell off it. This is the only
	/// place the arc shrinks.
	pub(crate) async fn set_predecessor(&self, candidate: NodeIdentity) {
		let link = self.find_or_create_peer(candidate);
		*self.predecessor.lock().expect("predecessor lock poisoned") = Some(link.clone());
		let range = KeyRange { from: candidate.id.wrapping_add(1), to: self.local.id };
		self.set_range(range);
		info!(predecessor = %candidate, from = range.from, to = range.to, "predecessor set, arc narrowed");

		// pull the evicted keys out of the store before any network
		// round trip; a concurrent DataAdd for them is now rejected
		let evicted: Vec<(ChordId, Vec<u8>)> = {
			let mut store = self.store.lock().expect("value store poisoned");
			let map = std::mem::take(&mut *store);
			let (keep, evict): (BTreeMap<_, _>, BTreeMap<_, _>) =
				map.into_iter().partition(|(key, _)| range.contains(*key));
			*store = keep;
			evict.into_iter().collect()
		};
		if !evicted.is_empty() {
			self.transfer_pairs(&link, evicted).await;
		}
	}

	/// Sends `pairs` to `link`, parking whatever the remote does not
	/// take so the stabilizer can retry.
	async fn transfer_pairs(&self, link: &Arc<PeerLink>, pairs: Vec<(ChordId, Vec<u8>)>) {
		link.ensure_outbound().await;
		for (key, value) in pairs {
			match link.add_data(&value).await {
				Ok(true) => info!(key, peer = %link.identity(), "key transferred"),
				Ok(false) => {
					warn!(key, peer = %link.identity(), "remote refused transferred key, parking it");
					self.park(key, value);
				}
				Err(e) => {
					warn!(key, peer = %link.identity(), error = %e, "key handoff failed, parking it");
					self.park(key, value);
				}
			}
		}
	}

	fn park(&self, key: ChordId, value: Vec<u8>) {
		self.parked.lock().expect("parked lock poisoned").insert(key, value);
	}

	/// Retries parked handoffs against the current predecessor. Keys the
	/// arc covers again are reclaimed into the store instead.
	pub(crate) async fn retry_parked(&self) {
		let pending: Vec<(ChordId, Vec<u8>)> = {
			let mut parked = self.parked.lock().expect("parked lock poisoned");
			if parked.is_empty() {
				return;
			}
			std::mem::take(&mut *parked).into_iter().collect()
		};

		let range = self.current_range();
		let mut outgoing = Vec::new();
		{
			let mut store = self.store.lock().expect("value store poisoned");
			for (key, value) in pending {
				if range.contains(key) {
					store.insert(key, value);
				} else {
					outgoing.push((key, value));
				}
			}
		}
		if outgoing.is_empty() {
			return;
		}
		match self.predecessor() {
			Some(pred) => self.transfer_pairs(&pred, outgoing).await,
			None => {
				// nobody to hand them to yet; keep them parked
				let mut parked = self.parked.lock().expect("parked lock poisoned");
				parked.extend(outgoing);
			}
		}
	}

	/// Stores `value` iff its key falls on this node's arc. Re-inserts
	/// overwrite.
	pub(crate) fn store_if_owned(&self, value: Vec<u8>) -> bool {
		let key = chord_id::key_of(&value);
		if !self.key_in_my_arc(key) {
			debug!(key, "refusing value outside the arc");
			return false;
		}
		self.store.lock().expect("value store poisoned").insert(key, value);
		true
	}

	/// Looks up a key in the local store, parked handoffs included.
	pub(crate) fn lookup_local(&self, key: ChordId) -> Option<Vec<u8>> {
		if let Some(value) = self.store.lock().expect("value store poisoned").get(&key) {
			return Some(value.clone());
		}
		self.parked.lock().expect("parked lock poisoned").get(&key).cloned()
	}

	/// Snapshot of the local key/value map.
	pub(crate) fn list_local(&self) -> Vec<(ChordId, Vec<u8>)> {
		self.store
			.lock()
			.expect("value store poisoned")
			.iter()
			.map(|(key, value)| (*key, value.clone()))
			.collect()
	}

	/// The single source of truth for "do we already hold a link to this
	/// node": successor first, then predecessor, then the peer list.
	pub(crate) fn find_peer_by_id(&self, id: ChordId) -> Option<Arc<PeerLink>> {
		if let Some(succ) = self.successor() {
			if succ.identity().id == id {
				return Some(succ);
			}
		}
		if let Some(pred) = self.predecessor() {
			if pred.identity().id == id {
				return Some(pred);
			}
		}
		self.peers
			.lock()
			.expect("peer list poisoned")
			.iter()
			.find(|link| link.identity().id == id)
			.cloned()
	}

	pub(crate) fn find_or_create_peer(&self, identity: NodeIdentity) -> Arc<PeerLink> {
		if let Some(link) = self.find_peer_by_id(identity.id) {
			return link;
		}
		let mut peers = self.peers.lock().expect("peer list poisoned");
		if let Some(link) = peers.iter().find(|link| link.identity().id == identity.id) {
			return link.clone();
		}
		let link = PeerLink::new(self.local, identity);
		peers.push(link.clone());
		link
	}

	pub(crate) fn known_peers(&self) -> Vec<Arc<PeerLink>> {
		self.peers.lock().expect("peer list poisoned").clone()
	}

	pub(crate) fn remove_peer(&self, id: ChordId) {
		self.peers
			.lock()
			.expect("peer list poisoned")
			.retain(|link| link.identity().id != id);
	}

	/// Hands a freshly identified inbound stream to the link it belongs
	/// to, creating the link first if the peer is new.
	pub(crate) fn attach_inbound(self: &Arc<Self>, identity: NodeIdentity, stream: TcpStream) {
		let link = self.find_or_create_peer(identity);
		info!(peer = %identity, "inbound stream attached");
		link.attach_inbound(Arc::downgrade(self), stream);
	}

	/// Closes every link: handler tasks stopped, both streams dropped.
	pub(crate) async fn shutdown_links(&self) {
		let links = {
			let mut peers = self.peers.lock().expect("peer list poisoned");
			std::mem::take(&mut *peers)
		};
		self.set_successor(None);
		self.clear_predecessor();
		for link in links {
			link.shutdown().await;
		}
	}
}

#[cfg(test)]
mod test {
	use std::net::Ipv4Addr;

	use super::*;
	use crate::chord_id::key_of;

	fn identity(id: ChordId) -> NodeIdentity {
		// port 1 is never listened on; transfers to these peers fail fast
		NodeIdentity { id, ip: Ipv4Addr::LOCALHOST, port: 1 }
	}

	#[test]
	fn fresh_node_owns_the_whole_ring() {
		let ring = RingState::new(identity(100));
		assert!(ring.key_in_my_arc(0));
		assert!(ring.key_in_my_arc(100));
		assert!(ring.key_in_my_arc(chord_id::highest_id()));
	}

	#[test]
	fn range_wraps_past_zero() {
		let range = KeyRange { from: 4_000_000_000, to: 10 };
		assert!(range.contains(4_000_000_001));
		assert!(range.contains(0));
		assert!(range.contains(10));
		assert!(!range.contains(11));
		assert!(!range.contains(3_999_999_999));
	}

	#[test]
	fn single_id_range() {
		let range = KeyRange { from: 7, to: 7 };
		assert!(range.contains(7));
		assert!(!range.contains(6));
		assert!(!range.contains(8));
	}

	#[tokio::test]
	async fn first_candidate_is_always_accepted() {
		let ring = RingState::new(identity(100));
		let answer = ring.update_predecessor(identity(50)).await;
		assert_eq!(answer.id, 50);
		assert_eq!(ring.current_range(), KeyRange { from: 51, to: 100 });
	}

	#[tokio::test]
	async fn closer_candidate_replaces_the_predecessor() {
		let ring = RingState::new(identity(100));
		ring.update_predecessor(identity(50)).await;
		let answer = ring.update_predecessor(identity(80)).await;
		assert_eq!(answer.id, 80);
		assert_eq!(ring.current_range(), KeyRange { from: 81, to: 100 });
	}

	#[tokio::test]
	async fn farther_candidate_is_declined_but_answered() {
		let ring = RingState::new(identity(100));
		ring.update_predecessor(identity(80)).await;
		let answer = ring.update_predecessor(identity(60)).await;
		assert_eq!(answer.id, 80);
		assert_eq!(ring.current_range(), KeyRange { from: 81, to: 100 });
	}

	#[tokio::test]
	async fn wrapped_predecessor_accepts_candidates_on_both_sides() {
		// own id 100, predecessor 4_000_000_000: the predecessor arc
		// wraps, so both a candidate below us and one above the old
		// predecessor are closer
		let ring = RingState::new(identity(100));
		ring.update_predecessor(identity(4_000_000_000)).await;

		let answer = ring.update_predecessor(identity(4_100_000_000)).await;
		assert_eq!(answer.id, 4_100_000_000);

		let answer = ring.update_predecessor(identity(90)).await;
		assert_eq!(answer.id, 90);

		// and one between the two is now too far back again
		let answer = ring.update_predecessor(identity(4_200_000_000)).await;
		assert_eq!(answer.id, 90);
	}

	#[tokio::test]
	async fn narrowing_the_arc_parks_unreachable_handoffs() {
		let inside = b"stays here".to_vec();
		let outside = b"moves out".to_vec();
		let own = key_of(&inside);
		let pred = key_of(&outside);
		assert_ne!(own, pred);

		let ring = RingState::new(identity(own));
		assert!(ring.store_if_owned(inside.clone()));
		assert!(ring.store_if_owned(outside.clone()));

		// the new predecessor sits exactly on the outgoing key, and its
		// address refuses connections, so the handoff must park
		ring.set_predecessor(identity(pred)).await;

		let stored: Vec<ChordId> = ring.list_local().into_iter().map(|(k, _)| k).collect();
		assert_eq!(stored, vec![own]);
		// parked keys stay readable until the transfer goes through
		assert_eq!(ring.lookup_local(pred), Some(outside));
		for (key, _) in ring.list_local() {
			assert!(ring.key_in_my_arc(key));
		}
	}

	#[tokio::test]
	async fn search_answers_locally_inside_the_arc() {
		let ring = RingState::new(identity(100));
		let found = ring.search(100, 12345).await;
		assert_eq!(found.id, 100);
	}

	#[tokio::test]
	async fn search_without_neighbors_answers_itself() {
		let ring = RingState::new(identity(100));
		ring.set_range(KeyRange { from: 90, to: 100 });
		let found = ring.search(7, 50).await;
		assert_eq!(found.id, 100);
	}

	#[test]
	fn finger_slots_start_pointing_at_self() {
		let ring = RingState::new(identity(100));
		let fingers = ring.fingers.lock().unwrap();
		assert_eq!(fingers.len(), (KEY_BITS + 1) as usize);
		assert!(fingers.iter().all(|f| f.id == 100));
	}

	#[test]
	fn peer_links_are_deduplicated_by_id() {
		let ring = RingState::new(identity(100));
		let first = ring.find_or_create_peer(identity(7));
		let second = ring.find_or_create_peer(identity(7));
		assert!(Arc::ptr_eq(&first, &second));
		assert_eq!(ring.known_peers().len(), 1);
	}
}
