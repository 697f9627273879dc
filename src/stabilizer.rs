//! The periodic task that keeps the ring converged: adopts closer
//! successors as they appear, recovers the degenerate two-node ring,
//! retries parked handoffs and reaps dead peers.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::peer::ConnectStatus;
use crate::ring::RingState;

const STABILIZE_PERIOD: Duration = Duration::from_secs(10);

/// Used for the first tick after startup and after adopting a new
/// successor, so a fresh ring settles without waiting a full period.
const FAST_PERIOD: Duration = Duration::from_secs(1);

pub(crate) async fn run(ring: Arc<RingState>) {
	let mut delay = FAST_PERIOD;
	loop {
		sleep(delay).await;
		delay = STABILIZE_PERIOD;

		// degenerate two-node recovery: with no successor but a live
		// predecessor, the ring is just the two of us
		if ring.successor().is_none() {
			if let Some(pred) = ring.predecessor() {
				info!(peer = %pred.identity(), "no successor, promoting predecessor");
				ring.set_successor(Some(pred.clone()));
				pred.ensure_outbound().await;
			}
		}

		if let Some(succ) = ring.successor() {
			match succ.get_predecessor_from_remote().await {
				Ok(between) => {
					// the successor's predecessor is either us, or a
					// closer successor we have not met yet
					if between.id != ring.local_identity().id {
						info!(old = %succ.identity(), new = %between, "adopting closer successor");
						succ.close_outbound().await;
						let newer = ring.find_or_create_peer(between);
						newer.ensure_outbound().await;
						ring.set_successor(Some(newer));
						delay = FAST_PERIOD;
					}
				}
				Err(e) => {
					warn!(peer = %succ.identity(), error = %e, "successor probe failed");
					if succ.ensure_outbound().await == ConnectStatus::Failed {
						warn!(peer = %succ.identity(), "successor unreachable, clearing slot");
						ring.set_successor(None);
					}
				}
			}
		}

		ring.retry_parked().await;

		if let Some(pred) = ring.predecessor() {
			if !pred.is_alive().await {
				info!(peer = %pred.identity(), "predecessor died");
				ring.clear_predecessor();
				ring.remove_peer(pred.identity().id);
				pred.shutdown().await;
			}
		}

		// reap dead links; collect first, the list must not change under
		// the iteration
		let successor_id = ring.successor().map(|link| link.identity().id);
		let predecessor_id = ring.predecessor().map(|link| link.identity().id);
		let mut dead = Vec::new();
		for link in ring.known_peers() {
			let id = link.identity().id;
			if Some(id) == successor_id || Some(id) == predecessor_id {
				continue;
			}
			if !link.is_alive().await {
				dead.push(link);
			}
		}
		for link in dead {
			info!(peer = %link.identity(), "reaping dead peer");
			ring.remove_peer(link.identity().id);
			link.shutdown().await;
		}
	}
}
