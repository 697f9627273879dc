// not every test binary uses every helper
#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::time::Duration;

use chord_ring::{ChordId, ChordNode};
use tokio::time::sleep;

pub const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Installs a subscriber so `RUST_LOG`-less test runs still show the
/// nodes talking. Safe to call from every test.
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_max_level(tracing::Level::INFO)
		.with_test_writer()
		.try_init();
}

/// Spawns one node per id on consecutive ports starting at `base_port`.
/// The first node hosts a fresh ring, the rest bootstrap off it.
pub async fn spawn_ring(base_port: u16, ids: &[ChordId]) -> Vec<ChordNode> {
	let mut nodes = Vec::new();
	for (i, id) in ids.iter().enumerate() {
		let port = base_port + i as u16;
		let node = if i == 0 {
			ChordNode::with_id(*id, LOCALHOST, port)
				.await
				.expect("node should start")
		} else {
			ChordNode::new_joining_with_id(*id, LOCALHOST, port, LOCALHOST, base_port)
				.await
				.expect("node should join the ring")
		};
		nodes.push(node);
		sleep(Duration::from_millis(250)).await;
	}
	nodes
}

pub async fn shutdown_all(nodes: Vec<ChordNode>) {
	for node in nodes {
		node.shutdown().await;
	}
}
