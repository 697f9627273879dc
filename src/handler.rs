//! The per-link request handler: reads framed requests off a link's
//! inbound stream and answers them on that same stream.
//!
//! Replies never travel on the outbound stream, so this path never takes
//! the outbound mutex. Malformed frames are logged and dropped; only a
//! closed or desynchronized stream ends the task.

use std::sync::{Arc, Weak};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::Error;
use crate::identity::{NodeIdentity, IDENTITY_LEN};
use crate::peer::PeerLink;
use crate::ring::RingState;
use crate::wire::{self, MessageType};

pub(crate) async fn run(ring: Weak<RingState>, link: Arc<PeerLink>, mut stream: TcpStream) {
	debug!(peer = %link.identity(), "request handler started");
	loop {
		let (header, payload) = match wire::read_frame(&mut stream).await {
			Ok(frame) => frame,
			Err(Error::UnknownMessageType(byte)) => {
				warn!(peer = %link.identity(), byte, "discarding frame of unknown type");
				continue;
			}
			Err(Error::ConnectionClosed) => {
				debug!(peer = %link.identity(), "remote node closed the connection");
				break;
			}
			Err(e) => {
				warn!(peer = %link.identity(), error = %e, "inbound stream failed");
				break;
			}
		};

		// the node may be shutting down while frames are still arriving
		let ring = match ring.upgrade() {
			Some(ring) => ring,
			None => break,
		};
		let local = ring.local_identity();

		let reply = match header.kind {
			MessageType::Heartbeat => wire::encode_frame(local, MessageType::HeartbeatReply, &[]),

			MessageType::Search => {
				let key = match wire::parse_id(payload.as_deref().unwrap_or_default()) {
					Ok(key) => key,
					Err(e) => {
						warn!(peer = %link.identity(), error = %e, "bad search payload");
						continue;
					}
				};
				let found = ring.search(header.sender.id, key).await;
				wire::encode_frame(local, MessageType::SearchNodeResponse, &found.to_wire())
			}

			MessageType::UpdatePredecessor => {
				let candidate = match payload
					.as_deref()
					.ok_or(Error::PayloadSize { expected: IDENTITY_LEN, got: 0 })
					.and_then(NodeIdentity::from_wire)
				{
					Ok(candidate) => candidate,
					Err(e) => {
						warn!(peer = %link.identity(), error = %e, "bad predecessor payload");
						continue;
					}
				};
				let current = ring.update_predecessor(candidate).await;
				wire::encode_frame(local, MessageType::Predecessor, &current.to_wire())
			}

			MessageType::DataAdd => match payload {
				Some(value) => {
					let stored = ring.store_if_owned(value);
					let kind = if stored {
						MessageType::DataAddSuccess
					} else {
						MessageType::DataAddFailed
					};
					wire::encode_frame(local, kind, &[])
				}
				None => {
					warn!(peer = %link.identity(), "data add without a payload");
					continue;
				}
			},

			MessageType::DataRequest => {
				let key = match wire::parse_id(payload.as_deref().unwrap_or_default()) {
					Ok(key) => key,
					Err(e) => {
						warn!(peer = %link.identity(), error = %e, "bad data request payload");
						continue;
					}
				};
				match ring.lookup_local(key) {
					Some(value) => wire::encode_frame(local, MessageType::DataAnswer, &value),
					None => wire::encode_frame(local, MessageType::DataNotFound, &[]),
				}
			}

			// replies, Identify re-sends and the reserved TellPredecessor
			// have no business arriving here
			other => {
				warn!(peer = %link.identity(), kind = ?other, "discarding unexpected request");
				continue;
			}
		};

		if let Err(e) = stream.write_all(&reply).await {
			warn!(peer = %link.identity(), error = %e, "failed to answer request");
			break;
		}
	}
	link.clear_inbound();
	debug!(peer = %link.identity(), "request handler stopped");
}
