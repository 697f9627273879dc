//! Accepts TCP connections and turns identified streams into the
//! inbound side of peer links.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::ring::RingState;
use crate::wire::{self, MessageType};

const BACKLOG: u32 = 20;

/// How long a fresh connection may dawdle before its `Identify` frame.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Binds the listening socket on all interfaces with `SO_REUSEADDR` set,
/// so a restarted node can reclaim its port immediately.
pub(crate) fn bind(port: u16) -> std::io::Result<TcpListener> {
	let socket = TcpSocket::new_v4()?;
	socket.set_reuseaddr(true)?;
	socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
	socket.listen(BACKLOG)
}

/// The accept loop. Each accepted stream is handed to a short-lived task
/// so a dawdling dialer cannot stall further accepts.
pub(crate) async fn run(ring: Arc<RingState>, listener: TcpListener) {
	loop {
		match listener.accept().await {
			Ok((stream, remote)) => {
				let ring = Arc::clone(&ring);
				tokio::spawn(identify(ring, stream, remote));
			}
			Err(e) => {
				warn!(error = %e, "accept failed");
			}
		}
	}
}

/// Waits for the one frame every dialer owes us. Anything but a timely
/// `Identify` drops the stream.
async fn identify(ring: Arc<RingState>, mut stream: TcpStream, remote: SocketAddr) {
	let header = match timeout(IDENTIFY_TIMEOUT, wire::read_frame(&mut stream)).await {
		Ok(Ok((header, _))) => header,
		Ok(Err(e)) => {
			warn!(%remote, error = %e, "connection dropped before identifying");
			return;
		}
		Err(_) => {
			warn!(%remote, "connection never identified");
			return;
		}
	};
	if header.kind != MessageType::Identify {
		warn!(%remote, kind = ?header.kind, "first frame was not an identify, closing");
		return;
	}
	debug!(%remote, peer = %header.sender, "dialer identified");
	ring.attach_inbound(header.sender, stream);
}
