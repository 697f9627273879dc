use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::chord_id::ChordId;
use crate::error::{Error, Result};

/// The number of bytes an identity triple occupies on the wire.
pub(crate) const IDENTITY_LEN: usize = 10;

/// Identifies one node in the ring: its id on the circle and the address
/// its listener is reachable at.
///
/// Two identities are equal iff their ids are equal; the address is
/// transport detail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodeIdentity {
	/// Position on the identifier circle.
	pub id: ChordId,
	/// IPv4 address the node's listener is reachable at.
	pub ip: Ipv4Addr,
	/// TCP port the node's listener is bound to.
	pub port: u16,
}

impl NodeIdentity {
	/// The socket address of the remote listener.
	pub fn addr(&self) -> SocketAddr {
		SocketAddr::from((self.ip, self.port))
	}

	/// Encodes the triple for the wire: id, ip octets, port, all in
	/// network byte order.
	pub(crate) fn to_wire(self) -> [u8; IDENTITY_LEN] {
		let mut buf = [0u8; IDENTITY_LEN];
		buf[..4].copy_from_slice(&self.id.to_be_bytes());
		buf[4..8].copy_from_slice(&self.ip.octets());
		buf[8..].copy_from_slice(&self.port.to_be_bytes());
		buf
	}

	/// Decodes a wire triple. The payload must be exactly
	/// [`IDENTITY_LEN`] bytes.
	pub(crate) fn from_wire(buf: &[u8]) -> Result<Self> {
		if buf.len() != IDENTITY_LEN {
			return Err(Error::PayloadSize { expected: IDENTITY_LEN, got: buf.len() });
		}
		let id = ChordId::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
		let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
		let port = u16::from_be_bytes([buf[8], buf[9]]);
		Ok(NodeIdentity { id, ip, port })
	}
}

impl PartialEq for NodeIdentity {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

impl Eq for NodeIdentity {}

impl fmt::Display for NodeIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}@{}:{}", self.id, self.ip, self.port)
	}
}
