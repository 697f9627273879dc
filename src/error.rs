//! Error and result types for the chord node.

use std::net::SocketAddr;

use crate::wire::MessageType;

/// A `Result` carrying the crate-wide [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while talking to the ring.
///
/// Transport and protocol variants mean the affected stream is no longer
/// usable and has been closed; they never abort the process. Semantic
/// outcomes (a rejected add, an absent key) are ordinary values, not
/// errors.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
	/// An i/o failure on a peer stream.
	#[error("i/o error on peer stream")]
	Io(#[from] std::io::Error),

	/// The remote closed the connection mid-frame.
	#[error("remote node closed the connection")]
	ConnectionClosed,

	/// An outbound operation was attempted without an open send stream.
	#[error("no outbound connection to the remote node")]
	NotConnected,

	/// The remote did not answer within the reply window.
	#[error("timed out waiting for a reply")]
	Timeout,

	/// A frame announced a type byte outside the protocol table.
	///
	/// The payload has already been consumed, so the stream is still
	/// framed; the inbound path may discard the frame and continue.
	#[error("unknown message type {0}")]
	UnknownMessageType(u8),

	/// A reply carried a type we did not ask for.
	#[error("expected {expected} reply, got {got:?}")]
	UnexpectedReply {
		/// What the request was waiting for.
		expected: &'static str,
		/// What actually arrived.
		got: MessageType,
	},

	/// A payload was not the size its message type requires.
	#[error("payload of {got} bytes where {expected} were expected")]
	PayloadSize {
		/// Byte count the message type mandates.
		expected: usize,
		/// Byte count the frame carried.
		got: usize,
	},

	/// A header announced more payload than any peer legitimately sends.
	#[error("frame announced an oversized payload of {0} bytes")]
	OversizedFrame(u32),

	/// The bootstrap node could not be reached while joining.
	#[error("could not reach bootstrap node {0}")]
	BootstrapUnreachable(SocketAddr),

	/// The bootstrap node was reached but the successor lookup failed.
	#[error("successor lookup via bootstrap node failed")]
	BootstrapLookup(#[source] Box<Error>),

	/// No node in the ring accepted the value.
	#[error("no node accepted the value")]
	ValueRejected,
}
