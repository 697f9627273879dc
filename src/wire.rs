//! The framed binary protocol spoken between nodes.
//!
//! Every message starts with a fixed header: the sender's identity
//! triple, a one-byte message type and a four-byte payload length, all
//! multi-byte fields in network byte order. The payload, when present,
//! is opaque to this module.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::chord_id::ChordId;
use crate::error::{Error, Result};
use crate::identity::{NodeIdentity, IDENTITY_LEN};

/// Fixed header size: identity triple + type byte + payload length.
pub(crate) const HEADER_LEN: usize = IDENTITY_LEN + 1 + 4;

/// Upper bound on an announced payload. Anything larger is a framing
/// error, not an allocation.
pub(crate) const MAX_DATA_LEN: u32 = 16 * 1024 * 1024;

/// The message types of the protocol, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
	/// First frame on every dialed connection; the sender block names the dialer.
	Identify = 1,
	/// Liveness probe.
	Heartbeat = 2,
	/// Answer to [`MessageType::Heartbeat`].
	HeartbeatReply = 3,
	/// Look up the node responsible for a key id.
	Search = 4,
	/// Answer to [`MessageType::Search`]: one identity triple.
	SearchNodeResponse = 5,
	/// Fetch the value stored under a key id.
	DataRequest = 6,
	/// Answer to [`MessageType::DataRequest`]: the value bytes.
	DataAnswer = 7,
	/// Answer to [`MessageType::DataRequest`]: no such key here.
	DataNotFound = 8,
	/// Store a value on the receiver.
	DataAdd = 9,
	/// Answer to [`MessageType::DataAdd`]: receiver is not responsible.
	DataAddFailed = 10,
	/// Answer to [`MessageType::DataAdd`]: stored.
	DataAddSuccess = 11,
	/// "I am your predecessor": one identity triple.
	UpdatePredecessor = 12,
	/// Reserved: ask for the receiver's predecessor without proposing one.
	TellPredecessor = 13,
	/// Answer to 12/13: the receiver's current predecessor triple.
	Predecessor = 14,
}

impl MessageType {
	pub(crate) fn from_u8(byte: u8) -> Option<Self> {
		Some(match byte {
			1 => MessageType::Identify,
			2 => MessageType::Heartbeat,
			3 => MessageType::HeartbeatReply,
			4 => MessageType::Search,
			5 => MessageType::SearchNodeResponse,
			6 => MessageType::DataRequest,
			7 => MessageType::DataAnswer,
			8 => MessageType::DataNotFound,
			9 => MessageType::DataAdd,
			10 => MessageType::DataAddFailed,
			11 => MessageType::DataAddSuccess,
			12 => MessageType::UpdatePredecessor,
			13 => MessageType::TellPredecessor,
			14 => MessageType::Predecessor,
			_ => return None,
		})
	}
}

/// The decoded fixed header of one frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
	pub sender: NodeIdentity,
	pub kind: MessageType,
	pub data_len: u32,
}

/// Builds one contiguous frame. The sender block is always stamped from
/// the owning node's identity.
pub(crate) fn encode_frame(sender: NodeIdentity, kind: MessageType, payload: &[u8]) -> Vec<u8> {
	let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
	buf.extend_from_slice(&sender.to_wire());
	buf.push(kind as u8);
	buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	buf.extend_from_slice(payload);
	buf
}

/// Reads one full frame off `stream`, blocking until header and payload
/// have arrived or the stream closes.
///
/// A short read is fatal for the link. An unknown type byte is reported
/// only after the payload has been consumed, so the stream stays framed
/// and the caller may keep reading.
pub(crate) async fn read_frame<S>(stream: &mut S) -> Result<(Header, Option<Vec<u8>>)>
where
	S: AsyncRead + Unpin,
{
	let mut head = [0u8; HEADER_LEN];
	read_fully(stream, &mut head).await?;

	let sender = NodeIdentity::from_wire(&head[..IDENTITY_LEN])?;
	let type_byte = head[IDENTITY_LEN];
	let data_len = u32::from_be_bytes([
		head[IDENTITY_LEN + 1],
		head[IDENTITY_LEN + 2],
		head[IDENTITY_LEN + 3],
		head[IDENTITY_LEN + 4],
	]);
	if data_len > MAX_DATA_LEN {
		return Err(Error::OversizedFrame(data_len));
	}

	let payload = if data_len > 0 {
		let mut buf = vec![0u8; data_len as usize];
		read_fully(stream, &mut buf).await?;
		Some(buf)
	} else {
		None
	};

	let kind = MessageType::from_u8(type_byte).ok_or(Error::UnknownMessageType(type_byte))?;
	Ok((Header { sender, kind, data_len }, payload))
}

async fn read_fully<S>(stream: &mut S, buf: &mut [u8]) -> Result<()>
where
	S: AsyncRead + Unpin,
{
	match stream.read_exact(buf).await {
		Ok(_) => Ok(()),
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::ConnectionClosed),
		Err(e) => Err(e.into()),
	}
}

/// Encodes a key id as a search/request payload.
pub(crate) fn id_payload(id: ChordId) -> [u8; 4] {
	id.to_be_bytes()
}

/// Decodes a key id payload.
pub(crate) fn parse_id(payload: &[u8]) -> Result<ChordId> {
	if payload.len() != 4 {
		return Err(Error::PayloadSize { expected: 4, got: payload.len() });
	}
	Ok(ChordId::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]))
}

#[cfg(test)]
mod test {
	use std::net::Ipv4Addr;

	use super::*;

	fn sender() -> NodeIdentity {
		NodeIdentity { id: 0x0102_0304, ip: Ipv4Addr::new(127, 0, 0, 1), port: 5000 }
	}

	#[tokio::test]
	async fn round_trip_every_type_and_size() {
		let types = [
			MessageType::Identify,
			MessageType::Heartbeat,
			MessageType::HeartbeatReply,
			MessageType::Search,
			MessageType::SearchNodeResponse,
			MessageType::DataRequest,
			MessageType::DataAnswer,
			MessageType::DataNotFound,
			MessageType::DataAdd,
			MessageType::DataAddFailed,
			MessageType::DataAddSuccess,
			MessageType::UpdatePredecessor,
			MessageType::TellPredecessor,
			MessageType::Predecessor,
		];
		for kind in types {
			for len in [0usize, 1, 2, 4, 12, 1024, 65535] {
				let payload = vec![0xA5u8; len];
				let frame = encode_frame(sender(), kind, &payload);
				let mut cursor = frame.as_slice();
				let (header, decoded) = read_frame(&mut cursor).await.unwrap();
				assert_eq!(header.kind, kind);
				assert_eq!(header.sender, sender());
				assert_eq!(header.data_len as usize, len);
				assert_eq!(decoded.unwrap_or_default(), payload);
			}
		}
	}

	#[tokio::test]
	async fn header_layout_is_fixed() {
		let frame = encode_frame(sender(), MessageType::Search, &id_payload(9));
		assert_eq!(frame.len(), HEADER_LEN + 4);
		// id, ip and port in network byte order
		assert_eq!(&frame[..4], &[1, 2, 3, 4]);
		assert_eq!(&frame[4..8], &[127, 0, 0, 1]);
		assert_eq!(&frame[8..10], &5000u16.to_be_bytes());
		assert_eq!(frame[10], 4);
		assert_eq!(&frame[11..15], &4u32.to_be_bytes());
	}

	#[tokio::test]
	async fn unknown_type_consumes_the_payload() {
		let mut frame = encode_frame(sender(), MessageType::Search, &[1, 2, 3, 4]);
		frame[IDENTITY_LEN] = 99;
		// append a well-formed frame behind the bad one
		frame.extend_from_slice(&encode_frame(sender(), MessageType::Heartbeat, &[]));
		let mut cursor = frame.as_slice();
		match read_frame(&mut cursor).await {
			Err(Error::UnknownMessageType(99)) => {}
			other => panic!("unexpected outcome: {:?}", other.map(|(h, _)| h.kind)),
		}
		let (header, _) = read_frame(&mut cursor).await.unwrap();
		assert_eq!(header.kind, MessageType::Heartbeat);
	}

	#[tokio::test]
	async fn truncated_frame_is_fatal() {
		let frame = encode_frame(sender(), MessageType::DataAdd, &[0u8; 16]);
		let mut cursor = &frame[..frame.len() - 1];
		assert!(matches!(read_frame(&mut cursor).await, Err(Error::ConnectionClosed)));
	}

	#[tokio::test]
	async fn oversized_announcement_is_rejected() {
		let mut frame = encode_frame(sender(), MessageType::DataAdd, &[]);
		frame[HEADER_LEN - 4..].copy_from_slice(&(MAX_DATA_LEN + 1).to_be_bytes());
		let mut cursor = frame.as_slice();
		assert!(matches!(read_frame(&mut cursor).await, Err(Error::OversizedFrame(_))));
	}
}
