#![deny(missing_docs)]

//! A peer-to-peer Chord distributed hash table node.
//!
//! Each [`ChordNode`] joins a ring of peers, owns a contiguous arc of a
//! circular 32-bit key space, stores the values that hash into that arc
//! and routes everything else along the ring. Nodes speak a framed
//! binary protocol over plain TCP, keep one dialed and one accepted
//! stream per peer, and heal the ring with a periodic stabilization
//! task as peers come and go.
//!
//! # Examples
//! Start a solo ring and use it as a key/value store:
//! ```no_run
//! use chord_ring::ChordNode;
//!
//! # #[tokio::main]
//! # async fn main() -> chord_ring::Result<()> {
//! let node = ChordNode::new("127.0.0.1".parse().unwrap(), 5000).await?;
//!
//! let receipt = node.put(b"hello".to_vec()).await?;
//! let fetched = node.get(receipt.key).await?;
//! assert_eq!(fetched.value.as_deref(), Some(&b"hello"[..]));
//!
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! To join an existing ring instead, name any live peer as bootstrap:
//! ```no_run
//! # use chord_ring::ChordNode;
//! # #[tokio::main]
//! # async fn main() -> chord_ring::Result<()> {
//! let node = ChordNode::new_joining(
//! 	"127.0.0.1".parse().unwrap(), 5001,
//! 	"127.0.0.1".parse().unwrap(), 5000,
//! ).await?;
//! # Ok(())
//! # }
//! ```

mod chord_id;
mod handler;
mod identity;
mod listener;
mod node;
mod peer;
mod ring;
mod stabilizer;
mod wire;

pub mod error;

pub use chord_id::{highest_id, is_between, key_of, ChordId, KEY_BITS};
pub use error::{Error, Result};
pub use identity::NodeIdentity;
pub use node::{ChordNode, GetOutcome, NodeStatus, PutOutcome};
pub use ring::KeyRange;
pub use wire::MessageType;
