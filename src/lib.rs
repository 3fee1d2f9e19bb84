//! # Chordal - Distributed Hash Table with Dispersed Storage
//!
//! Chordal is a Chord-style peer-to-peer overlay storing an immutable
//! key→value map. Values are never held whole by any peer: each value is
//! erasure-coded into 14 fragments of which any 10 reconstruct it, and the
//! fragments are spread across the key's immediate successors on the ring.
//! Background maintenance keeps routing tables converged and fragments in
//! their proper arc while peers join and leave.
//!
//! ## Quick Start
//!
//! ```ignore
//! // First peer starts a ring, later peers join through any member.
//! let first = Peer::new("127.0.0.1", 5055);
//! first.start_chord().await?;
//!
//! let second = Peer::new("127.0.0.1", 5056);
//! second.join("127.0.0.1:5055").await?;
//!
//! // Store and fetch a value from anywhere on the ring.
//! first.create(Key::hash("greeting"), "hello").await?;
//! let block = second.read(Key::hash("greeting")).await?;
//! assert_eq!(block.decode(), "hello");
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `key` | 128-bit ring identifiers and clockwise interval arithmetic |
//! | `ida` | information dispersal codec (14 fragments, any 10 decode) |
//! | `merkle` | compact sparse Merkle index over stored key sets |
//! | `store` | local key→fragment store backed by the Merkle index |
//! | `routing` | peer descriptors, finger table, successor list |
//! | `messages` | JSON wire protocol types |
//! | `transport` | TCP request server, handler registry, client |
//! | `peer` | the peer state machine, handlers and maintenance loops |
//!
//! ## Consistency Model
//!
//! Keys are create-and-read only. Once the ring has churned, peers that
//! rotated out of a key's successor arc may still hold old fragments, so
//! an update could resurrect stale data; the protocol therefore never
//! updates or deletes user keys. Replication is eventual: after enough
//! maintenance rounds every live key has its fragments back on the
//! successors of the key.

mod ida;
mod key;
mod merkle;
mod messages;
mod peer;
mod routing;
mod store;
mod transport;

pub use ida::{DataBlock, DataFragment, BLOCK_LEN, DECODE_THRESHOLD, FRAGMENT_COUNT};
pub use key::Key;
pub use merkle::MerkleIndex;
pub use peer::{Peer, PeerStatus};
pub use routing::{PeerInfo, NUM_FINGERS};
pub use store::{FragmentStore, StoreError};
