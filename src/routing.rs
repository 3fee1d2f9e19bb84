//! # Routing State
//!
//! Everything a peer knows about the rest of the ring:
//!
//! - [`PeerInfo`] — the descriptor every peer exchanges on the wire;
//! - [`FingerTable`] — 128 power-of-two arcs mapped to the peer succeeding
//!   each arc's lower bound, giving logarithmic lookups;
//! - [`SuccessorList`] — the bounded list of immediate clockwise
//!   neighbours, which doubles as the replica set walked by maintenance.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::key::Key;

/// Finger table depth: one entry per bit of the identifier space.
pub const NUM_FINGERS: usize = 128;

/// Identity record for any peer on the ring.
///
/// `id` and `max_key` are the hash of `addr:port`; `min_key` is one past
/// the predecessor's id once a predecessor is known, and `id + 1` before
/// that (a lone peer owns the whole ring).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(rename = "ID")]
    pub id: Key,
    #[serde(rename = "MIN_KEY")]
    pub min_key: Key,
    #[serde(rename = "MAX_KEY")]
    pub max_key: Key,
    #[serde(rename = "IP_ADDR")]
    pub addr: String,
    #[serde(rename = "PORT")]
    pub port: u16,
    /// Observed round-trip latency. Carried for parity with the wire
    /// format's history but never measured by the protocol.
    #[serde(skip)]
    pub latency: u64,
}

impl PeerInfo {
    /// Descriptor for a peer at `addr:port` that knows no predecessor yet.
    pub fn new(addr: &str, port: u16) -> Self {
        let id = Key::hash(&format!("{addr}:{port}"));
        PeerInfo {
            id,
            min_key: id + 1,
            max_key: id,
            addr: addr.to_string(),
            port,
            latency: 0,
        }
    }

    /// `addr:port` as dialed by the transport.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.min_key == other.min_key
            && self.max_key == other.max_key
            && self.addr == other.addr
            && self.port == other.port
    }
}

impl Eq for PeerInfo {}

impl PartialOrd for PeerInfo {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerInfo {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.id, self.addr, self.port)
    }
}

/// One finger: an arc of the ring and the peer succeeding its lower bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finger {
    pub lower: Key,
    pub upper: Key,
    pub successor: PeerInfo,
}

/// The 128-entry routing table. Entry `i` covers
/// `[start + 2^i, start + 2^(i+1) − 1]` wrapping around the ring, so the
/// arcs double in width and together cover every key except `start`
/// itself.
pub struct FingerTable {
    starting_key: Key,
    entries: Vec<Finger>,
}

impl FingerTable {
    pub fn new(starting_key: Key) -> Self {
        FingerTable { starting_key, entries: Vec::new() }
    }

    /// The arc the `n`-th entry should cover (valid for `n < NUM_FINGERS`
    /// whether or not the entry exists yet).
    pub fn nth_range(&self, n: usize) -> (Key, Key) {
        debug_assert!(n < NUM_FINGERS);
        let width = 1u128 << n;
        let lower = self.starting_key + width;
        let upper = lower + (width - 1);
        (lower, upper)
    }

    /// First entry whose arc contains the key, scanning in order.
    pub fn lookup(&self, key: Key) -> Option<&PeerInfo> {
        self.entries
            .iter()
            .find(|finger| key.in_between(finger.lower, finger.upper, true))
            .map(|finger| &finger.successor)
    }

    /// Append a finger during initial population.
    pub fn push(&mut self, finger: Finger) {
        self.entries.push(finger);
    }

    /// Drop every entry ahead of a fresh initialization.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Replace the successor of an existing entry.
    pub fn set_successor(&mut self, n: usize, successor: PeerInfo) {
        if let Some(finger) = self.entries.get_mut(n) {
            finger.successor = successor;
        }
    }

    /// Repoint every finger whose lower bound falls inside the new peer's
    /// owned range.
    pub fn adjust(&mut self, new_peer: &PeerInfo) {
        for finger in &mut self.entries {
            if finger.lower.in_between(new_peer.min_key, new_peer.max_key, true) {
                finger.successor = new_peer.clone();
            }
        }
    }

    pub fn get(&self, n: usize) -> Option<&Finger> {
        self.entries.get(n)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Display for FingerTable {
    /// Render the table collating adjacent arcs with the same successor;
    /// the raw 128 rows are unreadable while the ring is small.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut collated: Vec<Finger> = Vec::new();
        for finger in &self.entries {
            match collated.last_mut() {
                Some(last) if last.successor.id == finger.successor.id => {
                    last.upper = finger.upper;
                }
                _ => collated.push(finger.clone()),
            }
        }

        writeln!(f, "{:-<110}", "")?;
        writeln!(
            f,
            "| {:<34}| {:<34}| {:<34}|",
            "LOWER BOUND", "UPPER BOUND", "SUCCESSOR"
        )?;
        writeln!(f, "{:-<110}", "")?;
        for finger in &collated {
            writeln!(
                f,
                "| {:<34}| {:<34}| {:<34}|",
                finger.lower.to_hex(),
                finger.upper.to_hex(),
                format!("{}:{}", finger.successor.addr, finger.successor.port),
            )?;
        }
        write!(f, "{:-<110}", "")
    }
}

/// Bounded list of the owner's immediate clockwise successors, ordered by
/// ring position starting just past the owner, with no duplicate ids.
#[derive(Debug, Clone)]
pub struct SuccessorList {
    owner: Key,
    max_entries: usize,
    peers: Vec<PeerInfo>,
}

impl SuccessorList {
    pub fn new(owner: Key, max_entries: usize) -> Self {
        SuccessorList { owner, max_entries, peers: Vec::new() }
    }

    /// Rebuild from a walk of the ring, keeping clockwise order and
    /// dropping the owner itself, duplicates and overflow.
    pub fn from_peers(
        owner: Key,
        max_entries: usize,
        peers: impl IntoIterator<Item = PeerInfo>,
    ) -> Self {
        let mut list = SuccessorList::new(owner, max_entries);
        for peer in peers {
            list.insert(peer);
        }
        list
    }

    /// Insert a peer at its clockwise position.
    ///
    /// The list is a clockwise sequence starting at the owner: the
    /// candidate slots in at the first position where it falls between the
    /// previous entry (initially the owner) and the current one. Walking
    /// off the end with spare capacity appends. Duplicates, the owner
    /// itself, and peers past a full list are rejected; an interior
    /// insertion into a full list drops the furthest entry.
    pub fn insert(&mut self, new_peer: PeerInfo) -> bool {
        if self.max_entries == 0 || new_peer.id == self.owner {
            return false;
        }

        let mut previous = self.owner;
        let mut position = None;
        for (i, current) in self.peers.iter().enumerate() {
            if new_peer.id == current.id {
                return false;
            }
            if new_peer.id.in_between(previous, current.id, true) {
                position = Some(i);
                break;
            }
            previous = current.id;
        }

        match position {
            Some(i) => {
                self.peers.insert(i, new_peer);
                if self.peers.len() > self.max_entries {
                    self.peers.pop();
                }
                true
            }
            None if self.peers.len() < self.max_entries => {
                self.peers.push(new_peer);
                true
            }
            None => false,
        }
    }

    pub fn first(&self) -> Option<&PeerInfo> {
        self.peers.first()
    }

    pub fn get(&self, n: usize) -> Option<&PeerInfo> {
        self.peers.get(n)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
