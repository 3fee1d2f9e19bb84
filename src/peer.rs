//! # Peer Core
//!
//! A [`Peer`] is one member of the ring: it owns the transport server, the
//! local fragment store and the routing state, answers the wire protocol's
//! commands, and runs the maintenance rounds that keep routing and
//! replication converged while membership churns.
//!
//! ## Lifecycle
//!
//! `Unjoined → Starting → Active → Leaving → Dead`. A peer becomes active
//! either by starting a fresh ring ([`Peer::start_chord`]) or by joining an
//! existing one through any member ([`Peer::join`]). `Dead` is terminal and
//! rejects every operation.
//!
//! ## Replica placement
//!
//! `create` disperses a value into `FRAGMENT_COUNT` fragments and places
//! the i-th fragment on the i-th successor of the key; `read` walks the
//! same arc collecting distinct fragment indices until `DECODE_THRESHOLD`
//! are in hand. Maintenance continually repairs that layout: *global*
//! maintenance pushes fragments that drifted outside their key's successor
//! arc back in, *local* maintenance tells each successor which keys it
//! should be holding so it can refill the gaps.
//!
//! ## Locking
//!
//! All mutable state sits behind one mutex which is never held across an
//! outbound request; two peers notifying each other simultaneously
//! therefore cannot deadlock. The identity of the requesting client is
//! threaded through handlers as a parameter, never stored on the peer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use rand::seq::SliceRandom;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::ida::{DataBlock, DataFragment, DECODE_THRESHOLD, FRAGMENT_COUNT};
use crate::key::Key;
use crate::messages::{Command, Request, Response};
use crate::routing::{Finger, FingerTable, PeerInfo, SuccessorList, NUM_FINGERS};
use crate::store::FragmentStore;
use crate::transport::{handler, send_request, HandlerMap, Server};

/// Delay between starting a ring and the first maintenance round.
const MAINTENANCE_START_DELAY: Duration = Duration::from_secs(2);

/// Pause at the top of every maintenance round.
const MAINTENANCE_ROUND_DELAY: Duration = Duration::from_secs(1);

/// How often the ring starter seeds a fresh maintenance round. Rounds
/// propagate successor to successor and a round dies with the peer holding
/// it, so the starter re-seeds on a slow cycle.
const MAINTENANCE_RESEED_INTERVAL: Duration = Duration::from_secs(15);

/// Poll interval while waiting for the first successor to appear.
const SUCCESSOR_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period between binding the server and first using it.
const SERVER_GRACE: Duration = Duration::from_millis(10);

/// Where a peer is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Constructed, no server bound.
    Unjoined,
    /// Server coming up, ring entry in progress.
    Starting,
    /// Serving requests. The predecessor may still be unknown.
    Active,
    /// Graceful departure in progress.
    Leaving,
    /// Terminal; every operation is rejected.
    Dead,
}

/// Mutable peer state. One lock covers all of it; see the module notes.
struct PeerState {
    status: PeerStatus,
    min_key: Key,
    predecessor: Option<PeerInfo>,
    successors: SuccessorList,
    fingers: FingerTable,
    store: FragmentStore,
}

struct PeerInner {
    id: Key,
    addr: String,
    port: u16,
    state: Mutex<PeerState>,
    server: Mutex<Option<Server>>,
    /// Serializes finger-table population; a notify-triggered
    /// initialization and a stabilize round must not interleave pushes.
    populate_lock: tokio::sync::Mutex<()>,
}

/// One locally-run ring member. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Build a peer for `addr:port`. Nothing is bound until
    /// [`Peer::start_chord`] or [`Peer::join`].
    pub fn new(addr: &str, port: u16) -> Self {
        let id = Key::hash(&format!("{addr}:{port}"));
        debug!(%id, addr, port, "created peer");
        Peer {
            inner: Arc::new(PeerInner {
                id,
                addr: addr.to_string(),
                port,
                state: Mutex::new(PeerState {
                    status: PeerStatus::Unjoined,
                    min_key: id + 1,
                    predecessor: None,
                    successors: SuccessorList::new(id, DECODE_THRESHOLD),
                    fingers: FingerTable::new(id),
                    store: FragmentStore::new(),
                }),
                server: Mutex::new(None),
                populate_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> Key {
        self.inner.id
    }

    /// Current descriptor: identity is fixed, `min_key` tracks the
    /// predecessor.
    pub fn info(&self) -> PeerInfo {
        let state = self.inner.state.lock().unwrap();
        PeerInfo {
            id: self.inner.id,
            min_key: state.min_key,
            max_key: self.inner.id,
            addr: self.inner.addr.clone(),
            port: self.inner.port,
            latency: 0,
        }
    }

    pub fn status(&self) -> PeerStatus {
        self.inner.state.lock().unwrap().status
    }

    pub fn predecessor(&self) -> Option<PeerInfo> {
        self.inner.state.lock().unwrap().predecessor.clone()
    }

    pub fn successor_count(&self) -> usize {
        self.inner.state.lock().unwrap().successors.len()
    }

    pub fn stored_key_count(&self) -> usize {
        self.inner.state.lock().unwrap().store.len()
    }

    // ------------------------------------------------------------------
    // Ring entry and departure
    // ------------------------------------------------------------------

    /// Start a fresh ring as its only member: this peer owns every key.
    pub async fn start_chord(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.status = PeerStatus::Starting;
            state.min_key = self.inner.id + 1;
        }
        info!(id = %self.inner.id, "starting ring");

        self.start_server().await?;
        sleep(SERVER_GRACE).await;
        self.inner.state.lock().unwrap().status = PeerStatus::Active;

        // The starter keeps seeding maintenance rounds; each round then
        // propagates around the ring on its own.
        let peer = self.clone();
        tokio::spawn(async move {
            sleep(MAINTENANCE_START_DELAY).await;
            loop {
                if peer.status() == PeerStatus::Dead {
                    break;
                }
                peer.run_general_maintenance().await;
                sleep(MAINTENANCE_RESEED_INTERVAL).await;
            }
        });
        Ok(())
    }

    /// Join an existing ring through any member at `gateway` (`ip:port`).
    pub async fn join(&self, gateway: &str) -> Result<()> {
        let (gateway_addr, gateway_port) = parse_endpoint(gateway)?;
        self.inner.state.lock().unwrap().status = PeerStatus::Starting;
        info!(id = %self.inner.id, gateway, "joining ring");

        self.start_server().await?;
        sleep(SERVER_GRACE).await;

        // The gateway resolves our would-be predecessor.
        let join_request = Request::new(Command::Join { new_peer: self.info() });
        let reply = send_request(gateway_addr, gateway_port, &join_request)
            .await
            .map_err(|err| anyhow!("join via {gateway} failed: {err}"))?;
        if !reply.success {
            bail!("join rejected: {}", reply.errors.unwrap_or_default());
        }
        let predecessor = reply
            .predecessor
            .context("JOIN reply carried no predecessor")?;
        info!(predecessor = %predecessor.id, "joined ring");
        {
            let mut state = self.inner.state.lock().unwrap();
            state.min_key = predecessor.id + 1;
            state.predecessor = Some(predecessor);
            state.status = PeerStatus::Active;
        }

        self.populate_finger_table(true).await?;

        // Our predecessors fold us into their successor lists; the
        // immediate successor learns it has a new predecessor.
        let this = self.info();
        for target in self
            .get_n_predecessors(self.inner.id, DECODE_THRESHOLD)
            .await?
        {
            if let Err(err) = self.notify(&this, &target).await {
                debug!(target = %target.id, error = %err, "join notification failed");
            }
        }

        let walk = self.get_n_successors(self.inner.id, DECODE_THRESHOLD).await?;
        {
            let mut state = self.inner.state.lock().unwrap();
            state.successors =
                SuccessorList::from_peers(self.inner.id, DECODE_THRESHOLD, walk);
        }
        let first = self.first_successor();
        if let Some(first) = first {
            if let Err(err) = self.notify(&this, &first).await {
                debug!(target = %first.id, error = %err, "successor notification failed");
            }
        }
        Ok(())
    }

    /// Leave gracefully: hand the owned range to the successor, point the
    /// predecessor's fingers past us, then shut down.
    pub async fn leave(&self) -> Result<()> {
        self.ensure_live()?;
        let (predecessor, first_successor, min_key) = {
            let mut state = self.inner.state.lock().unwrap();
            state.status = PeerStatus::Leaving;
            (
                state.predecessor.clone(),
                state.successors.first().cloned(),
                state.min_key,
            )
        };
        let predecessor = predecessor.context("cannot leave: no predecessor known")?;
        let first_successor = first_successor.context("cannot leave: no successor known")?;
        info!(id = %self.inner.id, "leaving ring");

        let for_successor = Command::Leave {
            new_pred: Some(predecessor.clone()),
            new_min: Some(min_key + 1),
            new_succ: None,
        };
        // The predecessor repoints fingers at our successor, widened over
        // the range we are giving up.
        let mut widened = first_successor.clone();
        widened.min_key = min_key;
        let for_predecessor = Command::Leave {
            new_pred: None,
            new_min: None,
            new_succ: Some(widened),
        };

        if let Err(err) = self.make_request(for_successor, &first_successor).await {
            debug!(error = %err, "leave notification to successor failed");
        }
        if let Err(err) = self.make_request(for_predecessor, &predecessor).await {
            debug!(error = %err, "leave notification to predecessor failed");
        }

        self.kill();
        Ok(())
    }

    /// Immediate shutdown, graceful to in-flight sessions only. Also the
    /// "failure" switch for tests.
    pub fn kill(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.status = PeerStatus::Dead;
            debug!(
                id = %self.inner.id,
                range_start = %state.min_key,
                range_end = %self.inner.id,
                predecessor = ?state.predecessor.as_ref().map(|p| p.id),
                successors = state.successors.len(),
                stored_keys = state.store.len(),
                "peer shut down"
            );
        }
        if let Some(server) = self.inner.server.lock().unwrap().take() {
            server.kill();
        }
    }

    // ------------------------------------------------------------------
    // Data operations
    // ------------------------------------------------------------------

    /// Disperse `value` under `key` across the key's successors. Succeeds
    /// once at least [`DECODE_THRESHOLD`] fragments are placed.
    pub async fn create(&self, key: Key, value: &str) -> Result<()> {
        self.ensure_live()?;
        let block = DataBlock::from_text(value, true)?;

        let successors = self.get_n_successors(key, FRAGMENT_COUNT).await?;
        if successors.len() < DECODE_THRESHOLD {
            bail!(
                "insufficient replicas: only {} successors reachable",
                successors.len()
            );
        }

        let mut placed = 0;
        for (fragment, successor) in block.fragments().iter().zip(successors.iter()) {
            if successor.id == self.inner.id {
                let mut state = self.inner.state.lock().unwrap();
                match state.store.insert(key, fragment.clone()) {
                    Ok(()) => placed += 1,
                    Err(err) => debug!(%key, error = %err, "local placement skipped"),
                }
            } else if self.create_fragment(successor, key, fragment, None).await {
                placed += 1;
            }
        }

        if placed < DECODE_THRESHOLD {
            bail!("insufficient replicas: placed {placed} of {DECODE_THRESHOLD} required");
        }
        info!(%key, placed, "created key");
        Ok(())
    }

    /// Gather fragments from the key's successor arc and reconstruct the
    /// block. Needs [`DECODE_THRESHOLD`] distinct fragment indices.
    pub async fn read(&self, key: Key) -> Result<DataBlock> {
        self.ensure_live()?;
        let successors = self.get_n_successors(key, FRAGMENT_COUNT).await?;

        let mut gathered: BTreeMap<usize, DataFragment> = BTreeMap::new();
        for successor in &successors {
            if gathered.len() >= DECODE_THRESHOLD {
                break;
            }
            if successor.id == self.inner.id {
                let local: Vec<DataFragment> = {
                    let state = self.inner.state.lock().unwrap();
                    state
                        .store
                        .lookup(key)
                        .map(|fragments| fragments.to_vec())
                        .unwrap_or_default()
                };
                for fragment in local {
                    gathered.entry(fragment.index).or_insert(fragment);
                }
            } else {
                match self.read_fragment(successor, key).await {
                    Ok(fragment) => {
                        gathered.entry(fragment.index).or_insert(fragment);
                    }
                    // This successor simply may not hold the key; move on.
                    Err(err) => debug!(peer = %successor.id, %key, error = %err, "fragment fetch failed"),
                }
            }
        }

        if gathered.len() < DECODE_THRESHOLD {
            bail!(
                "insufficient replicas: gathered {} distinct fragments of {DECODE_THRESHOLD} required",
                gathered.len()
            );
        }
        let fragments: Vec<DataFragment> =
            gathered.into_values().take(DECODE_THRESHOLD).collect();
        Ok(DataBlock::from_fragments(&fragments)?)
    }

    // ------------------------------------------------------------------
    // Successor and predecessor resolution
    // ------------------------------------------------------------------

    /// The peer succeeding `key`. Resolves locally when the key falls in
    /// our stored range, otherwise forwards through the finger table and
    /// retries once through the predecessor if the finger target is
    /// unreachable.
    async fn get_successor(&self, key: Key, current_client: Option<Key>) -> Result<PeerInfo> {
        if self.stored_locally(key) {
            return Ok(self.info());
        }

        let command = Command::GetSuccessor { key };
        let first_try = self
            .forward_request(command.clone(), key, current_client)
            .await;
        let reply = match first_try {
            Ok(reply) if reply.success && reply.peer().is_some() => reply,
            _ => {
                let predecessor = self
                    .predecessor()
                    .context("successor lookup failed and no predecessor to retry through")?;
                self.make_request(command, &predecessor).await?
            }
        };
        if !reply.success {
            bail!("GET_SUCC failed: {}", reply.errors.unwrap_or_default());
        }
        reply.peer().context("GET_SUCC reply carried no descriptor")
    }

    /// The peer preceding `key`. A peer with no predecessor answers for
    /// the whole ring with itself.
    async fn get_predecessor(&self, key: Key, current_client: Option<Key>) -> Result<PeerInfo> {
        let (predecessor, stored) = {
            let state = self.inner.state.lock().unwrap();
            (
                state.predecessor.clone(),
                key.in_between(state.min_key, self.inner.id, true),
            )
        };
        let Some(predecessor) = predecessor else {
            return Ok(self.info());
        };
        if stored {
            return Ok(predecessor);
        }

        let reply = self
            .forward_request(Command::GetPredecessor { key }, key, current_client)
            .await?;
        if !reply.success {
            bail!("GET_PRED failed: {}", reply.errors.unwrap_or_default());
        }
        reply.peer().context("GET_PRED reply carried no descriptor")
    }

    /// Walk clockwise from `key`, collecting up to `n` successors. The
    /// walk stops early once it loops back to where it started, so a small
    /// ring yields fewer entries than asked for.
    async fn get_n_successors(&self, key: Key, n: usize) -> Result<Vec<PeerInfo>> {
        let mut found = Vec::with_capacity(n);
        let mut previous = key;
        for i in 0..n {
            let successor = self.get_successor(previous + 1, None).await?;
            found.push(successor.clone());
            if previous == key && i != 0 {
                break;
            }
            previous = successor.id;
        }
        Ok(found)
    }

    /// Counter-clockwise mirror of [`Peer::get_n_successors`].
    async fn get_n_predecessors(&self, key: Key, n: usize) -> Result<Vec<PeerInfo>> {
        let mut found = Vec::with_capacity(n);
        let mut previous = key;
        for i in 0..n {
            let predecessor = self.get_predecessor(previous - 1, None).await?;
            found.push(predecessor.clone());
            if previous == key && i != 0 {
                break;
            }
            previous = predecessor.id;
        }
        Ok(found)
    }

    /// Route a request towards the peer responsible for `key`.
    ///
    /// When the finger target is the requesting client (it is blocked
    /// waiting on us) or ourselves (the table is momentarily stale), the
    /// request detours through the predecessor — or through the first
    /// successor when the client *is* the predecessor.
    async fn forward_request(
        &self,
        command: Command,
        key: Key,
        current_client: Option<Key>,
    ) -> Result<Response> {
        let (target, predecessor, first_successor) = {
            let state = self.inner.state.lock().unwrap();
            let target = state
                .fingers
                .lookup(key)
                .cloned()
                .ok_or_else(|| anyhow!("no finger covers key {key}"))?;
            (
                target,
                state.predecessor.clone(),
                state.successors.first().cloned(),
            )
        };

        let target_is_busy = current_client == Some(target.id);
        let target_is_self = target.id == self.inner.id;
        if target_is_busy || target_is_self {
            let client_is_predecessor = current_client.is_some()
                && predecessor.as_ref().map(|peer| peer.id) == current_client;
            let substitute = if client_is_predecessor {
                first_successor.context("no successor to detour through")?
            } else {
                predecessor.context("no predecessor to detour through")?
            };
            return self.make_request(command, &substitute).await;
        }

        self.make_request(command, &target).await
    }

    // ------------------------------------------------------------------
    // Per-fragment operations
    // ------------------------------------------------------------------

    /// Ask `recipient` to store a fragment. Returns placement success;
    /// sending to ourselves or back to the requesting client is always a
    /// non-placement.
    async fn create_fragment(
        &self,
        recipient: &PeerInfo,
        key: Key,
        fragment: &DataFragment,
        current_client: Option<Key>,
    ) -> bool {
        if Some(recipient.id) == current_client || recipient.id == self.inner.id {
            return false;
        }
        let command = Command::CreateFragment {
            key,
            fragment: fragment.to_string(),
        };
        match self.make_request(command, recipient).await {
            Ok(reply) => reply.success,
            Err(err) => {
                debug!(peer = %recipient.id, %key, error = %err, "CREATE_FRAG failed");
                false
            }
        }
    }

    /// Fetch the fragment `recipient` holds for `key`.
    async fn read_fragment(&self, recipient: &PeerInfo, key: Key) -> Result<DataFragment> {
        let reply = self
            .make_request(Command::ReadFragment { key }, recipient)
            .await?;
        if !reply.success {
            bail!("READ_FRAG failed: {}", reply.errors.unwrap_or_default());
        }
        let text = reply.fragment.context("READ_FRAG reply carried no fragment")?;
        Ok(DataFragment::parse(&text)?)
    }

    /// Tell `target` that `new_peer` has entered the ring.
    async fn notify(&self, new_peer: &PeerInfo, target: &PeerInfo) -> Result<bool> {
        debug!(target = %target.id, subject = %new_peer.id, "sending notify");
        let command = Command::Notify {
            recipient: target.id,
            new_peer: new_peer.clone(),
        };
        let reply = self.make_request(command, target).await?;
        Ok(reply.success)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Rebuild the finger table. `initialize` resolves entries through the
    /// predecessor and previously-resolved fingers (used before the table
    /// can answer for itself); update mode refreshes entries in place. An
    /// empty table always takes the initialize path.
    async fn populate_finger_table(&self, initialize: bool) -> Result<()> {
        let _guard = self.inner.populate_lock.lock().await;

        let initialize = initialize || self.inner.state.lock().unwrap().fingers.is_empty();
        debug!(initialize, "populating finger table");
        if initialize {
            self.inner.state.lock().unwrap().fingers.clear();
        }

        for n in 0..NUM_FINGERS {
            let (lower, upper) = {
                let state = self.inner.state.lock().unwrap();
                state.fingers.nth_range(n)
            };

            if initialize {
                if self.stored_locally(lower) {
                    let finger = Finger { lower, upper, successor: self.info() };
                    self.inner.state.lock().unwrap().fingers.push(finger);
                    continue;
                }

                // The table cannot route yet, so entry 0 asks the
                // predecessor and each later entry asks the peer the
                // previous entry resolved to.
                let target = {
                    let state = self.inner.state.lock().unwrap();
                    if n == 0 {
                        state
                            .predecessor
                            .clone()
                            .context("finger initialization requires a predecessor")?
                    } else {
                        state
                            .fingers
                            .get(n - 1)
                            .map(|finger| finger.successor.clone())
                            .context("previous finger entry missing")?
                    }
                };
                let reply = self
                    .make_request(Command::GetSuccessor { key: lower }, &target)
                    .await?;
                let successor = reply
                    .success
                    .then(|| reply.peer())
                    .flatten()
                    .with_context(|| format!("GET_SUCC for finger {n} failed"))?;
                let finger = Finger { lower, upper, successor };
                self.inner.state.lock().unwrap().fingers.push(finger);
            } else {
                let successor = if n == 0 {
                    self.get_successor(lower, None).await?
                } else {
                    let target = {
                        let state = self.inner.state.lock().unwrap();
                        state
                            .fingers
                            .get(n - 1)
                            .map(|finger| finger.successor.clone())
                            .context("previous finger entry missing")?
                    };
                    let refreshed = self
                        .make_request(Command::GetSuccessor { key: lower }, &target)
                        .await
                        .ok()
                        .filter(|reply| reply.success)
                        .and_then(|reply| reply.peer());
                    match refreshed {
                        Some(successor) => successor,
                        // Unreachable or failed: resolve through ourselves.
                        None => self.get_successor(lower, None).await?,
                    }
                };
                self.inner
                    .state
                    .lock()
                    .unwrap()
                    .fingers
                    .set_successor(n, successor);
            }
        }
        Ok(())
    }

    /// Restore routing state: refresh every finger and rebuild the
    /// successor list from a live walk of the ring.
    async fn stabilize(&self) -> Result<()> {
        self.populate_finger_table(false).await?;
        let walk = self
            .get_n_successors(self.inner.id, DECODE_THRESHOLD)
            .await?;
        let mut state = self.inner.state.lock().unwrap();
        state.successors = SuccessorList::from_peers(self.inner.id, DECODE_THRESHOLD, walk);
        Ok(())
    }

    /// Walk the whole ring; any locally-stored key whose successor arc no
    /// longer includes this peer is forwarded to a peer in that arc and
    /// dropped here.
    async fn run_global_maintenance(&self) -> Result<()> {
        let mut current = self.inner.id;
        loop {
            let successors = self.get_n_successors(current, DECODE_THRESHOLD).await?;
            let Some(first) = successors.first().cloned() else {
                break;
            };

            let held_here = successors.iter().any(|peer| peer.id == self.inner.id);
            if !held_here {
                // The whole segment up to the next peer shares the same
                // successor arc, so everything we store in it is misplaced.
                let misplaced = {
                    let state = self.inner.state.lock().unwrap();
                    state.store.read_range(current, first.id)
                };
                for (key, fragments) in misplaced {
                    let mut all_placed = true;
                    for fragment in &fragments {
                        let mut placed = false;
                        for successor in &successors {
                            if self.create_fragment(successor, key, fragment, None).await {
                                placed = true;
                                break;
                            }
                        }
                        all_placed &= placed;
                    }
                    if all_placed {
                        let mut state = self.inner.state.lock().unwrap();
                        if state.store.delete(key).is_ok() {
                            debug!(%key, "repatriated misplaced key");
                        }
                    }
                }
            }

            current = first.id;
            if self.stored_locally(current) {
                // Walked back into our own range: the ring is covered.
                break;
            }
        }
        Ok(())
    }

    /// Announce our owned keys to every successor so each can refill the
    /// fragments it is missing.
    async fn run_local_maintenance(&self) {
        let (successors, min_key) = {
            let state = self.inner.state.lock().unwrap();
            (
                state.successors.iter().cloned().collect::<Vec<_>>(),
                state.min_key,
            )
        };
        for successor in successors {
            if let Err(err) = self.synchronize(&successor, min_key, self.inner.id).await {
                debug!(peer = %successor.id, error = %err, "synchronize failed");
            }
        }
    }

    /// Send `successor` the key identifiers we hold in `[lower, upper]`.
    async fn synchronize(&self, successor: &PeerInfo, lower: Key, upper: Key) -> Result<()> {
        let keys: Vec<Key> = {
            let state = self.inner.state.lock().unwrap();
            state
                .store
                .read_range(lower, upper)
                .into_iter()
                .map(|(key, _)| key)
                .collect()
        };
        if keys.is_empty() {
            return Ok(());
        }
        // The reply carries nothing we need.
        self.make_request(Command::Synchronize { keys }, successor)
            .await?;
        Ok(())
    }

    /// Rebuild a key we should hold but do not: full read, then keep one
    /// random fragment of the reconstructed block.
    async fn retrieve_missing(&self, key: Key) -> Result<()> {
        debug!(%key, "retrieving missing key");
        let block = self.read(key).await?;
        let fragment = block
            .fragments()
            .choose(&mut rand::thread_rng())
            .cloned()
            .context("reconstructed block carried no fragments")?;
        let mut state = self.inner.state.lock().unwrap();
        if let Err(err) = state.store.insert(key, fragment) {
            debug!(%key, error = %err, "missing key arrived while reading");
        }
        Ok(())
    }

    /// One general maintenance round: wait for a ring, stabilize routing,
    /// repair replication, then hand the round to the next peer.
    async fn run_general_maintenance(&self) {
        loop {
            {
                let state = self.inner.state.lock().unwrap();
                if state.status == PeerStatus::Dead {
                    return;
                }
                if !state.successors.is_empty() {
                    break;
                }
            }
            sleep(SUCCESSOR_POLL_INTERVAL).await;
        }
        sleep(MAINTENANCE_ROUND_DELAY).await;
        if self.status() == PeerStatus::Dead {
            return;
        }

        debug!(id = %self.inner.id, "starting general maintenance");
        if let Err(err) = self.stabilize().await {
            warn!(error = %err, "stabilize failed");
        }
        self.run_local_maintenance().await;
        if let Err(err) = self.run_global_maintenance().await {
            debug!(error = %err, "global maintenance aborted");
        }

        // Pass the round on; skip past successors that no longer answer
        // so a departed peer does not end the circulation.
        let successors: Vec<PeerInfo> = {
            let state = self.inner.state.lock().unwrap();
            state.successors.iter().cloned().collect()
        };
        for successor in successors {
            match self.make_request(Command::Maintenance, &successor).await {
                Ok(_) => break,
                Err(err) => {
                    debug!(peer = %successor.id, error = %err, "maintenance handoff failed")
                }
            }
        }
        debug!(id = %self.inner.id, "ending general maintenance");
    }

    // ------------------------------------------------------------------
    // Request handlers
    // ------------------------------------------------------------------

    /// Check the envelope: we must be alive and the named recipient.
    /// Returns the sender's id for the handler to thread through any
    /// forwarding it does.
    fn validate(&self, request: &Request) -> Result<Key, Response> {
        if self.status() == PeerStatus::Dead {
            return Err(Response::fail("peer is shut down"));
        }
        let Some(recipient) = request.recipient_id else {
            return Err(Response::fail("invalid request: missing RECIPIENT_ID"));
        };
        if recipient != self.inner.id {
            return Err(Response::fail("invalid request: recipient mismatch"));
        }
        request
            .sender_id
            .ok_or_else(|| Response::fail("invalid request: missing SENDER_ID"))
    }

    /// Resolve the joining peer's predecessor. Mutates nothing; the
    /// joiner's later notifications do the installing.
    async fn join_handler(&self, request: Request) -> Response {
        if self.status() == PeerStatus::Dead {
            return Response::fail("peer is shut down");
        }
        let Command::Join { new_peer } = request.command else {
            return Response::fail("invalid request: wrong payload");
        };
        debug!(joiner = %new_peer.id, "handling join");
        match self.get_predecessor(new_peer.id, None).await {
            Ok(predecessor) => Response::with_predecessor(predecessor),
            Err(err) => Response::fail(err.to_string()),
        }
    }

    /// A neighbour is departing: absorb its range if it was our
    /// predecessor, repoint fingers if it was our successor.
    async fn leave_handler(&self, request: Request) -> Response {
        let sender = match self.validate(&request) {
            Ok(sender) => sender,
            Err(response) => return response,
        };
        let Command::Leave { new_pred, new_min, new_succ } = request.command else {
            return Response::fail("invalid request: wrong payload");
        };

        let mut state = self.inner.state.lock().unwrap();
        if state.predecessor.as_ref().map(|peer| peer.id) == Some(sender) {
            if let (Some(new_pred), Some(new_min)) = (new_pred, new_min) {
                debug!(leaver = %sender, new_predecessor = %new_pred.id, "predecessor left");
                state.predecessor = Some(new_pred);
                state.min_key = new_min;
            }
        }
        if state.successors.first().map(|peer| peer.id) == Some(sender) {
            if let Some(new_succ) = new_succ {
                debug!(leaver = %sender, replacement = %new_succ.id, "successor left");
                state.fingers.adjust(&new_succ);
            }
        }
        Response::ok()
    }

    /// A new peer announced itself: adopt it as predecessor when it falls
    /// between our current predecessor and us, otherwise fold it into the
    /// finger table and successor list.
    async fn notify_handler(&self, request: Request) -> Response {
        if self.status() == PeerStatus::Dead {
            return Response::fail("peer is shut down");
        }
        let Command::Notify { recipient: _, new_peer } = request.command else {
            return Response::fail("invalid request: wrong payload");
        };

        let fingers_need_init = {
            let mut state = self.inner.state.lock().unwrap();
            let becomes_predecessor = match &state.predecessor {
                None => true,
                Some(current) => {
                    new_peer.id.in_between(current.id, self.inner.id, false)
                }
            };
            if becomes_predecessor {
                debug!(
                    old = ?state.predecessor.as_ref().map(|p| p.id),
                    new = %new_peer.id,
                    "adopting new predecessor"
                );
                state.fingers.adjust(&new_peer);
                state.min_key = new_peer.id + 1;
                state.predecessor = Some(new_peer.clone());
                return Response::ok();
            }
            state.fingers.is_empty()
        };

        if fingers_need_init {
            if let Err(err) = self.populate_finger_table(true).await {
                debug!(error = %err, "finger initialization during notify failed");
            }
        }
        let mut state = self.inner.state.lock().unwrap();
        state.fingers.adjust(&new_peer);
        state.successors.insert(new_peer);
        Response::ok()
    }

    async fn get_succ_handler(&self, request: Request) -> Response {
        let sender = match self.validate(&request) {
            Ok(sender) => sender,
            Err(response) => return response,
        };
        let Command::GetSuccessor { key } = request.command else {
            return Response::fail("invalid request: wrong payload");
        };
        match self.get_successor(key, Some(sender)).await {
            Ok(successor) => Response::with_peer(successor),
            Err(err) => Response::fail(err.to_string()),
        }
    }

    async fn get_pred_handler(&self, request: Request) -> Response {
        let sender = match self.validate(&request) {
            Ok(sender) => sender,
            Err(response) => return response,
        };
        let Command::GetPredecessor { key } = request.command else {
            return Response::fail("invalid request: wrong payload");
        };
        match self.get_predecessor(key, Some(sender)).await {
            Ok(predecessor) => Response::with_peer(predecessor),
            Err(err) => Response::fail(err.to_string()),
        }
    }

    /// Store one fragment on behalf of a remote creator. One fragment per
    /// key per peer: re-creation of a held key is a duplicate.
    async fn create_fragment_handler(&self, request: Request) -> Response {
        if let Err(response) = self.validate(&request) {
            return response;
        }
        let Command::CreateFragment { key, fragment } = request.command else {
            return Response::fail("invalid request: wrong payload");
        };
        let fragment = match DataFragment::parse(&fragment) {
            Ok(fragment) => fragment,
            Err(err) => return Response::fail(format!("invalid request: {err}")),
        };

        let mut state = self.inner.state.lock().unwrap();
        if state.store.contains(key) {
            return Response::fail("key already exists in store");
        }
        match state.store.insert(key, fragment) {
            Ok(()) => {
                debug!(%key, "stored fragment");
                Response::ok()
            }
            Err(err) => Response::fail(err.to_string()),
        }
    }

    async fn read_fragment_handler(&self, request: Request) -> Response {
        if let Err(response) = self.validate(&request) {
            return response;
        }
        let Command::ReadFragment { key } = request.command else {
            return Response::fail("invalid request: wrong payload");
        };

        let state = self.inner.state.lock().unwrap();
        match state.store.lookup(key) {
            Ok(fragments) => match fragments.first() {
                Some(fragment) => Response::with_fragment(fragment.to_string()),
                None => Response::fail("fragment not stored locally"),
            },
            Err(_) => Response::fail("fragment not stored locally"),
        }
    }

    /// A predecessor told us which keys we should hold; rebuild the ones
    /// we are missing.
    async fn synchronize_handler(&self, request: Request) -> Response {
        if let Err(response) = self.validate(&request) {
            return response;
        }
        let Command::Synchronize { keys } = request.command else {
            return Response::fail("invalid request: wrong payload");
        };

        for key in keys {
            let held = {
                let state = self.inner.state.lock().unwrap();
                state.store.contains(key)
            };
            if held {
                continue;
            }
            if let Err(err) = self.retrieve_missing(key).await {
                debug!(%key, error = %err, "could not retrieve missing key");
            }
        }
        Response::ok()
    }

    /// The round reached us: run our share in the background and reply
    /// immediately so the sender's round can finish.
    async fn maintenance_handler(&self, _request: Request) -> Response {
        if self.status() == PeerStatus::Dead {
            return Response::fail("peer is shut down");
        }
        let peer = self.clone();
        tokio::spawn(async move {
            peer.run_general_maintenance().await;
        });
        Response::ok()
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn handlers(&self) -> HandlerMap {
        let mut map = HandlerMap::new();
        let peer = self.clone();
        map.insert("JOIN", handler(move |request| {
            let peer = peer.clone();
            async move { peer.join_handler(request).await }
        }));
        let peer = self.clone();
        map.insert("LEAVE", handler(move |request| {
            let peer = peer.clone();
            async move { peer.leave_handler(request).await }
        }));
        let peer = self.clone();
        map.insert("NOTIFY", handler(move |request| {
            let peer = peer.clone();
            async move { peer.notify_handler(request).await }
        }));
        let peer = self.clone();
        map.insert("GET_SUCC", handler(move |request| {
            let peer = peer.clone();
            async move { peer.get_succ_handler(request).await }
        }));
        let peer = self.clone();
        map.insert("GET_PRED", handler(move |request| {
            let peer = peer.clone();
            async move { peer.get_pred_handler(request).await }
        }));
        let peer = self.clone();
        map.insert("CREATE_FRAG", handler(move |request| {
            let peer = peer.clone();
            async move { peer.create_fragment_handler(request).await }
        }));
        let peer = self.clone();
        map.insert("READ_FRAG", handler(move |request| {
            let peer = peer.clone();
            async move { peer.read_fragment_handler(request).await }
        }));
        let peer = self.clone();
        map.insert("SYNCHRONIZE", handler(move |request| {
            let peer = peer.clone();
            async move { peer.synchronize_handler(request).await }
        }));
        let peer = self.clone();
        map.insert("MAINTENANCE", handler(move |request| {
            let peer = peer.clone();
            async move { peer.maintenance_handler(request).await }
        }));
        map
    }

    async fn start_server(&self) -> Result<()> {
        let server = Server::bind(&self.inner.addr, self.inner.port, self.handlers()).await?;
        *self.inner.server.lock().unwrap() = Some(server);
        Ok(())
    }

    /// Send a command with a full envelope to a specific peer.
    async fn make_request(&self, command: Command, peer: &PeerInfo) -> Result<Response> {
        let request = Request {
            sender_id: Some(self.inner.id),
            recipient_id: Some(peer.id),
            command,
        };
        send_request(&peer.addr, peer.port, &request)
            .await
            .map_err(|err| anyhow!("request to {} failed: {err}", peer.endpoint()))
    }

    fn ensure_live(&self) -> Result<()> {
        match self.status() {
            PeerStatus::Dead | PeerStatus::Leaving => bail!("peer is shut down"),
            _ => Ok(()),
        }
    }

    /// Is `key` in the range this peer stores, `[min_key, id]`?
    fn stored_locally(&self, key: Key) -> bool {
        let state = self.inner.state.lock().unwrap();
        key.in_between(state.min_key, self.inner.id, true)
    }

    fn first_successor(&self) -> Option<PeerInfo> {
        self.inner.state.lock().unwrap().successors.first().cloned()
    }
}

fn parse_endpoint(endpoint: &str) -> Result<(&str, u16)> {
    let (addr, port) = endpoint
        .rsplit_once(':')
        .with_context(|| format!("gateway {endpoint:?} is not ip:port"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("gateway port in {endpoint:?} is not a number"))?;
    Ok((addr, port))
}
