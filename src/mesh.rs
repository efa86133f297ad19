//! The replica core: one event-loop task owning all mesh state.
//!
//! Transport events and editor commands funnel into this task over mpsc
//! channels, so the channel
//! registry, dedup window and replay buffer are mutated strictly
//! sequentially and need no locks. Suspension happens only at I/O
//! boundaries; sends are fire-and-forget.
//!
//! ```text
//! editor ──Command──▶ ┌──────────┐ ──DocumentHost──▶ editor buffer
//! transport ─NetEvent▶│ MeshLoop │ ──MeshEvent────▶ editor surface
//! dial tasks ─result─▶└──────────┘ ──Channel.send──▶ peers
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::dedup::{DedupWindow, DEFAULT_DEDUP_CAPACITY};
use crate::document::DocumentHost;
use crate::failover::Failover;
use crate::membership::{self, JoinDecision};
use crate::protocol::{
    decode_batch, encode_batch, MeshError, OpId, Operation, PeerAddr, SelectionRange, SiteId,
};
use crate::registry::ChannelRegistry;
use crate::relay::{self, RelayGate, RelayStats, Verdict};
use crate::sync::{build_snapshot, ReplayBuffer, DEFAULT_REPLAY_CAPACITY};
use crate::transport::{ChannelId, Direction, NetEvent, Transport};

/// Mesh construction parameters.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Address other replicas reach this one at.
    pub local_addr: PeerAddr,
    /// Dedup window capacity.
    pub dedup_capacity: usize,
    /// Replay buffer capacity.
    pub replay_capacity: usize,
    /// Depth of the `MeshEvent` queue handed to the editor surface.
    pub event_capacity: usize,
}

impl MeshConfig {
    pub fn new(local_addr: PeerAddr) -> Self {
        Self {
            local_addr,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            event_capacity: 256,
        }
    }
}

/// Notifications the editor surface subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A peer address became part of the membership view.
    PeerJoined(PeerAddr),
    /// A peer address left the view.
    PeerLeft(PeerAddr),
    /// Remote cursor moved; `None` hides it.
    Cursor {
        peer: PeerAddr,
        offset: Option<usize>,
    },
    /// Remote selection changed; `None` clears it.
    Selection {
        peer: PeerAddr,
        range: Option<SelectionRange>,
    },
    /// The published entry point changed (initially, or after failover).
    /// The embedding application should refresh its invitation link.
    Rendezvous(PeerAddr),
    /// Bootstrap snapshot applied; the local document now mirrors the mesh.
    Synced,
}

/// Point-in-time mesh state, for monitoring and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshStats {
    pub degree: usize,
    /// Outbound channel count alone: the fan-out this replica chose, as
    /// opposed to inbound channels others opened to it.
    pub outbound_degree: usize,
    pub view_len: usize,
    pub rendezvous: PeerAddr,
    pub relay: RelayStats,
    pub replay_len: usize,
}

enum Command {
    Insert {
        index: usize,
        text: String,
    },
    Delete {
        index: usize,
        len: usize,
    },
    Replace {
        index: usize,
        len: usize,
        text: String,
    },
    Cursor {
        offset: Option<usize>,
    },
    Selection {
        range: Option<SelectionRange>,
    },
    Stats {
        reply: oneshot::Sender<MeshStats>,
    },
    Shutdown,
}

/// Why a dial was started; decides what happens when it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialPurpose {
    /// First outbound channel of a newcomer: join + load.
    Bootstrap,
    /// Extra edge after a snapshot: join, state already synced.
    Densify,
    /// Accept path: dialing back to a join requester.
    DialBack,
}

struct DialOutcome {
    addr: PeerAddr,
    purpose: DialPurpose,
    result: Result<crate::transport::Channel, MeshError>,
}

/// Handle for submitting locally generated edits and presence. The
/// editor surface applies its own edits first, then submits them here
/// for the mesh to broadcast.
#[derive(Clone)]
pub struct MeshHandle {
    commands: mpsc::Sender<Command>,
    local_addr: PeerAddr,
    site: SiteId,
}

impl MeshHandle {
    pub fn local_addr(&self) -> &PeerAddr {
        &self.local_addr
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    pub async fn submit_insert(
        &self,
        index: usize,
        text: impl Into<String>,
    ) -> Result<(), MeshError> {
        self.send(Command::Insert {
            index,
            text: text.into(),
        })
        .await
    }

    pub async fn submit_delete(&self, index: usize, len: usize) -> Result<(), MeshError> {
        self.send(Command::Delete { index, len }).await
    }

    /// A replace is a delete plus an insert broadcast as one batch, so
    /// no peer observes the half-applied state between them.
    pub async fn submit_replace(
        &self,
        index: usize,
        len: usize,
        text: impl Into<String>,
    ) -> Result<(), MeshError> {
        self.send(Command::Replace {
            index,
            len,
            text: text.into(),
        })
        .await
    }

    pub async fn submit_cursor(&self, offset: Option<usize>) -> Result<(), MeshError> {
        self.send(Command::Cursor { offset }).await
    }

    pub async fn submit_selection(
        &self,
        range: Option<SelectionRange>,
    ) -> Result<(), MeshError> {
        self.send(Command::Selection { range }).await
    }

    pub async fn stats(&self) -> Result<MeshStats, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply }).await?;
        rx.await.map_err(|_| MeshError::ChannelClosed)
    }

    /// Stop the mesh loop; all channels close with it.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn send(&self, cmd: Command) -> Result<(), MeshError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| MeshError::ChannelClosed)
    }
}

/// Spawns the replica core.
pub struct Mesh;

impl Mesh {
    /// Start a mesh task. `net_rx` is the funnel the transport was bound
    /// with; `bootstrap` is the rendezvous address to join, or `None` to
    /// start a fresh mesh and become the rendezvous.
    pub fn spawn(
        config: MeshConfig,
        transport: Arc<dyn Transport>,
        host: Box<dyn DocumentHost>,
        net_rx: mpsc::Receiver<NetEvent>,
        bootstrap: Option<PeerAddr>,
    ) -> (MeshHandle, mpsc::Receiver<MeshEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (dial_tx, dial_rx) = mpsc::channel(64);

        let site = SiteId::generate();
        let local = config.local_addr.clone();
        let mesh_loop = MeshLoop {
            local: local.clone(),
            site,
            seq: 0,
            registry: ChannelRegistry::new(),
            gate: RelayGate::new(DedupWindow::new(config.dedup_capacity)),
            replay: ReplayBuffer::new(config.replay_capacity),
            failover: Failover::new(local.clone()),
            transport,
            host,
            events: event_tx,
            dials: dial_tx,
        };
        tokio::spawn(mesh_loop.run(net_rx, cmd_rx, dial_rx, bootstrap));

        (
            MeshHandle {
                commands: cmd_tx,
                local_addr: local,
                site,
            },
            event_rx,
        )
    }
}

struct MeshLoop {
    local: PeerAddr,
    site: SiteId,
    seq: u64,
    registry: ChannelRegistry,
    gate: RelayGate,
    replay: ReplayBuffer,
    failover: Failover,
    transport: Arc<dyn Transport>,
    host: Box<dyn DocumentHost>,
    events: mpsc::Sender<MeshEvent>,
    dials: mpsc::Sender<DialOutcome>,
}

impl MeshLoop {
    async fn run(
        mut self,
        mut net_rx: mpsc::Receiver<NetEvent>,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut dial_rx: mpsc::Receiver<DialOutcome>,
        bootstrap: Option<PeerAddr>,
    ) {
        match bootstrap {
            Some(target) => {
                log::info!("{}: joining mesh via {target}", self.local);
                self.failover.set(target.clone());
                self.dial(target, DialPurpose::Bootstrap);
            }
            None => {
                log::info!("{}: starting fresh mesh", self.local);
                self.emit(MeshEvent::Rendezvous(self.local.clone())).await;
            }
        }

        loop {
            tokio::select! {
                Some(event) = net_rx.recv() => self.handle_net(event).await,
                Some(outcome) = dial_rx.recv() => self.handle_dial(outcome).await,
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                else => break,
            }
        }
        log::info!("{}: mesh loop stopped", self.local);
    }

    fn next_id(&mut self) -> OpId {
        self.seq += 1;
        OpId {
            site: self.site,
            seq: self.seq,
        }
    }

    async fn emit(&self, event: MeshEvent) {
        // A dropped receiver means a headless embedder; discard silently.
        let _ = self.events.send(event).await;
    }

    fn dial(&self, addr: PeerAddr, purpose: DialPurpose) {
        let transport = self.transport.clone();
        let dials = self.dials.clone();
        tokio::spawn(async move {
            let result = transport.connect(addr.clone()).await;
            let _ = dials
                .send(DialOutcome {
                    addr,
                    purpose,
                    result,
                })
                .await;
        });
    }

    /// Record, buffer and fan out a locally produced batch.
    fn broadcast_local(&mut self, batch: Vec<Operation>) {
        let frame = match encode_batch(&batch) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("{}: failed to encode local batch: {e}", self.local);
                return;
            }
        };
        self.gate.note_local(&batch);
        self.replay.push(frame.clone());
        let sent = relay::fan_out(self.registry.channels(), &frame);
        log::trace!(
            "{}: broadcast {} op(s) to {sent} channel(s)",
            self.local,
            batch.len()
        );
    }

    async fn handle_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::Inbound(channel) => {
                let addr = channel.addr().clone();
                let known = self.registry.view().contains(&addr);
                if self.registry.add_inbound(channel) {
                    log::info!("{}: inbound channel from {addr}", self.local);
                    if !known {
                        self.emit(MeshEvent::PeerJoined(addr)).await;
                    }
                }
            }
            NetEvent::Frame { from, bytes } => self.handle_frame(from, bytes).await,
            NetEvent::Closed {
                from,
                direction,
                id,
            } => self.handle_closed(from, direction, id).await,
        }
    }

    async fn handle_frame(&mut self, from: PeerAddr, bytes: Vec<u8>) {
        let batch = match decode_batch(&bytes) {
            Ok(batch) => batch,
            Err(e) => {
                log::warn!("{}: undecodable frame from {from}: {e}", self.local);
                return;
            }
        };

        match self.gate.admit(&batch) {
            Verdict::Duplicate => return,
            Verdict::Fresh => relay::relay_frame(&mut self.gate, &self.registry, &from, &bytes),
            Verdict::Control => {}
        }

        for op in batch {
            self.apply(&from, op).await;
        }
    }

    async fn apply(&mut self, from: &PeerAddr, op: Operation) {
        match op {
            Operation::JoinRequest { addr, site } => self.handle_join(addr, site).await,
            Operation::Load => self.handle_load(from),
            Operation::Snapshot { document, members } => {
                self.handle_snapshot(from, document, members).await
            }
            Operation::AddPeer { addr, .. } => {
                if addr != self.local && self.registry.add_view(addr.clone()) {
                    log::debug!("{}: learned of peer {addr}", self.local);
                    self.emit(MeshEvent::PeerJoined(addr)).await;
                }
            }
            Operation::RemovePeer { addr, .. } => {
                // A live channel outranks the gossiped fact; our own
                // close event will evict the entry if the peer is gone.
                if !self.registry.is_connected(&addr) && self.registry.remove_view(&addr) {
                    self.emit(MeshEvent::PeerLeft(addr)).await;
                }
            }
            Operation::Insert { index, text, .. } => self.host.insert(index, &text),
            Operation::Delete { index, len, .. } => self.host.delete(index, len),
            Operation::Cursor { peer, offset, .. } => {
                if peer != self.local {
                    self.emit(MeshEvent::Cursor { peer, offset }).await;
                }
            }
            Operation::Selection { peer, range, .. } => {
                if peer != self.local {
                    self.emit(MeshEvent::Selection { peer, range }).await;
                }
            }
        }
    }

    /// Membership admission: `Requesting -> Accepted | Forwarded`.
    async fn handle_join(&mut self, requester: PeerAddr, site: SiteId) {
        if requester == self.local {
            return;
        }
        // Decide before matching so the rng temporary is gone by the
        // time the accept path suspends.
        let decision =
            membership::evaluate_join(&self.registry, &requester, &mut rand::thread_rng());
        match decision {
            JoinDecision::Forward(target) => {
                log::info!(
                    "{}: over degree cap, forwarding join of {requester} to {target}",
                    self.local
                );
                let batch = [Operation::JoinRequest {
                    addr: requester,
                    site,
                }];
                match self.registry.outbound_to(&target) {
                    Some(channel) => {
                        let _ = channel.send(&batch);
                    }
                    // Forward target raced away; silence is the failure
                    // signal, the requester will retry elsewhere.
                    None => log::warn!("{}: forward target {target} vanished", self.local),
                }
            }
            JoinDecision::Accept => {
                log::info!("{}: accepting join of {requester}", self.local);
                if self.registry.outbound_to(&requester).is_some() {
                    self.announce_member(requester).await;
                } else {
                    self.dial(requester, DialPurpose::DialBack);
                }
            }
        }
    }

    /// Broadcast the membership fact for an accepted requester.
    async fn announce_member(&mut self, addr: PeerAddr) {
        if self.registry.add_view(addr.clone()) {
            self.emit(MeshEvent::PeerJoined(addr.clone())).await;
        }
        let id = self.next_id();
        self.broadcast_local(vec![Operation::AddPeer { id, addr }]);
    }

    /// Serve a bootstrap: snapshot on the requesting channel, then the
    /// replay buffer so edits from the sync window are not lost.
    fn handle_load(&mut self, from: &PeerAddr) {
        let snapshot = build_snapshot(self.host.snapshot(), self.registry.view(), from);
        let Some(channel) = self.registry.channel_to(from) else {
            log::warn!("{}: Load from {from} but no channel to reply on", self.local);
            return;
        };
        log::info!(
            "{}: serving bootstrap to {from} ({} buffered batches)",
            self.local,
            self.replay.len()
        );
        let _ = channel.send(&[snapshot]);
        for frame in self.replay.iter() {
            let _ = channel.send_frame(frame.clone());
        }
    }

    /// Apply a bootstrap snapshot and densify toward the members in it.
    async fn handle_snapshot(
        &mut self,
        from: &PeerAddr,
        document: String,
        members: Vec<PeerAddr>,
    ) {
        log::info!(
            "{}: bootstrap snapshot from {from} ({} bytes, {} members)",
            self.local,
            document.len(),
            members.len()
        );
        self.host.replace(document);
        self.emit(MeshEvent::Synced).await;

        for member in members {
            if member == self.local || self.registry.is_connected(&member) {
                continue;
            }
            if self.registry.add_view(member.clone()) {
                self.emit(MeshEvent::PeerJoined(member.clone())).await;
            }
            self.dial(member, DialPurpose::Densify);
        }
    }

    async fn handle_closed(&mut self, from: PeerAddr, direction: Direction, id: ChannelId) {
        let removal = self.registry.remove(&from, direction, id);
        if !removal.removed {
            return;
        }
        log::info!("{}: {direction:?} channel to {from} closed", self.local);
        if !removal.evicted {
            return;
        }

        // Last channel to this peer gone: it left the mesh as far as we
        // can tell. Tell the editor, tell the mesh.
        self.emit(MeshEvent::PeerLeft(from.clone())).await;
        let op_id = self.next_id();
        self.broadcast_local(vec![Operation::RemovePeer {
            id: op_id,
            addr: from.clone(),
        }]);

        if self.failover.is_rendezvous(&from) {
            let candidate = self.failover.elect(self.registry.view(), &from);
            log::info!(
                "{}: rendezvous {from} lost, electing {candidate}",
                self.local
            );
            self.failover.set(candidate.clone());
            self.emit(MeshEvent::Rendezvous(candidate)).await;
        }
    }

    async fn handle_dial(&mut self, outcome: DialOutcome) {
        match outcome.result {
            Ok(channel) => {
                let addr = outcome.addr;
                let known = self.registry.view().contains(&addr);
                if self.registry.add_outbound(channel) {
                    log::info!("{}: outbound channel to {addr}", self.local);
                    if !known {
                        self.emit(MeshEvent::PeerJoined(addr.clone())).await;
                    }
                }
                match outcome.purpose {
                    DialPurpose::Bootstrap => {
                        if let Some(channel) = self.registry.outbound_to(&addr) {
                            let _ = channel.send(&[Operation::JoinRequest {
                                addr: self.local.clone(),
                                site: self.site,
                            }]);
                            let _ = channel.send(&[Operation::Load]);
                        }
                    }
                    DialPurpose::Densify => {
                        if let Some(channel) = self.registry.outbound_to(&addr) {
                            let _ = channel.send(&[Operation::JoinRequest {
                                addr: self.local.clone(),
                                site: self.site,
                            }]);
                        }
                    }
                    DialPurpose::DialBack => self.announce_member(addr).await,
                }
            }
            Err(e) => self.handle_dial_failure(outcome.addr, outcome.purpose, e).await,
        }
    }

    /// Unreachable peer: drop its partial membership record; a failed
    /// bootstrap additionally re-targets via failover.
    async fn handle_dial_failure(&mut self, addr: PeerAddr, purpose: DialPurpose, err: MeshError) {
        log::warn!("{}: dial {addr} failed: {err}", self.local);
        if self.registry.remove_view(&addr) {
            self.emit(MeshEvent::PeerLeft(addr.clone())).await;
        }

        if purpose != DialPurpose::Bootstrap {
            return;
        }
        let candidate = self.failover.elect(self.registry.view(), &addr);
        self.failover.set(candidate.clone());
        self.emit(MeshEvent::Rendezvous(candidate.clone())).await;
        if candidate == self.local {
            log::info!(
                "{}: no reachable peers, standing alone as rendezvous",
                self.local
            );
        } else {
            self.dial(candidate, DialPurpose::Bootstrap);
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Insert { index, text } => {
                let id = self.next_id();
                self.broadcast_local(vec![Operation::Insert { id, index, text }]);
            }
            Command::Delete { index, len } => {
                let id = self.next_id();
                self.broadcast_local(vec![Operation::Delete { id, index, len }]);
            }
            Command::Replace { index, len, text } => {
                let delete_id = self.next_id();
                let insert_id = self.next_id();
                self.broadcast_local(vec![
                    Operation::Delete {
                        id: delete_id,
                        index,
                        len,
                    },
                    Operation::Insert {
                        id: insert_id,
                        index,
                        text,
                    },
                ]);
            }
            Command::Cursor { offset } => {
                let id = self.next_id();
                let peer = self.local.clone();
                self.broadcast_local(vec![Operation::Cursor { id, peer, offset }]);
            }
            Command::Selection { range } => {
                let id = self.next_id();
                let peer = self.local.clone();
                self.broadcast_local(vec![Operation::Selection { id, peer, range }]);
            }
            Command::Stats { reply } => {
                let _ = reply.send(MeshStats {
                    degree: self.registry.degree(),
                    outbound_degree: self.registry.outbound_addrs().count(),
                    view_len: self.registry.view_len(),
                    rendezvous: self.failover.rendezvous().clone(),
                    relay: self.gate.stats(),
                    replay_len: self.replay.len(),
                });
            }
            // Intercepted by the run loop before dispatch.
            Command::Shutdown => {}
        }
    }
}
