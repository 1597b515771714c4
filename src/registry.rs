//! The process-wide connection registry: id allocation, the live and closed
//!  socket tables, the peer index used for duplicate-handshake recognition,
//!  the group table and the multiplexer table, all behind one coarse lock.
//!
//! Lock discipline: the registry lock is the outermost lock. Acquiring a
//!  record's control lock, a listener's accept lock or a group's lock inside
//!  it is fine; the reverse never happens, and no lock is held across an
//!  `await`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, info, trace, warn};

use crate::channel::{AddrFamily, TokioUdpChannel, UdpChannel};
use crate::collector::Trigger;
use crate::config::CudpConfig;
use crate::engine::{
    AcceptOutcome, EngineFactory, Handshake, HandshakePacket, RejectReason, SeqNumber,
};
use crate::error::TransportError;
use crate::group::{Group, GroupMember, GroupMemberData, GroupType, MemberState};
use crate::multiplexer::Multiplexer;
use crate::queues::{RecvQueue, SendQueue};
use crate::readiness::{Interest, ReadinessService};
use crate::socket::{ListenerState, PeerSpec, SocketRecord, SocketStatus};
use crate::socket_id::{IdGenerator, MuxId, SocketId};

/// Where a bind gets its channel from.
pub(crate) enum BindTarget {
    /// Bind to a concrete address (port 0 autoselects).
    Addr(SocketAddr),
    /// Autoselect everything; only the family is fixed.
    Family(AddrFamily),
    /// Adopt an OS socket the application bound itself.
    OsSocket(std::net::UdpSocket),
}

/// Per-target outcome of a group connect.
#[derive(Debug)]
pub struct GroupConnectResult {
    pub target: SocketAddr,
    pub id: Option<SocketId>,
    pub error: Option<TransportError>,
}

struct RegistryState {
    id_gen: IdGenerator,
    sockets: FxHashMap<SocketId, Arc<SocketRecord>>,
    closed: FxHashMap<SocketId, Arc<SocketRecord>>,
    groups: FxHashMap<SocketId, Arc<Group>>,
    peer_index: FxHashMap<PeerSpec, FxHashSet<SocketId>>,
    muxers: FxHashMap<MuxId, Multiplexer>,
}

pub(crate) struct Registry {
    state: Mutex<RegistryState>,
    config: CudpConfig,
    factory: Arc<dyn EngineFactory>,
    readiness: Arc<ReadinessService>,
    trigger: Arc<Trigger>,
    closing: AtomicBool,
}

impl Registry {
    pub fn new(
        config: CudpConfig,
        factory: Arc<dyn EngineFactory>,
        readiness: Arc<ReadinessService>,
        trigger: Arc<Trigger>,
    ) -> Arc<Registry> {
        Arc::new(Registry {
            state: Mutex::new(RegistryState {
                id_gen: IdGenerator::new(),
                sockets: FxHashMap::default(),
                closed: FxHashMap::default(),
                groups: FxHashMap::default(),
                peer_index: FxHashMap::default(),
                muxers: FxHashMap::default(),
            }),
            config,
            factory,
            readiness,
            trigger,
            closing: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CudpConfig {
        &self.config
    }

    pub fn readiness(&self) -> &Arc<ReadinessService> {
        &self.readiness
    }

    pub fn trigger(&self) -> &Arc<Trigger> {
        &self.trigger
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().expect("registry lock poisoned")
    }

    // ------------------------------------------------------------------
    // socket creation and lookup
    // ------------------------------------------------------------------

    pub fn new_socket(&self) -> Result<SocketId, TransportError> {
        let id = {
            let mut state = self.lock();
            let RegistryState {
                id_gen, sockets, ..
            } = &mut *state;
            id_gen.generate(false, |candidate| sockets.contains_key(&candidate))?
        };

        // engine creation runs outside the lock; the factory may do real work
        let engine = self.factory.new_engine(id);
        let record = SocketRecord::new(id, engine, self.config.broken_hysteresis);

        self.lock().sockets.insert(id, record);
        debug!("{} created", id);
        Ok(id)
    }

    /// Look up a live record. A record already moved to `Closed` is not
    ///  locatable on this path; it is only observable through `get_status`.
    pub fn locate(&self, id: SocketId) -> Result<Arc<SocketRecord>, TransportError> {
        let state = self.lock();
        match state.sockets.get(&id) {
            Some(record) if record.control().status != SocketStatus::Closed => {
                Ok(record.clone())
            }
            _ => Err(TransportError::InvalidSocketId),
        }
    }

    pub fn locate_group(&self, id: SocketId) -> Result<Arc<Group>, TransportError> {
        self.lock()
            .groups
            .get(&id)
            .cloned()
            .ok_or(TransportError::InvalidSocketId)
    }

    pub fn get_status(&self, id: SocketId) -> SocketStatus {
        let record = {
            let state = self.lock();
            match state.sockets.get(&id) {
                Some(record) => record.clone(),
                None => {
                    return if state.closed.contains_key(&id) {
                        SocketStatus::Closed
                    }
                    else {
                        SocketStatus::Nonexist
                    };
                }
            }
        };
        record.get_status()
    }

    /// Find the record a repeated handshake from `(peer_id, peer_isn)` at
    ///  `peer_addr` belongs to.
    fn locate_peer(
        &self,
        peer_addr: SocketAddr,
        peer_id: SocketId,
        peer_isn: SeqNumber,
    ) -> Option<Arc<SocketRecord>> {
        let spec = PeerSpec { peer_id, peer_isn };
        let state = self.lock();
        let candidates = state.peer_index.get(&spec)?;
        for id in candidates {
            // the record may have been closed and moved in the meantime
            if let Some(record) = state.sockets.get(id) {
                if record.control().peer_addr == Some(peer_addr) {
                    return Some(record.clone());
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // bind / multiplexer attachment
    // ------------------------------------------------------------------

    pub fn bind(&self, id: SocketId, target: BindTarget) -> Result<(), TransportError> {
        let record = self.locate(id)?;

        if record.control().status != SocketStatus::Init {
            return Err(TransportError::InvalidParam("socket is already bound"));
        }

        record.engine.open()?;
        let (mux_id, self_addr) = self.update_mux(&record, target)?;

        let mut raced = false;
        {
            let mut control = record.control();
            if control.status == SocketStatus::Init {
                control.status = SocketStatus::Opened;
                control.mux_id = Some(mux_id);
                control.self_addr = Some(self_addr);
            }
            else {
                raced = true;
            }
        }
        if raced {
            // a concurrent bind won; release the attachment we just made
            self.release_mux_by_id(mux_id);
            return Err(TransportError::InvalidParam("socket is already bound"));
        }

        debug!("{} bound to {:?} via {}", id, self_addr, mux_id);
        Ok(())
    }

    /// Attach the record to a multiplexer: reuse a matching entry if the
    ///  engine requests address reuse, otherwise create a fresh channel with
    ///  its queue workers.
    fn update_mux(
        &self,
        record: &Arc<SocketRecord>,
        target: BindTarget,
    ) -> Result<(MuxId, SocketAddr), TransportError> {
        let params = record.engine.bind_params();

        let mut state = self.lock();

        if let BindTarget::Addr(addr) = &target {
            if params.reuse_addr {
                let family = AddrFamily::of(addr);
                let found = state
                    .muxers
                    .values_mut()
                    .find(|m| m.matches(family, addr.port(), &params));
                if let Some(mux) = found {
                    mux.refcount += 1;
                    let mux_id = mux.id;
                    let local = mux
                        .channel
                        .local_addr()
                        .map_err(TransportError::Setup)?;
                    record
                        .engine
                        .attach_queues(mux.snd_queue.clone(), mux.rcv_queue.clone());
                    debug!("{} reusing {} on port {}", record.id, mux_id, addr.port());
                    return Ok((mux_id, local));
                }
            }
        }

        let udp_bufs = (self.config.udp_snd_buf_size, self.config.udp_rcv_buf_size);
        let channel = match target {
            BindTarget::Addr(addr) => TokioUdpChannel::open_at(addr, &params, udp_bufs)?,
            BindTarget::Family(family) => TokioUdpChannel::open(family, &params, udp_bufs)?,
            BindTarget::OsSocket(socket) => TokioUdpChannel::attach(socket)?,
        };
        let channel: Arc<dyn UdpChannel> = Arc::new(channel);
        let local = channel.local_addr().map_err(TransportError::Setup)?;

        let mux_id = MuxId::from_socket(record.id);
        let sink = self.factory.new_sink(mux_id);
        let snd_queue = SendQueue::spawn(channel.clone());
        let rcv_queue = RecvQueue::spawn(channel.clone(), sink);

        record
            .engine
            .attach_queues(snd_queue.clone(), rcv_queue.clone());

        state.muxers.insert(
            mux_id,
            Multiplexer {
                id: mux_id,
                family: AddrFamily::of(&local),
                port: local.port(),
                mss: params.mss,
                ttl: params.ttl,
                tos: params.tos,
                v6only: params.v6only,
                reusable: params.reuse_addr,
                refcount: 1,
                channel,
                snd_queue,
                rcv_queue,
            },
        );

        info!("created multiplexer {} on port {}", mux_id, local.port());
        Ok((mux_id, local))
    }

    /// Attach a freshly accepted record to its listener's multiplexer. The
    ///  listener created the entry during its own bind, so the port lookup is
    ///  expected to succeed.
    fn update_listener_mux(
        &self,
        record: &Arc<SocketRecord>,
        listener: &Arc<SocketRecord>,
    ) -> Result<(MuxId, SocketAddr), TransportError> {
        let listener_port = listener
            .control()
            .self_addr
            .map(|a| a.port())
            .ok_or(TransportError::Unbound)?;

        let mut state = self.lock();
        let found = state
            .muxers
            .values_mut()
            .find(|m| m.port == listener_port);
        match found {
            Some(mux) => {
                mux.refcount += 1;
                let mux_id = mux.id;
                let local = mux
                    .channel
                    .local_addr()
                    .map_err(TransportError::Setup)?;
                record
                    .engine
                    .attach_queues(mux.snd_queue.clone(), mux.rcv_queue.clone());
                Ok((mux_id, local))
            }
            None => {
                error!(
                    "no multiplexer bound to port {} of listener {}",
                    listener_port, listener.id
                );
                Err(TransportError::Unknown)
            }
        }
    }

    fn release_mux_by_id(&self, mux_id: MuxId) {
        let mut state = self.lock();
        Self::release_mux(&mut state, mux_id);
    }

    fn release_mux(state: &mut RegistryState, mux_id: MuxId) {
        let remove = match state.muxers.get_mut(&mux_id) {
            Some(mux) => {
                mux.refcount -= 1;
                mux.refcount == 0
            }
            None => {
                error!("{} not found while releasing", mux_id);
                false
            }
        };
        if remove {
            if let Some(mux) = state.muxers.remove(&mux_id) {
                mux.shutdown();
            }
        }
    }

    // ------------------------------------------------------------------
    // listen / accept
    // ------------------------------------------------------------------

    pub fn listen(&self, id: SocketId, backlog: usize) -> Result<(), TransportError> {
        if backlog == 0 {
            return Err(TransportError::InvalidParam("backlog must be positive"));
        }

        let record = self.locate(id)?;

        {
            let control = record.control();
            match control.status {
                // already listening: nothing to do
                SocketStatus::Listening => return Ok(()),
                SocketStatus::Opened => {}
                _ => return Err(TransportError::Unbound),
            }
        }
        if record.engine.is_rendezvous() {
            return Err(TransportError::Rendezvous);
        }

        {
            let mut guard = record.listener();
            match guard.as_mut() {
                // never reset existing accept queues, only adjust the backlog
                Some(listener_state) => listener_state.backlog = backlog,
                None => {
                    *guard = Some(ListenerState {
                        backlog,
                        queued: Default::default(),
                        accepted: Default::default(),
                    });
                }
            }
        }

        // propagates engine failures; the socket then stays `Opened`
        record.engine.set_listen_state()?;

        let mut control = record.control();
        if control.status != SocketStatus::Opened {
            return Err(TransportError::NotListening);
        }
        control.status = SocketStatus::Listening;
        info!("{} listening with backlog {}", id, backlog);
        Ok(())
    }

    pub async fn accept(&self, listener_id: SocketId) -> Result<(SocketId, SocketAddr), TransportError> {
        let listener = self.locate(listener_id)?;

        if listener.control().status != SocketStatus::Listening {
            return Err(TransportError::NotListening);
        }
        if listener.engine.is_rendezvous() {
            return Err(TransportError::Rendezvous);
        }

        let blocking = listener.engine.is_sync_recving();

        let accepted = loop {
            // arm the accept condition before checking so a connection queued
            //  concurrently is not missed
            let notified = listener.accept_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if listener.control().status != SocketStatus::Listening || listener.broken() {
                return Err(TransportError::NotListening);
            }

            let popped = {
                let mut guard = listener.listener();
                let listener_state = guard.as_mut().ok_or(TransportError::NotListening)?;
                match listener_state.queued.pop_first() {
                    Some(id) => {
                        listener_state.accepted.insert(id);
                        let drained = listener_state.queued.is_empty();
                        Some((id, drained))
                    }
                    None => None,
                }
            };

            match popped {
                Some((id, drained)) => {
                    if drained {
                        self.readiness
                            .update_events(listener_id, Interest::READ, false);
                    }
                    break id;
                }
                None => {
                    if !blocking {
                        return Err(TransportError::Again);
                    }
                    if self.is_closing() {
                        return Err(TransportError::NotListening);
                    }
                    notified.await;
                }
            }
        };

        let record = self.locate(accepted)?;
        let (peer_addr, group) = {
            let control = record.control();
            (control.peer_addr, control.group)
        };
        let peer_addr = peer_addr.ok_or(TransportError::Unknown)?;

        // a listener marked for group handling reports the member's group
        //  instead of the individual connection
        if listener.engine.group_connect_enabled() {
            if let Some(group_id) = group {
                debug!("accept on {}: reporting {} for member {}", listener_id, group_id, accepted);
                return Ok((group_id, peer_addr));
            }
        }

        Ok((accepted, peer_addr))
    }

    // ------------------------------------------------------------------
    // inbound handshake dispatch
    // ------------------------------------------------------------------

    /// Dispatch an inbound handshake identified by the receive path as
    ///  addressed to the listener `listener_id`. This is the internal
    ///  counterpart of `accept`: it synthesizes the new record before user
    ///  code observes it.
    pub async fn dispatch_handshake(
        &self,
        listener_id: SocketId,
        peer: SocketAddr,
        hs: Handshake,
        pkt: HandshakePacket,
    ) -> AcceptOutcome {
        let listener = match self.locate(listener_id) {
            Ok(listener) => listener,
            Err(_) => {
                error!("handshake dispatch for unknown listener {}", listener_id);
                return AcceptOutcome::Refused(RejectReason::UnknownListener);
            }
        };

        // repeated handshake from a known peer?
        if let Some(existing) = self.locate_peer(peer, hs.socket_id, hs.isn) {
            if existing.broken() {
                debug!(
                    "{}: previous connection from {:?} is broken - evicting and starting fresh",
                    listener_id, peer
                );
                {
                    let mut control = existing.control();
                    control.status = SocketStatus::Closed;
                    control.timestamp = Instant::now();
                }
                let mut guard = listener.listener();
                if let Some(listener_state) = guard.as_mut() {
                    listener_state.queued.remove(&existing.id);
                    listener_state.accepted.remove(&existing.id);
                }
            }
            else {
                // working connection: adapt the response to it instead of
                //  creating a duplicate record
                debug!(
                    "{}: repeated handshake from {:?} - adapting to {}",
                    listener_id, peer, existing.id
                );
                let adapted = Handshake {
                    socket_id: existing.id,
                    isn: existing.engine.isn(),
                    mss: existing.engine.mss(),
                    flight_flag_size: existing.engine.flight_flag_size(),
                };
                return AcceptOutcome::Duplicate(adapted);
            }
        }

        // refuse when the backlog is exhausted
        {
            let guard = listener.listener();
            match guard.as_ref() {
                Some(listener_state) if listener_state.queued.len() >= listener_state.backlog => {
                    warn!("{}: backlog {} exceeded - refusing handshake", listener_id, listener_state.backlog);
                    return AcceptOutcome::Refused(RejectReason::BacklogFull);
                }
                Some(_) => {}
                None => {
                    return AcceptOutcome::Refused(RejectReason::UnknownListener);
                }
            }
        }

        let new_id = {
            let mut state = self.lock();
            let RegistryState {
                id_gen, sockets, ..
            } = &mut *state;
            match id_gen.generate(false, |candidate| sockets.contains_key(&candidate)) {
                Ok(id) => id,
                Err(_) => {
                    error!("{}: id space exhausted while accepting from {:?}", listener_id, peer);
                    return AcceptOutcome::Refused(RejectReason::IdExhausted);
                }
            }
        };

        let engine = self.factory.derive_engine(new_id, &listener.engine);
        let record = SocketRecord::new(new_id, engine, self.config.broken_hysteresis);
        let peer_spec = PeerSpec {
            peer_id: hs.socket_id,
            peer_isn: hs.isn,
        };
        {
            let mut control = record.control();
            control.peer_addr = Some(peer);
            control.peer_spec = Some(peer_spec);
            control.listen_parent = Some(listener_id);
        }

        // the record must be locatable before the engine responds, because the
        //  response travels through the shared receive path
        self.lock().sockets.insert(new_id, record.clone());

        let setup = async {
            record.engine.open()?;
            let (mux_id, self_addr) = self.update_listener_mux(&record, &listener)?;
            record
                .engine
                .accept_and_respond(peer, &hs, &pkt)
                .await?;
            Ok::<_, TransportError>((mux_id, self_addr))
        };

        match setup.await {
            Ok((mux_id, self_addr)) => {
                let mut control = record.control();
                control.status = SocketStatus::Connected;
                control.mux_id = Some(mux_id);
                control.self_addr = Some(self_addr);
            }
            Err(e) => {
                error!("{}: accepting from {:?} failed: {} - rolling back", listener_id, peer, e);
                record.make_closed();
                let mut state = self.lock();
                state.sockets.remove(&new_id);
                state.closed.insert(new_id, record);
                return AcceptOutcome::Refused(RejectReason::Internal);
            }
        }

        // index the peer so repeated handshakes find this record
        self.lock()
            .peer_index
            .entry(peer_spec)
            .or_default()
            .insert(new_id);

        // a member accepted into a group becomes usable for group operations
        let group_id = record.control().group;
        if let Some(group_id) = group_id {
            if let Ok(group) = self.locate_group(group_id) {
                group.update_member(new_id, |m| {
                    m.snd_state = MemberState::Idle;
                    m.rcv_state = MemberState::Idle;
                    m.last_status = SocketStatus::Connected;
                });
            }
        }

        {
            let mut guard = listener.listener();
            if let Some(listener_state) = guard.as_mut() {
                listener_state.queued.insert(new_id);
            }
        }

        info!("{}: new connection {} from {:?} queued for acceptance", listener_id, new_id, peer);
        self.readiness
            .update_events(listener_id, Interest::READ, true);
        listener.accept_notify.notify_waiters();
        self.trigger.fire();

        AcceptOutcome::Fresh { id: new_id }
    }

    // ------------------------------------------------------------------
    // connect
    // ------------------------------------------------------------------

    pub async fn connect_in(
        &self,
        record: &Arc<SocketRecord>,
        target: SocketAddr,
        forced_isn: Option<SeqNumber>,
    ) -> Result<(), TransportError> {
        let status = record.control().status;
        match status {
            SocketStatus::Init => {
                if record.engine.is_rendezvous() {
                    return Err(TransportError::RendezvousUnbound);
                }
                // implicit bind with autoselected parameters, family taken
                //  from the target
                self.bind(record.id, BindTarget::Family(AddrFamily::of(&target)))?;
            }
            SocketStatus::Opened => {}
            _ => return Err(TransportError::AlreadyConnected),
        }

        {
            let mut control = record.control();
            control.status = SocketStatus::Connecting;
            control.peer_addr = Some(target);
        }

        debug!("{} connecting to {:?} (forced isn: {:?})", record.id, target, forced_isn);
        match record.engine.start_connect(target, forced_isn).await {
            Ok(()) => {}
            Err(e) => {
                record.control().status = SocketStatus::Opened;
                return Err(e);
            }
        }

        // in blocking mode the engine returns connected; otherwise completion
        //  is reported asynchronously through connect_complete
        if record.engine.is_connected() {
            self.connect_complete(record.id)?;
        }
        Ok(())
    }

    /// Finalize a connection establishment: stamp the local address, flip the
    ///  status, promote group membership, post readiness.
    pub fn connect_complete(&self, id: SocketId) -> Result<(), TransportError> {
        let record = self.locate(id)?;

        let self_addr = {
            let state = self.lock();
            record
                .control()
                .mux_id
                .and_then(|mux_id| state.muxers.get(&mux_id))
                .and_then(|mux| mux.channel.local_addr().ok())
        };

        {
            let mut control = record.control();
            control.status = SocketStatus::Connected;
            if self_addr.is_some() {
                control.self_addr = self_addr;
            }
            control.timestamp = Instant::now();
        }

        let group_id = record.control().group;
        if let Some(group_id) = group_id {
            if let Ok(group) = self.locate_group(group_id) {
                let mut seed_isn = false;
                {
                    let mut gstate = group.state();
                    if gstate.sched_isn.is_none() {
                        gstate.sched_isn = Some(record.engine.isn());
                        seed_isn = true;
                    }
                }
                if seed_isn {
                    debug!("{}: seeded group sequence from {}", group_id, id);
                }
                group.update_member(id, |m| {
                    m.snd_state = MemberState::Idle;
                    m.rcv_state = MemberState::Idle;
                    m.last_status = SocketStatus::Connected;
                });
                self.readiness
                    .update_events(group_id, Interest::WRITE, true);
            }
        }

        info!("{} connected", id);
        self.readiness.update_events(id, Interest::WRITE, true);
        Ok(())
    }

    // ------------------------------------------------------------------
    // close
    // ------------------------------------------------------------------

    pub async fn close(&self, id: SocketId) -> Result<(), TransportError> {
        let record = {
            let state = self.lock();
            match state.sockets.get(&id) {
                Some(record) => record.clone(),
                None => {
                    // closing an already closed socket succeeds silently
                    return if state.closed.contains_key(&id) {
                        Ok(())
                    }
                    else {
                        Err(TransportError::InvalidSocketId)
                    };
                }
            }
        };

        let sync_send = record.engine.is_sync_sending();

        if record.control().status == SocketStatus::Listening {
            if record.broken() {
                return Ok(());
            }
            debug!("{} closing listener - detaching from receive path immediately", id);
            record.control().timestamp = Instant::now();
            record.set_broken();

            // free the port's receive slot right away so it can be rebound;
            //  everything else is the collector's job
            record.engine.not_listening();

            // unblock every accept call so it observes the closed listener
            record.accept_notify.notify_waiters();
            self.readiness.update_events(id, Interest::ERROR, true);
            self.trigger.fire();
            return Ok(());
        }

        self.detach_from_group(&record);
        record.make_closed();

        {
            let mut state = self.lock();
            // re-check under the registry lock: the collector may have raced
            let still_live = state.sockets.remove(&id);
            match still_live {
                Some(entry) => {
                    state.closed.insert(id, entry);
                    debug!("{} moved to the closed table", id);
                }
                None => return Ok(()),
            }
        }

        self.readiness.update_events(id, Interest::ERROR, true);
        self.trigger.fire();

        if sync_send {
            self.wait_send_drained(&record).await;
        }
        Ok(())
    }

    /// Synchronous-send close: linger in the call until the send buffer
    ///  drained or the record was reclaimed.
    async fn wait_send_drained(&self, record: &Arc<SocketRecord>) {
        loop {
            if record.engine.snd_buffer_len() == 0 {
                return;
            }
            if !self.lock().closed.contains_key(&record.id) {
                // reclaimed in the meantime
                return;
            }
            if self.is_closing() {
                return;
            }
            self.trigger
                .wait_timeout(self.config.collector_interval)
                .await;
        }
    }

    fn detach_from_group(&self, record: &Arc<SocketRecord>) {
        let group_id = record.control().group.take();
        if let Some(group_id) = group_id {
            debug!("{} leaving {}", record.id, group_id);
            if let Ok(group) = self.locate_group(group_id) {
                group.remove_member(record.id);
            }
        }
    }

    // ------------------------------------------------------------------
    // address queries
    // ------------------------------------------------------------------

    pub fn peer_name(&self, id: SocketId) -> Result<SocketAddr, TransportError> {
        if self.get_status(id) != SocketStatus::Connected {
            return Err(TransportError::NotConnected);
        }
        let record = self.locate(id)?;
        if !record.engine.is_connected() || record.broken() {
            return Err(TransportError::NotConnected);
        }
        let peer_addr = record.control().peer_addr;
        peer_addr.ok_or(TransportError::NotConnected)
    }

    pub fn sock_name(&self, id: SocketId) -> Result<SocketAddr, TransportError> {
        let record = self.locate(id)?;
        if record.broken() {
            return Err(TransportError::InvalidSocketId);
        }
        let control = record.control();
        if control.status == SocketStatus::Init {
            return Err(TransportError::NotConnected);
        }
        control.self_addr.ok_or(TransportError::NotConnected)
    }

    // ------------------------------------------------------------------
    // groups
    // ------------------------------------------------------------------

    pub fn create_group(&self, kind: GroupType) -> Result<SocketId, TransportError> {
        let mut state = self.lock();
        let RegistryState { id_gen, groups, .. } = &mut *state;
        let id = id_gen.generate(true, |candidate| groups.contains_key(&candidate))?;
        groups.insert(id, Arc::new(Group::new(id, kind)));
        debug!("{} created ({:?})", id, kind);
        Ok(id)
    }

    pub fn add_socket_to_group(
        &self,
        socket: SocketId,
        group_id: SocketId,
    ) -> Result<(), TransportError> {
        if socket.is_group() || !group_id.is_group() {
            return Err(TransportError::InvalidParam("expected a socket and a group id"));
        }
        let record = self.locate(socket)?;
        let group = self.locate_group(group_id)?;

        if record.control().group.is_some() {
            return Err(TransportError::InvalidParam("socket is already in a group"));
        }

        let member = GroupMember {
            id: socket,
            peer: record.control().peer_addr,
            agent: record.control().self_addr,
            snd_state: MemberState::Pending,
            rcv_state: MemberState::Pending,
            last_status: record.get_status(),
        };
        group
            .add_explicit(member)
            .map_err(|_| TransportError::InvalidParam("managed group already has members"))?;
        record.control().group = Some(group_id);
        Ok(())
    }

    pub fn remove_socket_from_group(&self, socket: SocketId) -> Result<(), TransportError> {
        let record = self.locate(socket)?;
        let group_id = record
            .control()
            .group
            .ok_or(TransportError::InvalidParam("socket is not in a group"))?;
        let group = self.locate_group(group_id)?;
        group.remove_member(socket);
        record.control().group = None;
        Ok(())
    }

    pub fn group_of_socket(&self, socket: SocketId) -> Result<SocketId, TransportError> {
        let record = self.locate(socket)?;
        let group = record.control().group;
        group.ok_or(TransportError::InvalidParam("socket is not in a group"))
    }

    pub fn group_data(&self, group_id: SocketId) -> Result<Vec<GroupMemberData>, TransportError> {
        Ok(self.locate_group(group_id)?.member_data())
    }

    /// Connect a managed group to a set of targets: one new member connection
    ///  per target, all sharing the group's sequence space and option overlay.
    pub async fn group_connect(
        &self,
        group_id: SocketId,
        source: Option<SocketAddr>,
        targets: &[SocketAddr],
    ) -> Result<Vec<GroupConnectResult>, TransportError> {
        let group = self.locate_group(group_id)?;

        if !group.state().managed {
            return Err(TransportError::InvalidParam(
                "only managed groups can be connected as a whole",
            ));
        }
        if targets.is_empty() {
            return Err(TransportError::InvalidParam("no targets given"));
        }

        let overlay = group.state().options.clone();
        let blocking = group.state().blocking;
        let mut results = Vec::with_capacity(targets.len());

        for &target in targets {
            let result = self
                .group_connect_one(&group, group_id, source, target, &overlay)
                .await;
            match result {
                Ok(id) => results.push(GroupConnectResult {
                    target,
                    id: Some(id),
                    error: None,
                }),
                Err(e) => {
                    warn!("{}: connecting member to {:?} failed: {}", group_id, target, e);
                    results.push(GroupConnectResult {
                        target,
                        id: None,
                        error: Some(e),
                    });
                }
            }
        }

        if results.iter().all(|r| r.id.is_none()) {
            return Err(TransportError::NotConnected);
        }

        if blocking {
            self.wait_group_usable(&group).await?;
        }
        Ok(results)
    }

    async fn group_connect_one(
        &self,
        group: &Arc<Group>,
        group_id: SocketId,
        source: Option<SocketAddr>,
        target: SocketAddr,
        overlay: &crate::options::OptionOverlay,
    ) -> Result<SocketId, TransportError> {
        let id = self.new_socket()?;
        let record = self.locate(id)?;

        // the overlay is replayed onto every member before it connects
        for (key, value) in overlay.iter() {
            if let Err(e) = record.engine.set_option(*key, value.clone()) {
                error!("{}: replaying option {:?} onto {} failed", group_id, key, id);
                self.abandon_group_member(&record);
                return Err(e);
            }
        }
        record
            .engine
            .set_option(
                crate::options::SocketOption::GroupConnect,
                crate::options::OptionValue::Bool(true),
            )
            .ok();

        group.add_managed(GroupMember {
            id,
            peer: Some(target),
            agent: source,
            snd_state: MemberState::Pending,
            rcv_state: MemberState::Pending,
            last_status: SocketStatus::Connecting,
        });
        record.control().group = Some(group_id);

        if let Some(source) = source {
            if let Err(e) = self.bind(id, BindTarget::Addr(source)) {
                group.update_member(id, |m| {
                    m.snd_state = MemberState::Broken;
                    m.rcv_state = MemberState::Broken;
                });
                self.abandon_group_member(&record);
                return Err(e);
            }
        }

        let forced_isn = group.state().sched_isn;
        match self.connect_in(&record, target, forced_isn).await {
            Ok(()) => {}
            Err(e) => {
                group.update_member(id, |m| {
                    m.snd_state = MemberState::Broken;
                    m.rcv_state = MemberState::Broken;
                    m.last_status = SocketStatus::Broken;
                });
                self.abandon_group_member(&record);
                return Err(e);
            }
        }

        // the first member to start connecting seeds the shared sequence space
        {
            let mut gstate = group.state();
            if gstate.sched_isn.is_none() {
                gstate.sched_isn = Some(record.engine.isn());
            }
        }

        let status = record.get_status();
        group.update_member(id, |m| {
            m.last_status = status;
            if status == SocketStatus::Broken || status == SocketStatus::Closed {
                m.snd_state = MemberState::Broken;
                m.rcv_state = MemberState::Broken;
            }
        });

        Ok(id)
    }

    /// Drop a member whose setup failed, without waiting for the collector.
    fn abandon_group_member(&self, record: &Arc<SocketRecord>) {
        self.detach_from_group(record);
        record.make_closed();
        let mut state = self.lock();
        if let Some(entry) = state.sockets.remove(&record.id) {
            state.closed.insert(record.id, entry);
        }
    }

    async fn wait_group_usable(&self, group: &Arc<Group>) -> Result<(), TransportError> {
        loop {
            let notified = group.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if group.any_member_usable() {
                return Ok(());
            }
            if group.all_members_broken() {
                return Err(TransportError::NotConnected);
            }
            if self.is_closing() {
                return Err(TransportError::NotConnected);
            }
            notified.await;
        }
    }

    pub fn close_group(&self, group_id: SocketId) -> Result<Vec<SocketId>, TransportError> {
        let group = self.locate_group(group_id)?;
        let members: Vec<SocketId> = group.state().members.iter().map(|m| m.id).collect();
        self.lock().groups.remove(&group_id);
        self.readiness.scrub_subject(group_id);
        Ok(members)
    }

    // ------------------------------------------------------------------
    // collector passes
    // ------------------------------------------------------------------

    /// One collector sweep. Pass 1 moves broken live records to the closed
    ///  table (with listener grace and receive-data hysteresis); pass 2
    ///  resolves linger and reclaims quiescent closed records.
    pub fn check_broken_sockets(&self, force: bool) {
        let mut state = self.lock();
        let now = Instant::now();

        let mut to_close: Vec<SocketId> = Vec::new();
        for (id, record) in &state.sockets {
            if !record.broken() {
                continue;
            }

            let (status, timestamp) = {
                let control = record.control();
                (control.status, control.timestamp)
            };

            if status == SocketStatus::Listening {
                // grant a closing listener time to adapt clients that are
                //  mid-handshake
                if now.duration_since(timestamp) < self.config.listener_grace && !force {
                    continue;
                }
            }
            else if record.engine.rcv_data_available() && !force {
                // still undelivered data: hold the record for a bounded
                //  number of passes
                let mut control = record.control();
                if control.broken_counter > 0 {
                    control.broken_counter -= 1;
                    continue;
                }
            }

            to_close.push(*id);
        }

        for id in to_close {
            let record = match state.sockets.remove(&id) {
                Some(record) => record,
                None => continue,
            };
            {
                let mut control = record.control();
                control.status = SocketStatus::Closed;
                control.timestamp = now;
            }
            trace!("collector: {} moved to closed table", id);

            Self::evict_from_listener(&state, &record);
            state.closed.insert(id, record);
        }

        // pass 2: linger resolution and reclamation
        let mut to_remove: Vec<SocketId> = Vec::new();
        for (id, record) in &state.closed {
            if let Some(deadline) = record.engine.linger_deadline() {
                if record.engine.snd_buffer_len() == 0 || now >= deadline {
                    record.engine.clear_linger();
                    record.engine.set_closing();
                    record.control().timestamp = now;
                }
                else {
                    continue;
                }
            }

            let quiescent =
                now.duration_since(record.control().timestamp) > self.config.reclaim_quiescence;
            if (quiescent || force) && !record.engine.on_receive_list() {
                to_remove.push(*id);
            }
        }

        for id in to_remove {
            Self::remove_socket(&mut state, &self.readiness, id);
        }
    }

    /// Remove a closed record for good: unhook queued children (for a
    ///  listener), drop the peer index entry, scrub readiness state, release
    ///  the multiplexer.
    fn remove_socket(state: &mut RegistryState, readiness: &ReadinessService, id: SocketId) {
        let record = match state.closed.remove(&id) {
            Some(record) => record,
            None => return,
        };
        debug!("collector: reclaiming {}", id);

        // a listener drags its never-accepted children into the closed table
        let queued: Vec<SocketId> = record
            .listener()
            .as_ref()
            .map(|l| l.queued.iter().copied().collect())
            .unwrap_or_default();
        for child_id in queued {
            match state.sockets.remove(&child_id) {
                Some(child) => {
                    child.make_closed();
                    state.closed.insert(child_id, child);
                }
                None => {
                    warn!("collector: queued child {} of {} is gone already", child_id, id);
                }
            }
        }

        let (peer_spec, mux_id) = {
            let control = record.control();
            (control.peer_spec, control.mux_id)
        };

        if let Some(spec) = peer_spec {
            if let Some(ids) = state.peer_index.get_mut(&spec) {
                ids.remove(&id);
                if ids.is_empty() {
                    state.peer_index.remove(&spec);
                }
            }
        }

        // a reclaimed id must never surface from a readiness wait again
        readiness.scrub_subject(id);

        record.make_closed();
        drop(record);

        if let Some(mux_id) = mux_id {
            Self::release_mux(state, mux_id);
        }
    }

    fn evict_from_listener(state: &RegistryState, record: &Arc<SocketRecord>) {
        let parent = record.control().listen_parent;
        let Some(parent) = parent else { return };

        let listener = state
            .sockets
            .get(&parent)
            .or_else(|| state.closed.get(&parent));
        if let Some(listener) = listener {
            let mut guard = listener.listener();
            if let Some(listener_state) = guard.as_mut() {
                listener_state.queued.remove(&record.id);
                listener_state.accepted.remove(&record.id);
            }
        }
    }

    /// Global close: everything still live moves to the closed table, ready
    ///  for the collector's final drain.
    pub fn close_all_live(&self) {
        let records: Vec<Arc<SocketRecord>> = {
            let state = self.lock();
            state.sockets.values().cloned().collect()
        };

        for record in &records {
            self.detach_from_group(record);
            record.make_closed();
            record.accept_notify.notify_waiters();
        }

        let mut state = self.lock();
        for record in records {
            Self::evict_from_listener(&state, &record);
            if let Some(entry) = state.sockets.remove(&record.id) {
                state.closed.insert(record.id, entry);
            }
        }
        state.groups.clear();
    }

    pub fn closed_table_empty(&self) -> bool {
        self.lock().closed.is_empty()
    }

    /// Test and diagnostics support: the refcount of the multiplexer a socket
    ///  is attached to.
    #[cfg(test)]
    pub fn mux_refcount(&self, id: SocketId) -> Option<usize> {
        let state = self.lock();
        let record = state.sockets.get(&id).or_else(|| state.closed.get(&id))?;
        let mux_id = record.control().mux_id?;
        state.muxers.get(&mux_id).map(|m| m.refcount)
    }

    #[cfg(test)]
    pub fn mux_table_len(&self) -> usize {
        self.lock().muxers.len()
    }

    #[cfg(test)]
    pub fn live_table_len(&self) -> usize {
        self.lock().sockets.len()
    }
}
