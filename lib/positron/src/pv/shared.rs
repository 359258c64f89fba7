//! The shared-state broker: one cached structured value per PV, any number
//! of client subscriptions multiplexed over it.
//!
//! Locking discipline: the PV mutex guards the cache and the subscriber
//! lists, nothing else. Handler callbacks and subscriber callbacks always
//! run after the mutex is released; mutating paths snapshot the affected
//! subscribers under the lock and iterate the snapshot unlocked.

use crate::data::bitset::BitSet;
use crate::data::request::{Mapper, Request};
use crate::data::status::Status;
use crate::data::value::{Field, PVStructure, Structure};
use crate::net::shared::{NetError, NetResult};
use crate::pv::fifo::{MonitorFIFO, DEFAULT_QUEUE_SIZE};
use crate::pv::{
    ChannelMonitor, ChannelPut, ChannelRequester, ChannelRpc, ChannelStateEvent, GetFieldRequester,
    MonitorElement, MonitorRequester, Operation, ProviderChannel, PutRequester, RpcRequester,
};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone)]
pub struct PvConfig {
    /// Updates whose mapped change set is empty are not queued.
    pub drop_empty_updates: bool,
    /// Full monitor queues drop the oldest element instead of squashing
    /// into the newest.
    pub drop_on_full: bool,
    /// Monitor queue bound; 0 selects the default.
    pub queue_size: usize,
}

impl Default for PvConfig {
    fn default() -> PvConfig {
        PvConfig {
            drop_empty_updates: true,
            drop_on_full: false,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

/// PV-level behavior. `on_put`/`on_rpc` own the operation and must
/// complete it; the defaults decline.
pub trait PvHandler: Send + Sync {
    fn on_first_connect(&self, _pv: &Arc<SharedPV>) {}
    fn on_last_disconnect(&self, _pv: &Arc<SharedPV>) {}

    fn on_put(&self, _pv: &Arc<SharedPV>, op: Operation) {
        op.complete_with(Status::error("Put not supported"));
    }

    fn on_rpc(&self, _pv: &Arc<SharedPV>, op: Operation) {
        op.complete_with(Status::error("RPC not supported"));
    }
}

/// The preset that makes a PV a plain mailbox: a put stores the value.
pub struct MailboxHandler;

impl PvHandler for MailboxHandler {
    fn on_put(&self, pv: &Arc<SharedPV>, op: Operation) {
        let _ = pv.post(op.value(), op.changed());
        op.complete();
    }
}

struct PvState {
    handler: Option<Arc<dyn PvHandler>>,
    typ: Option<Arc<Structure>>,
    current: Option<PVStructure>,
    valid: BitSet,
    puts: Vec<Weak<SharedPut>>,
    rpcs: Vec<Weak<SharedRpc>>,
    monitors: Vec<Weak<SharedMonitor>>,
    channels: Vec<Weak<SharedChannel>>,
    getfields: Vec<(Weak<dyn GetFieldRequester>, String)>,
    notified_conn: bool,
}

pub struct SharedPV {
    config: PvConfig,
    state: Mutex<PvState>,
    self_ref: Mutex<Weak<SharedPV>>,
}

impl SharedPV {
    pub fn build(handler: Arc<dyn PvHandler>, config: PvConfig) -> Arc<SharedPV> {
        SharedPV::build_inner(Some(handler), config)
    }

    pub fn build_mailbox(config: PvConfig) -> Arc<SharedPV> {
        SharedPV::build_inner(Some(Arc::new(MailboxHandler)), config)
    }

    /// A PV with no handler: puts and RPCs are declined.
    pub fn build_read_only(config: PvConfig) -> Arc<SharedPV> {
        SharedPV::build_inner(None, config)
    }

    fn build_inner(handler: Option<Arc<dyn PvHandler>>, config: PvConfig) -> Arc<SharedPV> {
        let pv = Arc::new(SharedPV {
            config,
            state: Mutex::new(PvState {
                handler,
                typ: None,
                current: None,
                valid: BitSet::new(),
                puts: Vec::new(),
                rpcs: Vec::new(),
                monitors: Vec::new(),
                channels: Vec::new(),
                getfields: Vec::new(),
                notified_conn: false,
            }),
            self_ref: Mutex::new(Weak::new()),
        });
        *pv.self_ref.lock().unwrap() = Arc::downgrade(&pv);
        pv
    }

    fn self_arc(&self) -> Arc<SharedPV> {
        self.self_ref
            .lock()
            .unwrap()
            .upgrade()
            .expect("SharedPV self reference must stay valid")
    }

    pub fn set_handler(&self, handler: Arc<dyn PvHandler>) {
        let mut state = self.state.lock().unwrap();
        state.handler = Some(handler);
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.typ.is_some()
    }

    /// Transitions closed -> open, stamping the type and delivering
    /// connect results to every subscriber that arrived early. Fails
    /// without side effects when already open.
    pub fn open(&self, value: &PVStructure, valid: &BitSet) -> NetResult<()> {
        let mut p_puts: Vec<(Arc<dyn PutRequester>, Status, Option<Arc<Structure>>)> = Vec::new();
        let mut p_rpcs: Vec<Arc<dyn RpcRequester>> = Vec::new();
        let mut p_monitors: Vec<(Arc<SharedMonitor>, Option<(Status, Option<Arc<Structure>>)>, bool)> =
            Vec::new();
        let mut p_getfields: Vec<(Arc<dyn GetFieldRequester>, Status, Option<Field>)> = Vec::new();

        {
            let mut state = self.state.lock().unwrap();
            if state.typ.is_some() {
                return Err(NetError::InvalidArgument("already open".to_owned()));
            }

            let typ = value.structure().clone();
            let mut current = PVStructure::new_default(typ.clone());
            current.copy_from_masked(value, valid);

            state.typ = Some(typ.clone());
            state.current = Some(current);
            state.valid = valid.clone();

            state.puts.retain(|weak| weak.upgrade().is_some());
            for weak in &state.puts {
                let put = match weak.upgrade() {
                    Some(put) => put,
                    None => continue,
                };
                if put.channel.is_dead() {
                    continue;
                }
                let requester = match put.requester.upgrade() {
                    Some(requester) => requester,
                    None => continue,
                };
                match Mapper::compute(&typ, &put.request) {
                    Ok(mapper) => {
                        let requested = mapper.requested().clone();
                        *put.mapper.lock().unwrap() = Some(mapper);
                        p_puts.push((requester, Status::ok(), Some(requested)));
                    }
                    Err(message) => {
                        p_puts.push((requester, Status::error(message), None));
                    }
                }
            }

            state.rpcs.retain(|weak| weak.upgrade().is_some());
            for weak in &state.rpcs {
                let rpc = match weak.upgrade() {
                    Some(rpc) => rpc,
                    None => continue,
                };
                if rpc.channel.is_dead() {
                    continue;
                }
                let mut connected = rpc.connected.lock().unwrap();
                if !*connected {
                    *connected = true;
                    if let Some(requester) = rpc.requester.upgrade() {
                        p_rpcs.push(requester);
                    }
                }
            }

            state.monitors.retain(|weak| weak.upgrade().is_some());
            let current_ref = state.current.as_ref().expect("just stored");
            let valid_ref = &state.valid;
            for weak in &state.monitors {
                let monitor = match weak.upgrade() {
                    Some(monitor) => monitor,
                    None => continue,
                };
                if monitor.channel.is_dead() {
                    continue;
                }
                let (connect, notify) = monitor.open_locked(&typ, current_ref, valid_ref, &self.config);
                p_monitors.push((monitor, connect, notify));
            }

            for (weak, subfield) in state.getfields.drain(..) {
                if let Some(requester) = weak.upgrade() {
                    let (status, field) = resolve_subfield(&typ, &subfield);
                    p_getfields.push((requester, status, field));
                }
            }
        }

        for (requester, status, requested) in p_puts {
            requester.channel_put_connect(status, requested);
        }
        for requester in p_rpcs {
            requester.channel_rpc_connect(Status::ok());
        }
        for (monitor, connect, notify) in p_monitors {
            if let Some((status, requested)) = connect {
                if let Some(requester) = monitor.requester.upgrade() {
                    requester.monitor_connect(status, requested);
                }
            }
            if notify {
                monitor.notify();
            }
        }
        for (requester, status, field) in p_getfields {
            requester.get_done(status, field);
        }
        Ok(())
    }

    /// Opens with every field of `value` considered valid.
    pub fn open_value(&self, value: PVStructure) -> NetResult<()> {
        self.open(&value, &BitSet::of(0))
    }

    /// Opens with a default-initialized value of `typ`.
    pub fn open_type(&self, typ: Arc<Structure>) -> NetResult<()> {
        self.open_value(PVStructure::new_default(typ))
    }

    /// Transitions open -> closed (a no-op when already closed). Every
    /// subscriber sees a disconnect; with `destroy` the subscriber lists
    /// are cleared so future connects start fresh.
    pub fn close(&self, destroy: bool) {
        let mut p_puts: Vec<Arc<dyn PutRequester>> = Vec::new();
        let mut p_rpcs: Vec<Arc<dyn RpcRequester>> = Vec::new();
        let mut p_monitors: Vec<Arc<dyn MonitorRequester>> = Vec::new();
        let mut p_channels: Vec<Arc<dyn ChannelRequester>> = Vec::new();
        let mut p_handler: Option<(Arc<dyn PvHandler>, Arc<SharedPV>)> = None;

        {
            let mut state = self.state.lock().unwrap();

            if state.typ.is_some() {
                for weak in &state.puts {
                    if let Some(put) = weak.upgrade() {
                        *put.mapper.lock().unwrap() = None;
                        if let Some(requester) = put.requester.upgrade() {
                            p_puts.push(requester);
                        }
                    }
                }
                for weak in &state.rpcs {
                    if let Some(rpc) = weak.upgrade() {
                        let mut connected = rpc.connected.lock().unwrap();
                        if *connected {
                            *connected = false;
                            if let Some(requester) = rpc.requester.upgrade() {
                                p_rpcs.push(requester);
                            }
                        }
                    }
                }
                for weak in &state.monitors {
                    if let Some(monitor) = weak.upgrade() {
                        monitor.close_locked();
                        if let Some(requester) = monitor.requester.upgrade() {
                            p_monitors.push(requester);
                        }
                    }
                }
                for weak in &state.channels {
                    if let Some(channel) = weak.upgrade() {
                        if let Some(requester) = channel.requester.upgrade() {
                            p_channels.push(requester);
                        }
                    }
                }
                state.typ = None;
                state.current = None;
                state.valid = BitSet::new();
            }

            if destroy {
                state.puts.clear();
                state.rpcs.clear();
                state.monitors.clear();
                if !state.channels.is_empty() && state.notified_conn {
                    if let Some(handler) = state.handler.clone() {
                        p_handler = Some((handler, self.self_arc()));
                    }
                    state.notified_conn = false;
                }
                state.channels.clear();
            }
        }

        for requester in p_puts {
            requester.channel_disconnect(destroy);
        }
        for requester in p_rpcs {
            requester.channel_disconnect(destroy);
        }
        for requester in p_monitors {
            if destroy {
                requester.unlisten();
            } else {
                requester.channel_disconnect(false);
            }
        }
        let event = if destroy {
            ChannelStateEvent::Destroyed
        } else {
            ChannelStateEvent::Disconnected
        };
        for requester in p_channels {
            requester.channel_state_change(event);
        }
        if let Some((handler, pv)) = p_handler {
            handler.on_last_disconnect(&pv);
        }
    }

    /// Folds the marked fields of `value` into the cache and queues a
    /// monitor update for every subscriber.
    pub fn post(&self, value: &PVStructure, changed: &BitSet) -> NetResult<()> {
        let mut p_monitors: Vec<Arc<SharedMonitor>> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let typ = match &state.typ {
                Some(typ) => typ.clone(),
                None => return Err(NetError::InvalidArgument("not open".to_owned())),
            };
            if value.structure() != &typ {
                return Err(NetError::InvalidArgument("type mismatch".to_owned()));
            }

            if let Some(current) = state.current.as_mut() {
                current.copy_from_masked(value, changed);
            }
            state.valid.or_with(changed);

            state.monitors.retain(|weak| weak.upgrade().is_some());
            for weak in &state.monitors {
                if let Some(monitor) = weak.upgrade() {
                    if monitor.post_locked(value, changed) {
                        p_monitors.push(monitor);
                    }
                }
            }
        }
        for monitor in p_monitors {
            monitor.notify();
        }
        Ok(())
    }

    /// Snapshot of the cache and its valid set.
    pub fn fetch(&self) -> Option<(PVStructure, BitSet)> {
        let state = self.state.lock().unwrap();
        let current = state.current.as_ref()?;
        Some((current.clone(), state.valid.clone()))
    }

    /// Allocates a fresh value of the PV's current type.
    pub fn build_value(&self) -> Option<PVStructure> {
        let state = self.state.lock().unwrap();
        state.typ.as_ref().map(|typ| PVStructure::new_default(typ.clone()))
    }

    /// Creates a channel against this PV. Fires `on_first_connect` when
    /// this is the first live channel.
    pub fn connect(&self, channel_name: &str, requester: Arc<dyn ChannelRequester>) -> Arc<dyn ProviderChannel> {
        let pv = self.self_arc();
        let channel = Arc::new(SharedChannel {
            pv: pv.clone(),
            name: channel_name.to_owned(),
            requester: Arc::downgrade(&requester),
            self_ref: Mutex::new(Weak::new()),
            dead: Mutex::new(false),
        });
        *channel.self_ref.lock().unwrap() = Arc::downgrade(&channel);

        let first = {
            let mut state = self.state.lock().unwrap();
            state.channels.retain(|weak| weak.upgrade().is_some());
            state.channels.push(Arc::downgrade(&channel));
            if !state.notified_conn {
                state.notified_conn = true;
                state.handler.clone()
            } else {
                None
            }
        };
        if let Some(handler) = first {
            handler.on_first_connect(&pv);
        }
        channel
    }

    fn handler(&self) -> Option<Arc<dyn PvHandler>> {
        let state = self.state.lock().unwrap();
        state.handler.clone()
    }

    fn drop_channel(&self, channel: &SharedChannel) {
        let handler = {
            let mut state = self.state.lock().unwrap();
            state
                .channels
                .retain(|weak| match weak.upgrade() {
                    Some(live) => !std::ptr::eq(live.as_ref(), channel),
                    None => false,
                });
            if state.channels.is_empty() && state.notified_conn {
                state.notified_conn = false;
                state.handler.clone()
            } else {
                None
            }
        };
        if let Some(handler) = handler {
            handler.on_last_disconnect(&self.self_arc());
        }
    }
}

fn resolve_subfield(typ: &Arc<Structure>, subfield: &str) -> (Status, Option<Field>) {
    if subfield.is_empty() {
        return (Status::ok(), Some(Field::Structure(typ.clone())));
    }
    let path: Vec<String> = subfield.split('.').map(str::to_owned).collect();
    match typ.resolve(&path) {
        Some((indices, _)) => {
            let mut field = Field::Structure(typ.clone());
            for index in indices {
                field = match field {
                    Field::Structure(structure) => structure.fields()[index].1.clone(),
                    _ => unreachable!("resolve checked the path"),
                };
            }
            (Status::ok(), Some(field))
        }
        None => (Status::error(format!("no field '{}'", subfield)), None),
    }
}

/// Provider-side channel bound to one PV.
pub struct SharedChannel {
    pv: Arc<SharedPV>,
    name: String,
    requester: Weak<dyn ChannelRequester>,
    self_ref: Mutex<Weak<SharedChannel>>,
    dead: Mutex<bool>,
}

impl SharedChannel {
    fn self_arc(&self) -> Arc<SharedChannel> {
        self.self_ref
            .lock()
            .unwrap()
            .upgrade()
            .expect("SharedChannel self reference must stay valid")
    }

    fn is_dead(&self) -> bool {
        *self.dead.lock().unwrap()
    }
}

impl ProviderChannel for SharedChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_field(&self, requester: Arc<dyn GetFieldRequester>, subfield: &str) {
        let resolved = {
            let mut state = self.pv.state.lock().unwrap();
            match &state.typ {
                Some(typ) => Some(resolve_subfield(typ, subfield)),
                None => {
                    state
                        .getfields
                        .push((Arc::downgrade(&requester), subfield.to_owned()));
                    None
                }
            }
        };
        if let Some((status, field)) = resolved {
            requester.get_done(status, field);
        }
    }

    fn create_put(&self, requester: Arc<dyn PutRequester>, request: Request) -> Arc<dyn ChannelPut> {
        let put = Arc::new(SharedPut {
            channel: self.self_arc(),
            requester: Arc::downgrade(&requester),
            request,
            mapper: Mutex::new(None),
        });

        let connect = {
            let mut state = self.pv.state.lock().unwrap();
            state.puts.push(Arc::downgrade(&put));
            match &state.typ {
                Some(typ) => match Mapper::compute(typ, &put.request) {
                    Ok(mapper) => {
                        let requested = mapper.requested().clone();
                        *put.mapper.lock().unwrap() = Some(mapper);
                        Some((Status::ok(), Some(requested)))
                    }
                    Err(message) => Some((Status::error(message), None)),
                },
                None => None,
            }
        };
        if let Some((status, requested)) = connect {
            requester.channel_put_connect(status, requested);
        }
        put
    }

    fn create_rpc(&self, requester: Arc<dyn RpcRequester>, request: Request) -> Arc<dyn ChannelRpc> {
        let rpc = Arc::new(SharedRpc {
            channel: self.self_arc(),
            requester: Arc::downgrade(&requester),
            _request: request,
            connected: Mutex::new(false),
        });

        let connect = {
            let mut state = self.pv.state.lock().unwrap();
            state.rpcs.push(Arc::downgrade(&rpc));
            if state.typ.is_some() {
                *rpc.connected.lock().unwrap() = true;
                true
            } else {
                false
            }
        };
        if connect {
            requester.channel_rpc_connect(Status::ok());
        }
        rpc
    }

    fn create_monitor(
        &self,
        requester: Arc<dyn MonitorRequester>,
        request: Request,
    ) -> NetResult<Arc<dyn ChannelMonitor>> {
        let pipeline = request.pipeline;
        let queue_size = if request.queue_size > 0 {
            request.queue_size
        } else {
            self.pv.config.queue_size
        };
        let monitor = Arc::new(SharedMonitor {
            pv: self.pv.clone(),
            channel: self.self_arc(),
            requester: Arc::downgrade(&requester),
            request,
            state: Mutex::new(MonitorState {
                mapper: None,
                fifo: MonitorFIFO::new(queue_size, self.pv.config.drop_on_full, pipeline),
                connected: false,
            }),
        });

        let actions = {
            let mut state = self.pv.state.lock().unwrap();
            state.monitors.push(Arc::downgrade(&monitor));
            match (&state.typ, &state.current) {
                (Some(typ), Some(current)) => {
                    let typ = typ.clone();
                    let (connect, notify) =
                        monitor.open_locked(&typ, current, &state.valid, &self.pv.config);
                    Some((connect, notify))
                }
                _ => None,
            }
        };
        if let Some((connect, notify)) = actions {
            if let Some((status, requested)) = connect {
                requester.monitor_connect(status, requested);
            }
            if notify {
                monitor.notify();
            }
        }
        Ok(monitor)
    }

    fn destroy(&self) {
        {
            let mut dead = self.dead.lock().unwrap();
            if *dead {
                return;
            }
            *dead = true;
        }
        self.pv.drop_channel(self);
        if let Some(requester) = self.requester.upgrade() {
            requester.channel_state_change(ChannelStateEvent::Destroyed);
        }
    }
}

/// Serves both read and write access to the selected sub-value; the GET
/// wire operation uses only the `get` half.
pub struct SharedPut {
    channel: Arc<SharedChannel>,
    requester: Weak<dyn PutRequester>,
    request: Request,
    /// Present exactly while the PV is open; guarded by the PV mutex.
    mapper: Mutex<Option<Mapper>>,
}

impl ChannelPut for SharedPut {
    fn put(&self, value: PVStructure, changed: BitSet) {
        enum Outcome {
            Fail(Status),
            Run(Arc<dyn PvHandler>, Operation),
        }

        let outcome = {
            let state = self.channel.pv.state.lock().unwrap();
            if self.channel.is_dead() {
                Outcome::Fail(Status::error("dead channel"))
            } else {
                let mapper = self.mapper.lock().unwrap();
                match (&*mapper, &state.typ) {
                    (Some(mapper), Some(typ)) => {
                        if value.structure() != mapper.requested() {
                            Outcome::Fail(Status::error("type changed"))
                        } else {
                            let mut base = PVStructure::new_default(typ.clone());
                            let mut base_changed = BitSet::new();
                            mapper.copy_requested_to_base(&value, &changed, &mut base, &mut base_changed);
                            match state.handler.clone() {
                                Some(handler) => Outcome::Run(
                                    handler,
                                    Operation::put(base, base_changed, self.requester.clone()),
                                ),
                                None => Outcome::Fail(Status::error("Put not supported")),
                            }
                        }
                    }
                    _ => Outcome::Fail(Status::error("not open")),
                }
            }
        };

        match outcome {
            Outcome::Fail(status) => {
                if let Some(requester) = self.requester.upgrade() {
                    requester.put_done(status);
                }
            }
            Outcome::Run(handler, op) => {
                let pv = self.channel.pv.self_arc();
                handler.on_put(&pv, op);
            }
        }
    }

    fn get(&self) {
        let result = {
            let state = self.channel.pv.state.lock().unwrap();
            if self.channel.is_dead() {
                Err(Status::error("dead channel"))
            } else {
                let mapper = self.mapper.lock().unwrap();
                match (&*mapper, &state.current) {
                    (Some(mapper), Some(current)) => {
                        let mut requested = mapper.build_requested();
                        let mut changed = BitSet::new();
                        mapper.copy_base_to_requested(current, &state.valid, &mut requested, &mut changed);
                        Ok((requested, changed))
                    }
                    _ => Err(Status::error("not open")),
                }
            }
        };

        if let Some(requester) = self.requester.upgrade() {
            match result {
                Ok((value, changed)) => requester.get_done(Status::ok(), Some((value, changed))),
                Err(status) => requester.get_done(status, None),
            }
        }
    }

    fn destroy(&self) {
        let mut state = self.channel.pv.state.lock().unwrap();
        state.puts.retain(|weak| match weak.upgrade() {
            Some(live) => !std::ptr::eq(live.as_ref(), self),
            None => false,
        });
    }
}

pub struct SharedRpc {
    channel: Arc<SharedChannel>,
    requester: Weak<dyn RpcRequester>,
    _request: Request,
    /// Whether the connect callback has fired; reset on close.
    connected: Mutex<bool>,
}

impl ChannelRpc for SharedRpc {
    fn request(&self, args: PVStructure) {
        let outcome = {
            let state = self.channel.pv.state.lock().unwrap();
            if self.channel.is_dead() {
                Err(Status::error("dead channel"))
            } else {
                match state.handler.clone() {
                    Some(handler) => Ok(handler),
                    None => Err(Status::error("RPC not supported")),
                }
            }
        };

        match outcome {
            Ok(handler) => {
                let op = Operation::rpc(args, self.requester.clone());
                let pv = self.channel.pv.self_arc();
                handler.on_rpc(&pv, op);
            }
            Err(status) => {
                if let Some(requester) = self.requester.upgrade() {
                    requester.request_done(status, None);
                }
            }
        }
    }

    fn destroy(&self) {
        let mut state = self.channel.pv.state.lock().unwrap();
        state.rpcs.retain(|weak| match weak.upgrade() {
            Some(live) => !std::ptr::eq(live.as_ref(), self),
            None => false,
        });
    }
}

struct MonitorState {
    mapper: Option<Mapper>,
    fifo: MonitorFIFO,
    connected: bool,
}

pub struct SharedMonitor {
    pv: Arc<SharedPV>,
    channel: Arc<SharedChannel>,
    requester: Weak<dyn MonitorRequester>,
    request: Request,
    state: Mutex<MonitorState>,
}

impl SharedMonitor {
    /// Called with the PV mutex held. Returns the connect callback to fire
    /// (first open only) and whether a notify is due.
    fn open_locked(
        &self,
        typ: &Arc<Structure>,
        current: &PVStructure,
        valid: &BitSet,
        _config: &PvConfig,
    ) -> (Option<(Status, Option<Arc<Structure>>)>, bool) {
        let mut state = self.state.lock().unwrap();
        match Mapper::compute(typ, &self.request) {
            Ok(mapper) => {
                let requested = mapper.requested().clone();
                let mut value = mapper.build_requested();
                let mut changed = BitSet::new();
                mapper.copy_base_to_requested(current, valid, &mut value, &mut changed);

                state.fifo.clear();
                state.fifo.post(MonitorElement {
                    value,
                    changed,
                    overrun: BitSet::new(),
                });
                state.mapper = Some(mapper);

                let connect = if !state.connected {
                    state.connected = true;
                    Some((Status::ok(), Some(requested)))
                } else {
                    None
                };
                (connect, true)
            }
            Err(message) => {
                let connect = if !state.connected {
                    state.connected = true;
                    Some((Status::error(message), None))
                } else {
                    None
                };
                (connect, false)
            }
        }
    }

    /// Called with the PV mutex held. Returns true when the requester
    /// should be notified.
    fn post_locked(&self, value: &PVStructure, changed: &BitSet) -> bool {
        let mut state = self.state.lock().unwrap();
        let mapper = match &state.mapper {
            Some(mapper) => mapper,
            None => return false,
        };

        let mut element = MonitorElement {
            value: mapper.build_requested(),
            changed: BitSet::new(),
            overrun: BitSet::new(),
        };
        mapper.copy_base_to_requested(value, changed, &mut element.value, &mut element.changed);

        if element.changed.is_empty() && self.pv.config.drop_empty_updates {
            return false;
        }
        state.fifo.post(element)
    }

    fn close_locked(&self) {
        let mut state = self.state.lock().unwrap();
        state.mapper = None;
        state.fifo.clear();
    }

    fn notify(&self) {
        if let Some(requester) = self.requester.upgrade() {
            requester.monitor_event();
        }
    }
}

impl ChannelMonitor for SharedMonitor {
    fn poll(&self) -> Option<MonitorElement> {
        let mut state = self.state.lock().unwrap();
        state.fifo.poll()
    }

    fn ack(&self, count: u32) {
        let deliverable = {
            let mut state = self.state.lock().unwrap();
            state.fifo.ack(count)
        };
        if deliverable {
            self.notify();
        }
    }

    fn destroy(&self) {
        let mut state = self.pv.state.lock().unwrap();
        state.monitors.retain(|weak| match weak.upgrade() {
            Some(live) => !std::ptr::eq(live.as_ref(), self),
            None => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::value::{PVField, ScalarKind};
    use std::sync::Mutex as StdMutex;

    fn int_type() -> Arc<Structure> {
        Structure::new(
            "test:mailbox",
            vec![("value".to_owned(), Field::Scalar(ScalarKind::Int))],
        )
    }

    fn int_value(value: i32) -> PVStructure {
        let mut pv = PVStructure::new_default(int_type());
        pv.set("value", PVField::Int(value)).unwrap();
        pv
    }

    #[derive(Default)]
    struct Events {
        log: StdMutex<Vec<String>>,
    }

    impl Events {
        fn push(&self, event: String) {
            self.log.lock().unwrap().push(event);
        }

        fn take(&self) -> Vec<String> {
            std::mem::replace(&mut *self.log.lock().unwrap(), Vec::new())
        }
    }

    struct RecordingChannelRequester(Arc<Events>);

    impl ChannelRequester for RecordingChannelRequester {
        fn channel_state_change(&self, event: ChannelStateEvent) {
            self.0.push(format!("state:{:?}", event));
        }
    }

    struct RecordingPutRequester(Arc<Events>);

    impl PutRequester for RecordingPutRequester {
        fn channel_put_connect(&self, status: Status, requested: Option<Arc<Structure>>) {
            self.0.push(format!(
                "connect:{}:{}",
                status.is_ok(),
                requested.map(|t| t.len()).unwrap_or(0)
            ));
        }

        fn put_done(&self, status: Status) {
            self.0.push(format!("put_done:{}", status.is_ok()));
        }

        fn get_done(&self, status: Status, value: Option<(PVStructure, BitSet)>) {
            let rendered = value
                .and_then(|(value, _)| value.get("value").and_then(|field| field.as_int()))
                .map(|value| value.to_string())
                .unwrap_or_else(|| "-".to_owned());
            self.0.push(format!("get_done:{}:{}", status.is_ok(), rendered));
        }

        fn channel_disconnect(&self, destroyed: bool) {
            self.0.push(format!("disconnect:{}", destroyed));
        }
    }

    struct RecordingMonitorRequester(Arc<Events>);

    impl MonitorRequester for RecordingMonitorRequester {
        fn monitor_connect(&self, status: Status, _requested: Option<Arc<Structure>>) {
            self.0.push(format!("mon_connect:{}", status.is_ok()));
        }

        fn monitor_event(&self) {
            self.0.push("mon_event".to_owned());
        }

        fn unlisten(&self) {
            self.0.push("unlisten".to_owned());
        }

        fn channel_disconnect(&self, destroyed: bool) {
            self.0.push(format!("mon_disconnect:{}", destroyed));
        }
    }

    // the broker holds subscribers weakly, so helpers hand the strong
    // requester refs back to the test to keep callbacks flowing
    fn mailbox() -> (
        Arc<SharedPV>,
        Arc<dyn ProviderChannel>,
        Arc<Events>,
        Arc<dyn ChannelRequester>,
    ) {
        let pv = SharedPV::build_mailbox(PvConfig::default());
        let events = Arc::new(Events::default());
        let requester: Arc<dyn ChannelRequester> =
            Arc::new(RecordingChannelRequester(events.clone()));
        let channel = pv.connect("pv1", requester.clone());
        (pv, channel, events, requester)
    }

    #[test]
    fn test_open_is_idempotent_failure() {
        let (pv, _channel, _events, _requester) = mailbox();
        pv.open_value(int_value(7)).unwrap();
        assert!(pv.is_open());

        assert!(pv.open_value(int_value(9)).is_err());
        // unchanged by the failed open
        let (value, _) = pv.fetch().unwrap();
        assert_eq!(value.get("value").unwrap().as_int(), Some(7));
    }

    #[test]
    fn test_put_then_get_observes() {
        let (pv, channel, _events, _requester) = mailbox();
        pv.open_value(int_value(7)).unwrap();

        let events = Arc::new(Events::default());
        let requester = Arc::new(RecordingPutRequester(events.clone()));
        let put = channel.create_put(requester.clone(), Request::parse("field(value)").unwrap());
        assert_eq!(events.take(), vec!["connect:true:1".to_owned()]);

        put.get();
        assert_eq!(events.take(), vec!["get_done:true:7".to_owned()]);

        put.put(int_value(42), BitSet::of(0));
        assert_eq!(events.take(), vec!["put_done:true".to_owned()]);

        put.get();
        assert_eq!(events.take(), vec!["get_done:true:42".to_owned()]);

        let (cached, _) = pv.fetch().unwrap();
        assert_eq!(cached.get("value").unwrap().as_int(), Some(42));
    }

    #[test]
    fn test_put_connect_waits_for_open() {
        let (pv, channel, _events, _requester) = mailbox();

        let events = Arc::new(Events::default());
        let requester = Arc::new(RecordingPutRequester(events.clone()));
        let _put = channel.create_put(requester.clone(), Request::all());
        assert!(events.take().is_empty());

        pv.open_value(int_value(1)).unwrap();
        assert_eq!(events.take(), vec!["connect:true:1".to_owned()]);
    }

    #[test]
    fn test_put_bad_request_gets_error_connect() {
        let (pv, channel, _events, _requester) = mailbox();
        pv.open_value(int_value(1)).unwrap();

        let events = Arc::new(Events::default());
        let requester = Arc::new(RecordingPutRequester(events.clone()));
        let _put = channel.create_put(requester.clone(), Request::parse("field(bogus)").unwrap());
        assert_eq!(events.take(), vec!["connect:false:0".to_owned()]);
    }

    #[test]
    fn test_monitor_initial_and_update() {
        let (pv, channel, _events, _requester) = mailbox();
        pv.open_value(int_value(7)).unwrap();

        let events = Arc::new(Events::default());
        let requester = Arc::new(RecordingMonitorRequester(events.clone()));
        let monitor = channel.create_monitor(requester.clone(), Request::all()).unwrap();
        assert_eq!(
            events.take(),
            vec!["mon_connect:true".to_owned(), "mon_event".to_owned()]
        );

        let initial = monitor.poll().unwrap();
        assert_eq!(initial.value.get("value").unwrap().as_int(), Some(7));
        assert!(initial.changed.get(0) || initial.changed.get(1));
        assert!(monitor.poll().is_none());

        pv.post(&int_value(9), &BitSet::of(1)).unwrap();
        assert_eq!(events.take(), vec!["mon_event".to_owned()]);
        let update = monitor.poll().unwrap();
        assert_eq!(update.value.get("value").unwrap().as_int(), Some(9));
        assert!(update.changed.get(1));
    }

    #[test]
    fn test_post_requires_open() {
        let (pv, _channel, _events, _requester) = mailbox();
        assert!(pv.post(&int_value(1), &BitSet::of(0)).is_err());
    }

    #[test]
    fn test_close_destroy_notifies_and_clears() {
        let (pv, channel, channel_events, _requester) = mailbox();
        pv.open_value(int_value(7)).unwrap();

        let put_events = Arc::new(Events::default());
        let put_requester = Arc::new(RecordingPutRequester(put_events.clone()));
        let _put = channel.create_put(put_requester.clone(), Request::all());
        let mon_events = Arc::new(Events::default());
        let mon_requester = Arc::new(RecordingMonitorRequester(mon_events.clone()));
        let monitor = channel
            .create_monitor(mon_requester.clone(), Request::all())
            .unwrap();
        put_events.take();
        mon_events.take();

        pv.close(true);
        assert!(!pv.is_open());
        assert_eq!(put_events.take(), vec!["disconnect:true".to_owned()]);
        assert_eq!(mon_events.take(), vec!["unlisten".to_owned()]);
        assert_eq!(
            channel_events.take(),
            vec!["state:Destroyed".to_owned()]
        );

        // destroyed subscriber lists: a fresh open connects nothing
        pv.open_value(int_value(1)).unwrap();
        assert!(put_events.take().is_empty());
        assert!(monitor.poll().is_none());
    }

    #[test]
    fn test_close_then_reopen_reconnects_subscribers() {
        let (pv, channel, _events, _requester) = mailbox();
        pv.open_value(int_value(7)).unwrap();

        let events = Arc::new(Events::default());
        let requester = Arc::new(RecordingPutRequester(events.clone()));
        let put = channel.create_put(requester.clone(), Request::all());
        events.take();

        pv.close(false);
        assert_eq!(events.take(), vec!["disconnect:false".to_owned()]);

        // the subscriber list survived a non-destroy close
        pv.open_value(int_value(8)).unwrap();
        assert_eq!(events.take(), vec!["connect:true:1".to_owned()]);
        put.get();
        assert_eq!(events.take(), vec!["get_done:true:8".to_owned()]);
    }

    #[test]
    fn test_read_only_pv_declines_put() {
        let pv = SharedPV::build_read_only(PvConfig::default());
        let events = Arc::new(Events::default());
        let channel = pv.connect(
            "ro",
            Arc::new(RecordingChannelRequester(Arc::new(Events::default()))),
        );
        pv.open_value(int_value(5)).unwrap();

        let requester = Arc::new(RecordingPutRequester(events.clone()));
        let put = channel.create_put(requester.clone(), Request::all());
        events.take();
        put.put(int_value(6), BitSet::of(0));
        assert_eq!(events.take(), vec!["put_done:false".to_owned()]);

        // reads still work
        put.get();
        assert_eq!(events.take(), vec!["get_done:true:5".to_owned()]);
    }

    #[test]
    fn test_first_and_last_connect_callbacks() {
        struct CountingHandler {
            events: Arc<Events>,
        }

        impl PvHandler for CountingHandler {
            fn on_first_connect(&self, _pv: &Arc<SharedPV>) {
                self.events.push("first".to_owned());
            }

            fn on_last_disconnect(&self, _pv: &Arc<SharedPV>) {
                self.events.push("last".to_owned());
            }
        }

        let events = Arc::new(Events::default());
        let pv = SharedPV::build(
            Arc::new(CountingHandler {
                events: events.clone(),
            }),
            PvConfig::default(),
        );

        let requester: Arc<dyn ChannelRequester> =
            Arc::new(RecordingChannelRequester(Arc::new(Events::default())));
        let first = pv.connect("pv1", requester.clone());
        let second = pv.connect("pv1", requester.clone());
        assert_eq!(events.take(), vec!["first".to_owned()]);

        first.destroy();
        assert!(events.take().is_empty());
        second.destroy();
        assert_eq!(events.take(), vec!["last".to_owned()]);

        // reconnect fires the first-connect hook again
        let _third = pv.connect("pv1", requester);
        assert_eq!(events.take(), vec!["first".to_owned()]);
    }

    #[test]
    fn test_getfield_pending_until_open() {
        struct RecordingGetField(Arc<Events>);

        impl GetFieldRequester for RecordingGetField {
            fn get_done(&self, status: Status, field: Option<Field>) {
                self.0.push(format!("field:{}:{}", status.is_ok(), field.is_some()));
            }
        }

        let (pv, channel, _events, _requester) = mailbox();
        let events = Arc::new(Events::default());
        let requester = Arc::new(RecordingGetField(events.clone()));
        channel.get_field(requester.clone(), "value");
        assert!(events.take().is_empty());

        pv.open_value(int_value(1)).unwrap();
        assert_eq!(events.take(), vec!["field:true:true".to_owned()]);

        channel.get_field(requester, "nope");
        assert_eq!(events.take(), vec!["field:false:false".to_owned()]);
    }
}
