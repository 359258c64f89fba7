//! Per-transport server bookkeeping: the sid-to-channel and ioid-to-
//! operation tables, the server channel wrapper around a provider channel
//! and the in-flight operation objects that bridge provider callbacks back
//! onto the wire.

use crate::data::bitset::BitSet;
use crate::data::status::Status;
use crate::data::value::{Field, PVStructure, Structure};
use crate::net::registry::IdRegistry;
use crate::net::shared::{Cid, Ioid, Sid};
use crate::net::transport::{StreamTransport, TransportSender};
use crate::pv::{
    ChannelMonitor, ChannelPut, ChannelRequester, ChannelRpc, ChannelStateEvent, GetFieldRequester,
    MonitorRequester, ProviderChannel, PutRequester, RpcRequester,
};
use crate::server::handlers;
use hashbrown::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// An in-flight operation owned by its channel and registered by ioid on
/// the transport.
pub trait ServerOperation: Send + Sync {
    fn ioid(&self) -> Ioid;
    /// Best-effort abort; completion is still reported.
    fn cancel(&self);
    /// Final teardown: drops the provider object and the ioid.
    fn destroy(&self);
    /// Concrete-type access for the command handlers.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Per-transport server state: the channel and operation tables plus the
/// handshake bookkeeping of the validation sender.
pub struct ServerTransportState {
    pub channels: IdRegistry<Arc<ServerChannel>>,
    pub operations: IdRegistry<Arc<dyn ServerOperation>>,
    /// False until the first handshake send; that send emits the
    /// SET_ENDIANESS + CONNECTION_VALIDATION pair, later ones emit
    /// CONNECTION_VALIDATED.
    pub verify_or_verified: AtomicBool,
    pub verification_status: Mutex<Status>,
}

impl ServerTransportState {
    pub fn new() -> ServerTransportState {
        ServerTransportState {
            channels: IdRegistry::new(),
            operations: IdRegistry::new(),
            verify_or_verified: AtomicBool::new(false),
            verification_status: Mutex::new(Status::fatal("uninitialized")),
        }
    }

    /// Transport teardown: swaps both tables out under their locks, then
    /// destroys everything outside them.
    pub fn destroy_all(&self) {
        for (_, channel) in self.channels.drain() {
            channel.destroy();
        }
        for (_, op) in self.operations.drain() {
            op.destroy();
        }
    }
}

/// Server side of one created channel.
pub struct ServerChannel {
    sid: Sid,
    cid: Cid,
    name: String,
    transport: Weak<StreamTransport>,
    provider_channel: Mutex<Option<Arc<dyn ProviderChannel>>>,
    ioids: Mutex<HashSet<Ioid>>,
    destroyed: AtomicBool,
}

impl ServerChannel {
    pub fn new(sid: Sid, cid: Cid, name: &str, transport: &Arc<StreamTransport>) -> Arc<ServerChannel> {
        Arc::new(ServerChannel {
            sid,
            cid,
            name: name.to_owned(),
            transport: Arc::downgrade(transport),
            provider_channel: Mutex::new(None),
            ioids: Mutex::new(HashSet::new()),
            destroyed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn sid(&self) -> Sid {
        self.sid
    }

    #[inline]
    pub fn cid(&self) -> Cid {
        self.cid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attach(&self, channel: Arc<dyn ProviderChannel>) {
        *self.provider_channel.lock().unwrap() = Some(channel);
    }

    pub fn provider_channel(&self) -> Option<Arc<dyn ProviderChannel>> {
        self.provider_channel.lock().unwrap().clone()
    }

    pub fn add_ioid(&self, ioid: Ioid) {
        self.ioids.lock().unwrap().insert(ioid);
    }

    pub fn remove_ioid(&self, ioid: Ioid) {
        self.ioids.lock().unwrap().remove(&ioid);
    }

    /// Destroys the channel's operations and the provider channel. Safe to
    /// call repeatedly; later calls are no-ops.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let ioids: Vec<Ioid> = {
            let mut ioids = self.ioids.lock().unwrap();
            ioids.drain().collect()
        };
        if let Some(transport) = self.transport.upgrade() {
            if let Ok(state) = transport.server_state() {
                for ioid in ioids {
                    if let Some(op) = state.operations.unregister(ioid) {
                        op.destroy();
                    }
                }
            }
        }

        if let Some(channel) = self.provider_channel.lock().unwrap().take() {
            channel.destroy();
        }
    }
}

impl ChannelRequester for ServerChannel {
    fn channel_state_change(&self, event: ChannelStateEvent) {
        // teardown initiated on our side loops back here; nothing to do
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.enqueue_send_request(Arc::new(handlers::DestroyChannelSender {
                sid: self.sid,
                cid: self.cid,
            }));
            if event == ChannelStateEvent::Destroyed {
                if let Ok(state) = transport.server_state() {
                    state.channels.unregister(self.sid);
                }
                self.destroy();
            }
        }
    }
}

fn enqueue(transport: &Weak<StreamTransport>, sender: Arc<dyn TransportSender>) {
    if let Some(transport) = transport.upgrade() {
        transport.enqueue_send_request(sender);
    }
}

/// Wire GET: wraps the provider's put/get object, using only its read
/// half.
pub struct ServerGetOp {
    ioid: Ioid,
    channel: Arc<ServerChannel>,
    transport: Weak<StreamTransport>,
    op: Mutex<Option<Arc<dyn ChannelPut>>>,
    pub last_request: AtomicBool,
    destroyed: AtomicBool,
}

impl ServerGetOp {
    pub fn new(ioid: Ioid, channel: Arc<ServerChannel>, transport: &Arc<StreamTransport>) -> Arc<ServerGetOp> {
        Arc::new(ServerGetOp {
            ioid,
            channel,
            transport: Arc::downgrade(transport),
            op: Mutex::new(None),
            last_request: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn attach(&self, op: Arc<dyn ChannelPut>) {
        *self.op.lock().unwrap() = Some(op);
    }

    pub fn get(&self) {
        let op = self.op.lock().unwrap().clone();
        match op {
            Some(op) => op.get(),
            None => enqueue(
                &self.transport,
                Arc::new(handlers::GetResponseSender {
                    ioid: self.ioid,
                    status: Status::error("not connected"),
                    value: None,
                }),
            ),
        }
    }
}

impl PutRequester for ServerGetOp {
    fn channel_put_connect(&self, status: Status, requested: Option<Arc<Structure>>) {
        enqueue(
            &self.transport,
            Arc::new(handlers::OpInitResponseSender {
                command: crate::net::frame::cmd::GET,
                ioid: self.ioid,
                status,
                requested,
            }),
        );
    }

    fn put_done(&self, _status: Status) {}

    fn get_done(&self, status: Status, value: Option<(PVStructure, BitSet)>) {
        enqueue(
            &self.transport,
            Arc::new(handlers::GetResponseSender {
                ioid: self.ioid,
                status,
                value,
            }),
        );
        if self.last_request.load(Ordering::Acquire) {
            if let Some(transport) = self.transport.upgrade() {
                if let Ok(state) = transport.server_state() {
                    state.operations.unregister(self.ioid);
                }
            }
            self.destroy();
        }
    }

    fn channel_disconnect(&self, _destroyed: bool) {}
}

impl ServerOperation for ServerGetOp {
    fn ioid(&self) -> Ioid {
        self.ioid
    }

    fn cancel(&self) {
        if let Some(op) = self.op.lock().unwrap().as_ref() {
            op.cancel();
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(op) = self.op.lock().unwrap().take() {
            op.destroy();
        }
        self.channel.remove_ioid(self.ioid);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Wire PUT: full read/write access to the selected sub-value.
pub struct ServerPutOp {
    ioid: Ioid,
    channel: Arc<ServerChannel>,
    transport: Weak<StreamTransport>,
    op: Mutex<Option<Arc<dyn ChannelPut>>>,
    requested: Mutex<Option<Arc<Structure>>>,
    pub last_request: AtomicBool,
    destroyed: AtomicBool,
}

impl ServerPutOp {
    pub fn new(ioid: Ioid, channel: Arc<ServerChannel>, transport: &Arc<StreamTransport>) -> Arc<ServerPutOp> {
        Arc::new(ServerPutOp {
            ioid,
            channel,
            transport: Arc::downgrade(transport),
            op: Mutex::new(None),
            requested: Mutex::new(None),
            last_request: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn attach(&self, op: Arc<dyn ChannelPut>) {
        *self.op.lock().unwrap() = Some(op);
    }

    /// Type the peer serializes put data with; known once connected.
    pub fn requested_type(&self) -> Option<Arc<Structure>> {
        self.requested.lock().unwrap().clone()
    }

    pub fn put(&self, value: PVStructure, changed: BitSet) {
        let op = self.op.lock().unwrap().clone();
        match op {
            Some(op) => op.put(value, changed),
            None => self.put_done(Status::error("not connected")),
        }
    }

    pub fn get(&self) {
        let op = self.op.lock().unwrap().clone();
        match op {
            Some(op) => op.get(),
            None => self.get_done(Status::error("not connected"), None),
        }
    }
}

impl PutRequester for ServerPutOp {
    fn channel_put_connect(&self, status: Status, requested: Option<Arc<Structure>>) {
        *self.requested.lock().unwrap() = requested.clone();
        enqueue(
            &self.transport,
            Arc::new(handlers::OpInitResponseSender {
                command: crate::net::frame::cmd::PUT,
                ioid: self.ioid,
                status,
                requested,
            }),
        );
    }

    fn put_done(&self, status: Status) {
        enqueue(
            &self.transport,
            Arc::new(handlers::PutResponseSender {
                ioid: self.ioid,
                status,
            }),
        );
        if self.last_request.load(Ordering::Acquire) {
            if let Some(transport) = self.transport.upgrade() {
                if let Ok(state) = transport.server_state() {
                    state.operations.unregister(self.ioid);
                }
            }
            self.destroy();
        }
    }

    fn get_done(&self, status: Status, value: Option<(PVStructure, BitSet)>) {
        enqueue(
            &self.transport,
            Arc::new(handlers::PutGetResponseSender {
                ioid: self.ioid,
                status,
                value,
            }),
        );
    }

    fn channel_disconnect(&self, _destroyed: bool) {}
}

impl ServerOperation for ServerPutOp {
    fn ioid(&self) -> Ioid {
        self.ioid
    }

    fn cancel(&self) {
        if let Some(op) = self.op.lock().unwrap().as_ref() {
            op.cancel();
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(op) = self.op.lock().unwrap().take() {
            op.destroy();
        }
        self.channel.remove_ioid(self.ioid);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Wire MONITOR: drains the provider-side FIFO into event messages.
pub struct ServerMonitorOp {
    ioid: Ioid,
    channel: Arc<ServerChannel>,
    transport: Weak<StreamTransport>,
    op: Mutex<Option<Arc<dyn ChannelMonitor>>>,
    event_queued: AtomicBool,
    self_ref: Mutex<Weak<ServerMonitorOp>>,
    destroyed: AtomicBool,
}

impl ServerMonitorOp {
    pub fn new(
        ioid: Ioid,
        channel: Arc<ServerChannel>,
        transport: &Arc<StreamTransport>,
    ) -> Arc<ServerMonitorOp> {
        let op = Arc::new(ServerMonitorOp {
            ioid,
            channel,
            transport: Arc::downgrade(transport),
            op: Mutex::new(None),
            event_queued: AtomicBool::new(false),
            self_ref: Mutex::new(Weak::new()),
            destroyed: AtomicBool::new(false),
        });
        *op.self_ref.lock().unwrap() = Arc::downgrade(&op);
        op
    }

    #[inline]
    pub fn ioid_value(&self) -> Ioid {
        self.ioid
    }

    pub fn attach(&self, op: Arc<dyn ChannelMonitor>) {
        *self.op.lock().unwrap() = Some(op);
    }

    pub fn monitor(&self) -> Option<Arc<dyn ChannelMonitor>> {
        self.op.lock().unwrap().clone()
    }

    pub fn event_drained(&self) {
        self.event_queued.store(false, Ordering::Release);
    }

    pub fn ack(&self, count: u32) {
        if let Some(op) = self.monitor() {
            op.ack(count);
        }
    }
}

impl MonitorRequester for ServerMonitorOp {
    fn monitor_connect(&self, status: Status, requested: Option<Arc<Structure>>) {
        enqueue(
            &self.transport,
            Arc::new(handlers::OpInitResponseSender {
                command: crate::net::frame::cmd::MONITOR,
                ioid: self.ioid,
                status,
                requested,
            }),
        );
    }

    fn monitor_event(&self) {
        if !self.event_queued.swap(true, Ordering::AcqRel) {
            if let Some(this) = self.self_ref.lock().unwrap().upgrade() {
                enqueue(&self.transport, Arc::new(handlers::MonitorEventSender { op: this }));
            }
        }
    }

    fn unlisten(&self) {
        enqueue(
            &self.transport,
            Arc::new(handlers::MonitorUnlistenSender { ioid: self.ioid }),
        );
    }

    fn channel_disconnect(&self, _destroyed: bool) {}
}

impl ServerOperation for ServerMonitorOp {
    fn ioid(&self) -> Ioid {
        self.ioid
    }

    fn cancel(&self) {}

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(op) = self.op.lock().unwrap().take() {
            op.destroy();
        }
        self.channel.remove_ioid(self.ioid);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Wire RPC.
pub struct ServerRpcOp {
    ioid: Ioid,
    channel: Arc<ServerChannel>,
    transport: Weak<StreamTransport>,
    op: Mutex<Option<Arc<dyn ChannelRpc>>>,
    pub last_request: AtomicBool,
    destroyed: AtomicBool,
}

impl ServerRpcOp {
    pub fn new(ioid: Ioid, channel: Arc<ServerChannel>, transport: &Arc<StreamTransport>) -> Arc<ServerRpcOp> {
        Arc::new(ServerRpcOp {
            ioid,
            channel,
            transport: Arc::downgrade(transport),
            op: Mutex::new(None),
            last_request: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn attach(&self, op: Arc<dyn ChannelRpc>) {
        *self.op.lock().unwrap() = Some(op);
    }

    pub fn request(&self, args: PVStructure) {
        let op = self.op.lock().unwrap().clone();
        match op {
            Some(op) => op.request(args),
            None => self.request_done(Status::error("not connected"), None),
        }
    }
}

impl RpcRequester for ServerRpcOp {
    fn channel_rpc_connect(&self, status: Status) {
        enqueue(
            &self.transport,
            Arc::new(handlers::OpInitResponseSender {
                command: crate::net::frame::cmd::RPC,
                ioid: self.ioid,
                status,
                requested: None,
            }),
        );
    }

    fn request_done(&self, status: Status, value: Option<PVStructure>) {
        enqueue(
            &self.transport,
            Arc::new(handlers::RpcResponseSender {
                ioid: self.ioid,
                status,
                value,
            }),
        );
        if self.last_request.load(Ordering::Acquire) {
            if let Some(transport) = self.transport.upgrade() {
                if let Ok(state) = transport.server_state() {
                    state.operations.unregister(self.ioid);
                }
            }
            self.destroy();
        }
    }

    fn channel_disconnect(&self, _destroyed: bool) {}
}

impl ServerOperation for ServerRpcOp {
    fn ioid(&self) -> Ioid {
        self.ioid
    }

    fn cancel(&self) {
        if let Some(op) = self.op.lock().unwrap().as_ref() {
            op.cancel();
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(op) = self.op.lock().unwrap().take() {
            op.destroy();
        }
        self.channel.remove_ioid(self.ioid);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// One-shot GET_FIELD helper; never registered in the operation table.
pub struct ServerGetFieldOp {
    pub ioid: Ioid,
    pub transport: Weak<StreamTransport>,
}

impl GetFieldRequester for ServerGetFieldOp {
    fn get_done(&self, status: Status, field: Option<Field>) {
        enqueue(
            &self.transport,
            Arc::new(handlers::GetFieldResponseSender {
                ioid: self.ioid,
                status,
                field,
            }),
        );
    }
}
