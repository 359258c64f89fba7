//! The client: a context owning the timer and notification conveyor, a
//! transport cache keyed by server address, channels bound to those
//! transports and the response dispatch that routes replies to in-flight
//! operations by ioid.

pub mod ops;

use crate::data::ser;
use crate::data::status::Status;
use crate::data::value::{Field, PVStructure};
use crate::net::auth::{select_client_plugin, PeerInfo};
use crate::net::codec::{InputCodec, OutputCodec};
use crate::net::frame::{cmd, command_name, Header, DEFAULT_PRIORITY};
use crate::net::shared::{Cid, Ioid, NetResult, Sid};
use crate::net::transport::{Role, StreamTransport, TransportHandler, TransportOptions, TransportSender};
use crate::util::conveyor::Conveyor;
use crate::util::timer::{Timer, TimerHandle};
use hashbrown::HashMap;
use ion::config::Config;
use ion::logging::{self, Logger};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

/// An in-flight client operation awaiting responses for its ioid.
pub trait ResponseRequest: Send + Sync {
    fn handle_response(&self, hdr: &Header, codec: &mut InputCodec) -> NetResult<()>;
    /// The transport died; fail any waiters.
    fn transport_closed(&self);
}

/// Client-side per-transport state: channel owners and pending responses.
pub struct ClientTransportState {
    owners: Mutex<HashMap<Cid, Weak<ClientChannel>>>,
    responses: Mutex<HashMap<Ioid, Arc<dyn ResponseRequest>>>,
    next_ioid: AtomicU32,
    heartbeat: Mutex<Option<TimerHandle>>,
}

impl ClientTransportState {
    pub fn new() -> ClientTransportState {
        ClientTransportState {
            owners: Mutex::new(HashMap::new()),
            responses: Mutex::new(HashMap::new()),
            next_ioid: AtomicU32::new(1),
            heartbeat: Mutex::new(None),
        }
    }

    /// Ioids are client allocated; 0 is reserved as invalid.
    pub fn allocate_ioid(&self) -> Ioid {
        loop {
            let ioid = self.next_ioid.fetch_add(1, Ordering::AcqRel);
            if ioid != 0 {
                return ioid;
            }
        }
    }

    pub fn register_response(&self, ioid: Ioid, request: Arc<dyn ResponseRequest>) {
        self.responses.lock().unwrap().insert(ioid, request);
    }

    pub fn unregister_response(&self, ioid: Ioid) {
        self.responses.lock().unwrap().remove(&ioid);
    }

    fn lookup_response(&self, ioid: Ioid) -> Option<Arc<dyn ResponseRequest>> {
        self.responses.lock().unwrap().get(&ioid).cloned()
    }

    fn register_owner(&self, cid: Cid, channel: &Arc<ClientChannel>) {
        self.owners.lock().unwrap().insert(cid, Arc::downgrade(channel));
    }

    fn unregister_owner(&self, cid: Cid) {
        self.owners.lock().unwrap().remove(&cid);
    }

    fn lookup_owner(&self, cid: Cid) -> Option<Arc<ClientChannel>> {
        self.owners.lock().unwrap().get(&cid).and_then(Weak::upgrade)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelConnState {
    NeverConnected,
    Connected,
    Disconnected,
    Destroyed,
}

pub trait ChannelListener: Send + Sync {
    fn channel_state_change(&self, state: ChannelConnState);
}

struct ChannelShared {
    conn: ChannelConnState,
    sid: Sid,
    create_status: Option<Status>,
}

/// A named endpoint on one transport through which operations are issued.
pub struct ClientChannel {
    context: Weak<ClientContext>,
    transport: Arc<StreamTransport>,
    name: String,
    cid: Cid,
    shared: Mutex<ChannelShared>,
    cond: Condvar,
    listeners: Mutex<Vec<Weak<dyn ChannelListener>>>,
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel")
            .field("name", &self.name)
            .field("cid", &self.cid)
            .finish()
    }
}

impl ClientChannel {
    fn create(
        context: &Arc<ClientContext>,
        transport: Arc<StreamTransport>,
        name: &str,
    ) -> NetResult<Arc<ClientChannel>> {
        let cid = context.allocate_cid();
        let channel = Arc::new(ClientChannel {
            context: Arc::downgrade(context),
            transport,
            name: name.to_owned(),
            cid,
            shared: Mutex::new(ChannelShared {
                conn: ChannelConnState::NeverConnected,
                sid: 0,
                create_status: None,
            }),
            cond: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
        });

        channel.transport.client_state()?.register_owner(cid, &channel);
        channel
            .transport
            .enqueue_send_request(Arc::new(ops::CreateChannelSender {
                cid,
                name: name.to_owned(),
            }));
        Ok(channel)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn sid(&self) -> Sid {
        self.shared.lock().unwrap().sid
    }

    #[inline]
    pub fn transport(&self) -> &Arc<StreamTransport> {
        &self.transport
    }

    pub fn state(&self) -> ChannelConnState {
        self.shared.lock().unwrap().conn
    }

    pub fn add_listener(&self, listener: &Arc<dyn ChannelListener>) {
        self.listeners.lock().unwrap().push(Arc::downgrade(listener));
    }

    /// Timeout every blocking operation on this channel inherits.
    pub(crate) fn op_timeout(&self) -> Duration {
        match self.context.upgrade() {
            Some(context) => Duration::from_secs_f64(context.config.connection_timeout),
            None => Duration::from_secs(5),
        }
    }

    pub fn wait_connected(&self, timeout: Duration) -> Result<(), Status> {
        let deadline = Instant::now() + timeout;
        let mut shared = self.shared.lock().unwrap();
        loop {
            match shared.conn {
                ChannelConnState::Connected => return Ok(()),
                ChannelConnState::Disconnected => {
                    return Err(Status::error("channel disconnected"));
                }
                ChannelConnState::Destroyed => return Err(Status::error("channel destroyed")),
                ChannelConnState::NeverConnected => {
                    if let Some(status) = &shared.create_status {
                        if !status.is_success() {
                            return Err(status.clone());
                        }
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Status::error("channel connect timeout"));
            }
            let (next, _) = self.cond.wait_timeout(shared, deadline - now).unwrap();
            shared = next;
        }
    }

    fn notify_listeners(&self, state: ChannelConnState) {
        let listeners: Vec<Arc<dyn ChannelListener>> = {
            let mut table = self.listeners.lock().unwrap();
            table.retain(|weak| weak.upgrade().is_some());
            table.iter().filter_map(Weak::upgrade).collect()
        };
        if listeners.is_empty() {
            return;
        }
        if let Some(context) = self.context.upgrade() {
            context.conveyor.push(move || {
                for listener in listeners {
                    listener.channel_state_change(state);
                }
            });
        }
    }

    fn create_done(&self, sid: Sid, status: Status) {
        let connected = {
            let mut shared = self.shared.lock().unwrap();
            shared.create_status = Some(status.clone());
            if status.is_success() && shared.conn == ChannelConnState::NeverConnected {
                shared.sid = sid;
                shared.conn = ChannelConnState::Connected;
                true
            } else {
                false
            }
        };
        self.cond.notify_all();
        if connected {
            self.notify_listeners(ChannelConnState::Connected);
        }
    }

    /// Server-initiated teardown or transport loss; fires the listener
    /// exactly once.
    fn disconnected(&self) {
        let notify = {
            let mut shared = self.shared.lock().unwrap();
            match shared.conn {
                ChannelConnState::Disconnected | ChannelConnState::Destroyed => false,
                _ => {
                    shared.conn = ChannelConnState::Disconnected;
                    true
                }
            }
        };
        self.cond.notify_all();
        if notify {
            self.notify_listeners(ChannelConnState::Disconnected);
        }
    }

    /// Client-initiated permanent teardown.
    pub fn destroy(&self) {
        let sid = {
            let mut shared = self.shared.lock().unwrap();
            if shared.conn == ChannelConnState::Destroyed {
                return;
            }
            shared.conn = ChannelConnState::Destroyed;
            shared.sid
        };
        self.cond.notify_all();
        if let Ok(state) = self.transport.client_state() {
            state.unregister_owner(self.cid);
        }
        self.transport
            .enqueue_send_request(Arc::new(ops::DestroyChannelClientSender { sid, cid: self.cid }));
        self.notify_listeners(ChannelConnState::Destroyed);
    }

    pub fn create_get(self: &Arc<Self>, request: &str) -> Result<Arc<ops::ClientGet>, Status> {
        let get = ops::ClientGet::create(self, request)?;
        get.wait_connected(self.op_timeout())?;
        Ok(get)
    }

    pub fn create_put(self: &Arc<Self>, request: &str) -> Result<Arc<ops::ClientPut>, Status> {
        let put = ops::ClientPut::create(self, request)?;
        put.wait_connected(self.op_timeout())?;
        Ok(put)
    }

    pub fn create_monitor(self: &Arc<Self>, request: &str) -> Result<Arc<ops::ClientMonitor>, Status> {
        let monitor = ops::ClientMonitor::create(self, request)?;
        monitor.wait_connected(self.op_timeout())?;
        Ok(monitor)
    }

    pub fn create_rpc(self: &Arc<Self>, request: &str) -> Result<Arc<ops::ClientRpc>, Status> {
        let rpc = ops::ClientRpc::create(self, request)?;
        rpc.wait_connected(self.op_timeout())?;
        Ok(rpc)
    }

    /// Blocking introspection of the channel's (sub)field.
    pub fn get_field(self: &Arc<Self>, subfield: &str) -> Result<Field, Status> {
        ops::get_field(self, subfield, self.op_timeout())
    }
}

pub struct ClientContext {
    config: Config,
    log: Logger,
    timer: Timer,
    conveyor: Conveyor,
    transports: Mutex<HashMap<SocketAddr, Arc<StreamTransport>>>,
    next_cid: AtomicU32,
    self_ref: Mutex<Weak<ClientContext>>,
}

impl ClientContext {
    pub fn new(config: Config, log: &Logger) -> Arc<ClientContext> {
        let log = log.new(logging::o!("side" => "client"));
        let context = Arc::new(ClientContext {
            timer: Timer::new("positron-timer", &log),
            conveyor: Conveyor::new("positron-notify", &log),
            config,
            log,
            transports: Mutex::new(HashMap::new()),
            next_cid: AtomicU32::new(1),
            self_ref: Mutex::new(Weak::new()),
        });
        *context.self_ref.lock().unwrap() = Arc::downgrade(&context);
        context
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn allocate_cid(&self) -> Cid {
        loop {
            let cid = self.next_cid.fetch_add(1, Ordering::AcqRel);
            if cid != 0 {
                return cid;
            }
        }
    }

    fn self_arc(&self) -> Arc<ClientContext> {
        self.self_ref
            .lock()
            .unwrap()
            .upgrade()
            .expect("ClientContext self reference must stay valid")
    }

    /// Connects (or reuses a cached transport) and completes the handshake
    /// before returning.
    pub fn connect(&self, addr: SocketAddr) -> Result<Arc<StreamTransport>, Status> {
        let timeout = Duration::from_secs_f64(self.config.connection_timeout);

        {
            let transports = self.transports.lock().unwrap();
            if let Some(transport) = transports.get(&addr) {
                if transport.is_open() {
                    return Ok(transport.clone());
                }
            }
        }

        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|err| Status::error(format!("connect to {} failed: {}", addr, err)))?;

        let handler = Arc::new(ClientHandlerTable {
            context: Arc::downgrade(&self.self_arc()),
        });
        let transport = StreamTransport::new(
            Role::Client,
            stream,
            handler,
            TransportOptions {
                recv_buffer_size: self.config.recv_buffer_size,
                connection_timeout: timeout,
                priority: DEFAULT_PRIORITY,
            },
            &self.log,
        )
        .map_err(|err| Status::error(format!("transport setup failed: {:?}", err)))?;

        {
            let mut transports = self.transports.lock().unwrap();
            transports.insert(addr, transport.clone());
        }

        transport.start();
        self.schedule_heartbeat(&transport);

        if !transport.verify(timeout) {
            transport.close();
            return Err(Status::error("connection validation failed"));
        }
        logging::debug!(self.log, "transport verified"; "peer" => %addr);
        Ok(transport)
    }

    /// Creates a channel and blocks until the server confirms it.
    pub fn channel(&self, name: &str, addr: SocketAddr) -> Result<Arc<ClientChannel>, Status> {
        let transport = self.connect(addr)?;
        let channel = ClientChannel::create(&self.self_arc(), transport, name)
            .map_err(|err| Status::error(format!("channel setup failed: {:?}", err)))?;
        channel.wait_connected(Duration::from_secs_f64(self.config.connection_timeout))?;
        Ok(channel)
    }

    fn schedule_heartbeat(&self, transport: &Arc<StreamTransport>) {
        let period = Duration::from_secs_f64(self.config.heartbeat_period());
        // phase randomization spreads many clients' echo bursts apart
        let phase = period.mul_f64(0.5 + 0.5 * rand::random::<f64>());
        let weak = Arc::downgrade(transport);
        let log = self.log.clone();

        let handle = self.timer.schedule_periodic(
            phase,
            period,
            Arc::new(move || {
                let transport = match weak.upgrade() {
                    Some(transport) => transport,
                    None => return,
                };
                if !transport.is_open() {
                    return;
                }
                if transport.rx_expired() {
                    logging::warn!(log, "peer unresponsive, closing"; "peer" => %transport.peer());
                    transport.close();
                    return;
                }
                if transport.arm_echo() {
                    transport.enqueue_send_request(Arc::new(HeartbeatSender));
                }
            }),
        );

        if let Ok(state) = transport.client_state() {
            *state.heartbeat.lock().unwrap() = Some(handle);
        }
    }

    fn forget_transport(&self, addr: SocketAddr) {
        let mut transports = self.transports.lock().unwrap();
        if let Some(transport) = transports.get(&addr) {
            if !transport.is_open() {
                transports.remove(&addr);
            }
        }
    }

    pub(crate) fn conveyor(&self) -> &Conveyor {
        &self.conveyor
    }

    /// Closes every transport. Channels see DISCONNECTED exactly once.
    pub fn destroy(&self) {
        let transports: Vec<Arc<StreamTransport>> = {
            let mut table = self.transports.lock().unwrap();
            table.drain().map(|(_, transport)| transport).collect()
        };
        for transport in transports {
            transport.close();
        }
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

type ClientCommandHandler =
    fn(&ClientHandlerTable, &Arc<StreamTransport>, &Header, &mut InputCodec) -> NetResult<()>;

const HANDLERS: [ClientCommandHandler; 22] = [
    noop,                  // 0  BEACON
    connection_validation, // 1
    noop,                  // 2  ECHO reply refreshed the rx clock already
    noop,                  // 3  SEARCH
    noop,                  // 4  SEARCH_RESPONSE
    authnz,                // 5
    noop,                  // 6  ACL_CHANGE
    create_channel_response, // 7
    destroy_channel,       // 8
    validated,             // 9
    op_response,           // 10 GET
    op_response,           // 11 PUT
    op_response,           // 12 PUT_GET
    op_response,           // 13 MONITOR
    op_response,           // 14 ARRAY
    noop,                  // 15 DESTROY_REQUEST
    op_response,           // 16 PROCESS
    op_response,           // 17 GET_FIELD
    message,               // 18
    bad_response,          // 19
    op_response,           // 20 RPC
    noop,                  // 21 CANCEL_REQUEST
];

struct ClientHandlerTable {
    context: Weak<ClientContext>,
}

impl TransportHandler for ClientHandlerTable {
    fn dispatch(
        &self,
        transport: &Arc<StreamTransport>,
        hdr: &Header,
        codec: &mut InputCodec,
    ) -> NetResult<()> {
        let handler = HANDLERS
            .get(hdr.command as usize)
            .copied()
            .unwrap_or(bad_response as ClientCommandHandler);
        handler(self, transport, hdr, codec)
    }

    fn transport_closed(&self, transport: &Arc<StreamTransport>) {
        if let Ok(state) = transport.client_state() {
            if let Some(handle) = state.heartbeat.lock().unwrap().take() {
                handle.cancel();
            }

            let owners: Vec<Arc<ClientChannel>> = {
                let mut owners = state.owners.lock().unwrap();
                owners.drain().filter_map(|(_, weak)| weak.upgrade()).collect()
            };
            for channel in owners {
                channel.disconnected();
            }

            let responses: Vec<Arc<dyn ResponseRequest>> = {
                let mut responses = state.responses.lock().unwrap();
                responses.drain().map(|(_, request)| request).collect()
            };
            for request in responses {
                request.transport_closed();
            }
        }

        if let Some(context) = self.context.upgrade() {
            context.forget_transport(transport.peer());
        }
    }
}

fn noop(
    _table: &ClientHandlerTable,
    _transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    codec.skip_payload()
}

fn bad_response(
    _table: &ClientHandlerTable,
    transport: &Arc<StreamTransport>,
    hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    logging::debug!(transport.log(), "unexpected command discarded";
                    "command" => command_name(hdr.command));
    codec.skip_payload()
}

/// Server's offer: buffer size, introspection ceiling and its auth plugin
/// list, most preferred last.
fn connection_validation(
    _table: &ClientHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    codec.ensure_data(4 + 2)?;
    let server_buffer_size = codec.buffer().get_u32() as usize;
    let _introspection_limit = codec.buffer().get_u16();
    let count = ser::read_size(codec)?.unwrap_or(0);
    let mut offered = Vec::with_capacity(count.min(16));
    for _ in 0..count {
        offered.push(ser::read_string(codec)?);
    }

    transport.set_remote_buffer_size(server_buffer_size);

    let (name, plugin) = select_client_plugin(&offered);
    let peer = PeerInfo {
        peer: transport.peer().to_string(),
        authority: name.clone(),
        transport_revision: transport.remote_revision(),
    };
    let mut session = plugin.create_session(&peer, None);
    // the server drives completion; an eager local verdict is ignored
    let _ = session.begin();
    {
        let mut auth = transport.auth().lock().unwrap();
        auth.session = Some(session);
        auth.name = name;
    }

    transport.enqueue_send_request(Arc::new(HeartbeatSender));
    Ok(())
}

fn authnz(
    _table: &ClientHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    let data = ser::read_full(codec)?;
    let reply = {
        let mut auth = transport.auth().lock().unwrap();
        match auth.session.as_mut() {
            Some(session) => match session.message_received(data) {
                crate::net::auth::AuthOutcome::Continue(reply) => reply,
                crate::net::auth::AuthOutcome::Done(_) => None,
            },
            None => None,
        }
    };
    if let Some(data) = reply {
        transport.enqueue_send_request(Arc::new(ClientAuthnzSender { data }));
    }
    Ok(())
}

fn validated(
    _table: &ClientHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    let status = ser::read_status(codec)?;
    transport.verified(status);
    Ok(())
}

fn create_channel_response(
    _table: &ClientHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    codec.ensure_data(8)?;
    let cid = codec.buffer().get_u32();
    let sid = codec.buffer().get_u32();
    let status = ser::read_status(codec)?;

    match transport.client_state()?.lookup_owner(cid) {
        Some(channel) => channel.create_done(sid, status),
        None => {
            logging::debug!(transport.log(), "create response for unknown channel"; "cid" => cid);
        }
    }
    Ok(())
}

fn destroy_channel(
    _table: &ClientHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    codec.ensure_data(8)?;
    let _sid = codec.buffer().get_u32();
    let cid = codec.buffer().get_u32();

    if let Some(channel) = transport.client_state()?.lookup_owner(cid) {
        transport.client_state()?.unregister_owner(cid);
        channel.disconnected();
    }
    Ok(())
}

/// Routes an operation response to its in-flight request by ioid.
fn op_response(
    _table: &ClientHandlerTable,
    transport: &Arc<StreamTransport>,
    hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    codec.ensure_data(4)?;
    let ioid = codec.buffer().get_u32();
    match transport.client_state()?.lookup_response(ioid) {
        Some(request) => request.handle_response(hdr, codec),
        None => {
            logging::debug!(transport.log(), "response for unknown operation";
                            "command" => command_name(hdr.command), "ioid" => ioid);
            codec.skip_payload()
        }
    }
}

fn message(
    _table: &ClientHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    codec.ensure_data(5)?;
    let ioid = codec.buffer().get_u32();
    let kind = codec.buffer().get_u8();
    let text = ser::read_string(codec)?;
    logging::info!(transport.log(), "server message";
                   "ioid" => ioid, "kind" => kind, "text" => text);
    Ok(())
}

/// The client's one recurring sender: the first pass answers the server's
/// CONNECTION_VALIDATION, every later pass is a heartbeat echo.
struct HeartbeatSender;

impl TransportSender for HeartbeatSender {
    fn send(&self, codec: &mut OutputCodec, transport: &Arc<StreamTransport>) -> NetResult<()> {
        transport.echo_sent();
        if transport.take_verify_or_echo() {
            codec.start_message(cmd::CONNECTION_VALIDATION, 4 + 2 + 2)?;
            codec.buffer().put_u32(transport.recv_buffer_size() as u32);
            codec.buffer().put_u16(0x7FFF);
            codec.buffer().put_u16(transport.priority());

            let (name, init) = {
                let auth = transport.auth().lock().unwrap();
                let init = auth.session.as_ref().and_then(|session| session.initialization_data());
                (auth.name.clone(), init)
            };
            ser::write_string(codec, &name)?;
            ser::write_full(codec, init.as_ref())?;
            codec.flush(true)
        } else {
            codec.start_message(cmd::ECHO, 0)?;
            codec.flush(true)
        }
    }
}

struct ClientAuthnzSender {
    data: PVStructure,
}

impl TransportSender for ClientAuthnzSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::AUTHNZ, 0)?;
        ser::write_full(codec, Some(&self.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bitset::BitSet;
    use crate::data::value::{Field, PVField, PVStructure, ScalarKind, Structure};
    use crate::pv::{Operation, Provider, PvConfig, PvHandler, SharedPV, StaticProvider};
    use crate::server::ServerContext;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::thread;

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

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server_port = 0;
        config.connection_timeout = 5.0;
        config
    }

    fn start_server(pvs: Vec<(&str, Arc<SharedPV>)>) -> (Arc<ServerContext>, SocketAddr) {
        let provider = StaticProvider::new("static");
        for (name, pv) in pvs {
            provider.add(name, pv);
        }
        let providers: Vec<Arc<dyn Provider>> = vec![provider];
        let server = ServerContext::start(test_config(), providers, &ion::logging::discard()).unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()));
        (server, addr)
    }

    fn mailbox_server(initial: i32) -> (Arc<ServerContext>, Arc<SharedPV>, SocketAddr) {
        let pv = SharedPV::build_mailbox(PvConfig::default());
        pv.open_value(int_value(initial)).unwrap();
        let (server, addr) = start_server(vec![("pv1", pv.clone())]);
        (server, pv, addr)
    }

    fn client_context() -> Arc<ClientContext> {
        ClientContext::new(test_config(), &ion::logging::discard())
    }

    fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            if Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_single_get() {
        let (server, _pv, addr) = mailbox_server(7);
        let context = client_context();

        let channel = context.channel("pv1", addr).unwrap();
        assert_eq!(channel.state(), ChannelConnState::Connected);

        let get = channel.create_get("field(value)").unwrap();
        let (value, changed) = get.get().unwrap();
        assert_eq!(value.get("value").unwrap().as_int(), Some(7));
        assert!(!changed.is_empty());

        server.shutdown();
    }

    #[test]
    fn test_put_then_get_observes() {
        let (server, pv, addr) = mailbox_server(7);
        let context = client_context();
        let channel = context.channel("pv1", addr).unwrap();

        let put = channel.create_put("field(value)").unwrap();
        let mut value = put.build().unwrap();
        value.set("value", PVField::Int(42)).unwrap();
        put.put(&value, &BitSet::of(0)).unwrap();

        let (read_back, _) = put.get().unwrap();
        assert_eq!(read_back.get("value").unwrap().as_int(), Some(42));

        let get = channel.create_get("").unwrap();
        let (fresh, _) = get.get().unwrap();
        assert_eq!(fresh.get("value").unwrap().as_int(), Some(42));

        // the server-side cache observed the put as well
        let (cached, _) = pv.fetch().unwrap();
        assert_eq!(cached.get("value").unwrap().as_int(), Some(42));

        server.shutdown();
    }

    #[test]
    fn test_monitor_initial_and_update() {
        let (server, pv, addr) = mailbox_server(7);
        let context = client_context();
        let channel = context.channel("pv1", addr).unwrap();

        let monitor = channel.create_monitor("field(value)").unwrap();
        let initial = monitor.wait_event(Duration::from_secs(5)).unwrap();
        assert_eq!(initial.value.get("value").unwrap().as_int(), Some(7));
        assert!(!initial.changed.is_empty());

        pv.post(&int_value(9), &BitSet::of(1)).unwrap();
        let update = monitor.wait_event(Duration::from_secs(5)).unwrap();
        assert_eq!(update.value.get("value").unwrap().as_int(), Some(9));
        assert!(update.changed.get(1));

        server.shutdown();
    }

    #[test]
    fn test_monitor_updates_arrive_in_post_order() {
        let (server, pv, addr) = mailbox_server(0);
        let context = client_context();
        let channel = context.channel("pv1", addr).unwrap();

        let monitor = channel.create_monitor("").unwrap();
        monitor.wait_event(Duration::from_secs(5)).unwrap();

        for value in 1..=3 {
            pv.post(&int_value(value), &BitSet::of(1)).unwrap();
            let update = monitor.wait_event(Duration::from_secs(5)).unwrap();
            assert_eq!(update.value.get("value").unwrap().as_int(), Some(value));
        }

        server.shutdown();
    }

    #[test]
    fn test_segmented_large_put_roundtrip() {
        // an array bigger than the send buffer crosses the wire in
        // segments and survives byte for byte
        let blob_type = Structure::new(
            "test:blob",
            vec![("value".to_owned(), Field::ScalarArray(ScalarKind::UByte))],
        );
        let pv = SharedPV::build_mailbox(PvConfig::default());
        pv.open_value(PVStructure::new_default(blob_type)).unwrap();
        let (server, addr) = start_server(vec![("blob", pv.clone())]);

        let context = client_context();
        let channel = context.channel("blob", addr).unwrap();
        let put = channel.create_put("").unwrap();

        let blob: Vec<u8> = (0..100_000u32).map(|index| (index % 251) as u8).collect();
        let mut value = put.build().unwrap();
        value.set("value", PVField::UByteArray(blob.clone())).unwrap();
        put.put(&value, &BitSet::of(0)).unwrap();

        let (cached, _) = pv.fetch().unwrap();
        assert_eq!(cached.get("value").unwrap().as_ubyte_array(), Some(&blob[..]));

        // and it comes back whole too
        let (read_back, _) = put.get().unwrap();
        assert_eq!(read_back.get("value").unwrap().as_ubyte_array(), Some(&blob[..]));

        server.shutdown();
    }

    #[test]
    fn test_rpc_roundtrip() {
        struct SumHandler;

        impl PvHandler for SumHandler {
            fn on_rpc(&self, _pv: &Arc<SharedPV>, op: Operation) {
                let a = op.value().get("a").and_then(|field| field.as_int()).unwrap_or(0);
                let b = op.value().get("b").and_then(|field| field.as_int()).unwrap_or(0);
                let result_type = Structure::new(
                    "test:sum",
                    vec![("sum".to_owned(), Field::Scalar(ScalarKind::Int))],
                );
                let mut result = PVStructure::new_default(result_type);
                result.set("sum", PVField::Int(a + b)).unwrap();
                op.complete_value(Status::ok(), result);
            }
        }

        let pv = SharedPV::build(Arc::new(SumHandler), PvConfig::default());
        pv.open_value(int_value(0)).unwrap();
        let (server, addr) = start_server(vec![("sum", pv)]);

        let context = client_context();
        let channel = context.channel("sum", addr).unwrap();
        let rpc = channel.create_rpc("").unwrap();

        let args_type = Structure::new(
            "",
            vec![
                ("a".to_owned(), Field::Scalar(ScalarKind::Int)),
                ("b".to_owned(), Field::Scalar(ScalarKind::Int)),
            ],
        );
        let mut args = PVStructure::new_default(args_type);
        args.set("a", PVField::Int(19)).unwrap();
        args.set("b", PVField::Int(23)).unwrap();

        let result = rpc.request(&args).unwrap();
        assert_eq!(result.get("sum").unwrap().as_int(), Some(42));

        server.shutdown();
    }

    #[test]
    fn test_get_field_introspection() {
        let (server, _pv, addr) = mailbox_server(1);
        let context = client_context();
        let channel = context.channel("pv1", addr).unwrap();

        match channel.get_field("").unwrap() {
            Field::Structure(structure) => {
                assert!(structure.field("value").is_some());
            }
            other => panic!("expected a structure, got {:?}", other),
        }
        assert_eq!(channel.get_field("value").unwrap(), Field::Scalar(ScalarKind::Int));
        assert!(channel.get_field("missing").is_err());

        server.shutdown();
    }

    #[test]
    fn test_channel_not_found() {
        let (server, _pv, addr) = mailbox_server(1);
        let context = client_context();

        let err = context.channel("no-such-pv", addr).unwrap_err();
        assert!(!err.is_success());

        server.shutdown();
    }

    #[test]
    fn test_monitor_pipeline_ack_reopens_window() {
        let (server, pv, addr) = mailbox_server(0);
        let context = client_context();
        let channel = context.channel("pv1", addr).unwrap();

        let monitor = channel
            .create_monitor("record[pipeline=true,queueSize=2]field(value)")
            .unwrap();
        monitor.wait_event(Duration::from_secs(5)).unwrap();

        // one more window slot, then the server must stall
        pv.post(&int_value(1), &BitSet::of(1)).unwrap();
        let first = monitor.wait_event(Duration::from_secs(5)).unwrap();
        assert_eq!(first.value.get("value").unwrap().as_int(), Some(1));

        pv.post(&int_value(2), &BitSet::of(1)).unwrap();
        assert!(monitor.wait_event(Duration::from_millis(300)).is_err());

        monitor.ack(2);
        let second = monitor.wait_event(Duration::from_secs(5)).unwrap();
        assert_eq!(second.value.get("value").unwrap().as_int(), Some(2));

        server.shutdown();
    }

    #[test]
    fn test_pv_destroy_unlistens_monitor() {
        let (server, pv, addr) = mailbox_server(5);
        let context = client_context();
        let channel = context.channel("pv1", addr).unwrap();

        let monitor = channel.create_monitor("").unwrap();
        monitor.wait_event(Duration::from_secs(5)).unwrap();

        pv.close(true);
        wait_for("monitor unlisten", || monitor.unlistened());

        server.shutdown();
    }

    struct CountingListener {
        disconnects: AtomicUsize,
        connects: AtomicUsize,
    }

    impl ChannelListener for CountingListener {
        fn channel_state_change(&self, state: ChannelConnState) {
            match state {
                ChannelConnState::Connected => {
                    self.connects.fetch_add(1, AtomicOrdering::SeqCst);
                }
                ChannelConnState::Disconnected => {
                    self.disconnects.fetch_add(1, AtomicOrdering::SeqCst);
                }
                _ => (),
            }
        }
    }

    #[test]
    fn test_server_shutdown_disconnects_channel_exactly_once() {
        let (server, _pv, addr) = mailbox_server(1);
        let context = client_context();
        let channel = context.channel("pv1", addr).unwrap();

        let listener = Arc::new(CountingListener {
            disconnects: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        });
        let as_listener: Arc<dyn ChannelListener> = listener.clone();
        channel.add_listener(&as_listener);

        server.shutdown();
        wait_for("channel disconnect", || {
            channel.state() == ChannelConnState::Disconnected
        });

        // give any duplicate notification a chance to surface
        thread::sleep(Duration::from_millis(200));
        assert_eq!(listener.disconnects.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_shared_pv_close_disconnects_client_channel() {
        let (server, pv, addr) = mailbox_server(1);
        let context = client_context();
        let channel = context.channel("pv1", addr).unwrap();

        pv.close(false);
        wait_for("channel disconnect", || {
            channel.state() == ChannelConnState::Disconnected
        });

        server.shutdown();
    }

    #[test]
    fn test_receive_watchdog_closes_silent_transport() {
        use std::io::Write;
        use std::net::TcpListener;

        // a peer that completes nothing: it sends a single valid header to
        // reveal revision 2, then goes silent forever
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let silent_peer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let header: [u8; 8] = [0xCA, 2, 0xC0, 2, 0, 0, 0, 0]; // server ECHO, BE, empty
            stream.write_all(&header).unwrap();
            thread::sleep(Duration::from_secs(3));
        });

        let stream = TcpStream::connect(addr).unwrap();
        let handler = Arc::new(ClientHandlerTable {
            context: Weak::new(),
        });
        let transport = StreamTransport::new(
            Role::Client,
            stream,
            handler,
            TransportOptions {
                recv_buffer_size: 0,
                connection_timeout: Duration::from_millis(100),
                priority: 0,
            },
            &ion::logging::discard(),
        )
        .unwrap();
        transport.start();

        // two timeout periods pass with no bytes; the receive worker's
        // next poll tick notices and tears the transport down
        let deadline = Instant::now() + Duration::from_secs(4);
        while transport.is_open() {
            if Instant::now() > deadline {
                panic!("watchdog never fired");
            }
            thread::sleep(Duration::from_millis(50));
        }

        silent_peer.join().unwrap();
    }
}
