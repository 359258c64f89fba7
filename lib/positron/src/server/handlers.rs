//! Server-side command dispatch: a fixed table indexed by command byte,
//! one handler function per command, and the transport senders that carry
//! the responses back out.

use crate::data::bitset::BitSet;
use crate::data::request::Request;
use crate::data::ser;
use crate::data::status::Status;
use crate::data::value::{Field, PVStructure, Structure};
use crate::net::auth::{AuthOutcome, AuthenticationRegistry, PeerInfo, ANONYMOUS};
use crate::net::codec::{InputCodec, OutputCodec, MAX_ENSURE_DATA_SIZE};
use crate::net::frame::{cmd, command_name, ctrl, subcmd, Header, MAX_CHANNEL_NAME_LENGTH};
use crate::net::shared::{Cid, Ioid, NetError, NetResult, Sid};
use crate::net::transport::{StreamTransport, TransportHandler, TransportSender};
use crate::pv::{MonitorRequester, PutRequester, RpcRequester};
use crate::server::channel::{
    ServerChannel, ServerGetFieldOp, ServerGetOp, ServerMonitorOp, ServerPutOp, ServerRpcOp,
};
use crate::server::ServerContext;
use ion::logging;
use std::sync::{Arc, Weak};

type CommandHandler =
    fn(&ServerHandlerTable, &Arc<StreamTransport>, &Header, &mut InputCodec) -> NetResult<()>;

/// One entry per application command byte; out-of-range commands fall
/// through to `bad_response`.
const HANDLERS: [CommandHandler; 22] = [
    noop,                  // 0  BEACON (datagram side)
    connection_validation, // 1
    echo,                  // 2
    bad_response,          // 3  SEARCH (datagram side)
    bad_response,          // 4  SEARCH_RESPONSE (datagram side)
    authnz,                // 5
    noop,                  // 6  ACL_CHANGE
    create_channel,        // 7
    destroy_channel,       // 8
    bad_response,          // 9  CONNECTION_VALIDATED is client bound
    get,                   // 10
    put,                   // 11
    unsupported_op,        // 12 PUT_GET
    monitor,               // 13
    unsupported_op,        // 14 ARRAY
    destroy_request,       // 15
    unsupported_op,        // 16 PROCESS
    get_field,             // 17
    noop,                  // 18 MESSAGE
    bad_response,          // 19
    rpc,                   // 20
    cancel_request,        // 21
];

pub struct ServerHandlerTable {
    context: Weak<ServerContext>,
}

impl ServerHandlerTable {
    pub fn new(context: Weak<ServerContext>) -> ServerHandlerTable {
        ServerHandlerTable { context }
    }
}

impl TransportHandler for ServerHandlerTable {
    fn dispatch(
        &self,
        transport: &Arc<StreamTransport>,
        hdr: &Header,
        codec: &mut InputCodec,
    ) -> NetResult<()> {
        let handler = HANDLERS
            .get(hdr.command as usize)
            .copied()
            .unwrap_or(bad_response as CommandHandler);
        handler(self, transport, hdr, codec)
    }

    fn transport_closed(&self, transport: &Arc<StreamTransport>) {
        if let Ok(state) = transport.server_state() {
            state.destroy_all();
        }
    }
}

fn noop(
    _table: &ServerHandlerTable,
    _transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    codec.skip_payload()
}

fn bad_response(
    _table: &ServerHandlerTable,
    transport: &Arc<StreamTransport>,
    hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    logging::debug!(transport.log(), "unexpected command discarded";
                    "command" => command_name(hdr.command), "payload" => hdr.payload_size);
    codec.skip_payload()
}

fn connection_validation(
    _table: &ServerHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    codec.ensure_data(4 + 2 + 2)?;
    let remote_buffer_size = codec.buffer().get_u32() as usize;
    let _introspection_limit = codec.buffer().get_u16();
    let _priority = codec.buffer().get_u16();
    let mut plugin_name = ser::read_string(codec)?;
    let init = ser::read_full(codec)?;

    transport.set_remote_buffer_size(remote_buffer_size);
    if plugin_name.is_empty() {
        // legacy peers select nothing and mean anonymous
        plugin_name = ANONYMOUS.to_owned();
    }

    let peer = PeerInfo {
        peer: transport.peer().to_string(),
        authority: plugin_name.clone(),
        transport_revision: transport.remote_revision(),
    };

    let plugin = match AuthenticationRegistry::servers().lookup(&plugin_name) {
        Some(plugin) => plugin,
        None => {
            // forcing an un-advertised plugin is a protocol error
            logging::warn!(transport.log(), "peer selected unknown auth plugin";
                           "plugin" => plugin_name);
            transport.verified(Status::error("unknown auth plugin"));
            return Err(NetError::InvalidStream("unknown auth plugin"));
        }
    };
    if !plugin.is_valid_for(&peer) {
        server_auth_outcome(transport, AuthOutcome::Done(Status::error("invalid auth plugin")));
        return Ok(());
    }

    logging::debug!(transport.log(), "auth plugin accepted"; "plugin" => %peer.authority);
    let mut session = plugin.create_session(&peer, init);
    let outcome = session.begin();
    {
        let mut auth = transport.auth().lock().unwrap();
        auth.session = Some(session);
        auth.name = plugin_name;
    }
    server_auth_outcome(transport, outcome);
    Ok(())
}

fn server_auth_outcome(transport: &Arc<StreamTransport>, outcome: AuthOutcome) {
    match outcome {
        AuthOutcome::Done(status) => {
            if let Ok(state) = transport.server_state() {
                *state.verification_status.lock().unwrap() = status.clone();
            }
            transport.verified(status);
            transport.enqueue_send_request(Arc::new(ServerHandshakeSender));
        }
        AuthOutcome::Continue(Some(data)) => {
            transport.enqueue_send_request(Arc::new(AuthnzSender { data }));
        }
        AuthOutcome::Continue(None) => (),
    }
}

fn authnz(
    _table: &ServerHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    let data = ser::read_full(codec)?;
    let outcome = {
        let mut auth = transport.auth().lock().unwrap();
        auth.session.as_mut().map(|session| session.message_received(data))
    };
    match outcome {
        Some(outcome) => server_auth_outcome(transport, outcome),
        None => {
            logging::warn!(transport.log(), "authnz message without an active session");
        }
    }
    Ok(())
}

fn echo(
    _table: &ServerHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    let mut payload = Vec::new();
    if transport.remote_revision() >= 2 {
        let total = codec.payload_remaining().min(MAX_ENSURE_DATA_SIZE);
        payload.resize(total, 0);
        let mut filled = 0;
        while filled < total {
            let chunk = (total - filled).min(MAX_ENSURE_DATA_SIZE);
            codec.ensure_data(chunk)?;
            codec.buffer().get_slice(&mut payload[filled..filled + chunk]);
            filled += chunk;
        }
    }
    transport.enqueue_send_request(Arc::new(EchoReplySender { payload }));
    Ok(())
}

fn create_channel(
    table: &ServerHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    codec.ensure_data(2)?;
    let count = codec.buffer().get_u16();
    for _ in 0..count {
        codec.ensure_data(4)?;
        let cid = codec.buffer().get_u32();
        let name = ser::read_string(codec)?;
        create_one_channel(table, transport, cid, &name);
    }
    Ok(())
}

fn create_one_channel(table: &ServerHandlerTable, transport: &Arc<StreamTransport>, cid: Cid, name: &str) {
    let respond = |sid: Sid, status: Status| {
        transport.enqueue_send_request(Arc::new(CreateChannelResponseSender { cid, sid, status }));
    };

    if name.is_empty() || name.len() > MAX_CHANNEL_NAME_LENGTH {
        respond(0, Status::error("invalid channel name"));
        return;
    }
    let context = match table.context.upgrade() {
        Some(context) => context,
        None => {
            respond(0, Status::error("server shutting down"));
            return;
        }
    };
    let provider = match context.find_provider(name) {
        Some(provider) => provider.clone(),
        None => {
            respond(0, Status::error("channel not found"));
            return;
        }
    };
    let state = match transport.server_state() {
        Ok(state) => state,
        Err(_) => return,
    };

    let sid = state.channels.preallocate();
    let channel = ServerChannel::new(sid, cid, name, transport);
    match provider.connect(name, channel.clone()) {
        Some(provider_channel) => {
            channel.attach(provider_channel);
            state.channels.register(sid, channel);
            logging::debug!(transport.log(), "channel created";
                            "name" => name, "sid" => sid, "cid" => cid);
            respond(sid, Status::ok());
        }
        None => respond(0, Status::error("channel not found")),
    }
}

fn destroy_channel(
    _table: &ServerHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    codec.ensure_data(8)?;
    let sid = codec.buffer().get_u32();
    let cid = codec.buffer().get_u32();

    let state = transport.server_state()?;
    if let Some(channel) = state.channels.unregister(sid) {
        logging::debug!(transport.log(), "channel destroyed"; "sid" => sid, "name" => channel.name());
        channel.destroy();
    }
    transport.enqueue_send_request(Arc::new(DestroyChannelSender { sid, cid }));
    Ok(())
}

/// Reads the `sid, ioid, subcommand` preamble shared by every operation
/// command.
fn read_op_preamble(codec: &mut InputCodec) -> NetResult<(Sid, Ioid, u8)> {
    codec.ensure_data(4 + 4 + 1)?;
    let sid = codec.buffer().get_u32();
    let ioid = codec.buffer().get_u32();
    let sub = codec.buffer().get_u8();
    Ok((sid, ioid, sub))
}

fn lookup_channel(
    transport: &Arc<StreamTransport>,
    sid: Sid,
) -> NetResult<Option<Arc<ServerChannel>>> {
    Ok(transport.server_state()?.channels.get(sid))
}

fn get(
    _table: &ServerHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    let (sid, ioid, sub) = read_op_preamble(codec)?;

    if sub & subcmd::INIT != 0 {
        let request = Request::from_structure(ser::read_full(codec)?.as_ref());
        let channel = match lookup_channel(transport, sid)? {
            Some(channel) => channel,
            None => {
                transport.enqueue_send_request(Arc::new(OpInitResponseSender {
                    command: cmd::GET,
                    ioid,
                    status: Status::error("bad channel id"),
                    requested: None,
                }));
                return Ok(());
            }
        };
        let op = ServerGetOp::new(ioid, channel.clone(), transport);
        channel.add_ioid(ioid);
        transport.server_state()?.operations.register(ioid, op.clone());
        match channel.provider_channel() {
            Some(provider_channel) => {
                let put = provider_channel.create_put(op.clone(), request);
                op.attach(put);
            }
            None => op.channel_put_connect(Status::error("channel not attached"), None),
        }
        return Ok(());
    }

    let op = transport.server_state()?.operations.get(ioid);
    let op = match op.as_ref().and_then(|op| op.as_any().downcast_ref::<ServerGetOp>()) {
        Some(op) => op,
        None => {
            logging::debug!(transport.log(), "get for unknown operation"; "ioid" => ioid);
            return Ok(());
        }
    };

    if sub & subcmd::DESTROY != 0 {
        op.last_request.store(true, std::sync::atomic::Ordering::Release);
        if sub == subcmd::DESTROY {
            if let Some(op) = transport.server_state()?.operations.unregister(ioid) {
                op.destroy();
            }
            return Ok(());
        }
    }
    op.get();
    Ok(())
}

fn put(
    _table: &ServerHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    let (sid, ioid, sub) = read_op_preamble(codec)?;

    if sub & subcmd::INIT != 0 {
        let request = Request::from_structure(ser::read_full(codec)?.as_ref());
        let channel = match lookup_channel(transport, sid)? {
            Some(channel) => channel,
            None => {
                transport.enqueue_send_request(Arc::new(OpInitResponseSender {
                    command: cmd::PUT,
                    ioid,
                    status: Status::error("bad channel id"),
                    requested: None,
                }));
                return Ok(());
            }
        };
        let op = ServerPutOp::new(ioid, channel.clone(), transport);
        channel.add_ioid(ioid);
        transport.server_state()?.operations.register(ioid, op.clone());
        match channel.provider_channel() {
            Some(provider_channel) => {
                let put = provider_channel.create_put(op.clone(), request);
                op.attach(put);
            }
            None => op.channel_put_connect(Status::error("channel not attached"), None),
        }
        return Ok(());
    }

    let registered = transport.server_state()?.operations.get(ioid);
    let op = match registered
        .as_ref()
        .and_then(|op| op.as_any().downcast_ref::<ServerPutOp>())
    {
        Some(op) => op,
        None => {
            logging::debug!(transport.log(), "put for unknown operation"; "ioid" => ioid);
            return Ok(());
        }
    };

    if sub & subcmd::DESTROY != 0 {
        op.last_request.store(true, std::sync::atomic::Ordering::Release);
        if sub == subcmd::DESTROY {
            if let Some(op) = transport.server_state()?.operations.unregister(ioid) {
                op.destroy();
            }
            return Ok(());
        }
    }

    if sub & subcmd::GET != 0 {
        op.get();
        return Ok(());
    }

    // a put payload: changed bits then the raised fields, in the
    // requested type negotiated at init
    let requested = match op.requested_type() {
        Some(requested) => requested,
        None => {
            op.put_done(Status::error("put before init completed"));
            return Ok(());
        }
    };
    let changed = ser::read_bitset(codec)?;
    let mut value = PVStructure::new_default(requested);
    ser::read_masked(codec, &mut value, &changed)?;
    op.put(value, changed);
    Ok(())
}

fn monitor(
    _table: &ServerHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    let (sid, ioid, sub) = read_op_preamble(codec)?;

    if sub & subcmd::INIT != 0 {
        let request = Request::from_structure(ser::read_full(codec)?.as_ref());
        let channel = match lookup_channel(transport, sid)? {
            Some(channel) => channel,
            None => {
                transport.enqueue_send_request(Arc::new(OpInitResponseSender {
                    command: cmd::MONITOR,
                    ioid,
                    status: Status::error("bad channel id"),
                    requested: None,
                }));
                return Ok(());
            }
        };
        let op = ServerMonitorOp::new(ioid, channel.clone(), transport);
        channel.add_ioid(ioid);
        transport.server_state()?.operations.register(ioid, op.clone());
        match channel.provider_channel() {
            Some(provider_channel) => match provider_channel.create_monitor(op.clone(), request) {
                Ok(monitor) => op.attach(monitor),
                Err(err) => {
                    logging::warn!(transport.log(), "monitor create failed"; "error" => ?err);
                }
            },
            None => op.monitor_connect(Status::error("channel not attached"), None),
        }
        return Ok(());
    }

    if sub & subcmd::ACK != 0 {
        codec.ensure_data(4)?;
        let count = codec.buffer().get_u32();
        let registered = transport.server_state()?.operations.get(ioid);
        if let Some(op) = registered
            .as_ref()
            .and_then(|op| op.as_any().downcast_ref::<ServerMonitorOp>())
        {
            op.ack(count);
        }
        return Ok(());
    }

    if sub & subcmd::DESTROY != 0 {
        if let Some(op) = transport.server_state()?.operations.unregister(ioid) {
            op.destroy();
        }
    }
    Ok(())
}

fn rpc(
    _table: &ServerHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    let (sid, ioid, sub) = read_op_preamble(codec)?;

    if sub & subcmd::INIT != 0 {
        let request = Request::from_structure(ser::read_full(codec)?.as_ref());
        let channel = match lookup_channel(transport, sid)? {
            Some(channel) => channel,
            None => {
                transport.enqueue_send_request(Arc::new(OpInitResponseSender {
                    command: cmd::RPC,
                    ioid,
                    status: Status::error("bad channel id"),
                    requested: None,
                }));
                return Ok(());
            }
        };
        let op = ServerRpcOp::new(ioid, channel.clone(), transport);
        channel.add_ioid(ioid);
        transport.server_state()?.operations.register(ioid, op.clone());
        match channel.provider_channel() {
            Some(provider_channel) => {
                let rpc = provider_channel.create_rpc(op.clone(), request);
                op.attach(rpc);
            }
            None => op.channel_rpc_connect(Status::error("channel not attached")),
        }
        return Ok(());
    }

    let args = ser::read_full(codec)?;
    let registered = transport.server_state()?.operations.get(ioid);
    let op = match registered
        .as_ref()
        .and_then(|op| op.as_any().downcast_ref::<ServerRpcOp>())
    {
        Some(op) => op,
        None => {
            logging::debug!(transport.log(), "rpc for unknown operation"; "ioid" => ioid);
            return Ok(());
        }
    };
    if sub & subcmd::DESTROY != 0 {
        op.last_request.store(true, std::sync::atomic::Ordering::Release);
    }
    match args {
        Some(args) => op.request(args),
        None => op.request(PVStructure::new_default(Structure::new("", Vec::new()))),
    }
    Ok(())
}

fn get_field(
    _table: &ServerHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    codec.ensure_data(8)?;
    let sid = codec.buffer().get_u32();
    let ioid = codec.buffer().get_u32();
    let subfield = ser::read_string(codec)?;

    let channel = lookup_channel(transport, sid)?;
    match channel.and_then(|channel| channel.provider_channel()) {
        Some(provider_channel) => {
            let requester = Arc::new(ServerGetFieldOp {
                ioid,
                transport: Arc::downgrade(transport),
            });
            provider_channel.get_field(requester, &subfield);
        }
        None => {
            transport.enqueue_send_request(Arc::new(GetFieldResponseSender {
                ioid,
                status: Status::error("bad channel id"),
                field: None,
            }));
        }
    }
    Ok(())
}

fn destroy_request(
    _table: &ServerHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    codec.ensure_data(8)?;
    let _sid = codec.buffer().get_u32();
    let ioid = codec.buffer().get_u32();
    if let Some(op) = transport.server_state()?.operations.unregister(ioid) {
        op.destroy();
    }
    Ok(())
}

fn cancel_request(
    _table: &ServerHandlerTable,
    transport: &Arc<StreamTransport>,
    _hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    codec.ensure_data(8)?;
    let _sid = codec.buffer().get_u32();
    let ioid = codec.buffer().get_u32();
    if let Some(op) = transport.server_state()?.operations.get(ioid) {
        op.cancel();
    }
    Ok(())
}

/// PUT_GET, PROCESS and ARRAY: understood on the wire, not provided by the
/// shared-state layer.
fn unsupported_op(
    _table: &ServerHandlerTable,
    transport: &Arc<StreamTransport>,
    hdr: &Header,
    codec: &mut InputCodec,
) -> NetResult<()> {
    let (_sid, ioid, sub) = read_op_preamble(codec)?;
    codec.skip_payload()?;
    transport.enqueue_send_request(Arc::new(OpErrorSender {
        command: hdr.command,
        ioid,
        sub,
        status: Status::error("not supported"),
    }));
    Ok(())
}

//
// transport senders
//

/// First send: SET_ENDIANESS + CONNECTION_VALIDATION offer. Every send
/// after that: CONNECTION_VALIDATED carrying the verification status.
pub struct ServerHandshakeSender;

impl TransportSender for ServerHandshakeSender {
    fn send(&self, codec: &mut OutputCodec, transport: &Arc<StreamTransport>) -> NetResult<()> {
        let state = transport.server_state()?;
        if !state
            .verify_or_verified
            .swap(true, std::sync::atomic::Ordering::AcqRel)
        {
            codec.put_control_message(ctrl::SET_ENDIANESS, 0)?;

            codec.start_message(cmd::CONNECTION_VALIDATION, 4 + 2)?;
            codec.buffer().put_u32(transport.recv_buffer_size() as u32);
            codec.buffer().put_u16(0x7FFF);
            let peer = PeerInfo {
                peer: transport.peer().to_string(),
                authority: String::new(),
                transport_revision: transport.remote_revision(),
            };
            let names = AuthenticationRegistry::servers().names_for(&peer);
            ser::write_size(codec, names.len())?;
            for name in &names {
                ser::write_string(codec, name)?;
            }
            codec.flush(true)
        } else {
            codec.start_message(cmd::CONNECTION_VALIDATED, 0)?;
            let status = state.verification_status.lock().unwrap().clone();
            ser::write_status(codec, &status)?;
            codec.flush(true)
        }
    }
}

pub struct AuthnzSender {
    pub data: PVStructure,
}

impl TransportSender for AuthnzSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::AUTHNZ, 0)?;
        ser::write_full(codec, Some(&self.data))
    }
}

pub struct EchoReplySender {
    pub payload: Vec<u8>,
}

impl TransportSender for EchoReplySender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::ECHO, 0)?;
        let mut offset = 0;
        while offset < self.payload.len() {
            let chunk = (self.payload.len() - offset).min(ser::ENSURE_CHUNK);
            codec.ensure_buffer(chunk)?;
            codec.buffer().put_slice(&self.payload[offset..offset + chunk]);
            offset += chunk;
        }
        codec.flush(true)
    }
}

pub struct CreateChannelResponseSender {
    pub cid: Cid,
    pub sid: Sid,
    pub status: Status,
}

impl TransportSender for CreateChannelResponseSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::CREATE_CHANNEL, 8)?;
        codec.buffer().put_u32(self.cid);
        codec.buffer().put_u32(self.sid);
        ser::write_status(codec, &self.status)
    }
}

/// Server-to-client channel teardown notification, and the confirmation of
/// a client-initiated destroy.
pub struct DestroyChannelSender {
    pub sid: Sid,
    pub cid: Cid,
}

impl TransportSender for DestroyChannelSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::DESTROY_CHANNEL, 8)?;
        codec.buffer().put_u32(self.sid);
        codec.buffer().put_u32(self.cid);
        Ok(())
    }
}

pub struct OpInitResponseSender {
    pub command: u8,
    pub ioid: Ioid,
    pub status: Status,
    pub requested: Option<Arc<Structure>>,
}

impl TransportSender for OpInitResponseSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(self.command, 5)?;
        codec.buffer().put_u32(self.ioid);
        codec.buffer().put_u8(subcmd::INIT);
        ser::write_status(codec, &self.status)?;
        if self.status.is_success() {
            if let Some(requested) = &self.requested {
                ser::write_field_desc(codec, &Field::Structure(requested.clone()))?;
            }
        }
        Ok(())
    }
}

/// Failure response for any operation subcommand.
pub struct OpErrorSender {
    pub command: u8,
    pub ioid: Ioid,
    pub sub: u8,
    pub status: Status,
}

impl TransportSender for OpErrorSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(self.command, 5)?;
        codec.buffer().put_u32(self.ioid);
        codec.buffer().put_u8(self.sub);
        ser::write_status(codec, &self.status)
    }
}

pub struct GetResponseSender {
    pub ioid: Ioid,
    pub status: Status,
    pub value: Option<(PVStructure, BitSet)>,
}

impl TransportSender for GetResponseSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::GET, 5)?;
        codec.buffer().put_u32(self.ioid);
        codec.buffer().put_u8(subcmd::DEFAULT);
        ser::write_status(codec, &self.status)?;
        if self.status.is_success() {
            if let Some((value, changed)) = &self.value {
                ser::write_bitset(codec, changed)?;
                ser::write_masked(codec, value, changed)?;
            }
        }
        Ok(())
    }
}

pub struct PutResponseSender {
    pub ioid: Ioid,
    pub status: Status,
}

impl TransportSender for PutResponseSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::PUT, 5)?;
        codec.buffer().put_u32(self.ioid);
        codec.buffer().put_u8(subcmd::DEFAULT);
        ser::write_status(codec, &self.status)
    }
}

/// Read-back of the put's selected sub-value.
pub struct PutGetResponseSender {
    pub ioid: Ioid,
    pub status: Status,
    pub value: Option<(PVStructure, BitSet)>,
}

impl TransportSender for PutGetResponseSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::PUT, 5)?;
        codec.buffer().put_u32(self.ioid);
        codec.buffer().put_u8(subcmd::GET);
        ser::write_status(codec, &self.status)?;
        if self.status.is_success() {
            if let Some((value, changed)) = &self.value {
                ser::write_bitset(codec, changed)?;
                ser::write_masked(codec, value, changed)?;
            }
        }
        Ok(())
    }
}

/// Drains the monitor FIFO into one event message per element.
pub struct MonitorEventSender {
    pub op: Arc<ServerMonitorOp>,
}

impl TransportSender for MonitorEventSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        self.op.event_drained();
        let monitor = match self.op.monitor() {
            Some(monitor) => monitor,
            None => return Ok(()),
        };
        while let Some(element) = monitor.poll() {
            codec.start_message(cmd::MONITOR, 5)?;
            codec.buffer().put_u32(self.op.ioid_value());
            codec.buffer().put_u8(subcmd::DEFAULT);
            ser::write_bitset(codec, &element.changed)?;
            ser::write_masked(codec, &element.value, &element.changed)?;
            ser::write_bitset(codec, &element.overrun)?;
            codec.end_message(false)?;
        }
        Ok(())
    }
}

/// Tells the peer no further monitor updates will ever arrive.
pub struct MonitorUnlistenSender {
    pub ioid: Ioid,
}

impl TransportSender for MonitorUnlistenSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::MONITOR, 5)?;
        codec.buffer().put_u32(self.ioid);
        codec.buffer().put_u8(subcmd::DESTROY);
        Ok(())
    }
}

pub struct RpcResponseSender {
    pub ioid: Ioid,
    pub status: Status,
    pub value: Option<PVStructure>,
}

impl TransportSender for RpcResponseSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::RPC, 5)?;
        codec.buffer().put_u32(self.ioid);
        codec.buffer().put_u8(subcmd::DEFAULT);
        ser::write_status(codec, &self.status)?;
        if self.status.is_success() {
            ser::write_full(codec, self.value.as_ref())?;
        }
        Ok(())
    }
}

pub struct GetFieldResponseSender {
    pub ioid: Ioid,
    pub status: Status,
    pub field: Option<Field>,
}

impl TransportSender for GetFieldResponseSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::GET_FIELD, 5)?;
        codec.buffer().put_u32(self.ioid);
        ser::write_status(codec, &self.status)?;
        ser::write_opt_field_desc(codec, self.field.as_ref())
    }
}
