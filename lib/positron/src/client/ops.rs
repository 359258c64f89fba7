//! Client-side operations: init-then-operate objects keyed by ioid, each
//! pairing a wire sender with a response handler and a small blocking
//! facade on top of the completion plumbing. Every operation keeps its
//! whole state behind one mutex so its condvar always pairs with the same
//! lock.

use crate::client::{ClientChannel, ResponseRequest};
use crate::data::bitset::BitSet;
use crate::data::request::Request;
use crate::data::ser;
use crate::data::status::Status;
use crate::data::value::{Field, PVStructure, Structure};
use crate::net::codec::{InputCodec, OutputCodec};
use crate::net::frame::{cmd, subcmd, Header};
use crate::net::shared::{Cid, Ioid, NetError, NetResult, Sid};
use crate::net::transport::{StreamTransport, TransportSender};
use crate::pv::MonitorElement;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct CreateChannelSender {
    pub cid: Cid,
    pub name: String,
}

impl TransportSender for CreateChannelSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::CREATE_CHANNEL, 6)?;
        codec.buffer().put_u16(1);
        codec.buffer().put_u32(self.cid);
        ser::write_string(codec, &self.name)
    }
}

pub struct DestroyChannelClientSender {
    pub sid: Sid,
    pub cid: Cid,
}

impl TransportSender for DestroyChannelClientSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::DESTROY_CHANNEL, 8)?;
        codec.buffer().put_u32(self.sid);
        codec.buffer().put_u32(self.cid);
        Ok(())
    }
}

struct OpInitSender {
    command: u8,
    sid: Sid,
    ioid: Ioid,
    request: Request,
}

impl TransportSender for OpInitSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(self.command, 9)?;
        codec.buffer().put_u32(self.sid);
        codec.buffer().put_u32(self.ioid);
        codec.buffer().put_u8(subcmd::INIT);
        ser::write_full(codec, Some(&self.request.to_structure()))
    }
}

struct OpExecSender {
    command: u8,
    sid: Sid,
    ioid: Ioid,
    sub: u8,
}

impl TransportSender for OpExecSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(self.command, 9)?;
        codec.buffer().put_u32(self.sid);
        codec.buffer().put_u32(self.ioid);
        codec.buffer().put_u8(self.sub);
        Ok(())
    }
}

struct PutExecSender {
    sid: Sid,
    ioid: Ioid,
    value: PVStructure,
    changed: BitSet,
}

impl TransportSender for PutExecSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::PUT, 9)?;
        codec.buffer().put_u32(self.sid);
        codec.buffer().put_u32(self.ioid);
        codec.buffer().put_u8(subcmd::DEFAULT);
        ser::write_bitset(codec, &self.changed)?;
        ser::write_masked(codec, &self.value, &self.changed)
    }
}

struct RpcExecSender {
    sid: Sid,
    ioid: Ioid,
    args: PVStructure,
}

impl TransportSender for RpcExecSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::RPC, 9)?;
        codec.buffer().put_u32(self.sid);
        codec.buffer().put_u32(self.ioid);
        codec.buffer().put_u8(subcmd::DEFAULT);
        ser::write_full(codec, Some(&self.args))
    }
}

/// Final teardown of an in-flight operation.
struct DestroyRequestSender {
    sid: Sid,
    ioid: Ioid,
}

impl TransportSender for DestroyRequestSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::DESTROY_REQUEST, 8)?;
        codec.buffer().put_u32(self.sid);
        codec.buffer().put_u32(self.ioid);
        Ok(())
    }
}

/// Best-effort abort; the operation still completes.
struct CancelRequestSender {
    sid: Sid,
    ioid: Ioid,
}

impl TransportSender for CancelRequestSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::CANCEL_REQUEST, 8)?;
        codec.buffer().put_u32(self.sid);
        codec.buffer().put_u32(self.ioid);
        Ok(())
    }
}

struct MonitorAckSender {
    sid: Sid,
    ioid: Ioid,
    count: u32,
}

impl TransportSender for MonitorAckSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::MONITOR, 13)?;
        codec.buffer().put_u32(self.sid);
        codec.buffer().put_u32(self.ioid);
        codec.buffer().put_u8(subcmd::ACK);
        codec.buffer().put_u32(self.count);
        Ok(())
    }
}

struct GetFieldSender {
    sid: Sid,
    ioid: Ioid,
    subfield: String,
}

impl TransportSender for GetFieldSender {
    fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        codec.start_message(cmd::GET_FIELD, 8)?;
        codec.buffer().put_u32(self.sid);
        codec.buffer().put_u32(self.ioid);
        ser::write_string(codec, &self.subfield)
    }
}

fn timeout_status() -> Status {
    Status::error("operation timed out")
}

fn closed_status() -> Status {
    Status::error("connection closed")
}

fn read_init_response(
    codec: &mut InputCodec,
    expect_type: bool,
) -> NetResult<(Status, Option<Arc<Structure>>)> {
    let status = ser::read_status(codec)?;
    let requested = if status.is_success() && expect_type {
        match ser::read_field_desc(codec)? {
            Field::Structure(structure) => Some(structure),
            _ => return Err(NetError::InvalidStream("expected a structure type")),
        }
    } else {
        None
    };
    Ok((status, requested))
}

fn read_value_payload(
    codec: &mut InputCodec,
    requested: &Arc<Structure>,
) -> NetResult<(PVStructure, BitSet)> {
    let changed = ser::read_bitset(codec)?;
    let mut value = PVStructure::new_default(requested.clone());
    ser::read_masked(codec, &mut value, &changed)?;
    Ok((value, changed))
}

type ValueResult = Option<(Status, Option<(PVStructure, BitSet)>)>;

/// Reads the selected sub-value of a channel.
pub struct ClientGet {
    channel: Arc<ClientChannel>,
    ioid: Ioid,
    state: Mutex<GetState>,
    cond: Condvar,
}

struct GetState {
    connect: Option<Status>,
    requested: Option<Arc<Structure>>,
    result: ValueResult,
    closed: bool,
}

impl ClientGet {
    pub(crate) fn create(channel: &Arc<ClientChannel>, request: &str) -> Result<Arc<ClientGet>, Status> {
        let request = Request::parse(request).map_err(Status::error)?;
        let transport_state = channel
            .transport()
            .client_state()
            .map_err(|err| Status::error(format!("{:?}", err)))?;
        let ioid = transport_state.allocate_ioid();

        let get = Arc::new(ClientGet {
            channel: channel.clone(),
            ioid,
            state: Mutex::new(GetState {
                connect: None,
                requested: None,
                result: None,
                closed: false,
            }),
            cond: Condvar::new(),
        });
        transport_state.register_response(ioid, get.clone());
        channel.transport().enqueue_send_request(Arc::new(OpInitSender {
            command: cmd::GET,
            sid: channel.sid(),
            ioid,
            request,
        }));
        Ok(get)
    }

    pub(crate) fn wait_connected(&self, timeout: Duration) -> Result<(), Status> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(status) = &state.connect {
                if status.is_success() {
                    return Ok(());
                }
                return Err(status.clone());
            }
            if state.closed {
                return Err(closed_status());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(timeout_status());
            }
            let (next, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }

    /// The type the server serves for this operation's selection.
    pub fn requested(&self) -> Option<Arc<Structure>> {
        self.state.lock().unwrap().requested.clone()
    }

    /// Issues one read and blocks for the result.
    pub fn get(&self) -> Result<(PVStructure, BitSet), Status> {
        self.state.lock().unwrap().result = None;
        self.channel.transport().enqueue_send_request(Arc::new(OpExecSender {
            command: cmd::GET,
            sid: self.channel.sid(),
            ioid: self.ioid,
            sub: subcmd::DEFAULT,
        }));

        let deadline = Instant::now() + self.channel.op_timeout();
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some((status, value)) = state.result.take() {
                return match (status.is_success(), value) {
                    (true, Some(value)) => Ok(value),
                    (true, None) => Err(Status::error("empty get response")),
                    (false, _) => Err(status),
                };
            }
            if state.closed {
                return Err(closed_status());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(timeout_status());
            }
            let (next, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }

    /// Requests the server abort in-flight work; completion is still
    /// signaled.
    pub fn cancel(&self) {
        self.channel.transport().enqueue_send_request(Arc::new(CancelRequestSender {
            sid: self.channel.sid(),
            ioid: self.ioid,
        }));
    }

    pub fn destroy(&self) {
        if let Ok(transport_state) = self.channel.transport().client_state() {
            transport_state.unregister_response(self.ioid);
        }
        self.channel.transport().enqueue_send_request(Arc::new(DestroyRequestSender {
            sid: self.channel.sid(),
            ioid: self.ioid,
        }));
    }
}

impl ResponseRequest for ClientGet {
    fn handle_response(&self, _hdr: &Header, codec: &mut InputCodec) -> NetResult<()> {
        codec.ensure_data(1)?;
        let sub = codec.buffer().get_u8();

        if sub & subcmd::INIT != 0 {
            let (status, requested) = read_init_response(codec, true)?;
            let mut state = self.state.lock().unwrap();
            state.requested = requested;
            state.connect = Some(status);
            self.cond.notify_all();
            return Ok(());
        }

        let status = ser::read_status(codec)?;
        let value = if status.is_success() {
            let requested = self
                .state
                .lock()
                .unwrap()
                .requested
                .clone()
                .ok_or(NetError::InvalidStream("data response before init"))?;
            Some(read_value_payload(codec, &requested)?)
        } else {
            None
        };
        self.state.lock().unwrap().result = Some((status, value));
        self.cond.notify_all();
        Ok(())
    }

    fn transport_closed(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }
}

/// Writes (and reads back) the selected sub-value of a channel.
pub struct ClientPut {
    channel: Arc<ClientChannel>,
    ioid: Ioid,
    state: Mutex<PutState>,
    cond: Condvar,
}

struct PutState {
    connect: Option<Status>,
    requested: Option<Arc<Structure>>,
    put_result: Option<Status>,
    get_result: ValueResult,
    closed: bool,
}

impl ClientPut {
    pub(crate) fn create(channel: &Arc<ClientChannel>, request: &str) -> Result<Arc<ClientPut>, Status> {
        let request = Request::parse(request).map_err(Status::error)?;
        let transport_state = channel
            .transport()
            .client_state()
            .map_err(|err| Status::error(format!("{:?}", err)))?;
        let ioid = transport_state.allocate_ioid();

        let put = Arc::new(ClientPut {
            channel: channel.clone(),
            ioid,
            state: Mutex::new(PutState {
                connect: None,
                requested: None,
                put_result: None,
                get_result: None,
                closed: false,
            }),
            cond: Condvar::new(),
        });
        transport_state.register_response(ioid, put.clone());
        channel.transport().enqueue_send_request(Arc::new(OpInitSender {
            command: cmd::PUT,
            sid: channel.sid(),
            ioid,
            request,
        }));
        Ok(put)
    }

    pub(crate) fn wait_connected(&self, timeout: Duration) -> Result<(), Status> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(status) = &state.connect {
                if status.is_success() {
                    return Ok(());
                }
                return Err(status.clone());
            }
            if state.closed {
                return Err(closed_status());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(timeout_status());
            }
            let (next, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }

    pub fn requested(&self) -> Option<Arc<Structure>> {
        self.state.lock().unwrap().requested.clone()
    }

    /// Builds a default value of the negotiated type to fill in.
    pub fn build(&self) -> Option<PVStructure> {
        self.requested().map(PVStructure::new_default)
    }

    /// Writes the raised fields and blocks until the server confirms.
    pub fn put(&self, value: &PVStructure, changed: &BitSet) -> Result<(), Status> {
        {
            let mut state = self.state.lock().unwrap();
            match &state.requested {
                Some(requested) => {
                    if value.structure() != requested {
                        return Err(Status::error("value type does not match the operation"));
                    }
                }
                None => return Err(Status::error("put before connect")),
            }
            state.put_result = None;
        }

        self.channel.transport().enqueue_send_request(Arc::new(PutExecSender {
            sid: self.channel.sid(),
            ioid: self.ioid,
            value: value.clone(),
            changed: changed.clone(),
        }));

        let deadline = Instant::now() + self.channel.op_timeout();
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(status) = state.put_result.take() {
                if status.is_success() {
                    return Ok(());
                }
                return Err(status);
            }
            if state.closed {
                return Err(closed_status());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(timeout_status());
            }
            let (next, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }

    /// Reads back the selected sub-value through the same operation.
    pub fn get(&self) -> Result<(PVStructure, BitSet), Status> {
        self.state.lock().unwrap().get_result = None;
        self.channel.transport().enqueue_send_request(Arc::new(OpExecSender {
            command: cmd::PUT,
            sid: self.channel.sid(),
            ioid: self.ioid,
            sub: subcmd::GET,
        }));

        let deadline = Instant::now() + self.channel.op_timeout();
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some((status, value)) = state.get_result.take() {
                return match (status.is_success(), value) {
                    (true, Some(value)) => Ok(value),
                    (true, None) => Err(Status::error("empty get response")),
                    (false, _) => Err(status),
                };
            }
            if state.closed {
                return Err(closed_status());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(timeout_status());
            }
            let (next, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }

    /// Requests the server abort in-flight work; completion is still
    /// signaled.
    pub fn cancel(&self) {
        self.channel.transport().enqueue_send_request(Arc::new(CancelRequestSender {
            sid: self.channel.sid(),
            ioid: self.ioid,
        }));
    }

    pub fn destroy(&self) {
        if let Ok(transport_state) = self.channel.transport().client_state() {
            transport_state.unregister_response(self.ioid);
        }
        self.channel.transport().enqueue_send_request(Arc::new(DestroyRequestSender {
            sid: self.channel.sid(),
            ioid: self.ioid,
        }));
    }
}

impl ResponseRequest for ClientPut {
    fn handle_response(&self, _hdr: &Header, codec: &mut InputCodec) -> NetResult<()> {
        codec.ensure_data(1)?;
        let sub = codec.buffer().get_u8();

        if sub & subcmd::INIT != 0 {
            let (status, requested) = read_init_response(codec, true)?;
            let mut state = self.state.lock().unwrap();
            state.requested = requested;
            state.connect = Some(status);
            self.cond.notify_all();
            return Ok(());
        }

        if sub & subcmd::GET != 0 {
            let status = ser::read_status(codec)?;
            let value = if status.is_success() {
                let requested = self
                    .state
                    .lock()
                    .unwrap()
                    .requested
                    .clone()
                    .ok_or(NetError::InvalidStream("data response before init"))?;
                Some(read_value_payload(codec, &requested)?)
            } else {
                None
            };
            self.state.lock().unwrap().get_result = Some((status, value));
            self.cond.notify_all();
            return Ok(());
        }

        let status = ser::read_status(codec)?;
        self.state.lock().unwrap().put_result = Some(status);
        self.cond.notify_all();
        Ok(())
    }

    fn transport_closed(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }
}

/// A subscription delivering value updates in posting order.
pub struct ClientMonitor {
    channel: Arc<ClientChannel>,
    ioid: Ioid,
    state: Mutex<MonitorState>,
    cond: Condvar,
}

struct MonitorState {
    connect: Option<Status>,
    requested: Option<Arc<Structure>>,
    queue: VecDeque<MonitorElement>,
    unlistened: bool,
    closed: bool,
}

impl ClientMonitor {
    pub(crate) fn create(channel: &Arc<ClientChannel>, request: &str) -> Result<Arc<ClientMonitor>, Status> {
        let request = Request::parse(request).map_err(Status::error)?;
        let transport_state = channel
            .transport()
            .client_state()
            .map_err(|err| Status::error(format!("{:?}", err)))?;
        let ioid = transport_state.allocate_ioid();

        let monitor = Arc::new(ClientMonitor {
            channel: channel.clone(),
            ioid,
            state: Mutex::new(MonitorState {
                connect: None,
                requested: None,
                queue: VecDeque::new(),
                unlistened: false,
                closed: false,
            }),
            cond: Condvar::new(),
        });
        transport_state.register_response(ioid, monitor.clone());
        channel.transport().enqueue_send_request(Arc::new(OpInitSender {
            command: cmd::MONITOR,
            sid: channel.sid(),
            ioid,
            request,
        }));
        Ok(monitor)
    }

    pub(crate) fn wait_connected(&self, timeout: Duration) -> Result<(), Status> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(status) = &state.connect {
                if status.is_success() {
                    return Ok(());
                }
                return Err(status.clone());
            }
            if state.closed {
                return Err(closed_status());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(timeout_status());
            }
            let (next, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }

    pub fn requested(&self) -> Option<Arc<Structure>> {
        self.state.lock().unwrap().requested.clone()
    }

    /// Takes the next queued update without blocking.
    pub fn poll(&self) -> Option<MonitorElement> {
        self.state.lock().unwrap().queue.pop_front()
    }

    /// Blocks until an update arrives, the subscription ends or `timeout`
    /// passes.
    pub fn wait_event(&self, timeout: Duration) -> Result<MonitorElement, Status> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(element) = state.queue.pop_front() {
                return Ok(element);
            }
            if state.unlistened {
                return Err(Status::warn("no more updates"));
            }
            if state.closed {
                return Err(closed_status());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(timeout_status());
            }
            let (next, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }

    /// Whether the server has declared the subscription finished.
    pub fn unlistened(&self) -> bool {
        self.state.lock().unwrap().unlistened
    }

    /// Grants the server `count` more pipeline slots.
    pub fn ack(&self, count: u32) {
        self.channel.transport().enqueue_send_request(Arc::new(MonitorAckSender {
            sid: self.channel.sid(),
            ioid: self.ioid,
            count,
        }));
    }

    /// Requests the server abort in-flight work; completion is still
    /// signaled.
    pub fn cancel(&self) {
        self.channel.transport().enqueue_send_request(Arc::new(CancelRequestSender {
            sid: self.channel.sid(),
            ioid: self.ioid,
        }));
    }

    pub fn destroy(&self) {
        if let Ok(transport_state) = self.channel.transport().client_state() {
            transport_state.unregister_response(self.ioid);
        }
        self.channel.transport().enqueue_send_request(Arc::new(DestroyRequestSender {
            sid: self.channel.sid(),
            ioid: self.ioid,
        }));
    }
}

impl ResponseRequest for ClientMonitor {
    fn handle_response(&self, _hdr: &Header, codec: &mut InputCodec) -> NetResult<()> {
        codec.ensure_data(1)?;
        let sub = codec.buffer().get_u8();

        if sub & subcmd::INIT != 0 {
            let (status, requested) = read_init_response(codec, true)?;
            let mut state = self.state.lock().unwrap();
            state.requested = requested;
            state.connect = Some(status);
            self.cond.notify_all();
            return Ok(());
        }

        if sub & subcmd::DESTROY != 0 {
            self.state.lock().unwrap().unlistened = true;
            self.cond.notify_all();
            return Ok(());
        }

        let requested = self
            .state
            .lock()
            .unwrap()
            .requested
            .clone()
            .ok_or(NetError::InvalidStream("monitor event before init"))?;
        let changed = ser::read_bitset(codec)?;
        let mut value = PVStructure::new_default(requested);
        ser::read_masked(codec, &mut value, &changed)?;
        let overrun = ser::read_bitset(codec)?;

        self.state.lock().unwrap().queue.push_back(MonitorElement {
            value,
            changed,
            overrun,
        });
        self.cond.notify_all();
        Ok(())
    }

    fn transport_closed(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }
}

/// Invokes the channel's remote procedure.
pub struct ClientRpc {
    channel: Arc<ClientChannel>,
    ioid: Ioid,
    state: Mutex<RpcState>,
    cond: Condvar,
}

struct RpcState {
    connect: Option<Status>,
    result: Option<(Status, Option<PVStructure>)>,
    closed: bool,
}

impl ClientRpc {
    pub(crate) fn create(channel: &Arc<ClientChannel>, request: &str) -> Result<Arc<ClientRpc>, Status> {
        let request = Request::parse(request).map_err(Status::error)?;
        let transport_state = channel
            .transport()
            .client_state()
            .map_err(|err| Status::error(format!("{:?}", err)))?;
        let ioid = transport_state.allocate_ioid();

        let rpc = Arc::new(ClientRpc {
            channel: channel.clone(),
            ioid,
            state: Mutex::new(RpcState {
                connect: None,
                result: None,
                closed: false,
            }),
            cond: Condvar::new(),
        });
        transport_state.register_response(ioid, rpc.clone());
        channel.transport().enqueue_send_request(Arc::new(OpInitSender {
            command: cmd::RPC,
            sid: channel.sid(),
            ioid,
            request,
        }));
        Ok(rpc)
    }

    pub(crate) fn wait_connected(&self, timeout: Duration) -> Result<(), Status> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(status) = &state.connect {
                if status.is_success() {
                    return Ok(());
                }
                return Err(status.clone());
            }
            if state.closed {
                return Err(closed_status());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(timeout_status());
            }
            let (next, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }

    /// Calls with `args` and blocks for the response value.
    pub fn request(&self, args: &PVStructure) -> Result<PVStructure, Status> {
        self.state.lock().unwrap().result = None;
        self.channel.transport().enqueue_send_request(Arc::new(RpcExecSender {
            sid: self.channel.sid(),
            ioid: self.ioid,
            args: args.clone(),
        }));

        let deadline = Instant::now() + self.channel.op_timeout();
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some((status, value)) = state.result.take() {
                return match (status.is_success(), value) {
                    (true, Some(value)) => Ok(value),
                    (true, None) => Err(Status::error("empty rpc response")),
                    (false, _) => Err(status),
                };
            }
            if state.closed {
                return Err(closed_status());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(timeout_status());
            }
            let (next, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }

    /// Requests the server abort in-flight work; completion is still
    /// signaled.
    pub fn cancel(&self) {
        self.channel.transport().enqueue_send_request(Arc::new(CancelRequestSender {
            sid: self.channel.sid(),
            ioid: self.ioid,
        }));
    }

    pub fn destroy(&self) {
        if let Ok(transport_state) = self.channel.transport().client_state() {
            transport_state.unregister_response(self.ioid);
        }
        self.channel.transport().enqueue_send_request(Arc::new(DestroyRequestSender {
            sid: self.channel.sid(),
            ioid: self.ioid,
        }));
    }
}

impl ResponseRequest for ClientRpc {
    fn handle_response(&self, _hdr: &Header, codec: &mut InputCodec) -> NetResult<()> {
        codec.ensure_data(1)?;
        let sub = codec.buffer().get_u8();

        if sub & subcmd::INIT != 0 {
            let (status, _) = read_init_response(codec, false)?;
            self.state.lock().unwrap().connect = Some(status);
            self.cond.notify_all();
            return Ok(());
        }

        let status = ser::read_status(codec)?;
        let value = if status.is_success() {
            ser::read_full(codec)?
        } else {
            None
        };
        self.state.lock().unwrap().result = Some((status, value));
        self.cond.notify_all();
        Ok(())
    }

    fn transport_closed(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }
}

struct GetFieldWait {
    state: Mutex<GetFieldState>,
    cond: Condvar,
}

struct GetFieldState {
    result: Option<(Status, Option<Field>)>,
    closed: bool,
}

impl ResponseRequest for GetFieldWait {
    fn handle_response(&self, _hdr: &Header, codec: &mut InputCodec) -> NetResult<()> {
        let status = ser::read_status(codec)?;
        let field = ser::read_opt_field_desc(codec)?;
        self.state.lock().unwrap().result = Some((status, field));
        self.cond.notify_all();
        Ok(())
    }

    fn transport_closed(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }
}

pub(crate) fn get_field(
    channel: &Arc<ClientChannel>,
    subfield: &str,
    timeout: Duration,
) -> Result<Field, Status> {
    let transport_state = channel
        .transport()
        .client_state()
        .map_err(|err| Status::error(format!("{:?}", err)))?;
    let ioid = transport_state.allocate_ioid();

    let wait = Arc::new(GetFieldWait {
        state: Mutex::new(GetFieldState {
            result: None,
            closed: false,
        }),
        cond: Condvar::new(),
    });
    transport_state.register_response(ioid, wait.clone());
    channel.transport().enqueue_send_request(Arc::new(GetFieldSender {
        sid: channel.sid(),
        ioid,
        subfield: subfield.to_owned(),
    }));

    let deadline = Instant::now() + timeout;
    let outcome = {
        let mut state = wait.state.lock().unwrap();
        loop {
            if let Some((status, field)) = state.result.take() {
                break Ok((status, field));
            }
            if state.closed {
                break Err(closed_status());
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(timeout_status());
            }
            let (next, _) = wait.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    };
    transport_state.unregister_response(ioid);

    match outcome? {
        (status, Some(field)) if status.is_success() => Ok(field),
        (status, _) if !status.is_success() => Err(status),
        _ => Err(Status::error("no such field")),
    }
}
