//! The stream transport: owns a connected socket and exactly two worker
//! threads. The receive worker blocks in `recv` and drives the input
//! codec's state machine; the send worker blocks on the outbound sender
//! queue and serializes senders through the output codec. All other
//! threads talk to a transport by enqueueing senders.

use crate::data::status::Status;
use crate::net::auth::AuthenticationSession;
use crate::net::buffer::{ByteBuffer, ByteOrder};
use crate::net::codec::{
    buffer_size, CodecReader, CodecWriter, InputCodec, OutputCodec, SendOrder, MAX_MESSAGE_PROCESS,
    MAX_MESSAGE_SEND,
};
use crate::net::frame::Header;
use crate::net::shared::{NetError, NetResult};
use ion::logging::{self, Logger};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::client::ClientTransportState;
use crate::server::channel::ServerTransportState;

/// Socket receive timeout; the receive worker wakes this often to check
/// liveness even when the peer is silent.
pub const RX_POLL_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// An object that knows how to serialize one outbound message exchange.
/// `send` runs on the send worker only; implementations guard their own
/// shared state for the duration of the call.
pub trait TransportSender: Send + Sync {
    fn send(&self, codec: &mut OutputCodec, transport: &Arc<StreamTransport>) -> NetResult<()>;
}

/// Role-specific behavior installed at construction: the command dispatch
/// table and the teardown hook.
pub trait TransportHandler: Send + Sync {
    fn dispatch(
        &self,
        transport: &Arc<StreamTransport>,
        hdr: &Header,
        codec: &mut InputCodec,
    ) -> NetResult<()>;

    /// Called exactly once, from `close`.
    fn transport_closed(&self, transport: &Arc<StreamTransport>);
}

/// Sentinel sender enqueued on close to unblock the send worker.
struct BreakSender;

impl TransportSender for BreakSender {
    fn send(&self, _codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
        Err(NetError::Closed)
    }
}

pub struct TransportOptions {
    pub recv_buffer_size: usize,
    pub connection_timeout: Duration,
    pub priority: u16,
}

pub struct AuthState {
    pub session: Option<Box<dyn AuthenticationSession>>,
    pub name: String,
}

struct VerifyState {
    status: Option<Status>,
}

pub struct StreamTransport {
    log: Logger,
    role: Role,
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn TransportHandler>,
    options: TransportOptions,

    closed: AtomicBool,
    queue: Mutex<VecDeque<Arc<dyn TransportSender>>>,
    queue_cond: Condvar,
    send_order: SendOrder,

    last_rx: Mutex<Instant>,
    remote_revision: AtomicU8,
    remote_buffer_size: AtomicUsize,

    verify: Mutex<VerifyState>,
    verify_cond: Condvar,
    auth: Mutex<AuthState>,

    /// Client: the first pass of the heartbeat sender emits the validation
    /// reply instead of an echo.
    verify_or_echo: AtomicBool,
    /// Echo dedup so a slow transport does not pile up heartbeats.
    echo_queued: AtomicBool,

    server: Option<Arc<ServerTransportState>>,
    client: Option<Arc<ClientTransportState>>,
}

impl StreamTransport {
    pub fn new(
        role: Role,
        stream: TcpStream,
        handler: Arc<dyn TransportHandler>,
        options: TransportOptions,
        log: &Logger,
    ) -> NetResult<Arc<StreamTransport>> {
        let peer = stream.peer_addr().map_err(NetError::from)?;
        stream.set_nodelay(true).map_err(NetError::from)?;
        stream
            .set_read_timeout(Some(RX_POLL_PERIOD))
            .map_err(NetError::from)?;

        let log = log.new(logging::o!("peer" => peer.to_string()));

        let transport = Arc::new(StreamTransport {
            log,
            role,
            stream,
            peer,
            handler,
            options,
            closed: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            queue_cond: Condvar::new(),
            send_order: SendOrder::new(ByteOrder::Big),
            last_rx: Mutex::new(Instant::now()),
            remote_revision: AtomicU8::new(0),
            remote_buffer_size: AtomicUsize::new(crate::net::frame::MAX_TCP_RECV),
            verify: Mutex::new(VerifyState { status: None }),
            verify_cond: Condvar::new(),
            auth: Mutex::new(AuthState {
                session: None,
                name: String::new(),
            }),
            verify_or_echo: AtomicBool::new(true),
            echo_queued: AtomicBool::new(true),
            server: match role {
                Role::Server => Some(Arc::new(ServerTransportState::new())),
                Role::Client => None,
            },
            client: match role {
                Role::Client => Some(Arc::new(ClientTransportState::new())),
                Role::Server => None,
            },
        });

        logging::debug!(transport.log, "transport created"; "role" => ?role);
        Ok(transport)
    }

    /// Spawns the receive and send workers. Must be called exactly once.
    pub fn start(self: &Arc<Self>) {
        let rx_transport = self.clone();
        thread::Builder::new()
            .name(format!("positron-rx {}", self.peer))
            .spawn(move || StreamTransport::receive_worker(rx_transport))
            .expect("failed to spawn receive worker");

        let tx_transport = self.clone();
        thread::Builder::new()
            .name(format!("positron-tx {}", self.peer))
            .spawn(move || StreamTransport::send_worker(tx_transport))
            .expect("failed to spawn send worker");
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn connection_timeout(&self) -> Duration {
        self.options.connection_timeout
    }

    #[inline]
    pub fn priority(&self) -> u16 {
        self.options.priority
    }

    #[inline]
    pub fn recv_buffer_size(&self) -> usize {
        buffer_size(self.options.recv_buffer_size)
    }

    pub fn server_state(&self) -> NetResult<&Arc<ServerTransportState>> {
        self.server
            .as_ref()
            .ok_or(NetError::InvalidStream("server command on a client transport"))
    }

    pub fn client_state(&self) -> NetResult<&Arc<ClientTransportState>> {
        self.client
            .as_ref()
            .ok_or(NetError::InvalidStream("client command on a server transport"))
    }

    #[inline]
    pub fn auth(&self) -> &Mutex<AuthState> {
        &self.auth
    }

    /// Remote protocol revision observed from inbound headers.
    #[inline]
    pub fn remote_revision(&self) -> u8 {
        self.remote_revision.load(Ordering::Acquire)
    }

    pub fn set_remote_buffer_size(&self, size: usize) {
        self.remote_buffer_size.store(size, Ordering::Release);
    }

    #[inline]
    pub fn remote_buffer_size(&self) -> usize {
        self.remote_buffer_size.load(Ordering::Acquire)
    }

    /// True when this call armed the echo (i.e. none was queued).
    pub fn arm_echo(&self) -> bool {
        !self.echo_queued.swap(true, Ordering::AcqRel)
    }

    pub fn echo_sent(&self) {
        self.echo_queued.store(false, Ordering::Release);
    }

    /// Consumes the one-shot "first send is the validation reply" flag.
    pub fn take_verify_or_echo(&self) -> bool {
        self.verify_or_echo.swap(false, Ordering::AcqRel)
    }

    pub fn note_rx(&self) {
        *self.last_rx.lock().unwrap() = Instant::now();
    }

    pub fn last_rx_elapsed(&self) -> Duration {
        self.last_rx.lock().unwrap().elapsed()
    }

    /// Receive watchdog: two connection-timeout periods without a byte,
    /// enforced once the peer has shown revision >= 2.
    pub fn rx_expired(&self) -> bool {
        self.remote_revision() >= 2
            && self.last_rx_elapsed() > 2 * self.options.connection_timeout
    }

    /// Records the handshake verdict and wakes `verify` waiters.
    pub fn verified(&self, status: Status) {
        if !status.is_success() {
            logging::debug!(self.log, "connection verification failed"; "message" => %status.message);
        }
        {
            let mut verify = self.verify.lock().unwrap();
            verify.status = Some(status);
        }
        self.verify_cond.notify_all();
    }

    pub fn is_verified(&self) -> bool {
        let verify = self.verify.lock().unwrap();
        match &verify.status {
            Some(status) => status.is_success(),
            None => false,
        }
    }

    /// Blocks until the handshake concludes or `timeout` passes.
    pub fn verify(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut verify = self.verify.lock().unwrap();
        loop {
            if let Some(status) = &verify.status {
                return status.is_success();
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self.verify_cond.wait_timeout(verify, deadline - now).unwrap();
            verify = next;
        }
    }

    pub fn enqueue_send_request(&self, sender: Arc<dyn TransportSender>) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(sender);
        self.queue_cond.notify_all();
    }

    /// Idempotent, callable from any thread. Shuts the socket down, runs
    /// the role teardown hook and unblocks the send worker.
    pub fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        logging::debug!(self.log, "closing transport");

        let _ = self.stream.shutdown(Shutdown::Both);

        // wake anyone still waiting on the handshake
        {
            let mut verify = self.verify.lock().unwrap();
            if verify.status.is_none() {
                verify.status = Some(Status::error("connection closed"));
            }
        }
        self.verify_cond.notify_all();

        self.handler.transport_closed(self);

        self.enqueue_send_request(Arc::new(BreakSender));
    }

    fn try_pop_sender(&self) -> Option<Arc<dyn TransportSender>> {
        let mut queue = self.queue.lock().unwrap();
        queue.pop_front()
    }

    fn pop_sender(&self) -> Arc<dyn TransportSender> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(sender) = queue.pop_front() {
                return sender;
            }
            if !self.is_open() {
                return Arc::new(BreakSender);
            }
            queue = self.queue_cond.wait(queue).unwrap();
        }
    }

    fn clear_send_queue(&self) {
        let mut queue = self.queue.lock().unwrap();
        queue.clear();
    }

    fn receive_worker(transport: Arc<StreamTransport>) {
        let reader = SocketReader {
            stream: match transport.stream.try_clone() {
                Ok(stream) => stream,
                Err(err) => {
                    logging::error!(transport.log, "failed to clone socket for rx"; "error" => %err);
                    transport.close();
                    return;
                }
            },
            transport: Arc::downgrade(&transport),
        };

        let mut codec = InputCodec::new(
            transport.recv_buffer_size(),
            ByteOrder::Big,
            Box::new(reader),
            transport.send_order.clone(),
            transport.log.new(logging::o!("worker" => "rx")),
        );

        while transport.is_open() {
            match transport.process_read(&mut codec) {
                Ok(()) => (),
                Err(NetError::Yield) => (),
                Err(NetError::Closed) => transport.close(),
                Err(err) => {
                    logging::error!(transport.log, "receive worker error"; "error" => ?err);
                    transport.close();
                }
            }
        }
        logging::trace!(transport.log, "receive worker exiting");
    }

    fn process_read(self: &Arc<Self>, codec: &mut InputCodec) -> NetResult<()> {
        let mut processed = 0;
        while processed < MAX_MESSAGE_PROCESS {
            processed += 1;

            let hdr = match codec.next_message()? {
                Some(hdr) => hdr,
                None => return Ok(()),
            };
            self.remote_revision.store(hdr.version, Ordering::Release);

            let result = self.handler.dispatch(self, &hdr, codec);
            if !self.is_open() {
                return Err(NetError::Closed);
            }
            codec.finish_message()?;

            match result {
                Ok(()) => (),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    // contained handler failure, the stream itself is intact
                    logging::warn!(self.log, "command handler failed";
                                   "command" => hdr.command, "error" => ?err);
                }
            }
        }
        Ok(())
    }

    fn send_worker(transport: Arc<StreamTransport>) {
        let writer = SocketWriter {
            stream: match transport.stream.try_clone() {
                Ok(stream) => stream,
                Err(err) => {
                    logging::error!(transport.log, "failed to clone socket for tx"; "error" => %err);
                    transport.close();
                    return;
                }
            },
        };

        let initial_order = match transport.role {
            Role::Server => ByteOrder::native(),
            Role::Client => ByteOrder::Big,
        };
        let mut codec = OutputCodec::new(
            transport.recv_buffer_size(),
            initial_order,
            transport.role == Role::Server,
            Box::new(writer),
            transport.send_order.clone(),
            transport.log.new(logging::o!("worker" => "tx")),
        );

        loop {
            match transport.process_send_queue(&mut codec) {
                Ok(()) => {
                    if !transport.is_open() {
                        break;
                    }
                }
                Err(NetError::Closed) => break,
                Err(err) => {
                    logging::warn!(transport.log, "send worker error"; "error" => ?err);
                    transport.close();
                    break;
                }
            }
        }
        transport.clear_send_queue();
        logging::trace!(transport.log, "send worker exiting");
    }

    fn process_send_queue(self: &Arc<Self>, codec: &mut OutputCodec) -> NetResult<()> {
        let mut processed = 0;
        while processed < MAX_MESSAGE_SEND {
            processed += 1;

            let sender = match self.try_pop_sender() {
                Some(sender) => sender,
                None => {
                    if codec.buffered_bytes() > 0 {
                        codec.flush(true)?;
                    }
                    if !self.is_open() {
                        return Err(NetError::Closed);
                    }
                    codec.apply_pending_order();
                    self.pop_sender()
                }
            };

            self.process_sender(&sender, codec)?;
        }
        if codec.buffered_bytes() > 0 {
            codec.flush(true)?;
        }
        Ok(())
    }

    fn process_sender(
        self: &Arc<Self>,
        sender: &Arc<dyn TransportSender>,
        codec: &mut OutputCodec,
    ) -> NetResult<()> {
        match sender.send(codec, self) {
            Ok(()) => codec.end_message(false),
            Err(NetError::Closed) => Err(NetError::Closed),
            Err(err) => {
                logging::warn!(self.log, "sender failed, closing"; "error" => ?err);
                self.close();
                Err(NetError::Closed)
            }
        }
    }
}

struct SocketReader {
    stream: TcpStream,
    transport: std::sync::Weak<StreamTransport>,
}

impl CodecReader for SocketReader {
    fn read(&mut self, buf: &mut ByteBuffer) -> NetResult<usize> {
        loop {
            match buf.read_from(&mut &self.stream) {
                // orderly end of stream
                Ok(0) => return Err(NetError::Closed),
                Ok(count) => {
                    if let Some(transport) = self.transport.upgrade() {
                        transport.note_rx();
                    }
                    return Ok(count);
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                        let transport = match self.transport.upgrade() {
                            Some(transport) => transport,
                            None => return Err(NetError::Closed),
                        };
                        if !transport.is_open() {
                            return Err(NetError::Closed);
                        }
                        if transport.rx_expired() {
                            logging::error!(transport.log, "receive watchdog expired");
                            return Err(NetError::Timeout);
                        }
                        return Ok(0);
                    }
                    _ => return Err(err.into()),
                },
            }
        }
    }
}

struct SocketWriter {
    stream: TcpStream,
}

impl CodecWriter for SocketWriter {
    fn write(&mut self, data: &[u8]) -> NetResult<usize> {
        loop {
            match (&self.stream).write(data) {
                Ok(0) => return Err(NetError::Closed),
                Ok(count) => return Ok(count),
                Err(err) => match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    // transient kernel buffer exhaustion
                    io::ErrorKind::WouldBlock | io::ErrorKind::OutOfMemory => return Ok(0),
                    _ => return Err(err.into()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::frame::{cmd, HEADER_SIZE, MAGIC};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;

    struct NullHandler {
        closed_count: AtomicUsize,
    }

    impl TransportHandler for NullHandler {
        fn dispatch(
            &self,
            _transport: &Arc<StreamTransport>,
            _hdr: &Header,
            codec: &mut InputCodec,
        ) -> NetResult<()> {
            codec.skip_payload()
        }

        fn transport_closed(&self, _transport: &Arc<StreamTransport>) {
            self.closed_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TaggedSender {
        tag: u32,
    }

    impl TransportSender for TaggedSender {
        fn send(&self, codec: &mut OutputCodec, _transport: &Arc<StreamTransport>) -> NetResult<()> {
            codec.start_message(cmd::ECHO, 4)?;
            codec.buffer().put_u32(self.tag);
            Ok(())
        }
    }

    fn options() -> TransportOptions {
        TransportOptions {
            recv_buffer_size: 0,
            connection_timeout: Duration::from_secs(30),
            priority: 0,
        }
    }

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_senders_flush_in_enqueue_order() {
        let (local, remote) = pair();
        let handler = Arc::new(NullHandler {
            closed_count: AtomicUsize::new(0),
        });
        let transport = StreamTransport::new(
            Role::Server,
            local,
            handler,
            options(),
            &ion::logging::discard(),
        )
        .unwrap();
        transport.start();

        for tag in 0..5u32 {
            transport.enqueue_send_request(Arc::new(TaggedSender { tag }));
        }

        let mut bytes = vec![0u8; 5 * (HEADER_SIZE + 4)];
        let mut remote_reader = remote;
        remote_reader.read_exact(&mut bytes).unwrap();

        for tag in 0..5u32 {
            let base = tag as usize * (HEADER_SIZE + 4);
            assert_eq!(bytes[base], MAGIC);
            assert_eq!(bytes[base + 3], cmd::ECHO);
            let payload = match cfg!(target_endian = "big") {
                true => u32::from_be_bytes([
                    bytes[base + 8],
                    bytes[base + 9],
                    bytes[base + 10],
                    bytes[base + 11],
                ]),
                false => u32::from_le_bytes([
                    bytes[base + 8],
                    bytes[base + 9],
                    bytes[base + 10],
                    bytes[base + 11],
                ]),
            };
            assert_eq!(payload, tag);
        }

        transport.close();
    }

    #[test]
    fn test_close_is_idempotent() {
        let (local, _remote) = pair();
        let handler = Arc::new(NullHandler {
            closed_count: AtomicUsize::new(0),
        });
        let transport = StreamTransport::new(
            Role::Server,
            local,
            handler.clone(),
            options(),
            &ion::logging::discard(),
        )
        .unwrap();
        transport.start();

        transport.close();
        transport.close();
        transport.close();
        assert_eq!(handler.closed_count.load(Ordering::SeqCst), 1);
        assert!(!transport.is_open());
    }

    #[test]
    fn test_peer_disconnect_closes_transport() {
        let (local, remote) = pair();
        let handler = Arc::new(NullHandler {
            closed_count: AtomicUsize::new(0),
        });
        let transport = StreamTransport::new(
            Role::Server,
            local,
            handler.clone(),
            options(),
            &ion::logging::discard(),
        )
        .unwrap();
        transport.start();

        drop(remote);
        for _ in 0..100 {
            if !transport.is_open() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!transport.is_open());
        assert_eq!(handler.closed_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_verify_times_out_then_succeeds() {
        let (local, _remote) = pair();
        let handler = Arc::new(NullHandler {
            closed_count: AtomicUsize::new(0),
        });
        let transport = StreamTransport::new(
            Role::Client,
            local,
            handler,
            options(),
            &ion::logging::discard(),
        )
        .unwrap();

        assert!(!transport.verify(Duration::from_millis(20)));
        transport.verified(Status::ok());
        assert!(transport.verify(Duration::from_millis(20)));
        assert!(transport.is_verified());
    }

    #[test]
    fn test_echo_arming_dedups() {
        let (local, _remote) = pair();
        let handler = Arc::new(NullHandler {
            closed_count: AtomicUsize::new(0),
        });
        let transport = StreamTransport::new(
            Role::Client,
            local,
            handler,
            options(),
            &ion::logging::discard(),
        )
        .unwrap();

        // construction leaves the echo armed until the handshake sender runs
        assert!(!transport.arm_echo());
        transport.echo_sent();
        assert!(transport.arm_echo());
        assert!(!transport.arm_echo());
        transport.echo_sent();
        assert!(transport.arm_echo());
    }
}
