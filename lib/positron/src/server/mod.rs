//! The server: a listening context accepting transports, the per-transport
//! channel/operation bookkeeping and the command handlers bridging the
//! wire to channel providers.

pub mod channel;
pub mod handlers;

use crate::net::shared::{NetError, NetResult};
use crate::net::transport::{Role, StreamTransport, TransportOptions};
use crate::pv::Provider;
use ion::config::Config;
use ion::logging::{self, Logger};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

pub struct ServerContext {
    config: Config,
    log: Logger,
    providers: Vec<Arc<dyn Provider>>,
    local_addr: SocketAddr,
    running: AtomicBool,
    transports: Mutex<Vec<Weak<StreamTransport>>>,
    accept_worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ServerContext {
    /// Binds the TCP listener and starts accepting. A `server_port` of 0
    /// picks an ephemeral port, reported by `local_addr`.
    pub fn start(
        config: Config,
        providers: Vec<Arc<dyn Provider>>,
        log: &Logger,
    ) -> NetResult<Arc<ServerContext>> {
        let listener =
            TcpListener::bind(("0.0.0.0", config.server_port)).map_err(NetError::from)?;
        let local_addr = listener.local_addr().map_err(NetError::from)?;
        let log = log.new(logging::o!("server" => local_addr.to_string()));

        let context = Arc::new(ServerContext {
            config,
            log,
            providers,
            local_addr,
            running: AtomicBool::new(true),
            transports: Mutex::new(Vec::new()),
            accept_worker: Mutex::new(None),
        });

        let accept_context = context.clone();
        let worker = thread::Builder::new()
            .name(format!("positron-accept {}", local_addr))
            .spawn(move || ServerContext::accept_loop(accept_context, listener))
            .expect("failed to spawn accept thread");
        *context.accept_worker.lock().unwrap() = Some(worker);

        logging::info!(context.log, "server listening";
                       "providers" => context.providers.len());
        Ok(context)
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    /// Resolves a channel name through the provider list, in order.
    pub fn find_provider(&self, channel_name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.iter().find(|provider| provider.find(channel_name))
    }

    fn accept_loop(context: Arc<ServerContext>, listener: TcpListener) {
        for incoming in listener.incoming() {
            if !context.running.load(Ordering::Acquire) {
                break;
            }
            match incoming {
                Ok(stream) => {
                    if let Err(err) = context.on_accept(stream) {
                        logging::warn!(context.log, "failed to set up transport"; "error" => ?err);
                    }
                }
                Err(err) => {
                    if context.running.load(Ordering::Acquire) {
                        logging::warn!(context.log, "accept failed"; "error" => %err);
                    }
                }
            }
        }
        logging::trace!(context.log, "accept thread exiting");
    }

    fn on_accept(self: &Arc<Self>, stream: TcpStream) -> NetResult<()> {
        let handler = Arc::new(handlers::ServerHandlerTable::new(Arc::downgrade(self)));
        let transport = StreamTransport::new(
            Role::Server,
            stream,
            handler,
            TransportOptions {
                recv_buffer_size: self.config.recv_buffer_size,
                connection_timeout: Duration::from_secs_f64(self.config.connection_timeout),
                priority: crate::net::frame::DEFAULT_PRIORITY,
            },
            &self.log,
        )?;

        {
            let mut transports = self.transports.lock().unwrap();
            transports.retain(|weak| weak.upgrade().is_some());
            transports.push(Arc::downgrade(&transport));
        }

        transport.start();
        // opens the conversation: SET_ENDIANESS + CONNECTION_VALIDATION
        transport.enqueue_send_request(Arc::new(handlers::ServerHandshakeSender));
        Ok(())
    }

    pub fn transport_count(&self) -> usize {
        let transports = self.transports.lock().unwrap();
        transports.iter().filter(|weak| weak.upgrade().is_some()).count()
    }

    /// Stops accepting and closes every live transport.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        logging::info!(self.log, "server shutting down");

        // poke the accept loop out of its blocking accept
        let _ = TcpStream::connect(("127.0.0.1", self.local_addr.port()));

        let transports: Vec<Arc<StreamTransport>> = {
            let mut table = self.transports.lock().unwrap();
            table.drain(..).filter_map(|weak| weak.upgrade()).collect()
        };
        for transport in transports {
            transport.close();
        }

        if let Some(worker) = self.accept_worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ServerContext {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            logging::warn!(self.log, "server context dropped while running");
        }
    }
}
