//! Authentication handshake plumbing. Only the envelope is defined here:
//! plugins exchange opaque structures over AUTHNZ messages until one side
//! completes the session. The stock `anonymous` plugin completes
//! immediately and is the fallback both ends agree on.

use crate::data::status::Status;
use crate::data::value::PVStructure;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Peer network address in display form.
    pub peer: String,
    /// Authority (plugin) name the session runs under.
    pub authority: String,
    /// Protocol revision the peer speaks.
    pub transport_revision: u8,
}

/// Outcome of feeding a message (or session start) to a plugin session.
pub enum AuthOutcome {
    /// Exchange continues; optionally send this payload to the peer.
    Continue(Option<PVStructure>),
    /// Exchange finished with the given verdict.
    Done(Status),
}

pub trait AuthenticationSession: Send {
    /// Data the client sends along with its CONNECTION_VALIDATION reply.
    fn initialization_data(&self) -> Option<PVStructure> {
        None
    }

    /// Called once when the session is installed.
    fn begin(&mut self) -> AuthOutcome;

    /// Called for every AUTHNZ message received from the peer.
    fn message_received(&mut self, data: Option<PVStructure>) -> AuthOutcome;
}

pub trait AuthenticationPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this plugin will talk to the given peer at all.
    fn is_valid_for(&self, _peer: &PeerInfo) -> bool {
        true
    }

    fn create_session(&self, peer: &PeerInfo, init: Option<PVStructure>) -> Box<dyn AuthenticationSession>;
}

pub const ANONYMOUS: &str = "anonymous";

/// The no-op plugin: no data, immediate success.
pub struct AnonymousPlugin;

struct AnonymousSession;

impl AuthenticationSession for AnonymousSession {
    fn begin(&mut self) -> AuthOutcome {
        AuthOutcome::Done(Status::ok())
    }

    fn message_received(&mut self, _data: Option<PVStructure>) -> AuthOutcome {
        AuthOutcome::Done(Status::ok())
    }
}

impl AuthenticationPlugin for AnonymousPlugin {
    fn name(&self) -> &str {
        ANONYMOUS
    }

    fn create_session(&self, _peer: &PeerInfo, _init: Option<PVStructure>) -> Box<dyn AuthenticationSession> {
        Box::new(AnonymousSession)
    }
}

/// Process-wide plugin registry; plugins are registered during startup and
/// only unregistered at process shutdown. Client and server sides keep
/// separate tables.
pub struct AuthenticationRegistry {
    plugins: Mutex<HashMap<String, Arc<dyn AuthenticationPlugin>>>,
}

impl AuthenticationRegistry {
    fn new() -> AuthenticationRegistry {
        let registry = AuthenticationRegistry {
            plugins: Mutex::new(HashMap::new()),
        };
        registry.register(Arc::new(AnonymousPlugin));
        registry
    }

    pub fn register(&self, plugin: Arc<dyn AuthenticationPlugin>) {
        let mut plugins = self.plugins.lock().unwrap();
        plugins.insert(plugin.name().to_owned(), plugin);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn AuthenticationPlugin>> {
        let plugins = self.plugins.lock().unwrap();
        plugins.get(name).cloned()
    }

    /// Plugin names valid for `peer`, for advertisement in the handshake.
    pub fn names_for(&self, peer: &PeerInfo) -> Vec<String> {
        let plugins = self.plugins.lock().unwrap();
        let mut names: Vec<String> = plugins
            .values()
            .filter(|plugin| plugin.is_valid_for(peer))
            .map(|plugin| plugin.name().to_owned())
            .collect();
        names.sort();
        names
    }

    pub fn clients() -> &'static AuthenticationRegistry {
        &CLIENT_REGISTRY
    }

    pub fn servers() -> &'static AuthenticationRegistry {
        &SERVER_REGISTRY
    }
}

lazy_static! {
    static ref CLIENT_REGISTRY: AuthenticationRegistry = AuthenticationRegistry::new();
    static ref SERVER_REGISTRY: AuthenticationRegistry = AuthenticationRegistry::new();
}

/// Client-side plugin selection: the server's offered order is a
/// preference list with the last entry most preferred. Unknown names are
/// skipped; no usable offer falls back to `anonymous`.
pub fn select_client_plugin(offered: &[String]) -> (String, Arc<dyn AuthenticationPlugin>) {
    let registry = AuthenticationRegistry::clients();
    for name in offered.iter().rev() {
        if let Some(plugin) = registry.lookup(name) {
            return (name.clone(), plugin);
        }
    }
    let plugin = registry.lookup(ANONYMOUS).expect("anonymous plugin must exist");
    (ANONYMOUS.to_owned(), plugin)
}
