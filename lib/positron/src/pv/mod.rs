//! Server-side channel providers and the shared-state broker.
//!
//! A [`Provider`] resolves channel names to channels; [`StaticProvider`]
//! serves a fixed name-to-PV table and [`SharedPV`](shared::SharedPV) is
//! the broker multiplexing client operations over one cached value.

pub mod fifo;
pub mod shared;

pub use shared::{MailboxHandler, PvConfig, PvHandler, SharedPV};

use crate::data::bitset::BitSet;
use crate::data::request::Request;
use crate::data::status::Status;
use crate::data::value::{Field, PVStructure, Structure};
use crate::net::shared::NetResult;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, Weak};

/// Connectivity events delivered to a channel's creator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelStateEvent {
    Disconnected,
    Destroyed,
}

pub trait ChannelRequester: Send + Sync {
    fn channel_state_change(&self, event: ChannelStateEvent);
}

pub trait GetFieldRequester: Send + Sync {
    fn get_done(&self, status: Status, field: Option<Field>);
}

pub trait PutRequester: Send + Sync {
    fn channel_put_connect(&self, status: Status, requested: Option<Arc<Structure>>);
    fn put_done(&self, status: Status);
    fn get_done(&self, status: Status, value: Option<(PVStructure, BitSet)>);
    fn channel_disconnect(&self, destroyed: bool);
}

pub trait RpcRequester: Send + Sync {
    fn channel_rpc_connect(&self, status: Status);
    fn request_done(&self, status: Status, value: Option<PVStructure>);
    fn channel_disconnect(&self, destroyed: bool);
}

pub trait MonitorRequester: Send + Sync {
    fn monitor_connect(&self, status: Status, requested: Option<Arc<Structure>>);
    /// The monitor queue went non-empty; drain it with `poll`.
    fn monitor_event(&self);
    /// No more updates will ever arrive.
    fn unlisten(&self);
    fn channel_disconnect(&self, destroyed: bool);
}

/// A put-capable operation; also serves reads of the selected sub-value.
pub trait ChannelPut: Send + Sync {
    fn put(&self, value: PVStructure, changed: BitSet);
    fn get(&self);
    fn cancel(&self) {}
    fn destroy(&self);
}

pub trait ChannelRpc: Send + Sync {
    fn request(&self, args: PVStructure);
    fn cancel(&self) {}
    fn destroy(&self);
}

#[derive(Debug, Clone)]
pub struct MonitorElement {
    pub value: PVStructure,
    pub changed: BitSet,
    pub overrun: BitSet,
}

pub trait ChannelMonitor: Send + Sync {
    /// Takes the next queued update, honoring the pipeline window.
    fn poll(&self) -> Option<MonitorElement>;
    /// Client acknowledgement reopening `count` slots of the window.
    fn ack(&self, count: u32);
    fn destroy(&self);
}

/// A channel created by a provider. Operation connect results arrive
/// through the requesters, possibly before the create call returns.
pub trait ProviderChannel: Send + Sync {
    fn name(&self) -> &str;
    fn get_field(&self, requester: Arc<dyn GetFieldRequester>, subfield: &str);
    fn create_put(&self, requester: Arc<dyn PutRequester>, request: Request) -> Arc<dyn ChannelPut>;
    fn create_rpc(&self, requester: Arc<dyn RpcRequester>, request: Request) -> Arc<dyn ChannelRpc>;
    fn create_monitor(
        &self,
        requester: Arc<dyn MonitorRequester>,
        request: Request,
    ) -> NetResult<Arc<dyn ChannelMonitor>>;
    fn destroy(&self);
}

pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn find(&self, channel_name: &str) -> bool;
    fn connect(
        &self,
        channel_name: &str,
        requester: Arc<dyn ChannelRequester>,
    ) -> Option<Arc<dyn ProviderChannel>>;
}

enum OperationKind {
    Put(Weak<dyn PutRequester>),
    Rpc(Weak<dyn RpcRequester>),
}

struct OperationInner {
    value: PVStructure,
    changed: BitSet,
    kind: OperationKind,
    done: Mutex<bool>,
}

/// Handed to a PV handler for every put or RPC. The handler must complete
/// it exactly once; a dropped incomplete operation is completed with an
/// error on the handler's behalf.
pub struct Operation {
    inner: Arc<OperationInner>,
}

impl Operation {
    pub(crate) fn put(value: PVStructure, changed: BitSet, requester: Weak<dyn PutRequester>) -> Operation {
        Operation {
            inner: Arc::new(OperationInner {
                value,
                changed,
                kind: OperationKind::Put(requester),
                done: Mutex::new(false),
            }),
        }
    }

    pub(crate) fn rpc(args: PVStructure, requester: Weak<dyn RpcRequester>) -> Operation {
        Operation {
            inner: Arc::new(OperationInner {
                value: args,
                changed: BitSet::of(0),
                kind: OperationKind::Rpc(requester),
                done: Mutex::new(false),
            }),
        }
    }

    /// The put value (base typed) or the RPC argument structure.
    #[inline]
    pub fn value(&self) -> &PVStructure {
        &self.inner.value
    }

    /// Which base fields the put touches.
    #[inline]
    pub fn changed(&self) -> &BitSet {
        &self.inner.changed
    }

    pub fn complete(self) {
        self.finish(Status::ok(), None);
    }

    pub fn complete_with(self, status: Status) {
        self.finish(status, None);
    }

    /// RPC completion carrying the result value.
    pub fn complete_value(self, status: Status, value: PVStructure) {
        self.finish(status, Some(value));
    }

    fn finish(&self, status: Status, value: Option<PVStructure>) {
        {
            let mut done = self.inner.done.lock().unwrap();
            if *done {
                return;
            }
            *done = true;
        }
        match &self.inner.kind {
            OperationKind::Put(requester) => {
                if let Some(requester) = requester.upgrade() {
                    requester.put_done(status);
                }
            }
            OperationKind::Rpc(requester) => {
                if let Some(requester) = requester.upgrade() {
                    requester.request_done(status, value);
                }
            }
        }
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        self.finish(Status::error("operation dropped without completion"), None);
    }
}

/// A provider serving a fixed table of shared PVs.
pub struct StaticProvider {
    name: String,
    pvs: Mutex<IndexMap<String, Arc<SharedPV>>>,
}

impl StaticProvider {
    pub fn new<N: Into<String>>(name: N) -> Arc<StaticProvider> {
        Arc::new(StaticProvider {
            name: name.into(),
            pvs: Mutex::new(IndexMap::new()),
        })
    }

    pub fn add<N: Into<String>>(&self, channel_name: N, pv: Arc<SharedPV>) {
        let mut pvs = self.pvs.lock().unwrap();
        pvs.insert(channel_name.into(), pv);
    }

    pub fn remove(&self, channel_name: &str) -> Option<Arc<SharedPV>> {
        let mut pvs = self.pvs.lock().unwrap();
        pvs.shift_remove(channel_name)
    }

    pub fn get(&self, channel_name: &str) -> Option<Arc<SharedPV>> {
        let pvs = self.pvs.lock().unwrap();
        pvs.get(channel_name).cloned()
    }

    /// Closes every PV, with `destroy` semantics per `SharedPV::close`.
    pub fn close_all(&self, destroy: bool) {
        let snapshot: Vec<Arc<SharedPV>> = {
            let pvs = self.pvs.lock().unwrap();
            pvs.values().cloned().collect()
        };
        for pv in snapshot {
            pv.close(destroy);
        }
    }
}

impl Provider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn find(&self, channel_name: &str) -> bool {
        let pvs = self.pvs.lock().unwrap();
        pvs.contains_key(channel_name)
    }

    fn connect(
        &self,
        channel_name: &str,
        requester: Arc<dyn ChannelRequester>,
    ) -> Option<Arc<dyn ProviderChannel>> {
        let pv = self.get(channel_name)?;
        Some(pv.connect(channel_name, requester))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::value::{Field, ScalarKind};

    struct NopRequester;
    impl ChannelRequester for NopRequester {
        fn channel_state_change(&self, _event: ChannelStateEvent) {}
    }

    fn int_pv() -> Arc<SharedPV> {
        let pv = SharedPV::build_mailbox(PvConfig::default());
        let t = Structure::new("", vec![("value".to_owned(), Field::Scalar(ScalarKind::Int))]);
        pv.open_value(PVStructure::new_default(t)).unwrap();
        pv
    }

    #[test]
    fn test_static_provider_lookup() {
        let provider = StaticProvider::new("static");
        provider.add("pv1", int_pv());

        assert!(provider.find("pv1"));
        assert!(!provider.find("pv2"));
        assert!(provider.connect("pv1", Arc::new(NopRequester)).is_some());
        assert!(provider.connect("pv2", Arc::new(NopRequester)).is_none());

        assert!(provider.remove("pv1").is_some());
        assert!(!provider.find("pv1"));
    }
}
