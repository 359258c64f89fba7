//! Channel-oriented network protocol for publishing, reading, writing,
//! monitoring and invoking RPCs against strongly-typed structured values
//! identified by name. Peers hold reliable stream connections over which
//! typed operations are multiplexed; the server side can publish values
//! through the shared-state broker in [`pv`].

pub mod client;
pub mod data;
pub mod net;
pub mod pv;
pub mod server;
pub mod util;

pub mod prelude {
    pub use crate::data::bitset::BitSet;
    pub use crate::data::request::Request;
    pub use crate::data::status::Status;
    pub use crate::data::value::{Field, PVField, PVStructure, ScalarKind, Structure};
    pub use crate::net::shared::{NetError, NetResult};
    pub use crate::pv::{SharedPV, StaticProvider};
}
