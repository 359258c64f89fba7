//! Process-level plumbing shared by client and server: a timer thread for
//! periodic callbacks and a conveyor thread that decouples completion
//! callbacks from the transport workers.

pub mod conveyor;
pub mod timer;
