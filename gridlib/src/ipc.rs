//! Socket transport between grid processes.
//!
//! `Channel` is publish/subscribe: every value published reaches each subscriber connected at
//! that moment. `Service` and `Client` are request/reply. Both speak length-delimited JSON
//! frames stamped with `PROTOCOL_VERSION`.

mod broadcaster;
mod channel;
mod frame;
mod service;
mod subscription;

pub use channel::Channel;
pub use frame::PROTOCOL_VERSION;
pub use service::{Client, Service, ServiceHandle};
pub use subscription::{Callback, Subscription};
