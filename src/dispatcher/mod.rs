//! Local packet dispatcher.
//!
//! One registration table per end host maps `(address, port, protocol)` to a
//! bounded inbox or a control handler. A single task pumps the underlay into
//! [`Dispatcher::dispatch`]; a full inbox drops the packet for that target
//! only.

#[allow(clippy::module_inception)]
mod dispatcher;
mod table;

pub use dispatcher::{
    Binding, ControlHandler, Delivery, DispatchOutcome, DispatchStats, Dispatcher,
    LoggingControlHandler,
};
pub use table::{BindKey, DeliveryTarget};
