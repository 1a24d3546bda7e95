//! # SbwRun
//!
//! The broker and the module runtime of the SBW module network.
//!
//! ## Architecture
//!
//! - `transport`, `tcp`, `channel`: framed byte channels.
//! - `peer`: call-id correlation and the receive pump over one transport.
//! - `broker`, `registry`, `launcher`: the central process that authenticates modules,
//!   routes calls and starts managed modules on demand.
//! - `module`: the per-process facade for offering and calling services.
//! - `listener`: local observers of lifecycle events.
//! - `config`: broker and module settings.

pub mod broker;
pub mod channel;
pub mod config;
pub mod launcher;
pub mod listener;
pub mod module;
pub mod peer;
pub mod registry;
mod system;
pub mod tcp;
pub mod transport;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use config::ModuleConfig;
pub use listener::Listener;
pub use listener::ListenerId;
pub use module::MethodHandle;
pub use module::Module;
pub use module::ModuleHandle;
pub use module::ServiceHandle;
pub use module::ServiceObject;
pub use module::ServiceSummary;

#[cfg(test)]
mod tests;
