//! Native boundary between a host engine and plughost.
//!
//! Built as a `cdylib` the host links against. The host calls
//! [`ffi::plughost_initialize_from_host`] once, then drives project and
//! tooling modules through the [`ffi::PluginsCallbacks`] table it gets
//! back. Rust embedders can install their own collaborators first with
//! [`install_services`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod ffi;
pub mod host;
pub mod services;

pub use bridge::{NativeBridge, ProjectContextSlot};
pub use config::{BridgeConfig, CONFIG_ENV, DEFAULT_TOOLING_ENTRY};
pub use error::{BridgeError, Result};
pub use ffi::{PluginsCallbacks, install_services};
pub use host::HostModule;
pub use services::{
    BridgeServices, HostCallbacks, LoggingScriptLookup, ManagedCallbacks, ScriptLookup,
};
