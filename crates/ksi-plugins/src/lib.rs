//! KSI Plugins - Typed handler registry and live API discovery.
//!
//! The original daemon collected handlers with runtime marker attributes;
//! here the registry is built at init time from a well-defined plugin
//! interface:
//!
//! - [`KsiPlugin`] — lifecycle methods plus a list of handler
//!   registrations
//! - [`HandlerSpec`] — builder-declared parameter metadata, the source of
//!   truth for the discovery service
//! - [`PluginRegistry`] — loads plugins, binds their handlers into the
//!   event router, and supports reload from factories
//! - [`DiscoveryPlugin`] — `system:discover`, `system:help`,
//!   `module:list`, `module:list_events`, `plugin:reload`
//!
//! First-non-nil-wins dispatch is preserved as the router's iteration
//! policy; plugins simply return `None` for events they do not claim.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod discovery;
mod error;
mod plugin;
mod registry;
mod spec;

pub use discovery::DiscoveryPlugin;
pub use error::{RegistryError, RegistryResult};
pub use plugin::{KsiPlugin, PluginContext};
pub use registry::{PluginFactory, PluginInfo, PluginRegistry};
pub use spec::{HandlerRegistration, HandlerSpec, Param, ParamType};
