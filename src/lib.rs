//! `catch_core`: the library crate backing the `catchd` binary.
//!
//! Components, leaves first: [`catalog`] (A, the catalog store),
//! [`events`] (B, the event bus), [`installer`] (C and D, the file and
//! generation installers), [`registry`] (E, the OCI registry HTTP
//! surface), [`tailnet`] and [`runner`] (the out-of-scope collaborators
//! modeled as narrow traits), [`rpc`] (G, the RPC plane), [`dispatcher`]
//! (H, the TTY exec dispatcher).

pub mod catalog;
pub mod compression;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod installer;
#[cfg(unix)]
pub mod pty;
pub mod registry;
pub mod rpc;
pub mod runner;
pub mod shutdown;
pub mod tailnet;
pub mod volumes;

pub use config::ServerConfig;
pub use errors::{Error, Result};
pub use shutdown::Shutdown;

/// Build information embedded at compile time, surfaced by `version
/// [--json]` and `catch.Info`.
pub struct BuildInfo {
    /// `CARGO_PKG_VERSION` at compile time.
    pub version: &'static str,
    /// The target triple this binary was built for.
    pub target: &'static str,
    /// Build profile (`debug` or `release`).
    pub profile: &'static str,
}

/// The process-wide build info constant.
pub const BUILD_INFO: BuildInfo = BuildInfo {
    version: env!("CARGO_PKG_VERSION"),
    target: env!("TARGET"),
    profile: if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    },
};
