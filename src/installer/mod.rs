//! Components C and D: File Installer and Generation Installer, plus the
//! shared building blocks (kind detection, network configuration, cron
//! conversion, rate estimation, compose-file manipulation, env-file
//! editing) they're built from.

pub mod compose_file;
pub mod cron;
pub mod env_file;
pub mod errors;
pub mod file_installer;
pub mod generation;
pub mod kind;
pub mod network;
pub mod rate;

pub use errors::InstallerError;
pub use file_installer::{FileInstaller, FileInstallerCfg};
pub use generation::GenerationInstaller;
