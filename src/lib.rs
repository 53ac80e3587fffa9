//! relma manages executables installed from GitHub Releases.
//!
//! State lives under one root directory: `releases.json` records what is
//! installed and `bin/` holds the installed files. The [`lifecycle::App`]
//! engine keeps the two consistent across install, update, upgrade and
//! uninstall.
//!
//! Concurrent relma processes against the same root are not coordinated.

pub mod config;
pub mod download;
pub mod error;
pub mod github;
pub mod install;
pub mod lifecycle;
pub mod manifest;
pub mod reference;
pub mod types;

pub use error::{RelmaError, RemoteError, Result};
pub use lifecycle::{App, Operation, Outcome, Scope};
