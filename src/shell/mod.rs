//! Shell process management.
//!
//! - [`resolve_shell`] picks the shell binary for new sessions.
//! - [`pty`] allocates a pseudo-terminal and runs the shell on it.
//! - [`adapter`] wraps a spawned terminal in the lifecycle contract the
//!   session router relies on (spawn once, kill once, typed events).

use std::path::{Path, PathBuf};

use tracing::debug;

pub mod adapter;
pub mod pty;

/// Conventional shell locations, probed in order. The last entry is the
/// guaranteed fallback and is returned even if it cannot be found.
const FALLBACK_SHELLS: &[&str] = &[
    "/bin/bash",
    "/usr/bin/bash",
    "/bin/zsh",
    "/usr/bin/zsh",
    "/bin/ash",
    "/bin/dash",
    "/bin/sh",
];

/// Resolve the shell to run for a new session.
///
/// An explicitly configured shell always wins. Otherwise the login shell from
/// the user database entry of the current user is used if it exists on disk,
/// then the first existing entry of [`FALLBACK_SHELLS`]. Never fails.
pub fn resolve_shell(configured: Option<&str>) -> String {
    if let Some(shell) = configured {
        return shell.to_string();
    }
    select_shell(login_shell(), |p| p.exists())
}

fn login_shell() -> Option<PathBuf> {
    match nix::unistd::User::from_uid(nix::unistd::getuid()) {
        Ok(Some(user)) => Some(user.shell),
        Ok(None) => {
            debug!("No user database entry for current uid");
            None
        }
        Err(e) => {
            debug!("User database lookup failed: {e}");
            None
        }
    }
}

fn select_shell(login: Option<PathBuf>, exists: impl Fn(&Path) -> bool) -> String {
    if let Some(shell) = login.filter(|p| !p.as_os_str().is_empty() && exists(p)) {
        return shell.to_string_lossy().into_owned();
    }
    FALLBACK_SHELLS
        .iter()
        .find(|p| exists(Path::new(p)))
        .unwrap_or(&"/bin/sh")
        .to_string()
}
