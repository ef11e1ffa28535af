//! persh-core: shared library for persistent remote terminal sessions.
//!
//! Provides the JSON control frames of the attachment protocol, the error
//! type, and the shell environment customizer used to launch session shells.

pub mod error;
pub mod messages;
pub mod shell_env;

// Re-export commonly used items at crate root.
pub use error::{PershError, PershResult};
pub use messages::{exit_notice, ClientControl, ServerControl};
pub use shell_env::{EnvironmentCustomizer, LaunchSpec, RcCustomizer, ShellRequest};
