//! Session management: PTY lifecycle, scrollback, attachment, registry.

pub mod pty;
pub mod registry;
pub mod scrollback;
pub mod terminal;

pub use pty::PtyHandle;
pub use registry::{default_shell, SessionInfo, SessionOptions, SessionRegistry};
pub use scrollback::{ScrollbackBuffer, DEFAULT_SCROLLBACK_BYTES};
pub use terminal::{Attached, Outbound, Session};
