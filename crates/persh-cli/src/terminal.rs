//! Terminal utilities for raw mode and terminal size.

use anyhow::{Context, Result};
use crossterm::terminal;

/// RAII guard that restores cooked mode on drop.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    /// Enter raw terminal mode.
    pub fn enter() -> Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Get the current terminal size as (columns, rows).
///
/// Falls back to (80, 24) if the size cannot be determined or is zero.
pub fn get_terminal_size() -> (u16, u16) {
    match terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => (cols, rows),
        _ => (80, 24),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_size_returns_nonzero() {
        let (cols, rows) = get_terminal_size();
        // Under CI or a pipe this is the fallback.
        assert!(cols > 0);
        assert!(rows > 0);
    }
}
