use anyhow::Result;
use nix::libc;

/// Raw mode on the local tty for as long as the guard lives.
pub struct TerminalGuard {
    original: Option<nix::sys::termios::Termios>,
}

impl TerminalGuard {
    /// Piped stdin has no settings to save, so raw mode becomes a no-op.
    pub fn new() -> Self {
        let original = nix::sys::termios::tcgetattr(std::io::stdin()).ok();
        Self { original }
    }

    pub fn is_tty(&self) -> bool {
        self.original.is_some()
    }

    pub fn enter_raw_mode(&self) {
        if let Some(ref original) = self.original {
            use nix::sys::termios;
            let mut raw = original.clone();
            termios::cfmakeraw(&mut raw);
            let _ = termios::tcsetattr(std::io::stdin(), termios::SetArg::TCSANOW, &raw);
        }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if let Some(ref original) = self.original {
            use nix::sys::termios;
            let _ = termios::tcsetattr(std::io::stdin(), termios::SetArg::TCSANOW, original);
        }
    }
}

/// (cols, rows) of the terminal on stdout.
pub fn terminal_size() -> Result<(u16, u16)> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let ret = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if ret == -1 || ws.ws_col == 0 || ws.ws_row == 0 {
        anyhow::bail!("ioctl TIOCGWINSZ failed");
    }
    Ok((ws.ws_col, ws.ws_row))
}
