//! Pseudo-terminal allocation and resize.
//!
//! A [`PtyPair`] is created lazily when a channel asks for a terminal,
//! resized in place on window-change requests, and released exactly
//! once when the pair is dropped. All operations are synchronous and
//! may fail; failures are reported to the caller and are never fatal to
//! the channel.

use std::os::fd::{AsRawFd, OwnedFd};

use {
    nix::pty::{OpenptyResult, Winsize, openpty},
    thiserror::Error,
};

/// Terminal geometry carried by `pty-req` and `window-change`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PtyGeometry {
    pub cols: u32,
    pub rows: u32,
    pub pix_width: u32,
    pub pix_height: u32,
}

impl PtyGeometry {
    fn winsize(&self) -> Winsize {
        Winsize {
            ws_row: self.rows as u16,
            ws_col: self.cols as u16,
            ws_xpixel: self.pix_width as u16,
            ws_ypixel: self.pix_height as u16,
        }
    }
}

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("openpty: {0}")]
    Open(#[source] nix::Error),
    #[error("set window size: {0}")]
    Resize(#[source] nix::Error),
}

nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);

/// A connected controlling/peripheral descriptor pair.
///
/// Dropping the pair closes both descriptors. Duplicates handed to the
/// exec bridge share the open device, so a blocked read on the
/// controlling side wakes with EIO once the last peripheral descriptor
/// is gone.
pub struct PtyPair {
    master: OwnedFd,
    peripheral: OwnedFd,
}

impl PtyPair {
    /// Open a new pair with the given initial geometry.
    pub fn open(geometry: PtyGeometry) -> Result<Self, PtyError> {
        let ws = geometry.winsize();
        let OpenptyResult { master, slave } =
            openpty(Some(&ws), None::<&nix::sys::termios::Termios>).map_err(PtyError::Open)?;
        Ok(Self {
            master,
            peripheral: slave,
        })
    }

    /// Apply new geometry to the controlling side.
    pub fn resize(&self, geometry: PtyGeometry) -> Result<(), PtyError> {
        let ws = geometry.winsize();
        // SAFETY: the fd is owned by self and the winsize pointer lives
        // across the call only.
        unsafe { tiocswinsz(self.master.as_raw_fd(), &ws) }
            .map(|_| ())
            .map_err(PtyError::Resize)
    }

    /// Duplicate the controlling side for an I/O pump.
    pub fn dup_master(&self) -> std::io::Result<OwnedFd> {
        self.master.try_clone()
    }

    /// Duplicate the peripheral side for child stdio or diagnostics.
    pub fn dup_peripheral(&self) -> std::io::Result<OwnedFd> {
        self.peripheral.try_clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_applies_geometry_and_resizes() {
        let pair = PtyPair::open(PtyGeometry {
            cols: 80,
            rows: 24,
            ..Default::default()
        })
        .unwrap();
        pair.resize(PtyGeometry {
            cols: 132,
            rows: 43,
            ..Default::default()
        })
        .unwrap();
    }

    #[test]
    fn duplicates_are_independent_descriptors() {
        let pair = PtyPair::open(PtyGeometry::default()).unwrap();
        let a = pair.dup_master().unwrap();
        let b = pair.dup_peripheral().unwrap();
        assert_ne!(a.as_raw_fd(), b.as_raw_fd());
        drop(a);
        drop(b);
        // The original pair is still usable after the clones are gone.
        pair.resize(PtyGeometry {
            cols: 10,
            rows: 5,
            ..Default::default()
        })
        .unwrap();
    }
}
