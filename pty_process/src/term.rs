// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.
use nix::libc::{winsize, TIOCGWINSZ, TIOCSWINSZ, VMIN, VTIME};
use nix::sys::termios::{
    tcgetattr, tcsetattr, InputFlags, LocalFlags, OutputFlags, SetArg, Termios,
};
use std::os::fd::{AsRawFd, BorrowedFd};

nix::ioctl_read_bad!(tiocgwinsz, TIOCGWINSZ, winsize);
nix::ioctl_write_ptr_bad!(tiocswinsz, TIOCSWINSZ, winsize);

pub fn get_winsize(fd: BorrowedFd<'_>) -> std::io::Result<winsize> {
    let mut size = winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe { tiocgwinsz(fd.as_raw_fd(), &mut size) }?;
    Ok(size)
}

pub fn set_winsize(fd: BorrowedFd<'_>, size: &winsize) -> std::io::Result<()> {
    unsafe { tiocswinsz(fd.as_raw_fd(), size) }?;
    Ok(())
}

/// Put the terminal behind `fd` in raw mode: no line buffering, no signal generation and no
/// echo, so that every key (including ctrl-c) reaches the other end. Returns the previous state
/// to be handed back to [`restore`].
pub fn enable_raw(fd: BorrowedFd<'_>) -> nix::Result<Termios> {
    let orig = tcgetattr(fd)?;
    let mut tio = orig.clone();

    tio.input_flags |= InputFlags::IGNPAR;
    tio.input_flags &= !(InputFlags::ISTRIP
        | InputFlags::INLCR
        | InputFlags::IGNCR
        | InputFlags::ICRNL
        | InputFlags::IXON
        | InputFlags::IXANY
        | InputFlags::IXOFF);

    tio.local_flags &= !(LocalFlags::ISIG
        | LocalFlags::ICANON
        | LocalFlags::ECHO
        | LocalFlags::ECHOE
        | LocalFlags::ECHOK
        | LocalFlags::ECHONL
        | LocalFlags::IEXTEN);

    tio.output_flags &= !OutputFlags::OPOST;

    // send every character as soon as they arrive
    tio.control_chars[VMIN] = 1;
    tio.control_chars[VTIME] = 0;

    tcsetattr(fd, SetArg::TCSADRAIN, &tio)?;
    Ok(orig)
}

pub fn restore(fd: BorrowedFd<'_>, state: &Termios) -> nix::Result<()> {
    tcsetattr(fd, SetArg::TCSAFLUSH, state)
}

pub fn disable_echo(fd: BorrowedFd<'_>) -> std::io::Result<()> {
    let mut tio = tcgetattr(fd)?;
    tio.local_flags &= !LocalFlags::ECHO;
    tcsetattr(fd, SetArg::TCSANOW, &tio)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open_pty;
    use std::os::fd::AsFd;

    #[test]
    fn test_raw_and_restore() {
        let pty = open_pty().unwrap();
        let fd = pty.replica.as_fd();
        let orig = enable_raw(fd).unwrap();
        let raw = tcgetattr(fd).unwrap();
        assert!(!raw.local_flags.contains(LocalFlags::ICANON));
        assert!(!raw.local_flags.contains(LocalFlags::ISIG));
        restore(fd, &orig).unwrap();
        let restored = tcgetattr(fd).unwrap();
        assert_eq!(restored.local_flags, orig.local_flags);
    }

    #[test]
    fn test_disable_echo() {
        let pty = open_pty().unwrap();
        disable_echo(pty.primary.as_fd()).unwrap();
        let tio = tcgetattr(pty.replica.as_fd()).unwrap();
        assert!(!tio.local_flags.contains(LocalFlags::ECHO));
    }
}
