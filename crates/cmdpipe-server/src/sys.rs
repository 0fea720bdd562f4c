//! Thin epoll and eventfd wrappers.

use std::os::unix::io::RawFd;

use cmdpipe_core::error::{PipeError, Result};

#[inline]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// An epoll instance. Closed on drop.
pub(crate) struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(PipeError::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn add(&self, fd: RawFd, events: u32, token: u64) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, token)
    }

    pub fn modify(&self, fd: RawFd, events: u32, token: u64) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)
    }

    pub fn delete(&self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    fn ctl(&self, op: i32, fd: RawFd, events: u32, token: u64) -> Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        let ret = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(PipeError::last_os_error());
        }
        Ok(())
    }

    /// Wait up to `timeout_ms`. An interrupted wait reports no events.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> Result<usize> {
        let ret = unsafe {
            libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
        };
        if ret < 0 {
            let e = errno();
            if e == libc::EINTR {
                return Ok(0);
            }
            return Err(PipeError::Os(e));
        }
        Ok(ret as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd); }
            self.fd = -1;
        }
    }
}

/// Non-blocking eventfd used to interrupt an event loop's `epoll_wait`.
///
/// Several `notify()` calls before the loop reads collapse into one wakeup.
pub(crate) struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(PipeError::last_os_error());
        }
        Ok(Self { fd })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let e = errno();
            // counter saturated, a wakeup is already pending
            if e == libc::EAGAIN {
                return Ok(());
            }
            return Err(PipeError::WakeFailed(e));
        }
        Ok(())
    }

    /// Reset the counter. Returns how many notifications were pending.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 { 0 } else { val }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd); }
            self.fd = -1;
        }
    }
}
