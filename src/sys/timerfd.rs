use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

/// Smallest delay the timer is ever armed with. `timerfd_settime` treats an
/// all-zero `it_value` as "disarm", so a due-now deadline must still be a
/// little in the future.
const MIN_DELAY: Duration = Duration::from_micros(100);

/// One-shot kernel timer backed by `timerfd`.
///
/// The timer wheel re-arms this for its earliest deadline after every
/// mutation; repeating timers are handled by the wheel, not the kernel.
#[derive(Debug)]
pub(crate) struct TimerFd {
    fd: File,
}

impl TimerFd {
    pub(crate) fn new() -> io::Result<TimerFd> {
        let flags = libc::TFD_CLOEXEC | libc::TFD_NONBLOCK;
        let fd = syscall!(timerfd_create(libc::CLOCK_MONOTONIC, flags))?;

        let file = unsafe { File::from_raw_fd(fd) };
        Ok(TimerFd { fd: file })
    }

    /// Arms the timer to fire once, `delay` from now. Delays below the 100 µs
    /// floor (including zero, from deadlines already due) are clamped up.
    pub(crate) fn set(&self, delay: Duration) -> io::Result<()> {
        let delay = delay.max(MIN_DELAY);
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: libc::c_long::from(delay.subsec_nanos()),
            },
        };
        syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            0,
            &spec,
            std::ptr::null_mut()
        ))
        .map(|_| ())
    }

    pub(crate) fn disarm(&self) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        };
        syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            0,
            &spec,
            std::ptr::null_mut()
        ))
        .map(|_| ())
    }

    /// Consumes the expiration count so a level-triggered selector stops
    /// reporting the descriptor as readable.
    #[allow(clippy::unused_io_amount)] // The count itself is unused.
    pub(crate) fn ack(&self) -> io::Result<()> {
        let mut buf = [0u8; 8];
        match (&self.fd).read(&mut buf) {
            Ok(_) => Ok(()),
            // A spurious wakeup before the expiration was written.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
