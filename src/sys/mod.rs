//! Linux syscall layer.
//!
//! Everything that talks to the kernel directly lives here: the epoll
//! selector, the eventfd waker, the timerfd used by the timer wheel and the
//! socket helpers. All raw libc calls go through the `syscall!` macro so that
//! failures surface as `io::Error`.

pub(crate) mod epoll;
pub(crate) mod eventfd;
pub(crate) mod net;
pub(crate) mod timerfd;
