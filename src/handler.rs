use std::sync::Arc;

use crate::event::Event;
use crate::event_loop::EventLoop;

/// Receives readiness dispatch from an [`EventLoop`].
///
/// A handler is registered under the token of the channel it services. The
/// loop clones the `Arc` before dispatching, so the handler is kept alive for
/// the duration of the call even if it deregisters itself while handling the
/// event (the close path does exactly that).
///
/// [`EventLoop`]: crate::EventLoop
pub trait EventHandler {
    /// Called on the owning loop thread with the readiness event.
    fn ready(self: Arc<Self>, lp: &EventLoop, event: &Event);
}
