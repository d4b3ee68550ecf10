/// Associates readiness events with the handler that registered for them.
///
/// `Token` is a wrapper around `usize`. Every channel registered with a
/// [`Poller`] carries a token; when the poller reports readiness it hands the
/// token back so the event loop can find the matching handler.
///
/// Tokens are allocated by the owning [`EventLoop`]; the loop reserves a small
/// number of low values for its own plumbing (waker, timer).
///
/// [`Poller`]: crate::Poller
/// [`EventLoop`]: crate::EventLoop
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
