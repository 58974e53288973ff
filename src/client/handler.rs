//! Inbound message handler trait
//!
//! Implement [`MessageHandler`] to receive records from a [`Subscriber`].
//! Plain closures can be adapted with [`handler_fn`].
//!
//! [`Subscriber`]: super::Subscriber

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;

use crate::record::Record;

/// Error type returned by user handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by user handlers
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Callback for records arriving on an inbound endpoint.
///
/// Errors and panics from `on_message` are logged by the listen loop and the
/// next message is delivered as usual.
pub trait MessageHandler: Send + Sync + 'static {
    /// Called once per record, in arrival order.
    ///
    /// `source` is the MQTT topic or the WebSocket URL the record came from.
    fn on_message(&self, source: &str, record: Record) -> impl Future<Output = HandlerResult> + Send;
}

/// Adapter turning a synchronous closure into a [`MessageHandler`]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap a closure as a [`MessageHandler`]
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&str, Record) -> HandlerResult + Send + Sync + 'static,
{
    FnHandler { f }
}

impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&str, Record) -> HandlerResult + Send + Sync + 'static,
{
    async fn on_message(&self, source: &str, record: Record) -> HandlerResult {
        (self.f)(source, record)
    }
}

/// Run a handler future, turning both errors and panics into a message
pub(crate) async fn run_guarded<F>(fut: F) -> std::result::Result<(), String>
where
    F: Future<Output = HandlerResult>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(format!("handler panicked: {}", panic_message(&*panic))),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
