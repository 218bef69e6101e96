//! Fault containment at collaborator boundaries
//!
//! Bridge, interface and routing-engine collaborators may fail by returning
//! an error or by panicking. [`contain`] catches both so the adapters can
//! normalize them into one typed error before anything reaches the session
//! state machine.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;

/// A failed collaborator call
#[derive(Debug)]
pub enum Fault<E> {
    /// The call returned an error
    Error(E),
    /// The call panicked
    Panic(String),
}

impl<E: fmt::Display> fmt::Display for Fault<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Error(e) => write!(f, "{}", e),
            Fault::Panic(message) => write!(f, "collaborator panicked: {}", message),
        }
    }
}

/// Run a collaborator call, catching any panic it raises
pub async fn contain<T, E, F>(fut: F) -> std::result::Result<T, Fault<E>>
where
    F: Future<Output = std::result::Result<T, E>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Fault::Error(e)),
        Err(panic) => Err(Fault::Panic(panic_message(&*panic).to_string())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown fault"
    }
}
