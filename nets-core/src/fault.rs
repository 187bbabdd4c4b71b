//! Panic isolation for handler callbacks.
//!
//! Application callbacks run inside a fault boundary: a panic is caught,
//! logged and converted into [`NetError::HandlerFault`] so the connection or
//! service that invoked it can shut down in an orderly way.

use crate::error::NetError;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Runs `fut`, converting a panic into [`NetError::HandlerFault`].
pub async fn catch_fault<F: Future>(fut: F) -> Result<F::Output, NetError> {
    AssertUnwindSafe(fut).catch_unwind().await.map_err(|payload| {
        let message = panic_message(payload.as_ref());
        tracing::error!("Handler panicked: {}", message);
        NetError::HandlerFault(message)
    })
}

/// Runs a fallible callback, merging a panic into its error channel.
pub async fn guard_callback<F>(fut: F) -> Result<(), NetError>
where
    F: Future<Output = Result<(), NetError>>,
{
    catch_fault(fut).await.and_then(|result| result)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
