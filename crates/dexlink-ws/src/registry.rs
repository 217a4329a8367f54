//! Outstanding-request tracking.
//!
//! Each sent request registers a handler keyed by its id. A handler
//! leaves the registry in exactly one of three ways: the matching
//! response arrives (the callback runs), the expiry fires (the abort
//! runs), or the sender discards it after a failed write (neither runs).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dexlink_msg::Message;
use parking_lot::Mutex;
use tokio::task::AbortHandle;

/// Callback run with the matched response message.
pub type ResponseFn = Box<dyn FnOnce(Message) + Send + 'static>;

/// Callback run when a request expires, or is aborted at shutdown.
pub type ExpireFn = Box<dyn FnOnce() + Send + 'static>;

/// Handler awaiting the response to an outstanding request.
pub(crate) struct ResponseHandler {
    /// Completion callback.
    pub(crate) f: ResponseFn,
    /// Runs at most once, and never if `f` ran.
    pub(crate) abort: ExpireFn,
    /// One-shot expiry task, cancelled when the entry is taken.
    expiration: AbortHandle,
}

/// Thread-safe registry of outstanding requests.
///
/// The response path and the expiry both remove-and-return under the
/// lock; whichever acquires first takes the entry and the loser finds
/// nothing.
#[derive(Default)]
pub(crate) struct RequestRegistry {
    handlers: Arc<Mutex<HashMap<u64, ResponseHandler>>>,
}

impl RequestRegistry {
    /// Insert a handler for `id` and arm its expiry. The expiry runs the
    /// abort callback only if the entry is still registered when it
    /// fires.
    pub(crate) fn register(&self, id: u64, f: ResponseFn, expire_in: Duration, abort: ExpireFn) {
        let mut handlers = self.handlers.lock();
        let map = Arc::clone(&self.handlers);
        // The lock is held until the entry is inserted, so the expiry
        // cannot observe the map before registration completes.
        let expiration = tokio::spawn(async move {
            tokio::time::sleep(expire_in).await;
            let expired = map.lock().remove(&id);
            if let Some(handler) = expired {
                (handler.abort)();
            }
        })
        .abort_handle();
        handlers.insert(id, ResponseHandler { f, abort, expiration });
    }

    /// Remove and return the handler for `id`, stopping its expiry.
    pub(crate) fn take(&self, id: u64) -> Option<ResponseHandler> {
        let handler = self.handlers.lock().remove(&id);
        if let Some(handler) = &handler {
            handler.expiration.abort();
        }
        handler
    }

    /// Remove every handler and run its abort, so no request caller is
    /// left waiting after shutdown.
    pub(crate) fn drain(&self) {
        let drained: Vec<ResponseHandler> = {
            let mut handlers = self.handlers.lock();
            handlers.drain().map(|(_, handler)| handler).collect()
        };
        for handler in drained {
            handler.expiration.abort();
            (handler.abort)();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.handlers.lock().len()
    }
}
