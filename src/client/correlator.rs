//! Correlates responses to outstanding requests by `command_id`.
//!
//! Two maps under one mutex: sync waiters (rendezvous senders the calling
//! thread blocks on) and async continuations. A command id lives in at
//! most one of them, because ids are allocated once and registered once.
//! Continuations are always invoked after the mutex is released.

use std::collections::HashMap;
use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::trace::debug;
use crate::wire::message::ResponseMessage;

/// A one-shot response consumer registered for an async request.
pub(crate) type Continuation = Box<dyn FnOnce(&ResponseMessage) + Send>;

enum Waiter {
    Sync(Sender<ResponseMessage>),
    Async(Continuation),
}

#[derive(Default)]
struct Maps {
    sync: HashMap<u64, Sender<ResponseMessage>>,
    continuations: HashMap<u64, Continuation>,
}

pub(crate) struct Correlator {
    maps: Mutex<Maps>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self {
            maps: Mutex::new(Maps::default()),
        }
    }

    /// Registers a sync waiter for `command_id` and returns the receiving
    /// end the caller blocks on.
    pub(crate) fn register_sync(&self, command_id: u64) -> Receiver<ResponseMessage> {
        let (sender, receiver) = bounded(1);
        self.maps
            .lock()
            .expect("correlator poisoned")
            .sync
            .insert(command_id, sender);
        receiver
    }

    /// Registers an async continuation for `command_id`.
    pub(crate) fn register_async(&self, command_id: u64, continuation: Continuation) {
        self.maps
            .lock()
            .expect("correlator poisoned")
            .continuations
            .insert(command_id, continuation);
    }

    /// Removes whatever was registered for `command_id` (send failed
    /// before the request ever left).
    pub(crate) fn forget(&self, command_id: u64) {
        let mut maps = self.maps.lock().expect("correlator poisoned");
        maps.sync.remove(&command_id);
        maps.continuations.remove(&command_id);
    }

    /// Number of requests still waiting for a response.
    pub(crate) fn outstanding(&self) -> usize {
        let maps = self.maps.lock().expect("correlator poisoned");
        maps.sync.len() + maps.continuations.len()
    }

    /// Routes a response to its waiter. Sync waiters are tried first.
    /// Returns false when no waiter is registered for the id.
    pub(crate) fn deliver(&self, response: ResponseMessage) -> bool {
        let waiter = {
            let mut maps = self.maps.lock().expect("correlator poisoned");
            if let Some(sender) = maps.sync.remove(&response.command_id) {
                Some(Waiter::Sync(sender))
            } else {
                maps.continuations
                    .remove(&response.command_id)
                    .map(Waiter::Async)
            }
        };
        match waiter {
            Some(Waiter::Sync(sender)) => {
                // The caller may have given up; that is not an error here.
                if sender.send(response).is_err() {
                    debug!("sync waiter went away before delivery");
                }
                true
            }
            Some(Waiter::Async(continuation)) => {
                continuation(&response);
                true
            }
            None => false,
        }
    }

    /// Fails every outstanding request with `error_message`, delivering
    /// outside the lock.
    pub(crate) fn fail_all(&self, error_message: &str) {
        let (senders, continuations) = {
            let mut maps = self.maps.lock().expect("correlator poisoned");
            (
                std::mem::take(&mut maps.sync),
                std::mem::take(&mut maps.continuations),
            )
        };
        for (command_id, sender) in senders {
            let _ = sender.send(ResponseMessage::failed(command_id, error_message));
        }
        for (command_id, continuation) in continuations {
            continuation(&ResponseMessage::failed(command_id, error_message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn sync_delivery_reaches_the_waiter() {
        let correlator = Correlator::new();
        let waiter = correlator.register_sync(1);

        assert!(correlator.deliver(ResponseMessage::ok(1)));
        assert!(waiter.recv().unwrap().success);
        assert_eq!(correlator.outstanding(), 0);
    }

    #[test]
    fn async_delivery_invokes_the_continuation_once() {
        let correlator = Correlator::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_in_cb = Arc::clone(&hits);
        correlator.register_async(
            2,
            Box::new(move |response| {
                assert_eq!(response.command_id, 2);
                hits_in_cb.fetch_add(1, Ordering::Relaxed);
            }),
        );

        assert!(correlator.deliver(ResponseMessage::ok(2)));
        assert!(!correlator.deliver(ResponseMessage::ok(2)));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unknown_ids_are_reported() {
        let correlator = Correlator::new();
        assert!(!correlator.deliver(ResponseMessage::ok(99)));
    }

    #[test]
    fn waiter_maps_are_disjoint_by_id() {
        let correlator = Correlator::new();
        let waiter = correlator.register_sync(3);
        correlator.register_async(4, Box::new(|_| {}));
        assert_eq!(correlator.outstanding(), 2);

        // Delivery for 3 must hit the sync waiter, not the continuation.
        assert!(correlator.deliver(ResponseMessage::ok(3)));
        assert!(waiter.try_recv().is_ok());
        assert_eq!(correlator.outstanding(), 1);
    }

    #[test]
    fn fail_all_reaches_both_kinds() {
        let correlator = Correlator::new();
        let waiter = correlator.register_sync(5);
        let failed = Arc::new(AtomicU32::new(0));
        let failed_in_cb = Arc::clone(&failed);
        correlator.register_async(
            6,
            Box::new(move |response| {
                assert!(!response.success);
                assert_eq!(response.error_text(), "Connection reset during operation");
                failed_in_cb.fetch_add(1, Ordering::Relaxed);
            }),
        );

        correlator.fail_all("Connection reset during operation");

        let response = waiter.recv().unwrap();
        assert!(!response.success);
        assert_eq!(response.error_text(), "Connection reset during operation");
        assert_eq!(failed.load(Ordering::Relaxed), 1);
        assert_eq!(correlator.outstanding(), 0);
    }

    #[test]
    fn forget_clears_a_registration() {
        let correlator = Correlator::new();
        let _waiter = correlator.register_sync(7);
        correlator.forget(7);
        assert_eq!(correlator.outstanding(), 0);
        assert!(!correlator.deliver(ResponseMessage::ok(7)));
    }
}
