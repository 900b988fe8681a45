//
// signal.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use std::sync::Mutex;

/// A minimal multi-subscriber signal.
///
/// Each subscriber gets an unbounded channel; `emit` clones the value into
/// every live channel and silently drops subscribers whose receiver has been
/// dropped. Emission never blocks.
pub struct Signal<T> {
    subscribers: Mutex<Vec<async_channel::Sender<T>>>,
}

impl<T: Clone> Signal<T> {
    pub fn new() -> Self {
        Signal {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to the signal. Values emitted after this call are delivered
    /// to the returned receiver.
    pub fn connect(&self) -> async_channel::Receiver<T> {
        let (tx, rx) = async_channel::unbounded();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Emit a value to all live subscribers.
    pub fn emit(&self, value: T) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.try_send(value.clone()).is_ok());
    }

    /// Drop all subscribers.
    pub fn clear(&self) {
        self.subscribers.lock().unwrap().clear();
    }
}

impl<T: Clone> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_all_subscribers() {
        let signal = Signal::new();
        let a = signal.connect();
        let b = signal.connect();
        signal.emit(7);
        assert_eq!(a.try_recv().unwrap(), 7);
        assert_eq!(b.try_recv().unwrap(), 7);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let signal = Signal::new();
        let a = signal.connect();
        drop(signal.connect());
        signal.emit(1);
        signal.emit(2);
        assert_eq!(a.try_recv().unwrap(), 1);
        assert_eq!(a.try_recv().unwrap(), 2);
    }

    #[test]
    fn test_clear_disconnects() {
        let signal = Signal::new();
        let a = signal.connect();
        signal.clear();
        signal.emit(9);
        assert!(a.try_recv().is_err());
    }
}
