// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Metadata change fan-out.
//!
//! One controller is constructed per pipeline and handed to every node that
//! wants to publish or observe metadata changes. Publishing runs every
//! callback synchronously on the publisher's thread, in subscription order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::record::MetadataRecord;

/// Callback invoked for every published metadata change.
pub type MetadataCallback = Arc<dyn Fn(&Arc<MetadataRecord>) + Send + Sync>;

/// Handle returned by [`MetadataController::add_node_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Dispatcher that fans metadata changes out to subscribed nodes.
pub struct MetadataController {
    subscribers: RwLock<Vec<(SubscriptionId, MetadataCallback)>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

impl Default for MetadataController {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataController {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Subscribe to every subsequent metadata change.
    ///
    /// After [`shutdown`](Self::shutdown) the callback is discarded and the
    /// returned id is inert.
    pub fn add_node_callback<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Arc<MetadataRecord>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if self.shut_down.load(Ordering::Acquire) {
            tracing::warn!("[metadata] controller shut down, dropping subscription {:?}", id);
            return id;
        }
        self.subscribers.write().push((id, Arc::new(callback)));
        tracing::debug!("[metadata] subscription {:?} added", id);
        id
    }

    /// Unsubscribe. Returns false if the id was not subscribed.
    pub fn remove_node_callback(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        before != subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver `metadata` to every subscriber. Returns how many were notified.
    pub fn publish(&self, metadata: Arc<MetadataRecord>) -> usize {
        if self.shut_down.load(Ordering::Acquire) {
            tracing::debug!("[metadata] publish after shutdown ignored");
            return 0;
        }

        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<MetadataCallback> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        tracing::trace!(
            "[metadata] publishing {} entries (stream {:?}) to {} subscribers",
            metadata.len(),
            metadata.stream_id(),
            callbacks.len()
        );

        for callback in &callbacks {
            callback(&metadata);
        }
        callbacks.len()
    }

    /// Drop all subscribers. Later publishes and subscriptions are no-ops.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let dropped = {
            let mut subscribers = self.subscribers.write();
            std::mem::take(&mut *subscribers).len()
        };
        tracing::info!("[metadata] controller shut down, {} subscribers dropped", dropped);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metadata::{MetadataTag, MetadataValue};
    use crate::core::types::StreamId;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn record(stream: i32) -> Arc<MetadataRecord> {
        Arc::new(MetadataRecord::for_stream(StreamId(stream), 4, 64).unwrap())
    }

    #[test]
    fn test_publish_reaches_all_subscribers_in_order() {
        let controller = MetadataController::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            controller.add_node_callback(move |_| seen.lock().push(label));
        }

        assert_eq!(controller.publish(record(0)), 3);
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_removed_subscriber_not_called() {
        let controller = MetadataController::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = controller.add_node_callback(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        controller.publish(record(1));
        assert!(controller.remove_node_callback(id));
        assert!(!controller.remove_node_callback(id));
        controller.publish(record(1));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_subscribe_during_publish() {
        let controller = Arc::new(MetadataController::new());
        let inner = Arc::clone(&controller);
        controller.add_node_callback(move |_| {
            inner.add_node_callback(|_| {});
        });

        controller.publish(record(2));
        assert_eq!(controller.subscriber_count(), 2);
    }

    #[test]
    fn test_shutdown_drops_subscribers() {
        let controller = MetadataController::new();
        controller.add_node_callback(|_| {});
        controller.shutdown();

        assert_eq!(controller.subscriber_count(), 0);
        assert_eq!(controller.publish(record(0)), 0);
        controller.add_node_callback(|_| {});
        assert_eq!(controller.subscriber_count(), 0);
    }

    #[test]
    fn test_callback_sees_payload() {
        let controller = MetadataController::new();
        let quality = Arc::new(Mutex::new(None));
        let q = Arc::clone(&quality);
        controller.add_node_callback(move |meta| {
            *q.lock() = meta
                .find(MetadataTag::JpegQuality)
                .and_then(MetadataValue::as_u8)
                .map(|v| v[0]);
        });

        let mut meta = MetadataRecord::for_stream(StreamId::DEVICE_CONTROL, 4, 64).unwrap();
        meta.add_entry(MetadataTag::JpegQuality, MetadataValue::U8(vec![85])).unwrap();
        controller.publish(Arc::new(meta));

        assert_eq!(*quality.lock(), Some(85));
    }
}
