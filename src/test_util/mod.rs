//! This module contains utilities for testing code built on the bus: an in-process transport
//!  substrate with fault injection, and helpers for collecting bus events. They are used for
//!  testing the bus itself, but they are also exported for application testing, which is why
//!  this module is part of the crate's regular (non-#[cfg(test)]) code.

pub mod memory_net;

use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use crate::event::BusEvent;

/// Collect events until `pred` returns true for one of them, panicking on timeout. Returns
///  everything collected, the matching event last.
pub async fn collect_until(
    receiver: &mut UnboundedReceiver<BusEvent>,
    pred: impl Fn(&BusEvent) -> bool,
) -> Vec<BusEvent> {
    let mut collected = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(60), receiver.recv()).await
            .expect("timed out waiting for a bus event")
            .expect("event channel closed unexpectedly");
        let done = pred(&event);
        collected.push(event);
        if done {
            return collected;
        }
    }
}

/// drain whatever events are immediately available
pub fn drain_events(receiver: &mut UnboundedReceiver<BusEvent>) -> Vec<BusEvent> {
    let mut collected = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        collected.push(event);
    }
    collected
}
