//! Subscriber-facing snapshot delivery.
//!
//! Every state change produces a consistent copy of the whole device table.
//! Each subscriber owns an unbounded receiver; the coordinator sends under
//! its lock, in registration order, so for any one device all subscribers
//! observe the same total order of updates and none of them can block the
//! coordinator.

use std::{collections::HashMap, sync::Arc};

use bluer::Address;
use tokio::sync::mpsc;

use crate::state::PodState;

/// A consistent copy of every known device state.
pub type Snapshot = Arc<HashMap<Address, PodState>>;

/// Receiving half of a coordinator subscription.
///
/// Dropping the subscription unregisters it; the coordinator prunes the
/// dead sender on its next fan-out.
#[derive(Debug)]
pub struct Subscription {
   rx: mpsc::UnboundedReceiver<Snapshot>,
}

impl Subscription {
   pub(crate) fn new(rx: mpsc::UnboundedReceiver<Snapshot>) -> Self {
      Self { rx }
   }

   /// Waits for the next snapshot. Returns `None` once the coordinator is
   /// gone.
   pub async fn recv(&mut self) -> Option<Snapshot> {
      self.rx.recv().await
   }

   /// Non-blocking variant of [`recv`](Self::recv).
   pub fn try_recv(&mut self) -> Option<Snapshot> {
      self.rx.try_recv().ok()
   }
}
