//! Stateful AAP client over an open L2CAP channel.
//!
//! The session is handed an already-connected transport (opening the
//! socket is the caller's business) and drives the startup protocol
//! before settling into a read loop that surfaces decoded events. Firmware
//! emits many status packets nothing here consumes; the read loop drops
//! them silently.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use smol_str::{SmolStr, ToSmolStr};
use tokio::{sync::mpsc, task::JoinSet, time};

use crate::{
   aap::{
      parser,
      protocol::{
         BatteryInfo, PKT_ENABLE_BATTERY_NOTIFICATIONS, PKT_ENABLE_SPECIAL_FEATURES,
         PKT_HANDSHAKE, PKT_REQUEST_PROXIMITY_KEYS, ProximityKey,
      },
   },
   bluetooth::l2cap::{L2CapReceiver, L2CapSender, Packet},
   error::{PodLinkError, Result},
};

/// Device-side processing delay after the handshake. Empirical protocol
/// constant; follow-up requests sent earlier are dropped by the firmware.
pub const HANDSHAKE_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Capacity of the decoded event channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionState {
   /// No transport yet. Sessions built by [`AapSession::start`] are handed
   /// an open transport and begin in `Connecting`.
   Idle,
   Connecting,
   Handshaking,
   Active,
   Closed,
}

/// Decoded events surfaced by the read loop.
#[derive(Debug, Clone)]
pub enum AapEvent {
   /// A battery status notification, with the packet it was decoded from.
   Battery { info: BatteryInfo, raw: Packet },
   /// A proximity key response.
   Keys(Vec<ProximityKey>),
   /// The transport failed or closed; the session is finished.
   Disconnected(SmolStr),
}

/// An AAP client bound to one open transport.
///
/// The transport actors and the read loop live in one `JoinSet`; closing or
/// dropping the session aborts them all, which releases the transport.
pub struct AapSession {
   address: Address,
   sender: L2CapSender,
   state: Arc<AtomicCell<SessionState>>,
   jset: JoinSet<()>,
}

impl AapSession {
   /// Runs the startup protocol over an already-opened channel and begins
   /// reading.
   ///
   /// On any startup failure the `JoinSet`, and with it the transport, is
   /// dropped before the error is returned, so nothing leaks.
   pub async fn start(
      address: Address,
      receiver: L2CapReceiver,
      sender: L2CapSender,
      mut jset: JoinSet<()>,
   ) -> Result<(Self, mpsc::Receiver<AapEvent>)> {
      let state = Arc::new(AtomicCell::new(SessionState::Connecting));

      state.store(SessionState::Handshaking);
      sender.send(PKT_HANDSHAKE).await?;
      time::sleep(HANDSHAKE_SETTLE_DELAY).await;
      sender.send(PKT_ENABLE_BATTERY_NOTIFICATIONS).await?;
      sender.send(PKT_ENABLE_SPECIAL_FEATURES).await?;
      state.store(SessionState::Active);
      info!("{address}: AAP session active");

      let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
      jset.spawn(read_loop(address, receiver, event_tx, state.clone()));

      Ok((
         Self {
            address,
            sender,
            state,
            jset,
         },
         event_rx,
      ))
   }

   pub fn address(&self) -> Address {
      self.address
   }

   pub fn state(&self) -> SessionState {
      self.state.load()
   }

   pub fn is_active(&self) -> bool {
      self.state() == SessionState::Active
   }

   /// Asks the device for its proximity-pairing keys.
   ///
   /// The response is asynchronous: it surfaces as [`AapEvent::Keys`] on
   /// the event channel whenever the device gets around to it, typically
   /// within the next hundred packets.
   pub async fn request_keys(&self) -> Result<()> {
      match self.state() {
         SessionState::Active => self.sender.send(PKT_REQUEST_PROXIMITY_KEYS).await,
         SessionState::Closed => Err(PodLinkError::SessionClosed),
         _ => Err(PodLinkError::SessionNotActive),
      }
   }

   /// Closes the session and releases the transport. Idempotent.
   pub fn close(&mut self) {
      if self.state.load() != SessionState::Closed {
         debug!("{}: closing AAP session", self.address);
         self.state.store(SessionState::Closed);
      }
      self.jset.abort_all();
   }
}

impl Drop for AapSession {
   fn drop(&mut self) {
      self.close();
   }
}

async fn read_loop(
   address: Address,
   mut receiver: L2CapReceiver,
   events: mpsc::Sender<AapEvent>,
   state: Arc<AtomicCell<SessionState>>,
) {
   loop {
      match receiver.recv().await {
         Ok(packet) => {
            let Some(event) = classify_packet(address, &packet) else {
               continue;
            };
            if events.send(event).await.is_err() {
               debug!("{address}: event consumer gone, stopping read loop");
               return;
            }
         },
         Err(e) => {
            warn!("{address}: AAP read failed: {e}");
            state.store(SessionState::Closed);
            let _ = events.send(AapEvent::Disconnected(e.to_smolstr())).await;
            return;
         },
      }
   }
}

/// Decodes one inbound packet, or `None` for the status chatter nothing
/// here consumes.
fn classify_packet(address: Address, packet: &Packet) -> Option<AapEvent> {
   if parser::is_battery_packet(packet) {
      match parser::parse_battery_status(packet) {
         Ok(info) => {
            debug!("{address}: battery {info}");
            return Some(AapEvent::Battery {
               info,
               raw: packet.clone(),
            });
         },
         Err(e) => warn!("{address}: bad battery packet: {e}"),
      }
   } else if parser::is_key_packet(packet) {
      match parser::parse_proximity_keys(packet) {
         Ok(keys) => return Some(AapEvent::Keys(keys)),
         Err(e) => warn!("{address}: bad key packet: {e}"),
      }
   } else {
      debug!("{address}: ignoring packet {}", hex::encode(packet));
   }
   None
}
