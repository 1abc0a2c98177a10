//! Arbitration between the two acquisition branches.
//!
//! The coordinator runs the BLE scan loop and, on request, an AAP session,
//! merging both into one per-device state table keyed by the device's
//! permanent address. AAP is the better source (exact percentages, pushed
//! by the device), so while a session is active the scan loop idles and
//! BLE-sourced updates for that device are discarded.
//!
//! Advertisements arrive under randomized addresses. When a device's
//! encryption key is known (retrieved once over AAP), the coordinator
//! recognizes the device anyway: it trial-decrypts the advertisement's
//! encrypted suffix with every stored key, and the key whose output passes
//! the structural validation identifies the sender. The same decryption
//! yields exact battery levels, so an identified advertisement is almost as
//! good as an AAP notification.

use std::{
   collections::HashMap,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use log::{debug, info, warn};
use parking_lot::RwLock;
use tokio::{
   sync::{Mutex, Notify, mpsc},
   task::{JoinHandle, JoinSet},
   time,
};

use crate::{
   aap::{
      protocol::{self, BatteryInfo, ProximityKey},
      session::{AapEvent, AapSession},
   },
   bluetooth::{
      l2cap::{self, Packet},
      scan::BleScanner,
   },
   config::Config,
   error::{PodLinkError, Result},
   event::{Snapshot, Subscription},
   proximity::{self, ProximityRecord},
   state::{EncryptionKey, PodState, Source},
};

/// Length of one BLE discovery window.
pub const SCAN_WINDOW: Duration = Duration::from_secs(5);
/// Pause between scan iterations, and the idle period while an AAP session
/// holds authority.
pub const INTER_SCAN_PAUSE: Duration = Duration::from_secs(3);

struct Shared {
   device_states: HashMap<Address, PodState>,
   encryption_keys: HashMap<Address, EncryptionKey>,
   aap_connected: bool,
   aap_mac: Option<Address>,
   /// Bumped on every `connect_aap` so a stale event pump cannot clear a
   /// successor session's authority.
   aap_generation: u64,
   subscribers: Vec<mpsc::UnboundedSender<Snapshot>>,
}

struct Inner {
   config: Config,
   shared: RwLock<Shared>,
   session: Mutex<Option<AapSession>>,
   shutdown: AtomicBool,
   shutdown_notify: Notify,
}

/// Coordinates the BLE and AAP branches and fans state out to subscribers.
///
/// Cheaply cloneable; all clones share the same state.
#[derive(Clone)]
pub struct Coordinator {
   inner: Arc<Inner>,
}

impl Coordinator {
   pub fn new(config: Config) -> Self {
      Self {
         inner: Arc::new(Inner {
            config,
            shared: RwLock::new(Shared {
               device_states: HashMap::new(),
               encryption_keys: HashMap::new(),
               aap_connected: false,
               aap_mac: None,
               aap_generation: 0,
               subscribers: Vec::new(),
            }),
            session: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
         }),
      }
   }

   // === Subscriptions and accessors ===

   /// Registers a subscriber. If any state is already known the current
   /// snapshot is delivered immediately.
   pub fn subscribe(&self) -> Subscription {
      let (tx, rx) = mpsc::unbounded_channel();
      let mut shared = self.inner.shared.write();
      if !shared.device_states.is_empty() {
         let _ = tx.send(Arc::new(shared.device_states.clone()));
      }
      shared.subscribers.push(tx);
      Subscription::new(rx)
   }

   /// A copy of all device states.
   pub fn device_states(&self) -> HashMap<Address, PodState> {
      self.inner.shared.read().device_states.clone()
   }

   /// The address of the device an active AAP session is bound to, if any.
   pub fn connected_aap_mac(&self) -> Option<Address> {
      let shared = self.inner.shared.read();
      if shared.aap_connected { shared.aap_mac } else { None }
   }

   pub fn has_encryption_keys(&self) -> bool {
      !self.inner.shared.read().encryption_keys.is_empty()
   }

   /// The stored encryption key for a device, if one has been retrieved.
   pub fn encryption_key(&self, mac: Address) -> Option<EncryptionKey> {
      self.inner.shared.read().encryption_keys.get(&mac).copied()
   }

   /// A copy of all stored encryption keys.
   pub fn encryption_keys(&self) -> HashMap<Address, EncryptionKey> {
      self.inner.shared.read().encryption_keys.clone()
   }

   // === BLE branch ===

   /// Spawns the BLE scan loop. The returned handle resolves once
   /// [`shutdown`](Self::shutdown) has been called.
   pub async fn start_ble_loop(&self) -> Result<JoinHandle<()>> {
      let scanner = BleScanner::new(&self.inner.config).await?;
      let this = self.clone();
      Ok(tokio::spawn(async move { this.ble_loop(scanner).await }))
   }

   async fn ble_loop(self, scanner: BleScanner) {
      let window = self.inner.config.scan_window();
      let pause = self.inner.config.scan_pause();

      info!("BLE scan loop started");
      while !self.is_shut_down() {
         let aap_active = self.inner.shared.read().aap_connected;
         if aap_active {
            // AAP owns the connected device and nothing else is likely to
            // be advertising meaningfully; just idle.
            self.pause(pause).await;
            continue;
         }

         match scanner.scan_window(window).await {
            Ok(Some((observed, payload))) => self.ingest_advertisement(observed, &payload),
            Ok(None) => {}, // window elapsed, not an error
            Err(e) => warn!("BLE scan failed: {e}"),
         }

         self.pause(pause).await;
      }
      info!("BLE scan loop stopped");
   }

   /// Feeds one raw advertisement through the proximity codec and into the
   /// device table.
   fn ingest_advertisement(&self, observed: Address, payload: &[u8]) {
      let mut record = match proximity::parse_advertisement(payload) {
         Ok(record) => record,
         Err(e) => {
            debug!("{observed}: dropping advertisement: {e}");
            return;
         },
      };

      let real_mac = self.identify(&mut record, observed);
      let key = self.encryption_key(real_mac);
      let state = PodState::from_ble(&record, real_mac, observed, key);
      self.apply_update(real_mac, state);
   }

   /// Resolves a randomized advertisement address to a permanent identity
   /// by trying every stored key against the encrypted suffix.
   ///
   /// The key whose decryption passes validation identifies the device and
   /// its battery data is merged into the record along the way. With no
   /// match the observed address stands in as a provisional identity.
   fn identify(&self, record: &mut ProximityRecord, observed: Address) -> Address {
      let suffix: [u8; 16] = match record.encrypted_suffix() {
         Some(slice) => {
            let mut buf = [0u8; 16];
            buf.copy_from_slice(slice);
            buf
         },
         None => return observed,
      };

      let keys: Vec<(Address, EncryptionKey)> = {
         let shared = self.inner.shared.read();
         shared
            .encryption_keys
            .iter()
            .map(|(mac, key)| (*mac, *key))
            .collect()
      };

      for (mac, key) in keys {
         // A failed trial just means "not this key", never an error.
         if let Ok(block) = proximity::decrypt_suffix(&suffix, &key) {
            record.merge_decrypted(block);
            info!("Identified {mac} behind randomized address {observed}");
            return mac;
         }
      }

      observed
   }

   // === AAP branch ===

   /// Opens an AAP session to `mac` and hands authority for that device to
   /// the AAP branch. Any existing session is closed first.
   ///
   /// `mac` must be the device's permanent address, the one it is paired
   /// under, not an advertisement address.
   pub async fn connect_aap(&self, mac: &str) -> Result<()> {
      if self.is_shut_down() {
         return Err(PodLinkError::CoordinatorShutdown);
      }
      let address: Address = mac
         .parse()
         .map_err(|_| PodLinkError::InvalidAddress(mac.to_string()))?;

      let mut slot = self.inner.session.lock().await;
      if let Some(mut old) = slot.take() {
         old.close();
      }

      let mut jset = JoinSet::new();
      let (receiver, sender) = l2cap::connect(&mut jset, address, None).await?;
      let (session, events) = AapSession::start(address, receiver, sender, jset).await?;
      *slot = Some(session);

      let generation = {
         let mut shared = self.inner.shared.write();
         shared.aap_generation += 1;
         shared.aap_connected = true;
         shared.aap_mac = Some(address);
         shared.aap_generation
      };
      drop(slot);

      info!("{address}: AAP connected, BLE scanning paused while the session is active");

      let this = self.clone();
      tokio::spawn(async move { this.aap_event_pump(address, generation, events).await });
      Ok(())
   }

   /// Closes any active AAP session and resumes BLE scanning. Idempotent.
   pub async fn disconnect_aap(&self) {
      let mut slot = self.inner.session.lock().await;
      if let Some(mut session) = slot.take() {
         session.close();
         info!("{}: AAP disconnected, resuming BLE scanning", session.address());
      }
      let mut shared = self.inner.shared.write();
      shared.aap_connected = false;
      shared.aap_mac = None;
   }

   /// Asks the connected device for its proximity keys. The response is
   /// stored automatically when the read loop surfaces it.
   pub async fn request_encryption_keys(&self) -> Result<()> {
      let slot = self.inner.session.lock().await;
      match slot.as_ref() {
         Some(session) => session.request_keys().await,
         None => Err(PodLinkError::NoAapSession),
      }
   }

   async fn aap_event_pump(
      self,
      address: Address,
      generation: u64,
      mut events: mpsc::Receiver<AapEvent>,
   ) {
      while let Some(event) = events.recv().await {
         match event {
            AapEvent::Battery { info, raw } => self.apply_aap_battery(address, &info, raw),
            AapEvent::Keys(keys) => self.store_keys(address, &keys),
            AapEvent::Disconnected(reason) => {
               warn!("{address}: AAP session ended: {reason}");
               break;
            },
         }
      }

      // Transport gone or session replaced; release the slot and hand the
      // device back to the BLE branch, unless a successor session already
      // took over.
      let mut slot = self.inner.session.lock().await;
      let mut shared = self.inner.shared.write();
      if shared.aap_generation == generation {
         shared.aap_connected = false;
         shared.aap_mac = None;
         if let Some(mut session) = slot.take() {
            session.close();
         }
         info!("{address}: AAP released, resuming BLE scanning");
      }
   }

   fn apply_aap_battery(&self, mac: Address, info: &BatteryInfo, raw: Packet) {
      let key = self.encryption_key(mac);
      let state = PodState::from_aap(info, raw, mac, key);
      self.apply_update(mac, state);
   }

   /// Stores the ENC_KEY from a key response and attaches it to the
   /// device's state in place.
   fn store_keys(&self, mac: Address, keys: &[ProximityKey]) {
      let Some(bytes) = protocol::find_encryption_key(keys) else {
         debug!("{mac}: key response without an ENC_KEY");
         return;
      };
      let Ok(key) = EncryptionKey::try_from(bytes) else {
         warn!("{mac}: ENC_KEY with unexpected length {}", bytes.len());
         return;
      };

      let mut shared = self.inner.shared.write();
      shared.encryption_keys.insert(mac, key);
      info!("{mac}: stored proximity encryption key");
      if let Some(state) = shared.device_states.get_mut(&mac) {
         state.encryption_key = Some(key);
      }
      Self::fan_out(&mut shared);
   }

   // === State application and fan-out ===

   /// Applies a state update under the coordinator lock and fans the new
   /// snapshot out to every subscriber in registration order.
   ///
   /// While an AAP session is bound to a device, BLE-sourced updates for
   /// that device are discarded; the session is the authority.
   fn apply_update(&self, mac: Address, state: PodState) {
      let mut shared = self.inner.shared.write();
      if state.source == Source::Ble && shared.aap_connected && shared.aap_mac == Some(mac) {
         debug!("{mac}: dropping BLE update, AAP session is authoritative");
         return;
      }
      shared.device_states.insert(mac, state);
      Self::fan_out(&mut shared);
   }

   fn fan_out(shared: &mut Shared) {
      let snapshot: Snapshot = Arc::new(shared.device_states.clone());
      shared
         .subscribers
         .retain(|tx| tx.send(snapshot.clone()).is_ok());
   }

   // === Shutdown ===

   /// Signals both branches to stop at their next suspension point and
   /// releases the AAP transport. Idempotent.
   pub async fn shutdown(&self) {
      self.inner.shutdown.store(true, Ordering::Relaxed);
      self.inner.shutdown_notify.notify_waiters();
      self.disconnect_aap().await;
      info!("Coordinator shut down");
   }

   fn is_shut_down(&self) -> bool {
      self.inner.shutdown.load(Ordering::Relaxed)
   }

   /// Sleeps for `duration`, waking early on shutdown.
   async fn pause(&self, duration: Duration) {
      tokio::select! {
         () = time::sleep(duration) => {},
         () = self.inner.shutdown_notify.notified() => {},
      }
   }
}

#[cfg(test)]
mod tests {
   use aes::{
      Aes128,
      cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray},
   };

   use super::*;
   use crate::aap::protocol::{Battery, BatteryStatus, Component, KeyKind};

   const M1: Address = Address::new([0xaa, 0x00, 0x00, 0x00, 0x00, 0x01]);
   const M2: Address = Address::new([0xaa, 0x00, 0x00, 0x00, 0x00, 0x02]);
   const RANDOMIZED: Address = Address::new([0x7b, 0x55, 0x13, 0x09, 0xfe, 0xc4]);

   const K1: EncryptionKey = [0x10; 16];
   const K2: EncryptionKey = [0x20; 16];

   fn coordinator() -> Coordinator {
      Coordinator::new(Config::default())
   }

   fn encrypt(block: [u8; 16], key: &EncryptionKey) -> [u8; 16] {
      let cipher = Aes128::new(GenericArray::from_slice(key));
      let mut out = block;
      cipher.encrypt_block(GenericArray::from_mut_slice(&mut out));
      out
   }

   /// A long-form advertisement whose encrypted suffix decrypts under
   /// `key` to left 63% / right 64% / case 65% (flipped orientation).
   fn sealed_advertisement(key: &EncryptionKey) -> Vec<u8> {
      let mut plain = [0u8; 16];
      plain[1] = 64; // primary (right, since flipped)
      plain[2] = 63;
      plain[3] = 65;
      plain[4] = 0x2d;

      let mut adv = vec![0x07, 0x19, 0x01, 0x27, 0x20, 0x0b, 0x99, 0x8f, 0x11, 0x00, 0x05];
      adv.extend_from_slice(&encrypt(plain, key));
      adv
   }

   fn battery_info(level: u8) -> BatteryInfo {
      BatteryInfo {
         left: Some(Battery {
            component: Component::Left,
            level,
            status: BatteryStatus::Discharging,
         }),
         right: None,
         case: None,
      }
   }

   fn set_aap_authority(coordinator: &Coordinator, mac: Address) {
      let mut shared = coordinator.inner.shared.write();
      shared.aap_generation += 1;
      shared.aap_connected = true;
      shared.aap_mac = Some(mac);
   }

   fn clear_aap_authority(coordinator: &Coordinator) {
      let mut shared = coordinator.inner.shared.write();
      shared.aap_connected = false;
      shared.aap_mac = None;
   }

   #[test]
   fn ble_ingestion_creates_state_under_observed_address() {
      let coordinator = coordinator();
      coordinator.ingest_advertisement(RANDOMIZED, &sealed_advertisement(&K1));

      let states = coordinator.device_states();
      let state = states.get(&RANDOMIZED).expect("state under observed mac");
      assert_eq!(state.source, Source::Ble);
      assert_eq!(state.real_mac, RANDOMIZED);
      assert_eq!(state.current_ble_mac, Some(RANDOMIZED));
      // No key stored yet: nibble precision only
      assert_eq!(state.left_battery, Some(90));
      assert_eq!(state.encryption_key, None);
   }

   #[test]
   fn malformed_advertisements_change_nothing() {
      let coordinator = coordinator();
      coordinator.ingest_advertisement(RANDOMIZED, &[0x07, 0x19, 0x02]);
      assert!(coordinator.device_states().is_empty());
   }

   #[test]
   fn key_trial_resolves_randomized_addresses() {
      let coordinator = coordinator();
      {
         let mut shared = coordinator.inner.shared.write();
         shared.encryption_keys.insert(M1, K1);
         shared.encryption_keys.insert(M2, K2);
      }

      coordinator.ingest_advertisement(RANDOMIZED, &sealed_advertisement(&K1));

      let states = coordinator.device_states();
      assert!(!states.contains_key(&RANDOMIZED));
      let state = states.get(&M1).expect("state under the real mac");
      assert_eq!(state.source, Source::Ble);
      assert_eq!(state.real_mac, M1);
      assert_eq!(state.current_ble_mac, Some(RANDOMIZED));
      assert_eq!(state.encryption_key, Some(K1));

      // Decrypted battery merged, flipped: byte 1 is the right pod
      assert_eq!(state.right_battery, Some(64));
      assert_eq!(state.left_battery, Some(63));
      assert_eq!(state.case_battery, Some(65));
   }

   #[test]
   fn unresolvable_advertisements_fall_back_to_observed_address() {
      let coordinator = coordinator();
      coordinator
         .inner
         .shared
         .write()
         .encryption_keys
         .insert(M2, K2);

      coordinator.ingest_advertisement(RANDOMIZED, &sealed_advertisement(&K1));

      let states = coordinator.device_states();
      let state = states.get(&RANDOMIZED).expect("provisional identity");
      // The wrong key failed validation, so nibble values stand
      assert_eq!(state.left_battery, Some(90));
      assert_eq!(state.right_battery, Some(90));
      assert_eq!(state.case_battery, None);
   }

   #[test]
   fn aap_session_outranks_ble_for_its_device() {
      let coordinator = coordinator();
      let mut subscription = coordinator.subscribe();

      // (i) BLE produces a state for the device
      coordinator.ingest_advertisement(M1, &sealed_advertisement(&K1));
      assert_eq!(
         subscription.try_recv().unwrap()[&M1].source,
         Source::Ble
      );

      // (ii) an AAP session takes over and a battery packet arrives
      set_aap_authority(&coordinator, M1);
      coordinator.apply_aap_battery(M1, &battery_info(77), Packet::new());
      let snapshot = subscription.try_recv().unwrap();
      assert_eq!(snapshot[&M1].source, Source::Aap);
      assert_eq!(snapshot[&M1].left_battery, Some(77));

      // BLE updates for the device are discarded while AAP is bound to it
      coordinator.ingest_advertisement(M1, &sealed_advertisement(&K1));
      assert!(subscription.try_recv().is_none());
      assert_eq!(coordinator.device_states()[&M1].source, Source::Aap);

      // updates for other devices proceed normally
      coordinator.ingest_advertisement(M2, &sealed_advertisement(&K2));
      assert_eq!(
         subscription.try_recv().unwrap()[&M2].source,
         Source::Ble
      );

      // (iii) after release, BLE may own the device again
      clear_aap_authority(&coordinator);
      coordinator.ingest_advertisement(M1, &sealed_advertisement(&K1));
      assert_eq!(
         subscription.try_recv().unwrap()[&M1].source,
         Source::Ble
      );
   }

   #[test]
   fn key_responses_are_stored_and_attached() {
      let coordinator = coordinator();
      coordinator.apply_aap_battery(M1, &battery_info(50), Packet::new());

      let keys = vec![
         ProximityKey {
            kind: KeyKind::Irk,
            bytes: vec![0x33; 16],
         },
         ProximityKey {
            kind: KeyKind::EncKey,
            bytes: K1.to_vec(),
         },
      ];
      coordinator.store_keys(M1, &keys);

      assert!(coordinator.has_encryption_keys());
      assert_eq!(coordinator.encryption_key(M1), Some(K1));
      assert_eq!(
         coordinator.device_states()[&M1].encryption_key,
         Some(K1)
      );
   }

   #[test]
   fn key_responses_without_enc_key_are_ignored() {
      let coordinator = coordinator();
      coordinator.store_keys(
         M1,
         &[ProximityKey {
            kind: KeyKind::Irk,
            bytes: vec![0x33; 16],
         }],
      );
      assert!(!coordinator.has_encryption_keys());

      coordinator.store_keys(
         M1,
         &[ProximityKey {
            kind: KeyKind::EncKey,
            bytes: vec![0x33; 8], // wrong length
         }],
      );
      assert!(!coordinator.has_encryption_keys());
   }

   #[test]
   fn new_subscribers_get_the_current_snapshot_immediately() {
      let coordinator = coordinator();
      assert!(coordinator.subscribe().try_recv().is_none());

      coordinator.apply_aap_battery(M1, &battery_info(42), Packet::new());

      let mut late = coordinator.subscribe();
      let snapshot = late.try_recv().expect("immediate snapshot");
      assert_eq!(snapshot[&M1].left_battery, Some(42));
   }

   #[test]
   fn every_subscriber_sees_every_update() {
      let coordinator = coordinator();
      let mut subscriptions: Vec<_> = (0..3).map(|_| coordinator.subscribe()).collect();

      coordinator.apply_aap_battery(M1, &battery_info(10), Packet::new());
      coordinator.apply_aap_battery(M1, &battery_info(20), Packet::new());

      for subscription in &mut subscriptions {
         assert_eq!(
            subscription.try_recv().unwrap()[&M1].left_battery,
            Some(10)
         );
         assert_eq!(
            subscription.try_recv().unwrap()[&M1].left_battery,
            Some(20)
         );
         assert!(subscription.try_recv().is_none());
      }
   }

   #[test]
   fn dropped_subscribers_are_pruned() {
      let coordinator = coordinator();
      let subscription = coordinator.subscribe();
      drop(subscription);

      coordinator.apply_aap_battery(M1, &battery_info(30), Packet::new());
      assert!(coordinator.inner.shared.read().subscribers.is_empty());
   }

   #[tokio::test]
   async fn key_request_requires_a_session() {
      let coordinator = coordinator();
      let err = coordinator.request_encryption_keys().await.unwrap_err();
      assert!(matches!(err, PodLinkError::NoAapSession));
   }

   #[tokio::test]
   async fn connect_rejects_malformed_addresses() {
      let coordinator = coordinator();
      let err = coordinator.connect_aap("not-a-mac").await.unwrap_err();
      assert!(matches!(err, PodLinkError::InvalidAddress(_)));
   }

   #[tokio::test]
   async fn disconnect_without_session_is_a_no_op() {
      let coordinator = coordinator();
      coordinator.disconnect_aap().await;
      coordinator.disconnect_aap().await;
      assert_eq!(coordinator.connected_aap_mac(), None);
   }

   #[tokio::test]
   async fn shutdown_blocks_new_sessions() {
      let coordinator = coordinator();
      coordinator.shutdown().await;
      let err = coordinator
         .connect_aap("11:22:33:44:55:66")
         .await
         .unwrap_err();
      assert!(matches!(err, PodLinkError::CoordinatorShutdown));
   }
}
