//! BLE advertisement scanning and device recognition.
//!
//! The scanner runs LE-only discovery in bounded windows and yields the
//! next Apple proximity-pairing advertisement together with the address it
//! was observed under. That address is randomized by the device for
//! privacy; resolving it back to a permanent identity is the coordinator's
//! job, not the scanner's.

use std::time::Duration;

use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::StreamExt;
use log::{debug, warn};
use tokio::time::{self, Instant};
use uuid::Uuid;

use crate::{config::Config, error::Result, proximity};

/// Apple company identifier in manufacturer data.
pub const APPLE_COMPANY_ID: u16 = 0x004c;

/// Name patterns matching devices of interest (matched lowercase).
/// Wired "EarPods" are deliberately absent.
const DEVICE_NAME_PATTERNS: &[&str] = &["airpods", "beats", "powerbeats"];

/// Apple service UUIDs. Not always advertised, but definitive when present.
static APPLE_SERVICES: [Uuid; 3] = [
   Uuid::from_u128(0x0000fd6f_0000_1000_8000_00805f9b34fb),
   Uuid::from_u128(0x0000fd39_0000_1000_8000_00805f9b34fb),
   Uuid::from_u128(0x0000fd32_0000_1000_8000_00805f9b34fb),
];

/// A scanner bound to one Bluetooth adapter.
pub struct BleScanner {
   adapter: Adapter,
}

impl BleScanner {
   /// Creates a scanner on the configured adapter (or the default one) and
   /// restricts discovery to the LE transport.
   pub async fn new(config: &Config) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match config.adapter.as_deref() {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };
      adapter.set_powered(true).await?;
      adapter
         .set_discovery_filter(DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            ..Default::default()
         })
         .await?;
      Ok(Self { adapter })
   }

   /// Runs one discovery window.
   ///
   /// Returns the first proximity advertisement observed and its source
   /// address, or `None` when the window elapses without one. An empty
   /// window is a normal outcome, not an error.
   pub async fn scan_window(&self, window: Duration) -> Result<Option<(Address, Vec<u8>)>> {
      let deadline = Instant::now() + window;
      let mut events = self.adapter.discover_devices().await?;

      // Devices bluez already knows about will not fire DeviceAdded again
      // within this discovery session, so sweep them up front.
      if let Ok(known) = self.adapter.device_addresses().await {
         for addr in known {
            if let Some(payload) = self.proximity_payload(addr).await {
               return Ok(Some((addr, payload)));
            }
         }
      }

      loop {
         let event = tokio::select! {
            event = events.next() => event,
            () = time::sleep_until(deadline) => return Ok(None),
         };
         let Some(event) = event else {
            warn!("Discovery event stream ended");
            return Ok(None);
         };
         if let AdapterEvent::DeviceAdded(addr) = event
            && let Some(payload) = self.proximity_payload(addr).await
         {
            return Ok(Some((addr, payload)));
         }
      }
   }

   /// Connected devices that look like compatible headphones, as candidates
   /// for an AAP session.
   pub async fn connected_candidates(&self, config: &Config) -> Result<Vec<Address>> {
      let mut found = Vec::new();
      for addr in self.adapter.device_addresses().await? {
         let Ok(device) = self.adapter.device(addr) else {
            continue;
         };
         if device.is_connected().await.unwrap_or(false)
            && is_device_of_interest(&device, config).await
         {
            found.push(addr);
         }
      }
      Ok(found)
   }

   async fn proximity_payload(&self, addr: Address) -> Option<Vec<u8>> {
      let device = self.adapter.device(addr).ok()?;
      let data = device.manufacturer_data().await.ok()??;
      let payload = data.get(&APPLE_COMPANY_ID)?;
      if proximity::is_proximity_payload(payload) {
         debug!("{addr}: proximity advertisement {}", hex::encode(payload));
         Some(payload.clone())
      } else {
         None
      }
   }
}

/// Layered device recognition: known address, then manufacturer data, then
/// Apple service UUIDs, then name patterns as a last resort.
pub async fn is_device_of_interest(device: &bluer::Device, config: &Config) -> bool {
   if config
      .is_known_device(&device.address().to_string())
      .is_some()
   {
      return true;
   }

   if let Ok(Some(data)) = device.manufacturer_data().await
      && data
         .get(&APPLE_COMPANY_ID)
         .is_some_and(|payload| proximity::is_proximity_payload(payload))
   {
      debug!("{}: recognized via manufacturer data", device.address());
      return true;
   }

   if let Ok(Some(uuids)) = device.uuids().await
      && uuids.iter().any(|uuid| APPLE_SERVICES.contains(uuid))
   {
      debug!("{}: recognized via Apple service UUID", device.address());
      return true;
   }

   if let Ok(Some(mut name)) = device.name().await {
      name.make_ascii_lowercase();
      if DEVICE_NAME_PATTERNS
         .iter()
         .any(|pattern| name.contains(pattern))
      {
         debug!("{}: recognized via name pattern", device.address());
         return true;
      }
   }

   false
}
