//! AAP protocol definitions and data structures.
//!
//! Nothing on this channel is published by the vendor; every packet layout
//! here is empirically derived. The outgoing literals below must be emitted
//! byte-exact, since the firmware silently drops anything it does not
//! expect.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Initial handshake, sent once immediately after the transport opens.
pub const PKT_HANDSHAKE: &[u8] = &[
   0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Subscribes to battery status notifications.
pub const PKT_ENABLE_BATTERY_NOTIFICATIONS: &[u8] =
   &[0x04, 0x00, 0x04, 0x00, 0x0f, 0x00, 0xff, 0xff, 0xff, 0xff];

/// Enables the extended feature set.
pub const PKT_ENABLE_SPECIAL_FEATURES: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x4d, 0x00, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Requests the proximity-pairing encryption keys.
pub const PKT_REQUEST_PROXIMITY_KEYS: &[u8] = &[0x04, 0x00, 0x04, 0x00, 0x30, 0x00, 0x05, 0x00];

/// Header of a battery status notification; the record count follows.
pub const HDR_BATTERY_STATE: &[u8] = b"\x04\x00\x04\x00\x04\x00";

/// Key responses carry this marker at octet 4.
pub const KEY_PACKET_MARKER: u8 = 0x31;

/// Battery-bearing components of the device.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
pub enum Component {
   Right = 0x02,
   Left = 0x04,
   Case = 0x08,
}

/// Charging status reported per component.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
pub enum BatteryStatus {
   Unknown = 0x00,
   Charging = 0x01,
   Discharging = 0x02,
   Disconnected = 0x04,
}

/// Battery reading for a single component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Battery {
   pub component: Component,
   /// Exact percentage, 0..=100.
   pub level: u8,
   pub status: BatteryStatus,
}

impl Battery {
   pub fn is_charging(&self) -> bool {
      self.status == BatteryStatus::Charging
   }
}

/// Battery readings for every component reported in one notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryInfo {
   pub left: Option<Battery>,
   pub right: Option<Battery>,
   pub case: Option<Battery>,
}

impl BatteryInfo {
   pub fn insert(&mut self, battery: Battery) {
      match battery.component {
         Component::Left => self.left = Some(battery),
         Component::Right => self.right = Some(battery),
         Component::Case => self.case = Some(battery),
      }
   }

   pub fn to_json(self) -> serde_json::Value {
      let field = |battery: Option<Battery>| {
         battery.map(|b| {
            json!({
                "level": u32::from(b.level),
                "status": b.status.to_string(),
            })
         })
      };
      json!({
          "left": field(self.left),
          "right": field(self.right),
          "case": field(self.case),
      })
   }
}

impl fmt::Display for BatteryInfo {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut separator = "";
      for battery in [self.left, self.right, self.case].into_iter().flatten() {
         write!(
            f,
            "{separator}{}: {}% ({})",
            battery.component, battery.level, battery.status
         )?;
         separator = ", ";
      }
      Ok(())
   }
}

/// Kinds of proximity-pairing keys the device can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
   /// Identity Resolving Key. Resolves randomized addresses at the LE
   /// layer; never used for payload decryption here.
   Irk,
   /// The key that decrypts the advertisement suffix.
   EncKey,
   /// Preserved but unused.
   Other(u8),
}

impl From<u8> for KeyKind {
   fn from(code: u8) -> Self {
      match code {
         0x01 => Self::Irk,
         0x04 => Self::EncKey,
         other => Self::Other(other),
      }
   }
}

impl KeyKind {
   pub const fn code(self) -> u8 {
      match self {
         Self::Irk => 0x01,
         Self::EncKey => 0x04,
         Self::Other(code) => code,
      }
   }
}

impl fmt::Display for KeyKind {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Irk => f.write_str("IRK"),
         Self::EncKey => f.write_str("ENC_KEY"),
         Self::Other(code) => write!(f, "UNKNOWN (0x{code:02X})"),
      }
   }
}

/// A single key record from a key response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProximityKey {
   pub kind: KeyKind,
   /// Key material, typically 16 octets.
   pub bytes: Vec<u8>,
}

/// Returns the ENC_KEY bytes from a key list, if present.
pub fn find_encryption_key(keys: &[ProximityKey]) -> Option<&[u8]> {
   keys.iter()
      .find(|key| key.kind == KeyKind::EncKey)
      .map(|key| key.bytes.as_slice())
}

/// Returns the IRK bytes from a key list, if present.
pub fn find_irk(keys: &[ProximityKey]) -> Option<&[u8]> {
   keys.iter()
      .find(|key| key.kind == KeyKind::Irk)
      .map(|key| key.bytes.as_slice())
}
