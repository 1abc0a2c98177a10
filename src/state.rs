//! Unified per-device state, independent of which branch produced it.

use bluer::Address;
use serde_json::json;
use smol_str::SmolStr;

use crate::{
   aap::protocol::{Battery, BatteryInfo},
   bluetooth::l2cap::Packet,
   proximity::ProximityRecord,
};

/// Where a state snapshot originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Source {
   /// Passive advertisement ingestion; battery in 10% steps unless the
   /// encrypted suffix was decrypted.
   #[strum(serialize = "BLE")]
   Ble,
   /// Active accessory-protocol session; battery at 1% precision.
   #[strum(serialize = "AAP")]
   Aap,
}

/// Which pod the device designates as primary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
pub enum PodSide {
   Left,
   Right,
   #[default]
   Unknown,
}

/// A 16-octet proximity-pairing encryption key.
pub type EncryptionKey = [u8; 16];

/// Complete state of one device, the unit of subscriber fan-out.
///
/// Missing fields mean "unknown", never zero; the AAP branch for instance
/// reports batteries only, leaving in-ear, lid, model, color and
/// orientation at their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodState {
   pub source: Source,

   pub left_battery: Option<u8>,
   pub right_battery: Option<u8>,
   pub case_battery: Option<u8>,

   pub left_charging: bool,
   pub right_charging: bool,
   pub case_charging: bool,

   pub left_in_ear: bool,
   pub right_in_ear: bool,
   pub lid_open: bool,

   pub device_model: u16,
   pub model_name: SmolStr,
   pub color: u8,
   pub primary_pod: PodSide,

   /// The device's permanent Bluetooth address; the canonical identifier.
   pub real_mac: Address,
   /// The (possibly randomized) address the advertisement was observed
   /// under. `None` for AAP-sourced state.
   pub current_ble_mac: Option<Address>,

   pub encryption_key: Option<EncryptionKey>,
   /// The payload this state was built from, for diagnostics.
   pub raw_source_bytes: Packet,
}

/// Clamps a reported battery level to the valid range.
///
/// Sources occasionally report sentinel values above 100 for absent
/// components; those decode to `None`.
pub const fn normalize_level(level: u8) -> Option<u8> {
   if level <= 100 { Some(level) } else { None }
}

fn battery_fields(battery: Option<Battery>) -> (Option<u8>, bool) {
   match battery {
      Some(battery) => (normalize_level(battery.level), battery.is_charging()),
      None => (None, false),
   }
}

impl PodState {
   /// Builds a state snapshot from a parsed BLE advertisement.
   pub fn from_ble(
      record: &ProximityRecord,
      real_mac: Address,
      observed_mac: Address,
      encryption_key: Option<EncryptionKey>,
   ) -> Self {
      Self {
         source: Source::Ble,
         left_battery: record.left_battery.and_then(normalize_level),
         right_battery: record.right_battery.and_then(normalize_level),
         case_battery: record.case_battery.and_then(normalize_level),
         left_charging: record.left_charging,
         right_charging: record.right_charging,
         case_charging: record.case_charging,
         left_in_ear: record.left_in_ear,
         right_in_ear: record.right_in_ear,
         lid_open: record.lid_open,
         device_model: record.device_model,
         model_name: record.model_name(),
         color: record.color_code,
         primary_pod: if record.is_flipped {
            PodSide::Right
         } else {
            PodSide::Left
         },
         real_mac,
         current_ble_mac: Some(observed_mac),
         encryption_key,
         raw_source_bytes: record.raw_payload.clone(),
      }
   }

   /// Builds a state snapshot from an AAP battery notification.
   pub fn from_aap(
      info: &BatteryInfo,
      raw: Packet,
      mac: Address,
      encryption_key: Option<EncryptionKey>,
   ) -> Self {
      let (left_battery, left_charging) = battery_fields(info.left);
      let (right_battery, right_charging) = battery_fields(info.right);
      let (case_battery, case_charging) = battery_fields(info.case);

      Self {
         source: Source::Aap,
         left_battery,
         right_battery,
         case_battery,
         left_charging,
         right_charging,
         case_charging,
         left_in_ear: false,
         right_in_ear: false,
         lid_open: false,
         device_model: 0,
         model_name: SmolStr::default(),
         color: 0,
         primary_pod: PodSide::Unknown,
         real_mac: mac,
         current_ble_mac: None,
         encryption_key,
         raw_source_bytes: raw,
      }
   }

   /// Whether any battery level is known.
   pub fn has_battery_data(&self) -> bool {
      self.left_battery.is_some() || self.right_battery.is_some() || self.case_battery.is_some()
   }

   /// The lowest known battery level, if any.
   pub fn lowest_battery(&self) -> Option<u8> {
      [self.left_battery, self.right_battery, self.case_battery]
         .into_iter()
         .flatten()
         .min()
   }

   /// JSON representation for subscribers that forward snapshots over IPC.
   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "source": self.source.to_string(),
          "real_mac": self.real_mac.to_string(),
          "ble_mac": self.current_ble_mac.map(|mac| mac.to_string()),
          "model": self.model_name.as_str(),
          "model_code": self.device_model,
          "color": self.color,
          "primary_pod": self.primary_pod.to_string(),
          "left_level": self.left_battery,
          "right_level": self.right_battery,
          "case_level": self.case_battery,
          "left_charging": self.left_charging,
          "right_charging": self.right_charging,
          "case_charging": self.case_charging,
          "left_in_ear": self.left_in_ear,
          "right_in_ear": self.right_in_ear,
          "lid_open": self.lid_open,
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::aap::protocol::{BatteryStatus, Component};

   fn battery(component: Component, level: u8, status: BatteryStatus) -> Battery {
      Battery {
         component,
         level,
         status,
      }
   }

   #[test]
   fn normalizes_out_of_range_levels() {
      assert_eq!(normalize_level(0), Some(0));
      assert_eq!(normalize_level(100), Some(100));
      assert_eq!(normalize_level(101), None);
      assert_eq!(normalize_level(255), None);
   }

   #[test]
   fn aap_state_reports_batteries_only() {
      let mac: Address = "11:22:33:44:55:66".parse().unwrap();
      let info = BatteryInfo {
         left: Some(battery(Component::Left, 88, BatteryStatus::Charging)),
         right: Some(battery(Component::Right, 120, BatteryStatus::Discharging)),
         case: None,
      };

      let state = PodState::from_aap(&info, Packet::new(), mac, None);
      assert_eq!(state.source, Source::Aap);
      assert_eq!(state.real_mac, mac);
      assert_eq!(state.current_ble_mac, None);
      assert_eq!(state.left_battery, Some(88));
      assert!(state.left_charging);
      // 120% is the firmware's way of saying "not there"
      assert_eq!(state.right_battery, None);
      assert_eq!(state.case_battery, None);
      assert_eq!(state.primary_pod, PodSide::Unknown);
      assert!(!state.left_in_ear && !state.right_in_ear && !state.lid_open);
   }

   #[test]
   fn lowest_battery_ignores_unknowns() {
      let mac: Address = "11:22:33:44:55:66".parse().unwrap();
      let mut state = PodState::from_aap(&BatteryInfo::default(), Packet::new(), mac, None);
      assert!(!state.has_battery_data());
      assert_eq!(state.lowest_battery(), None);

      state.left_battery = Some(40);
      state.case_battery = Some(15);
      assert!(state.has_battery_data());
      assert_eq!(state.lowest_battery(), Some(15));
   }
}
