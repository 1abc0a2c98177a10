//! Packet classification and parsing for the AAP channel.
//!
//! The transport delivers whole messages; the functions here operate
//! octet-wise on each. Between the packets anything cares about, the
//! firmware emits a steady stream of unknown status messages; the
//! classifiers return `false` for those and the read loop drops them.

use log::warn;
use thiserror::Error;

use super::protocol::{
   Battery, BatteryInfo, BatteryStatus, Component, HDR_BATTERY_STATE, KEY_PACKET_MARKER, KeyKind,
   ProximityKey,
};

/// Error type for AAP packet parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AapError {
   #[error("Not a {expected} packet")]
   WrongPacketType { expected: &'static str },

   #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
   PacketTooShort { expected: usize, actual: usize },

   /// A battery record extends past the end of the packet
   #[error("Incomplete battery packet: record {index} extends past {len} bytes")]
   IncompleteBatteryPacket { index: usize, len: usize },

   /// Declared key count above anything a real device sends
   #[error("Suspicious key count: {count}")]
   SuspiciousKeyCount { count: u8 },

   /// A key record is cut off before its declared length
   #[error("Truncated key record {index}")]
   TruncatedKey { index: usize },
}

/// Size of one record in a battery status packet.
const BATTERY_RECORD_LEN: usize = 5;
/// Shortest classifiable packet: header plus count octet.
const MIN_PACKET_LEN: usize = 7;
/// Upper bound on the key count a response may declare.
const MAX_KEY_COUNT: u8 = 10;

/// Checks whether a packet is a battery status notification.
pub fn is_battery_packet(packet: &[u8]) -> bool {
   packet.len() >= MIN_PACKET_LEN && packet.starts_with(HDR_BATTERY_STATE)
}

/// Checks whether a packet is a proximity key response.
pub fn is_key_packet(packet: &[u8]) -> bool {
   packet.len() >= MIN_PACKET_LEN && packet[4] == KEY_PACKET_MARKER
}

/// Parses a battery status notification.
///
/// The count octet is followed by 5-octet records of
/// `[component, 01, level, status, 01]`. Unknown component codes are
/// skipped so newer firmware degrades gracefully; a record running past the
/// end of the packet is an error.
pub fn parse_battery_status(packet: &[u8]) -> Result<BatteryInfo, AapError> {
   if packet.len() < MIN_PACKET_LEN {
      return Err(AapError::PacketTooShort {
         expected: MIN_PACKET_LEN,
         actual: packet.len(),
      });
   }
   if !packet.starts_with(HDR_BATTERY_STATE) {
      return Err(AapError::WrongPacketType {
         expected: "battery status",
      });
   }

   let count = packet[6] as usize;
   let mut info = BatteryInfo::default();

   for index in 0..count {
      let offset = MIN_PACKET_LEN + index * BATTERY_RECORD_LEN;
      let Some(record) = packet.get(offset..offset + BATTERY_RECORD_LEN) else {
         return Err(AapError::IncompleteBatteryPacket {
            index,
            len: packet.len(),
         });
      };

      let Some(component) = Component::from_repr(record[0]) else {
         warn!("Skipping unknown battery component 0x{:02x}", record[0]);
         continue;
      };
      let status = BatteryStatus::from_repr(record[3]).unwrap_or_else(|| {
         warn!("Unknown battery status 0x{:02x} for {component}", record[3]);
         BatteryStatus::Unknown
      });

      info.insert(Battery {
         component,
         level: record[2],
         status,
      });
   }

   Ok(info)
}

/// Parses a proximity key response.
///
/// After the count octet, each key is a `[type, _, length, _, bytes…]`
/// record consuming `4 + length` octets. Unrecognized key types are
/// preserved as [`KeyKind::Other`].
pub fn parse_proximity_keys(packet: &[u8]) -> Result<Vec<ProximityKey>, AapError> {
   if packet.len() < MIN_PACKET_LEN {
      return Err(AapError::PacketTooShort {
         expected: MIN_PACKET_LEN,
         actual: packet.len(),
      });
   }
   if packet[4] != KEY_PACKET_MARKER {
      return Err(AapError::WrongPacketType {
         expected: "proximity key",
      });
   }

   let count = packet[6];
   if count > MAX_KEY_COUNT {
      return Err(AapError::SuspiciousKeyCount { count });
   }

   let mut keys = Vec::with_capacity(count as usize);
   let mut offset = MIN_PACKET_LEN;

   for index in 0..count as usize {
      let Some(header) = packet.get(offset..offset + 4) else {
         return Err(AapError::TruncatedKey { index });
      };
      let kind = KeyKind::from(header[0]);
      let length = header[2] as usize;
      offset += 4;

      let Some(bytes) = packet.get(offset..offset + length) else {
         return Err(AapError::TruncatedKey { index });
      };
      keys.push(ProximityKey {
         kind,
         bytes: bytes.to_vec(),
      });
      offset += length;
   }

   Ok(keys)
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::aap::protocol::{find_encryption_key, find_irk};

   /// Left at 90% discharging, Right at 50% discharging, Case at 70%
   /// charging.
   const BATTERY_PACKET: &[u8] = &[
      0x04, 0x00, 0x04, 0x00, 0x04, 0x00, 0x03, 0x04, 0x01, 0x5a, 0x02, 0x01, 0x02, 0x01, 0x32,
      0x02, 0x01, 0x08, 0x01, 0x46, 0x01, 0x01,
   ];

   fn key_packet(records: &[(u8, &[u8])]) -> Vec<u8> {
      let mut packet = vec![0x04, 0x00, 0x04, 0x00, 0x31, 0x00, records.len() as u8];
      for (kind, bytes) in records {
         packet.extend_from_slice(&[*kind, 0x00, bytes.len() as u8, 0x00]);
         packet.extend_from_slice(bytes);
      }
      packet
   }

   #[test]
   fn classifiers_reject_short_packets() {
      for len in 0..7 {
         let packet = vec![0x04; len];
         assert!(!is_battery_packet(&packet));
         assert!(!is_key_packet(&packet));
      }
   }

   #[test]
   fn classifies_and_parses_battery_packet() {
      assert!(is_battery_packet(BATTERY_PACKET));
      assert!(!is_key_packet(BATTERY_PACKET));

      let info = parse_battery_status(BATTERY_PACKET).unwrap();
      let left = info.left.unwrap();
      assert_eq!(left.level, 90);
      assert_eq!(left.status, BatteryStatus::Discharging);
      assert!(!left.is_charging());

      let right = info.right.unwrap();
      assert_eq!(right.level, 50);
      assert_eq!(right.status, BatteryStatus::Discharging);

      let case = info.case.unwrap();
      assert_eq!(case.level, 70);
      assert_eq!(case.status, BatteryStatus::Charging);
      assert!(case.is_charging());
   }

   #[test]
   fn battery_parse_rejects_other_packet_types() {
      let packet = [0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x01];
      assert_eq!(
         parse_battery_status(&packet),
         Err(AapError::WrongPacketType {
            expected: "battery status"
         })
      );
   }

   #[test]
   fn battery_parse_skips_unknown_components() {
      let packet = [
         0x04, 0x00, 0x04, 0x00, 0x04, 0x00, 0x02, //
         0x20, 0x01, 0x63, 0x01, 0x01, // unknown component 0x20
         0x04, 0x01, 0x41, 0x01, 0x01, // left at 65%
      ];
      let info = parse_battery_status(&packet).unwrap();
      assert_eq!(info.left.unwrap().level, 65);
      assert!(info.right.is_none());
      assert!(info.case.is_none());
   }

   #[test]
   fn battery_parse_detects_truncated_records() {
      let packet = [0x04, 0x00, 0x04, 0x00, 0x04, 0x00, 0x02, 0x04, 0x01, 0x5a, 0x02, 0x01];
      assert_eq!(
         parse_battery_status(&packet),
         Err(AapError::IncompleteBatteryPacket {
            index: 1,
            len: packet.len()
         })
      );
   }

   #[test]
   fn battery_parse_tolerates_trailing_padding() {
      let mut packet = BATTERY_PACKET.to_vec();
      packet.extend_from_slice(&[0x00, 0x00]);
      assert!(parse_battery_status(&packet).unwrap().case.is_some());
   }

   #[test]
   fn parses_key_response_with_both_keys() {
      let irk = [0x11u8; 16];
      let enc = [0x22u8; 16];
      let packet = key_packet(&[(0x01, &irk), (0x04, &enc)]);

      assert!(is_key_packet(&packet));
      let keys = parse_proximity_keys(&packet).unwrap();
      assert_eq!(keys.len(), 2);
      assert_eq!(keys[0].kind, KeyKind::Irk);
      assert_eq!(keys[1].kind, KeyKind::EncKey);

      assert_eq!(find_irk(&keys), Some(&irk[..]));
      assert_eq!(find_encryption_key(&keys), Some(&enc[..]));
   }

   #[test]
   fn preserves_unrecognized_key_types() {
      let packet = key_packet(&[(0x07, &[0xab, 0xcd])]);
      let keys = parse_proximity_keys(&packet).unwrap();
      assert_eq!(keys[0].kind, KeyKind::Other(0x07));
      assert_eq!(keys[0].kind.code(), 0x07);
      assert_eq!(keys[0].bytes, vec![0xab, 0xcd]);
      assert!(find_encryption_key(&keys).is_none());
   }

   #[test]
   fn empty_key_response_is_benign() {
      let packet = key_packet(&[]);
      assert_eq!(parse_proximity_keys(&packet), Ok(vec![]));
   }

   #[test]
   fn rejects_suspicious_key_count() {
      let mut packet = key_packet(&[]);
      packet[6] = 11;
      assert_eq!(
         parse_proximity_keys(&packet),
         Err(AapError::SuspiciousKeyCount { count: 11 })
      );
   }

   #[test]
   fn rejects_truncated_key_records() {
      // Header cut off
      let mut packet = key_packet(&[]);
      packet[6] = 1;
      packet.extend_from_slice(&[0x04, 0x00]);
      assert_eq!(
         parse_proximity_keys(&packet),
         Err(AapError::TruncatedKey { index: 0 })
      );

      // Data cut off before the declared length
      let full = key_packet(&[(0x04, &[0x55u8; 16])]);
      let cut = &full[..full.len() - 4];
      assert_eq!(
         parse_proximity_keys(cut),
         Err(AapError::TruncatedKey { index: 0 })
      );
   }

   #[test]
   fn key_parse_rejects_other_packet_types() {
      assert_eq!(
         parse_proximity_keys(BATTERY_PACKET),
         Err(AapError::WrongPacketType {
            expected: "proximity key"
         })
      );
   }
}
