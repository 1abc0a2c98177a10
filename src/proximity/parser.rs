//! Parsing of Apple Continuity proximity-pairing advertisements.
//!
//! `AirPods` continuously broadcast a manufacturer-data payload (company ID
//! 0x004C, message type 0x07) carrying battery, charging, in-ear and case
//! state at roughly 10% precision, without any connection. The last 16
//! octets of the long-form payload are AES-encrypted; once the device's
//! encryption key is known, [`ProximityRecord::merge_decrypted`] upgrades
//! the battery fields to 1% precision.
//!
//! The device designates one pod as primary and the payload is laid out
//! from the primary pod's point of view: when the right pod is primary the
//! battery nibbles, charging bits and (depending on case state) in-ear bits
//! are swapped so that "left" and "right" here always mean the physical
//! pods.

use std::fmt;

use smol_str::{SmolStr, format_smolstr};
use thiserror::Error;

use crate::bluetooth::l2cap::Packet;

/// Proximity-pairing message type in Apple manufacturer data.
const PROXIMITY_TYPE: u8 = 0x07;
/// Fixed first octet of the proximity payload.
const PAYLOAD_PREFIX: u8 = 0x01;
/// Minimum payload length after the two-octet header.
const MIN_PAYLOAD_LEN: usize = 10;
/// Payload length from which a 16-octet encrypted suffix is present.
const ENCRYPTED_MIN_PAYLOAD_LEN: usize = 25;

/// Error type for the proximity codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProximityError {
   /// Input shorter than the fixed header, or payload below the minimum
   #[error("Advertisement too short: {actual} bytes")]
   MalformedTooShort { actual: usize },

   /// First octet is not the proximity-pairing message type
   #[error("Not a proximity pairing message (type 0x{found:02x})")]
   NotProximityType { found: u8 },

   /// Declared payload length exceeds the buffer
   #[error("Incomplete advertisement: declared {declared} bytes, got {actual}")]
   IncompleteLength { declared: usize, actual: usize },

   /// Payload does not start with the fixed prefix octet
   #[error("Invalid payload prefix 0x{found:02x}")]
   BadPrefix { found: u8 },

   /// Decryption input is not exactly one AES block
   #[error("Length mismatch: expected 16 bytes, got {actual}")]
   LengthMismatch { actual: usize },

   /// Decrypted block failed the structural sanity check (wrong key)
   #[error("Decryption validation failed: incorrect encryption key")]
   ValidationFailed,
}

/// Parsed proximity-pairing advertisement.
///
/// Battery levels are `None` when the device did not report them. Until
/// [`merge_decrypted`](Self::merge_decrypted) has been applied the levels
/// come from 4-bit nibbles (10% steps); afterwards they are exact
/// percentages and [`decrypted_applied`](Self::decrypted_applied) is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProximityRecord {
   pub device_model: u16,
   /// Raw status octet, kept for diagnostics.
   pub status_raw: u8,
   pub primary_is_left: bool,
   pub in_case_flag: bool,
   pub is_flipped: bool,
   pub left_battery: Option<u8>,
   pub right_battery: Option<u8>,
   pub case_battery: Option<u8>,
   pub left_charging: bool,
   pub right_charging: bool,
   pub case_charging: bool,
   pub left_in_ear: bool,
   pub right_in_ear: bool,
   pub lid_open: bool,
   pub color_code: u8,
   pub connection_state: u8,
   /// Payload after the two-octet header, kept for diagnostics and for the
   /// encrypted suffix.
   pub raw_payload: Packet,
   pub decrypted_applied: bool,
   pub raw_decrypted: Option<[u8; 16]>,
}

/// Cheap framing check used by the scanner before full parsing.
pub fn is_proximity_payload(data: &[u8]) -> bool {
   data.len() >= 2 && data[0] == PROXIMITY_TYPE && data.len() >= 2 + data[1] as usize
}

/// Parses an Apple Continuity proximity-pairing advertisement.
///
/// `data` is the manufacturer-data payload for company ID 0x004C, starting
/// at the message-type octet. All failures are non-fatal framing errors;
/// the caller drops the sample and moves on.
pub fn parse_advertisement(data: &[u8]) -> Result<ProximityRecord, ProximityError> {
   if data.len() < 2 {
      return Err(ProximityError::MalformedTooShort { actual: data.len() });
   }
   if data[0] != PROXIMITY_TYPE {
      return Err(ProximityError::NotProximityType { found: data[0] });
   }

   let declared = data[1] as usize;
   if data.len() < 2 + declared {
      return Err(ProximityError::IncompleteLength {
         declared,
         actual: data.len() - 2,
      });
   }

   let payload = &data[2..2 + declared];
   if payload.len() < MIN_PAYLOAD_LEN {
      return Err(ProximityError::MalformedTooShort { actual: data.len() });
   }
   if payload[0] != PAYLOAD_PREFIX {
      return Err(ProximityError::BadPrefix { found: payload[0] });
   }

   let status = payload[3];
   let primary_is_left = status & 0x20 != 0;
   let in_case_flag = status & 0x40 != 0;
   let is_flipped = !primary_is_left;
   // Which physical pod produced the advertisement when one pod sits in the
   // case; controls the in-ear swap only. Retained verbatim from the
   // reverse-engineered derivation.
   let xor_factor = primary_is_left != in_case_flag;

   let battery = payload[4];
   let (left_nibble, right_nibble) = if is_flipped {
      (battery & 0x0f, battery >> 4)
   } else {
      (battery >> 4, battery & 0x0f)
   };

   // | 0 | 1 | 2 | 3 | 4..7          |
   // | ? | C | R | L | case battery  |
   let charging = payload[5];
   let case_charging = charging & 0x40 != 0;
   let mut right_charging = charging & 0x20 != 0;
   let mut left_charging = charging & 0x10 != 0;
   if is_flipped {
      std::mem::swap(&mut left_charging, &mut right_charging);
   }

   let mut left_in_ear = status & 0x08 != 0;
   let mut right_in_ear = status & 0x02 != 0;
   if xor_factor {
      std::mem::swap(&mut left_in_ear, &mut right_in_ear);
   }

   Ok(ProximityRecord {
      device_model: u16::from(payload[1]) << 8 | u16::from(payload[2]),
      status_raw: status,
      primary_is_left,
      in_case_flag,
      is_flipped,
      left_battery: decode_battery_nibble(left_nibble),
      right_battery: decode_battery_nibble(right_nibble),
      case_battery: decode_battery_nibble(charging & 0x0f),
      left_charging,
      right_charging,
      case_charging,
      left_in_ear,
      right_in_ear,
      lid_open: (payload[8] >> 3) & 1 == 0,
      color_code: payload[7],
      connection_state: payload[9],
      raw_payload: Packet::from_slice(payload),
      decrypted_applied: false,
      raw_decrypted: None,
   })
}

/// Decodes a 4-bit battery level.
///
/// `0x0..=0x9` are 10% steps, `0xA..=0xE` report full, `0xF` is unknown.
pub const fn decode_battery_nibble(nibble: u8) -> Option<u8> {
   match nibble {
      0x0..=0x9 => Some(nibble * 10),
      0xa..=0xe => Some(100),
      _ => None,
   }
}

impl ProximityRecord {
   /// The 16-octet encrypted suffix, present on long-form advertisements.
   pub fn encrypted_suffix(&self) -> Option<&[u8]> {
      if self.raw_payload.len() >= ENCRYPTED_MIN_PAYLOAD_LEN {
         Some(&self.raw_payload[self.raw_payload.len() - 16..])
      } else {
         None
      }
   }

   /// Merges a decrypted suffix block into the record, replacing the nibble
   /// battery values with exact percentages.
   ///
   /// Byte 1 of the block carries the primary pod, byte 2 the secondary and
   /// byte 3 the case; which physical pod is primary follows `is_flipped`.
   pub fn merge_decrypted(&mut self, block: [u8; 16]) {
      let (first_charging, first_level) = super::decrypt::split_level_byte(block[1]);
      let (second_charging, second_level) = super::decrypt::split_level_byte(block[2]);
      let (case_charging, case_level) = super::decrypt::split_level_byte(block[3]);

      if self.is_flipped {
         self.left_battery = second_level;
         self.right_battery = first_level;
         self.left_charging = second_charging;
         self.right_charging = first_charging;
      } else {
         self.left_battery = first_level;
         self.right_battery = second_level;
         self.left_charging = first_charging;
         self.right_charging = second_charging;
      }

      self.case_battery = case_level;
      self.case_charging = case_charging;

      self.decrypted_applied = true;
      self.raw_decrypted = Some(block);
   }

   /// Human-readable model name.
   pub fn model_name(&self) -> SmolStr {
      decode_model_name(self.device_model)
   }

   /// Human-readable color name.
   pub fn color_name(&self) -> SmolStr {
      decode_color_name(self.color_code)
   }

   /// Human-readable connection state.
   pub fn connection_state_name(&self) -> SmolStr {
      decode_connection_state_name(self.connection_state)
   }
}

/// Decodes a device model code to a display name.
pub fn decode_model_name(model: u16) -> SmolStr {
   match model {
      0x0220 => SmolStr::new_static("AirPods (2nd gen)"),
      0x0e20 => SmolStr::new_static("AirPods Pro"),
      0x2420 => SmolStr::new_static("AirPods Pro (2nd gen)"),
      0x2720 => SmolStr::new_static("AirPods Pro 3"),
      _ => format_smolstr!("Unknown (0x{model:04X})"),
   }
}

/// Decodes a color code to a display name.
pub fn decode_color_name(color: u8) -> SmolStr {
   let name = match color {
      0x00 => "White",
      0x01 => "Black",
      0x02 => "Red",
      0x03 => "Blue",
      0x04 => "Pink",
      0x05 => "Gray",
      0x06 => "Silver",
      0x07 => "Gold",
      0x08 => "Rose Gold",
      0x09 => "Space Gray",
      0x0a => "Dark Blue",
      0x0b => "Light Blue",
      0x0c => "Yellow",
      _ => return format_smolstr!("Unknown (0x{color:02X})"),
   };
   SmolStr::new_static(name)
}

/// Decodes a connection state octet to a display name.
pub fn decode_connection_state_name(state: u8) -> SmolStr {
   let name = match state {
      0x00 => "Disconnected",
      0x04 => "Idle",
      0x05 => "Music",
      0x06 => "Call",
      0x07 => "Ringing",
      0x09 => "Hanging Up",
      0xff => "Unknown",
      _ => return format_smolstr!("Unknown (0x{state:02X})"),
   };
   SmolStr::new_static(name)
}

impl fmt::Display for ProximityRecord {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let precision = if self.decrypted_applied { "1%" } else { "~10%" };
      writeln!(
         f,
         "{} ({}, {} precision)",
         self.model_name(),
         self.color_name(),
         precision
      )?;

      for (label, level, charging, in_ear) in [
         ("Left: ", self.left_battery, self.left_charging, self.left_in_ear),
         ("Right:", self.right_battery, self.right_charging, self.right_in_ear),
      ] {
         write!(f, "  {label} ")?;
         match level {
            Some(level) => {
               write!(f, "{level}%")?;
               if charging {
                  write!(f, " (charging)")?;
               }
               if in_ear {
                  write!(f, " [in ear]")?;
               }
            },
            None => write!(f, "unknown")?,
         }
         writeln!(f)?;
      }

      write!(f, "  Case:  ")?;
      match self.case_battery {
         Some(level) => {
            write!(f, "{level}%")?;
            if self.case_charging {
               write!(f, " (charging)")?;
            }
         },
         None => write!(f, "unknown")?,
      }
      writeln!(f)?;

      writeln!(f, "  Lid:   {}", if self.lid_open { "open" } else { "closed" })?;
      write!(
         f,
         "  Primary: {} pod",
         if self.is_flipped { "right" } else { "left" }
      )
   }
}
