//! Proximity-pairing advertisement codec: framing, field extraction and
//! suffix decryption.

pub mod decrypt;
pub mod parser;

pub use decrypt::{decrypt_suffix, split_level_byte};
pub use parser::{
   ProximityError, ProximityRecord, decode_battery_nibble, decode_color_name,
   decode_connection_state_name, decode_model_name, is_proximity_payload, parse_advertisement,
};
