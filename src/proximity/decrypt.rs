//! AES decryption of the proximity advertisement suffix.
//!
//! The last 16 octets of a long-form proximity payload are a single AES-128
//! block encrypted with the device's proximity-pairing key (ENC_KEY). There
//! is no mode context, no IV and no padding. Two structural constraints on
//! the plaintext distinguish a correct key from random cipher output: the
//! upper nibble of byte 0 is zero and byte 4 is a fixed marker. That is 12
//! bits of validation, a ~1/4096 false-positive rate per wrong key, which
//! is what makes key-trial device identification workable.

use aes::{
   Aes128,
   cipher::{BlockDecrypt, KeyInit, generic_array::GenericArray},
};

use super::parser::ProximityError;

/// Marker at byte 4 of every correctly decrypted block.
const VALIDATION_MARKER: u8 = 0x2d;

/// Decrypts and validates one encrypted advertisement suffix.
///
/// Returns [`ProximityError::ValidationFailed`] when the plaintext does not
/// satisfy the structural constraints, which is the expected outcome of
/// trying a key that belongs to a different device. Both inputs must be
/// exactly one AES block.
pub fn decrypt_suffix(encrypted: &[u8], key: &[u8]) -> Result<[u8; 16], ProximityError> {
   if encrypted.len() != 16 {
      return Err(ProximityError::LengthMismatch {
         actual: encrypted.len(),
      });
   }
   if key.len() != 16 {
      return Err(ProximityError::LengthMismatch { actual: key.len() });
   }

   let cipher = Aes128::new(GenericArray::from_slice(key));
   let mut block = [0u8; 16];
   block.copy_from_slice(encrypted);
   cipher.decrypt_block(GenericArray::from_mut_slice(&mut block));

   if block[0] & 0xf0 != 0 || block[4] != VALIDATION_MARKER {
      return Err(ProximityError::ValidationFailed);
   }

   Ok(block)
}

/// Splits a decrypted battery byte into its charging flag and level.
///
/// Bit 7 is the charging flag; the low seven bits are the percentage. The
/// firmware reports values above 100 for absent components; those decode to
/// `None`.
pub const fn split_level_byte(byte: u8) -> (bool, Option<u8>) {
   let level = byte & 0x7f;
   let charging = byte & 0x80 != 0;
   if level <= 100 {
      (charging, Some(level))
   } else {
      (charging, None)
   }
}
