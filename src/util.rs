//! Utility functions for internal use by other components of the crate.

// Uses
use crate::error::ParseError;

// Constants
pub const BYTES_PER_16_BITS: usize = 2;
pub const BYTES_PER_32_BITS: usize = 4;
pub const BYTES_PER_64_BITS: usize = 8;
const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Converts a byte slice to its uppercase hex representation.
pub fn to_hex_str(bytes: &[u8]) -> String {
	let mut hex_str = String::with_capacity(bytes.len() * 2);
	for byte in bytes {
		hex_str.push(HEX_DIGITS[usize::from(byte >> 4)] as char);
		hex_str.push(HEX_DIGITS[usize::from(byte & 0x0F)] as char);
	}

	hex_str
}

/// Parses a hex string into raw bytes.
///
/// The string must have an even number of characters and contain only hex
/// digits. A leading `0x` is tolerated.
pub fn parse_hex_str(hex_str: &str) -> Result<Vec<u8>, ParseError> {
	let trimmed_str = hex_str.trim_start_matches("0x");
	if trimmed_str.len() % 2 != 0 {
		return Err(ParseError::InvalidNumber);
	}

	let mut bytes = Vec::with_capacity(trimmed_str.len() / 2);
	for index in (0..trimmed_str.len()).step_by(2) {
		let byte_str = trimmed_str
			.get(index..(index + 2))
			.ok_or(ParseError::InvalidNumber)?;
		bytes.push(u8::from_str_radix(byte_str, 16).map_err(|_| ParseError::InvalidNumber)?);
	}

	Ok(bytes)
}

/// Converts a big-endian byte slice into a raw integer, of size `u16`.
///
/// Slices longer than 2 bytes keep only the trailing bytes' worth of
/// precision.
pub fn byte_slice_to_u16(bytes: &[u8]) -> u16 {
	let mut result = 0;
	for byte in bytes.iter().take(BYTES_PER_16_BITS) {
		result = (result << 8) | u16::from(*byte);
	}

	result
}

/// Converts a big-endian byte slice into a raw integer, of size `u32`.
pub fn byte_slice_to_u32(bytes: &[u8]) -> u32 {
	let mut result = 0;
	for byte in bytes.iter().take(BYTES_PER_32_BITS) {
		result = (result << 8) | u32::from(*byte);
	}

	result
}

/// Converts a big-endian byte slice into a raw integer, of size `u64`.
pub fn byte_slice_to_u64(bytes: &[u8]) -> u64 {
	let mut result = 0;
	for byte in bytes.iter().take(BYTES_PER_64_BITS) {
		result = (result << 8) | u64::from(*byte);
	}

	result
}

/// Converts a big-endian two's-complement byte slice into a signed integer.
///
/// Used for stored-value amounts and balances, which come off the card as 2
/// or 3 byte signed quantities.
pub fn byte_slice_to_i32(bytes: &[u8]) -> i32 {
	if bytes.is_empty() {
		return 0;
	}

	let mut result = if bytes[0] & 0x80 > 0 { -1 } else { 0 };
	for byte in bytes.iter().take(BYTES_PER_32_BITS) {
		result = (result << 8) | i32::from(*byte);
	}

	result
}

/// Writes the `byte_count` low bytes of `value` into a big-endian byte
/// vector.
pub fn u32_to_byte_vec(value: u32, byte_count: usize) -> Vec<u8> {
	let mut bytes = Vec::with_capacity(byte_count);
	for index in (0..byte_count).rev() {
		bytes.push((value >> (index * 8)) as u8);
	}

	bytes
}

/// Writes a signed value as its `byte_count`-byte two's-complement big-endian
/// representation.
pub fn i32_to_byte_vec(value: i32, byte_count: usize) -> Vec<u8> {
	u32_to_byte_vec(value as u32, byte_count)
}

// Unit Tests
#[cfg(test)]
mod tests {
	// Uses
	use super::{
		byte_slice_to_i32,
		byte_slice_to_u16,
		byte_slice_to_u32,
		i32_to_byte_vec,
		parse_hex_str,
		to_hex_str,
		u32_to_byte_vec,
	};
	use crate::error::ParseError;

	// Tests
	/// Ensures `hex(bytes(s)) == s` for uppercase hex inputs of even length.
	#[test]
	fn hex_round_trip() {
		for hex_str in ["", "00", "3B8F8001", "DEADBEEF", "0123456789ABCDEF"] {
			let bytes = parse_hex_str(hex_str).expect("the inputs are valid hex");
			assert_eq!(hex_str, to_hex_str(bytes.as_slice()));
		}
	}

	/// Ensures odd-length and non-hex inputs are rejected.
	#[test]
	fn invalid_hex_is_rejected() {
		for hex_str in ["0", "123", "GG", "0x0F0"] {
			assert_eq!(Err(ParseError::InvalidNumber), parse_hex_str(hex_str));
		}
	}

	/// Ensures a leading `0x` is tolerated.
	#[test]
	fn hex_prefix_is_tolerated() {
		assert_eq!(
			vec![0x90, 0x00],
			parse_hex_str("0x9000").expect("the input is valid hex")
		);
	}

	#[test]
	fn byte_slices_to_integers() {
		assert_eq!(0x9000, byte_slice_to_u16(&[0x90, 0x00]));
		assert_eq!(0x0001_0203, byte_slice_to_u32(&[0x01, 0x02, 0x03]));
		assert_eq!(0x00FF_FFFF, byte_slice_to_u32(&[0xFF, 0xFF, 0xFF]));
	}

	/// Ensures sign extension works on 2 and 3 byte negative quantities.
	#[test]
	fn signed_byte_slices() {
		assert_eq!(-1, byte_slice_to_i32(&[0xFF, 0xFF]));
		assert_eq!(-256, byte_slice_to_i32(&[0xFF, 0x00]));
		assert_eq!(-1, byte_slice_to_i32(&[0xFF, 0xFF, 0xFF]));
		assert_eq!(8_388_607, byte_slice_to_i32(&[0x7F, 0xFF, 0xFF]));
		assert_eq!(100, byte_slice_to_i32(&[0x00, 0x64]));
	}

	#[test]
	fn integers_to_byte_vecs() {
		assert_eq!(vec![0x01, 0x02, 0x03], u32_to_byte_vec(0x0001_0203, 3));
		assert_eq!(vec![0xFF, 0xFF], i32_to_byte_vec(-1, 2));
		assert_eq!(vec![0x00, 0x64], i32_to_byte_vec(100, 2));
	}
}
