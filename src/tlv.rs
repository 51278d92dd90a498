//! BER-TLV decoding for FCI payloads and GET DATA responses.
//!
//! Information for this can be found in ISO/IEC 7816-4, under `Annex D`. The
//! Calypso FCI wraps its proprietary data objects in the standard `6F` / `A5`
//! envelope, so a generic walk is enough for every TLV response the engine
//! consumes.

// Uses
use crate::{
	error::ParseError,
	util::{byte_slice_to_u32, BYTES_PER_32_BITS},
};

/// A decoded TLV node.
///
/// Constructed data objects carry their decoded children; their raw value is
/// kept as well so callers can choose either view.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tlv {
	pub tag: Vec<u8>,
	pub value: Vec<u8>,
	pub children: Vec<Tlv>,
}

impl Tlv {
	/// Whether the tag's first byte marks a constructed data object.
	pub fn is_constructed(&self) -> bool {
		!self.tag.is_empty() && 0b0010_0000 & self.tag[0] > 0
	}
}

/// Parses a block of BER-TLV encoded data into a list of sibling nodes.
///
/// Constructed data objects are decoded recursively. Data that runs past the
/// end of the block is rejected.
pub fn parse(bytes: &[u8]) -> Result<Vec<Tlv>, ParseError> {
	let bytes_len = bytes.len();
	let mut nodes = Vec::new();
	let mut index = 0;
	while index < bytes_len {
		// Skip inter-object padding
		if bytes[index] == 0x00 {
			index += 1;
			continue;
		}

		// The first byte contains some metadata about the tag
		let tag_start_index = index;
		let constructed = 0b0010_0000 & bytes[index] > 0;

		// The tag continues if the last 5 bits of the first byte are all 1
		let mut tag_continues = 0b0001_1111 & bytes[index] == 0b0001_1111;
		while tag_continues {
			index += 1;
			if index >= bytes_len {
				return Err(ParseError::NonCompliant);
			}
			// Subsequent bytes of the tag indicate if another byte follows if
			// the first bit is 1
			tag_continues = 0b1000_0000 & bytes[index] > 0;
		}
		let tag = bytes[tag_start_index..=index].to_vec();
		index += 1;
		if index >= bytes_len {
			return Err(ParseError::NonCompliant);
		}

		// The length is next
		let length_byte_0 = bytes[index];
		let length = if 0b1000_0000 & length_byte_0 > 0 {
			let subsequent_length_byte_count = (0b0111_1111 & length_byte_0) as usize;
			// Lengths greater than the maximum unsigned 32-bit integer value
			// are unsupported
			if subsequent_length_byte_count > BYTES_PER_32_BITS {
				return Err(ParseError::Unsupported);
			}
			let start_index = index;
			index += 1 + subsequent_length_byte_count;
			if index > bytes_len {
				return Err(ParseError::NonCompliant);
			}
			byte_slice_to_u32(
				&bytes[(start_index + 1)..=(start_index + subsequent_length_byte_count)],
			) as usize
		} else {
			index += 1;
			usize::from(length_byte_0)
		};
		if index + length > bytes_len {
			return Err(ParseError::NonCompliant);
		}

		let value = bytes[index..(index + length)].to_vec();
		let children = if constructed {
			parse(value.as_slice())?
		} else {
			Vec::with_capacity(0)
		};

		nodes.push(Tlv {
			tag,
			value,
			children,
		});

		index += length;
	}

	Ok(nodes)
}

/// Finds the first occurrence of `tag` in the node list, depth-first.
///
/// Calypso data objects may sit at any depth inside the `6F` / `A5` envelope
/// and in any order, so lookups ignore both.
pub fn find_first<'a>(nodes: &'a [Tlv], tag: &[u8]) -> Option<&'a Tlv> {
	for node in nodes {
		if node.tag.as_slice() == tag {
			return Some(node);
		}
		if let Some(found) = find_first(node.children.as_slice(), tag) {
			return Some(found);
		}
	}

	None
}

// Unit Tests
#[cfg(test)]
mod tests {
	// Uses
	use super::{find_first, parse};
	use crate::error::ParseError;

	// Tests
	/// Ensures a primitive node is decoded with its tag and value.
	#[test]
	fn primitive_node() {
		let nodes = parse(&[0x84, 0x03, 0xAA, 0xBB, 0xCC]).expect("the data is well-formed");

		assert_eq!(1, nodes.len());
		assert_eq!(vec![0x84], nodes[0].tag);
		assert_eq!(vec![0xAA, 0xBB, 0xCC], nodes[0].value);
		assert!(nodes[0].children.is_empty());
	}

	/// Ensures constructed nodes are decoded recursively.
	#[test]
	fn constructed_node() {
		let nodes = parse(&[0x6F, 0x05, 0x84, 0x03, 0xAA, 0xBB, 0xCC])
			.expect("the data is well-formed");

		assert_eq!(1, nodes.len());
		assert!(nodes[0].is_constructed());
		assert_eq!(1, nodes[0].children.len());
		assert_eq!(vec![0x84], nodes[0].children[0].tag);
	}

	/// Ensures multi-byte tags and long-form lengths are handled.
	#[test]
	fn long_form_tag_and_length() {
		let mut bytes = vec![0x9F, 0x0C, 0x81, 0x03, 0x01, 0x02, 0x03];
		let nodes = parse(bytes.as_slice()).expect("the data is well-formed");
		assert_eq!(vec![0x9F, 0x0C], nodes[0].tag);
		assert_eq!(vec![0x01, 0x02, 0x03], nodes[0].value);

		// A length running past the end of the block must be rejected
		bytes[3] = 0x04;
		assert_eq!(Err(ParseError::NonCompliant), parse(bytes.as_slice()));
	}

	/// Ensures tag lookup is depth-first and order-independent.
	#[test]
	fn find_first_at_any_depth() {
		let nodes = parse(&[
			0x6F, 0x0A, // envelope
			0xA5, 0x05, // nested envelope
			0x53, 0x03, 0x11, 0x22, 0x33, // startup info
			0x84, 0x01, 0xFF, // DF name, after the nested envelope
		])
		.expect("the data is well-formed");

		assert_eq!(
			vec![0x11, 0x22, 0x33],
			find_first(nodes.as_slice(), &[0x53])
				.expect("the tag is present")
				.value
		);
		assert_eq!(
			vec![0xFF],
			find_first(nodes.as_slice(), &[0x84])
				.expect("the tag is present")
				.value
		);
		assert!(find_first(nodes.as_slice(), &[0xC7]).is_none());
	}

	/// Ensures truncated input is rejected rather than read out of bounds.
	#[test]
	fn truncated_input_is_rejected() {
		assert_eq!(Err(ParseError::NonCompliant), parse(&[0x84]));
		assert_eq!(Err(ParseError::NonCompliant), parse(&[0x84, 0x02, 0xAA]));
		assert_eq!(Err(ParseError::NonCompliant), parse(&[0x9F]));
	}
}
