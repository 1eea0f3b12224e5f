//! Tests for the area file header
//!
//! These tests verify:
//! - Every field survives encode/decode
//! - Unknown tags are skipped, malformed known tags are rejected
//! - Padding to a fixed size for in-place rewrites
//! - NGA tables larger than one tag

use std::io::Cursor;

use areastore::area::{AreaHeader, NgaBlockEntry};
use areastore::StoreError;

// =============================================================================
// Helper Functions
// =============================================================================

fn sample_header() -> AreaHeader {
    let mut header = AreaHeader::new("area.sample", 4, 1);
    header.next_active_version = 5;
    header.nga_blocks = vec![
        NgaBlockEntry {
            offset: Some(0),
            version: 2,
            activation_time: 2_000,
        },
        NgaBlockEntry {
            offset: None,
            version: 3,
            activation_time: 3_000,
        },
        NgaBlockEntry {
            offset: Some(120),
            version: 4,
            activation_time: 4_000,
        },
    ];
    header.ngdyn_start = 300;
    header.id_index_start = 500;
    header.pid_index_start = 532;
    header.mixed_set_start = 564;
    header.last_dynamic_change = 11;
    header.last_config_change = 22;
    header.last_data_change = 33;
    header
}

/// Append one raw tag and fix up the size field
fn append_tag(bytes: &mut Vec<u8>, tag: u16, payload: &[u8]) {
    bytes.extend_from_slice(&tag.to_be_bytes());
    bytes.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    bytes.extend_from_slice(payload);
    let size = bytes.len() as i32;
    bytes[..4].copy_from_slice(&size.to_be_bytes());
}

// =============================================================================
// Encode/Decode Tests
// =============================================================================

#[test]
fn test_header_fields_survive_encoding() {
    let header = sample_header();
    let bytes = header.encode().unwrap();

    let (decoded, size) = AreaHeader::decode_sized(&mut Cursor::new(&bytes)).unwrap();
    assert_eq!(decoded, header);
    assert_eq!(size, bytes.len() as u64);
}

#[test]
fn test_new_header_is_empty() {
    let header = AreaHeader::new("area.empty", 1, 1);
    let decoded = AreaHeader::decode_bytes(&header.encode().unwrap()).unwrap();

    assert_eq!(decoded.active_version, 1);
    assert_eq!(decoded.next_active_version, 1);
    assert!(decoded.nga_blocks.is_empty());
    assert_eq!(decoded.id_index_len(), 0);
    assert_eq!(decoded.pid_index_len(), 0);
    assert_eq!(decoded.last_restructured_version(), 0);
}

#[test]
fn test_nga_block_ranges() {
    let header = sample_header();

    assert_eq!(header.nga_block_range(0), Some((0, 120)));
    assert_eq!(header.nga_block_range(1), None);
    assert_eq!(header.nga_block_range(2), Some((120, 300)));
    assert_eq!(header.last_restructured_version(), 4);
    assert_eq!(header.id_index_len(), 2);
    assert_eq!(header.pid_index_len(), 2);
}

#[test]
fn test_large_nga_table_spans_several_tags() {
    let mut header = AreaHeader::new("area.large", 5_000, 1);
    header.nga_blocks = (1..=5_000u16)
        .map(|version| NgaBlockEntry {
            offset: None,
            version,
            activation_time: version as i64 * 10,
        })
        .collect();

    let decoded = AreaHeader::decode_bytes(&header.encode().unwrap()).unwrap();
    assert_eq!(decoded.nga_blocks.len(), 5_000);
    assert_eq!(decoded, header);
}

// =============================================================================
// Tag Handling Tests
// =============================================================================

#[test]
fn test_unknown_tag_is_skipped() {
    let header = sample_header();
    let mut bytes = header.encode().unwrap();
    append_tag(&mut bytes, 999, &[1, 2, 3]);

    assert_eq!(AreaHeader::decode_bytes(&bytes).unwrap(), header);
}

#[test]
fn test_known_tag_with_wrong_length_is_rejected() {
    let mut bytes = sample_header().encode().unwrap();
    // Versions tag carries exactly four bytes
    append_tag(&mut bytes, 1, &[0, 1, 0]);

    assert!(matches!(AreaHeader::decode_bytes(&bytes), Err(StoreError::Format(_))));
}

#[test]
fn test_tag_overrunning_header_is_rejected() {
    let mut bytes = sample_header().encode().unwrap();
    bytes.extend_from_slice(&500u16.to_be_bytes());
    bytes.extend_from_slice(&40u16.to_be_bytes());
    bytes.extend_from_slice(&[0u8; 4]);
    let size = bytes.len() as i32;
    bytes[..4].copy_from_slice(&size.to_be_bytes());

    assert!(matches!(AreaHeader::decode_bytes(&bytes), Err(StoreError::Format(_))));
}

#[test]
fn test_regions_out_of_order_are_rejected() {
    let mut header = sample_header();
    header.id_index_start = 100; // before NGDyn
    let bytes = header.encode().unwrap();

    assert!(matches!(AreaHeader::decode_bytes(&bytes), Err(StoreError::Format(_))));
}

#[test]
fn test_invalid_size_field() {
    let bytes = 2i32.to_be_bytes();
    assert!(matches!(
        AreaHeader::decode(&mut Cursor::new(&bytes)),
        Err(StoreError::Format(_))
    ));
}

// =============================================================================
// Padding Tests
// =============================================================================

#[test]
fn test_padded_header_decodes_to_same_fields() {
    let header = sample_header();
    let natural = header.encode().unwrap().len() as u64;

    let padded = header.encode_to_size(natural + 64).unwrap();
    assert_eq!(padded.len() as u64, natural + 64);

    let (decoded, size) = AreaHeader::decode_sized(&mut Cursor::new(&padded)).unwrap();
    assert_eq!(decoded, header);
    assert_eq!(size, natural + 64);
}

#[test]
fn test_padding_to_natural_size_is_identity() {
    let header = sample_header();
    let natural = header.encode().unwrap();

    assert_eq!(header.encode_to_size(natural.len() as u64).unwrap(), natural);
}

#[test]
fn test_padding_that_cannot_fit_a_tag() {
    let header = sample_header();
    let natural = header.encode().unwrap().len() as u64;

    assert!(header.encode_to_size(natural - 1).is_err());
    assert!(header.encode_to_size(natural + 2).is_err());
    assert!(header.encode_to_size(natural + 4).is_ok());
}
