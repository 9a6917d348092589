//! QMC stream ciphers.
//!
//! None of these formats has a header: the whole file is XORed against a
//! keystream, so decoding needs the full buffer in memory.

use tracing::debug;

use crate::error::{DumpError, Result};

/// Width of the circular mask used by the table-XOR cipher.
pub const MASK_LEN: usize = 128;

/// Trailing container bytes of an `.mflac` file that are not audio.
pub const MFLAC_FOOTER_LEN: usize = 368;

const BOUNDARY: usize = 0x8000;
const MFLAC_SCAN_LIMIT: usize = 0x8000;
const MFLAC_GIVE_UP_AFTER: usize = 30000;
const LEGACY_PAGE: i64 = 0x7FFF;

/// Position of the table-XOR keystream.
///
/// Both counters advance once per byte, and twice when crossing a 0x8000
/// boundary. The double step is part of the format.
#[derive(Debug, Clone, Default)]
pub struct MaskCursor {
    next_index: usize,
    next_mask: usize,
}

impl MaskCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mask slot (`0..MASK_LEN`) for the next byte.
    pub fn advance(&mut self) -> usize {
        let mut index = self.next_index;
        let mut mask = self.next_mask;
        if index == BOUNDARY || (index > BOUNDARY && (index + 1) % BOUNDARY == 0) {
            index += 1;
            mask += 1;
        }
        while mask >= MASK_LEN {
            mask -= MASK_LEN;
        }
        self.next_index = index + 1;
        self.next_mask = mask + 1;
        mask
    }
}

/// XOR `data` in place against a 128-byte mask addressed by [`MaskCursor`].
pub fn mask_xor(mask: &[u8; MASK_LEN], data: &mut [u8]) {
    let mut cursor = MaskCursor::new();
    for byte in data {
        *byte ^= mask[cursor.advance()];
    }
}

/// Table-XOR cipher over the static table. Only the first 128 entries are used.
pub fn decode_static(table: &[u8; 256], data: &mut [u8]) {
    let mut mask = [0u8; MASK_LEN];
    mask.copy_from_slice(&table[..MASK_LEN]);
    mask_xor(&mask, data);
}

/// Table index of the positional-hash cipher for absolute offset `v`.
///
/// Negative offsets behave as 0; offsets past 0x7FFF are reduced once.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn legacy_map_index(v: i64) -> usize {
    let mut v = v.max(0);
    if v > LEGACY_PAGE {
        v %= LEGACY_PAGE;
    }
    ((v * v + 80923) % 256) as usize
}

#[inline]
pub fn legacy_stream_byte(table: &[u8; 256], v: i64) -> u8 {
    table[legacy_map_index(v)]
}

/// Positional-hash cipher over the static table, starting at offset 0.
pub fn decode_legacy(table: &[u8; 256], data: &mut [u8]) {
    for (v, byte) in (0i64..).zip(data.iter_mut()) {
        *byte ^= legacy_stream_byte(table, v);
    }
}

/// Find the self-duplicated 128-byte key of an `.mflac` file.
///
/// A candidate is a 128-byte block equal to the block right after it, and
/// it is accepted only if it decodes the first four bytes to `fLaC`.
pub fn recover_mflac_key(buf: &[u8]) -> Result<[u8; MASK_LEN]> {
    let limit = buf.len().min(MFLAC_SCAN_LIMIT);
    for offset in (0..limit).step_by(MASK_LEN) {
        let (Some(block), Some(next)) = (
            buf.get(offset..offset + MASK_LEN),
            buf.get(offset + MASK_LEN..offset + 2 * MASK_LEN),
        ) else {
            break;
        };
        if block != next {
            if offset > MFLAC_GIVE_UP_AFTER {
                break;
            }
            continue;
        }

        let mut key = [0u8; MASK_LEN];
        key.copy_from_slice(block);
        let mut head = [0u8; 4];
        if let Some(src) = buf.get(..4) {
            head.copy_from_slice(src);
        }
        mask_xor(&key, &mut head);
        if &head == b"fLaC" {
            debug!(offset, "recovered mflac key");
            return Ok(key);
        }
    }
    Err(DumpError::KeyRecoveryFailed)
}

/// Recover the key, drop the footer and decode an `.mflac` buffer in place.
pub fn decode_mflac(data: &mut Vec<u8>) -> Result<()> {
    let key = recover_mflac_key(data)?;
    let audio_len = data
        .len()
        .checked_sub(MFLAC_FOOTER_LEN)
        .ok_or(DumpError::Truncated("mflac footer"))?;
    data.truncate(audio_len);
    mask_xor(&key, data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::QMC_STATIC_TABLE;
    use proptest::prelude::*;

    #[test]
    fn test_cursor_is_plain_modulo_before_boundary() {
        let mut cursor = MaskCursor::new();
        for i in 0..BOUNDARY {
            assert_eq!(cursor.advance(), i % MASK_LEN);
        }
    }

    #[test]
    fn test_static_diverges_from_naive_exactly_at_boundary() {
        let mut data = vec![0u8; BOUNDARY + 1024];
        decode_static(&QMC_STATIC_TABLE, &mut data);
        let naive: Vec<u8> = (0..data.len())
            .map(|i| QMC_STATIC_TABLE[i % MASK_LEN])
            .collect();
        let first_diff = data.iter().zip(&naive).position(|(a, b)| a != b);
        assert_eq!(first_diff, Some(BOUNDARY));
    }

    #[test]
    fn test_second_boundary_double_step() {
        let mut cursor = MaskCursor::new();
        let slots: Vec<usize> = (0..0x10010).map(|_| cursor.advance()).collect();
        // index 0x8000 is skipped, so byte 0x8000 reads index 0x8001
        assert_eq!(slots[BOUNDARY], 1);
        // index 0xFFFF is skipped as well
        assert_eq!(slots[0xFFFE], (slots[0xFFFD] + 2) % MASK_LEN);
    }

    #[test]
    fn test_static_uses_only_first_half_of_table() {
        let mut table = QMC_STATIC_TABLE;
        table[200] ^= 0xFF;
        let mut a = vec![0u8; 4096];
        let mut b = a.clone();
        decode_static(&QMC_STATIC_TABLE, &mut a);
        decode_static(&table, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_legacy_map_index() {
        assert_eq!(legacy_map_index(0), 80923 % 256);
        assert_eq!(legacy_map_index(-5), legacy_map_index(0));
        assert_eq!(legacy_map_index(3), (9 + 80923) % 256);
        assert_eq!(legacy_map_index(0x7FFF), ((0x7FFF * 0x7FFF + 80923) % 256) as usize);
        // exactly one reduction: 0x7FFF + 7 -> 7
        assert_eq!(legacy_map_index(0x7FFF + 7), legacy_map_index(7));
        assert_eq!(legacy_map_index(0x7FFF * 3 + 2), legacy_map_index(2));
    }

    #[test]
    fn test_legacy_is_positional() {
        let mut data = vec![0u8; 300];
        decode_legacy(&QMC_STATIC_TABLE, &mut data);
        for (v, b) in data.iter().enumerate() {
            assert_eq!(*b, legacy_stream_byte(&QMC_STATIC_TABLE, v as i64));
        }
    }

    fn key_pattern(seed: u8) -> [u8; MASK_LEN] {
        let mut key = [0u8; MASK_LEN];
        for (i, k) in key.iter_mut().enumerate() {
            *k = (i as u8).wrapping_mul(31).wrapping_add(seed);
        }
        key
    }

    fn synthetic_mflac(key: &[u8; MASK_LEN], key_offset: usize, len: usize) -> Vec<u8> {
        let mut buf: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
        buf[key_offset..key_offset + MASK_LEN].copy_from_slice(key);
        buf[key_offset + MASK_LEN..key_offset + 2 * MASK_LEN].copy_from_slice(key);
        for (i, c) in b"fLaC".iter().enumerate() {
            buf[i] = c ^ key[i];
        }
        buf
    }

    #[test]
    fn test_recover_repeated_key() {
        let key = key_pattern(5);
        let buf = synthetic_mflac(&key, 256, 4096);
        assert_eq!(recover_mflac_key(&buf).unwrap(), key);
    }

    #[test]
    fn test_recover_skips_repeat_that_does_not_validate() {
        let key = key_pattern(5);
        let mut buf = synthetic_mflac(&key, 1024, 4096);
        let decoy = key_pattern(99);
        buf[256..384].copy_from_slice(&decoy);
        buf[384..512].copy_from_slice(&decoy);
        assert_eq!(recover_mflac_key(&buf).unwrap(), key);
    }

    #[test]
    fn test_recover_fails_without_repeat() {
        let buf: Vec<u8> = (0..40_000u32).map(|i| (i * 7 + i / 131) as u8).collect();
        assert!(matches!(
            recover_mflac_key(&buf),
            Err(DumpError::KeyRecoveryFailed)
        ));
    }

    #[test]
    fn test_recover_gives_up_past_scan_window() {
        let key = key_pattern(1);
        let buf = synthetic_mflac(&key, 30_208, 40_000);
        assert!(matches!(
            recover_mflac_key(&buf),
            Err(DumpError::KeyRecoveryFailed)
        ));
    }

    #[test]
    fn test_decode_mflac_strips_footer() {
        let key = key_pattern(9);
        let mut buf = synthetic_mflac(&key, 512, 2048);
        decode_mflac(&mut buf).unwrap();
        assert_eq!(buf.len(), 2048 - MFLAC_FOOTER_LEN);
        assert_eq!(&buf[..4], b"fLaC");
        // the key blocks decode to silence
        assert!(buf[512..768].iter().all(|b| *b == 0));
    }

    proptest! {
        #[test]
        fn static_xor_twice_is_identity(data in proptest::collection::vec(any::<u8>(), 0..0x9000)) {
            let mut buf = data.clone();
            decode_static(&QMC_STATIC_TABLE, &mut buf);
            decode_static(&QMC_STATIC_TABLE, &mut buf);
            prop_assert_eq!(buf, data);
        }
    }
}
