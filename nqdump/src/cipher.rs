use aes::Aes128;
use ecb::cipher::{BlockDecryptMut, KeyInit, block_padding::NoPadding};

use crate::error::{DumpError, Result};

type Aes128EcbDec = ecb::Decryptor<Aes128>;

const BLOCK_SIZE: usize = 16;

/// AES-128-ECB decrypt followed by PKCS#7-style unpadding.
///
/// Any trailing partial block is dropped before decryption. The pad length
/// is taken from the last plaintext byte without checking the pad bytes.
pub fn aes128_ecb_decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = data[..data.len() / BLOCK_SIZE * BLOCK_SIZE].to_vec();

    let plain_len = Aes128EcbDec::new_from_slice(key)
        .map_err(|e| DumpError::Crypto(e.to_string()))?
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|e| DumpError::Crypto(e.to_string()))?
        .len();
    buf.truncate(plain_len);

    let pad = usize::from(
        *buf.last()
            .ok_or_else(|| DumpError::Crypto("empty ciphertext".into()))?,
    );
    if pad > buf.len() {
        return Err(DumpError::Crypto(format!(
            "padding {pad} exceeds {} decrypted bytes",
            buf.len()
        )));
    }
    buf.truncate(buf.len() - pad);
    Ok(buf)
}

/// RC4-style key scheduling used by NCM. Returns the permuted key box.
///
/// The key repeats until all 256 slots are visited. An empty key leaves the
/// identity box.
#[allow(clippy::cast_possible_truncation)]
pub fn build_key_box(key: &[u8]) -> [u8; 256] {
    let mut key_box: [u8; 256] = std::array::from_fn(|i| i as u8);
    let mut last = 0u8;
    for (i, &k) in (0..256).zip(key.iter().cycle()) {
        last = key_box[i].wrapping_add(last).wrapping_add(k);
        key_box.swap(i, usize::from(last));
    }
    key_box
}

/// Keystream byte at chunk-relative position `i`. The `key_box` is never mutated.
#[inline]
pub fn ncm_stream_byte(key_box: &[u8; 256], i: usize) -> u8 {
    let at = |n: usize| usize::from(key_box[n % 256]);
    let j = (i + 1) % 256;
    let a = at(j);
    key_box[(a + at(a + j)) % 256]
}

/// XOR one chunk against the NCM keystream. The position restarts at 0 for every chunk.
pub fn ncm_xor_chunk(key_box: &[u8; 256], chunk: &mut [u8]) {
    for (i, byte) in chunk.iter_mut().enumerate() {
        *byte ^= ncm_stream_byte(key_box, i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encrypt(key: &[u8; 16], plain: &[u8]) -> Vec<u8> {
        use ecb::cipher::{BlockEncryptMut, block_padding::Pkcs7};
        type Aes128EcbEnc = ecb::Encryptor<Aes128>;
        let mut buf = vec![0u8; plain.len() + 16];
        buf[..plain.len()].copy_from_slice(plain);
        Aes128EcbEnc::new(key.into())
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plain.len())
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_key_box_deterministic() {
        assert_eq!(build_key_box(b"hello"), build_key_box(b"hello"));
        assert_ne!(build_key_box(b"hello"), build_key_box(b"hellp"));
    }

    #[test]
    fn test_key_box_single_byte_key() {
        // key [0]: slot i swaps with the running sum 0+1+..+i
        let mut expected: [u8; 256] = std::array::from_fn(|i| i as u8);
        let mut sum = 0u8;
        for i in 0..256 {
            sum = expected[i].wrapping_add(sum);
            expected.swap(i, usize::from(sum));
        }
        assert_eq!(build_key_box(&[0]), expected);
    }

    #[test]
    fn test_key_box_empty_key_is_identity() {
        let key_box = build_key_box(&[]);
        assert!(key_box.iter().enumerate().all(|(i, &v)| usize::from(v) == i));
    }

    #[test]
    fn test_stream_byte_wraps_positions() {
        let key_box = build_key_box(b"wrap");
        assert_eq!(ncm_stream_byte(&key_box, 3), ncm_stream_byte(&key_box, 259));
        assert_eq!(ncm_stream_byte(&key_box, 255), ncm_stream_byte(&key_box, 511));
    }

    #[test]
    fn test_aes128_ecb_roundtrip() {
        let key: [u8; 16] = *b"0123456789abcdef";
        let plaintext = b"hello world!!!!!";
        let decrypted = aes128_ecb_decrypt(&key, &encrypt(&key, plaintext)).unwrap();
        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn test_trailing_partial_block_is_dropped() {
        let key: [u8; 16] = *b"0123456789abcdef";
        let mut ct = encrypt(&key, b"short");
        ct.extend_from_slice(&[0xAA; 7]);
        assert_eq!(aes128_ecb_decrypt(&key, &ct).unwrap(), b"short");
    }

    #[test]
    fn test_bad_key_length_is_crypto_error() {
        let err = aes128_ecb_decrypt(&[0u8; 15], &[0u8; 16]).unwrap_err();
        assert!(matches!(err, DumpError::Crypto(_)));
    }

    #[test]
    fn test_empty_ciphertext_is_crypto_error() {
        let err = aes128_ecb_decrypt(b"0123456789abcdef", &[0u8; 10]).unwrap_err();
        assert!(matches!(err, DumpError::Crypto(_)));
    }

    #[test]
    fn test_ncm_xor_is_involutory() {
        let key_box = build_key_box(b"involution");
        let original: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut data = original.clone();
        ncm_xor_chunk(&key_box, &mut data);
        assert_ne!(data, original);
        ncm_xor_chunk(&key_box, &mut data);
        assert_eq!(data, original);
    }

    proptest! {
        #[test]
        fn key_box_is_permutation(key in proptest::collection::vec(any::<u8>(), 1..=256)) {
            let mut sorted = build_key_box(&key);
            sorted.sort_unstable();
            for (i, v) in sorted.iter().enumerate() {
                prop_assert_eq!(*v as usize, i);
            }
        }

        #[test]
        fn ncm_xor_twice_is_identity(
            key in proptest::collection::vec(any::<u8>(), 1..=64),
            data in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let key_box = build_key_box(&key);
            let mut buf = data.clone();
            ncm_xor_chunk(&key_box, &mut buf);
            ncm_xor_chunk(&key_box, &mut buf);
            prop_assert_eq!(buf, data);
        }
    }
}
