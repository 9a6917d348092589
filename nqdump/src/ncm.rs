use std::io::{self, Read, Seek, SeekFrom, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, warn};

use crate::cipher::{aes128_ecb_decrypt, build_key_box, ncm_xor_chunk};
use crate::error::{DumpError, Result};
use crate::keys::{NCM_MAGIC_HEAD, NCM_MAGIC_TAIL, NcmKeys};
use crate::metadata::TrackMetadata;

/// The audio payload is ciphered in chunks of this size; the keystream
/// position restarts with each chunk.
pub const CHUNK_SIZE: usize = 0x8000;

/// Length of the `neteasecloudmusic` prefix in front of the RC4 key.
const KEY_PREFIX_LEN: usize = 17;
/// Length of the `163 key(Don't modify):` prefix in front of the base64 metadata.
const META_B64_PREFIX_LEN: usize = 22;
/// Length of the `music:` prefix in front of the metadata JSON.
const META_JSON_PREFIX_LEN: usize = 6;

/// Parsed NCM header, ready for audio extraction.
pub struct NcmFile {
    /// `None` when the header carried no metadata blob.
    pub metadata: Option<TrackMetadata>,
    pub cover_image: Option<Vec<u8>>,
    pub key_box: [u8; 256],
    pub audio_offset: u64,
}

impl NcmFile {
    /// Parse an NCM header from a reader. After this, call `dump_audio` to extract.
    ///
    /// Nothing is written anywhere until the header has fully parsed.
    pub fn parse<R: Read + Seek>(r: &mut R, keys: &NcmKeys) -> Result<Self> {
        // 1. Verify both magic words
        if read_u32_le(r, "magic")? != NCM_MAGIC_HEAD {
            return Err(DumpError::FormatMismatch);
        }
        if read_u32_le(r, "magic")? != NCM_MAGIC_TAIL {
            return Err(DumpError::FormatMismatch);
        }

        // 2. Skip 2-byte format version
        r.seek(SeekFrom::Current(2))?;

        // 3. Read & decrypt RC4 key
        let mut key_data = read_blob(r, "key blob")?;
        for b in &mut key_data {
            *b ^= 0x64;
        }
        let key_decrypted = aes128_ecb_decrypt(&keys.core, &key_data)?;
        let rc4_key = key_decrypted
            .get(KEY_PREFIX_LEN..)
            .filter(|k| !k.is_empty() && k.len() <= 256)
            .ok_or_else(|| {
                DumpError::Crypto(format!(
                    "decrypted key has {} bytes, expected 18..=273",
                    key_decrypted.len()
                ))
            })?;
        debug!(key_len = rc4_key.len(), "recovered ncm key");
        let key_box = build_key_box(rc4_key);

        // 4. Read & decrypt metadata
        let mut meta_data = read_blob(r, "metadata blob")?;
        let metadata = if meta_data.is_empty() {
            None
        } else {
            for b in &mut meta_data {
                *b ^= 0x63;
            }
            Some(decrypt_metadata(&meta_data, keys)?)
        };

        // 5. Skip CRC (unchecked) and the reserved gap
        r.seek(SeekFrom::Current(4 + 5))?;

        // 6. Read cover image
        let cover = read_blob(r, "cover image")?;
        let cover_image = (!cover.is_empty()).then_some(cover);
        debug!(
            cover_len = cover_image.as_ref().map_or(0, Vec::len),
            "parsed ncm header"
        );

        let audio_offset = r.stream_position()?;

        Ok(Self {
            metadata,
            cover_image,
            key_box,
            audio_offset,
        })
    }

    /// Output extension: the metadata's `format` field, or a guess from the
    /// first decoded audio bytes when the metadata has none.
    pub fn output_extension<R: Read + Seek>(&self, r: &mut R) -> Result<String> {
        if let Some(ext) = self.metadata.as_ref().and_then(TrackMetadata::format_extension) {
            return Ok(ext.to_ascii_lowercase());
        }
        r.seek(SeekFrom::Start(self.audio_offset))?;
        let mut head = [0u8; 4];
        let n = read_chunk(r, &mut head)?;
        ncm_xor_chunk(&self.key_box, &mut head[..n]);
        let ext = sniff_extension(&head[..n]);
        debug!(ext, "metadata has no format, sniffed from audio");
        Ok(ext.to_owned())
    }

    /// Decrypt and write the audio stream in `CHUNK_SIZE` pieces.
    pub fn dump_audio<R: Read + Seek, W: Write>(&self, r: &mut R, w: &mut W) -> Result<u64> {
        r.seek(SeekFrom::Start(self.audio_offset))?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut written = 0u64;

        loop {
            let n = read_chunk(r, &mut buf)?;
            if n == 0 {
                break;
            }
            ncm_xor_chunk(&self.key_box, &mut buf[..n]);
            w.write_all(&buf[..n])?;
            written += n as u64;
        }
        w.flush()?;

        Ok(written)
    }
}

fn decrypt_metadata(data: &[u8], keys: &NcmKeys) -> Result<TrackMetadata> {
    let b64_data = data
        .get(META_B64_PREFIX_LEN..)
        .ok_or(DumpError::Truncated("metadata blob"))?;
    let decoded = BASE64.decode(b64_data)?;
    let decrypted = aes128_ecb_decrypt(&keys.modify, &decoded)?;
    let json = decrypted.get(META_JSON_PREFIX_LEN..).unwrap_or_default();
    match TrackMetadata::from_json(json) {
        Ok(meta) => {
            debug!(format = %meta.format, name = %meta.music_name, "decrypted metadata");
            Ok(meta)
        }
        Err(e) => {
            warn!("{e}; continuing without track metadata");
            Ok(TrackMetadata::default())
        }
    }
}

/// Guess the container of decoded audio from its leading bytes.
pub fn sniff_extension(head: &[u8]) -> &'static str {
    if head.starts_with(b"fLaC") {
        "flac"
    } else if head.starts_with(b"OggS") {
        "ogg"
    } else {
        // ID3, a bare MPEG frame sync, or anything unrecognised
        "mp3"
    }
}

// Fill `buf` as far as the reader allows so chunk boundaries stay fixed.
fn read_chunk<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_u32_le<R: Read>(r: &mut R, field: &'static str) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|e| DumpError::from_read(e, field))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_blob<R: Read>(r: &mut R, field: &'static str) -> Result<Vec<u8>> {
    let len = read_u32_le(r, field)? as usize;
    let mut data = Vec::new();
    r.by_ref()
        .take(len as u64)
        .read_to_end(&mut data)
        .map_err(|e| DumpError::from_read(e, field))?;
    if data.len() < len {
        return Err(DumpError::Truncated(field));
    }
    Ok(data)
}
