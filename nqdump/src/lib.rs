//! Decoders for NCM and QMC/MFLAC protected audio containers.
//!
//! [`convert`] picks a decoder from the file extension (see
//! [`format::ROUTES`]), writes the recovered audio next to the input (or into
//! [`DumpOptions::output_dir`]) and, for NCM, tags it with the embedded
//! metadata.
//!
//! NCM audio is streamed in 0x8000-byte chunks. The QMC decoders hold the
//! whole file in memory.

pub mod cipher;
pub mod cover;
pub mod error;
pub mod format;
pub mod keys;
mod metadata;
pub mod ncm;
pub mod qmc;
pub mod tag;

pub use error::{DumpError, Result};
pub use format::{Codec, Route};
pub use keys::{NcmKeys, QMC_STATIC_TABLE};
pub use metadata::{Artist, PicDocId, TrackMetadata};
pub use ncm::NcmFile;
pub use tag::CoverArt;

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

/// Keystream used for the static-table QMC extensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QmcCipher {
    /// Table XOR with the 0x8000 boundary skip.
    #[default]
    Static,
    /// Positional hash over the full table, for old clients.
    Legacy,
}

/// Per-run settings shared by every file of a batch.
#[derive(Debug, Clone)]
pub struct DumpOptions {
    /// Where decoded files go. `None` writes next to the input.
    pub output_dir: Option<PathBuf>,
    pub ncm_keys: NcmKeys,
    pub qmc_table: [u8; 256],
    pub qmc_cipher: QmcCipher,
    /// Write title/album/artist/cover into decoded NCM tracks.
    pub write_tags: bool,
    /// Download `albumPic` when no cover is embedded.
    pub fetch_cover: bool,
    pub cover_timeout: Duration,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            output_dir: None,
            ncm_keys: NcmKeys::STANDARD,
            qmc_table: QMC_STATIC_TABLE,
            qmc_cipher: QmcCipher::Static,
            write_tags: true,
            fetch_cover: true,
            cover_timeout: cover::DEFAULT_TIMEOUT,
        }
    }
}

impl DumpOptions {
    /// `<output dir>/<input stem>.<ext>`
    pub fn output_path(&self, input: &Path, ext: &str) -> PathBuf {
        let stem = input.file_stem().unwrap_or_default();
        let out_dir = self
            .output_dir
            .as_deref()
            .unwrap_or_else(|| input.parent().unwrap_or(Path::new(".")));
        out_dir.join(format!("{}.{ext}", stem.to_string_lossy()))
    }
}

/// Decode one protected file. Returns the path of the written audio file.
pub fn convert(input: &Path, options: &DumpOptions) -> Result<PathBuf> {
    let route = format::route_for(input).ok_or_else(|| DumpError::Unsupported {
        extension: input
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default(),
    })?;

    match (route.codec, route.output) {
        (Codec::Ncm, _) => convert_ncm(input, options),
        (Codec::Qmc, Some(ext)) => convert_qmc(input, ext, options),
        (Codec::Mflac, Some(ext)) => convert_mflac(input, ext, options),
        _ => Err(DumpError::Unsupported {
            extension: route.extensions[0].to_owned(),
        }),
    }
}

/// Decode an NCM file and tag the result.
///
/// Tagging problems are logged; the decoded audio is kept either way.
pub fn convert_ncm(input: &Path, options: &DumpOptions) -> Result<PathBuf> {
    let mut file = File::open(input)?;
    let ncm = NcmFile::parse(&mut file, &options.ncm_keys)?;

    let ext = ncm.output_extension(&mut file)?;
    let output_path = options.output_path(input, &ext);
    if output_path == input {
        return Err(DumpError::Unsupported { extension: ext });
    }

    {
        let out_file = File::create(&output_path)?;
        let mut writer = BufWriter::new(out_file);
        let written = ncm.dump_audio(&mut file, &mut writer)?;
        debug!(written, output = %output_path.display(), "wrote ncm audio");
    }

    if options.write_tags && tag::supports(&ext) {
        let NcmFile {
            metadata,
            cover_image,
            ..
        } = ncm;
        let metadata = metadata.unwrap_or_default();
        let timeout = options.fetch_cover.then_some(options.cover_timeout);
        let cover = CoverArt::resolve(cover_image, &metadata, timeout);
        if let Err(e) = tag::write_tags(&output_path, &metadata, cover) {
            warn!(output = %output_path.display(), "{e}");
        }
    }

    Ok(output_path)
}

/// Decode a static-table QMC file.
pub fn convert_qmc(input: &Path, ext: &str, options: &DumpOptions) -> Result<PathBuf> {
    let mut data = fs::read(input)?;
    match options.qmc_cipher {
        QmcCipher::Static => qmc::decode_static(&options.qmc_table, &mut data),
        QmcCipher::Legacy => qmc::decode_legacy(&options.qmc_table, &mut data),
    }
    let output_path = options.output_path(input, ext);
    fs::write(&output_path, &data)?;
    Ok(output_path)
}

/// Decode an `.mflac` file whose key is embedded in the file itself.
pub fn convert_mflac(input: &Path, ext: &str, options: &DumpOptions) -> Result<PathBuf> {
    let mut data = fs::read(input)?;
    qmc::decode_mflac(&mut data)?;
    let output_path = options.output_path(input, ext);
    fs::write(&output_path, &data)?;
    Ok(output_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_next_to_input() {
        let opts = DumpOptions::default();
        assert_eq!(
            opts.output_path(Path::new("/music/song.qmcflac"), "flac"),
            PathBuf::from("/music/song.flac")
        );
    }

    #[test]
    fn test_output_path_in_output_dir() {
        let opts = DumpOptions {
            output_dir: Some(PathBuf::from("/out")),
            ..DumpOptions::default()
        };
        assert_eq!(
            opts.output_path(Path::new("/music/a.b.ncm"), "mp3"),
            PathBuf::from("/out/a.b.mp3")
        );
    }

    #[test]
    fn test_unknown_extension_is_unsupported() {
        let err = convert(Path::new("song.wma"), &DumpOptions::default()).unwrap_err();
        assert!(matches!(err, DumpError::Unsupported { extension } if extension == "wma"));
    }

    #[test]
    fn test_mgg_is_rejected_without_reading() {
        let err = convert(Path::new("/nonexistent/song.mgg"), &DumpOptions::default()).unwrap_err();
        assert!(matches!(err, DumpError::Unsupported { extension } if extension == "mgg"));
    }
}
