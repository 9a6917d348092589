use std::path::Path;
use std::time::Duration;

use lofty::config::WriteOptions;
use lofty::file::TaggedFileExt;
use lofty::picture::{MimeType, Picture, PictureType};
use lofty::probe::Probe;
use lofty::tag::{Accessor, ItemKey, ItemValue, Tag, TagExt, TagItem};

use crate::cover;
use crate::error::{DumpError, Result};
use crate::metadata::TrackMetadata;

/// ID3v2 convention for a picture whose data is a URL instead of image bytes.
const URL_MIME: &str = "-->";

/// Front cover to attach to a decoded track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverArt {
    Image(Vec<u8>),
    Url(String),
}

impl CoverArt {
    /// Prefer the embedded image, then a downloaded one, then a bare URL reference.
    pub fn resolve(
        embedded: Option<Vec<u8>>,
        metadata: &TrackMetadata,
        fetch_timeout: Option<Duration>,
    ) -> Option<Self> {
        if let Some(img) = embedded {
            return Some(Self::Image(img));
        }
        let url = metadata.album_pic_url()?;
        fetch_timeout
            .and_then(|timeout| cover::fetch_or_warn(url, timeout))
            .map(Self::Image)
            .or_else(|| Some(Self::Url(url.to_owned())))
    }

    fn into_picture(self) -> Picture {
        let (data, mime) = match self {
            Self::Image(data) => {
                let mime = if cover::is_png(&data) {
                    MimeType::Png
                } else {
                    MimeType::Jpeg
                };
                (data, mime)
            }
            Self::Url(url) => (url.into_bytes(), MimeType::Unknown(URL_MIME.to_owned())),
        };
        Picture::unchecked(data)
            .pic_type(PictureType::CoverFront)
            .mime_type(mime)
            .build()
    }
}

/// Whether tags can be written to an output with this extension.
pub fn supports(extension: &str) -> bool {
    matches!(extension, "mp3" | "flac")
}

/// Write metadata tags and optional cover art to a decoded audio file.
///
/// Title, album and artist are only filled in when the file does not
/// already carry them.
pub fn write_tags(path: &Path, metadata: &TrackMetadata, cover: Option<CoverArt>) -> Result<()> {
    let mut tagged_file = Probe::open(path)
        .map_err(|e| DumpError::Tag(e.to_string()))?
        .read()
        .map_err(|e| DumpError::Tag(e.to_string()))?;

    if tagged_file.primary_tag().is_none() {
        let tag_type = tagged_file.primary_tag_type();
        tagged_file.insert_tag(Tag::new(tag_type));
    }
    let tag = tagged_file
        .primary_tag_mut()
        .ok_or_else(|| DumpError::Tag("file type cannot hold a tag".into()))?;

    if let Some(cover) = cover {
        tag.push_picture(cover.into_picture());
    }

    if tag.title().is_none() && !metadata.music_name.is_empty() {
        tag.set_title(metadata.music_name.clone());
    }
    if tag.album().is_none() && !metadata.album.is_empty() {
        tag.set_album(metadata.album.clone());
    }
    // one ARTIST / TPE1 value per artist
    if tag.artist().is_none() {
        for name in metadata.artist_names() {
            tag.push(TagItem::new(
                ItemKey::TrackArtist,
                ItemValue::Text(name.to_owned()),
            ));
        }
    }

    tag.save_to_path(path, WriteOptions::default())
        .map_err(|e| DumpError::Tag(e.to_string()))?;

    Ok(())
}
