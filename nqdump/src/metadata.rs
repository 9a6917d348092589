use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{DumpError, Result};
use crate::format::route_for_extension;

/// A track artist as stored in NCM metadata: `[name, id]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artist {
    pub name: String,
    pub id: Option<u64>,
}

impl<'de> Deserialize<'de> for Artist {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let pair = Vec::<Value>::deserialize(d)?;
        let name = pair
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| serde::de::Error::custom("artist entry without a name"))?;
        Ok(Self {
            name: name.to_owned(),
            id: pair.get(1).and_then(Value::as_u64),
        })
    }
}

/// `albumPicDocId` is either a numeric document id or a string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PicDocId {
    Number(u64),
    Text(String),
    #[default]
    Unknown,
}

impl<'de> Deserialize<'de> for PicDocId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n.as_u64().map_or(Self::Unknown, Self::Number),
            Value::String(s) => Self::Text(s),
            _ => Self::Unknown,
        })
    }
}

/// Track metadata decrypted from an NCM header.
///
/// Every field falls back to its default when missing or of an unexpected
/// shape, so a partially broken blob still yields what it can.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackMetadata {
    #[serde(default, deserialize_with = "lenient")]
    pub music_id: u64,
    #[serde(default, deserialize_with = "lenient")]
    pub music_name: String,
    #[serde(default, deserialize_with = "lenient_list")]
    pub artist: Vec<Artist>,
    #[serde(default, deserialize_with = "lenient")]
    pub album_id: u64,
    #[serde(default, deserialize_with = "lenient")]
    pub album: String,
    #[serde(default)]
    pub album_pic_doc_id: PicDocId,
    #[serde(default, deserialize_with = "lenient")]
    pub album_pic: String,
    #[serde(default, deserialize_with = "lenient")]
    pub bitrate: u64,
    #[serde(default, deserialize_with = "lenient")]
    pub mp3_doc_id: String,
    #[serde(default, deserialize_with = "lenient")]
    pub duration: u64,
    #[serde(default, deserialize_with = "lenient")]
    pub mv_id: u64,
    #[serde(default, deserialize_with = "lenient")]
    pub alias: Vec<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub format: String,
}

fn lenient<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(d)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

// Keeps the well-formed entries of a list and drops the rest.
fn lenient_list<'de, D, T>(d: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let Value::Array(items) = Value::deserialize(d)? else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect())
}

impl TrackMetadata {
    /// Parse metadata from the decrypted JSON bytes (after the `music:` prefix is stripped).
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| DumpError::MetadataMalformed(e.to_string()))
    }

    pub fn artist_names(&self) -> Vec<&str> {
        self.artist.iter().map(|a| a.name.as_str()).collect()
    }

    /// Output extension announced by the metadata, if any.
    ///
    /// Extensions of protected inputs (`ncm`, `qmc0`, ...) are refused so the
    /// output can never overwrite its own source.
    pub fn format_extension(&self) -> Option<&str> {
        let ext = self.format.trim();
        let plain = !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric());
        (plain && route_for_extension(&ext.to_ascii_lowercase()).is_none()).then_some(ext)
    }

    pub fn album_pic_url(&self) -> Option<&str> {
        let url = self.album_pic.trim();
        (!url.is_empty()).then_some(url)
    }
}
