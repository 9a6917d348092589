use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{debug, warn};

use crate::error::Result;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// PNG magic bytes for MIME detection.
const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

pub fn is_png(data: &[u8]) -> bool {
    data.starts_with(&PNG_MAGIC)
}

/// Download album art. Non-200 responses are errors.
pub fn fetch(url: &str, timeout: Duration) -> Result<Vec<u8>> {
    let http = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?;
    let bytes = http
        .get(url)
        .header("Referer", "https://music.163.com/")
        .send()?
        .error_for_status()?
        .bytes()?;
    debug!(url, len = bytes.len(), "fetched cover");
    Ok(bytes.to_vec())
}

/// Like [`fetch`], but a failure only costs the picture.
pub fn fetch_or_warn(url: &str, timeout: Duration) -> Option<Vec<u8>> {
    match fetch(url, timeout) {
        Ok(data) if !data.is_empty() => Some(data),
        Ok(_) => {
            warn!(url, "cover download returned no data");
            None
        }
        Err(e) => {
            warn!(url, "{e}");
            None
        }
    }
}
