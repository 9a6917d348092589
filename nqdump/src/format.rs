use std::path::Path;

/// Decoder selected for an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// NCM container; output extension comes from the metadata.
    Ncm,
    /// QMC table cipher (static table).
    Qmc,
    /// QMC table cipher with a key recovered from the file.
    Mflac,
    /// Recognized but deliberately not decoded.
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub extensions: &'static [&'static str],
    pub codec: Codec,
    /// `None` when the output extension is decided by the decoder.
    pub output: Option<&'static str>,
}

pub const ROUTES: &[Route] = &[
    Route {
        extensions: &["ncm"],
        codec: Codec::Ncm,
        output: None,
    },
    Route {
        extensions: &["qmc2", "qmc4", "qmc6", "qmc8", "tkm", "6d3461"],
        codec: Codec::Qmc,
        output: Some("m4a"),
    },
    Route {
        extensions: &["qmc0", "qmc3", "bkcmp3", "6d7033"],
        codec: Codec::Qmc,
        output: Some("mp3"),
    },
    Route {
        extensions: &["qmcflac", "bkcflac", "666c6163"],
        codec: Codec::Qmc,
        output: Some("flac"),
    },
    Route {
        extensions: &["qmcogg", "6f6767"],
        codec: Codec::Qmc,
        output: Some("ogg"),
    },
    Route {
        extensions: &["776176"],
        codec: Codec::Qmc,
        output: Some("wav"),
    },
    Route {
        extensions: &["mflac"],
        codec: Codec::Mflac,
        output: Some("flac"),
    },
    Route {
        extensions: &["mgg"],
        codec: Codec::Unsupported,
        output: None,
    },
];

/// Look up the route for a file by its extension (without the dot).
pub fn route_for_extension(ext: &str) -> Option<&'static Route> {
    ROUTES
        .iter()
        .find(|r| r.extensions.iter().any(|e| *e == ext))
}

pub fn route_for(path: &Path) -> Option<&'static Route> {
    route_for_extension(path.extension()?.to_str()?)
}
