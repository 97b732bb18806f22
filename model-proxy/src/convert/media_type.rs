use super::fileio::DEFAULT_EXT;

/// Extension for binary bodies of unknown media type.
const DEFAULT_BINARY_EXT: &str = ".bin";

/// Maps a `Content-Type` to the extension given to its body file.
///
/// An empty or absent value means a GET query string or a bare form field
/// in multipart/form-data and stays textual.
pub(crate) fn ext_for(content_type: Option<&str>) -> &'static str {
    let raw = match content_type {
        Some(raw) if !raw.is_empty() => raw,
        _ => return DEFAULT_EXT,
    };

    let essence = match raw.parse::<mime::Mime>() {
        Ok(mime) => mime.essence_str().to_ascii_lowercase(),
        Err(error) => {
            warn!(%error, content_type = raw, "failed to parse `Content-Type` header");
            String::new()
        }
    };

    match essence.as_str() {
        "application/javascript" => ".js",
        "application/json" => ".json",
        "application/pdf" => ".pdf",
        "application/x-www-form-urlencoded" => ".txt",
        "audio/midi" => ".midi",
        "audio/mpeg" => ".mpg",
        "audio/ogg" => ".oga",
        "audio/wav" => ".wav",
        "audio/webm" => ".webm",
        "image/bmp" => ".bmp",
        "image/gif" => ".gif",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/svg+xml" => ".svg",
        "image/webp" => ".webp",
        "text/csv" => ".csv",
        "text/html" => ".html",
        "text/markdown" => ".md",
        "text/plain" => ".txt",
        "text/xml" => ".xml",
        "video/avi" => ".avi",
        "video/mp4" => ".mp4",
        "video/ogg" => ".ogv",
        "video/quicktime" => ".qt",
        "video/webm" => ".webm",
        "video/x-matroska" => ".mkv",
        _ => {
            if raw.to_ascii_lowercase().starts_with("text") {
                DEFAULT_EXT
            } else {
                DEFAULT_BINARY_EXT
            }
        }
    }
}
