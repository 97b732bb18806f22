use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use time::OffsetDateTime;
use time::macros::format_description;

/// Extension given to textual bodies when nothing better is known.
pub(crate) const DEFAULT_EXT: &str = ".txt";

/// Creates the requested-data directory with owner-only permissions.
/// Request bodies may hold user data.
pub async fn ensure_private_dir(dir: &Utf8Path) -> io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir).await
}

/// Writes `data` to a fresh file inside `data_dir` and returns its path.
///
/// `name` is either a bare extension (".json") or a file name; extensions
/// are appended to the timestamp directly, names with an underscore.
pub(crate) async fn to_file_from_bytes(data: &[u8], name: &str, data_dir: &Utf8Path) -> io::Result<Utf8PathBuf> {
    ensure_private_dir(data_dir).await?;
    let path = data_dir.join(build_file_name(name));
    tokio::fs::write(&path, data).await?;
    Ok(path)
}

/// An empty body file, for responses without a `path`.
pub(crate) async fn empty_body_file(data_dir: &Utf8Path) -> io::Result<Utf8PathBuf> {
    to_file_from_bytes(&[], DEFAULT_EXT, data_dir).await
}

fn build_file_name(name: &str) -> String {
    let now = OffsetDateTime::now_utc();
    let stamp = now
        .format(format_description!(
            "[year][month][day][hour][minute][second]"
        ))
        .expect("static format description");
    let micros = now.microsecond();
    if name.starts_with('.') {
        format!("{stamp}{micros}{name}")
    } else {
        format!("{stamp}{micros}_{name}")
    }
}

pub(crate) async fn remove_file_logged(path: &Utf8Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        warn!(%error, %path, "failed to remove temporary file");
    }
}
