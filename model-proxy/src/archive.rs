use std::fs::File;
use std::io::{Read as _, Seek as _, SeekFrom};

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;

/// Archive formats the platform ships: zip or tar.gz. Plain tar shows up
/// from some tooling and costs nothing to accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Zip,
    Tar,
    TarGz,
}

/// Unpacks `archive` into `dest`, auto-detecting the format by header.
///
/// When detection fails the file is treated as tar.gz: the platform only
/// stores zip and tar.gz, so an unrecognized header is a gzip stream.
pub async fn unarchive(archive: &Utf8Path, dest: &Utf8Path) -> anyhow::Result<()> {
    let archive = archive.to_owned();
    let dest = dest.to_owned();
    tokio::task::spawn_blocking(move || unarchive_blocking(&archive, &dest))
        .await
        .context("unarchive task failed")?
}

fn unarchive_blocking(archive: &Utf8Path, dest: &Utf8Path) -> anyhow::Result<()> {
    let mut file = File::open(archive).with_context(|| format!("failed to open archive {archive}"))?;
    let format = sniff_format(&mut file)?;
    file.seek(SeekFrom::Start(0))?;

    match format {
        Format::Zip => {
            let mut zip = zip::ZipArchive::new(file).context("failed to read zip archive")?;
            zip.extract(dest.as_std_path()).context("failed to extract zip archive")?;
        }
        Format::Tar => {
            tar::Archive::new(file)
                .unpack(dest.as_std_path())
                .context("failed to extract tar archive")?;
        }
        Format::TarGz => {
            tar::Archive::new(GzDecoder::new(file))
                .unpack(dest.as_std_path())
                .context("failed to extract tar.gz archive")?;
        }
    }
    Ok(())
}

fn sniff_format(file: &mut File) -> anyhow::Result<Format> {
    let mut header = [0u8; 262];
    let read = file.read(&mut header)?;
    let header = &header[..read];

    if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
        return Ok(Format::Zip);
    }
    if header.len() >= 262 && &header[257..262] == b"ustar" {
        return Ok(Format::Tar);
    }
    Ok(Format::TarGz)
}

/// Path for a scratch download next to nothing else.
pub(crate) fn scratch_file(prefix: &str) -> anyhow::Result<Utf8PathBuf> {
    let tmp = Utf8PathBuf::from_path_buf(std::env::temp_dir())
        .map_err(|path| anyhow::anyhow!("non UTF-8 temp dir: {path:?}"))?;
    Ok(tmp.join(format!("{prefix}-{}", uuid::Uuid::new_v4())))
}
