//! Unpacking the tor runtime distribution (`.tar.gz`) onto disk.
use crate::errors::{Error, Result};
use bytes::Bytes;
use flate2::read::GzDecoder;
use std::fs;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Where the runtime archive comes from.
#[derive(Debug, Clone)]
pub enum RuntimeArchive {
  /// A `.tar.gz` on disk
  File(PathBuf),
  /// An in-memory `.tar.gz`
  Bytes(Bytes),
}

impl RuntimeArchive {
  /// The archive compiled into the binary.
  ///
  /// Its path is taken from `RKN_BYPASSER_TOR_ARCHIVE` at build time.
  #[cfg(feature = "bundled-tor")]
  pub fn bundled() -> Self {
    RuntimeArchive::Bytes(Bytes::from_static(include_bytes!(env!(
      "RKN_BYPASSER_TOR_ARCHIVE"
    ))))
  }
  fn open(&self) -> std::io::Result<Box<dyn Read + Send>> {
    Ok(match self {
      RuntimeArchive::File(path) => Box::new(BufReader::new(fs::File::open(path)?)),
      RuntimeArchive::Bytes(bytes) => Box::new(Cursor::new(bytes.clone())),
    })
  }
}

/// Make sure `path` holds the runtime, extracting `archive` when it is missing.
///
/// An existing directory is left untouched. Extraction goes into a sibling
/// staging directory that is renamed into place once every entry is written.
pub async fn ensure_staged(
  path: &Path,
  archive: Option<&RuntimeArchive>,
  token: &CancellationToken,
) -> Result<()> {
  match tokio::fs::metadata(path).await {
    Ok(meta) if meta.is_dir() => {
      tracing::debug!(path = %path.display(), "tor runtime already staged");
      return Ok(());
    }
    Ok(_) => {
      return Err(Error::Stage(format!(
        "expected tor path `{}` to be a directory but found a file",
        path.display()
      )))
    }
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
    Err(e) => return Err(Error::Stage(format!("stat `{}`: {e}", path.display()))),
  }
  let archive = archive.cloned().ok_or_else(|| {
    Error::Stage(format!(
      "tor path `{}` does not exist and no runtime archive is configured",
      path.display()
    ))
  })?;
  let staging = staging_path(path)?;
  let target = path.to_path_buf();
  let token = token.clone();
  tracing::info!(path = %target.display(), "extracting tor runtime");
  tokio::task::spawn_blocking(move || {
    let result = unpack(&archive, &staging, &token).and_then(|_| {
      fs::rename(&staging, &target)
        .map_err(|e| Error::Stage(format!("move into `{}`: {e}", target.display())))
    });
    if result.is_err() {
      let _ = fs::remove_dir_all(&staging);
    }
    result
  })
  .await
  .map_err(|e| Error::Stage(format!("extraction task: {e}")))?
}

fn staging_path(path: &Path) -> Result<PathBuf> {
  let name = path
    .file_name()
    .ok_or_else(|| Error::Stage(format!("invalid tor path `{}`", path.display())))?;
  let mut staging = name.to_os_string();
  staging.push(".staging");
  Ok(path.with_file_name(staging))
}

fn unpack(archive: &RuntimeArchive, staging: &Path, token: &CancellationToken) -> Result<()> {
  let stage_err = |what: &str, e: std::io::Error| Error::Stage(format!("{what}: {e}"));
  // 上次中断留下的残留
  if staging.exists() {
    fs::remove_dir_all(staging).map_err(|e| stage_err("remove stale staging dir", e))?;
  }
  fs::create_dir_all(staging).map_err(|e| stage_err("create staging dir", e))?;
  let reader = archive.open().map_err(|e| stage_err("open archive", e))?;
  let mut tar = tar::Archive::new(GzDecoder::new(reader));
  let mut count = 0usize;
  for entry in tar.entries().map_err(|e| stage_err("read archive", e))? {
    if token.is_cancelled() {
      return Err(Error::Canceled);
    }
    let mut entry = entry.map_err(|e| stage_err("read archive entry", e))?;
    // unpack_in refuses entries escaping the staging dir
    entry
      .unpack_in(staging)
      .map_err(|e| stage_err("unpack archive entry", e))?;
    count += 1;
  }
  tracing::debug!(entries = count, "tor runtime extracted");
  Ok(())
}
