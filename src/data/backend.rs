/// Tick file backend: one capability interface over the day-file formats
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::registry::sanitize_symbol;
use crate::types::Tick;

/// Storage backend for per-symbol-per-day tick files. The current-day
/// file is append-only; past days are read-only. Implementations own
/// any open handles and serialize writes per symbol through the
/// store's single writer task.
#[async_trait]
pub trait TickBackend: Send + Sync {
    /// File extension including the dot, e.g. ".json"
    fn file_ext(&self) -> &'static str;

    /// Append a batch to the day file, durably (fsync on commit)
    async fn append_batch(&self, symbol: &str, day: &str, ticks: &[Tick]) -> Result<()>;

    /// Read ticks within [from, to] from one day file, in file order.
    /// A missing day yields an empty vec (sparse history).
    async fn read_range(
        &self,
        symbol: &str,
        day: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Tick>>;

    /// Close any open handle for the day (rotation at UTC midnight)
    async fn close_day(&self, symbol: &str, day: &str) -> Result<()>;

    /// Compress the day file into `<SYMBOL>/archive/<day><ext>.gz` and
    /// remove the original. Returns the archive path.
    async fn archive_day(&self, symbol: &str, day: &str) -> Result<PathBuf>;
}

/// `<root>/ticks/<SYMBOL>` with the symbol re-validated before path
/// use; nothing outside the per-symbol directory is ever touched.
pub fn symbol_dir(root: &Path, symbol: &str) -> Result<PathBuf> {
    let symbol = sanitize_symbol(symbol)?;
    Ok(root.join("ticks").join(symbol))
}

/// Gzip `src` into `dst` atomically (temp file + rename), then remove
/// `src`. Blocking; callers run it inside `spawn_blocking`.
pub fn gzip_file_blocking(src: &Path, dst: &Path) -> std::io::Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let bytes = std::fs::read(src)?;
    let tmp = dst.with_extension("gz.tmp");
    {
        let file = std::fs::File::create(&tmp)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&bytes)?;
        let file = encoder.finish()?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, dst)?;
    std::fs::remove_file(src)?;
    Ok(())
}
