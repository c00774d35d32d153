use std::{io, path::Path, sync::Arc};

mod mem;
mod native;

pub use mem::MemFile;
pub use native::NativeFile;

/// Positional file access used by [crate::FileBlockStore]
pub trait FsFile: Send + Sync {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;
    fn set_len(&self, size: u64) -> io::Result<()>;
    fn len(&self) -> io::Result<u64>;
    fn sync_all(&self) -> io::Result<()>;
}

/// Opens (or creates) the file at `path` for reading and writing.
/// The file is truncated when `truncate` is set.
pub fn open_native(path: &Path, truncate: bool) -> io::Result<Arc<dyn FsFile>> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .truncate(truncate)
        .create(true)
        .open(path)?;
    Ok(Arc::new(NativeFile(file)))
}
