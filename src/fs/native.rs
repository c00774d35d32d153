use std::{fs::File, io};

use super::FsFile;

/// Fails the surrounding io call when the `name` failpoint is configured
macro_rules! io_failpoint {
    ($name:literal) => {
        fail::fail_point!($name, |s| Err(io::Error::other(format!(
            "failpoint {} {s:?}",
            $name
        ))))
    };
}

/// [FsFile] backed by a regular file
#[derive(Debug)]
pub struct NativeFile(pub File);

#[cfg(unix)]
impl NativeFile {
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(&self.0, buf, offset)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(&self.0, buf, offset)
    }
}

// The block store serializes accesses, so seeking the shared cursor is fine
#[cfg(not(unix))]
impl NativeFile {
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use io::{Read, Seek};
        let mut file = &self.0;
        file.seek(io::SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use io::{Seek, Write};
        let mut file = &self.0;
        file.seek(io::SeekFrom::Start(offset))?;
        file.write_all(buf)
    }
}

impl FsFile for NativeFile {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        io_failpoint!("fread");
        self.pread(buf, offset)
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        io_failpoint!("fwrite");
        self.pwrite(buf, offset)
    }

    fn set_len(&self, size: u64) -> io::Result<()> {
        io_failpoint!("ftruncate");
        self.0.set_len(size)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.0.metadata()?.len())
    }

    fn sync_all(&self) -> io::Result<()> {
        io_failpoint!("fsync");
        self.0.sync_all()
    }
}
