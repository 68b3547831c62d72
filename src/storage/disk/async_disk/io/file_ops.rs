use std::fmt;
use std::fs::File;
use std::io;

/// Positional file primitives used by I/O requests.
///
/// Each call may transfer fewer bytes than asked; the request state machine resubmits
/// the remainder. Implementations run on blocking worker threads.
pub trait FileOps: Send + Sync + fmt::Debug {
    fn write_at(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<usize>;
    fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

/// `pwrite`/`pread` on Unix, seek-based positional I/O on Windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct PositionalFileOps;

impl FileOps for PositionalFileOps {
    #[cfg(unix)]
    fn write_at(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(file, buf, offset)
    }

    #[cfg(unix)]
    fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(file, buf, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(file, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(file, buf, offset)
    }
}
