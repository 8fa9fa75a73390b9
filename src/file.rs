//! Component C: buffered file I/O preserving strict positional semantics
//! across interleaved reads, writes, and seeks.

use crate::error::{Error, ErrorKind, Result};
use crate::perms::Perms;
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

#[derive(Clone, Copy, Debug, Default)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub overwrite: bool,
    pub create: bool,
    pub nocreate: bool,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Whence {
    Start,
    Cur,
    End,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RwFlags {
    pub full_buf: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SyncFlags {
    pub buffer: bool,
    pub os: bool,
}

pub struct File {
    inner: std::fs::File,
    read_buf: VecDeque<u8>,
    write_buf: VecDeque<u8>,
    read_offset: i64,
    buffer_size: usize,
}

impl File {
    pub fn open(path: &Path, mode: OpenMode, buffer_size: usize, perms: Option<&Perms>) -> Result<Self> {
        let mut opts = OpenOptions::new();
        opts.read(mode.read || !mode.write);
        if mode.write || mode.append {
            opts.write(true);
        }
        if mode.append {
            opts.append(true);
        }
        if mode.overwrite {
            opts.truncate(true).create(true);
        }
        if mode.create && !mode.nocreate {
            opts.create(true);
        }
        if mode.nocreate {
            opts.create(false);
        }

        let inner = opts.open(path).map_err(|e| {
            let mut err = Error::from(e);
            err.path = Some(path.to_path_buf());
            err
        })?;

        if let Some(p) = perms {
            #[cfg(unix)]
            {
                use std::os::fd::AsFd;
                p.apply_to_open_file(inner.as_fd())?;
            }
            #[cfg(not(unix))]
            {
                let _ = p;
            }
        }

        Ok(File {
            inner,
            read_buf: VecDeque::new(),
            write_buf: VecDeque::new(),
            read_offset: 0,
            buffer_size,
        })
    }

    fn buffered(&self) -> bool {
        self.buffer_size > 0
    }

    /// Raw, unbuffered OS seek — bypasses read/write buffer bookkeeping.
    fn seek_sys(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let from = match whence {
            Whence::Start => SeekFrom::Start(offset as u64),
            Whence::Cur => SeekFrom::Current(offset),
            Whence::End => SeekFrom::End(offset),
        };
        self.inner.seek(from).map_err(Error::from)
    }

    pub fn read(&mut self, buf: &mut [u8], flags: RwFlags) -> Result<usize> {
        if buf.is_empty() {
            return Err(Error::new(ErrorKind::Invalid));
        }

        if self.buffered() {
            if !self.write_buf.is_empty() {
                self.sync(SyncFlags { buffer: true, os: false })?;
            }

            if self.read_buf.len() >= buf.len() {
                for slot in buf.iter_mut() {
                    *slot = self.read_buf.pop_front().unwrap();
                }
                self.read_offset -= buf.len() as i64;
                return Ok(buf.len());
            }

            let want = self.buffer_size + buf.len() - self.read_buf.len();
            let mut tail = vec![0u8; want];
            let mut read_total = 0usize;
            loop {
                let n = self.inner.read(&mut tail[read_total..]).map_err(Error::from)?;
                read_total += n;
                if n == 0 || !flags.full_buf || read_total >= want {
                    break;
                }
            }
            self.read_buf.extend(&tail[..read_total]);

            let deliver = self.read_buf.len().min(buf.len());
            for slot in buf.iter_mut().take(deliver) {
                *slot = self.read_buf.pop_front().unwrap();
            }
            self.read_offset += read_total as i64 - deliver as i64;
            return Ok(deliver);
        }

        let mut read_total = 0usize;
        loop {
            let n = self.inner.read(&mut buf[read_total..]).map_err(Error::from)?;
            read_total += n;
            if n == 0 || !flags.full_buf || read_total >= buf.len() {
                break;
            }
        }
        Ok(read_total)
    }

    pub fn write(&mut self, buf: &[u8], flags: RwFlags) -> Result<usize> {
        if buf.is_empty() {
            return Err(Error::new(ErrorKind::Invalid));
        }

        if self.buffered() {
            self.seek_sys(-self.read_offset, Whence::Cur)?;
            self.read_buf.clear();
            self.read_offset = 0;

            self.write_buf.extend(buf);
            let wrote = buf.len();

            if self.write_buf.len() < self.buffer_size {
                return Ok(wrote);
            }

            let pending: Vec<u8> = self.write_buf.iter().copied().collect();
            let mut offset = 0usize;
            loop {
                let n = self.inner.write(&pending[offset..]).map_err(Error::from)?;
                offset += n;
                if n == 0 || !flags.full_buf || offset >= pending.len() {
                    break;
                }
            }
            self.write_buf.drain(..offset);
            return Ok(wrote);
        }

        let mut offset = 0usize;
        loop {
            let n = self.inner.write(&buf[offset..]).map_err(Error::from)?;
            offset += n;
            if n == 0 || !flags.full_buf || offset >= buf.len() {
                break;
            }
        }
        Ok(offset)
    }

    pub fn seek(&mut self, mut offset: i64, whence: Whence) -> Result<()> {
        if offset == 0 && whence == Whence::Cur {
            return Ok(());
        }

        if !self.write_buf.is_empty() {
            self.sync(SyncFlags { buffer: true, os: false })?;
        }

        if whence == Whence::Cur && offset > 0 && self.read_buf.len() as i64 >= offset {
            for _ in 0..offset {
                self.read_buf.pop_front();
            }
            self.read_offset -= offset;
            return Ok(());
        }

        self.read_buf.clear();
        if self.read_offset != 0 && whence == Whence::Cur {
            offset -= self.read_offset;
        }
        self.read_offset = 0;
        self.seek_sys(offset, whence)?;
        Ok(())
    }

    /// Flush the write buffer (if requested and non-empty) and/or fsync the OS file.
    pub fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        if flags.buffer && !self.write_buf.is_empty() {
            let data: Vec<u8> = self.write_buf.drain(..).collect();
            let saved_buffer_size = self.buffer_size;
            self.buffer_size = 0;

            let mut offset = 0usize;
            let mut err = None;
            loop {
                match self.inner.write(&data[offset..]) {
                    Ok(0) => break,
                    Ok(n) => {
                        offset += n;
                        if offset >= data.len() {
                            break;
                        }
                    }
                    Err(e) => {
                        err = Some(Error::from(e));
                        break;
                    }
                }
            }

            self.buffer_size = saved_buffer_size;
            if err.is_some() || offset != data.len() {
                self.write_buf.extend(&data[offset..]);
                return Err(err.unwrap_or_else(|| Error::new(ErrorKind::IOError)));
            }
        }

        if flags.os {
            self.inner.sync_all().map_err(Error::from)?;
        }
        Ok(())
    }

    pub fn read_bytes(path: &Path, max_read: usize) -> Result<Vec<u8>> {
        let mut fd = File::open(
            path,
            OpenMode {
                read: true,
                nocreate: true,
                ..Default::default()
            },
            4096,
            None,
        )?;
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = fd.read(&mut chunk, RwFlags { full_buf: false })?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
            if max_read != 0 && out.len() > max_read {
                return Err(Error::new(ErrorKind::FileTooBig));
            }
        }
        Ok(out)
    }

    pub fn write_bytes(path: &Path, buf: &[u8], append: bool) -> Result<usize> {
        let mut fd = File::open(
            path,
            OpenMode {
                write: true,
                append,
                overwrite: !append,
                ..Default::default()
            },
            0,
            None,
        )?;
        fd.write(buf, RwFlags { full_buf: true })
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if let Err(e) = self.sync(SyncFlags { buffer: true, os: false }) {
            log::warn!("error flushing file buffer on close: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn sample(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn buffered_read_then_seek_matches_spec_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0u8..=255).collect();
        let path = sample(&dir, "s4.bin", &data);

        let mut fd = File::open(&path, OpenMode { read: true, nocreate: true, ..Default::default() }, 16, None).unwrap();

        let mut buf = [0u8; 4];
        let n = fd.read(&mut buf, RwFlags::default()).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [0, 1, 2, 3]);
        assert_eq!(fd.read_offset, 16);

        fd.seek(2, Whence::Cur).unwrap();
        assert_eq!(fd.read_offset, 14);

        let mut buf2 = [0u8; 4];
        let n2 = fd.read(&mut buf2, RwFlags::default()).unwrap();
        assert_eq!(n2, 4);
        assert_eq!(buf2, [6, 7, 8, 9]);
    }

    #[test]
    fn write_buffer_partial_flush_tail_seeds_new_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.bin");
        let mut fd = File::open(&path, OpenMode { write: true, overwrite: true, ..Default::default() }, 8, None).unwrap();

        fd.write(b"abcdefghij", RwFlags { full_buf: true }).unwrap();
        assert!(fd.write_buf.len() < 8);

        fd.sync(SyncFlags { buffer: true, os: false }).unwrap();
        drop(fd);

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk, b"abcdefghij");
    }

    #[test]
    fn unbuffered_write_goes_straight_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("u.bin");
        let mut fd = File::open(&path, OpenMode { write: true, overwrite: true, ..Default::default() }, 0, None).unwrap();
        let n = fd.write(b"hello", RwFlags { full_buf: true }).unwrap();
        assert_eq!(n, 5);
        drop(fd);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn read_bytes_helper_reads_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample(&dir, "rb.txt", b"the quick brown fox");
        let out = File::read_bytes(&path, 0).unwrap();
        assert_eq!(out, b"the quick brown fox");
    }
}
