use alloc::vec;

use crate::config::{MAX_PATH_LEN, MAX_STR_LEN, PAGE_SIZE};
use crate::error::{SysError, SysResult};
use crate::fs::error::FsError;
use crate::fs::fd::{File, FileKind, FileRef};
use crate::fs::{InodeKind, OpenFlags};
use crate::kernel::Kernel;
use crate::scheduler::task::ThreadRef;

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// `fstat` result as laid out for user programs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub pad: [u64; 7],
}

impl Kernel {
    fn file(&self, cur: ThreadRef, fd: isize) -> SysResult<FileRef> {
        let p = self.procs.lock(cur.proc)?;
        p.files.get(fd).map_err(|e| {
            log::error!("invalid fd {}", fd);
            e
        })
    }

    pub(super) fn sys_write(&self, cur: ThreadRef, fd: isize, va: u64, len: usize) -> SysResult<isize> {
        let file = self.file(cur, fd)?;
        self.with_space(cur, |space, _| space.check_user_readable(va, len))?;
        let is_stdio = matches!(file.lock().kind, FileKind::Stdio);
        let chunk_len = if is_stdio { MAX_STR_LEN } else { PAGE_SIZE };
        let mut buf = vec![0u8; chunk_len.min(len)];
        let mut done = 0;
        while done < len {
            let n = chunk_len.min(len - done);
            self.with_space(cur, |space, mem| space.copy_in(mem, &mut buf[..n], va + done as u64))?;
            if is_stdio {
                self.machine.console_write(&buf[..n]);
                done += n;
                continue;
            }
            let written = file.lock().write(&buf[..n])?;
            done += written;
            if written < n {
                break;
            }
        }
        Ok(done as isize)
    }

    pub(super) fn sys_read(&self, cur: ThreadRef, fd: isize, va: u64, len: usize) -> SysResult<isize> {
        let file = self.file(cur, fd)?;
        self.with_space(cur, |space, _| space.check_user_writable(va, len))?;
        let is_stdio = matches!(file.lock().kind, FileKind::Stdio);
        let mut buf = vec![0u8; PAGE_SIZE.min(len)];
        let mut done = 0;
        while done < len {
            let n = PAGE_SIZE.min(len - done);
            let got = if is_stdio {
                for byte in buf[..n].iter_mut() {
                    *byte = self.console_getc()?;
                }
                n
            } else {
                file.lock().read(&mut buf[..n])?
            };
            self.with_space(cur, |space, mem| space.copy_out(mem, va + done as u64, &buf[..got]))?;
            done += got;
            if got < n {
                break;
            }
        }
        Ok(done as isize)
    }

    /// Blocks (yielding) until the console has a byte.
    fn console_getc(&self) -> SysResult<u8> {
        loop {
            if let Some(c) = self.machine.console_getc() {
                return Ok(c);
            }
            self.yield_now()?;
        }
    }

    pub(super) fn sys_openat(&self, cur: ThreadRef, path_va: u64, mode: u32) -> SysResult<isize> {
        let path = self.user_string(cur, path_va, MAX_PATH_LEN)?;
        let flags = OpenFlags::from_bits_truncate(mode);
        let inode = self.fs.open(&path, flags)?;
        let fd = self.procs.lock(cur.proc)?.files.alloc(File::new_inode(inode, flags))?;
        log::debug!("openat: '{}' -> fd {}", path, fd);
        Ok(fd as isize)
    }

    pub(super) fn sys_close(&self, cur: ThreadRef, fd: isize) -> SysResult<isize> {
        self.procs.lock(cur.proc)?.files.close(fd).map_err(|e| {
            log::error!("invalid fd {}", fd);
            e
        })?;
        Ok(0)
    }

    pub(super) fn sys_fstat(&self, cur: ThreadRef, fd: isize, va: u64) -> SysResult<isize> {
        let file = self.file(cur, fd)?;
        let st = file.lock().inode()?.stat();
        let stat = Stat {
            dev: st.dev,
            ino: st.ino,
            mode: match st.kind {
                InodeKind::Directory => S_IFDIR,
                InodeKind::File => S_IFREG,
            },
            nlink: st.nlink,
            pad: [0; 7],
        };
        self.copy_out_value(cur, va, &stat)?;
        Ok(0)
    }

    pub(super) fn sys_linkat(&self, cur: ThreadRef, old_va: u64, new_va: u64) -> SysResult<isize> {
        let old_path = self.user_string(cur, old_va, MAX_PATH_LEN)?;
        let new_path = self.user_string(cur, new_va, MAX_PATH_LEN)?;
        if old_path == new_path {
            return Err(SysError::Fs(FsError::AlreadyExists));
        }
        self.fs.link(&old_path, &new_path)?;
        Ok(0)
    }

    pub(super) fn sys_unlinkat(&self, cur: ThreadRef, path_va: u64) -> SysResult<isize> {
        let path = self.user_string(cur, path_va, MAX_PATH_LEN)?;
        self.fs.unlink(&path)?;
        Ok(0)
    }
}
