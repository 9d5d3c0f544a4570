//! POSIX shared memory backend: `shm_open` + `mmap`
//!
//! - **Create**: `shm_open(O_CREAT | O_EXCL | O_RDWR)` + `ftruncate` + `mmap`
//! - **Attach**: `shm_open(O_RDONLY)` + size check + `mmap(PROT_READ)`
//! - **Release**: `munmap`, plus `shm_unlink` for the creator

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use super::pages::PageTable;
use super::segment::{Mapping, SegmentId};
use crate::error::ShmError;

pub(crate) struct PosixMapping {
    path: String,
    map_ptr: NonNull<libc::c_void>,
    map_len: usize,
    pages: PageTable,
    released: bool,
}

// SAFETY: the mapping is owned by exactly one segment handle.
unsafe impl Send for PosixMapping {}

fn os_error(id: &SegmentId, errno: Errno) -> ShmError {
    ShmError::Os {
        segment: id.to_string(),
        reason: errno.desc().to_string(),
    }
}

impl PosixMapping {
    pub(crate) fn create(id: &SegmentId, size: usize) -> Result<Self, ShmError> {
        let path = id.posix_path();
        let len = NonZeroUsize::new(size).ok_or(ShmError::InvalidSize(size))?;

        let fd = mman::shm_open(
            path.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
        )
        .map_err(|e| match e {
            Errno::EEXIST => ShmError::AlreadyExists(id.to_string()),
            other => os_error(id, other),
        })?;

        let mapped = unistd::ftruncate(&fd, size as libc::off_t).and_then(|_| unsafe {
            mman::mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        });

        let map_ptr = match mapped {
            Ok(ptr) => ptr,
            Err(e) => {
                let _ = mman::shm_unlink(path.as_str());
                return Err(os_error(id, e));
            }
        };

        // The descriptor is not needed once the mapping exists.
        drop(fd);

        Ok(Self {
            pages: PageTable::contiguous(map_ptr.cast::<u8>(), size),
            path,
            map_ptr,
            map_len: size,
            released: false,
        })
    }

    pub(crate) fn attach(id: &SegmentId, size: usize) -> Result<Self, ShmError> {
        let path = id.posix_path();
        let len = NonZeroUsize::new(size).ok_or(ShmError::InvalidSize(size))?;

        let fd = mman::shm_open(path.as_str(), OFlag::O_RDONLY, Mode::empty()).map_err(|e| {
            match e {
                Errno::ENOENT => ShmError::NotFound(id.to_string()),
                other => os_error(id, other),
            }
        })?;
        let file = File::from(fd);

        let actual = file
            .metadata()
            .map_err(|e| ShmError::Os {
                segment: id.to_string(),
                reason: e.to_string(),
            })?
            .len() as usize;
        if actual < size {
            return Err(ShmError::SizeMismatch {
                name: id.to_string(),
                expected: size,
                actual,
            });
        }

        let map_ptr = unsafe {
            mman::mmap(None, len, ProtFlags::PROT_READ, MapFlags::MAP_SHARED, &file, 0)
                .map_err(|e| os_error(id, e))?
        };

        Ok(Self {
            pages: PageTable::contiguous(map_ptr.cast::<u8>(), size),
            path,
            map_ptr,
            map_len: size,
            released: false,
        })
    }
}

impl Mapping for PosixMapping {
    fn pages(&self) -> &PageTable {
        &self.pages
    }

    fn release(&mut self, destroy: bool) {
        if self.released {
            return;
        }
        self.released = true;
        unsafe {
            if let Err(e) = mman::munmap(self.map_ptr, self.map_len) {
                tracing::warn!("munmap {} failed: {}", self.path, e);
            }
        }
        if destroy {
            if let Err(e) = mman::shm_unlink(self.path.as_str()) {
                tracing::warn!("shm_unlink {} failed: {}", self.path, e);
            }
        }
    }
}

impl Drop for PosixMapping {
    fn drop(&mut self) {
        // Segment handles always release explicitly; this only unmaps.
        self.release(false);
    }
}
