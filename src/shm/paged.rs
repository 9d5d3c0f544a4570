//! System V shared memory backend, one OS segment per page
//!
//! Page `i` of a region with key `k` lives under IPC key
//! `k * KEY_STRIDE + i`. Readers attach page by page with `SHM_RDONLY`;
//! the creator marks every page `IPC_RMID` on release.

use std::io;
use std::ptr::NonNull;

use super::pages::PageTable;
use super::segment::{Mapping, SegmentId};
use crate::error::ShmError;

/// Maximum pages per region; also the IPC key spacing between regions
const KEY_STRIDE: i32 = 4096;

pub(crate) struct PagedMapping {
    name: String,
    ids: Vec<libc::c_int>,
    pages: PageTable,
    released: bool,
}

// SAFETY: the attached pages are owned by exactly one segment handle.
unsafe impl Send for PagedMapping {}

pub(crate) fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

fn last_os_error(id: &SegmentId, what: &str) -> ShmError {
    ShmError::Os {
        segment: id.to_string(),
        reason: format!("{}: {}", what, io::Error::last_os_error()),
    }
}

fn page_key(id: &SegmentId, page: usize) -> Result<libc::key_t, ShmError> {
    id.key()
        .checked_mul(KEY_STRIDE)
        .and_then(|base| base.checked_add(page as i32))
        .map(|k| k as libc::key_t)
        .ok_or_else(|| ShmError::InvalidName(id.to_string()))
}

fn page_count(size: usize, page_len: usize) -> Result<usize, ShmError> {
    let count = size.div_ceil(page_len);
    if count == 0 || count > KEY_STRIDE as usize {
        return Err(ShmError::InvalidSize(size));
    }
    Ok(count)
}

/// Attach a page; `None` when `shmat` fails
fn attach_page(shm_id: libc::c_int, read_only: bool) -> Option<NonNull<u8>> {
    let flags = if read_only { libc::SHM_RDONLY } else { 0 };
    let ptr = unsafe { libc::shmat(shm_id, std::ptr::null(), flags) };
    if ptr as isize == -1 {
        None
    } else {
        NonNull::new(ptr as *mut u8)
    }
}

unsafe fn detach_all(pages: &[NonNull<u8>]) {
    for page in pages {
        libc::shmdt(page.as_ptr() as *const libc::c_void);
    }
}

unsafe fn remove_all(ids: &[libc::c_int]) {
    for id in ids {
        libc::shmctl(*id, libc::IPC_RMID, std::ptr::null_mut());
    }
}

impl PagedMapping {
    pub(crate) fn create(id: &SegmentId, size: usize) -> Result<Self, ShmError> {
        let page_len = page_size();
        let count = page_count(size, page_len)?;

        let mut ids = Vec::with_capacity(count);
        let mut ptrs = Vec::with_capacity(count);

        for page in 0..count {
            let key = page_key(id, page)?;
            let shm_id =
                unsafe { libc::shmget(key, page_len, libc::IPC_CREAT | libc::IPC_EXCL | 0o644) };
            if shm_id == -1 {
                let err = io::Error::last_os_error();
                unsafe {
                    detach_all(&ptrs);
                    remove_all(&ids);
                }
                return Err(if err.raw_os_error() == Some(libc::EEXIST) {
                    ShmError::AlreadyExists(id.to_string())
                } else {
                    ShmError::Os {
                        segment: id.to_string(),
                        reason: format!("shmget: {}", err),
                    }
                });
            }
            ids.push(shm_id);

            match attach_page(shm_id, false) {
                Some(ptr) => ptrs.push(ptr),
                None => {
                    let err = last_os_error(id, "shmat");
                    unsafe {
                        detach_all(&ptrs);
                        remove_all(&ids);
                    }
                    return Err(err);
                }
            }
        }

        // Fresh System V segments are zero-filled by the kernel.
        Ok(Self {
            name: id.to_string(),
            ids,
            pages: PageTable::paged(ptrs, page_len, size),
            released: false,
        })
    }

    pub(crate) fn attach(id: &SegmentId, size: usize) -> Result<Self, ShmError> {
        let page_len = page_size();
        let count = page_count(size, page_len)?;

        let mut ids = Vec::with_capacity(count);
        let mut ptrs = Vec::with_capacity(count);

        for page in 0..count {
            let key = page_key(id, page)?;
            let shm_id = unsafe { libc::shmget(key, page_len, 0o444) };
            if shm_id == -1 {
                let err = io::Error::last_os_error();
                unsafe { detach_all(&ptrs) };
                return Err(match err.raw_os_error() {
                    Some(libc::ENOENT) => ShmError::NotFound(id.to_string()),
                    Some(libc::EINVAL) => ShmError::SizeMismatch {
                        name: id.to_string(),
                        expected: size,
                        actual: page * page_len,
                    },
                    _ => ShmError::Os {
                        segment: id.to_string(),
                        reason: format!("shmget: {}", err),
                    },
                });
            }
            ids.push(shm_id);

            match attach_page(shm_id, true) {
                Some(ptr) => ptrs.push(ptr),
                None => {
                    let err = last_os_error(id, "shmat");
                    unsafe { detach_all(&ptrs) };
                    return Err(err);
                }
            }
        }

        Ok(Self {
            name: id.to_string(),
            ids,
            pages: PageTable::paged(ptrs, page_len, size),
            released: false,
        })
    }
}

impl Mapping for PagedMapping {
    fn pages(&self) -> &PageTable {
        &self.pages
    }

    fn release(&mut self, destroy: bool) {
        if self.released {
            return;
        }
        self.released = true;
        tracing::trace!(
            "Releasing {} pages of {} (destroy: {})",
            self.pages.page_count(),
            self.name,
            destroy
        );
        for page in 0..self.pages.page_count() {
            if let Some(ptr) = self.pages.page_ptr(page) {
                unsafe { libc::shmdt(ptr.as_ptr() as *const libc::c_void) };
            }
        }
        if destroy {
            unsafe { remove_all(&self.ids) };
        }
    }
}

impl Drop for PagedMapping {
    fn drop(&mut self) {
        self.release(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_count() {
        assert_eq!(page_count(1, 4096).unwrap(), 1);
        assert_eq!(page_count(4096, 4096).unwrap(), 1);
        assert_eq!(page_count(4097, 4096).unwrap(), 2);
        assert!(page_count(0, 4096).is_err());
        assert!(page_count(4096 * 4097, 4096).is_err());
    }

    #[test]
    fn test_page_keys_do_not_overlap() {
        let a = SegmentId::from_key(1000);
        let b = SegmentId::from_key(1001);
        let last_of_a = page_key(&a, (KEY_STRIDE - 1) as usize).unwrap();
        let first_of_b = page_key(&b, 0).unwrap();
        assert!(last_of_a < first_of_b);
        assert!(page_key(&SegmentId::from_key(i32::MAX), 0).is_err());
    }
}
