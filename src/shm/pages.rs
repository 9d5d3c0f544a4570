//! Offset/length copies over one or more mapped pages
//!
//! A contiguous mapping is a table with a single page spanning the whole
//! region. The paged backend maps one page per OS segment; copies that cross
//! a page boundary are split transparently.

use std::ptr::NonNull;

use crate::error::ShmError;

/// Base pointers of the mapped pages of one region
pub(crate) struct PageTable {
    pages: Vec<NonNull<u8>>,
    page_len: usize,
    size: usize,
}

// SAFETY: the table only hands out copies through `&self`/`&mut self` of the
// owning segment type; the pointed-to memory lives as long as the mapping
// that owns this table.
unsafe impl Send for PageTable {}

impl PageTable {
    /// Single mapping covering `size` bytes
    pub(crate) fn contiguous(base: NonNull<u8>, size: usize) -> Self {
        Self {
            pages: vec![base],
            page_len: size.max(1),
            size,
        }
    }

    /// `pages.len()` mappings of `page_len` bytes each, exposing `size` bytes
    pub(crate) fn paged(pages: Vec<NonNull<u8>>, page_len: usize, size: usize) -> Self {
        debug_assert!(pages.len() * page_len >= size);
        Self {
            pages,
            page_len,
            size,
        }
    }

    pub(crate) fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn page_ptr(&self, page: usize) -> Option<NonNull<u8>> {
        self.pages.get(page).copied()
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), ShmError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(ShmError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    /// Calls `f(page_ptr, buf_offset, len)` for each page-local piece of
    /// the byte range `offset..offset + len`
    fn for_each_span(&self, offset: usize, len: usize, mut f: impl FnMut(*mut u8, usize, usize)) {
        let mut done = 0;
        while done < len {
            let pos = offset + done;
            let page = pos / self.page_len;
            let page_offset = pos % self.page_len;
            let n = (self.page_len - page_offset).min(len - done);
            // SAFETY: `check` guarantees `pos + n <= size <= pages * page_len`,
            // so the pointer stays within page `page`.
            let ptr = unsafe { self.pages[page].as_ptr().add(page_offset) };
            f(ptr, done, n);
            done += n;
        }
    }

    /// Copy `data` into the region at `offset`
    pub(crate) fn copy_in(&self, offset: usize, data: &[u8]) -> Result<(), ShmError> {
        self.check(offset, data.len())?;
        self.for_each_span(offset, data.len(), |dst, at, n| {
            // SAFETY: `dst..dst + n` lies inside a writable mapping and
            // cannot overlap the caller's buffer.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr().add(at), dst, n) }
        });
        Ok(())
    }

    /// Copy `out.len()` bytes out of the region starting at `offset`
    pub(crate) fn copy_out(&self, offset: usize, out: &mut [u8]) -> Result<(), ShmError> {
        self.check(offset, out.len())?;
        let len = out.len();
        let out_ptr = out.as_mut_ptr();
        self.for_each_span(offset, len, |src, at, n| {
            // SAFETY: `src..src + n` lies inside a readable mapping and
            // `at + n <= out.len()`.
            unsafe { std::ptr::copy_nonoverlapping(src as *const u8, out_ptr.add(at), n) }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_table(pages: &mut [Vec<u8>], page_len: usize, size: usize) -> PageTable {
        let ptrs = pages
            .iter_mut()
            .map(|p| NonNull::new(p.as_mut_ptr()).unwrap())
            .collect();
        PageTable::paged(ptrs, page_len, size)
    }

    #[test]
    fn test_copy_across_page_boundary() {
        let mut pages = vec![vec![0u8; 8], vec![0u8; 8], vec![0u8; 8]];
        let table = heap_table(&mut pages, 8, 20);

        let data: Vec<u8> = (1..=12).collect();
        table.copy_in(5, &data).unwrap();

        let mut out = vec![0u8; 12];
        table.copy_out(5, &mut out).unwrap();
        assert_eq!(out, data);

        assert_eq!(&pages[0][5..], &[1, 2, 3]);
        assert_eq!(&pages[1][..], &[4, 5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(&pages[2][..1], &[12]);
    }

    #[test]
    fn test_contiguous_matches_paged() {
        let mut flat = vec![0u8; 20];
        let contiguous = PageTable::contiguous(NonNull::new(flat.as_mut_ptr()).unwrap(), 20);
        let mut pages = vec![vec![0u8; 4]; 5];
        let paged = heap_table(&mut pages, 4, 20);

        let data: Vec<u8> = (0..20).map(|i| i * 3).collect();
        contiguous.copy_in(0, &data).unwrap();
        paged.copy_in(0, &data).unwrap();

        for (offset, len) in [(0, 20), (3, 9), (4, 4), (19, 1), (7, 0)] {
            let mut a = vec![0u8; len];
            let mut b = vec![0u8; len];
            contiguous.copy_out(offset, &mut a).unwrap();
            paged.copy_out(offset, &mut b).unwrap();
            assert_eq!(a, b, "offset {} len {}", offset, len);
        }
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let mut pages = vec![vec![0u8; 8], vec![0u8; 8]];
        let table = heap_table(&mut pages, 8, 12);

        assert!(matches!(
            table.copy_in(10, &[0u8; 4]),
            Err(ShmError::OutOfBounds { offset: 10, len: 4, size: 12 })
        ));
        let mut out = [0u8; 1];
        assert!(table.copy_out(usize::MAX, &mut out).is_err());
        assert!(table.copy_out(11, &mut out).is_ok());
    }
}
