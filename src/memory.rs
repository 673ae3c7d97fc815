//! Physical memory: the frame table plus a word-addressable store.
//!
//! Frames are fixed-size slots; a slot is either empty or owned by exactly
//! one `(pid, page)` pair. Words live in a sparse map keyed by physical byte
//! address, so untouched memory reads as zero. A single internal lock makes
//! every operation appear atomic; callers never observe a torn frame.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::Pid;

/// Identity of a logical page: owning process and page number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PageId {
    /// Owning process.
    pub pid: Pid,
    /// Logical page number within the owner's address space.
    pub page: usize,
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}_page{}", self.pid, self.page)
    }
}

/// Fixed array of frames plus the word store.
#[derive(Debug)]
pub struct PhysicalMemory {
    inner: Mutex<MemInner>,
    total_bytes: usize,
    frame_size: usize,
    total_frames: usize,
}

#[derive(Debug)]
struct MemInner {
    /// Frame occupancy; `Some` iff the frame is resident.
    frames: Vec<Option<PageId>>,
    /// Physical byte address of a word's first byte -> word.
    words: HashMap<usize, u16>,
}

impl PhysicalMemory {
    /// Create physical memory of `total_bytes` split into `frame_size` frames.
    ///
    /// Both must be powers of two with `frame_size` dividing `total_bytes`;
    /// the configuration layer guarantees this.
    #[must_use]
    pub fn new(total_bytes: usize, frame_size: usize) -> Self {
        let total_frames = total_bytes / frame_size;
        Self {
            inner: Mutex::new(MemInner {
                frames: vec![None; total_frames],
                words: HashMap::new(),
            }),
            total_bytes,
            frame_size,
            total_frames,
        }
    }

    /// Total memory in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Frame size in bytes.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Number of frames.
    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Index of the first empty frame, if any.
    #[must_use]
    pub fn free_frame_index(&self) -> Option<usize> {
        let inner = self.lock();
        inner.frames.iter().position(Option::is_none)
    }

    /// Number of occupied frames.
    #[must_use]
    pub fn used_frames(&self) -> usize {
        let inner = self.lock();
        inner.frames.iter().filter(|f| f.is_some()).count()
    }

    /// Bytes backed by occupied frames.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.used_frames() * self.frame_size
    }

    /// Record `page_id` as the owner of `frame`.
    pub fn assign(&self, frame: usize, page_id: PageId) {
        let mut inner = self.lock();
        if let Some(slot) = inner.frames.get_mut(frame) {
            *slot = Some(page_id);
        }
    }

    /// Empty `frame`.
    pub fn clear(&self, frame: usize) {
        let mut inner = self.lock();
        if let Some(slot) = inner.frames.get_mut(frame) {
            *slot = None;
        }
    }

    /// The page currently resident in `frame`, if any.
    #[must_use]
    pub fn occupant(&self, frame: usize) -> Option<PageId> {
        let inner = self.lock();
        inner.frames.get(frame).copied().flatten()
    }

    /// Read the word whose first byte is at `phys_addr`. Untouched memory is 0.
    #[must_use]
    pub fn read(&self, phys_addr: usize) -> u16 {
        let inner = self.lock();
        inner.words.get(&phys_addr).copied().unwrap_or(0)
    }

    /// Write the word whose first byte is at `phys_addr`.
    pub fn write(&self, phys_addr: usize, value: u16) {
        let mut inner = self.lock();
        inner.words.insert(phys_addr, value);
    }

    /// Copy out the `frame_size / 2` words stored in `frame`.
    #[must_use]
    pub fn dump(&self, frame: usize) -> Vec<u16> {
        let inner = self.lock();
        let base = frame * self.frame_size;
        (0..self.frame_size / 2)
            .map(|i| inner.words.get(&(base + 2 * i)).copied().unwrap_or(0))
            .collect()
    }

    /// Copy `words` into the byte range of `frame`.
    pub fn load(&self, frame: usize, words: &[u16]) {
        let mut inner = self.lock();
        let base = frame * self.frame_size;
        for (i, word) in words.iter().enumerate().take(self.frame_size / 2) {
            inner.words.insert(base + 2 * i, *word);
        }
    }

    /// Atomically free every frame owned by `pid`, returning the freed
    /// indices. Word contents of freed frames are dropped.
    pub fn free_all_owned_by(&self, pid: Pid) -> Vec<usize> {
        let mut inner = self.lock();
        let mut freed = Vec::new();
        for frame in 0..inner.frames.len() {
            if inner.frames[frame].is_some_and(|p| p.pid == pid) {
                inner.frames[frame] = None;
                freed.push(frame);
            }
        }
        for &frame in &freed {
            let base = frame * self.frame_size;
            for i in 0..self.frame_size / 2 {
                inner.words.remove(&(base + 2 * i));
            }
        }
        freed
    }

    /// Snapshot of frame occupancy, index-aligned.
    #[must_use]
    pub fn frame_snapshot(&self) -> Vec<Option<PageId>> {
        self.lock().frames.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        self.inner.lock().expect("physical memory lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(pid: Pid, page: usize) -> PageId {
        PageId { pid, page }
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(page(3, 1).to_string(), "p3_page1");
    }

    #[test]
    fn test_free_frame_scan_and_assign() {
        let mem = PhysicalMemory::new(128, 64);
        assert_eq!(mem.total_frames(), 2);
        assert_eq!(mem.free_frame_index(), Some(0));
        mem.assign(0, page(1, 0));
        assert_eq!(mem.free_frame_index(), Some(1));
        mem.assign(1, page(2, 0));
        assert_eq!(mem.free_frame_index(), None);
        mem.clear(0);
        assert_eq!(mem.free_frame_index(), Some(0));
        assert_eq!(mem.occupant(1), Some(page(2, 0)));
    }

    #[test]
    fn test_word_store_defaults_to_zero() {
        let mem = PhysicalMemory::new(128, 64);
        assert_eq!(mem.read(0x10), 0);
        mem.write(0x10, 42);
        assert_eq!(mem.read(0x10), 42);
    }

    #[test]
    fn test_dump_and_load_round_trip() {
        let mem = PhysicalMemory::new(128, 64);
        let words: Vec<u16> = (0..32).map(|i| i * 3).collect();
        mem.load(1, &words);
        assert_eq!(mem.dump(1), words);
        // Frame 0 is untouched.
        assert!(mem.dump(0).iter().all(|&w| w == 0));
    }

    #[test]
    fn test_free_all_owned_by_clears_frames_and_words() {
        let mem = PhysicalMemory::new(256, 64);
        mem.assign(0, page(7, 0));
        mem.assign(2, page(7, 1));
        mem.assign(1, page(8, 0));
        mem.write(0, 5);
        mem.write(2 * 64, 6);
        let freed = mem.free_all_owned_by(7);
        assert_eq!(freed, vec![0, 2]);
        assert_eq!(mem.occupant(0), None);
        assert_eq!(mem.occupant(1), Some(page(8, 0)));
        assert_eq!(mem.read(0), 0);
        assert_eq!(mem.read(2 * 64), 0);
        // Second call is a no-op.
        assert!(mem.free_all_owned_by(7).is_empty());
    }

    #[test]
    fn test_used_bytes_tracks_occupancy() {
        let mem = PhysicalMemory::new(256, 64);
        assert_eq!(mem.used_bytes(), 0);
        mem.assign(3, page(1, 0));
        assert_eq!(mem.used_bytes(), 64);
    }
}
