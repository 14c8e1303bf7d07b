//! Read-ahead cache in front of the image.
//!
//! Discovery reads the same neighborhood over and over (every
//! instruction refetches a 32-byte window); a single 1 KiB line absorbs
//! almost all of it. The line lives in the analyzer, not in a process
//! global, so concurrent analyzers never alias each other. Program bytes
//! are treated as immutable for the duration of an analysis, so there is
//! no coherence handling.

use crate::host::Image;

/// Byte length of the single cache line.
pub const LINE_SIZE: usize = 1024;

/// A one-line read-ahead cache.
pub struct ReadAhead {
    line: Box<[u8; LINE_SIZE]>,
    base: Option<u64>,
}

impl Default for ReadAhead {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for ReadAhead {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReadAhead").field("base", &self.base).finish()
    }
}

impl ReadAhead {
    /// An empty cache.
    pub fn new() -> Self {
        Self {
            line: Box::new([0; LINE_SIZE]),
            base: None,
        }
    }

    /// Drop the cached line.
    pub fn invalidate(&mut self) {
        self.base = None;
    }

    /// Read `buf.len()` bytes at `addr` through the cache.
    ///
    /// Requests larger than the line bypass it but reseed the line with
    /// the leading 1 KiB, so a following small read still hits.
    pub fn read<I: Image>(&mut self, image: &I, addr: u64, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        if buf.len() > LINE_SIZE {
            let n = image.read_at(addr, buf);
            self.line.copy_from_slice(&buf[..LINE_SIZE]);
            self.base = Some(addr);
            return n;
        }

        let end = addr.saturating_add(buf.len() as u64);
        let hit = self.base.is_some_and(|base| {
            let line_end = base.saturating_add(LINE_SIZE as u64);
            addr >= base && end < line_end
        });
        if hit {
            let off = (addr - self.base.unwrap_or_default()) as usize;
            buf.copy_from_slice(&self.line[off..off + buf.len()]);
        } else {
            image.read_at(addr, self.line.as_mut());
            buf.copy_from_slice(&self.line[..buf.len()]);
            self.base = Some(addr);
        }
        buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::FlatImage;

    fn image() -> FlatImage {
        let bytes: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        FlatImage::new(0x1000, bytes)
    }

    #[test]
    fn sub_line_reads_hit_after_refill() {
        let img = image();
        let mut cache = ReadAhead::new();
        let mut buf = [0u8; 32];
        cache.read(&img, 0x1000, &mut buf);
        assert_eq!(buf[0], 0);
        assert_eq!(cache.base, Some(0x1000));

        // Inside the line: served from RAM, base unchanged.
        let mut buf2 = [0u8; 32];
        cache.read(&img, 0x1100, &mut buf2);
        assert_eq!(cache.base, Some(0x1000));
        assert_eq!(buf2[0], (0x100 % 251) as u8);
    }

    #[test]
    fn miss_refills_at_requested_address() {
        let img = image();
        let mut cache = ReadAhead::new();
        let mut buf = [0u8; 16];
        cache.read(&img, 0x1000, &mut buf);
        cache.read(&img, 0x1800, &mut buf);
        assert_eq!(cache.base, Some(0x1800));
        assert_eq!(buf[0], (0x800 % 251) as u8);
    }

    #[test]
    fn read_touching_line_end_refills() {
        let img = image();
        let mut cache = ReadAhead::new();
        let mut buf = [0u8; 32];
        cache.read(&img, 0x1000, &mut buf);
        // Last 32 bytes of the line: end == line end, counts as a miss.
        cache.read(&img, 0x1000 + (LINE_SIZE as u64) - 32, &mut buf);
        assert_eq!(cache.base, Some(0x1000 + LINE_SIZE as u64 - 32));
    }

    #[test]
    fn oversized_read_bypasses_but_reseeds() {
        let img = image();
        let mut cache = ReadAhead::new();
        let mut big = vec![0u8; LINE_SIZE + 512];
        let n = cache.read(&img, 0x1000, &mut big);
        assert_eq!(n, LINE_SIZE + 512);
        assert_eq!(cache.base, Some(0x1000));
        // The leading line was kept.
        let mut small = [0u8; 8];
        cache.read(&img, 0x1004, &mut small);
        assert_eq!(small[0], 4);
    }
}
