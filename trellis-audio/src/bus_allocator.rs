/// A contiguous range of private audio buses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioBus {
    pub index: i32,
    pub channels: u8,
}

impl AudioBus {
    pub fn end(&self) -> i32 {
        self.index + self.channels as i32
    }
}

/// Hands out private audio bus ranges above the hardware buses.
///
/// Freed ranges are kept in a sorted free list, coalesced with their
/// neighbours and reused first-fit, so repeated reallocation at the same
/// width does not grow the bus space.
#[derive(Debug, Clone)]
pub struct BusAllocator {
    first_private: i32,
    next: i32,
    free: Vec<AudioBus>,
    in_use: usize,
}

impl BusAllocator {
    pub fn new(first_private: i32) -> Self {
        Self {
            first_private,
            next: first_private,
            free: Vec::new(),
            in_use: 0,
        }
    }

    /// Allocate `channels` adjacent buses.
    pub fn alloc(&mut self, channels: u8) -> AudioBus {
        let channels = channels.max(1);
        self.in_use += 1;
        if let Some(pos) = self.free.iter().position(|r| r.channels >= channels) {
            let range = self.free[pos];
            if range.channels == channels {
                self.free.remove(pos);
            } else {
                self.free[pos] = AudioBus {
                    index: range.index + channels as i32,
                    channels: range.channels - channels,
                };
            }
            return AudioBus {
                index: range.index,
                channels,
            };
        }
        let bus = AudioBus {
            index: self.next,
            channels,
        };
        self.next += channels as i32;
        bus
    }

    /// Return a range to the pool.
    pub fn release(&mut self, bus: AudioBus) {
        if bus.index < self.first_private || bus.end() > self.next {
            log::warn!(target: "audio::buses", "ignoring release of unknown bus {:?}", bus);
            return;
        }
        self.in_use = self.in_use.saturating_sub(1);
        let pos = self.free.partition_point(|r| r.index < bus.index);
        self.free.insert(pos, bus);
        self.coalesce();
        // Shrink the high-water mark when the top range is free.
        if let Some(last) = self.free.last().copied() {
            if last.end() == self.next {
                self.next = last.index;
                self.free.pop();
            }
        }
    }

    fn coalesce(&mut self) {
        let mut merged: Vec<AudioBus> = Vec::with_capacity(self.free.len());
        for range in self.free.drain(..) {
            match merged.last_mut() {
                Some(prev)
                    if prev.end() == range.index
                        && prev.channels as u32 + range.channels as u32 <= u8::MAX as u32 =>
                {
                    prev.channels += range.channels;
                }
                _ => merged.push(range),
            }
        }
        self.free = merged;
    }

    /// Forget every allocation (e.g. after the server went away).
    pub fn reset(&mut self) {
        self.next = self.first_private;
        self.free.clear();
        self.in_use = 0;
    }

    /// Number of live allocations.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// First bus index never handed out.
    pub fn high_water(&self) -> i32 {
        self.next
    }

    pub fn first_private(&self) -> i32 {
        self.first_private
    }
}
