//! Bounded block ring connecting the acquisition threads.
//!
//! A [`RingBuffer`] holds a fixed number of equally sized blocks. One producer
//! borrows a free block with [`get_write_block`][RingBuffer::get_write_block],
//! fills it, and commits it. One consumer borrows the oldest committed block
//! with [`get_read_block`][RingBuffer::get_read_block] and releases it when
//! done. Both sides block while the ring is full or empty, and both unblock
//! for good once [`stop`][RingBuffer::stop] is called.
//!
//! Blocks move between the ring and the guards by ownership, so the lock is
//! only held while cursors change, never while samples are written or read.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

struct Slot<T> {
    data: Option<Vec<T>>,
    seq: u64,
}

struct State<T> {
    slots: Vec<Slot<T>>,
    block_size: usize,
    read: usize,
    write: usize,
    count: usize,
    next_seq: u64,
    writing: bool,
    reading: bool,
    stopped: bool,
    generation: u64,
}

/// Reason a non-blocking write acquisition failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TryWriteError {
    /// Every block is committed and waiting on the reader.
    Full,
    /// The ring was stopped or never started.
    Stopped,
}

/// A bounded single-producer/single-consumer queue of fixed-size blocks.
pub struct RingBuffer<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T: Clone + Default> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Default> RingBuffer<T> {
    /// Create an empty ring. It holds no storage and rejects every call until
    /// [`start`][Self::start] is called.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                slots: Vec::new(),
                block_size: 0,
                read: 0,
                write: 0,
                count: 0,
                next_seq: 0,
                writing: false,
                reading: false,
                stopped: true,
                generation: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Create a ring and immediately start it.
    pub fn with_capacity(capacity: usize, block_size: usize) -> Self {
        let ring = Self::new();
        ring.start(capacity, block_size);
        ring
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate `capacity` blocks of `block_size` elements and reset both
    /// cursors. Any guards still held from a previous run are discarded when
    /// they return.
    ///
    /// # Panics
    /// - If `capacity` is zero.
    pub fn start(&self, capacity: usize, block_size: usize) {
        assert!(capacity > 0, "ring capacity must be non-zero");
        let mut state = self.lock();
        state.slots = (0..capacity)
            .map(|_| Slot {
                data: Some(vec![T::default(); block_size]),
                seq: 0,
            })
            .collect();
        state.block_size = block_size;
        state.read = 0;
        state.write = 0;
        state.count = 0;
        state.next_seq = 0;
        state.writing = false;
        state.reading = false;
        state.stopped = false;
        state.generation += 1;
    }

    /// Stop the ring. All blocked callers wake up and every later acquisition
    /// returns `None` until the next [`start`][Self::start]. Calling this more
    /// than once is harmless.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.stopped = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Whether the ring is stopped.
    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Number of committed blocks waiting for the reader.
    pub fn len(&self) -> usize {
        self.lock().count
    }

    /// Returns true if no committed blocks are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of blocks in the ring.
    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// Number of elements in every block.
    pub fn block_size(&self) -> usize {
        self.lock().block_size
    }

    fn take_write(&self, mut state: MutexGuard<'_, State<T>>) -> WriteBlock<'_, T> {
        let idx = state.write;
        let data = state.slots[idx].data.take().unwrap_or_default();
        state.writing = true;
        WriteBlock {
            ring: self,
            data: Some(data),
            generation: state.generation,
        }
    }

    /// Get the next free block, waiting for the reader if the ring is full.
    ///
    /// Returns `None` if the ring is stopped, either before or during the
    /// wait.
    pub fn get_write_block(&self) -> Option<WriteBlock<'_, T>> {
        let mut state = self.lock();
        loop {
            if state.stopped {
                return None;
            }
            if !state.writing && state.count < state.slots.len() {
                return Some(self.take_write(state));
            }
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Get the next free block without waiting.
    pub fn try_get_write_block(&self) -> Result<WriteBlock<'_, T>, TryWriteError> {
        let state = self.lock();
        if state.stopped {
            return Err(TryWriteError::Stopped);
        }
        if state.writing || state.count >= state.slots.len() {
            return Err(TryWriteError::Full);
        }
        Ok(self.take_write(state))
    }

    /// Get the oldest committed block, waiting for the writer if the ring is
    /// empty.
    ///
    /// Returns `None` if the ring is stopped, either before or during the
    /// wait.
    pub fn get_read_block(&self) -> Option<ReadBlock<'_, T>> {
        let mut state = self.lock();
        loop {
            if state.stopped {
                return None;
            }
            if !state.reading && state.count > 0 {
                let idx = state.read;
                let seq = state.slots[idx].seq;
                let data = state.slots[idx].data.take().unwrap_or_default();
                state.reading = true;
                return Some(ReadBlock {
                    ring: self,
                    data: Some(data),
                    seq,
                    generation: state.generation,
                });
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish_write(&self, data: Vec<T>, generation: u64, commit: bool) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        let idx = state.write;
        state.writing = false;
        if commit && !state.stopped {
            state.slots[idx].data = Some(data);
            state.slots[idx].seq = state.next_seq;
            state.next_seq += 1;
            state.write = (idx + 1) % state.slots.len();
            state.count += 1;
            drop(state);
            self.not_empty.notify_one();
        } else {
            state.slots[idx].data = Some(data);
            drop(state);
            self.not_full.notify_one();
        }
    }

    fn finish_read(&self, data: Vec<T>, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        let idx = state.read;
        state.slots[idx].data = Some(data);
        state.reading = false;
        state.read = (idx + 1) % state.slots.len();
        state.count -= 1;
        drop(state);
        self.not_full.notify_one();
    }
}

/// A free block borrowed from a [`RingBuffer`] for writing.
///
/// Call [`commit`][Self::commit] to hand it to the reader. Dropping it without
/// committing leaves the ring unchanged.
pub struct WriteBlock<'a, T: Clone + Default> {
    ring: &'a RingBuffer<T>,
    data: Option<Vec<T>>,
    generation: u64,
}

impl<T: Clone + Default> WriteBlock<'_, T> {
    /// Publish the block to the reader and wake it up.
    pub fn commit(mut self) {
        if let Some(data) = self.data.take() {
            self.ring.finish_write(data, self.generation, true);
        }
    }
}

impl<T: Clone + Default> Deref for WriteBlock<'_, T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl<T: Clone + Default> DerefMut for WriteBlock<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl<T: Clone + Default> Drop for WriteBlock<'_, T> {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.ring.finish_write(data, self.generation, false);
        }
    }
}

/// A committed block borrowed from a [`RingBuffer`] for reading.
///
/// The slot goes back to the writer when this is dropped.
pub struct ReadBlock<'a, T: Clone + Default> {
    ring: &'a RingBuffer<T>,
    data: Option<Vec<T>>,
    seq: u64,
    generation: u64,
}

impl<T: Clone + Default> ReadBlock<'_, T> {
    /// Position of this block in write order, starting at 0 after each
    /// [`start`][RingBuffer::start].
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Give the slot back to the writer.
    pub fn release(self) {}
}

impl<T: Clone + Default> Deref for ReadBlock<'_, T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl<T: Clone + Default> Drop for ReadBlock<'_, T> {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.ring.finish_read(data, self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn blocks_come_out_in_write_order() {
        let ring = RingBuffer::<u32>::with_capacity(4, 8);
        for n in 0..4u32 {
            let mut blk = ring.get_write_block().unwrap();
            blk.iter_mut().enumerate().for_each(|(i, x)| *x = n * 100 + i as u32);
            blk.commit();
        }
        assert_eq!(ring.len(), 4);
        for n in 0..4u32 {
            let blk = ring.get_read_block().unwrap();
            assert_eq!(blk.seq(), n as u64);
            let expect: Vec<u32> = (0..8).map(|i| n * 100 + i).collect();
            assert_eq!(&blk[..], &expect[..]);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn full_ring_reports_full() {
        let ring = RingBuffer::<u8>::with_capacity(2, 4);
        ring.try_get_write_block().unwrap().commit();
        ring.try_get_write_block().unwrap().commit();
        assert_eq!(ring.try_get_write_block().err(), Some(TryWriteError::Full));
        ring.get_read_block().unwrap().release();
        assert!(ring.try_get_write_block().is_ok());
    }

    #[test]
    fn dropped_write_is_not_published() {
        let ring = RingBuffer::<u8>::with_capacity(2, 4);
        {
            let mut blk = ring.get_write_block().unwrap();
            blk[0] = 9;
        }
        assert!(ring.is_empty());
        let mut blk = ring.get_write_block().unwrap();
        blk[0] = 1;
        blk.commit();
        let blk = ring.get_read_block().unwrap();
        assert_eq!(blk[0], 1);
        assert_eq!(blk.seq(), 0);
    }

    #[test]
    fn read_waits_for_write() {
        let ring = Arc::new(RingBuffer::<u16>::with_capacity(2, 2));
        let got = Arc::new(AtomicBool::new(false));
        let reader = {
            let ring = ring.clone();
            let got = got.clone();
            thread::spawn(move || {
                let blk = ring.get_read_block().map(|b| b[1]);
                got.store(true, Ordering::Release);
                blk
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!got.load(Ordering::Acquire));
        let mut blk = ring.get_write_block().unwrap();
        blk[1] = 42;
        blk.commit();
        assert_eq!(reader.join().unwrap(), Some(42));
    }

    #[test]
    fn stop_wakes_blocked_reader_and_writer() {
        let ring = Arc::new(RingBuffer::<u8>::with_capacity(1, 1));
        ring.get_write_block().unwrap().commit();

        let writer = {
            let ring = ring.clone();
            thread::spawn(move || ring.get_write_block().is_none())
        };
        let empty = Arc::new(RingBuffer::<u8>::with_capacity(1, 1));
        let reader = {
            let empty = empty.clone();
            thread::spawn(move || empty.get_read_block().is_none())
        };
        thread::sleep(Duration::from_millis(50));
        ring.stop();
        empty.stop();
        assert!(writer.join().unwrap());
        assert!(reader.join().unwrap());

        // Stopped rings stay poisoned, and stopping twice is fine.
        ring.stop();
        assert!(ring.is_stopped());
        assert!(ring.get_read_block().is_none());
        assert!(ring.get_write_block().is_none());
        assert_eq!(ring.try_get_write_block().err(), Some(TryWriteError::Stopped));
    }

    #[test]
    fn unstarted_ring_rejects_everything() {
        let ring = RingBuffer::<f32>::new();
        assert!(ring.get_read_block().is_none());
        assert!(ring.get_write_block().is_none());
    }

    #[test]
    fn restart_resets_cursors() {
        let ring = RingBuffer::<u8>::with_capacity(3, 1);
        ring.get_write_block().unwrap().commit();
        let stale = ring.get_write_block().unwrap();
        ring.stop();
        ring.start(3, 1);
        drop(stale);
        assert!(ring.is_empty());
        ring.get_write_block().unwrap().commit();
        assert_eq!(ring.get_read_block().unwrap().seq(), 0);
    }

    #[test]
    fn producer_consumer_threads() {
        let ring = Arc::new(RingBuffer::<u64>::with_capacity(3, 16));
        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for n in 0..200u64 {
                    let Some(mut blk) = ring.get_write_block() else {
                        return;
                    };
                    blk.fill(n);
                    blk.commit();
                }
            })
        };
        for n in 0..200u64 {
            let blk = ring.get_read_block().unwrap();
            assert_eq!(blk.seq(), n);
            assert!(blk.iter().all(|&x| x == n));
        }
        producer.join().unwrap();
    }
}
