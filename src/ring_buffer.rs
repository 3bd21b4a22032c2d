// src/ring_buffer.rs

//! Multichannel circular sample buffer bridging the audio callbacks and the
//! processing thread. Writers never block (excess frames are dropped at the
//! call site), readers can block with a timeout until enough frames arrive.

use crate::error::{Result, TrackerError};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct BufferState {
    /// Interleaved storage, `capacity * channels` samples.
    data: Vec<f32>,
    /// Monotonic frame counters. Invariant: `0 <= write_index - read_index <= capacity`.
    write_index: u64,
    read_index: u64,
}

pub struct RingBuffer {
    capacity: usize,
    channels: usize,
    state: Mutex<BufferState>,
    // Separate from the state lock so a write that lands while a reader is
    // re-checking its predicate can never be missed: the writer updates the
    // indices and notifies while still holding the lock.
    readable: Condvar,
}

impl RingBuffer {
    pub fn new(capacity: usize, channels: usize) -> Self {
        assert!(capacity > 0 && channels > 0);
        Self {
            capacity,
            channels,
            state: Mutex::new(BufferState {
                data: vec![0.0; capacity * channels],
                write_index: 0,
                read_index: 0,
            }),
            readable: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Writes as many whole frames from `samples` (interleaved) as fit and
    /// returns the number of frames actually written. Never blocks beyond the
    /// brief index lock and never allocates, so it is safe to call from the
    /// audio callback.
    pub fn write(&self, samples: &[f32]) -> usize {
        let frames = samples.len() / self.channels;
        let mut state = self.state.lock().unwrap();
        let used = (state.write_index - state.read_index) as usize;
        let writable = self.capacity - used;
        let to_write = frames.min(writable);
        for frame in 0..to_write {
            let slot = ((state.write_index as usize + frame) % self.capacity) * self.channels;
            let src = frame * self.channels;
            state.data[slot..slot + self.channels]
                .copy_from_slice(&samples[src..src + self.channels]);
        }
        state.write_index += to_write as u64;
        // Notify while holding the lock: the waiter's predicate is already
        // observable when it wakes.
        self.readable.notify_all();
        to_write
    }

    /// Reads exactly `frames` frames into a new interleaved buffer, advancing
    /// the read cursor. Fails if fewer frames are available.
    pub fn read(&self, frames: usize) -> Result<Vec<f32>> {
        let mut out = vec![0.0; frames * self.channels];
        self.read_into(frames, &mut out)?;
        Ok(out)
    }

    /// Allocation-free variant of [`read`](Self::read) for the render callback.
    /// `out` must hold `frames * channels` samples.
    pub fn read_into(&self, frames: usize, out: &mut [f32]) -> Result<()> {
        assert_eq!(out.len(), frames * self.channels, "output slice length mismatch");
        let mut state = self.state.lock().unwrap();
        let available = (state.write_index - state.read_index) as usize;
        if frames > available {
            return Err(TrackerError::InsufficientData {
                requested: frames,
                available,
            });
        }
        for frame in 0..frames {
            let slot = ((state.read_index as usize + frame) % self.capacity) * self.channels;
            let dst = frame * self.channels;
            out[dst..dst + self.channels].copy_from_slice(&state.data[slot..slot + self.channels]);
        }
        state.read_index += frames as u64;
        Ok(())
    }

    pub fn available_to_read(&self) -> usize {
        let state = self.state.lock().unwrap();
        (state.write_index - state.read_index) as usize
    }

    pub fn available_to_write(&self) -> usize {
        let state = self.state.lock().unwrap();
        self.capacity - (state.write_index - state.read_index) as usize
    }

    /// Blocks until at least `frames` frames are readable or `timeout`
    /// elapses. Returns whether the predicate became true.
    pub fn wait_for_readable(&self, frames: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if (state.write_index - state.read_index) as usize >= frames {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.readable.wait_timeout(state, deadline - now).unwrap();
            state = guard;
            // Loop re-checks the predicate, so spurious wakeups and
            // timeout/data races both resolve correctly.
        }
    }

    /// Deterministic channel reduction: each output channel is the average of
    /// a contiguous group of `from / to` input channels. `from` must be a
    /// multiple of `to`.
    pub fn downmix(samples: &[f32], from_channels: usize, to_channels: usize) -> Vec<f32> {
        assert!(from_channels > 0 && to_channels > 0);
        assert!(
            from_channels % to_channels == 0,
            "cannot downmix {} channels to {}",
            from_channels,
            to_channels
        );
        if from_channels == to_channels {
            return samples.to_vec();
        }
        let group = from_channels / to_channels;
        let frames = samples.len() / from_channels;
        let mut out = vec![0.0; frames * to_channels];
        for frame in 0..frames {
            let src = frame * from_channels;
            for ch in 0..to_channels {
                let sum: f32 = samples[src + ch * group..src + (ch + 1) * group].iter().sum();
                out[frame * to_channels + ch] = sum / group as f32;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counts_are_conserved() {
        let buf = RingBuffer::new(400, 2);
        assert_eq!(buf.available_to_read(), 0);
        assert_eq!(buf.available_to_write(), 400);

        let written = buf.write(&vec![0.25; 100 * 2]);
        assert_eq!(written, 100);
        assert_eq!(buf.available_to_read(), 100);
        assert_eq!(buf.available_to_write(), 300);

        let data = buf.read(100).unwrap();
        assert_eq!(data.len(), 200);
        assert!(data.iter().all(|&s| s == 0.25));
        assert_eq!(buf.available_to_read(), 0);
        assert_eq!(buf.available_to_write(), 400);
    }

    #[test]
    fn overfull_write_truncates() {
        let buf = RingBuffer::new(8, 1);
        assert_eq!(buf.write(&[1.0; 6]), 6);
        // Only 2 frames fit; the rest must be dropped, not queued.
        assert_eq!(buf.write(&[2.0; 5]), 2);
        assert_eq!(buf.available_to_read(), 8);
        let data = buf.read(8).unwrap();
        assert_eq!(&data[..6], &[1.0; 6]);
        assert_eq!(&data[6..], &[2.0; 2]);
    }

    #[test]
    fn read_more_than_available_fails() {
        let buf = RingBuffer::new(16, 2);
        buf.write(&[0.0; 8]);
        let err = buf.read(5).unwrap_err();
        match err {
            TrackerError::InsufficientData {
                requested,
                available,
            } => {
                assert_eq!(requested, 5);
                assert_eq!(available, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
        // The failed read must not move the cursor.
        assert_eq!(buf.available_to_read(), 4);
    }

    #[test]
    fn wraps_around_capacity() {
        let buf = RingBuffer::new(4, 1);
        buf.write(&[1.0, 2.0, 3.0]);
        assert_eq!(buf.read(2).unwrap(), vec![1.0, 2.0]);
        buf.write(&[4.0, 5.0, 6.0]);
        assert_eq!(buf.read(4).unwrap(), vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn wait_for_readable_times_out() {
        let buf = RingBuffer::new(16, 1);
        buf.write(&[0.0; 3]);
        assert!(!buf.wait_for_readable(4, Duration::from_millis(20)));
        assert!(buf.wait_for_readable(3, Duration::from_millis(20)));
    }

    #[test]
    fn wait_for_readable_wakes_on_write() {
        let buf = Arc::new(RingBuffer::new(64, 1));
        let writer = {
            let buf = buf.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                buf.write(&[0.5; 32]);
            })
        };
        assert!(buf.wait_for_readable(32, Duration::from_secs(5)));
        writer.join().unwrap();
    }

    #[test]
    fn downmix_averages_channel_groups() {
        let stereo = [1.0, 3.0, -2.0, 2.0];
        let mono = RingBuffer::downmix(&stereo, 2, 1);
        assert_eq!(mono, vec![2.0, 0.0]);
        let same = RingBuffer::downmix(&stereo, 2, 2);
        assert_eq!(same, stereo.to_vec());
    }
}
