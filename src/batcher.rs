//! Throughput-adaptive output coalescing.
//!
//! Sparse output (keystroke echo) is flushed after a short interval so typing
//! feels immediate; sustained output waits for the full interval so a busy
//! process does not produce hundreds of messages per second.

use std::{future::Future, time::Duration};

use tokio::{sync::mpsc, time::Instant};

use crate::{client::sleep_opt, config::BatcherConfig};

/// Weight kept from the previous rate estimate.
const RATE_DECAY: f64 = 0.7;
/// Weight given to the newest instantaneous sample.
const RATE_SAMPLE_WEIGHT: f64 = 0.3;

pub struct OutputBatcher<F> {
    config: BatcherConfig,
    buffer: Vec<u8>,
    rate: f64,
    last_append: Option<Instant>,
    flush_at: Option<Instant>,
    on_flush: F,
    disposed: bool,
}

impl<F: FnMut(String)> OutputBatcher<F> {
    pub fn new(config: BatcherConfig, on_flush: F) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            rate: 0.0,
            last_append: None,
            flush_at: None,
            on_flush,
            disposed: false,
        }
    }

    /// Estimated output rate in bytes per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.flush_at
    }

    pub fn current_interval(&self) -> Duration {
        if self.rate > self.config.rate_threshold {
            self.config.interval
        } else {
            self.config.fast_interval
        }
    }

    pub fn append(&mut self, chunk: &[u8], now: Instant) {
        if self.disposed || chunk.is_empty() {
            return;
        }
        if let Some(last) = self.last_append {
            let elapsed_ms = (now.saturating_duration_since(last).as_secs_f64() * 1000.0).max(1.0);
            let instant_rate = chunk.len() as f64 / elapsed_ms * 1000.0;
            self.rate = self.rate * RATE_DECAY + instant_rate * RATE_SAMPLE_WEIGHT;
        }
        self.last_append = Some(now);
        self.buffer.extend_from_slice(chunk);

        if self.buffer.len() >= self.config.max_batch_size {
            self.flush();
            return;
        }
        if self.flush_at.is_none() {
            self.flush_at = Some(now + self.current_interval());
        }
    }

    /// Flush if the pending timer has expired. Returns true when it fired.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.flush_at {
            Some(deadline) if deadline <= now => {
                self.flush();
                true
            }
            _ => false,
        }
    }

    /// Emit buffered output. A multi-byte character cut off at the end of the
    /// buffer is held back until its remaining bytes arrive.
    pub fn flush(&mut self) {
        self.flush_at = None;
        if self.buffer.is_empty() {
            return;
        }
        let carry = incomplete_utf8_tail(&self.buffer);
        let tail = self.buffer.split_off(self.buffer.len() - carry);
        let ready = std::mem::replace(&mut self.buffer, tail);
        if !ready.is_empty() {
            (self.on_flush)(String::from_utf8_lossy(&ready).into_owned());
        }
    }

    /// Flush whatever remains, including an unfinished character, and stop
    /// accepting output. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.flush();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            (self.on_flush)(String::from_utf8_lossy(&rest).into_owned());
        }
    }
}

/// Number of trailing bytes that start a UTF-8 sequence still missing bytes.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

/// Drive a batcher from a stream of raw chunks until the sender is dropped
/// or `stop` resolves, then dispose it. On stop, chunks already queued are
/// still included in the final flush.
pub async fn run_batched<F, S>(
    mut chunks: mpsc::Receiver<Vec<u8>>,
    config: BatcherConfig,
    on_flush: F,
    stop: S,
) where
    F: FnMut(String),
    S: Future<Output = ()>,
{
    let mut batcher = OutputBatcher::new(config, on_flush);
    tokio::pin!(stop);
    loop {
        tokio::select! {
            chunk = chunks.recv() => match chunk {
                Some(chunk) => batcher.append(&chunk, Instant::now()),
                None => break,
            },
            _ = sleep_opt(batcher.deadline()) => {
                batcher.fire_if_due(Instant::now());
            }
            _ = &mut stop => {
                while let Ok(chunk) = chunks.try_recv() {
                    batcher.append(&chunk, Instant::now());
                }
                break;
            }
        }
    }
    batcher.dispose();
}
