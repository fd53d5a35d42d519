//! Micro-batcher feeding aggregation candidates to a single consumer.
//!
//! Producers hand over one item at a time through a bounded channel. A
//! dedicated thread accumulates items and flushes when either the size
//! threshold or the time window since the first buffered item is reached,
//! whichever comes first. Closing the producer side triggers a final flush.

use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::BatchSettings;

/// Why an item was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("batch queue is full")]
    Full,
    #[error("batcher has shut down")]
    Closed,
}

pub struct MicroBatcher<T: Send + 'static> {
    sender: Option<SyncSender<T>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> MicroBatcher<T> {
    /// Start the consumer thread; `flush` runs on it for every batch.
    pub fn spawn<F>(settings: &BatchSettings, name: &str, flush: F) -> std::io::Result<Self>
    where
        F: FnMut(Vec<T>) + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel::<T>(settings.channel_capacity);
        let max_size = settings.max_batch_size.max(1);
        let max_wait = settings.flush_interval();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || consume(rx, max_size, max_wait, flush))?;

        Ok(MicroBatcher {
            sender: Some(tx),
            handle: Some(handle),
        })
    }

    /// Hand over one item, waiting while the queue is full.
    pub fn submit(&self, item: T) -> Result<(), SubmitError> {
        let sender = self.sender.as_ref().ok_or(SubmitError::Closed)?;
        sender.send(item).map_err(|_| SubmitError::Closed)
    }

    /// Hand over one item without waiting.
    pub fn try_submit(&self, item: T) -> Result<(), SubmitError> {
        let sender = self.sender.as_ref().ok_or(SubmitError::Closed)?;
        sender.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::Full,
            TrySendError::Disconnected(_) => SubmitError::Closed,
        })
    }

    /// Close the queue, flush what is buffered and wait for the consumer.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("batch consumer panicked");
        }
    }
}

impl<T: Send + 'static> Drop for MicroBatcher<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn consume<T, F>(rx: mpsc::Receiver<T>, max_size: usize, max_wait: Duration, mut flush: F)
where
    F: FnMut(Vec<T>),
{
    let mut buffer: Vec<T> = Vec::with_capacity(max_size);
    let mut started: Option<Instant> = None;

    loop {
        let received = match started {
            Some(at) => {
                let remaining = max_wait.saturating_sub(at.elapsed());
                rx.recv_timeout(remaining)
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(item) => {
                started.get_or_insert_with(Instant::now);
                buffer.push(item);
                if buffer.len() >= max_size {
                    emit(&mut buffer, &mut started, &mut flush, "size");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                emit(&mut buffer, &mut started, &mut flush, "interval");
            }
            Err(RecvTimeoutError::Disconnected) => {
                emit(&mut buffer, &mut started, &mut flush, "shutdown");
                return;
            }
        }
    }
}

fn emit<T, F>(buffer: &mut Vec<T>, started: &mut Option<Instant>, flush: &mut F, reason: &str)
where
    F: FnMut(Vec<T>),
{
    *started = None;
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    tracing::trace!(size = batch.len(), reason, "flushing batch");
    flush(batch);
}
