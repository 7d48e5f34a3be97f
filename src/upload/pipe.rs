//! Bounded byte pipe between a producer task and a consumer task
//!
//! Connects the gzip writer to the multipart uploader in the
//! streaming-compression route. At most `capacity` bytes sit in the pipe at
//! any time; the writer waits until the reader has drained enough.
//!
//! # Completion
//!
//! Each end is completed exactly once, either cleanly or with an error:
//!
//! - [`PipeWriter::complete`] and [`PipeReader::complete`] consume the end
//! - dropping an end without completing it completes it with
//!   [`PipeError::Abandoned`]
//!
//! A writer failure is delivered to the reader as the next frame after the
//! data already written. A reader failure closes the byte budget, which
//! wakes a writer blocked on backpressure with the reader's error.

use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, Semaphore};

/// Failure propagated between the two ends of a pipe
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipeError {
    #[error("producer failed: {0}")]
    Producer(String),

    #[error("consumer failed: {0}")]
    Consumer(String),

    #[error("other end dropped without completing")]
    Abandoned,
}

enum Frame {
    Data(Bytes),
    Finished,
    Failed(PipeError),
}

struct Shared {
    budget: Semaphore,
    reader_error: Mutex<Option<PipeError>>,
}

impl Shared {
    fn reader_failure(&self) -> PipeError {
        self.reader_error
            .lock()
            .clone()
            .unwrap_or_else(|| PipeError::Consumer("reader closed".into()))
    }

    fn close_reader(&self, error: PipeError) {
        let mut slot = self.reader_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.budget.close();
    }
}

/// Create a pipe holding at most `capacity` bytes in flight.
///
/// `capacity` must be non-zero and fit in a `u32`.
pub fn channel(capacity: usize) -> (PipeWriter, PipeReader) {
    let capacity = capacity.clamp(1, u32::MAX as usize);
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        budget: Semaphore::new(capacity),
        reader_error: Mutex::new(None),
    });

    let writer = PipeWriter {
        tx: Some(tx),
        shared: shared.clone(),
        capacity,
    };
    let reader = PipeReader {
        rx,
        shared,
        current: Bytes::new(),
        terminal: None,
        completed: false,
    };
    (writer, reader)
}

/// Write end of a pipe
pub struct PipeWriter {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    shared: Arc<Shared>,
    capacity: usize,
}

impl PipeWriter {
    /// Write `data`, waiting for the reader to make room.
    ///
    /// Fails with the reader's error once the reader has completed.
    pub async fn write(&mut self, mut data: Bytes) -> Result<(), PipeError> {
        while !data.is_empty() {
            let piece = data.split_to(data.len().min(self.capacity));

            let permits = self
                .shared
                .budget
                .acquire_many(piece.len() as u32)
                .await
                .map_err(|_| self.shared.reader_failure())?;
            // Released by the reader as it consumes the piece
            permits.forget();

            let tx = self
                .tx
                .as_ref()
                .ok_or_else(|| PipeError::Producer("writer already completed".into()))?;
            tx.send(Frame::Data(piece))
                .map_err(|_| self.shared.reader_failure())?;
        }
        Ok(())
    }

    /// Complete the write end
    pub fn complete(mut self, result: Result<(), PipeError>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Result<(), PipeError>) {
        if let Some(tx) = self.tx.take() {
            let frame = match result {
                Ok(()) => Frame::Finished,
                Err(e) => Frame::Failed(e),
            };
            // The reader may be gone already
            let _ = tx.send(frame);
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.finish(Err(PipeError::Abandoned));
    }
}

/// Read end of a pipe
pub struct PipeReader {
    rx: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
    current: Bytes,
    terminal: Option<Result<(), PipeError>>,
    completed: bool,
}

impl PipeReader {
    /// Next chunk written by the producer, or `None` once it finished cleanly
    #[cfg(test)]
    pub(crate) async fn read_chunk(&mut self) -> Result<Option<Bytes>, PipeError> {
        if !self.current.is_empty() {
            return Ok(Some(std::mem::take(&mut self.current)));
        }
        if let Some(terminal) = &self.terminal {
            return terminal.clone().map(|()| None);
        }

        let frame = self.rx.recv().await;
        match self.accept(frame) {
            Ok(true) => Ok(Some(std::mem::take(&mut self.current))),
            Ok(false) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Complete the read end
    pub fn complete(mut self, result: Result<(), PipeError>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Result<(), PipeError>) {
        if self.completed {
            return;
        }
        self.completed = true;
        let error = result
            .err()
            .unwrap_or_else(|| PipeError::Consumer("reader closed".into()));
        self.shared.close_reader(error);
        self.rx.close();
    }

    /// Handle a received frame. `Ok(true)` means `current` holds new data.
    fn accept(&mut self, frame: Option<Frame>) -> Result<bool, PipeError> {
        match frame {
            Some(Frame::Data(data)) => {
                self.shared.budget.add_permits(data.len());
                self.current = data;
                Ok(true)
            }
            Some(Frame::Finished) => {
                self.terminal = Some(Ok(()));
                Ok(false)
            }
            Some(Frame::Failed(e)) => {
                self.terminal = Some(Err(e.clone()));
                Err(e)
            }
            None => {
                self.terminal = Some(Err(PipeError::Abandoned));
                Err(PipeError::Abandoned)
            }
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.finish(Err(PipeError::Abandoned));
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.current.is_empty() {
            if let Some(terminal) = &this.terminal {
                return Poll::Ready(terminal.clone().map_err(io::Error::other));
            }

            let frame = match this.rx.poll_recv(cx) {
                Poll::Ready(frame) => frame,
                Poll::Pending => return Poll::Pending,
            };
            match this.accept(frame) {
                Ok(true) => {}
                Ok(false) => return Poll::Ready(Ok(())),
                Err(e) => return Poll::Ready(Err(io::Error::other(e))),
            }
        }

        let n = this.current.len().min(buf.remaining());
        buf.put_slice(&this.current.split_to(n));
        Poll::Ready(Ok(()))
    }
}
