//! Bounded byte streams between codecs and callers
//!
//! A pipe couples one producer and one consumer. The producer must either
//! `finish` or `fail` the stream; a writer dropped without doing either is
//! reported to the reader as a truncated stream.

use crate::StreamError;
use tokio::sync::mpsc;

enum Frame {
    Data(Vec<u8>),
    End,
    Error(String),
}

/// Creates a pipe holding at most `capacity` pending chunks
pub fn pipe(capacity: usize) -> (BodyWriter, BodyReader) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        BodyWriter { sender },
        BodyReader {
            receiver,
            done: false,
        },
    )
}

pub struct BodyWriter {
    sender: mpsc::Sender<Frame>,
}

impl BodyWriter {
    pub async fn write(&self, chunk: impl Into<Vec<u8>>) -> Result<(), StreamError> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }

        self.sender
            .send(Frame::Data(chunk))
            .await
            .map_err(|_| StreamError::Closed)
    }

    /// Signals a complete stream
    pub async fn finish(self) -> Result<(), StreamError> {
        self.sender
            .send(Frame::End)
            .await
            .map_err(|_| StreamError::Closed)
    }

    /// Aborts the stream, the reader observes the error on its next read
    pub async fn fail(self, error: impl ToString) {
        let _ = self.sender.send(Frame::Error(error.to_string())).await;
    }
}

#[derive(Debug)]
pub struct BodyReader {
    receiver: mpsc::Receiver<Frame>,
    done: bool,
}

impl BodyReader {
    /// A reader over an already complete body
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let (sender, receiver) = mpsc::channel(2);
        let bytes = bytes.into();
        if !bytes.is_empty() {
            let _ = sender.try_send(Frame::Data(bytes));
        }
        let _ = sender.try_send(Frame::End);

        Self {
            receiver,
            done: false,
        }
    }

    pub fn empty() -> Self {
        Self::from_bytes(Vec::new())
    }

    /// Returns the next chunk, or `None` once the producer finished
    pub async fn chunk(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        if self.done {
            return Ok(None);
        }

        match self.receiver.recv().await {
            Some(Frame::Data(chunk)) => Ok(Some(chunk)),
            Some(Frame::End) => {
                self.done = true;
                Ok(None)
            }
            Some(Frame::Error(message)) => {
                self.done = true;
                Err(StreamError::Producer(message))
            }
            None => {
                self.done = true;
                Err(StreamError::Truncated)
            }
        }
    }

    pub async fn read_to_end(mut self) -> Result<Vec<u8>, StreamError> {
        let mut body = Vec::new();
        while let Some(chunk) = self.chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}
