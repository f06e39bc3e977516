use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::opts::Deadline;
use crate::tokio::driver::Command;

/// Batches and terminal signals the driver pushes to a cursor receiver.
#[derive(Debug)]
pub(crate) enum CursorUpdate {
    /// A batch with more to follow.
    Partial(Vec<Value>),
    /// The final batch of the stream.
    Final(Vec<Value>),
    Failed(Error),
}

/// Messages emitted by a cursor switched to push mode with [`Cursor::activate`].
///
/// A stream is one or more `Batch` messages followed by exactly one `Done`
/// or `Error`.
#[derive(Debug)]
pub enum CursorEvent {
    Batch(Vec<Value>),
    Done,
    Error(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Open,
    Drained,
    Errored,
    Closed,
}

/// A handle iterating a multi-batch result stream.
///
/// The first batch arrives with the response that created the cursor; every
/// further batch is requested with a continuation on the same token. The
/// handle keeps the connection's command channel only to issue continuations
/// — it owns no connection state, and the connection knows the cursor only
/// through its receiver-table entry.
#[derive(Debug)]
pub struct Cursor {
    token: u64,
    commands: mpsc::UnboundedSender<Command>,
    updates: Option<mpsc::UnboundedReceiver<CursorUpdate>>,
    first: Option<Vec<Value>>,
    timeout: Deadline,
    state: CursorState,
}

impl Cursor {
    /// A streaming cursor: more batches are expected after `first`.
    pub(crate) fn streaming(
        token: u64,
        commands: mpsc::UnboundedSender<Command>,
        first: Vec<Value>,
        updates: mpsc::UnboundedReceiver<CursorUpdate>,
        timeout: Deadline,
    ) -> Self {
        Self {
            token,
            commands,
            updates: Some(updates),
            first: Some(first),
            timeout,
            state: CursorState::Open,
        }
    }

    /// A terminal cursor created from a complete sequence response.
    pub(crate) fn drained(
        token: u64,
        commands: mpsc::UnboundedSender<Command>,
        batch: Vec<Value>,
    ) -> Self {
        Self {
            token,
            commands,
            updates: None,
            // A zero-row sequence yields no batch, same as the
            // continuation path.
            first: if batch.is_empty() { None } else { Some(batch) },
            timeout: Deadline::Default,
            state: CursorState::Drained,
        }
    }

    /// Pull the next batch, issuing a continuation when the buffered one is
    /// spent. Returns `Ok(None)` once the stream has terminated.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Value>>> {
        if let Some(batch) = self.first.take() {
            return Ok(Some(batch));
        }
        if self.state != CursorState::Open {
            return Ok(None);
        }

        if self
            .commands
            .send(Command::Continue {
                token: self.token,
                timeout: self.timeout,
            })
            .is_err()
        {
            self.state = CursorState::Closed;
            return Err(Error::Closed);
        }

        let update = match self.updates.as_mut() {
            Some(updates) => updates.recv().await,
            None => None,
        };
        match update {
            Some(CursorUpdate::Partial(rows)) => Ok(Some(rows)),
            Some(CursorUpdate::Final(rows)) => {
                self.state = CursorState::Drained;
                if rows.is_empty() { Ok(None) } else { Ok(Some(rows)) }
            }
            Some(CursorUpdate::Failed(err)) => {
                self.state = CursorState::Errored;
                Err(err)
            }
            None => {
                self.state = CursorState::Closed;
                Err(Error::Closed)
            }
        }
    }

    /// Pull until drained and return the concatenation of all batches.
    pub async fn all(mut self) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            out.extend(batch);
        }
        Ok(out)
    }

    /// Switch to push mode: batches are forwarded to the returned channel as
    /// they arrive, terminated by exactly one [`CursorEvent::Done`] or
    /// [`CursorEvent::Error`].
    pub fn activate(mut self) -> mpsc::UnboundedReceiver<CursorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match self.next_batch().await {
                    Ok(Some(rows)) => {
                        if tx.send(CursorEvent::Batch(rows)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(CursorEvent::Done);
                        break;
                    }
                    Err(err) => {
                        let _ = tx.send(CursorEvent::Error(err));
                        break;
                    }
                }
            }
        });
        rx
    }

    /// Release the cursor early; the server is asked to stop the stream.
    /// A no-op on a terminated cursor.
    pub fn close(&mut self) {
        if self.state == CursorState::Open {
            let _ = self.commands.send(Command::Stop { token: self.token });
            self.state = CursorState::Closed;
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.close();
    }
}
