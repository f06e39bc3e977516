use std::collections::HashMap;
use std::io::IoSlice;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tokio_util::codec::FramedRead;
use tracing::{debug, instrument, trace, warn};

use crate::constant::ResponseType;
use crate::error::{Error, Result};
use crate::opts::Deadline;
use crate::protocol::frame::{self, FrameDecoder};
use crate::protocol::query;
use crate::protocol::response::Response;
use crate::tokio::conn::RunResult;
use crate::tokio::cursor::{Cursor, CursorUpdate};

pub(crate) type ReplySender = oneshot::Sender<Result<RunResult>>;
pub(crate) type QueryFn = Box<dyn FnOnce() -> Vec<u8> + Send>;

/// Commands accepted by the driver task. Callers never touch connection
/// state directly; everything goes through this queue, which also gives
/// submissions their wire order.
pub(crate) enum Command {
    /// Submit a pre-built query payload under a fresh token.
    Run {
        payload: Vec<u8>,
        timeout: Deadline,
        reply: ReplySender,
    },
    /// Submit an insert whose document bytes are spliced into the wrapper
    /// template without re-parsing.
    InsertRaw {
        prefix: Vec<u8>,
        raw: Vec<u8>,
        suffix: Vec<u8>,
        timeout: Deadline,
        reply: ReplySender,
    },
    /// Submit a payload built by a caller-supplied closure, invoked on the
    /// driver task.
    RunClosure {
        build: QueryFn,
        timeout: Deadline,
        reply: ReplySender,
    },
    /// Request the next batch for a streaming cursor's existing token.
    Continue { token: u64, timeout: Deadline },
    /// Release a cursor early.
    Stop { token: u64 },
    /// Posted by timer tasks; acted on only if `tag` still matches.
    TimerFired { token: u64, tag: u64 },
    Close { done: oneshot::Sender<()> },
}

/// A caller awaiting response(s) on one token.
///
/// The table holding these is the single source of truth for what is in
/// flight: entries are added on submission and removed on terminal response,
/// timeout, or connection close.
struct Receiver {
    /// Fresh per armed timer. Tokens are reused, so a timer fire identifies
    /// its target by `(token, tag)`, never by token alone.
    tag: u64,
    timer: Option<JoinHandle<()>>,
    kind: ReceiverKind,
}

enum ReceiverKind {
    /// One-shot caller awaiting a single response.
    Run { reply: ReplySender, timeout: Deadline },
    /// Cursor consumer receiving successive batches.
    Cursor {
        updates: mpsc::UnboundedSender<CursorUpdate>,
    },
}

impl Receiver {
    fn abort_timer(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

/// The connection's driver task: token allocator, receiver table, and
/// response demultiplexer over the framed read half.
pub(crate) struct Driver<R, W> {
    frames: FramedRead<R, FrameDecoder>,
    write: W,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Weak so that dropping every external handle ends the task; timer
    /// tasks and cursors hold strong clones for exactly as long as needed.
    loopback: mpsc::WeakUnboundedSender<Command>,
    next_token: u64,
    next_tag: u64,
    receivers: HashMap<u64, Receiver>,
}

impl<R, W> Driver<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(
        read: R,
        write: W,
        commands: mpsc::UnboundedReceiver<Command>,
        loopback: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            frames: FramedRead::new(read, FrameDecoder::new()),
            write,
            commands,
            loopback,
            next_token: 1,
            next_tag: 0,
            receivers: HashMap::new(),
        }
    }

    #[instrument(skip_all)]
    pub(crate) async fn run(mut self) {
        let reason = self.serve().await;
        if !matches!(reason, Error::Closed) {
            warn!("connection terminated: {}", reason);
        }
        self.shutdown();
    }

    /// Suspend on caller commands and inbound frames until something is
    /// terminal for the whole connection; the terminal reason is returned.
    async fn serve(&mut self) -> Error {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if let Some(fatal) = self.handle_command(cmd).await {
                            return fatal;
                        }
                    }
                    None => return Error::Closed,
                },
                inbound = self.frames.next() => match inbound {
                    Some(Ok((token, payload))) => self.dispatch(token, &payload),
                    Some(Err(err)) => return err,
                    None => return Error::Closed,
                },
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> Option<Error> {
        match cmd {
            Command::Run {
                payload,
                timeout,
                reply,
            } => self.submit(payload, timeout, reply).await,
            Command::RunClosure {
                build,
                timeout,
                reply,
            } => self.submit(build(), timeout, reply).await,
            Command::InsertRaw {
                prefix,
                raw,
                suffix,
                timeout,
                reply,
            } => self.submit_spliced(prefix, raw, suffix, timeout, reply).await,
            Command::Continue { token, timeout } => self.continue_cursor(token, timeout).await,
            Command::Stop { token } => self.stop_cursor(token).await,
            Command::TimerFired { token, tag } => {
                self.timer_fired(token, tag);
                None
            }
            Command::Close { done } => {
                let _ = done.send(());
                Some(Error::Closed)
            }
        }
    }

    /// Allocate a token, frame and send the payload, and register the
    /// one-shot receiver. A send failure is terminal for the connection.
    async fn submit(
        &mut self,
        payload: Vec<u8>,
        timeout: Deadline,
        reply: ReplySender,
    ) -> Option<Error> {
        let token = self.alloc_token();
        let framed = frame::encode_frame(token, &payload);
        if let Err(err) = write_all(&mut self.write, &framed).await {
            warn!(token, "query send failed: {}", err);
            let _ = reply.send(Err(Error::IoError(err)));
            return Some(Error::Closed);
        }
        self.register_run(token, timeout, reply);
        None
    }

    /// Same as [`submit`](Self::submit), but the payload reaches the wire as
    /// a gathered write of `header ‖ prefix ‖ raw ‖ suffix`; the length field
    /// is the sum of the pieces and the raw document is never re-parsed.
    async fn submit_spliced(
        &mut self,
        prefix: Vec<u8>,
        raw: Vec<u8>,
        suffix: Vec<u8>,
        timeout: Deadline,
        reply: ReplySender,
    ) -> Option<Error> {
        let token = self.alloc_token();
        let header = frame::spliced_frame_header(token, &prefix, &raw, &suffix);
        let mut slices = [
            IoSlice::new(&header),
            IoSlice::new(&prefix),
            IoSlice::new(&raw),
            IoSlice::new(&suffix),
        ];
        if let Err(err) = write_all_vectored(&mut self.write, &mut slices).await {
            warn!(token, "insert send failed: {}", err);
            let _ = reply.send(Err(Error::IoError(err)));
            return Some(Error::Closed);
        }
        if let Err(err) = self.write.flush().await {
            let _ = reply.send(Err(Error::IoError(err)));
            return Some(Error::Closed);
        }
        self.register_run(token, timeout, reply);
        None
    }

    fn register_run(&mut self, token: u64, timeout: Deadline, reply: ReplySender) {
        let tag = self.alloc_tag();
        let timer = timeout
            .duration()
            .and_then(|duration| self.arm_timer(token, tag, duration));
        self.receivers.insert(
            token,
            Receiver {
                tag,
                timer,
                kind: ReceiverKind::Run { reply, timeout },
            },
        );
    }

    /// Refresh the cursor receiver under its existing token and send the
    /// continuation frame. No new token is allocated.
    async fn continue_cursor(&mut self, token: u64, timeout: Deadline) -> Option<Error> {
        if !self.receivers.contains_key(&token) {
            // The cursor was already failed or drained; its update channel is
            // closed, so the consumer observes termination rather than a hang.
            debug!(token, "continuation for unknown token dropped");
            return None;
        }

        let tag = self.alloc_tag();
        let timer = timeout
            .duration()
            .and_then(|duration| self.arm_timer(token, tag, duration));
        if let Some(receiver) = self.receivers.get_mut(&token) {
            receiver.abort_timer();
            receiver.tag = tag;
            receiver.timer = timer;
        }

        let framed = frame::encode_frame(token, query::wire_continue());
        if let Err(err) = write_all(&mut self.write, &framed).await {
            warn!(token, "continuation send failed: {}", err);
            return Some(Error::Closed);
        }
        None
    }

    /// Drop the receiver and ask the server to release the stream.
    async fn stop_cursor(&mut self, token: u64) -> Option<Error> {
        let Some(receiver) = self.receivers.remove(&token) else {
            return None;
        };
        receiver.abort_timer();
        drop(receiver);

        let framed = frame::encode_frame(token, query::wire_stop());
        if let Err(err) = write_all(&mut self.write, &framed).await {
            warn!(token, "stop send failed: {}", err);
            return Some(Error::Closed);
        }
        None
    }

    fn timer_fired(&mut self, token: u64, tag: u64) {
        let current = self.receivers.get(&token).map(|receiver| receiver.tag);
        if current != Some(tag) {
            // The token completed and may have been reused; this fire
            // belongs to a receiver that no longer exists.
            trace!(token, tag, "stale timer fire discarded");
            return;
        }
        if let Some(receiver) = self.receivers.remove(&token) {
            match receiver.kind {
                ReceiverKind::Run { reply, .. } => {
                    let _ = reply.send(Err(Error::Timeout));
                }
                ReceiverKind::Cursor { updates } => {
                    let _ = updates.send(CursorUpdate::Failed(Error::Timeout));
                }
            }
        }
    }

    /// Route one completed frame to its receiver per the response type.
    fn dispatch(&mut self, token: u64, payload: &[u8]) {
        if !self.receivers.contains_key(&token) {
            // Stale response after timeout or close.
            debug!(token, "response for unknown token dropped");
            return;
        }

        let parsed = Response::parse(payload).and_then(|response| {
            let kind = response.kind()?;
            Ok((kind, response))
        });
        let (kind, response) = match parsed {
            Ok(ok) => ok,
            Err(err) => {
                // Malformed frame: fail this receiver only, the connection
                // stays usable.
                self.fail_receiver(token, err);
                return;
            }
        };

        let Some(receiver) = self.receivers.remove(&token) else {
            return;
        };
        receiver.abort_timer();

        match receiver.kind {
            ReceiverKind::Run { reply, timeout } => {
                self.finish_run(token, kind, response, reply, timeout);
            }
            ReceiverKind::Cursor { updates } => {
                self.advance_cursor(token, kind, response, updates);
            }
        }
    }

    fn finish_run(
        &mut self,
        token: u64,
        kind: ResponseType,
        response: Response,
        reply: ReplySender,
        timeout: Deadline,
    ) {
        match kind {
            ResponseType::SuccessAtom | ResponseType::ServerInfo => {
                let _ = reply.send(response.into_atom().map(RunResult::Atom));
            }
            ResponseType::SuccessSequence => {
                let Some(commands) = self.loopback.upgrade() else {
                    return;
                };
                let cursor = Cursor::drained(token, commands, response.r);
                let _ = reply.send(Ok(RunResult::Cursor(cursor)));
            }
            ResponseType::SuccessPartial => {
                // The receiver entry stays live so continuation responses on
                // this token find the cursor.
                let Some(commands) = self.loopback.upgrade() else {
                    return;
                };
                let (updates_tx, updates_rx) = mpsc::unbounded_channel();
                let cursor =
                    Cursor::streaming(token, commands, response.r, updates_rx, timeout);
                let tag = self.alloc_tag();
                self.receivers.insert(
                    token,
                    Receiver {
                        tag,
                        timer: None,
                        kind: ReceiverKind::Cursor {
                            updates: updates_tx,
                        },
                    },
                );
                let _ = reply.send(Ok(RunResult::Cursor(cursor)));
            }
            ResponseType::WaitComplete => {
                let _ = reply.send(Ok(RunResult::Done));
            }
            ResponseType::ClientError
            | ResponseType::CompileError
            | ResponseType::RuntimeError => {
                let _ = reply.send(Err(Error::ServerError(response.into_server_error(kind))));
            }
        }
    }

    fn advance_cursor(
        &mut self,
        token: u64,
        kind: ResponseType,
        response: Response,
        updates: mpsc::UnboundedSender<CursorUpdate>,
    ) {
        match kind {
            ResponseType::SuccessPartial => {
                if updates.send(CursorUpdate::Partial(response.r)).is_ok() {
                    // More batches to come; keep the entry with a fresh tag so
                    // a fire from the just-aborted timer cannot match it.
                    let tag = self.alloc_tag();
                    self.receivers.insert(
                        token,
                        Receiver {
                            tag,
                            timer: None,
                            kind: ReceiverKind::Cursor { updates },
                        },
                    );
                }
            }
            ResponseType::SuccessSequence => {
                let _ = updates.send(CursorUpdate::Final(response.r));
            }
            ResponseType::WaitComplete => {
                let _ = updates.send(CursorUpdate::Final(Vec::new()));
            }
            ResponseType::SuccessAtom | ResponseType::ServerInfo => {
                let _ = updates.send(CursorUpdate::Failed(Error::Protocol(
                    "atom response on a streaming token".to_string(),
                )));
            }
            ResponseType::ClientError
            | ResponseType::CompileError
            | ResponseType::RuntimeError => {
                let _ = updates.send(CursorUpdate::Failed(Error::ServerError(
                    response.into_server_error(kind),
                )));
            }
        }
    }

    fn fail_receiver(&mut self, token: u64, err: Error) {
        let Some(receiver) = self.receivers.remove(&token) else {
            return;
        };
        receiver.abort_timer();
        match receiver.kind {
            ReceiverKind::Run { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            ReceiverKind::Cursor { updates } => {
                let _ = updates.send(CursorUpdate::Failed(err));
            }
        }
    }

    /// Fail every outstanding receiver; callers observe exactly one terminal
    /// error each.
    fn shutdown(&mut self) {
        for (_, receiver) in self.receivers.drain() {
            receiver.abort_timer();
            match receiver.kind {
                ReceiverKind::Run { reply, .. } => {
                    let _ = reply.send(Err(Error::Closed));
                }
                ReceiverKind::Cursor { updates } => {
                    let _ = updates.send(CursorUpdate::Failed(Error::Closed));
                }
            }
        }
        self.commands.close();
    }

    /// Post-increment with wraparound: `u64::MAX` is followed by 0, then 1.
    /// Uniqueness among in-flight requests relies on fewer than 2^64
    /// allocations happening between a submission and its completion.
    fn alloc_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        token
    }

    fn alloc_tag(&mut self) -> u64 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        tag
    }

    fn arm_timer(&self, token: u64, tag: u64, duration: Duration) -> Option<JoinHandle<()>> {
        let fired = self.loopback.upgrade()?;
        Some(tokio::spawn(async move {
            sleep(duration).await;
            let _ = fired.send(Command::TimerFired { token, tag });
        }))
    }
}

#[cfg(test)]
impl<R, W> Driver<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Seed the counter to exercise allocation near the wrap point.
    pub(crate) fn set_next_token(&mut self, token: u64) {
        self.next_token = token;
    }
}

async fn write_all<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> std::io::Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await
}

/// Write all data from IoSlice buffers, handling partial writes
async fn write_all_vectored<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bufs: &mut [IoSlice<'_>],
) -> std::io::Result<()> {
    let mut bufs_idx = 0;

    while bufs_idx < bufs.len() {
        match writer.write_vectored(&bufs[bufs_idx..]).await {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole frame",
                ));
            }
            Ok(mut n) => {
                // Advance through buffers based on bytes written
                while n > 0 && bufs_idx < bufs.len() {
                    let buf_len = bufs[bufs_idx].len();
                    if n >= buf_len {
                        n -= buf_len;
                        bufs_idx += 1;
                    } else {
                        bufs[bufs_idx].advance(n);
                        n = 0;
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
