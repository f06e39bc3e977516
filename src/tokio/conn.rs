use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout};

use crate::constant::{DRIVER_CALL_TIMEOUT, TermType};
use crate::error::{Error, Result};
use crate::opts::{Deadline, Opts, RunOptions};
use crate::protocol::handshake::handshake;
use crate::protocol::query;
use crate::tokio::cursor::Cursor;
use crate::tokio::driver::{Command, Driver, ReplySender};
use crate::tokio::stream;

/// The three user-facing response shapes.
#[derive(Debug)]
pub enum RunResult {
    /// A single value.
    Atom(Value),
    /// A multi-row result iterated through a cursor, either streaming or
    /// already complete.
    Cursor(Cursor),
    /// Acknowledgement with no payload.
    Done,
}

impl RunResult {
    pub fn into_atom(self) -> Result<Value> {
        match self {
            Self::Atom(value) => Ok(value),
            _ => Err(Error::Protocol("expected an atom response".to_string())),
        }
    }

    pub fn into_cursor(self) -> Result<Cursor> {
        match self {
            Self::Cursor(cursor) => Ok(cursor),
            _ => Err(Error::Protocol("expected a sequence response".to_string())),
        }
    }
}

/// A connection to one server
///
/// The handle is cheap to clone; all clones feed the same driver task, which
/// owns the socket, the token counter, and the in-flight request table.
/// Submissions reach the wire in call order; responses are matched back by
/// token, so any number of requests may be outstanding at once.
#[derive(Debug, Clone)]
pub struct Conn {
    commands: mpsc::UnboundedSender<Command>,
    default_db: Option<String>,
}

impl Conn {
    /// Create a new connection from connection options (async)
    ///
    /// This performs the complete connect sequence:
    /// 1. Parses the connection options
    /// 2. Opens the TCP transport with the configured socket hints
    /// 3. Drives the SCRAM-SHA-256 handshake to completion
    /// 4. Spawns the driver task and returns a ready-to-use handle
    ///
    /// # Examples
    /// ```no_run
    /// # use zero_reql::{Conn, Opts};
    /// # async fn example() -> zero_reql::Result<()> {
    /// // Using a URL string
    /// let conn = Conn::connect("rethinkdb://admin@localhost:28015").await?;
    ///
    /// // Using an Opts struct
    /// let opts = Opts {
    ///     host: "localhost".to_string(),
    ///     password: "secret".to_string(),
    ///     ..Opts::default()
    /// };
    /// let conn = Conn::connect(opts).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts: Opts = opts.try_into()?;

        let mut tcp = stream::connect(&opts).await?;
        let deadline = Instant::now() + opts.connect_timeout;
        if let Err(err) = handshake(&mut tcp, &opts.user, &opts.password, deadline).await {
            // Handshake failures never enter the request path; close the
            // transport here and surface the error to the connecting caller.
            let _ = tcp.shutdown().await;
            return Err(err);
        }

        let (read, write) = tcp.into_split();
        let (commands, queue) = mpsc::unbounded_channel();
        let driver = Driver::new(read, write, queue, commands.downgrade());
        tokio::spawn(driver.run());

        Ok(Self {
            commands,
            default_db: opts.db,
        })
    }

    /// Run a query term with default options (5 second timeout).
    ///
    /// The term is a pre-built wire tree; this driver does not provide a
    /// query DSL.
    pub async fn run(&self, query: Value) -> Result<RunResult> {
        self.run_with_opts(query, RunOptions::default()).await
    }

    pub async fn run_with_opts(&self, query_term: Value, options: RunOptions) -> Result<RunResult> {
        let global_opts = self.with_default_db(options.global_opts);
        let payload = query::wire_start(&query_term, &global_opts)?;
        self.call(move |reply| Command::Run {
            payload,
            timeout: options.timeout,
            reply,
        })
        .await
    }

    /// Insert pre-encoded JSON documents into `db`.`table`.
    ///
    /// `raw_json` (one document or an array of documents) is spliced into the
    /// insert wrapper byte-for-byte; it is never parsed or re-encoded, so a
    /// large document costs one gathered write.
    pub async fn insert_raw(
        &self,
        db: &str,
        table: &str,
        raw_json: Vec<u8>,
        opts: &Value,
        timeout: Deadline,
    ) -> Result<RunResult> {
        let (prefix, suffix) = query::insert_splice(db, table, opts)?;
        self.call(move |reply| Command::InsertRaw {
            prefix,
            raw: raw_json,
            suffix,
            timeout,
            reply,
        })
        .await
    }

    /// Run a query whose wire payload is produced by `build`, invoked on the
    /// driver task at submission time.
    pub async fn run_closure(
        &self,
        build: impl FnOnce() -> Vec<u8> + Send + 'static,
        timeout: Deadline,
    ) -> Result<RunResult> {
        self.call(move |reply| Command::RunClosure {
            build: Box::new(build),
            timeout,
            reply,
        })
        .await
    }

    /// Wait until all previous noreply writes have been flushed by the server.
    pub async fn noreply_wait(&self) -> Result<()> {
        let result = self
            .call(|reply| Command::Run {
                payload: query::wire_noreply_wait().to_vec(),
                timeout: Deadline::Default,
                reply,
            })
            .await?;
        match result {
            RunResult::Done => Ok(()),
            _ => Err(Error::Protocol(
                "unexpected response shape to noreply_wait".to_string(),
            )),
        }
    }

    /// Fetch the server's identity document.
    pub async fn server_info(&self) -> Result<Value> {
        let result = self
            .call(|reply| Command::Run {
                payload: query::wire_server_info().to_vec(),
                timeout: Deadline::Default,
                reply,
            })
            .await?;
        result.into_atom()
    }

    /// Close the connection. Every outstanding request fails with
    /// [`Error::Closed`]; calling this on an already-closed connection is a
    /// no-op.
    pub async fn close(&self) -> Result<()> {
        let (done, ack) = oneshot::channel();
        if self.commands.send(Command::Close { done }).is_err() {
            return Ok(());
        }
        let _ = timeout(DRIVER_CALL_TIMEOUT, ack).await;
        Ok(())
    }

    /// Inject the connection's default database into global options that
    /// carry none.
    fn with_default_db(&self, mut opts: Value) -> Value {
        if let Some(db) = &self.default_db {
            if let Value::Object(map) = &mut opts {
                map.entry("db")
                    .or_insert_with(|| json!([TermType::Db as u8, [db]]));
            }
        }
        opts
    }

    /// Send one command and await the driver's reply, bounded by the shared
    /// driver-call timeout.
    async fn call(&self, make: impl FnOnce(ReplySender) -> Command) -> Result<RunResult> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| Error::Closed)?;
        match timeout(DRIVER_CALL_TIMEOUT, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Err(Error::Timeout),
        }
    }
}
