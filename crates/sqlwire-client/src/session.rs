//! The client session.
//!
//! A [`Session`] is a cloneable handle over one authenticated connection.
//! Every request/response cycle holds the connection mutex, so clones on
//! different threads take turns on the wire.
//!
//! A streaming row source keeps the connection busy until it is drained or
//! closed; any other statement in the meantime fails fast with
//! `ConnectionError::Busy`. Errors that desynchronize the channel poison the
//! session, after which every call fails with `ConnectionError::Poisoned`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use sqlwire_core::{ConnectionError, ConnectionErrorKind, Error, ProtocolError, Result, Value};

use crate::config::ClientConfig;
use crate::framer::Framer;
use crate::handshake::{Negotiator, SessionCapabilities};
use crate::protocol::{
    Command, OkPacket, PacketReader, PreparedStatement, StreamEnd, build_stmt_execute_payload,
    parse_stmt_prepare_ok, tag, prepared::cursor_type,
};
use crate::resultset::{BufferedRows, CursorRows, StreamingRows};
use crate::row::{ColumnDefinitions, RowDecoder, RowFormat};
use crate::transport::{self, Transport};
use crate::types::ColumnDefinition;

/// First frame of a statement response.
#[derive(Debug)]
pub(crate) enum Response {
    /// Statement completed without rows
    Ok(OkPacket),
    /// Rows follow. `eof` is the status frame closing the column block, when
    /// the server still sends one.
    Rows {
        columns: ColumnDefinitions,
        eof: Option<StreamEnd>,
    },
}

/// One step of a row stream.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RowStep {
    Row(RowFormat),
    End(StreamEnd),
}

/// Connection state guarded by the session mutex.
pub(crate) struct SessionInner {
    framer: Framer,
    config: ClientConfig,
    capabilities: SessionCapabilities,
    /// Seed of the initial challenge, reused by change user
    seed: Vec<u8>,
    /// RSA public key learned during authentication
    public_key: Option<String>,
    poisoned: bool,
    busy: bool,
    closed: bool,
}

impl SessionInner {
    /// Refuse work on a closed or poisoned connection.
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(connection_error(
                ConnectionErrorKind::Closed,
                "session has been closed",
            ));
        }
        if self.poisoned {
            return Err(connection_error(
                ConnectionErrorKind::Poisoned,
                "connection is unusable after an earlier fatal error",
            ));
        }
        Ok(())
    }

    /// Refuse new statements while a streaming result occupies the wire.
    pub(crate) fn check_ready(&self) -> Result<()> {
        self.check_open()?;
        if self.busy {
            return Err(connection_error(
                ConnectionErrorKind::Busy,
                "a streaming result is still open on this connection",
            ));
        }
        Ok(())
    }

    pub(crate) fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    pub(crate) fn fetch_size(&self) -> u32 {
        self.config.fetch_size
    }

    /// Poison the connection if `result` carries a desynchronizing error.
    pub(crate) fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.poisons_connection() && !self.poisoned {
                tracing::warn!(
                    connection_id = self.capabilities.connection_id,
                    error = %err,
                    "Connection poisoned"
                );
                self.poisoned = true;
                self.busy = false;
                self.framer.shutdown();
            }
        }
        result
    }

    pub(crate) fn send(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        tracing::debug!(
            command = ?command,
            len = payload.len(),
            connection_id = self.capabilities.connection_id,
            "Dispatching command"
        );
        self.framer.write_frame(command as u8, payload)
    }

    /// Read an OK frame answering a command.
    pub(crate) fn expect_ok(&mut self, context: &str) -> Result<OkPacket> {
        let frame = self.framer.read_frame()?;
        match frame.tag {
            tag::OK => parse_ok(&frame.payload),
            tag::ERR => Err(server_error(&frame.payload)),
            other => Err(ProtocolError::unexpected_tag(other, context).into()),
        }
    }

    /// Read the first frame of a statement response and, for a result set,
    /// its column block.
    pub(crate) fn read_response(&mut self) -> Result<Response> {
        let frame = self.framer.read_frame()?;
        match frame.tag {
            tag::OK => parse_ok(&frame.payload).map(Response::Ok),
            tag::ERR => Err(server_error(&frame.payload)),
            tag::LOCAL_INFILE => Err(ProtocolError {
                message: "LOCAL INFILE requests are not supported".to_string(),
                tag: Some(tag::LOCAL_INFILE),
            }
            .into()),
            tag::RESULTSET_HEADER => {
                let count = PacketReader::new(&frame.payload)
                    .read_lenenc_int()
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| protocol_error("malformed result set header"))?;
                let (columns, eof) = self.read_definitions(count)?;
                tracing::debug!(columns = count, "Result set header received");
                Ok(Response::Rows {
                    columns: ColumnDefinitions::new(columns),
                    eof,
                })
            }
            other => {
                Err(ProtocolError::unexpected_tag(other, "reading a statement response").into())
            }
        }
    }

    /// Read `count` column definitions and, unless EOF frames are deprecated,
    /// the EOF closing a non-empty block.
    fn read_definitions(
        &mut self,
        count: usize,
    ) -> Result<(Vec<ColumnDefinition>, Option<StreamEnd>)> {
        let mut definitions = Vec::with_capacity(count);
        for _ in 0..count {
            let frame = self.framer.read_frame()?;
            if frame.tag != tag::COLUMN_DEFINITION {
                return Err(
                    ProtocolError::unexpected_tag(frame.tag, "reading column definitions").into(),
                );
            }
            // The rest of the block is still on the wire, so a bad
            // definition leaves the stream misaligned.
            let definition = ColumnDefinition::parse(&frame.payload)
                .map_err(|e| protocol_error(&format!("malformed column definition: {e}")))?;
            definitions.push(definition);
        }
        let eof = if count > 0 && !self.capabilities.deprecate_eof() {
            Some(self.read_status("closing a column block")?)
        } else {
            None
        };
        Ok((definitions, eof))
    }

    /// Read an EOF or OK status frame.
    pub(crate) fn read_status(&mut self, context: &str) -> Result<StreamEnd> {
        let frame = self.framer.read_frame()?;
        parse_status(frame.tag, &frame.payload)?
            .ok_or_else(|| ProtocolError::unexpected_tag(frame.tag, context).into())
    }

    /// Read the next row frame into `buf`.
    pub(crate) fn read_row_into(&mut self, buf: &mut Vec<u8>) -> Result<RowStep> {
        let frame_tag = self.framer.read_frame_into(buf)?;
        match frame_tag {
            tag::TEXT_ROW => Ok(RowStep::Row(RowFormat::Text)),
            tag::BINARY_ROW => Ok(RowStep::Row(RowFormat::Binary)),
            other => match parse_status(other, buf.as_slice())? {
                Some(end) => Ok(RowStep::End(end)),
                None => Err(ProtocolError::unexpected_tag(other, "reading rows").into()),
            },
        }
    }

    /// Read rows up to and including the terminal status frame.
    pub(crate) fn read_rows(
        &mut self,
        columns: &ColumnDefinitions,
    ) -> Result<(Vec<RowDecoder>, StreamEnd)> {
        let mut rows = Vec::new();
        loop {
            let mut buf = Vec::new();
            match self.read_row_into(&mut buf)? {
                RowStep::Row(format) => rows.push(RowDecoder::new(columns.clone(), format, buf)),
                RowStep::End(end) => {
                    tracing::debug!(rows = rows.len(), "Result set complete");
                    return Ok((rows, end));
                }
            }
        }
    }

    /// Read one complete result.
    fn read_buffered(&mut self) -> Result<(BufferedRows, StreamEnd)> {
        match self.read_response()? {
            Response::Ok(ok) => {
                let end = StreamEnd::from(&ok);
                Ok((BufferedRows::from_ok(ok), end))
            }
            Response::Rows { columns, .. } => {
                let (rows, end) = self.read_rows(&columns)?;
                Ok((BufferedRows::new(columns, rows, end), end))
            }
        }
    }

    /// Discard the results that follow `end`.
    pub(crate) fn drain_results(&mut self, mut end: StreamEnd) -> Result<()> {
        while end.more_results() {
            end = match self.read_response()? {
                Response::Ok(ok) => StreamEnd::from(&ok),
                Response::Rows { columns, .. } => self.read_rows(&columns)?.1,
            };
        }
        Ok(())
    }

    fn read_prepared(&mut self, sql: &str) -> Result<PreparedStatement> {
        let frame = self.framer.read_frame()?;
        match frame.tag {
            tag::PREPARE_OK => {}
            tag::ERR => return Err(server_error(&frame.payload)),
            other => {
                return Err(ProtocolError::unexpected_tag(other, "preparing a statement").into());
            }
        }
        let header = parse_stmt_prepare_ok(&frame.payload)
            .ok_or_else(|| protocol_error("malformed PREPARE_OK payload"))?;
        let (params, _) = self.read_definitions(usize::from(header.num_params))?;
        let (columns, _) = self.read_definitions(usize::from(header.num_columns))?;
        tracing::debug!(
            statement_id = header.statement_id,
            params = params.len(),
            columns = columns.len(),
            "Statement prepared"
        );
        Ok(PreparedStatement {
            statement_id: header.statement_id,
            sql: sql.to_string(),
            params,
            columns: ColumnDefinitions::new(columns),
        })
    }

    fn quit(&mut self) {
        if !self.closed && !self.poisoned {
            // The server hangs up without answering.
            if let Err(e) = self.send(Command::Quit, &[]) {
                tracing::debug!(error = %e, "Quit command failed");
            }
        }
        self.closed = true;
        self.busy = false;
        self.framer.shutdown();
    }
}

/// A cloneable handle over one authenticated connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<SessionInner>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Session");
        if let Ok(inner) = self.inner.try_lock() {
            s.field("connection_id", &inner.capabilities.connection_id)
                .field("host", &inner.config.host)
                .field("user", &inner.config.user)
                .field("poisoned", &inner.poisoned)
                .field("busy", &inner.busy)
                .field("closed", &inner.closed);
        }
        s.finish_non_exhaustive()
    }
}

impl Session {
    /// Open a TCP connection and authenticate.
    #[tracing::instrument(
        level = "debug",
        skip(config),
        fields(host = %config.host, port = config.port, user = %config.user)
    )]
    pub fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let stream = transport::connect_tcp(&config.socket_addr(), config.connect_timeout)?;
        Self::handshake(Box::new(stream), config)
    }

    /// Authenticate over an already open channel.
    #[tracing::instrument(
        level = "debug",
        skip(transport, config),
        fields(host = %config.host, user = %config.user)
    )]
    pub fn handshake(transport: Box<dyn Transport>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let mut framer = Framer::with_max_frame_size(transport, config.max_frame_size);
        let outcome = Negotiator::new(&mut framer, &config).run(None)?;
        tracing::debug!(
            connection_id = outcome.capabilities.connection_id,
            server_version = %outcome.capabilities.server_version,
            plugin = %outcome.capabilities.auth_plugin,
            tls = outcome.capabilities.tls,
            "Session established"
        );
        Ok(Self {
            inner: Arc::new(Mutex::new(SessionInner {
                framer,
                config,
                capabilities: outcome.capabilities,
                seed: outcome.seed,
                public_key: outcome.public_key,
                poisoned: false,
                busy: false,
                closed: false,
            })),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one request/response cycle for a new statement.
    pub(crate) fn run<T>(&self, f: impl FnOnce(&mut SessionInner) -> Result<T>) -> Result<T> {
        let mut inner = self.lock();
        inner.check_ready()?;
        let result = f(&mut inner);
        inner.track(result)
    }

    /// Continue a conversation a streaming source already owns.
    pub(crate) fn run_owned<T>(&self, f: impl FnOnce(&mut SessionInner) -> Result<T>) -> Result<T> {
        let mut inner = self.lock();
        inner.check_open()?;
        let result = f(&mut inner);
        inner.track(result)
    }

    /// Capabilities agreed by the last (re)authentication.
    pub fn capabilities(&self) -> SessionCapabilities {
        self.lock().capabilities.clone()
    }

    pub fn connection_id(&self) -> u32 {
        self.lock().capabilities.connection_id
    }

    pub fn is_poisoned(&self) -> bool {
        self.lock().poisoned
    }

    /// Is a streaming result occupying the connection?
    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Run a text statement and buffer its first result.
    ///
    /// Further results of a multi-statement are read and discarded.
    #[tracing::instrument(level = "debug", skip(self, sql), fields(sql_len = sql.len()))]
    pub fn query(&self, sql: &str) -> Result<BufferedRows> {
        self.run(|inner| {
            inner.send(Command::Query, sql.as_bytes())?;
            let (rows, end) = inner.read_buffered()?;
            inner.drain_results(end)?;
            Ok(rows)
        })
    }

    /// Run a text statement and buffer every result it produces.
    #[tracing::instrument(level = "debug", skip(self, sql), fields(sql_len = sql.len()))]
    pub fn query_multi(&self, sql: &str) -> Result<Vec<BufferedRows>> {
        self.run(|inner| {
            inner.send(Command::Query, sql.as_bytes())?;
            let mut results = Vec::new();
            loop {
                let (rows, end) = inner.read_buffered()?;
                results.push(rows);
                if !end.more_results() {
                    return Ok(results);
                }
            }
        })
    }

    /// Run a text statement that is not expected to return rows.
    ///
    /// Returns the OK summary of the last result; rows are discarded.
    #[tracing::instrument(level = "debug", skip(self, sql), fields(sql_len = sql.len()))]
    pub fn execute(&self, sql: &str) -> Result<OkPacket> {
        self.run(|inner| {
            inner.send(Command::Query, sql.as_bytes())?;
            let mut last = OkPacket::default();
            loop {
                let end = match inner.read_response()? {
                    Response::Ok(ok) => {
                        let end = StreamEnd::from(&ok);
                        last = ok;
                        end
                    }
                    Response::Rows { columns, .. } => {
                        let (_, end) = inner.read_rows(&columns)?;
                        last = OkPacket {
                            status_flags: end.status_flags,
                            warnings: end.warnings,
                            ..OkPacket::default()
                        };
                        end
                    }
                };
                if !end.more_results() {
                    return Ok(last);
                }
            }
        })
    }

    /// Run a text statement and stream its rows one frame at a time.
    ///
    /// The connection stays busy until the source is drained or closed.
    #[tracing::instrument(level = "debug", skip(self, sql), fields(sql_len = sql.len()))]
    pub fn query_streaming(&self, sql: &str) -> Result<StreamingRows> {
        let columns = self.run(|inner| {
            inner.send(Command::Query, sql.as_bytes())?;
            match inner.read_response()? {
                Response::Ok(ok) => {
                    inner.drain_results(StreamEnd::from(&ok))?;
                    Ok(None)
                }
                Response::Rows { columns, .. } => {
                    inner.set_busy(true);
                    Ok(Some(columns))
                }
            }
        })?;
        Ok(match columns {
            Some(columns) => StreamingRows::new(self.clone(), columns),
            None => StreamingRows::empty(self.clone()),
        })
    }

    /// Prepare a statement on the server.
    #[tracing::instrument(level = "debug", skip(self, sql), fields(sql_len = sql.len()))]
    pub fn prepare(&self, sql: &str) -> Result<PreparedStatement> {
        self.run(|inner| {
            inner.send(Command::StmtPrepare, sql.as_bytes())?;
            inner.read_prepared(sql)
        })
    }

    /// Execute a prepared statement and buffer its binary rows.
    #[tracing::instrument(
        level = "debug",
        skip(self, statement, params),
        fields(statement_id = statement.statement_id, params = params.len())
    )]
    pub fn execute_prepared(
        &self,
        statement: &PreparedStatement,
        params: &[Value],
    ) -> Result<BufferedRows> {
        let payload =
            build_stmt_execute_payload(statement.statement_id, params, cursor_type::NO_CURSOR);
        self.run(|inner| {
            inner.send(Command::StmtExecute, &payload)?;
            let (rows, end) = inner.read_buffered()?;
            inner.drain_results(end)?;
            Ok(rows)
        })
    }

    /// Execute a prepared statement through a read-only server cursor.
    ///
    /// Rows are fetched in batches of the configured fetch size.
    #[tracing::instrument(
        level = "debug",
        skip(self, statement, params),
        fields(statement_id = statement.statement_id, params = params.len())
    )]
    pub fn execute_cursor(
        &self,
        statement: &PreparedStatement,
        params: &[Value],
    ) -> Result<CursorRows> {
        let statement_id = statement.statement_id;
        let payload = build_stmt_execute_payload(statement_id, params, cursor_type::READ_ONLY);
        self.run(|inner| {
            inner.send(Command::StmtExecute, &payload)?;
            match inner.read_response()? {
                Response::Ok(ok) => {
                    inner.drain_results(StreamEnd::from(&ok))?;
                    Ok(CursorRows::inline(
                        self.clone(),
                        ColumnDefinitions::default(),
                        Vec::new(),
                    ))
                }
                Response::Rows { columns, eof } => {
                    let status = match eof {
                        Some(status) => status,
                        // Without EOF frames the next frame is either the
                        // cursor status or the first inline row.
                        None => {
                            let mut buf = Vec::new();
                            match inner.read_row_into(&mut buf)? {
                                RowStep::End(status) if status.cursor_exists() => status,
                                RowStep::End(end) => {
                                    inner.drain_results(end)?;
                                    return Ok(CursorRows::inline(
                                        self.clone(),
                                        columns,
                                        Vec::new(),
                                    ));
                                }
                                RowStep::Row(format) => {
                                    let first = RowDecoder::new(columns.clone(), format, buf);
                                    let (rest, end) = inner.read_rows(&columns)?;
                                    inner.drain_results(end)?;
                                    let rows = std::iter::once(first).chain(rest).collect();
                                    return Ok(CursorRows::inline(self.clone(), columns, rows));
                                }
                            }
                        }
                    };
                    if status.cursor_exists() {
                        tracing::debug!(statement_id, "Server cursor opened");
                        Ok(CursorRows::open(
                            self.clone(),
                            statement_id,
                            columns,
                            inner.fetch_size(),
                        ))
                    } else {
                        let (rows, end) = inner.read_rows(&columns)?;
                        inner.drain_results(end)?;
                        Ok(CursorRows::inline(self.clone(), columns, rows))
                    }
                }
            }
        })
    }

    /// Deallocate a prepared statement. The server sends no reply.
    #[tracing::instrument(
        level = "debug",
        skip(self, statement),
        fields(statement_id = statement.statement_id)
    )]
    pub fn close_statement(&self, statement: PreparedStatement) -> Result<()> {
        self.run(|inner| inner.send(Command::StmtClose, &statement.statement_id.to_le_bytes()))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn ping(&self) -> Result<()> {
        self.run(|inner| {
            inner.send(Command::Ping, &[])?;
            inner.expect_ok("awaiting ping reply").map(drop)
        })
    }

    /// Make `database` the session's default schema.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn select_database(&self, database: &str) -> Result<()> {
        self.run(|inner| {
            inner.send(Command::InitDb, database.as_bytes())?;
            inner.expect_ok("selecting a database")?;
            inner.config.database = Some(database.to_string());
            Ok(())
        })
    }

    /// Reset session state on the server without re-authenticating.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn reset_connection(&self) -> Result<()> {
        self.run(|inner| {
            inner.send(Command::ResetConnection, &[])?;
            inner.expect_ok("resetting the connection").map(drop)
        })
    }

    /// Re-authenticate the channel as another user.
    ///
    /// The session capabilities are replaced as a whole on success. Any
    /// failure poisons the connection.
    #[tracing::instrument(level = "debug", skip(self, password))]
    pub fn change_user(
        &self,
        user: &str,
        password: Option<&str>,
        database: Option<&str>,
    ) -> Result<()> {
        self.run(|inner| {
            let mut config = inner.config.clone();
            config.user = user.to_string();
            config.password = password.map(str::to_string);
            config.database = database.map(str::to_string);

            let outcome = Negotiator::new(&mut inner.framer, &config).change_user(
                &inner.capabilities,
                &inner.seed,
                inner.public_key.clone(),
            )?;
            tracing::debug!(
                user,
                plugin = %outcome.capabilities.auth_plugin,
                "User changed"
            );
            inner.capabilities = outcome.capabilities;
            if outcome.public_key.is_some() {
                inner.public_key = outcome.public_key;
            }
            inner.config = config;
            Ok(())
        })
    }

    /// Send an arbitrary command.
    ///
    /// Commands the server answers must be answered with OK; the parsed OK
    /// is returned. Commands without a reply return `None`.
    #[tracing::instrument(level = "debug", skip(self, payload), fields(len = payload.len()))]
    pub fn command(&self, command: Command, payload: &[u8]) -> Result<Option<OkPacket>> {
        self.run(|inner| {
            inner.send(command, payload)?;
            if command.expects_response() {
                inner.expect_ok("awaiting command reply").map(Some)
            } else {
                Ok(None)
            }
        })
    }

    /// Say goodbye and release the channel. Closing twice is a no-op.
    ///
    /// Fails with a busy error while a streaming result is open; close or
    /// drain the stream first.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.busy && !inner.closed {
            return Err(connection_error(
                ConnectionErrorKind::Busy,
                "a streaming result is still open",
            ));
        }
        if !inner.closed {
            inner.quit();
            tracing::debug!(connection_id = inner.capabilities.connection_id, "Session closed");
        }
        Ok(())
    }
}

/// Decode a status frame, `None` when `frame_tag` is not in the status family.
fn parse_status(frame_tag: u8, payload: &[u8]) -> Result<Option<StreamEnd>> {
    match frame_tag {
        tag::EOF => PacketReader::new(payload)
            .parse_eof_packet()
            .map(|eof| Some(StreamEnd::from(eof)))
            .ok_or_else(|| protocol_error("malformed EOF payload")),
        tag::OK => parse_ok(payload).map(|ok| Some(StreamEnd::from(&ok))),
        tag::ERR => Err(server_error(payload)),
        _ => Ok(None),
    }
}

fn parse_ok(payload: &[u8]) -> Result<OkPacket> {
    PacketReader::new(payload)
        .parse_ok_packet()
        .ok_or_else(|| protocol_error("malformed OK payload"))
}

fn server_error(payload: &[u8]) -> Error {
    match PacketReader::new(payload).parse_err_packet() {
        Some(err) => Error::Server(err.into()),
        None => protocol_error("malformed ERR payload"),
    }
}

fn protocol_error(message: &str) -> Error {
    Error::Protocol(ProtocolError::new(message))
}

fn connection_error(kind: ConnectionErrorKind, message: &str) -> Error {
    Error::Connection(ConnectionError::new(kind, message))
}
