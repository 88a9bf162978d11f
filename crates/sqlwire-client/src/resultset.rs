//! Row sources.
//!
//! Every statement result is consumed through [`RowSource`]. Three delivery
//! strategies implement it:
//!
//! - [`BufferedRows`]: every row is already in memory; navigation works in
//!   both directions.
//! - [`CursorRows`]: the server keeps a read-only cursor open and rows are
//!   fetched in batches of the configured fetch size.
//! - [`StreamingRows`]: one row in flight, each advance reads one frame; the
//!   connection is busy until the stream is drained or closed.
//!
//! Positions are 1-based: 0 is before the first row and `n + 1` after the
//! last one.

use std::collections::VecDeque;

use sqlwire_core::{Error, Result};

use crate::protocol::{Command, OkPacket, StreamEnd, build_stmt_fetch_payload};
use crate::row::{ColumnDefinitions, RowArena, RowDecoder, RowFormat};
use crate::session::{RowStep, Session};

fn forward_only(operation: &'static str) -> Error {
    Error::ForwardOnlyViolation { operation }
}

/// A forward-moving window over the rows of one result.
pub trait RowSource {
    fn columns(&self) -> &ColumnDefinitions;

    /// Is there a row after the current one? May block on the connection.
    fn has_next(&mut self) -> Result<bool>;

    /// Advance and return the new current row, `None` past the last row.
    fn next_row(&mut self) -> Result<Option<RowDecoder>>;

    /// 1-based index of the current row.
    fn position(&self) -> usize;

    fn is_before_first(&self) -> bool {
        self.position() == 0
    }

    fn is_after_last(&self) -> bool;

    fn is_first(&self) -> bool {
        self.position() == 1 && !self.is_after_last()
    }

    /// Is the current row the last one? May block to look ahead.
    fn is_last(&mut self) -> Result<bool>;

    /// Release the source. Idempotent.
    fn close(&mut self) -> Result<()>;

    fn before_first(&mut self) -> Result<()> {
        Err(forward_only("before_first"))
    }

    fn after_last(&mut self) -> Result<()> {
        Err(forward_only("after_last"))
    }

    fn move_relative(&mut self, _rows: isize) -> Result<Option<RowDecoder>> {
        Err(forward_only("move_relative"))
    }

    fn set_current_row(&mut self, _row: usize) -> Result<Option<RowDecoder>> {
        Err(forward_only("set_current_row"))
    }

    fn previous(&mut self) -> Result<Option<RowDecoder>> {
        Err(forward_only("previous"))
    }

    fn current(&self) -> Result<Option<RowDecoder>> {
        Err(forward_only("current"))
    }

    /// Iterate the remaining rows.
    fn rows(&mut self) -> Rows<'_, Self>
    where
        Self: Sized,
    {
        Rows { source: self }
    }
}

/// Iterator over the remaining rows of a [`RowSource`].
#[derive(Debug)]
pub struct Rows<'a, S: RowSource> {
    source: &'a mut S,
}

impl<S: RowSource> Iterator for Rows<'_, S> {
    type Item = Result<RowDecoder>;

    fn next(&mut self) -> Option<Self::Item> {
        self.source.next_row().transpose()
    }
}

/// A fully materialized result.
#[derive(Debug, Clone, Default)]
pub struct BufferedRows {
    columns: ColumnDefinitions,
    rows: Vec<RowDecoder>,
    position: usize,
    end: StreamEnd,
    ok: Option<OkPacket>,
    closed: bool,
}

impl BufferedRows {
    pub fn new(columns: ColumnDefinitions, rows: Vec<RowDecoder>, end: StreamEnd) -> Self {
        Self {
            columns,
            rows,
            end,
            ..Self::default()
        }
    }

    /// A result without rows, summarized by an OK frame.
    pub fn from_ok(ok: OkPacket) -> Self {
        Self {
            end: StreamEnd::from(&ok),
            ok: Some(ok),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The OK summary, when the statement produced no result set.
    pub fn ok_packet(&self) -> Option<&OkPacket> {
        self.ok.as_ref()
    }

    pub fn affected_rows(&self) -> u64 {
        self.ok.as_ref().map_or(0, |ok| ok.affected_rows)
    }

    /// Status of the frame that ended the result.
    pub fn status(&self) -> StreamEnd {
        self.end
    }

    /// All rows, independent of the current position.
    pub fn as_slice(&self) -> &[RowDecoder] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<RowDecoder> {
        self.rows
    }

    fn row_at(&self, position: usize) -> Option<RowDecoder> {
        position
            .checked_sub(1)
            .and_then(|i| self.rows.get(i))
            .cloned()
    }

    fn seek(&mut self, position: usize) -> Option<RowDecoder> {
        self.position = position.min(self.rows.len() + 1);
        self.row_at(self.position)
    }
}

impl RowSource for BufferedRows {
    fn columns(&self) -> &ColumnDefinitions {
        &self.columns
    }

    fn has_next(&mut self) -> Result<bool> {
        Ok(!self.closed && self.position < self.rows.len())
    }

    fn next_row(&mut self) -> Result<Option<RowDecoder>> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.seek(self.position + 1))
    }

    fn position(&self) -> usize {
        self.position
    }

    fn is_after_last(&self) -> bool {
        self.position > self.rows.len()
    }

    fn is_first(&self) -> bool {
        self.position == 1 && !self.rows.is_empty()
    }

    fn is_last(&mut self) -> Result<bool> {
        Ok(!self.rows.is_empty() && self.position == self.rows.len())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.rows.clear();
        self.position = 0;
        Ok(())
    }

    fn before_first(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn after_last(&mut self) -> Result<()> {
        self.position = self.rows.len() + 1;
        Ok(())
    }

    fn move_relative(&mut self, rows: isize) -> Result<Option<RowDecoder>> {
        let target = self.position.saturating_add_signed(rows);
        Ok(self.seek(target))
    }

    fn set_current_row(&mut self, row: usize) -> Result<Option<RowDecoder>> {
        Ok(self.seek(row))
    }

    fn previous(&mut self) -> Result<Option<RowDecoder>> {
        self.move_relative(-1)
    }

    fn current(&self) -> Result<Option<RowDecoder>> {
        Ok(self.row_at(self.position))
    }
}

/// Rows pulled from a server-side cursor in batches.
#[derive(Debug)]
pub struct CursorRows {
    session: Session,
    statement_id: u32,
    columns: ColumnDefinitions,
    fetch_size: u32,
    batch: VecDeque<RowDecoder>,
    position: usize,
    /// The server reported the last row, nothing more to fetch
    exhausted: bool,
    after_last: bool,
    closed: bool,
}

impl CursorRows {
    pub(crate) fn open(
        session: Session,
        statement_id: u32,
        columns: ColumnDefinitions,
        fetch_size: u32,
    ) -> Self {
        Self {
            session,
            statement_id,
            columns,
            fetch_size,
            batch: VecDeque::new(),
            position: 0,
            exhausted: false,
            after_last: false,
            closed: false,
        }
    }

    /// Rows the server sent inline because it opened no cursor.
    pub(crate) fn inline(
        session: Session,
        columns: ColumnDefinitions,
        rows: Vec<RowDecoder>,
    ) -> Self {
        let mut source = Self::open(session, 0, columns, 0);
        source.batch = rows.into();
        source.exhausted = true;
        source
    }

    pub fn statement_id(&self) -> u32 {
        self.statement_id
    }

    pub fn fetch_size(&self) -> u32 {
        self.fetch_size
    }

    /// Number of rows fetched but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.batch.len()
    }

    /// Fetch until the local batch holds a row or the cursor is exhausted.
    fn fill(&mut self) -> Result<()> {
        while self.batch.is_empty() && !self.exhausted && !self.closed {
            let payload = build_stmt_fetch_payload(self.statement_id, self.fetch_size);
            let columns = self.columns.clone();
            let (rows, end) = self.session.run(|inner| {
                inner.send(Command::StmtFetch, &payload)?;
                inner.read_rows(&columns)
            })?;
            tracing::debug!(
                statement_id = self.statement_id,
                rows = rows.len(),
                last = end.last_row_sent(),
                "Fetched cursor batch"
            );
            // An empty batch ends the cursor even without the last-row flag.
            self.exhausted = end.last_row_sent() || rows.is_empty();
            self.batch.extend(rows);
        }
        Ok(())
    }
}

impl RowSource for CursorRows {
    fn columns(&self) -> &ColumnDefinitions {
        &self.columns
    }

    fn has_next(&mut self) -> Result<bool> {
        self.fill()?;
        Ok(!self.batch.is_empty())
    }

    fn next_row(&mut self) -> Result<Option<RowDecoder>> {
        if self.after_last || self.closed {
            return Ok(None);
        }
        self.fill()?;
        self.position += 1;
        match self.batch.pop_front() {
            Some(row) => Ok(Some(row)),
            None => {
                self.after_last = true;
                Ok(None)
            }
        }
    }

    fn position(&self) -> usize {
        self.position
    }

    fn is_after_last(&self) -> bool {
        self.after_last
    }

    fn is_last(&mut self) -> Result<bool> {
        if self.position == 0 || self.after_last {
            return Ok(false);
        }
        Ok(!self.has_next()?)
    }

    /// Close the server cursor. The prepared statement stays usable.
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.batch.clear();
        if self.exhausted {
            return Ok(());
        }
        let statement_id = self.statement_id;
        tracing::debug!(statement_id, "Closing server cursor");
        self.session.run(|inner| {
            inner.send(Command::StmtReset, &statement_id.to_le_bytes())?;
            inner.expect_ok("closing a cursor").map(drop)
        })
    }
}

impl Drop for CursorRows {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::debug!(statement_id = self.statement_id, error = %e, "Cursor close failed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// More frames may follow
    Open,
    /// The terminal frame has been read
    Exhausted,
    Closed,
}

/// Rows read off the wire one frame at a time.
///
/// Every frame lands in one reusable [`RowArena`]. Reading the next frame,
/// including the look-ahead done by [`has_next`](RowSource::has_next),
/// invalidates the previously returned row.
#[derive(Debug)]
pub struct StreamingRows {
    session: Session,
    columns: ColumnDefinitions,
    arena: RowArena,
    format: RowFormat,
    /// The arena holds a row that has not been returned yet
    pending: bool,
    position: usize,
    after_last: bool,
    state: StreamState,
}

impl StreamingRows {
    pub(crate) fn new(session: Session, columns: ColumnDefinitions) -> Self {
        Self {
            session,
            columns,
            arena: RowArena::new(),
            format: RowFormat::Text,
            pending: false,
            position: 0,
            after_last: false,
            state: StreamState::Open,
        }
    }

    /// A stream for a statement that produced no rows.
    pub(crate) fn empty(session: Session) -> Self {
        let mut source = Self::new(session, ColumnDefinitions::default());
        source.state = StreamState::Exhausted;
        source
    }

    /// Is this stream still holding the connection?
    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    /// Read the next frame into the arena. Returns false at the end.
    fn advance(&mut self) -> Result<bool> {
        if self.state != StreamState::Open {
            return Ok(false);
        }
        let arena = &mut self.arena;
        let step = self.session.run_owned(|inner| {
            let step = arena.refill(|buf| inner.read_row_into(buf));
            match step {
                Ok(RowStep::End(end)) => {
                    let drained = inner.drain_results(end);
                    inner.set_busy(false);
                    drained.map(|()| RowStep::End(end))
                }
                Err(e) => {
                    inner.set_busy(false);
                    Err(e)
                }
                row => row,
            }
        });
        match step {
            Ok(RowStep::Row(format)) => {
                self.format = format;
                self.pending = true;
                Ok(true)
            }
            Ok(RowStep::End(_)) => {
                tracing::debug!(rows = self.position, "Stream exhausted");
                self.state = StreamState::Exhausted;
                Ok(false)
            }
            Err(e) => {
                self.state = StreamState::Exhausted;
                Err(e)
            }
        }
    }
}

impl RowSource for StreamingRows {
    fn columns(&self) -> &ColumnDefinitions {
        &self.columns
    }

    fn has_next(&mut self) -> Result<bool> {
        if self.pending {
            return Ok(true);
        }
        self.advance()
    }

    fn next_row(&mut self) -> Result<Option<RowDecoder>> {
        if self.after_last || self.state == StreamState::Closed {
            return Ok(None);
        }
        if !self.pending && !self.advance()? {
            self.position += 1;
            self.after_last = true;
            return Ok(None);
        }
        self.pending = false;
        self.position += 1;
        Ok(Some(self.arena.row(self.columns.clone(), self.format)))
    }

    fn position(&self) -> usize {
        self.position
    }

    fn is_after_last(&self) -> bool {
        self.after_last
    }

    fn is_last(&mut self) -> Result<bool> {
        if self.position == 0 || self.after_last {
            return Ok(false);
        }
        Ok(!self.has_next()?)
    }

    /// Drain the remaining rows and results, releasing the connection.
    fn close(&mut self) -> Result<()> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        let mut drained = 0usize;
        while self.advance()? {
            drained += 1;
        }
        if drained > 0 {
            tracing::debug!(drained, "Drained unread rows on close");
        }
        self.pending = false;
        self.arena.invalidate();
        self.state = StreamState::Closed;
        Ok(())
    }
}

impl Drop for StreamingRows {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::debug!(error = %e, "Streaming result close failed");
        }
    }
}
