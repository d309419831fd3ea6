//! Per-pane replica of a remote terminal, rebuilt from `redraw` events.
//!
//! The server has already interpreted the VT stream; what arrives here is a
//! batch of semantic edits (`resize`, `write`, `style`, `cursor_pos`, ...).
//! Edits accumulate in the grid and the dirty set until a `flush` marks the
//! frame coherent. The consumer repaints only after a flush and clears the
//! dirty set itself once the paint is done.

use std::collections::HashSet;

use rmpv::Value;

use crate::style::{Attrs, StyleTable};
use crate::types::PtyId;

/// Largest replica a `resize` may ask for. Bigger requests are dropped.
pub const MAX_ROWS: u16 = 1024;
pub const MAX_COLS: u16 = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub grapheme: String,
    pub style: Option<u64>,
}

impl Default for Cell {
    fn default() -> Self {
        Cell { grapheme: " ".to_string(), style: None }
    }
}

#[derive(Debug, Clone)]
pub struct Grid {
    rows: u16,
    cols: u16,
    cells: Vec<Cell>,
}

impl Grid {
    pub fn new(rows: u16, cols: u16) -> Self {
        Grid { rows, cols, cells: vec![Cell::default(); rows as usize * cols as usize] }
    }

    pub fn rows(&self) -> u16 { self.rows }
    pub fn cols(&self) -> u16 { self.cols }

    fn index(&self, row: u16, col: u16) -> Option<usize> {
        (row < self.rows && col < self.cols).then(|| row as usize * self.cols as usize + col as usize)
    }

    pub fn get(&self, row: u16, col: u16) -> Option<&Cell> {
        self.index(row, col).map(|i| &self.cells[i])
    }

    fn set(&mut self, row: u16, col: u16, grapheme: &str, style: Option<u64>) -> bool {
        match self.index(row, col) {
            Some(i) => {
                let cell = &mut self.cells[i];
                cell.grapheme.clear();
                cell.grapheme.push_str(grapheme);
                cell.style = style;
                true
            }
            None => false,
        }
    }

    /// Row contents as plain text, trailing blanks kept.
    pub fn row_text(&self, row: u16) -> String {
        (0..self.cols).filter_map(|c| self.get(row, c)).map(|c| c.grapheme.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CursorShape {
    #[default]
    Block,
    Beam,
    Underline,
}

impl CursorShape {
    pub fn parse(s: &str) -> Option<CursorShape> {
        match s {
            "block" => Some(CursorShape::Block),
            "beam" | "bar" => Some(CursorShape::Beam),
            "underline" => Some(CursorShape::Underline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub row: u16,
    pub col: u16,
    pub visible: bool,
    pub shape: CursorShape,
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor { row: 0, col: 0, visible: true, shape: CursorShape::Block }
    }
}

/// Stream selection between two cells, inclusive, in reading order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub start: (u16, u16),
    pub end: (u16, u16),
}

impl Selection {
    pub fn contains(&self, row: u16, col: u16) -> bool {
        let (a, b) = if self.start <= self.end { (self.start, self.end) } else { (self.end, self.start) };
        (row, col) >= a && (row, col) <= b
    }
}

#[derive(Debug, Clone, Default)]
pub struct DirtySet {
    cells: HashSet<(u16, u16)>,
    full: bool,
}

impl DirtySet {
    pub fn mark(&mut self, row: u16, col: u16) {
        if !self.full { self.cells.insert((row, col)); }
    }

    pub fn mark_all(&mut self) {
        self.full = true;
        self.cells.clear();
    }

    pub fn is_full(&self) -> bool { self.full }
    pub fn is_empty(&self) -> bool { !self.full && self.cells.is_empty() }
    pub fn contains(&self, row: u16, col: u16) -> bool { self.full || self.cells.contains(&(row, col)) }
    pub fn cells(&self) -> impl Iterator<Item = (u16, u16)> + '_ { self.cells.iter().copied() }

    pub fn clear(&mut self) {
        self.full = false;
        self.cells.clear();
    }
}

/// One cell of a `write` event before it is placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireCell {
    pub grapheme: String,
    pub style_id: Option<u64>,
    pub repeat: u32,
    pub width: u8,
}

impl WireCell {
    /// Stands in for a cell that failed to parse so the ones after it keep
    /// their columns.
    pub fn blank() -> WireCell {
        WireCell { grapheme: " ".to_string(), style_id: None, repeat: 1, width: 1 }
    }

    /// Map `{grapheme, style_id?, repeat?, width?}`, the same fields as a
    /// positional array, or a bare string.
    pub fn from_value(v: &Value) -> Option<WireCell> {
        let mut cell = WireCell { grapheme: String::new(), style_id: None, repeat: 1, width: 1 };
        match v {
            Value::String(s) => cell.grapheme = s.as_str()?.to_string(),
            Value::Map(entries) => {
                let mut has_grapheme = false;
                for (k, val) in entries {
                    match k.as_str() {
                        Some("grapheme") | Some("text") => {
                            cell.grapheme = val.as_str()?.to_string();
                            has_grapheme = true;
                        }
                        Some("style_id") | Some("style") => cell.style_id = val.as_u64(),
                        Some("repeat") => cell.repeat = u32::try_from(val.as_u64()?).ok()?,
                        Some("width") => cell.width = u8::try_from(val.as_u64()?).ok()?,
                        _ => {}
                    }
                }
                if !has_grapheme { return None; }
            }
            Value::Array(items) => {
                cell.grapheme = items.first()?.as_str()?.to_string();
                cell.style_id = items.get(1).and_then(Value::as_u64);
                if let Some(r) = items.get(2).filter(|r| !r.is_nil()) { cell.repeat = u32::try_from(r.as_u64()?).ok()?; }
                if let Some(w) = items.get(3).filter(|w| !w.is_nil()) { cell.width = u8::try_from(w.as_u64()?).ok()?; }
            }
            _ => return None,
        }
        Some(cell)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RedrawEvent {
    Resize { rows: u16, cols: u16 },
    Write { row: u16, col: u16, cells: Vec<WireCell> },
    Style { id: u64, attrs: Attrs },
    CursorPos { row: u16, col: u16, visible: Option<bool> },
    CursorShape(CursorShape),
    Title(String),
    Selection(Option<Selection>),
    Flush,
}

fn u16_at(args: &[Value], i: usize) -> Option<u16> {
    args.get(i).and_then(Value::as_u64).and_then(|v| u16::try_from(v).ok())
}

impl RedrawEvent {
    /// Parse one `[name, arg...]` entry. Unknown names and malformed
    /// arguments give `None` and the entry is skipped.
    pub fn from_value(v: &Value) -> Option<RedrawEvent> {
        let items = v.as_array()?;
        let name = items.first()?.as_str()?;
        let args = &items[1..];
        let ev = match name {
            "resize" => {
                let (rows, cols) = (u16_at(args, 0)?, u16_at(args, 1)?);
                if rows > MAX_ROWS || cols > MAX_COLS {
                    log::warn!("refusing resize to {rows}x{cols}");
                    return None;
                }
                RedrawEvent::Resize { rows, cols }
            }
            "write" => {
                let cells = args.get(2)?.as_array()?.iter().map(|c| {
                    WireCell::from_value(c).unwrap_or_else(|| {
                        log::debug!("malformed cell {c}, written as blank");
                        WireCell::blank()
                    })
                }).collect();
                RedrawEvent::Write { row: u16_at(args, 0)?, col: u16_at(args, 1)?, cells }
            }
            "style" => RedrawEvent::Style {
                id: args.first()?.as_u64()?,
                attrs: Attrs::from_value(args.get(1).unwrap_or(&Value::Nil)),
            },
            "cursor_pos" => RedrawEvent::CursorPos {
                row: u16_at(args, 0)?,
                col: u16_at(args, 1)?,
                visible: args.get(2).and_then(Value::as_bool),
            },
            "cursor_shape" => RedrawEvent::CursorShape(CursorShape::parse(args.first()?.as_str()?)?),
            "title" => RedrawEvent::Title(args.first()?.as_str()?.to_string()),
            "selection" => {
                if args.first().map_or(true, Value::is_nil) {
                    RedrawEvent::Selection(None)
                } else {
                    RedrawEvent::Selection(Some(Selection {
                        start: (u16_at(args, 0)?, u16_at(args, 1)?),
                        end: (u16_at(args, 2)?, u16_at(args, 3)?),
                    }))
                }
            }
            "flush" => RedrawEvent::Flush,
            other => {
                log::trace!("ignoring redraw event '{other}'");
                return None;
            }
        };
        Some(ev)
    }
}

/// Split `redraw` params `[ptyId, [[name, args...], ...]]` into the target
/// pty and its events.
pub fn parse_redraw(params: &Value) -> Option<(PtyId, Vec<RedrawEvent>)> {
    let items = params.as_array()?;
    let pty = items.first()?.as_u64()?;
    let events = items.get(1)?.as_array()?.iter().filter_map(RedrawEvent::from_value).collect();
    Some((pty, events))
}

#[derive(Debug, Clone)]
pub struct RedrawEngine {
    grid: Grid,
    cursor: Cursor,
    selection: Option<Selection>,
    title: String,
    dirty: DirtySet,
    frame_ready: bool,
}

impl RedrawEngine {
    pub fn new(rows: u16, cols: u16) -> Self {
        let mut dirty = DirtySet::default();
        dirty.mark_all();
        RedrawEngine {
            grid: Grid::new(rows, cols),
            cursor: Cursor::default(),
            selection: None,
            title: String::new(),
            dirty,
            frame_ready: false,
        }
    }

    pub fn grid(&self) -> &Grid { &self.grid }
    pub fn cursor(&self) -> Cursor { self.cursor }
    pub fn selection(&self) -> Option<Selection> { self.selection }
    pub fn title(&self) -> &str { &self.title }
    pub fn dirty(&self) -> &DirtySet { &self.dirty }

    /// Called by the consumer after it has painted.
    pub fn clear_dirty(&mut self) { self.dirty.clear(); }

    /// Force the next paint to cover the whole pane.
    pub fn mark_all_dirty(&mut self) { self.dirty.mark_all(); }

    /// True once per flush.
    pub fn take_frame(&mut self) -> bool { std::mem::take(&mut self.frame_ready) }

    /// Apply a batch in order. Returns whether it contained a flush.
    pub fn apply_all(&mut self, events: Vec<RedrawEvent>, styles: &mut StyleTable) -> bool {
        let mut flushed = false;
        for ev in events {
            flushed |= matches!(ev, RedrawEvent::Flush);
            self.apply(ev, styles);
        }
        flushed
    }

    pub fn apply(&mut self, event: RedrawEvent, styles: &mut StyleTable) {
        match event {
            RedrawEvent::Resize { rows, cols } => self.resize(rows, cols),
            RedrawEvent::Write { row, col, cells } => self.write(row, col, &cells),
            RedrawEvent::Style { id, attrs } => styles.insert(id, attrs),
            RedrawEvent::CursorPos { row, col, visible } => {
                self.dirty.mark(self.cursor.row, self.cursor.col);
                self.cursor.row = row.min(self.grid.rows.saturating_sub(1));
                self.cursor.col = col.min(self.grid.cols.saturating_sub(1));
                if let Some(v) = visible { self.cursor.visible = v; }
                self.dirty.mark(self.cursor.row, self.cursor.col);
            }
            RedrawEvent::CursorShape(shape) => {
                self.cursor.shape = shape;
                self.dirty.mark(self.cursor.row, self.cursor.col);
            }
            RedrawEvent::Title(t) => self.title = t,
            RedrawEvent::Selection(sel) => {
                if sel != self.selection {
                    self.selection = sel;
                    self.dirty.mark_all();
                }
            }
            RedrawEvent::Flush => self.frame_ready = true,
        }
    }

    pub fn resize(&mut self, rows: u16, cols: u16) {
        if rows == self.grid.rows && cols == self.grid.cols { return; }
        self.grid = Grid::new(rows, cols);
        self.cursor.row = self.cursor.row.min(rows.saturating_sub(1));
        self.cursor.col = self.cursor.col.min(cols.saturating_sub(1));
        self.selection = None;
        self.dirty.mark_all();
    }

    /// Place cells left to right from (row, col). A cell without a style id
    /// takes the last explicit one seen earlier in the same call. Anything
    /// past the last column is dropped, including a wide cell that would
    /// straddle it.
    pub fn write(&mut self, row: u16, col: u16, cells: &[WireCell]) {
        if row >= self.grid.rows { return; }
        let cols = self.grid.cols as usize;
        let mut c = col as usize;
        let mut last_style = None;
        for cell in cells {
            if cell.style_id.is_some() { last_style = cell.style_id; }
            let width = if cell.width >= 2 { 2 } else { 1 };
            for _ in 0..cell.repeat {
                if c + width > cols { return; }
                self.grid.set(row, c as u16, &cell.grapheme, last_style);
                self.dirty.mark(row, c as u16);
                if width == 2 {
                    self.grid.set(row, c as u16 + 1, " ", last_style);
                    self.dirty.mark(row, c as u16 + 1);
                }
                c += width;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::style::Color;

    fn cell(g: &str) -> WireCell {
        WireCell { grapheme: g.into(), style_id: None, repeat: 1, width: 1 }
    }

    fn wide(g: &str) -> WireCell {
        WireCell { width: 2, ..cell(g) }
    }

    fn clean(rows: u16, cols: u16) -> RedrawEngine {
        let mut e = RedrawEngine::new(rows, cols);
        e.clear_dirty();
        e
    }

    fn map(pairs: Vec<(&str, Value)>) -> Value {
        Value::Map(pairs.into_iter().map(|(k, v)| (Value::from(k), v)).collect())
    }

    #[test]
    fn wide_cell_writes_continuation() {
        let mut e = clean(3, 10);
        e.write(1, 2, &[cell("A"), wide("B")]);
        let g = e.grid();
        assert_eq!(g.get(1, 2).unwrap().grapheme, "A");
        assert_eq!(g.get(1, 3).unwrap().grapheme, "B");
        assert_eq!(g.get(1, 4).unwrap().grapheme, " ");
        assert!(e.dirty().contains(1, 4));
        assert!(!e.dirty().contains(1, 5));
    }

    #[test]
    fn wide_cell_at_last_column_is_truncated() {
        let mut e = clean(3, 10);
        e.write(1, 9, &[wide("B")]);
        assert_eq!(e.grid().get(1, 9).unwrap().grapheme, " ");
        assert_eq!(e.grid().row_text(2), " ".repeat(10));
        assert!(e.dirty().is_empty());
    }

    #[test]
    fn long_write_truncates_instead_of_wrapping() {
        let mut e = clean(2, 4);
        e.write(0, 2, &[WireCell { repeat: 5, ..cell("x") }]);
        assert_eq!(e.grid().row_text(0), "  xx");
        assert_eq!(e.grid().row_text(1), "    ");
    }

    #[test]
    fn style_id_carries_within_one_write() {
        let mut e = clean(1, 10);
        let mut styled = cell("a");
        styled.style_id = Some(7);
        e.write(0, 0, &[cell("x"), styled, cell("b"), WireCell { repeat: 2, ..cell("c") }]);
        let styles: Vec<Option<u64>> = (0..5).map(|c| e.grid().get(0, c).unwrap().style).collect();
        assert_eq!(styles, vec![None, Some(7), Some(7), Some(7), Some(7)]);
        // A later call starts without a carried style.
        e.write(0, 0, &[cell("z")]);
        assert_eq!(e.grid().get(0, 0).unwrap().style, None);
    }

    #[test]
    fn resize_reallocates_only_on_change() {
        let mut e = clean(2, 2);
        e.write(0, 0, &[cell("q")]);
        e.clear_dirty();
        e.resize(2, 2);
        assert!(e.dirty().is_empty());
        assert_eq!(e.grid().get(0, 0).unwrap().grapheme, "q");
        e.resize(3, 5);
        assert!(e.dirty().is_full());
        assert_eq!(e.grid().row_text(0), "     ");
    }

    #[test]
    fn dirty_set_survives_until_consumer_clears() {
        let mut e = clean(2, 2);
        let mut styles = StyleTable::new();
        e.apply(RedrawEvent::Write { row: 0, col: 1, cells: vec![cell("k")] }, &mut styles);
        e.apply(RedrawEvent::Flush, &mut styles);
        assert!(e.take_frame());
        assert!(!e.take_frame());
        assert!(e.dirty().contains(0, 1));
        e.clear_dirty();
        assert!(e.dirty().is_empty());
    }

    #[test]
    fn parses_redraw_batch() {
        let params = Value::Array(vec![
            Value::from(12),
            Value::Array(vec![
                Value::Array(vec![Value::from("resize"), Value::from(5), Value::from(20)]),
                Value::Array(vec![Value::from("style"), Value::from(3), map(vec![("fg_index", Value::from(21)), ("bold", Value::Boolean(true))])]),
                Value::Array(vec![Value::from("write"), Value::from(1), Value::from(0), Value::Array(vec![
                    map(vec![("grapheme", Value::from("h")), ("style_id", Value::from(3))]),
                    Value::Array(vec![Value::from("i"), Value::Nil, Value::from(2)]),
                    map(vec![("grapheme", Value::from("界")), ("width", Value::from(2)), ("extra", Value::from(1))]),
                ])]),
                Value::Array(vec![Value::from("cursor_pos"), Value::from(1), Value::from(5), Value::Boolean(false)]),
                Value::Array(vec![Value::from("cursor_shape"), Value::from("beam")]),
                Value::Array(vec![Value::from("title"), Value::from("vim")]),
                Value::Array(vec![Value::from("bell")]),
                Value::Array(vec![Value::from("selection"), Value::from(0), Value::from(0), Value::from(1), Value::from(2)]),
                Value::Array(vec![Value::from("flush")]),
            ]),
        ]);
        let (pty, events) = parse_redraw(&params).unwrap();
        assert_eq!(pty, 12);
        assert_eq!(events.len(), 8);

        let mut e = RedrawEngine::new(1, 1);
        let mut styles = StyleTable::new();
        assert!(e.apply_all(events, &mut styles));
        assert_eq!(e.grid().row_text(1), "hii界 ".to_string() + &" ".repeat(15));
        assert_eq!(e.grid().get(1, 2).unwrap().style, Some(3));
        assert_eq!(styles.get(3).unwrap().fg, Color::Indexed(21));
        assert_eq!(e.cursor(), Cursor { row: 1, col: 5, visible: false, shape: CursorShape::Beam });
        assert_eq!(e.title(), "vim");
        assert!(e.selection().unwrap().contains(0, 19));
        assert!(!e.selection().unwrap().contains(1, 3));
    }

    #[test]
    fn selection_nil_clears() {
        let ev = RedrawEvent::from_value(&Value::Array(vec![Value::from("selection"), Value::Nil])).unwrap();
        assert_eq!(ev, RedrawEvent::Selection(None));
        assert!(RedrawEvent::from_value(&Value::Array(vec![Value::from("resize"), Value::from("x")])).is_none());
    }

    #[test]
    fn malformed_cell_keeps_its_column() {
        let write = Value::Array(vec![
            Value::from("write"), Value::from(0), Value::from(0),
            Value::Array(vec![
                Value::Array(vec![Value::from("a")]),
                map(vec![("grapheme", Value::from("b")), ("repeat", Value::from(-1))]),
                map(vec![("width", Value::from(300))]),
                Value::Array(vec![Value::from("c")]),
            ]),
        ]);
        let mut e = clean(1, 6);
        e.apply(RedrawEvent::from_value(&write).unwrap(), &mut StyleTable::new());
        assert_eq!(e.grid().row_text(0), "a  c  ");
        assert_eq!(e.grid().get(0, 3).unwrap().grapheme, "c");
    }

    #[test]
    fn oversized_resize_is_refused() {
        let resize = |r: u64, c: u64| RedrawEvent::from_value(&Value::Array(vec![Value::from("resize"), Value::from(r), Value::from(c)]));
        assert!(resize(65535, 65535).is_none());
        assert!(resize(u64::from(MAX_ROWS) + 1, 80).is_none());
        assert_eq!(resize(u64::from(MAX_ROWS), u64::from(MAX_COLS)), Some(RedrawEvent::Resize { rows: MAX_ROWS, cols: MAX_COLS }));
    }
}
