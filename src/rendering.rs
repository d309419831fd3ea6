//! Turning replicas into painted cells.
//!
//! Painting goes through [`PaintSurface`], which only ever sees a position,
//! a glyph and resolved colors. The ratatui `Buffer` implementation is what
//! the running client uses; escape sequences are ratatui's concern.

use ratatui::buffer::Buffer;
use ratatui::prelude::Rect;
use ratatui::style::{Color, Modifier, Style};

use crate::redraw::{CursorShape, RedrawEngine};
use crate::style::{AttrFlags, ResolvedStyle, StyleTable, DEFAULT_BG};
use crate::tree::inner_rect;
use crate::types::{LinkStatus, Rgb, SplitDir, TabId};

pub trait PaintSurface {
    fn put(&mut self, x: u16, y: u16, glyph: &str, style: ResolvedStyle);
}

pub fn to_color(c: Rgb) -> Color {
    Color::Rgb(c.0, c.1, c.2)
}

pub fn to_modifier(flags: AttrFlags) -> Modifier {
    let mut m = Modifier::empty();
    if flags.contains(AttrFlags::BOLD) { m |= Modifier::BOLD; }
    if flags.contains(AttrFlags::DIM) { m |= Modifier::DIM; }
    if flags.contains(AttrFlags::ITALIC) { m |= Modifier::ITALIC; }
    if flags.contains(AttrFlags::UNDERLINE) { m |= Modifier::UNDERLINED; }
    if flags.contains(AttrFlags::BLINK) { m |= Modifier::SLOW_BLINK; }
    if flags.contains(AttrFlags::REVERSE) { m |= Modifier::REVERSED; }
    if flags.contains(AttrFlags::HIDDEN) { m |= Modifier::HIDDEN; }
    if flags.contains(AttrFlags::STRIKETHROUGH) { m |= Modifier::CROSSED_OUT; }
    m
}

impl PaintSurface for Buffer {
    fn put(&mut self, x: u16, y: u16, glyph: &str, style: ResolvedStyle) {
        let area = self.area;
        if x < area.x || y < area.y || x >= area.x + area.width || y >= area.y + area.height { return; }
        let idx = (y - area.y) as usize * area.width as usize + (x - area.x) as usize;
        if let Some(cell) = self.content.get_mut(idx) {
            cell.reset();
            cell.set_symbol(glyph);
            cell.set_style(Style::default()
                .fg(to_color(style.fg))
                .bg(to_color(style.bg))
                .add_modifier(to_modifier(style.flags)));
        }
    }
}

/// Cursor cell decoration: a block inverts, beam and underline shapes are
/// drawn as an underline.
pub fn cursor_style(base: ResolvedStyle, shape: CursorShape) -> ResolvedStyle {
    match shape {
        CursorShape::Block => base.inverted(),
        CursorShape::Beam | CursorShape::Underline => {
            ResolvedStyle { flags: base.flags | AttrFlags::UNDERLINE, ..base }
        }
    }
}

/// Paint one pane's replica into `area`. With `full` every cell is painted,
/// otherwise only the engine's dirty cells. The caller clears the dirty set
/// afterwards.
pub fn paint_pane<S: PaintSurface>(
    surface: &mut S,
    engine: &RedrawEngine,
    styles: &StyleTable,
    area: Rect,
    focused: bool,
    full: bool,
) {
    let full = full || engine.dirty().is_full();
    let grid = engine.grid();
    let cursor = engine.cursor();
    let selection = engine.selection();
    let rows = area.height.min(grid.rows());
    let cols = area.width.min(grid.cols());

    let mut paint = |row: u16, col: u16| {
        let Some(cell) = grid.get(row, col) else { return };
        let mut style = styles.resolve(cell.style);
        if selection.is_some_and(|s| s.contains(row, col)) {
            style = style.inverted();
        }
        if focused && cursor.visible && cursor.row == row && cursor.col == col {
            style = cursor_style(style, cursor.shape);
        }
        let glyph = if style.flags.contains(AttrFlags::HIDDEN) || cell.grapheme.is_empty() {
            " "
        } else {
            cell.grapheme.as_str()
        };
        surface.put(area.x + col, area.y + row, glyph, style);
    };

    if full {
        for row in 0..rows {
            for col in 0..cols { paint(row, col); }
        }
    } else {
        for (row, col) in engine.dirty().cells() {
            if row < rows && col < cols { paint(row, col); }
        }
    }

    if full {
        // Area larger than the replica (resize still in flight): blank the rest.
        let blank = ResolvedStyle::default();
        for y in 0..area.height {
            for x in 0..area.width {
                if y >= rows || x >= cols { surface.put(area.x + x, area.y + y, " ", blank); }
            }
        }
    }
}

/// Pane with no replica: a box with a short note inside.
pub fn paint_placeholder<S: PaintSurface>(surface: &mut S, area: Rect, note: &str) {
    let blank = ResolvedStyle::default();
    for y in area.y..area.y + area.height {
        for x in area.x..area.x + area.width {
            surface.put(x, y, " ", blank);
        }
    }
    let Some(inner) = inner_rect(area) else { return };
    let frame = ResolvedStyle { fg: Rgb(127, 127, 127), ..blank };
    let (l, r, t, b) = (area.x, area.x + area.width - 1, area.y, area.y + area.height - 1);
    for x in l + 1..r {
        surface.put(x, t, "─", frame);
        surface.put(x, b, "─", frame);
    }
    for y in t + 1..b {
        surface.put(l, y, "│", frame);
        surface.put(r, y, "│", frame);
    }
    surface.put(l, t, "┌", frame);
    surface.put(r, t, "┐", frame);
    surface.put(l, b, "└", frame);
    surface.put(r, b, "┘", frame);
    for (i, ch) in note.chars().take(inner.width as usize).enumerate() {
        let mut buf = [0u8; 4];
        surface.put(inner.x + i as u16, inner.y, ch.encode_utf8(&mut buf), blank);
    }
}

pub const ACTIVE_BORDER: Rgb = Rgb(0, 205, 0);
pub const BORDER: Rgb = Rgb(127, 127, 127);

/// Divider lines between panes. Segments touching the focused pane are
/// highlighted.
pub fn paint_dividers<S: PaintSurface>(surface: &mut S, dividers: &[(SplitDir, Rect)], focused: Option<Rect>) {
    let touches = |x: u16, y: u16| focused.is_some_and(|f| {
        let beside = (x + 1 == f.x || x == f.x + f.width) && y >= f.y && y < f.y + f.height;
        let above_below = (y + 1 == f.y || y == f.y + f.height) && x >= f.x && x < f.x + f.width;
        beside || above_below
    });
    for (dir, line) in dividers {
        let glyph = match dir { SplitDir::Horizontal => "│", SplitDir::Vertical => "─" };
        for y in line.y..line.y + line.height {
            for x in line.x..line.x + line.width {
                let fg = if touches(x, y) { ACTIVE_BORDER } else { BORDER };
                surface.put(x, y, glyph, ResolvedStyle { fg, bg: DEFAULT_BG, flags: AttrFlags::empty() });
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusInfo {
    pub tabs: Vec<(TabId, String)>,
    pub active_tab: TabId,
    pub link: LinkStatus,
    pub prefix_armed: bool,
    pub sessions: usize,
}

/// Text of the status bar; the active tab is marked with `*`.
pub fn status_line(info: &StatusInfo) -> String {
    let mut s = String::new();
    if info.prefix_armed { s.push_str("[^] "); }
    for (i, (id, title)) in info.tabs.iter().enumerate() {
        let mark = if *id == info.active_tab { "*" } else { "" };
        if title.is_empty() {
            s.push_str(&format!("{i}{mark} "));
        } else {
            s.push_str(&format!("{i}:{title}{mark} "));
        }
    }
    let link = match info.link {
        LinkStatus::Connected => "connected".to_string(),
        LinkStatus::Reconnecting { attempt, max } => format!("reconnecting {attempt}/{max}"),
        LinkStatus::Unreachable => "unreachable".to_string(),
    };
    s.push_str(&format!("| {} sessions | {link}", info.sessions));
    s
}

pub fn paint_status<S: PaintSurface>(surface: &mut S, area: Rect, info: &StatusInfo) {
    let bg = match info.link {
        LinkStatus::Connected => Rgb(0, 205, 0),
        LinkStatus::Reconnecting { .. } => Rgb(205, 205, 0),
        LinkStatus::Unreachable => Rgb(205, 0, 0),
    };
    let style = ResolvedStyle { fg: Rgb(0, 0, 0), bg, flags: AttrFlags::empty() };
    let text = status_line(info);
    let mut chars = text.chars();
    for x in 0..area.width {
        let mut buf = [0u8; 4];
        let glyph = match chars.next() { Some(c) => &*c.encode_utf8(&mut buf), None => " " };
        surface.put(area.x + x, area.y, glyph, style);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redraw::{RedrawEvent, WireCell};
    use crate::style::{Attrs, Color as StyleColor};
    use std::collections::HashMap;

    #[derive(Default)]
    struct Recorder {
        cells: HashMap<(u16, u16), (String, ResolvedStyle)>,
        puts: usize,
    }

    impl PaintSurface for Recorder {
        fn put(&mut self, x: u16, y: u16, glyph: &str, style: ResolvedStyle) {
            self.puts += 1;
            self.cells.insert((x, y), (glyph.to_string(), style));
        }
    }

    fn engine_with(text: &str, style_id: Option<u64>) -> RedrawEngine {
        let mut e = RedrawEngine::new(2, 4);
        let cells = text.chars().map(|c| WireCell { grapheme: c.to_string(), style_id, repeat: 1, width: 1 }).collect();
        e.apply(RedrawEvent::Write { row: 0, col: 0, cells }, &mut StyleTable::new());
        e
    }

    #[test]
    fn full_paint_offsets_into_area() {
        let e = engine_with("ab", None);
        let mut r = Recorder::default();
        paint_pane(&mut r, &e, &StyleTable::new(), Rect::new(10, 5, 4, 2), false, true);
        assert_eq!(r.cells[&(10, 5)].0, "a");
        assert_eq!(r.cells[&(11, 5)].0, "b");
        assert_eq!(r.cells.len(), 8);
    }

    #[test]
    fn dirty_paint_touches_only_dirty_cells() {
        let mut e = engine_with("ab", None);
        e.clear_dirty();
        e.apply(RedrawEvent::Write { row: 1, col: 3, cells: vec![WireCell { grapheme: "z".into(), style_id: None, repeat: 1, width: 1 }] }, &mut StyleTable::new());
        let mut r = Recorder::default();
        paint_pane(&mut r, &e, &StyleTable::new(), Rect::new(0, 0, 4, 2), false, false);
        assert_eq!(r.puts, 1);
        assert_eq!(r.cells[&(3, 1)].0, "z");
    }

    #[test]
    fn cursor_only_on_focused_pane() {
        let e = engine_with("ab", None);
        let area = Rect::new(0, 0, 4, 2);
        let mut r = Recorder::default();
        paint_pane(&mut r, &e, &StyleTable::new(), area, false, true);
        assert_eq!(r.cells[&(0, 0)].1, ResolvedStyle::default());
        paint_pane(&mut r, &e, &StyleTable::new(), area, true, true);
        assert_eq!(r.cells[&(0, 0)].1, ResolvedStyle::default().inverted());
    }

    #[test]
    fn beam_cursor_underlines() {
        let mut e = engine_with("ab", None);
        let mut styles = StyleTable::new();
        e.apply(RedrawEvent::CursorShape(CursorShape::Beam), &mut styles);
        e.apply(RedrawEvent::CursorPos { row: 0, col: 1, visible: Some(true) }, &mut styles);
        let mut r = Recorder::default();
        paint_pane(&mut r, &e, &styles, Rect::new(0, 0, 4, 2), true, true);
        assert!(r.cells[&(1, 0)].1.flags.contains(AttrFlags::UNDERLINE));
        assert_eq!(r.cells[&(0, 0)].1, ResolvedStyle::default());
    }

    #[test]
    fn selection_and_unknown_styles() {
        let mut e = engine_with("ab", Some(9));
        let mut styles = StyleTable::new();
        e.apply(RedrawEvent::CursorPos { row: 0, col: 0, visible: Some(false) }, &mut styles);
        e.apply(RedrawEvent::Selection(Some(crate::redraw::Selection { start: (0, 1), end: (0, 1) })), &mut styles);
        let mut r = Recorder::default();
        paint_pane(&mut r, &e, &styles, Rect::new(0, 0, 4, 2), true, true);
        // Style 9 was never defined: defaults.
        assert_eq!(r.cells[&(0, 0)].1, ResolvedStyle::default());
        assert_eq!(r.cells[&(1, 0)].1, ResolvedStyle::default().inverted());

        styles.insert(9, Attrs { fg: StyleColor::Indexed(21), ..Default::default() });
        paint_pane(&mut r, &e, &styles, Rect::new(0, 0, 4, 2), true, true);
        assert_eq!(r.cells[&(0, 0)].1.fg, Rgb(0, 0, 255));
    }

    #[test]
    fn buffer_surface_sets_cells() {
        let mut buf = Buffer::empty(Rect::new(0, 0, 3, 1));
        buf.put(1, 0, "x", ResolvedStyle { fg: Rgb(1, 2, 3), bg: Rgb(0, 0, 0), flags: AttrFlags::BOLD });
        buf.put(7, 7, "y", ResolvedStyle::default());
        let cell = &buf.content[1];
        assert_eq!(cell.symbol(), "x");
        assert_eq!(cell.fg, Color::Rgb(1, 2, 3));
        assert!(cell.modifier.contains(Modifier::BOLD));
    }

    #[test]
    fn placeholder_uses_inner_rect() {
        let mut r = Recorder::default();
        paint_placeholder(&mut r, Rect::new(0, 0, 10, 3), "spawning");
        assert_eq!(r.cells[&(0, 0)].0, "┌");
        assert_eq!(r.cells[&(1, 1)].0, "s");
        let mut tiny = Recorder::default();
        paint_placeholder(&mut tiny, Rect::new(0, 0, 2, 5), "x");
        assert!(tiny.cells.values().all(|(g, _)| g == " "));
    }

    #[test]
    fn status_text() {
        let info = StatusInfo {
            tabs: vec![(1, String::new()), (2, "vim".into())],
            active_tab: 2,
            link: LinkStatus::Reconnecting { attempt: 2, max: 5 },
            prefix_armed: true,
            sessions: 3,
        };
        assert_eq!(status_line(&info), "[^] 0 1:vim* | 3 sessions | reconnecting 2/5");
    }
}
