//! Tabs of split trees.
//!
//! `LayoutState` is a value: every operation returns a new state and leaves
//! the receiver untouched, sharing unmodified subtrees through `Rc`. An
//! operation naming a pane or tab that does not exist returns the state
//! unchanged (or `None`) instead of failing.

use std::collections::HashSet;
use std::rc::Rc;

use ratatui::prelude::Rect;
use serde::Serialize;

use crate::error::LayoutInvariantViolation;
use crate::tree::{self, Closed, LayoutNode};
use crate::types::{FocusDir, PaneId, PtyId, SplitDir, TabId};

#[derive(Debug, Clone, PartialEq)]
pub struct Tab {
    pub id: TabId,
    pub root: Rc<LayoutNode>,
    pub focused: PaneId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutState {
    tabs: Vec<Tab>,
    active: TabId,
    next_pane: PaneId,
    next_tab: TabId,
}

/// A pane removed by `close_pane` / `close_focused`.
#[derive(Debug, Clone, PartialEq)]
pub struct PaneClosed {
    pub state: LayoutState,
    pub pane: PaneId,
    pub pty: Option<PtyId>,
    /// The pane was the last one in its tab, so the tab went with it.
    pub tab_closed: Option<TabId>,
}

impl Default for LayoutState {
    fn default() -> Self { Self::init() }
}

impl LayoutState {
    /// One tab holding one unattached pane.
    pub fn init() -> LayoutState {
        LayoutState {
            tabs: vec![Tab { id: 1, root: tree::leaf(1), focused: 1 }],
            active: 1,
            next_pane: 2,
            next_tab: 2,
        }
    }

    pub fn tabs(&self) -> &[Tab] { &self.tabs }
    pub fn active_tab_id(&self) -> TabId { self.active }

    fn active_index(&self) -> usize {
        self.tabs.iter().position(|t| t.id == self.active).unwrap_or(0)
    }

    pub fn active_tab(&self) -> &Tab {
        &self.tabs[self.active_index()]
    }

    pub fn focused_pane(&self) -> PaneId { self.active_tab().focused }

    pub fn focused_pty(&self) -> Option<PtyId> {
        let tab = self.active_tab();
        tree::find_pane(&tab.root, tab.focused).and_then(|p| p.pty)
    }

    fn tab_of(&self, pane: PaneId) -> Option<usize> {
        self.tabs.iter().position(|t| tree::contains(&t.root, pane))
    }

    pub fn contains(&self, pane: PaneId) -> bool { self.tab_of(pane).is_some() }

    /// Every pane across all tabs with its pty, in tab then tree order.
    pub fn all_panes(&self) -> Vec<(PaneId, Option<PtyId>)> {
        self.tabs.iter()
            .flat_map(|t| tree::pane_ids(&t.root).into_iter().map(move |id| (id, tree::find_pane(&t.root, id).and_then(|p| p.pty))))
            .collect()
    }

    pub fn pty_of(&self, pane: PaneId) -> Option<PtyId> {
        self.tabs.iter().find_map(|t| tree::find_pane(&t.root, pane)).and_then(|p| p.pty)
    }

    pub fn pane_for_pty(&self, pty: PtyId) -> Option<PaneId> {
        self.tabs.iter().find_map(|t| tree::find_pane_by_pty(&t.root, pty))
    }

    /// Every bound pty across all tabs.
    pub fn all_ptys(&self) -> Vec<PtyId> {
        self.tabs.iter().flat_map(|t| tree::pty_ids(&t.root)).collect()
    }

    pub fn pane_rects(&self, bounds: Rect) -> Vec<(PaneId, Rect)> {
        tree::compute_rects(&self.active_tab().root, bounds)
    }

    pub fn rect_for(&self, pane: PaneId, bounds: Rect) -> Option<Rect> {
        let i = self.tab_of(pane)?;
        tree::rect_for(&self.tabs[i].root, pane, bounds)
    }

    /// New single-pane tab, activated. Returns the new pane's id too.
    pub fn add_tab(&self) -> (LayoutState, PaneId) {
        let mut next = self.clone();
        let pane = next.next_pane;
        let id = next.next_tab;
        next.next_pane += 1;
        next.next_tab += 1;
        next.tabs.push(Tab { id, root: tree::leaf(pane), focused: pane });
        next.active = id;
        (next, pane)
    }

    /// Refused (`None`) for the only tab or an unknown id. Closing the active
    /// tab activates the one before it, or the one after when it was first.
    pub fn close_tab(&self, tab: TabId) -> Option<LayoutState> {
        if self.tabs.len() <= 1 { return None; }
        let idx = self.tabs.iter().position(|t| t.id == tab)?;
        let mut next = self.clone();
        next.tabs.remove(idx);
        if self.active == tab {
            let new_idx = if idx == 0 { 0 } else { idx - 1 };
            next.active = next.tabs[new_idx].id;
        }
        Some(next)
    }

    pub fn select_tab(&self, tab: TabId) -> LayoutState {
        if !self.tabs.iter().any(|t| t.id == tab) { return self.clone(); }
        LayoutState { active: tab, ..self.clone() }
    }

    pub fn next_tab(&self) -> LayoutState {
        let i = (self.active_index() + 1) % self.tabs.len();
        self.select_tab(self.tabs[i].id)
    }

    pub fn prev_tab(&self) -> LayoutState {
        let n = self.tabs.len();
        let i = (self.active_index() + n - 1) % n;
        self.select_tab(self.tabs[i].id)
    }

    fn with_tab(&self, idx: usize, f: impl FnOnce(&Tab) -> Tab) -> LayoutState {
        let mut next = self.clone();
        next.tabs[idx] = f(&self.tabs[idx]);
        next
    }

    /// Split `pane` in whatever tab holds it; the new pane takes focus.
    pub fn split_pane(&self, pane: PaneId, dir: SplitDir) -> Option<(LayoutState, PaneId)> {
        let idx = self.tab_of(pane)?;
        let new_id = self.next_pane;
        let root = tree::split_pane(&self.tabs[idx].root, pane, dir, new_id)?;
        let mut next = self.with_tab(idx, |t| Tab { id: t.id, root, focused: new_id });
        next.next_pane += 1;
        Some((next, new_id))
    }

    pub fn split_focused(&self, dir: SplitDir) -> (LayoutState, PaneId) {
        let focused = self.focused_pane();
        match self.split_pane(focused, dir) {
            Some(r) => r,
            None => (self.clone(), focused),
        }
    }

    /// Remove `pane`. A tab left empty is closed as well; when that tab is the
    /// only one the whole close is refused and nothing changes.
    pub fn close_pane(&self, pane: PaneId) -> Option<PaneClosed> {
        let idx = self.tab_of(pane)?;
        let tab = &self.tabs[idx];
        let pty = tree::find_pane(&tab.root, pane).and_then(|p| p.pty);
        match tree::close_pane(&tab.root, pane) {
            Closed::NotFound => None,
            Closed::Empty => {
                let state = self.close_tab(tab.id)?;
                Some(PaneClosed { state, pane, pty, tab_closed: Some(tab.id) })
            }
            Closed::Collapsed(root) => {
                let focused = if tab.focused == pane {
                    // Whatever now sits at the closed pane's position in pre-order.
                    let pos = tree::pane_ids(&tab.root).iter().position(|&p| p == pane).unwrap_or(0);
                    let remaining = tree::pane_ids(&root);
                    let at = pos.min(remaining.len().saturating_sub(1));
                    remaining.get(at).copied().unwrap_or(tab.focused)
                } else {
                    tab.focused
                };
                let state = self.with_tab(idx, |t| Tab { id: t.id, root, focused });
                Some(PaneClosed { state, pane, pty, tab_closed: None })
            }
        }
    }

    pub fn close_focused(&self) -> Option<PaneClosed> {
        self.close_pane(self.focused_pane())
    }

    pub fn focus_pane(&self, pane: PaneId) -> LayoutState {
        let Some(idx) = self.tab_of(pane) else { return self.clone(); };
        let mut next = self.with_tab(idx, |t| Tab { focused: pane, ..t.clone() });
        next.active = next.tabs[idx].id;
        next
    }

    /// Move focus to the pane geometrically adjacent in `dir` within
    /// `bounds`; when nothing lies that way, cycle in tree order instead.
    pub fn focus_dir(&self, dir: FocusDir, bounds: Rect) -> LayoutState {
        let tab = self.active_tab();
        let rects = tree::compute_rects(&tab.root, bounds);
        let target = rects.iter().position(|(id, _)| *id == tab.focused)
            .and_then(|ai| tree::find_best_pane_in_direction(&rects, ai, dir))
            .map(|i| rects[i].0)
            .unwrap_or_else(|| tree::focus_next(&tab.root, tab.focused, dir));
        self.focus_pane(target)
    }

    /// Tree-order cycle only.
    pub fn focus_next(&self, dir: FocusDir) -> LayoutState {
        let tab = self.active_tab();
        self.focus_pane(tree::focus_next(&tab.root, tab.focused, dir))
    }

    pub fn set_pty(&self, pane: PaneId, pty: Option<PtyId>) -> LayoutState {
        let Some(idx) = self.tab_of(pane) else { return self.clone(); };
        match tree::set_pty(&self.tabs[idx].root, pane, pty) {
            Some(root) => self.with_tab(idx, |t| Tab { root, ..t.clone() }),
            None => self.clone(),
        }
    }

    /// Unbind `pty` from whichever pane holds it. The pane itself stays.
    pub fn clear_pty(&self, pty: PtyId) -> LayoutState {
        match self.pane_for_pty(pty) {
            Some(pane) => self.set_pty(pane, None),
            None => self.clone(),
        }
    }

    pub fn resize_focused(&self, delta: f32) -> LayoutState {
        let idx = self.active_index();
        let tab = &self.tabs[idx];
        match tree::resize_split(&tab.root, tab.focused, delta) {
            Some(root) => self.with_tab(idx, |t| Tab { root, ..t.clone() }),
            None => self.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), LayoutInvariantViolation> {
        if self.tabs.is_empty() { return Err(LayoutInvariantViolation::NoTabs); }
        if !self.tabs.iter().any(|t| t.id == self.active) {
            return Err(LayoutInvariantViolation::ActiveTabMissing(self.active));
        }
        let mut seen = HashSet::new();
        for tab in &self.tabs {
            if !tree::contains(&tab.root, tab.focused) {
                return Err(LayoutInvariantViolation::FocusMissing { tab: tab.id, pane: tab.focused });
            }
            for id in tree::pane_ids(&tab.root) {
                if !seen.insert(id) { return Err(LayoutInvariantViolation::DuplicatePane(id)); }
            }
            check_ratios(&tab.root, tab.id)?;
        }
        Ok(())
    }

    pub fn to_json(&self) -> String {
        let snapshot = LayoutJson {
            active_tab: self.active,
            tabs: self.tabs.iter().map(|t| TabJson { id: t.id, focused: t.focused, root: node_json(&t.root) }).collect(),
        };
        serde_json::to_string(&snapshot).unwrap_or_default()
    }
}

fn check_ratios(node: &LayoutNode, tab: TabId) -> Result<(), LayoutInvariantViolation> {
    if let LayoutNode::Split { ratio, first, second, .. } = node {
        if !(*ratio > 0.0 && *ratio < 1.0) {
            return Err(LayoutInvariantViolation::BadRatio { tab, ratio: *ratio });
        }
        check_ratios(first, tab)?;
        check_ratios(second, tab)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct LayoutJson {
    active_tab: TabId,
    tabs: Vec<TabJson>,
}

#[derive(Serialize)]
struct TabJson {
    id: TabId,
    focused: PaneId,
    root: NodeJson,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum NodeJson {
    #[serde(rename = "pane")]
    Pane { id: PaneId, pty: Option<PtyId> },
    #[serde(rename = "split")]
    Split { dir: SplitDir, ratio: f32, first: Box<NodeJson>, second: Box<NodeJson> },
}

fn node_json(node: &LayoutNode) -> NodeJson {
    match node {
        LayoutNode::Pane(p) => NodeJson::Pane { id: p.id, pty: p.pty },
        LayoutNode::Split { dir, ratio, first, second } => NodeJson::Split {
            dir: *dir,
            ratio: *ratio,
            first: Box::new(node_json(first)),
            second: Box::new(node_json(second)),
        },
    }
}
