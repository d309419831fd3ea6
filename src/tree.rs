//! Persistent binary split tree.
//!
//! Nodes are immutable and shared through `Rc`: every edit rebuilds only the
//! path from the root down to the touched leaf and reuses all other subtrees.
//! There are no parent pointers; a node is reachable from exactly one parent.

use std::rc::Rc;

use ratatui::prelude::Rect;

use crate::types::{FocusDir, PaneId, PtyId, SplitDir};

pub const MIN_RATIO: f32 = 0.05;
pub const MAX_RATIO: f32 = 0.95;

#[derive(Debug, Clone, PartialEq)]
pub struct PaneNode {
    pub id: PaneId,
    /// Set once the spawn/attach round trip for this pane has completed.
    pub pty: Option<PtyId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayoutNode {
    Pane(PaneNode),
    Split {
        dir: SplitDir,
        /// Share of the area given to `first`, in (0, 1).
        ratio: f32,
        first: Rc<LayoutNode>,
        second: Rc<LayoutNode>,
    },
}

/// Result of removing a leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum Closed {
    NotFound,
    /// The removed pane was the whole tree.
    Empty,
    Collapsed(Rc<LayoutNode>),
}

pub fn leaf(id: PaneId) -> Rc<LayoutNode> {
    Rc::new(LayoutNode::Pane(PaneNode { id, pty: None }))
}

/// Pane ids in pre-order (first child before second).
pub fn pane_ids(node: &LayoutNode) -> Vec<PaneId> {
    fn rec(n: &LayoutNode, out: &mut Vec<PaneId>) {
        match n {
            LayoutNode::Pane(p) => out.push(p.id),
            LayoutNode::Split { first, second, .. } => { rec(first, out); rec(second, out); }
        }
    }
    let mut out = Vec::new();
    rec(node, &mut out);
    out
}

pub fn count_panes(node: &LayoutNode) -> usize {
    match node {
        LayoutNode::Pane(_) => 1,
        LayoutNode::Split { first, second, .. } => count_panes(first) + count_panes(second),
    }
}

pub fn find_pane(node: &LayoutNode, id: PaneId) -> Option<&PaneNode> {
    match node {
        LayoutNode::Pane(p) => (p.id == id).then_some(p),
        LayoutNode::Split { first, second, .. } => find_pane(first, id).or_else(|| find_pane(second, id)),
    }
}

pub fn contains(node: &LayoutNode, id: PaneId) -> bool {
    find_pane(node, id).is_some()
}

pub fn find_pane_by_pty(node: &LayoutNode, pty: PtyId) -> Option<PaneId> {
    match node {
        LayoutNode::Pane(p) => (p.pty == Some(pty)).then_some(p.id),
        LayoutNode::Split { first, second, .. } => {
            find_pane_by_pty(first, pty).or_else(|| find_pane_by_pty(second, pty))
        }
    }
}

/// Every pty id bound somewhere in the tree, pre-order.
pub fn pty_ids(node: &LayoutNode) -> Vec<PtyId> {
    fn rec(n: &LayoutNode, out: &mut Vec<PtyId>) {
        match n {
            LayoutNode::Pane(p) => out.extend(p.pty),
            LayoutNode::Split { first, second, .. } => { rec(first, out); rec(second, out); }
        }
    }
    let mut out = Vec::new();
    rec(node, &mut out);
    out
}

/// Rebuild the path to `id`, replacing the leaf with whatever `f` returns.
/// `None` when the pane is not in the tree.
fn replace_leaf(
    node: &Rc<LayoutNode>,
    id: PaneId,
    f: &mut dyn FnMut(&PaneNode) -> Rc<LayoutNode>,
) -> Option<Rc<LayoutNode>> {
    match node.as_ref() {
        LayoutNode::Pane(p) => (p.id == id).then(|| f(p)),
        LayoutNode::Split { dir, ratio, first, second } => {
            if let Some(nf) = replace_leaf(first, id, f) {
                return Some(Rc::new(LayoutNode::Split { dir: *dir, ratio: *ratio, first: nf, second: Rc::clone(second) }));
            }
            let ns = replace_leaf(second, id, f)?;
            Some(Rc::new(LayoutNode::Split { dir: *dir, ratio: *ratio, first: Rc::clone(first), second: ns }))
        }
    }
}

/// Replace leaf `id` with a half/half split holding the old leaf first and a
/// fresh unattached pane `new_id` second.
pub fn split_pane(root: &Rc<LayoutNode>, id: PaneId, dir: SplitDir, new_id: PaneId) -> Option<Rc<LayoutNode>> {
    replace_leaf(root, id, &mut |p| Rc::new(LayoutNode::Split {
        dir,
        ratio: 0.5,
        first: Rc::new(LayoutNode::Pane(p.clone())),
        second: leaf(new_id),
    }))
}

pub fn set_pty(root: &Rc<LayoutNode>, id: PaneId, pty: Option<PtyId>) -> Option<Rc<LayoutNode>> {
    replace_leaf(root, id, &mut |p| Rc::new(LayoutNode::Pane(PaneNode { id: p.id, pty })))
}

/// Remove leaf `id`; its parent split collapses into the surviving sibling.
pub fn close_pane(root: &Rc<LayoutNode>, id: PaneId) -> Closed {
    match root.as_ref() {
        LayoutNode::Pane(p) => if p.id == id { Closed::Empty } else { Closed::NotFound },
        LayoutNode::Split { dir, ratio, first, second } => {
            match close_pane(first, id) {
                Closed::Empty => return Closed::Collapsed(Rc::clone(second)),
                Closed::Collapsed(nf) => return Closed::Collapsed(Rc::new(LayoutNode::Split {
                    dir: *dir, ratio: *ratio, first: nf, second: Rc::clone(second),
                })),
                Closed::NotFound => {}
            }
            match close_pane(second, id) {
                Closed::Empty => Closed::Collapsed(Rc::clone(first)),
                Closed::Collapsed(ns) => Closed::Collapsed(Rc::new(LayoutNode::Split {
                    dir: *dir, ratio: *ratio, first: Rc::clone(first), second: ns,
                })),
                Closed::NotFound => Closed::NotFound,
            }
        }
    }
}

/// Cycle through panes in pre-order: right/down moves forward, left/up
/// backward, both wrapping. An unknown `current` yields the first pane.
pub fn focus_next(root: &LayoutNode, current: PaneId, dir: FocusDir) -> PaneId {
    let ids = pane_ids(root);
    let n = ids.len();
    let Some(pos) = ids.iter().position(|&p| p == current) else {
        return ids.first().copied().unwrap_or(current);
    };
    let next = if dir.is_forward() { (pos + 1) % n } else { (pos + n - 1) % n };
    ids[next]
}

/// Nudge the ratio of the split directly above `id` so the pane grows by
/// `delta` (negative shrinks).
pub fn resize_split(root: &Rc<LayoutNode>, id: PaneId, delta: f32) -> Option<Rc<LayoutNode>> {
    match root.as_ref() {
        LayoutNode::Pane(_) => None,
        LayoutNode::Split { dir, ratio, first, second } => {
            let rebuilt = |ratio: f32, first: Rc<LayoutNode>, second: Rc<LayoutNode>| {
                Some(Rc::new(LayoutNode::Split { dir: *dir, ratio: ratio.clamp(MIN_RATIO, MAX_RATIO), first, second }))
            };
            if matches!(first.as_ref(), LayoutNode::Pane(p) if p.id == id) {
                return rebuilt(ratio + delta, Rc::clone(first), Rc::clone(second));
            }
            if matches!(second.as_ref(), LayoutNode::Pane(p) if p.id == id) {
                return rebuilt(ratio - delta, Rc::clone(first), Rc::clone(second));
            }
            if let Some(nf) = resize_split(first, id, delta) {
                return rebuilt(*ratio, nf, Rc::clone(second));
            }
            let ns = resize_split(second, id, delta)?;
            rebuilt(*ratio, Rc::clone(first), ns)
        }
    }
}

/// Partition `area` between two children, reserving one row (vertical
/// split) or one column (horizontal split) for the divider.
pub fn split_area(dir: SplitDir, ratio: f32, area: Rect) -> (Rect, Rect) {
    match dir {
        SplitDir::Vertical => {
            let first_h = ((area.height as f32) * ratio).floor() as u16;
            let first_h = first_h.min(area.height);
            let second_h = area.height.saturating_sub(first_h).saturating_sub(1);
            (
                Rect::new(area.x, area.y, area.width, first_h),
                Rect::new(area.x, area.y.saturating_add(first_h).saturating_add(1), area.width, second_h),
            )
        }
        SplitDir::Horizontal => {
            let first_w = ((area.width as f32) * ratio).floor() as u16;
            let first_w = first_w.min(area.width);
            let second_w = area.width.saturating_sub(first_w).saturating_sub(1);
            (
                Rect::new(area.x, area.y, first_w, area.height),
                Rect::new(area.x.saturating_add(first_w).saturating_add(1), area.y, second_w, area.height),
            )
        }
    }
}

pub fn rect_for(root: &LayoutNode, id: PaneId, bounds: Rect) -> Option<Rect> {
    match root {
        LayoutNode::Pane(p) => (p.id == id).then_some(bounds),
        LayoutNode::Split { dir, ratio, first, second } => {
            let (a, b) = split_area(*dir, *ratio, bounds);
            rect_for(first, id, a).or_else(|| rect_for(second, id, b))
        }
    }
}

/// Every pane with its rectangle, pre-order.
pub fn compute_rects(root: &LayoutNode, bounds: Rect) -> Vec<(PaneId, Rect)> {
    fn rec(node: &LayoutNode, area: Rect, out: &mut Vec<(PaneId, Rect)>) {
        match node {
            LayoutNode::Pane(p) => out.push((p.id, area)),
            LayoutNode::Split { dir, ratio, first, second } => {
                let (a, b) = split_area(*dir, *ratio, area);
                rec(first, a, out);
                rec(second, b, out);
            }
        }
    }
    let mut out = Vec::new();
    rec(root, bounds, &mut out);
    out
}

/// Divider lines between split children: a one-row strip for vertical
/// splits, a one-column strip for horizontal ones.
pub fn compute_dividers(root: &LayoutNode, bounds: Rect) -> Vec<(SplitDir, Rect)> {
    fn rec(node: &LayoutNode, area: Rect, out: &mut Vec<(SplitDir, Rect)>) {
        if let LayoutNode::Split { dir, ratio, first, second } = node {
            let (a, b) = split_area(*dir, *ratio, area);
            let line = match dir {
                SplitDir::Vertical if a.height < area.height => Some(Rect::new(area.x, a.y + a.height, area.width, 1)),
                SplitDir::Horizontal if a.width < area.width => Some(Rect::new(a.x + a.width, area.y, 1, area.height)),
                _ => None,
            };
            out.extend(line.map(|l| (*dir, l)));
            rec(first, a, out);
            rec(second, b, out);
        }
    }
    let mut out = Vec::new();
    rec(root, bounds, &mut out);
    out
}

/// Content area inside a one-cell border. Bounds two cells wide or tall (or
/// less) have no room for content.
pub fn inner_rect(bounds: Rect) -> Option<Rect> {
    if bounds.width <= 2 || bounds.height <= 2 { return None; }
    Some(Rect::new(bounds.x + 1, bounds.y + 1, bounds.width - 2, bounds.height - 2))
}

/// Spatial pane navigation: find the best pane in the given direction.
/// Prefers panes that overlap on the perpendicular axis, then the smallest
/// gap along the primary axis, then the smallest perpendicular center offset.
pub fn find_best_pane_in_direction(rects: &[(PaneId, Rect)], ai: usize, dir: FocusDir) -> Option<usize> {
    let arect = rects.get(ai)?.1;
    // Centers scaled by 2 to stay in integers.
    let acx = arect.x as i32 * 2 + arect.width as i32;
    let acy = arect.y as i32 * 2 + arect.height as i32;

    let ranges_overlap = |a_start: u16, a_len: u16, b_start: u16, b_len: u16| -> bool {
        a_start < b_start + b_len && b_start < a_start + a_len
    };

    // (index, primary_gap, perp_center_dist, has_perp_overlap)
    let mut best: Option<(usize, u32, i32, bool)> = None;

    for (i, (_, r)) in rects.iter().enumerate() {
        if i == ai { continue; }
        let (primary_gap, perp_overlap) = match dir {
            FocusDir::Left => {
                if r.x + r.width > arect.x { continue; }
                ((arect.x - (r.x + r.width)) as u32, ranges_overlap(r.y, r.height, arect.y, arect.height))
            }
            FocusDir::Right => {
                if r.x < arect.x + arect.width { continue; }
                ((r.x - (arect.x + arect.width)) as u32, ranges_overlap(r.y, r.height, arect.y, arect.height))
            }
            FocusDir::Up => {
                if r.y + r.height > arect.y { continue; }
                ((arect.y - (r.y + r.height)) as u32, ranges_overlap(r.x, r.width, arect.x, arect.width))
            }
            FocusDir::Down => {
                if r.y < arect.y + arect.height { continue; }
                ((r.y - (arect.y + arect.height)) as u32, ranges_overlap(r.x, r.width, arect.x, arect.width))
            }
        };

        let rcx = r.x as i32 * 2 + r.width as i32;
        let rcy = r.y as i32 * 2 + r.height as i32;
        let perp_dist = match dir {
            FocusDir::Left | FocusDir::Right => (rcy - acy).abs(),
            FocusDir::Up | FocusDir::Down => (rcx - acx).abs(),
        };

        let dominated = match best {
            None => false,
            Some((_, bg, bd, bo)) => {
                if perp_overlap != bo { !perp_overlap }
                else if primary_gap != bg { primary_gap > bg }
                else { perp_dist >= bd }
            }
        };
        if !dominated {
            best = Some((i, primary_gap, perp_dist, perp_overlap));
        }
    }

    best.map(|(idx, _, _, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// 1 | (2 / 3)
    fn three_panes() -> Rc<LayoutNode> {
        let t = split_pane(&leaf(1), 1, SplitDir::Horizontal, 2).unwrap();
        split_pane(&t, 2, SplitDir::Vertical, 3).unwrap()
    }

    #[test]
    fn split_replaces_leaf_with_half_split() {
        let t = split_pane(&leaf(1), 1, SplitDir::Vertical, 2).unwrap();
        match t.as_ref() {
            LayoutNode::Split { dir, ratio, first, second } => {
                assert_eq!(*dir, SplitDir::Vertical);
                assert_eq!(*ratio, 0.5);
                assert_eq!(**first, LayoutNode::Pane(PaneNode { id: 1, pty: None }));
                assert_eq!(**second, LayoutNode::Pane(PaneNode { id: 2, pty: None }));
            }
            _ => panic!("expected split"),
        }
        assert!(split_pane(&t, 99, SplitDir::Vertical, 3).is_none());
    }

    #[test]
    fn untouched_subtrees_are_shared() {
        let t = three_panes();
        let t2 = set_pty(&t, 3, Some(30)).unwrap();
        let (LayoutNode::Split { first: a, .. }, LayoutNode::Split { first: b, .. }) = (t.as_ref(), t2.as_ref()) else {
            panic!("expected splits");
        };
        assert!(Rc::ptr_eq(a, b));
        assert_eq!(find_pane(&t2, 3).unwrap().pty, Some(30));
        assert_eq!(find_pane(&t, 3).unwrap().pty, None);
        assert_eq!(find_pane_by_pty(&t2, 30), Some(3));
        assert_eq!(pty_ids(&t2), vec![30]);
    }

    #[test]
    fn close_collapses_parent() {
        let t = three_panes();
        let Closed::Collapsed(t2) = close_pane(&t, 2) else { panic!("expected collapse") };
        assert_eq!(pane_ids(&t2), vec![1, 3]);
        let Closed::Collapsed(t3) = close_pane(&t2, 1) else { panic!("expected collapse") };
        assert_eq!(*t3, LayoutNode::Pane(PaneNode { id: 3, pty: None }));
        assert_eq!(close_pane(&t3, 3), Closed::Empty);
        assert_eq!(close_pane(&t3, 8), Closed::NotFound);
    }

    proptest! {
        #[test]
        fn pane_count_tracks_net_splits(ops in proptest::collection::vec((any::<prop::sample::Index>(), any::<bool>(), any::<bool>()), 1..120)) {
            let mut root = leaf(1);
            let mut next = 2;
            let mut net = 0i64;
            for (pick, split, vertical) in ops {
                let ids = pane_ids(&root);
                let target = ids[pick.index(ids.len())];
                if split || ids.len() == 1 {
                    let dir = if vertical { SplitDir::Vertical } else { SplitDir::Horizontal };
                    root = split_pane(&root, target, dir, next).unwrap();
                    next += 1;
                    net += 1;
                } else {
                    let Closed::Collapsed(r) = close_pane(&root, target) else { panic!("pane {target} did not collapse") };
                    root = r;
                    net -= 1;
                }
                prop_assert_eq!(count_panes(&root) as i64, 1 + net);
                prop_assert!(!contains(&root, next));
            }
        }
    }

    #[test]
    fn focus_cycles_in_preorder() {
        let t = three_panes();
        assert_eq!(focus_next(&t, 1, FocusDir::Right), 2);
        assert_eq!(focus_next(&t, 2, FocusDir::Down), 3);
        assert_eq!(focus_next(&t, 3, FocusDir::Right), 1);
        assert_eq!(focus_next(&t, 1, FocusDir::Left), 3);
        assert_eq!(focus_next(&t, 3, FocusDir::Up), 2);
        assert_eq!(focus_next(&t, 42, FocusDir::Up), 1);
    }

    #[test]
    fn vertical_split_reserves_one_divider_row() {
        let t = split_pane(&leaf(1), 1, SplitDir::Vertical, 2).unwrap();
        let bounds = Rect::new(0, 0, 80, 24);
        assert_eq!(rect_for(&t, 1, bounds), Some(Rect::new(0, 0, 80, 12)));
        assert_eq!(rect_for(&t, 2, bounds), Some(Rect::new(0, 13, 80, 11)));
        assert_eq!(rect_for(&t, 3, bounds), None);
        assert_eq!(compute_dividers(&t, bounds), vec![(SplitDir::Vertical, Rect::new(0, 12, 80, 1))]);
    }

    #[test]
    fn horizontal_split_reserves_one_divider_column() {
        let t = three_panes();
        let rects = compute_rects(&t, Rect::new(0, 0, 81, 25));
        assert_eq!(rects, vec![
            (1, Rect::new(0, 0, 40, 25)),
            (2, Rect::new(41, 0, 40, 12)),
            (3, Rect::new(41, 13, 40, 12)),
        ]);
    }

    #[test]
    fn inner_rect_needs_room_for_border() {
        assert_eq!(inner_rect(Rect::new(0, 0, 2, 10)), None);
        assert_eq!(inner_rect(Rect::new(0, 0, 10, 2)), None);
        assert_eq!(inner_rect(Rect::new(5, 5, 3, 3)), Some(Rect::new(6, 6, 1, 1)));
    }

    #[test]
    fn resize_split_clamps_ratio() {
        let t = split_pane(&leaf(1), 1, SplitDir::Horizontal, 2).unwrap();
        let grown = resize_split(&t, 1, 0.2).unwrap();
        assert!(matches!(grown.as_ref(), LayoutNode::Split { ratio, .. } if (*ratio - 0.7).abs() < 1e-6));
        // Growing the second child pushes the ratio down to the floor.
        let squeezed = resize_split(&t, 2, 0.9).unwrap();
        assert!(matches!(squeezed.as_ref(), LayoutNode::Split { ratio, .. } if *ratio == MIN_RATIO));
        assert!(resize_split(&leaf(1), 1, 0.1).is_none());
    }

    #[test]
    fn spatial_neighbours() {
        let t = three_panes();
        let rects = compute_rects(&t, Rect::new(0, 0, 81, 25));
        // From the bottom-right pane, left reaches pane 1 and up reaches pane 2.
        assert_eq!(find_best_pane_in_direction(&rects, 2, FocusDir::Left), Some(0));
        assert_eq!(find_best_pane_in_direction(&rects, 2, FocusDir::Up), Some(1));
        assert_eq!(find_best_pane_in_direction(&rects, 2, FocusDir::Down), None);
        assert_eq!(find_best_pane_in_direction(&rects, 0, FocusDir::Right), Some(1));
    }
}
