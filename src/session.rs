//! Last known roster of remote sessions, with name filtering and a selection
//! cursor over the filtered view.

use crate::client::{Roster, RosterSource, SessionInfo};

#[derive(Debug, Clone)]
pub struct SessionDirectory {
    roster: Vec<SessionInfo>,
    source: RosterSource,
    filter: String,
    /// Index into the filtered view.
    selected: usize,
}

impl Default for SessionDirectory {
    fn default() -> Self {
        Self { roster: Vec::new(), source: RosterSource::Sessions, filter: String::new(), selected: 0 }
    }
}

impl SessionDirectory {
    pub fn new() -> Self { Self::default() }

    /// Replace the roster. The selection follows the previously selected
    /// session when it is still listed and is clamped otherwise.
    pub fn set_roster(&mut self, roster: Roster) {
        let keep = self.selected().map(|s| s.id);
        self.roster = roster.entries;
        self.source = roster.source;
        match keep.and_then(|id| self.filtered().iter().position(|s| s.id == id)) {
            Some(i) => self.selected = i,
            None => self.clamp(),
        }
    }

    pub fn source(&self) -> RosterSource { self.source }

    /// Case-insensitive substring match on the session name.
    pub fn set_filter(&mut self, filter: &str) {
        self.filter = filter.to_lowercase();
        self.clamp();
    }

    pub fn filter(&self) -> &str { &self.filter }

    pub fn filtered(&self) -> Vec<&SessionInfo> {
        self.roster.iter()
            .filter(|s| self.filter.is_empty() || s.name.to_lowercase().contains(&self.filter))
            .collect()
    }

    pub fn selected(&self) -> Option<&SessionInfo> {
        self.filtered().get(self.selected).copied()
    }

    pub fn selected_index(&self) -> usize { self.selected }

    pub fn select_next(&mut self) {
        let n = self.filtered().len();
        if n > 0 { self.selected = (self.selected + 1) % n; }
    }

    pub fn select_prev(&mut self) {
        let n = self.filtered().len();
        if n > 0 { self.selected = (self.selected + n - 1) % n; }
    }

    pub fn len(&self) -> usize { self.roster.len() }
    pub fn is_empty(&self) -> bool { self.roster.is_empty() }

    pub fn find(&self, id: u64) -> Option<&SessionInfo> {
        self.roster.iter().find(|s| s.id == id)
    }

    fn clamp(&mut self) {
        let n = self.filtered().len();
        self.selected = if n == 0 { 0 } else { self.selected.min(n - 1) };
    }
}
