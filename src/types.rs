use serde::Serialize;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Client-local pane identifier, allocated by the layout engine.
pub type PaneId = u64;
/// Client-local tab identifier.
pub type TabId = u64;
/// Server-issued PTY identifier.
pub type PtyId = u64;

/// Split orientation.
///
/// `Horizontal` lays the two children side by side (a column split),
/// `Vertical` stacks them top over bottom (a row split), the same way
/// tmux names `split-window -h` / `-v`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitDir { Horizontal, Vertical }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusDir { Left, Right, Up, Down }

impl FocusDir {
    /// Right and down walk forward through pane order, left and up walk back.
    pub fn is_forward(self) -> bool {
        matches!(self, FocusDir::Right | FocusDir::Down)
    }
}

/// What a key press turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SendInput(Vec<u8>),
    Split(SplitDir),
    NewTab,
    NextTab,
    PrevTab,
    Focus(FocusDir),
    ClosePane,
    Detach,
    Noop,
}

/// A fully resolved 24-bit color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub fn from_u32(v: u32) -> Self {
        Rgb(((v >> 16) & 0xff) as u8, ((v >> 8) & 0xff) as u8, (v & 0xff) as u8)
    }
}

/// Connection status as shown in the status bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Reconnecting { attempt: u32, max: u32 },
    Unreachable,
}
