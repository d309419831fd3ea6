//! Prefix-key state machine and raw key encoding.
//!
//! Outside of prefix mode every key goes to the focused PTY as the bytes a
//! terminal would have produced for it. The prefix chord arms a one-shot
//! command table which disarms again after one key or after the timeout.

use std::time::Duration;

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use tokio::time::Instant;

use crate::config::{normalize_key_for_binding, KeyChord};
use crate::types::{Action, FocusDir, SplitDir};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherState {
    Idle,
    WaitingForCommand { deadline: Instant },
}

#[derive(Debug, Clone)]
pub struct PrefixMatcher {
    prefix: KeyChord,
    timeout: Duration,
    state: MatcherState,
}

impl PrefixMatcher {
    pub fn new(prefix: KeyChord, timeout: Duration) -> Self {
        Self { prefix: normalize_key_for_binding(prefix), timeout, state: MatcherState::Idle }
    }

    pub fn state(&self) -> MatcherState { self.state }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, MatcherState::WaitingForCommand { .. })
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            MatcherState::WaitingForCommand { deadline } => Some(deadline),
            MatcherState::Idle => None,
        }
    }

    /// Drop back to Idle once the deadline has passed. True if it did.
    pub fn tick(&mut self, now: Instant) -> bool {
        match self.state {
            MatcherState::WaitingForCommand { deadline } if now >= deadline => {
                log::debug!("prefix timed out");
                self.state = MatcherState::Idle;
                true
            }
            _ => false,
        }
    }

    pub fn handle(&mut self, key: KeyEvent, now: Instant) -> Action {
        self.tick(now);
        let chord = normalize_key_for_binding((key.code, key.modifiers));
        match self.state {
            MatcherState::Idle => {
                if chord == self.prefix {
                    self.state = MatcherState::WaitingForCommand { deadline: now + self.timeout };
                    return Action::Noop;
                }
                match encode_key(key.code, key.modifiers) {
                    Some(bytes) => Action::SendInput(bytes),
                    None => Action::Noop,
                }
            }
            MatcherState::WaitingForCommand { .. } => {
                self.state = MatcherState::Idle;
                if key.code == KeyCode::Esc { return Action::Noop; }
                if chord == self.prefix {
                    return match encode_key(self.prefix.0, self.prefix.1) {
                        Some(bytes) => Action::SendInput(bytes),
                        None => Action::Noop,
                    };
                }
                command_for(chord)
            }
        }
    }
}

fn command_for(chord: KeyChord) -> Action {
    match chord {
        (KeyCode::Left, KeyModifiers::NONE) => Action::Focus(FocusDir::Left),
        (KeyCode::Right, KeyModifiers::NONE) => Action::Focus(FocusDir::Right),
        (KeyCode::Up, KeyModifiers::NONE) => Action::Focus(FocusDir::Up),
        (KeyCode::Down, KeyModifiers::NONE) => Action::Focus(FocusDir::Down),
        (KeyCode::Char('%'), KeyModifiers::NONE) => Action::Split(SplitDir::Horizontal),
        (KeyCode::Char('"'), KeyModifiers::NONE) => Action::Split(SplitDir::Vertical),
        (KeyCode::Char('c'), KeyModifiers::NONE) => Action::NewTab,
        (KeyCode::Char('n'), KeyModifiers::NONE) => Action::NextTab,
        (KeyCode::Char('p'), KeyModifiers::NONE) => Action::PrevTab,
        (KeyCode::Char('x'), KeyModifiers::NONE) => Action::ClosePane,
        (KeyCode::Char('d'), KeyModifiers::NONE) => Action::Detach,
        _ => Action::Noop,
    }
}

/// xterm modifier parameter: 1 + shift + 2·alt + 4·ctrl.
fn modifier_param(mods: KeyModifiers) -> u8 {
    let mut m = 1;
    if mods.contains(KeyModifiers::SHIFT) { m += 1; }
    if mods.contains(KeyModifiers::ALT) { m += 2; }
    if mods.contains(KeyModifiers::CONTROL) { m += 4; }
    m
}

fn ctrl_byte(c: char) -> Option<u8> {
    match c {
        'a'..='z' => Some(c as u8 - b'a' + 1),
        'A'..='Z' => Some(c as u8 - b'A' + 1),
        ' ' | '@' | '2' => Some(0),
        '[' | '3' => Some(0x1b),
        '\\' | '4' => Some(0x1c),
        ']' | '5' => Some(0x1d),
        '^' | '6' => Some(0x1e),
        '_' | '7' | '/' => Some(0x1f),
        '?' | '8' => Some(0x7f),
        _ => None,
    }
}

/// Bytes a terminal sends for this key, or `None` when there is no
/// encoding for it.
pub fn encode_key(code: KeyCode, mods: KeyModifiers) -> Option<Vec<u8>> {
    let alt = mods.contains(KeyModifiers::ALT);
    let ctrl = mods.contains(KeyModifiers::CONTROL);
    let modified = mods.intersects(KeyModifiers::SHIFT | KeyModifiers::ALT | KeyModifiers::CONTROL);
    let esc_prefixed = |mut bytes: Vec<u8>| {
        if alt { bytes.insert(0, 0x1b); }
        bytes
    };

    let csi_letter = |letter: u8| {
        if modified {
            format!("\x1b[1;{}{}", modifier_param(mods), letter as char).into_bytes()
        } else {
            vec![0x1b, b'[', letter]
        }
    };
    let csi_tilde = |n: u8| {
        if modified {
            format!("\x1b[{};{}~", n, modifier_param(mods)).into_bytes()
        } else {
            format!("\x1b[{n}~").into_bytes()
        }
    };

    let bytes = match code {
        KeyCode::Char(c) if ctrl => esc_prefixed(vec![ctrl_byte(c)?]),
        KeyCode::Char(c) => {
            let mut buf = [0u8; 4];
            esc_prefixed(c.encode_utf8(&mut buf).as_bytes().to_vec())
        }
        KeyCode::Enter => esc_prefixed(b"\r".to_vec()),
        KeyCode::Tab if mods.contains(KeyModifiers::SHIFT) => b"\x1b[Z".to_vec(),
        KeyCode::Tab => esc_prefixed(b"\t".to_vec()),
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Backspace => esc_prefixed(vec![0x7f]),
        KeyCode::Esc => esc_prefixed(vec![0x1b]),
        KeyCode::Up => csi_letter(b'A'),
        KeyCode::Down => csi_letter(b'B'),
        KeyCode::Right => csi_letter(b'C'),
        KeyCode::Left => csi_letter(b'D'),
        KeyCode::Home => csi_letter(b'H'),
        KeyCode::End => csi_letter(b'F'),
        KeyCode::Insert => csi_tilde(2),
        KeyCode::Delete => csi_tilde(3),
        KeyCode::PageUp => csi_tilde(5),
        KeyCode::PageDown => csi_tilde(6),
        KeyCode::F(n @ 1..=4) => {
            let letter = b"PQRS"[(n - 1) as usize];
            if modified {
                format!("\x1b[1;{}{}", modifier_param(mods), letter as char).into_bytes()
            } else {
                vec![0x1b, b'O', letter]
            }
        }
        KeyCode::F(n @ 5..=12) => {
            const CODES: [u8; 8] = [15, 17, 18, 19, 20, 21, 23, 24];
            csi_tilde(CODES[(n - 5) as usize])
        }
        _ => return None,
    };
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn ctrl(c: char) -> KeyEvent {
        KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL)
    }

    fn matcher() -> PrefixMatcher {
        PrefixMatcher::new((KeyCode::Char('b'), KeyModifiers::CONTROL), Duration::from_millis(2000))
    }

    #[test]
    fn prefix_then_command() {
        let mut m = matcher();
        let t = Instant::now();
        assert_eq!(m.handle(ctrl('b'), t), Action::Noop);
        assert!(m.is_armed());
        assert_eq!(m.deadline(), Some(t + Duration::from_millis(2000)));
        assert_eq!(m.handle(key(KeyCode::Char('%')), t), Action::Split(SplitDir::Horizontal));
        assert_eq!(m.state(), MatcherState::Idle);

        m.handle(ctrl('b'), t);
        assert_eq!(m.handle(KeyEvent::new(KeyCode::Char('"'), KeyModifiers::SHIFT), t), Action::Split(SplitDir::Vertical));
        m.handle(ctrl('b'), t);
        assert_eq!(m.handle(key(KeyCode::Up), t), Action::Focus(FocusDir::Up));
        for (c, action) in [('c', Action::NewTab), ('n', Action::NextTab), ('p', Action::PrevTab), ('x', Action::ClosePane), ('d', Action::Detach)] {
            m.handle(ctrl('b'), t);
            assert_eq!(m.handle(key(KeyCode::Char(c)), t), action);
        }
    }

    #[test]
    fn prefix_twice_sends_prefix_byte() {
        let mut m = matcher();
        let t = Instant::now();
        m.handle(ctrl('b'), t);
        assert_eq!(m.handle(ctrl('b'), t), Action::SendInput(vec![0x02]));
        assert!(!m.is_armed());
    }

    #[test]
    fn escape_and_unknown_keys_disarm() {
        let mut m = matcher();
        let t = Instant::now();
        m.handle(ctrl('b'), t);
        assert_eq!(m.handle(key(KeyCode::Esc), t), Action::Noop);
        assert!(!m.is_armed());
        m.handle(ctrl('b'), t);
        assert_eq!(m.handle(key(KeyCode::Char('z')), t), Action::Noop);
        assert!(!m.is_armed());
        assert_eq!(m.handle(key(KeyCode::Char('z')), t), Action::SendInput(b"z".to_vec()));
    }

    #[test]
    fn timeout_returns_to_idle_and_keys_pass_through() {
        let mut m = matcher();
        let t = Instant::now();
        m.handle(ctrl('b'), t);
        assert!(!m.tick(t + Duration::from_millis(1999)));
        assert!(m.tick(t + Duration::from_millis(2100)));
        assert_eq!(m.state(), MatcherState::Idle);
        assert_eq!(m.handle(key(KeyCode::Left), t + Duration::from_millis(2100)), Action::SendInput(b"\x1b[D".to_vec()));
    }

    #[test]
    fn late_key_after_timeout_is_not_a_command() {
        let mut m = matcher();
        let t = Instant::now();
        m.handle(ctrl('b'), t);
        // No tick in between: handle() itself notices the expired deadline.
        assert_eq!(m.handle(key(KeyCode::Right), t + Duration::from_millis(2100)), Action::SendInput(b"\x1b[C".to_vec()));
    }

    #[test]
    fn encodes_plain_and_control_keys() {
        assert_eq!(encode_key(KeyCode::Char('a'), KeyModifiers::NONE), Some(b"a".to_vec()));
        assert_eq!(encode_key(KeyCode::Char('é'), KeyModifiers::NONE), Some("é".as_bytes().to_vec()));
        assert_eq!(encode_key(KeyCode::Char('c'), KeyModifiers::CONTROL), Some(vec![0x03]));
        assert_eq!(encode_key(KeyCode::Char(' '), KeyModifiers::CONTROL), Some(vec![0x00]));
        assert_eq!(encode_key(KeyCode::Char('x'), KeyModifiers::ALT), Some(b"\x1bx".to_vec()));
        assert_eq!(encode_key(KeyCode::Char('a'), KeyModifiers::CONTROL | KeyModifiers::ALT), Some(vec![0x1b, 0x01]));
        assert_eq!(encode_key(KeyCode::Char('é'), KeyModifiers::CONTROL), None);
        assert_eq!(encode_key(KeyCode::Enter, KeyModifiers::NONE), Some(b"\r".to_vec()));
        assert_eq!(encode_key(KeyCode::Tab, KeyModifiers::NONE), Some(b"\t".to_vec()));
        assert_eq!(encode_key(KeyCode::BackTab, KeyModifiers::SHIFT), Some(b"\x1b[Z".to_vec()));
        assert_eq!(encode_key(KeyCode::Backspace, KeyModifiers::NONE), Some(vec![0x7f]));
        assert_eq!(encode_key(KeyCode::Esc, KeyModifiers::NONE), Some(vec![0x1b]));
    }

    #[test]
    fn encodes_navigation_and_function_keys() {
        assert_eq!(encode_key(KeyCode::Up, KeyModifiers::NONE), Some(b"\x1b[A".to_vec()));
        assert_eq!(encode_key(KeyCode::Left, KeyModifiers::CONTROL), Some(b"\x1b[1;5D".to_vec()));
        assert_eq!(encode_key(KeyCode::Right, KeyModifiers::SHIFT | KeyModifiers::ALT), Some(b"\x1b[1;4C".to_vec()));
        assert_eq!(encode_key(KeyCode::Home, KeyModifiers::NONE), Some(b"\x1b[H".to_vec()));
        assert_eq!(encode_key(KeyCode::Delete, KeyModifiers::NONE), Some(b"\x1b[3~".to_vec()));
        assert_eq!(encode_key(KeyCode::PageUp, KeyModifiers::SHIFT), Some(b"\x1b[5;2~".to_vec()));
        assert_eq!(encode_key(KeyCode::F(1), KeyModifiers::NONE), Some(b"\x1bOP".to_vec()));
        assert_eq!(encode_key(KeyCode::F(2), KeyModifiers::CONTROL), Some(b"\x1b[1;5Q".to_vec()));
        assert_eq!(encode_key(KeyCode::F(5), KeyModifiers::NONE), Some(b"\x1b[15~".to_vec()));
        assert_eq!(encode_key(KeyCode::F(12), KeyModifiers::NONE), Some(b"\x1b[24~".to_vec()));
        assert_eq!(encode_key(KeyCode::F(13), KeyModifiers::NONE), None);
        assert_eq!(encode_key(KeyCode::CapsLock, KeyModifiers::NONE), None);
    }
}
