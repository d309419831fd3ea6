use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crossterm::event::{KeyCode, KeyModifiers};

/// A key plus its modifiers, compared after `normalize_key_for_binding`.
pub type KeyChord = (KeyCode, KeyModifiers);

#[derive(Debug, Clone)]
pub struct Config {
    pub prefix_key: KeyChord,
    pub prefix_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    /// Server address: a unix socket path, or `host:port` / `tcp:host:port`.
    pub socket: String,
    pub default_shell: Option<String>,
    pub macos_option_as_alt: bool,
    pub status_visible: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix_key: (KeyCode::Char('b'), KeyModifiers::CONTROL),
            prefix_timeout_ms: 2000,
            request_timeout_ms: 30_000,
            reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            socket: default_socket_path(),
            default_shell: None,
            macos_option_as_alt: false,
            status_visible: true,
        }
    }
}

impl Config {
    pub fn prefix_timeout(&self) -> Duration { Duration::from_millis(self.prefix_timeout_ms) }
    pub fn request_timeout(&self) -> Duration { Duration::from_millis(self.request_timeout_ms) }
    pub fn reconnect_delay(&self) -> Duration { Duration::from_millis(self.reconnect_delay_ms) }
}

fn default_socket_path() -> String {
    let dir = env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from).unwrap_or_else(env::temp_dir);
    dir.join("remux.sock").to_string_lossy().into_owned()
}

/// Read the first config file that exists, then apply environment overrides.
pub fn load_config() -> Config {
    let mut cfg = Config::default();
    let home = env::var("HOME").or_else(|_| env::var("USERPROFILE")).unwrap_or_default();
    let paths = [
        PathBuf::from(&home).join(".remux.conf"),
        PathBuf::from(&home).join(".config").join("remux").join("remux.conf"),
    ];
    for path in paths.iter() {
        if let Ok(content) = std::fs::read_to_string(path) {
            log::info!("loading config from {}", path.display());
            parse_config_content(&mut cfg, &content);
            break;
        }
    }
    if let Ok(sock) = env::var("REMUX_SOCKET") {
        if !sock.trim().is_empty() { cfg.socket = sock.trim().to_string(); }
    }
    if let Some(key) = env::var("REMUX_PREFIX").ok().and_then(|p| parse_key_name(&p)) {
        cfg.prefix_key = key;
    }
    cfg
}

pub fn parse_config_content(cfg: &mut Config, content: &str) {
    for line in content.lines() {
        parse_config_line(cfg, line);
    }
}

pub fn parse_config_line(cfg: &mut Config, line: &str) {
    let l = line.trim();
    if l.is_empty() || l.starts_with('#') { return; }
    let l = l.trim_end_matches('\\').trim();

    if l.starts_with("set-option ") || l.starts_with("set ") {
        parse_set_option(cfg, l);
    } else {
        log::debug!("ignoring config line: {l}");
    }
}

fn parse_set_option(cfg: &mut Config, line: &str) {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let mut i = 1;
    while i < parts.len() && parts[i].starts_with('-') { i += 1; }
    if i < parts.len() {
        let rest = parts[i..].join(" ");
        parse_option_value(cfg, &rest);
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "on" | "true" | "1" | "yes")
}

pub fn parse_option_value(cfg: &mut Config, rest: &str) {
    let parts: Vec<&str> = rest.splitn(2, ' ').collect();
    let key = parts[0].trim();
    let value = parts.get(1).map(|v| v.trim().trim_matches('"').trim_matches('\'')).unwrap_or("");

    match key {
        "prefix" => {
            match parse_key_name(value) {
                Some(k) => cfg.prefix_key = k,
                None => log::warn!("unrecognised prefix key '{value}'"),
            }
        }
        "prefix-timeout" => { if let Ok(ms) = value.parse() { cfg.prefix_timeout_ms = ms; } }
        "request-timeout" => { if let Ok(ms) = value.parse() { cfg.request_timeout_ms = ms; } }
        "reconnect-attempts" => { if let Ok(n) = value.parse() { cfg.reconnect_attempts = n; } }
        "reconnect-delay" => { if let Ok(ms) = value.parse() { cfg.reconnect_delay_ms = ms; } }
        "socket" => { if !value.is_empty() { cfg.socket = value.to_string(); } }
        "default-shell" | "default-command" => {
            cfg.default_shell = if value.is_empty() { None } else { Some(value.to_string()) };
        }
        "macos-option-as-alt" => cfg.macos_option_as_alt = parse_bool(value),
        "status" => cfg.status_visible = parse_bool(value),
        _ => log::debug!("unknown option '{key}'"),
    }
}

/// Shift is implied by the character itself, so it is dropped for chars.
pub fn normalize_key_for_binding(key: KeyChord) -> KeyChord {
    match key.0 {
        KeyCode::Char(_) => (key.0, key.1.difference(KeyModifiers::SHIFT)),
        _ => key,
    }
}

/// Parse tmux key names: `C-b`, `^b`, `M-a`, `C-M-x`, `Space`, `F5`, `Escape`...
pub fn parse_key_name(name: &str) -> Option<KeyChord> {
    let mut rest = name.trim();
    if rest.is_empty() { return None; }
    let mut mods = KeyModifiers::NONE;
    loop {
        if let Some(r) = rest.strip_prefix("C-") { mods |= KeyModifiers::CONTROL; rest = r; }
        else if let Some(r) = rest.strip_prefix("M-") { mods |= KeyModifiers::ALT; rest = r; }
        else if let Some(r) = rest.strip_prefix("S-") { mods |= KeyModifiers::SHIFT; rest = r; }
        else if rest.len() == 2 && rest.starts_with('^') { mods |= KeyModifiers::CONTROL; rest = &rest[1..]; }
        else { break; }
    }

    let mut chars = rest.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        let c = if mods.contains(KeyModifiers::CONTROL) { c.to_ascii_lowercase() } else { c };
        return Some(normalize_key_for_binding((KeyCode::Char(c), mods)));
    }

    let code = match rest.to_ascii_uppercase().as_str() {
        "ENTER" => KeyCode::Enter,
        "TAB" => KeyCode::Tab,
        "BTAB" => KeyCode::BackTab,
        "ESCAPE" | "ESC" => KeyCode::Esc,
        "SPACE" => KeyCode::Char(' '),
        "BSPACE" | "BACKSPACE" => KeyCode::Backspace,
        "UP" => KeyCode::Up,
        "DOWN" => KeyCode::Down,
        "LEFT" => KeyCode::Left,
        "RIGHT" => KeyCode::Right,
        "HOME" => KeyCode::Home,
        "END" => KeyCode::End,
        "PAGEUP" | "PPAGE" | "PGUP" => KeyCode::PageUp,
        "PAGEDOWN" | "NPAGE" | "PGDN" => KeyCode::PageDown,
        "INSERT" | "IC" => KeyCode::Insert,
        "DELETE" | "DC" => KeyCode::Delete,
        f if f.starts_with('F') => KeyCode::F(f[1..].parse::<u8>().ok().filter(|n| (1..=12).contains(n))?),
        _ => return None,
    };
    Some((code, mods))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.prefix_key, (KeyCode::Char('b'), KeyModifiers::CONTROL));
        assert_eq!(cfg.prefix_timeout(), Duration::from_millis(2000));
        assert_eq!(cfg.request_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.reconnect_attempts, 5);
        assert!(cfg.socket.ends_with("remux.sock"));
    }

    #[test]
    fn parses_set_lines() {
        let mut cfg = Config::default();
        parse_config_content(&mut cfg, r#"
# comment
set -g prefix C-a
set-option -g prefix-timeout 1500
set -g request-timeout 5000
set -g reconnect-attempts 3
set -g socket "/run/user/1000/mux.sock"
set -g default-shell /bin/zsh
set -g macos-option-as-alt on
set -g status off
bind-key x kill-pane
set -g no-such-option 1
"#);
        assert_eq!(cfg.prefix_key, (KeyCode::Char('a'), KeyModifiers::CONTROL));
        assert_eq!(cfg.prefix_timeout_ms, 1500);
        assert_eq!(cfg.request_timeout_ms, 5000);
        assert_eq!(cfg.reconnect_attempts, 3);
        assert_eq!(cfg.socket, "/run/user/1000/mux.sock");
        assert_eq!(cfg.default_shell.as_deref(), Some("/bin/zsh"));
        assert!(cfg.macos_option_as_alt);
        assert!(!cfg.status_visible);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let mut cfg = Config::default();
        parse_config_line(&mut cfg, "set -g prefix-timeout soon");
        parse_config_line(&mut cfg, "set -g prefix NotAKey");
        assert_eq!(cfg.prefix_timeout_ms, 2000);
        assert_eq!(cfg.prefix_key, (KeyCode::Char('b'), KeyModifiers::CONTROL));
    }

    #[test]
    fn key_names() {
        assert_eq!(parse_key_name("C-b"), Some((KeyCode::Char('b'), KeyModifiers::CONTROL)));
        assert_eq!(parse_key_name("^A"), Some((KeyCode::Char('a'), KeyModifiers::CONTROL)));
        assert_eq!(parse_key_name("M-x"), Some((KeyCode::Char('x'), KeyModifiers::ALT)));
        assert_eq!(parse_key_name("C-M-x"), Some((KeyCode::Char('x'), KeyModifiers::CONTROL | KeyModifiers::ALT)));
        assert_eq!(parse_key_name("C-Space"), Some((KeyCode::Char(' '), KeyModifiers::CONTROL)));
        assert_eq!(parse_key_name("F5"), Some((KeyCode::F(5), KeyModifiers::NONE)));
        assert_eq!(parse_key_name("F13"), None);
        assert_eq!(parse_key_name("Escape"), Some((KeyCode::Esc, KeyModifiers::NONE)));
        assert_eq!(parse_key_name("%"), Some((KeyCode::Char('%'), KeyModifiers::NONE)));
        assert_eq!(parse_key_name(""), None);
    }
}
