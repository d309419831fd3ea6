mod types;
mod error;
mod debug;
mod config;
mod protocol;
mod connection;
mod client;
mod session;
mod tree;
mod layout;
mod style;
mod redraw;
mod rendering;
mod input;
mod app;

use std::env;
use std::io;
use std::process::ExitCode;

use crossterm::execute;
use crossterm::event::{DisableBracketedPaste, EnableBracketedPaste};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::CrosstermBackend;
use ratatui::prelude::Rect;
use ratatui::Terminal;

use crate::app::App;
use crate::connection::{Address, SocketConnector};
use crate::error::Error;
use crate::types::VERSION;

fn print_usage() {
    println!("usage: remux [address]");
    println!();
    println!("  address   unix socket path, unix:<path>, host:port or tcp:host:port");
    println!("            (default: $REMUX_SOCKET or the 'socket' config option)");
    println!();
    println!("Log with REMUX_LOG=debug, written to $REMUX_LOG_FILE.");
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("-V") | Some("--version") => {
            println!("remux {VERSION}");
            return ExitCode::SUCCESS;
        }
        Some("-h") | Some("--help") => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        _ => {}
    }

    debug::init_logging();
    let config = config::load_config();
    let raw = args.get(1).cloned().unwrap_or_else(|| config.socket.clone());
    let address = match Address::parse(&raw) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("remux: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config, address) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("exiting: {e}");
            eprintln!("remux: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: config::Config, address: Address) -> Result<(), Error> {
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, async move {
        let (cols, rows) = crossterm::terminal::size()?;
        let (mut app, mut events) = App::new(config, SocketConnector, address, Rect::new(0, 0, cols, rows));
        // Connect before taking over the screen so a refusal prints plainly.
        app.connect().await?;

        let mut stdout = io::stdout();
        enable_raw_mode()?;
        execute!(stdout, EnterAlternateScreen, EnableBracketedPaste)?;
        let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        terminal.hide_cursor()?;
        terminal.clear()?;

        app.forward_terminal(app::spawn_input_thread());
        let result = app.run(&mut terminal, &mut events).await;

        let _ = disable_raw_mode();
        let out = terminal.backend_mut();
        // SGR state survives leaving the alternate screen.
        let _ = execute!(out, crossterm::style::Print("\x1b[0m"));
        let _ = execute!(out, DisableBracketedPaste, LeaveAlternateScreen);
        let _ = terminal.show_cursor();
        result
    })
}
