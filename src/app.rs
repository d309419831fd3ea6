//! The event loop.
//!
//! Socket reads, reconnect progress, RPC completions and terminal input all
//! arrive as `AppEvent`s on one unbounded queue, and only `App::handle_event`
//! touches layout, replicas and the style table. Async work runs as local
//! tasks that post their outcome back onto the queue.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use crossterm::event::{Event, KeyEventKind};
use ratatui::backend::Backend;
use ratatui::buffer::Buffer;
use ratatui::prelude::Rect;
use ratatui::Terminal;
use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::client::{Client, Roster, SpawnOptions};
use crate::config::Config;
use crate::connection::{Address, BoxedStream, ConnectionManager, Connector, ReconnectPolicy};
use crate::error::{ConnectError, ConnectionError, Error, RequestError};
use crate::input::PrefixMatcher;
use crate::layout::LayoutState;
use crate::protocol::Protocol;
use crate::redraw::{parse_redraw, RedrawEngine, RedrawEvent};
use crate::rendering::{paint_dividers, paint_pane, paint_placeholder, paint_status, StatusInfo};
use crate::session::SessionDirectory;
use crate::style::StyleTable;
use crate::tree;
use crate::types::{Action, LinkStatus, PaneId, PtyId};

const READ_CHUNK: usize = 64 * 1024;
const DETACH_TIMEOUT: Duration = Duration::from_secs(2);

pub enum AppEvent {
    Terminal(Event),
    TerminalClosed,
    Inbound { generation: u64, bytes: Vec<u8> },
    TransportClosed { generation: u64 },
    Redraw(Value),
    PtyClosed(Value),
    Roster(Result<Roster, RequestError>),
    PaneBound { pane: PaneId, pty: PtyId, rows: u16, cols: u16 },
    PaneFailed { pane: PaneId, error: RequestError },
    ReconnectAttempt(u32),
    Reconnected(BoxedStream),
    ReconnectFailed(ConnectionError),
    Detached,
}

/// Blocking crossterm reader on its own thread. Key and resize events cross
/// over on a plain channel; `App::forward_terminal` moves them onto the queue.
pub fn spawn_input_thread() -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || loop {
        match crossterm::event::read() {
            Ok(ev) => {
                if tx.send(ev).is_err() { break; }
            }
            Err(e) => {
                log::error!("terminal input failed: {e}");
                break;
            }
        }
    });
    rx
}

pub struct App<C: Connector> {
    config: Config,
    layout: LayoutState,
    engines: HashMap<PtyId, RedrawEngine>,
    /// Spawn and attach round trips still in flight.
    binding: usize,
    /// Redraws that overtook their pty's spawn reply, replayed once it binds.
    early: HashMap<PtyId, Vec<Vec<RedrawEvent>>>,
    /// Panes whose pty has exited.
    exited: HashSet<PaneId>,
    styles: StyleTable,
    sessions: SessionDirectory,
    matcher: PrefixMatcher,
    proto: Rc<RefCell<Protocol>>,
    client: Client,
    conn: ConnectionManager<C>,
    events: mpsc::UnboundedSender<AppEvent>,
    link: LinkStatus,
    /// Bumped for every transport so events from a replaced one are ignored.
    generation: u64,
    io_tasks: Vec<JoinHandle<()>>,
    size: Rect,
    shadow: Buffer,
    needs_full: bool,
    frame_pending: bool,
    status_changed: bool,
    quit: bool,
    fatal: Option<ConnectionError>,
}

impl<C: Connector> App<C> {
    pub fn new(config: Config, connector: C, address: Address, size: Rect) -> (Self, mpsc::UnboundedReceiver<AppEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        // No transport yet: requests queued before `start` fail on reset.
        let (sink, _) = mpsc::unbounded_channel();
        let proto = Rc::new(RefCell::new(Protocol::new(sink, config.request_timeout())));
        {
            let mut p = proto.borrow_mut();
            let tx = events.clone();
            p.on("redraw", move |params| { let _ = tx.send(AppEvent::Redraw(params)); });
            let tx = events.clone();
            p.on("pty_closed", move |params| { let _ = tx.send(AppEvent::PtyClosed(params)); });
        }
        let policy = ReconnectPolicy { max_attempts: config.reconnect_attempts, base_delay: config.reconnect_delay() };
        let matcher = PrefixMatcher::new(config.prefix_key, config.prefix_timeout());
        let app = App {
            client: Client::new(proto.clone()),
            proto,
            conn: ConnectionManager::new(connector, address, policy),
            layout: LayoutState::init(),
            engines: HashMap::new(),
            binding: 0,
            early: HashMap::new(),
            exited: HashSet::new(),
            styles: StyleTable::new(),
            sessions: SessionDirectory::new(),
            matcher,
            events,
            link: LinkStatus::Connected,
            generation: 0,
            io_tasks: Vec::new(),
            size,
            shadow: Buffer::empty(size),
            needs_full: true,
            frame_pending: true,
            status_changed: true,
            quit: false,
            fatal: None,
            config,
        };
        (app, rx)
    }

    pub fn layout(&self) -> &LayoutState { &self.layout }
    pub fn sessions(&self) -> &SessionDirectory { &self.sessions }
    pub fn link(&self) -> LinkStatus { self.link }
    pub fn engine(&self, pty: PtyId) -> Option<&RedrawEngine> { self.engines.get(&pty) }

    /// First connection. A failure here is reported to the caller as is;
    /// the reconnect policy only covers connections that were once up.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        let stream = self.conn.connect().await?;
        self.start(stream);
        Ok(())
    }

    /// Take over a connected transport and open the first pane.
    pub fn start(&mut self, stream: BoxedStream) {
        self.attach_transport(stream);
        self.refresh_roster();
        self.spawn_for(self.layout.focused_pane());
    }

    pub fn forward_terminal(&self, mut input: mpsc::UnboundedReceiver<Event>) {
        let tx = self.events.clone();
        tokio::task::spawn_local(async move {
            while let Some(ev) = input.recv().await {
                if tx.send(AppEvent::Terminal(ev)).is_err() { return; }
            }
            let _ = tx.send(AppEvent::TerminalClosed);
        });
    }

    pub async fn run<B: Backend>(
        &mut self,
        terminal: &mut Terminal<B>,
        events: &mut mpsc::UnboundedReceiver<AppEvent>,
    ) -> Result<(), Error> {
        self.draw(terminal)?;
        while !self.quit {
            let deadline = match (self.proto.borrow().next_deadline(), self.matcher.deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => self.handle_event(ev),
                    None => break,
                },
                _ = sleep_until(deadline) => {}
            }
            let now = Instant::now();
            self.proto.borrow_mut().expire(now);
            if self.matcher.tick(now) { self.status_changed = true; }
            // Drain a burst before painting so it lands in one frame.
            while !self.quit {
                match events.try_recv() {
                    Ok(ev) => self.handle_event(ev),
                    Err(_) => break,
                }
            }
            if !self.quit && (self.needs_full || self.frame_pending || self.status_changed) {
                self.draw(terminal)?;
            }
        }
        self.stop_io();
        match self.fatal.take() {
            Some(e) => Err(Error::Connection(e)),
            None => Ok(()),
        }
    }

    pub fn handle_event(&mut self, ev: AppEvent) {
        match ev {
            AppEvent::Terminal(Event::Key(key)) => {
                if !matches!(key.kind, KeyEventKind::Press | KeyEventKind::Repeat) { return; }
                let armed = self.matcher.is_armed();
                let action = self.matcher.handle(key, Instant::now());
                if armed != self.matcher.is_armed() { self.status_changed = true; }
                self.dispatch(action);
            }
            AppEvent::Terminal(Event::Paste(text)) => self.dispatch(Action::SendInput(text.into_bytes())),
            AppEvent::Terminal(Event::Resize(cols, rows)) => self.resize_terminal(cols, rows),
            AppEvent::Terminal(_) => {}
            AppEvent::TerminalClosed => self.quit = true,
            AppEvent::Inbound { generation, bytes } => {
                if generation == self.generation {
                    self.proto.borrow_mut().feed(&bytes);
                }
            }
            AppEvent::TransportClosed { generation } => {
                if generation == self.generation { self.on_transport_lost(); }
            }
            AppEvent::Redraw(params) => self.on_redraw(&params),
            AppEvent::PtyClosed(params) => self.on_pty_closed(&params),
            AppEvent::Roster(Ok(roster)) => {
                self.sessions.set_roster(roster);
                self.status_changed = true;
            }
            AppEvent::Roster(Err(e)) => log::warn!("roster fetch failed: {e}"),
            AppEvent::PaneBound { pane, pty, rows, cols } => self.on_pane_bound(pane, pty, rows, cols),
            AppEvent::PaneFailed { pane, error } => {
                log::warn!("pane {pane} has no pty: {error}");
                self.binding_done();
            }
            AppEvent::ReconnectAttempt(attempt) => {
                self.link = LinkStatus::Reconnecting { attempt, max: self.conn.policy().max_attempts };
                self.status_changed = true;
            }
            AppEvent::Reconnected(stream) => self.on_reconnected(stream),
            AppEvent::ReconnectFailed(e) => {
                self.conn.finish_reconnect(false);
                self.link = LinkStatus::Unreachable;
                log::error!("{e}");
                self.fatal = Some(e);
                self.quit = true;
            }
            AppEvent::Detached => self.quit = true,
        }
    }

    pub fn dispatch(&mut self, action: Action) {
        match action {
            Action::SendInput(bytes) => match self.layout.focused_pty() {
                Some(pty) => {
                    if let Err(e) = self.client.write_pty(pty, &bytes) { log::warn!("write_pty: {e}"); }
                }
                None => log::debug!("input dropped, focused pane has no pty yet"),
            },
            Action::Split(dir) => {
                let before = self.layout.focused_pane();
                let (state, pane) = self.layout.split_focused(dir);
                if pane == before { return; }
                self.set_layout(state);
                self.spawn_for(pane);
            }
            Action::NewTab => {
                let (state, pane) = self.layout.add_tab();
                self.set_layout(state);
                self.spawn_for(pane);
            }
            Action::NextTab => self.set_layout(self.layout.next_tab()),
            Action::PrevTab => self.set_layout(self.layout.prev_tab()),
            Action::Focus(dir) => self.set_layout(self.layout.focus_dir(dir, self.pane_area())),
            Action::ClosePane => match self.layout.close_focused() {
                Some(closed) => {
                    self.set_layout(closed.state);
                    if let Some(pty) = closed.pty {
                        self.engines.remove(&pty);
                        let client = self.client.clone();
                        self.spawn_rpc(async move {
                            if let Err(e) = client.close_pty(pty).await { log::warn!("close_pty {pty}: {e}"); }
                            None
                        });
                    }
                }
                None => log::debug!("not closing the last pane of the last tab"),
            },
            Action::Detach => self.detach(),
            Action::Noop => {}
        }
    }

    fn set_layout(&mut self, state: LayoutState) {
        if let Err(e) = state.validate() {
            log::error!("layout invariant broken: {e}");
        }
        self.exited.retain(|&pane| state.contains(pane));
        self.layout = state;
        self.needs_full = true;
        self.sync_sizes();
    }

    fn pane_area(&self) -> Rect {
        let mut area = self.size;
        if self.config.status_visible && area.height > 1 { area.height -= 1; }
        area
    }

    fn pane_size(&self, pane: PaneId) -> (u16, u16) {
        self.layout
            .rect_for(pane, self.pane_area())
            .map(|r| (r.height.max(1), r.width.max(1)))
            .unwrap_or((24, 80))
    }

    fn spawn_rpc<F>(&self, fut: F)
    where
        F: Future<Output = Option<AppEvent>> + 'static,
    {
        let tx = self.events.clone();
        tokio::task::spawn_local(async move {
            if let Some(ev) = fut.await { let _ = tx.send(ev); }
        });
    }

    fn spawn_for(&mut self, pane: PaneId) {
        let (rows, cols) = self.pane_size(pane);
        let opts = SpawnOptions {
            rows,
            cols,
            shell: self.config.default_shell.clone(),
            cwd: std::env::current_dir().ok().map(|p| p.to_string_lossy().into_owned()),
            attach: true,
            env: BTreeMap::new(),
            macos_option_as_alt: self.config.macos_option_as_alt,
        };
        let client = self.client.clone();
        self.binding += 1;
        self.spawn_rpc(async move {
            Some(match client.spawn_pty(&opts).await {
                Ok(pty) => AppEvent::PaneBound { pane, pty, rows, cols },
                Err(error) => AppEvent::PaneFailed { pane, error },
            })
        });
    }

    fn refresh_roster(&self) {
        let client = self.client.clone();
        self.spawn_rpc(async move { Some(AppEvent::Roster(client.fetch_roster().await)) });
    }

    fn binding_done(&mut self) {
        self.binding = self.binding.saturating_sub(1);
        if self.binding == 0 && !self.early.is_empty() {
            log::debug!("dropping held redraws for {} unbound ptys", self.early.len());
            self.early.clear();
        }
    }

    fn on_pane_bound(&mut self, pane: PaneId, pty: PtyId, rows: u16, cols: u16) {
        if !self.layout.contains(pane) {
            // Closed while the round trip was in flight.
            self.early.remove(&pty);
            self.binding_done();
            let client = self.client.clone();
            self.spawn_rpc(async move {
                if let Err(e) = client.close_pty(pty).await { log::warn!("close_pty {pty}: {e}"); }
                None
            });
            return;
        }
        log::debug!("pane {pane} bound to pty {pty} ({rows}x{cols})");
        self.layout = self.layout.set_pty(pane, Some(pty));
        self.exited.remove(&pane);
        self.engines.entry(pty).or_insert_with(|| RedrawEngine::new(rows, cols));
        for events in self.early.remove(&pty).unwrap_or_default() {
            self.apply_redraw(pty, events);
        }
        self.binding_done();
        self.needs_full = true;
        self.sync_sizes();
    }

    /// Bring every visible replica and its remote pty to the pane's size.
    fn sync_sizes(&mut self) {
        let area = self.pane_area();
        for (pane, rect) in self.layout.pane_rects(area) {
            let Some(pty) = self.layout.pty_of(pane) else { continue };
            let Some(engine) = self.engines.get_mut(&pty) else { continue };
            let (rows, cols) = (rect.height.max(1), rect.width.max(1));
            if engine.grid().rows() == rows && engine.grid().cols() == cols { continue; }
            engine.resize(rows, cols);
            let client = self.client.clone();
            self.spawn_rpc(async move {
                if let Err(e) = client.resize_pty(pty, rows, cols).await { log::warn!("resize_pty {pty}: {e}"); }
                None
            });
        }
    }

    fn resize_terminal(&mut self, cols: u16, rows: u16) {
        self.size = Rect::new(0, 0, cols, rows);
        self.shadow = Buffer::empty(self.size);
        self.needs_full = true;
        self.sync_sizes();
    }

    fn on_redraw(&mut self, params: &Value) {
        let Some((pty, events)) = parse_redraw(params) else {
            log::warn!("malformed redraw notification");
            return;
        };
        if self.engines.contains_key(&pty) {
            self.apply_redraw(pty, events);
        } else if self.binding > 0 {
            log::debug!("holding redraw for pty {pty} until its pane is bound");
            self.early.entry(pty).or_default().push(events);
        } else {
            log::debug!("redraw for pty {pty} without a replica, ignored");
        }
    }

    fn apply_redraw(&mut self, pty: PtyId, events: Vec<RedrawEvent>) {
        let Some(engine) = self.engines.get_mut(&pty) else { return };
        if engine.apply_all(events, &mut self.styles) {
            self.frame_pending = true;
        }
    }

    fn on_pty_closed(&mut self, params: &Value) {
        let pty = params.as_u64().or_else(|| params.as_array().and_then(|a| a.first()).and_then(Value::as_u64));
        let Some(pty) = pty else {
            log::warn!("malformed pty_closed notification");
            return;
        };
        log::info!("pty {pty} closed");
        if let Some(pane) = self.layout.pane_for_pty(pty) { self.exited.insert(pane); }
        self.engines.remove(&pty);
        self.layout = self.layout.clear_pty(pty);
        self.needs_full = true;
    }

    fn detach(&mut self) {
        if self.link != LinkStatus::Connected {
            self.quit = true;
            return;
        }
        let ptys = self.layout.all_ptys();
        let client = self.client.clone();
        self.spawn_rpc(async move {
            if !ptys.is_empty() {
                let request = async {
                    match ptys[..] {
                        [one] => client.detach_pty(one).await,
                        _ => client.detach_ptys(&ptys).await,
                    }
                };
                match tokio::time::timeout(DETACH_TIMEOUT, request).await {
                    Ok(Ok(())) => log::info!("detached {} ptys", ptys.len()),
                    Ok(Err(e)) => log::warn!("detach_ptys: {e}"),
                    Err(_) => log::warn!("detach_ptys did not answer in {DETACH_TIMEOUT:?}"),
                }
            }
            Some(AppEvent::Detached)
        });
    }

    fn stop_io(&mut self) {
        for task in self.io_tasks.drain(..) { task.abort(); }
    }

    /// Split a fresh transport into a reader and a writer task and point the
    /// protocol at the writer. Style ids are per connection, so the table
    /// starts over.
    fn attach_transport(&mut self, stream: BoxedStream) {
        self.stop_io();
        self.generation += 1;
        let generation = self.generation;
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (sink, mut outbound) = mpsc::unbounded_channel::<Vec<u8>>();
        self.proto.borrow_mut().reset(sink);
        self.styles.clear();
        self.early.clear();

        let tx = self.events.clone();
        self.io_tasks.push(tokio::task::spawn_local(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(AppEvent::Inbound { generation, bytes: buf[..n].to_vec() }).is_err() { return; }
                    }
                    Err(e) => {
                        log::warn!("transport read failed: {e}");
                        break;
                    }
                }
            }
            let _ = tx.send(AppEvent::TransportClosed { generation });
        }));

        let tx = self.events.clone();
        self.io_tasks.push(tokio::task::spawn_local(async move {
            while let Some(bytes) = outbound.recv().await {
                if let Err(e) = writer.write_all(&bytes).await {
                    log::warn!("transport write failed: {e}");
                    let _ = tx.send(AppEvent::TransportClosed { generation });
                    return;
                }
            }
        }));
    }

    fn on_transport_lost(&mut self) {
        self.stop_io();
        self.conn.on_lost();
        // Fail whatever is pending now instead of at its deadline.
        let (dead, _) = mpsc::unbounded_channel();
        self.proto.borrow_mut().reset(dead);
        self.generation += 1;
        let max = self.conn.policy().max_attempts;
        self.link = LinkStatus::Reconnecting { attempt: 0, max };
        self.status_changed = true;

        let progress_tx = self.events.clone();
        let fut = self.conn.begin_reconnect(move |n| { let _ = progress_tx.send(AppEvent::ReconnectAttempt(n)); });
        self.spawn_rpc(async move {
            Some(match fut.await {
                Ok(stream) => AppEvent::Reconnected(stream),
                Err(e) => AppEvent::ReconnectFailed(e),
            })
        });
    }

    /// The server keeps the ptys but not our view of them: attach and size
    /// every bound pane again, respawn panes whose spawn was lost. Replicas
    /// are recreated before `attach_pty` goes out so the frame that follows
    /// its reply has somewhere to land.
    fn on_reconnected(&mut self, stream: BoxedStream) {
        self.conn.finish_reconnect(true);
        self.link = LinkStatus::Connected;
        self.attach_transport(stream);
        self.engines.clear();
        self.needs_full = true;
        self.status_changed = true;
        let bounds = self.pane_area();
        for (pane, pty) in self.layout.all_panes() {
            let Some(pty) = pty else {
                self.spawn_for(pane);
                continue;
            };
            let (rows, cols) = self.layout
                .rect_for(pane, bounds)
                .map(|r| (r.height.max(1), r.width.max(1)))
                .unwrap_or((24, 80));
            self.engines.insert(pty, RedrawEngine::new(rows, cols));
            let client = self.client.clone();
            let alt = self.config.macos_option_as_alt;
            self.binding += 1;
            self.spawn_rpc(async move {
                if let Err(error) = client.attach_pty(pty, alt).await {
                    return Some(AppEvent::PaneFailed { pane, error });
                }
                if let Err(e) = client.resize_pty(pty, rows, cols).await { log::warn!("resize_pty {pty}: {e}"); }
                Some(AppEvent::PaneBound { pane, pty, rows, cols })
            });
        }
        self.refresh_roster();
    }

    fn status_info(&self) -> StatusInfo {
        let tabs = self.layout.tabs().iter().map(|t| {
            let title = tree::find_pane(&t.root, t.focused)
                .and_then(|p| p.pty)
                .and_then(|pty| self.engines.get(&pty))
                .map(|e| e.title().to_string())
                .unwrap_or_default();
            (t.id, title)
        }).collect();
        StatusInfo {
            tabs,
            active_tab: self.layout.active_tab_id(),
            link: self.link,
            prefix_armed: self.matcher.is_armed(),
            sessions: self.sessions.len(),
        }
    }

    /// Paint into the shadow buffer and hand it to the terminal. Replicas
    /// that have not flushed since their last paint keep their dirty cells.
    pub fn draw<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> io::Result<()> {
        let full = std::mem::take(&mut self.needs_full);
        if full { self.shadow.reset(); }
        let area = self.pane_area();
        let tab = self.layout.active_tab();
        let rects = tree::compute_rects(&tab.root, area);
        let mut focused_rect = None;
        for (pane, rect) in rects {
            let focused = pane == tab.focused;
            if focused { focused_rect = Some(rect); }
            let engine = tree::find_pane(&tab.root, pane)
                .and_then(|p| p.pty)
                .and_then(|pty| self.engines.get_mut(&pty));
            match engine {
                Some(engine) => {
                    if engine.take_frame() || full {
                        paint_pane(&mut self.shadow, engine, &self.styles, rect, focused, full);
                        engine.clear_dirty();
                    }
                }
                None if full => {
                    let note = if self.exited.contains(&pane) { "[exited]" } else { "starting..." };
                    paint_placeholder(&mut self.shadow, rect, note);
                }
                None => {}
            }
        }
        if full {
            paint_dividers(&mut self.shadow, &tree::compute_dividers(&tab.root, area), focused_rect);
        }
        if self.config.status_visible && self.size.height > 1 {
            let info = self.status_info();
            let line = Rect::new(0, self.size.height - 1, self.size.width, 1);
            paint_status(&mut self.shadow, line, &info);
        }
        self.frame_pending = false;
        self.status_changed = false;
        let shadow = &self.shadow;
        terminal.draw(|f| f.buffer_mut().merge(shadow))?;
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
