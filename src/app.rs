use std::collections::VecDeque;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use askama::Template;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::auth;
use crate::config::{self, UIConfig};
use crate::data::{
    InteractionService, MastodonInteractionService, MastodonStatusService,
    MastodonTimelineService, StatusService, TimelineService,
};
use crate::mastodon::{self, ApiError, Interaction, Status};
use crate::render::{self, Renderer};
use crate::route::Route;
use crate::session::Session;
use crate::storage;
use crate::thread::{Generation, Resolver, ThreadEvent, ViewGeneration};

const HOSTNAME_INPUT_PATTERN: &str = r"[a-z0-9.\-]+\.[a-z]+";

#[derive(Template)]
#[template(path = "pages/document.html")]
struct DocumentTemplate<'a> {
    header: &'a str,
    theme: Option<&'a str>,
    show_home: bool,
    show_login: bool,
    main: String,
}

#[derive(Template)]
#[template(path = "components/alert.html")]
struct AlertTemplate<'a> {
    message: &'a str,
}

#[derive(Template)]
#[template(path = "components/change_server.html")]
struct ChangeServerTemplate<'a> {
    pattern: &'a str,
}

struct ThemeOption<'a> {
    href: &'a str,
    selected: bool,
}

#[derive(Template)]
#[template(path = "components/settings.html")]
struct SettingsTemplate<'a> {
    themes: Vec<ThemeOption<'a>>,
    host: Option<String>,
}

pub struct Services {
    pub timeline: Arc<dyn TimelineService>,
    pub statuses: Arc<dyn StatusService>,
    pub interactions: Arc<dyn InteractionService>,
}

impl Services {
    pub fn mastodon(client: Arc<mastodon::Client>, limit: u32) -> Self {
        Self {
            timeline: Arc::new(MastodonTimelineService::new(client.clone(), limit)),
            statuses: Arc::new(MastodonStatusService::new(client.clone())),
            interactions: Arc::new(MastodonInteractionService::new(client)),
        }
    }
}

/// A server-side rejection of an optimistic toggle.
#[derive(Debug, Clone)]
struct Revert {
    generation: Generation,
    status_id: String,
    kind: Interaction,
    previous: bool,
}

enum Page {
    Blank,
    ChangeServer,
    Settings,
    Alert(String),
    Posts(Vec<Article>),
}

struct Article {
    status: Status,
    /// Rendered reply chain above the post, root first.
    ancestors: VecDeque<String>,
}

impl Article {
    fn new(status: Status) -> Self {
        Self {
            status,
            ancestors: VecDeque::new(),
        }
    }

    /// The post actually shown: the boosted one for boosts.
    fn shown(&self) -> &Status {
        self.status.reblog.as_deref().unwrap_or(&self.status)
    }

    fn shown_mut(&mut self) -> &mut Status {
        match self.status.reblog {
            Some(ref mut boosted) => &mut **boosted,
            None => &mut self.status,
        }
    }
}

struct View {
    route: Option<Route>,
    page: Page,
    pending: usize,
}

impl View {
    fn articles_mut(&mut self) -> &mut [Article] {
        match &mut self.page {
            Page::Posts(articles) => articles.as_mut_slice(),
            _ => &mut [],
        }
    }

    /// The timeline entry with this id. Boosts are keyed by the boost itself,
    /// so a post and a boost of it stay distinct.
    fn entry_mut(&mut self, entry_id: &str) -> Option<&mut Article> {
        self.articles_mut()
            .iter_mut()
            .find(|a| a.status.id == entry_id)
    }

    /// Every entry that shows the post `status_id`, directly or boosted.
    fn showing_mut<'a>(&'a mut self, status_id: &'a str) -> impl Iterator<Item = &'a mut Article> {
        self.articles_mut()
            .iter_mut()
            .filter(move |a| a.shown().id == status_id)
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct App {
    session: Arc<Session>,
    timeline: Arc<dyn TimelineService>,
    interactions: Arc<dyn InteractionService>,
    renderer: Renderer,
    resolver: Resolver,
    themes: Vec<String>,
    generations: Arc<ViewGeneration>,
    running: AtomicBool,
    thread_rx: Receiver<ThreadEvent>,
    revert_tx: Sender<Revert>,
    revert_rx: Receiver<Revert>,
    view: Mutex<View>,
}

impl App {
    pub fn new(session: Arc<Session>, services: Services, ui: &UIConfig) -> Self {
        Self::with_renderer(session, services, ui, Renderer::new())
    }

    pub fn with_renderer(
        session: Arc<Session>,
        services: Services,
        ui: &UIConfig,
        renderer: Renderer,
    ) -> Self {
        let generations = Arc::new(ViewGeneration::new());
        let (thread_tx, thread_rx) = unbounded();
        let (revert_tx, revert_rx) = unbounded();
        let resolver = Resolver::new(services.statuses, renderer, generations.clone(), thread_tx);
        Self {
            session,
            timeline: services.timeline,
            interactions: services.interactions,
            renderer,
            resolver,
            themes: ui.themes.clone(),
            generations,
            running: AtomicBool::new(false),
            thread_rx,
            revert_tx,
            revert_rx,
            view: Mutex::new(View {
                route: None,
                page: Page::Blank,
                pending: 0,
            }),
        }
    }

    pub fn route(&self) -> Option<Route> {
        self.view.lock().route.clone()
    }

    /// Load and render the view for `fragment`. Returns `false` when another
    /// navigation is still running and this one was skipped.
    pub fn navigate(&self, fragment: &str) -> bool {
        let Some(_running) = RunningGuard::acquire(&self.running) else {
            tracing::debug!(fragment, "navigation already running; skipped");
            return false;
        };

        let generation = self.generations.advance();
        let route = Route::parse(fragment);
        let page = match &route {
            Some(Route::Settings) => Page::Settings,
            _ if !self.session.has_hostname() => Page::ChangeServer,
            None => Page::Blank,
            Some(Route::ChangeServer) => Page::ChangeServer,
            Some(route) if route.requires_login() && !self.session.is_logged_in() => {
                Page::Alert("Log in to see your home timeline.".into())
            }
            Some(route) => match self.load(route) {
                Ok(statuses) => Page::Posts(statuses.into_iter().map(Article::new).collect()),
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "failed to load {}", route.fragment());
                    Page::Alert(alert_message(&err))
                }
            },
        };

        let mut view = self.view.lock();
        view.route = route;
        view.page = page;
        view.pending = 0;
        if let Page::Posts(articles) = &mut view.page {
            let mut spawned = 0;
            for article in articles.iter() {
                let anchor = article.status.id.clone();
                if self
                    .resolver
                    .spawn(generation, anchor, article.shown().clone())
                    .is_some()
                {
                    spawned += 1;
                }
            }
            view.pending = spawned;
        }
        true
    }

    fn load(&self, route: &Route) -> Result<Vec<Status>> {
        if let Some(timeline) = route.timeline() {
            return self.timeline.load_timeline(&timeline);
        }
        match route {
            Route::Account(id) => self.timeline.load_account(id),
            Route::AccountHandle(handle) => {
                let account = self.timeline.lookup_account(handle)?;
                self.timeline.load_account(&account.id)
            }
            other => Err(anyhow!("{} has no timeline", other.fragment())),
        }
    }

    /// Apply queued worker results. Returns whether the view changed.
    pub fn poll(&self) -> bool {
        let mut changed = false;
        while let Ok(event) = self.thread_rx.try_recv() {
            changed |= self.apply_thread_event(event);
        }
        while let Ok(revert) = self.revert_rx.try_recv() {
            changed |= self.apply_revert(revert);
        }
        changed
    }

    /// Block until every reply chain of the current view is resolved or
    /// `timeout` passes. Returns `true` when nothing is left pending.
    pub fn wait_for_threads(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll();
            if self.view.lock().pending == 0 {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            match self.thread_rx.recv_timeout(remaining) {
                Ok(event) => {
                    self.apply_thread_event(event);
                }
                Err(RecvTimeoutError::Timeout) => return self.view.lock().pending == 0,
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    fn apply_thread_event(&self, event: ThreadEvent) -> bool {
        if !self.generations.is_current(event.generation()) {
            tracing::trace!("dropping thread event from a previous view");
            return false;
        }
        let mut view = self.view.lock();
        match event {
            ThreadEvent::Ancestor {
                anchor, fragment, ..
            } => match view.entry_mut(&anchor) {
                Some(article) => {
                    article.ancestors.push_front(fragment.html);
                    true
                }
                None => false,
            },
            ThreadEvent::Finished { anchor, .. } => {
                tracing::trace!(%anchor, "reply chain resolved");
                view.pending = view.pending.saturating_sub(1);
                true
            }
        }
    }

    fn apply_revert(&self, revert: Revert) -> bool {
        if !self.generations.is_current(revert.generation) {
            return false;
        }
        let mut view = self.view.lock();
        let mut changed = false;
        for article in view.showing_mut(&revert.status_id) {
            article
                .shown_mut()
                .set_interaction(revert.kind, revert.previous);
            changed = true;
        }
        changed
    }

    pub fn toggle_favourite(&self, status_id: &str, enabled: bool) -> Result<thread::JoinHandle<()>> {
        self.toggle(status_id, Interaction::Favourite, enabled)
    }

    pub fn toggle_boost(&self, status_id: &str, enabled: bool) -> Result<thread::JoinHandle<()>> {
        self.toggle(status_id, Interaction::Reblog, enabled)
    }

    pub fn toggle_bookmark(&self, status_id: &str, enabled: bool) -> Result<thread::JoinHandle<()>> {
        self.toggle(status_id, Interaction::Bookmark, enabled)
    }

    /// Show the new state right away and send it to the server in the
    /// background; a rejection queues a revert for the next `poll`.
    fn toggle(
        &self,
        status_id: &str,
        kind: Interaction,
        enabled: bool,
    ) -> Result<thread::JoinHandle<()>> {
        if !self.session.is_logged_in() {
            bail!("log in to {} posts", kind.command(true));
        }
        let previous = {
            let mut view = self.view.lock();
            let mut previous = None;
            for article in view.showing_mut(status_id) {
                let status = article.shown_mut();
                previous.get_or_insert(status.interaction(kind));
                status.set_interaction(kind, enabled);
            }
            previous.ok_or_else(|| anyhow!("status {status_id} is not on this page"))?
        };

        let revert = Revert {
            generation: self.generations.current(),
            status_id: status_id.to_string(),
            kind,
            previous,
        };
        let service = self.interactions.clone();
        let tx = self.revert_tx.clone();
        Ok(thread::spawn(move || {
            if let Err(err) = service.set(&revert.status_id, kind, enabled) {
                tracing::warn!(
                    status = %revert.status_id,
                    action = kind.command(enabled),
                    error = %format!("{err:#}"),
                    "interaction rejected; reverting"
                );
                let _ = tx.send(revert);
            }
        }))
    }

    pub fn status(&self, status_id: &str) -> Option<Status> {
        self.view
            .lock()
            .showing_mut(status_id)
            .next()
            .map(|article| article.shown().clone())
    }

    /// Rendered ancestors currently attached above the timeline entry
    /// `entry_id`, root first.
    pub fn ancestors(&self, entry_id: &str) -> Option<Vec<String>> {
        self.view
            .lock()
            .entry_mut(entry_id)
            .map(|article| article.ancestors.iter().cloned().collect())
    }

    pub fn render_document(&self) -> String {
        let nav = self.session.nav();
        let theme = self
            .themes
            .get(self.session.css_index())
            .or_else(|| self.themes.first());
        render::render(&DocumentTemplate {
            header: &nav.header,
            theme: theme.map(String::as_str),
            show_home: nav.show_home,
            show_login: nav.show_login,
            main: self.render_main(),
        })
    }

    fn render_main(&self) -> String {
        let renderer = self.renderer.with_controls(self.session.is_logged_in());
        let view = self.view.lock();
        match &view.page {
            Page::Blank => String::new(),
            Page::Alert(message) => render::render(&AlertTemplate { message }),
            Page::ChangeServer => render::render(&ChangeServerTemplate {
                pattern: HOSTNAME_INPUT_PATTERN,
            }),
            Page::Settings => self.render_settings(),
            Page::Posts(articles) => articles
                .iter()
                .map(|article| {
                    let ancestors: Vec<String> = article.ancestors.iter().cloned().collect();
                    renderer.post(&article.status, &ancestors)
                })
                .collect(),
        }
    }

    fn render_settings(&self) -> String {
        let selected = self.session.css_index();
        render::render(&SettingsTemplate {
            themes: self
                .themes
                .iter()
                .enumerate()
                .map(|(index, href)| ThemeOption {
                    href,
                    selected: index == selected,
                })
                .collect(),
            host: self.session.hostname(),
        })
    }
}

fn alert_message(err: &anyhow::Error) -> String {
    match err.downcast_ref::<ApiError>() {
        Some(api) => api.to_string(),
        None => format!("{err:#}"),
    }
}

#[derive(Debug, Default, PartialEq)]
struct CliOptions {
    server: Option<String>,
    logout: bool,
    login: bool,
    theme: Option<usize>,
    output: Option<PathBuf>,
    config: Option<PathBuf>,
    state: Option<PathBuf>,
    route: Option<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliOptions> {
    let mut opts = CliOptions::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .ok_or_else(|| anyhow!("{name} requires a value"))
        };
        match arg.as_str() {
            "--server" => opts.server = Some(value("--server")?),
            "--logout" => opts.logout = true,
            "--login" => opts.login = true,
            "--theme" => {
                let raw = value("--theme")?;
                let index = raw
                    .parse()
                    .with_context(|| format!("invalid theme index {raw:?}"))?;
                opts.theme = Some(index);
            }
            "--output" | "-o" => opts.output = Some(PathBuf::from(value("--output")?)),
            "--config" => opts.config = Some(PathBuf::from(value("--config")?)),
            "--state" => opts.state = Some(PathBuf::from(value("--state")?)),
            flag if flag.starts_with('-') && flag.len() > 1 => bail!("unknown option {flag}"),
            route => {
                if opts.route.replace(route.to_string()).is_some() {
                    bail!("only one route may be given");
                }
            }
        }
    }
    Ok(opts)
}

pub fn run() -> Result<()> {
    run_with(std::env::args().skip(1))
}

pub fn run_with(args: impl IntoIterator<Item = String>) -> Result<()> {
    let opts = parse_args(args)?;
    let cfg = config::load(config::LoadOptions {
        config_file: opts.config.clone(),
        ..Default::default()
    })
    .context("load config")?;

    let store = Arc::new(
        storage::Store::open(storage::Options {
            path: opts.state.clone(),
        })
        .context("open storage")?,
    );
    let session = Arc::new(Session::load(store).context("load session")?);

    if opts.logout {
        session.remove_hostname().context("log out")?;
        tracing::info!("logged out and forgot server");
    }
    if let Some(server) = &opts.server {
        session.set_hostname(server)?;
    }
    if let Some(index) = opts.theme {
        if index >= cfg.ui.themes.len() {
            bail!(
                "theme {index} does not exist; {} themes are configured",
                cfg.ui.themes.len()
            );
        }
        session.set_css_index(index)?;
    }
    if opts.login {
        login(&session, &cfg)?;
    }

    let client = Arc::new(
        mastodon::Client::new(
            session.clone(),
            mastodon::ClientConfig {
                user_agent: cfg.server.user_agent.clone(),
                base_url: None,
                http_client: None,
                timeout: Some(cfg.http.timeout),
            },
        )
        .context("create mastodon client")?,
    );
    let app = App::new(
        session,
        Services::mastodon(client, cfg.ui.timeline_limit),
        &cfg.ui,
    );

    app.navigate(opts.route.as_deref().unwrap_or_default());
    if !app.wait_for_threads(cfg.ui.thread_wait) {
        tracing::warn!("reply chains still loading; writing partial threads");
    }

    let document = app.render_document();
    match &opts.output {
        Some(path) => fs::write(path, document)
            .with_context(|| format!("write {}", path.display()))?,
        None => io::stdout()
            .write_all(document.as_bytes())
            .context("write document")?,
    }
    Ok(())
}

fn login(session: &Arc<Session>, cfg: &config::Config) -> Result<()> {
    let flow = auth::Flow::new(session.clone(), cfg.server.clone(), cfg.http.timeout)?;
    let request = flow.begin()?;
    eprintln!("Open this URL to authorize simplodon:\n{}", request.browser_url);
    if let Err(err) = webbrowser::open(&request.browser_url) {
        tracing::warn!(error = %err, "could not open browser");
    }
    flow.complete(request).context("login")?;
    eprintln!("Logged in to {}", session.hostname().unwrap_or_default());
    Ok(())
}
