mod app;
mod ui;

use std::fs::{self, OpenOptions};
use std::io;
use std::sync::Arc;

use anyhow::Context;
use crossterm::{
    event::EventStream,
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use tasksync_client::{AuthClient, ClientConfig, RealtimeClient, RestTaskStore};
use tui::{
    backend::{Backend, CrosstermBackend},
    Terminal,
};

use crate::app::App;

/// Logs go to a file; the terminal belongs to the UI.
fn init_logging(config: &ClientConfig) -> anyhow::Result<()> {
    let path = config.log_path();
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening log file {}", path.display()))?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(file)))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ClientConfig::load().context("loading configuration")?;
    init_logging(&config)?;
    log::info!("starting against {}", config.project_url);

    let auth = Arc::new(AuthClient::new(config.clone()));
    let store = Arc::new(RestTaskStore::new(&config)?);
    let realtime = RealtimeClient::new(&config)?;
    let mut app = App::new(auth, store, realtime, config.table.clone());

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;

    let result = run(&mut terminal, &mut app).await;
    app.shutdown().await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = &result {
        log::error!("terminal ui failed: {err}");
    }
    result
}

async fn run<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> anyhow::Result<()> {
    let mut events = EventStream::new();
    loop {
        terminal.draw(|f| ui::draw(f, app))?;
        if app.should_quit {
            return Ok(());
        }
        let input = app.next_input(&mut events).await?;
        app.apply(input);
    }
}
