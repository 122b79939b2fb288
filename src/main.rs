use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::debug;

mod app;
mod chat;
mod config;
mod engine;
mod generate;
mod handler;
mod tui;
mod ui;

use app::App;
use config::Config;
use engine::EngineClient;
use generate::EngineEvent;
use tui::EventHandler;

const DEFAULT_MODEL: &str = "smollm2:360m";
const DEFAULT_URL: &str = "http://localhost:11434";

#[derive(Parser)]
#[command(name = "openchat")]
#[command(about = "Terminal chat client for local language models")]
struct Cli {
    /// Base URL of the inference engine
    #[arg(long)]
    url: Option<String>,

    /// Model to preselect (overrides the saved default)
    #[arg(short, long)]
    model: Option<String>,
}

/// Log to a file when OPENCHAT_LOG is set; the terminal owns the screen.
fn init_logging() -> Result<()> {
    let Ok(filter) = std::env::var("OPENCHAT_LOG") else {
        return Ok(());
    };

    let dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("openchat");
    std::fs::create_dir_all(&dir)?;
    let file = std::fs::File::create(dir.join("openchat.log"))?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(file)
        .with_ansi(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let config = Config::load().unwrap_or_else(|_| Config::new());
    let url = cli
        .url
        .or(config.engine_url)
        .unwrap_or_else(|| DEFAULT_URL.to_string());
    let model = cli
        .model
        .or(config.default_model)
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    debug!(%url, %model, "starting session");

    let engine = EngineClient::new(&url);
    let (engine_tx, mut engine_rx) = mpsc::unbounded_channel();
    let mut app = App::new(engine, model, engine_tx);

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let mut events = EventHandler::new();

    let result = run(&mut app, &mut terminal, &mut events, &mut engine_rx).await;

    tui::restore()?;
    result
}

async fn run(
    app: &mut App,
    terminal: &mut tui::Tui,
    events: &mut EventHandler,
    engine_rx: &mut mpsc::UnboundedReceiver<EngineEvent>,
) -> Result<()> {
    while !app.should_quit {
        terminal.draw(|frame| ui::render(app, frame))?;

        tokio::select! {
            Some(event) = events.next() => handler::handle_event(app, event).await?,
            Some(event) = engine_rx.recv() => app.apply_engine_event(event),
            else => break,
        }
    }
    Ok(())
}
