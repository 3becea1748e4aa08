use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::style::Print;
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use pageturn_core::{
    ChapterSource, FilePositionStore, FlipEffect, FsChapterSource, PositionStore, ReaderSettings,
};
use pageturn_engine::{
    FlipDirection, FlipOutcome, NoOpReason, ReadingSession, SessionConfig, VirtualPage,
};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

// Terminal cells stand in for pixels: a 10pt glyph advances 6 units, so a
// viewport of cols*6 by rows*10 paginates to exactly cols by rows cells.
const CELL_FONT_SIZE: f32 = 10.0;
const CELL_WIDTH: u32 = 6;
const CELL_HEIGHT: u32 = 10;
const CHROME_ROWS: u16 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "pageturn",
    version,
    about = "terminal reader for directories of plain-text chapters"
)]
struct Args {
    /// Directory containing the book's chapter files (*.txt, in name order)
    book_dir: PathBuf,

    /// Discard the saved reading position and start from the beginning
    #[arg(long)]
    restart: bool,

    /// Line spacing multiplier to start with
    #[arg(long, default_value_t = 1.0)]
    line_spacing: f32,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "pageturn", "pageturn")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let position_dir = project_dirs.data_local_dir().join("positions");
    let store: Arc<dyn PositionStore> = Arc::new(FilePositionStore::new(position_dir)?);
    let source = FsChapterSource::open(&args.book_dir)?;
    let book_id = source.book_id();
    if args.restart {
        store.clear(book_id)?;
    }

    let (cols, rows) = terminal::size()?;
    let mut settings = settings_for_viewport(cols, rows, args.line_spacing);
    let source: Arc<dyn ChapterSource> = Arc::new(source);
    let session = ReadingSession::open(
        book_id,
        source,
        store,
        settings,
        SessionConfig::default(),
    )
    .await?;

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;

    let mut dirty = true;
    let mut status: Option<String> = None;

    loop {
        if session.needs_rebuild().await {
            session.rebuild().await;
            dirty = true;
        }

        if dirty {
            redraw(&mut stdout, &session, status.as_deref()).await?;
            dirty = false;
        }

        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        match event::read()? {
            Event::Key(key) if key.kind == KeyEventKind::Press => match key.code {
                KeyCode::Char('q') | KeyCode::Esc => break,
                KeyCode::Char('n') | KeyCode::Char('j') | KeyCode::Char(' ') | KeyCode::Right => {
                    status = flip(&session, FlipDirection::Next).await;
                    dirty = true;
                }
                KeyCode::Char('p') | KeyCode::Char('k') | KeyCode::Left => {
                    status = flip(&session, FlipDirection::Previous).await;
                    dirty = true;
                }
                KeyCode::Char('+') | KeyCode::Char('=') => {
                    settings.line_spacing = (settings.line_spacing + 0.1).min(2.0);
                    session.apply_settings(settings).await;
                    status = Some(format!("line spacing {:.1}", settings.line_spacing));
                    dirty = true;
                }
                KeyCode::Char('-') => {
                    settings.line_spacing = (settings.line_spacing - 0.1).max(0.8);
                    session.apply_settings(settings).await;
                    status = Some(format!("line spacing {:.1}", settings.line_spacing));
                    dirty = true;
                }
                _ => {}
            },
            Event::Resize(cols, rows) => {
                settings = settings_for_viewport(cols, rows, settings.line_spacing);
                session.apply_settings(settings).await;
                dirty = true;
            }
            _ => {}
        }
    }

    crossterm::execute!(stdout, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    let position = session.close().await;
    drop(_raw);
    println!(
        "saved at chapter page {}, {:.0}% through the book",
        position.page_index_within_chapter.max(0) + 1,
        position.global_progress * 100.0
    );
    Ok(())
}

fn settings_for_viewport(cols: u16, rows: u16, line_spacing: f32) -> ReaderSettings {
    let body_rows = rows.saturating_sub(CHROME_ROWS).max(1);
    ReaderSettings {
        font_size: CELL_FONT_SIZE,
        viewport_width: u32::from(cols.max(1)) * CELL_WIDTH,
        viewport_height: u32::from(body_rows) * CELL_HEIGHT,
        line_spacing,
        flip_effect: FlipEffect::Slide,
    }
}

// Drives one flip to completion, servicing rebuild requests in between.
// Returns a status message for outcomes the reader should hear about.
async fn flip(session: &ReadingSession, direction: FlipDirection) -> Option<String> {
    for _ in 0..3 {
        match session.flip(direction).await {
            Ok(FlipOutcome::PageChanged { .. }) | Ok(FlipOutcome::ChapterSwitched { .. }) => {
                return None;
            }
            Ok(FlipOutcome::NeedsRebuild) => session.rebuild().await,
            Ok(FlipOutcome::NoOp(reason)) => {
                return match reason {
                    NoOpReason::Debounced => None,
                    NoOpReason::AtBookStart => Some("at the beginning of the book".into()),
                    NoOpReason::AtBookEnd => Some("at the end of the book".into()),
                    NoOpReason::SwitchTimedOut => {
                        Some("next chapter is still loading, try again".into())
                    }
                };
            }
            Err(err) => {
                warn!(error = %err, "flip failed");
                return Some(err.to_string());
            }
        }
    }
    None
}

async fn redraw(
    stdout: &mut io::Stdout,
    session: &ReadingSession,
    status: Option<&str>,
) -> Result<()> {
    let (cols, rows) = terminal::size()?;
    let width = cols.max(1) as usize;
    let body_rows = rows.saturating_sub(CHROME_ROWS);

    let chapter = session.current_chapter().await;
    let position = session.position().await;
    let page = session.current_page().await;

    crossterm::queue!(stdout, Clear(ClearType::All), cursor::MoveTo(0, 0))?;

    let header = match page {
        Some(VirtualPage::BookDetail) => format!("{}  [book]", chapter.title),
        _ => format!(
            "{}  page {}  {:.0}%",
            chapter.title,
            position.page_index_within_chapter.max(0) + 1,
            position.global_progress * 100.0
        ),
    };
    crossterm::queue!(stdout, Print(truncate(&header, width)))?;

    let body = match page {
        Some(VirtualPage::BookDetail) => book_detail_text(session).await,
        Some(VirtualPage::ChapterSection { .. }) => {
            format!("{}\n\nloading...", chapter.title)
        }
        Some(VirtualPage::Content { .. }) => session
            .current_page_text()
            .await
            .unwrap_or_else(|| "loading...".into()),
        None => String::new(),
    };
    for (row, line) in wrap_text(&body, width).into_iter().enumerate() {
        if row as u16 >= body_rows {
            break;
        }
        crossterm::queue!(stdout, cursor::MoveTo(0, row as u16 + 1), Print(line))?;
    }

    let hint = status.unwrap_or("n/p flip  +/- spacing  q quit");
    crossterm::queue!(
        stdout,
        cursor::MoveTo(0, rows.saturating_sub(1)),
        Print(truncate(hint, width))
    )?;
    stdout.flush()?;
    Ok(())
}

async fn book_detail_text(session: &ReadingSession) -> String {
    let chapter = session.current_chapter().await;
    let pages = session.virtual_pages().await;
    let loaded = pages
        .iter()
        .filter(|page| matches!(page, VirtualPage::Content { .. }))
        .count();
    format!(
        "first chapter: {}\n\n{} pages ready\n\npress n to start reading",
        chapter.title, loaded
    )
}

fn truncate(text: &str, width: usize) -> String {
    text.chars().take(width).collect()
}

// Greedy word wrap for display; mirrors how pagination cut the page, so a
// page's lines fit the body region it was paginated for.
fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    for raw_line in text.lines() {
        let mut current = String::new();
        let mut col = 0usize;
        for word in raw_line.split_inclusive(' ') {
            let trimmed = word.trim_end();
            let glyphs = trimmed.chars().count();
            if glyphs > width {
                // oversized token: hard-split at the line edge
                for ch in word.chars() {
                    if col >= width {
                        lines.push(std::mem::take(&mut current));
                        col = 0;
                    }
                    current.push(ch);
                    col += 1;
                }
                continue;
            }
            if col > 0 && col + glyphs > width {
                lines.push(std::mem::take(&mut current));
                col = 0;
            }
            current.push_str(word);
            col += word.chars().count();
        }
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "pageturn.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
