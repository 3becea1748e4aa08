use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

pub type BookId = Uuid;
pub type ChapterId = Uuid;

static READER_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f1a8e42-6d11-5b0f-9c77-2a4be08d5f91").expect("valid namespace UUID")
});

pub fn book_id_for_key(key: &str) -> BookId {
    Uuid::new_v5(&READER_NAMESPACE, key.as_bytes())
}

pub fn chapter_id_for(book_id: BookId, ordinal: u32) -> ChapterId {
    Uuid::new_v5(&book_id, &ordinal.to_be_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chapter {
    pub id: ChapterId,
    pub ordinal: u32,
    pub title: String,
    pub is_paid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlipEffect {
    Slide,
    Curl,
    None,
}

impl Default for FlipEffect {
    fn default() -> Self {
        FlipEffect::Slide
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReaderSettings {
    pub font_size: f32,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub line_spacing: f32,
    pub flip_effect: FlipEffect,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            font_size: 16.0,
            viewport_width: 1080,
            viewport_height: 1920,
            line_spacing: 1.4,
            flip_effect: FlipEffect::Slide,
        }
    }
}

impl ReaderSettings {
    // the flip effect is excluded: changing the animation must not
    // invalidate cached page data
    pub fn signature(&self) -> SettingsSignature {
        SettingsSignature {
            font_milli: quantize_milli(self.font_size),
            spacing_milli: quantize_milli(self.line_spacing),
            viewport_width: self.viewport_width,
            viewport_height: self.viewport_height,
        }
    }

    pub fn chars_per_line(&self) -> usize {
        // Average glyph advance approximated as 0.6em, in milli-pixels.
        let advance_milli = (quantize_milli(self.font_size) as u64 * 6 / 10).max(1);
        ((self.viewport_width as u64 * 1000) / advance_milli).max(1) as usize
    }

    pub fn lines_per_page(&self) -> usize {
        let font_milli = quantize_milli(self.font_size) as u64;
        let spacing_milli = quantize_milli(self.line_spacing) as u64;
        let line_height_milli = (font_milli * spacing_milli / 1000).max(1);
        ((self.viewport_height as u64 * 1000) / line_height_milli).max(1) as usize
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct SettingsSignature {
    font_milli: u32,
    spacing_milli: u32,
    viewport_width: u32,
    viewport_height: u32,
}

fn quantize_milli(value: f32) -> u32 {
    let scaled = (value * 1000.0).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        1
    } else if scaled > u32::MAX as f32 {
        u32::MAX
    } else {
        scaled as u32
    }
}

// half-open byte range into the chapter's raw text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSlice {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone)]
pub struct PageData {
    chapter_id: ChapterId,
    signature: SettingsSignature,
    text: Arc<str>,
    slices: Vec<PageSlice>,
}

impl PageData {
    pub fn chapter_id(&self) -> ChapterId {
        self.chapter_id
    }

    pub fn signature(&self) -> SettingsSignature {
        self.signature
    }

    pub fn page_count(&self) -> usize {
        self.slices.len()
    }

    pub fn slices(&self) -> &[PageSlice] {
        &self.slices
    }

    pub fn raw_text(&self) -> &str {
        &self.text
    }

    pub fn page_text(&self, page_index: usize) -> Option<&str> {
        self.slices
            .get(page_index)
            .map(|slice| &self.text[slice.start..slice.end])
    }
}

struct LineLayout {
    cols: usize,
    rows: usize,
    slices: Vec<PageSlice>,
    page_start: usize,
    lines_used: usize,
    col: usize,
}

impl LineLayout {
    fn new(cols: usize, rows: usize) -> Self {
        Self {
            cols,
            rows,
            slices: Vec::new(),
            page_start: 0,
            lines_used: 0,
            col: 0,
        }
    }

    // Ends the current line; `next_start` is the byte offset where the next
    // line's content begins and becomes the page boundary when the page is
    // full.
    fn break_line(&mut self, next_start: usize) {
        self.lines_used += 1;
        self.col = 0;
        if self.lines_used >= self.rows {
            self.slices.push(PageSlice {
                start: self.page_start,
                end: next_start,
            });
            self.page_start = next_start;
            self.lines_used = 0;
        }
    }
}

// Pure and deterministic: identical (raw_text, settings) inputs always
// produce identical slices, and the slices partition the text exactly.
// Empty text yields a single empty page so every chapter stays
// representable.
pub fn paginate(chapter_id: ChapterId, raw_text: &str, settings: &ReaderSettings) -> PageData {
    let mut layout = LineLayout::new(settings.chars_per_line(), settings.lines_per_page());
    let mut iter = raw_text.char_indices().peekable();

    while let Some(&(start, ch)) = iter.peek() {
        if ch == '\n' {
            iter.next();
            layout.break_line(start + 1);
        } else if ch == '\r' {
            // zero width, folds into the newline that follows
            iter.next();
        } else if ch.is_whitespace() {
            // trailing spaces may overhang the line edge; they are invisible
            // there and wrapping them would complicate slice coverage
            iter.next();
            layout.col += 1;
        } else {
            let mut end = start + ch.len_utf8();
            let mut width = 1usize;
            iter.next();
            while let Some(&(i, c)) = iter.peek() {
                if c.is_whitespace() {
                    break;
                }
                iter.next();
                end = i + c.len_utf8();
                width += 1;
            }

            if width <= layout.cols {
                if layout.col > 0 && layout.col + width > layout.cols {
                    layout.break_line(start);
                }
                layout.col += width;
            } else {
                // unbreakable run longer than a line: hard-split at the edge
                // instead of looping on a wrap that can never fit
                if layout.col > 0 {
                    layout.break_line(start);
                }
                for (i, _) in raw_text[start..end].char_indices() {
                    if layout.col >= layout.cols {
                        layout.break_line(start + i);
                    }
                    layout.col += 1;
                }
            }
        }
    }

    if layout.page_start < raw_text.len() || layout.slices.is_empty() {
        layout.slices.push(PageSlice {
            start: layout.page_start,
            end: raw_text.len(),
        });
    }

    PageData {
        chapter_id,
        signature: settings.signature(),
        text: Arc::from(raw_text),
        slices: layout.slices,
    }
}

pub const SESSION_CACHE_CAPACITY: usize = 8;

struct CacheEntry {
    data: Arc<PageData>,
    last_used: u64,
}

struct CacheInner {
    entries: HashMap<ChapterId, CacheEntry>,
    tick: u64,
}

// entries appear atomically: a chapter is either fully paginated in the
// map or absent
pub struct SessionCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl SessionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, chapter_id: ChapterId) -> Option<Arc<PageData>> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let entry = inner.entries.get_mut(&chapter_id)?;
        entry.last_used = tick;
        Some(Arc::clone(&entry.data))
    }

    pub fn contains(&self, chapter_id: ChapterId) -> bool {
        self.inner.lock().entries.contains_key(&chapter_id)
    }

    pub fn insert(&self, data: PageData) -> Arc<PageData> {
        let chapter_id = data.chapter_id();
        let data = Arc::new(data);
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.insert(
            chapter_id,
            CacheEntry {
                data: Arc::clone(&data),
                last_used: tick,
            },
        );

        while inner.entries.len() > self.capacity {
            let stale = inner
                .entries
                .iter()
                .filter(|(id, _)| **id != chapter_id)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| *id);
            match stale {
                Some(id) => {
                    debug!(chapter = %id, "evicting least recently used chapter");
                    inner.entries.remove(&id);
                }
                None => break,
            }
        }
        data
    }

    // compute runs outside the lock; the result lands atomically
    pub fn get_or_compute(
        &self,
        chapter_id: ChapterId,
        compute: impl FnOnce() -> PageData,
    ) -> Arc<PageData> {
        if let Some(data) = self.get(chapter_id) {
            return data;
        }
        self.insert(compute())
    }

    pub fn invalidate_all(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(SESSION_CACHE_CAPACITY)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("book {0} unavailable")]
    BookUnavailable(BookId),
    #[error("book {0} has no chapters")]
    EmptyBook(BookId),
    #[error("chapter {0} unavailable")]
    ChapterUnavailable(ChapterId),
}

// any failure is treated as "chapter unavailable, retry on next approach"
#[async_trait]
pub trait ChapterSource: Send + Sync {
    async fn fetch_chapter_list(&self, book_id: BookId) -> Result<Vec<Chapter>>;
    async fn fetch_chapter_content(&self, chapter_id: ChapterId) -> Result<String>;
}

// the sole persisted unit per book; page_index_within_chapter == -1
// denotes the book-detail unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingPosition {
    pub book_id: BookId,
    pub chapter_id: ChapterId,
    pub page_index_within_chapter: i32,
    pub global_page_index: u64,
    pub chapter_progress: f64,
    pub global_progress: f64,
    pub flip_effect: FlipEffect,
}

pub trait PositionStore: Send + Sync {
    fn save(&self, position: &ReadingPosition) -> Result<()>;
    fn load(&self, book_id: BookId) -> Result<Option<ReadingPosition>>;
    fn clear(&self, book_id: BookId) -> Result<()>;
}

pub struct FilePositionStore {
    root: PathBuf,
}

impl FilePositionStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create position directory at {:?}", root))?;
        Ok(Self { root })
    }

    fn position_path(&self, book_id: BookId) -> PathBuf {
        self.root.join(format!("{}.json", book_id))
    }
}

impl PositionStore for FilePositionStore {
    fn save(&self, position: &ReadingPosition) -> Result<()> {
        let path = self.position_path(position.book_id);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(position)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp position file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn load(&self, book_id: BookId) -> Result<Option<ReadingPosition>> {
        let path = self.position_path(book_id);
        if !path.exists() {
            return Ok(None);
        }
        let mut file =
            File::open(&path).with_context(|| format!("failed to open position file {:?}", path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let position = serde_json::from_str(&buf)
            .with_context(|| format!("failed to decode position file {:?}", path))?;
        Ok(Some(position))
    }

    fn clear(&self, book_id: BookId) -> Result<()> {
        let path = self.position_path(book_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

pub struct MemoryPositionStore {
    inner: Mutex<HashMap<BookId, ReadingPosition>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryPositionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionStore for MemoryPositionStore {
    fn save(&self, position: &ReadingPosition) -> Result<()> {
        self.inner.lock().insert(position.book_id, position.clone());
        Ok(())
    }

    fn load(&self, book_id: BookId) -> Result<Option<ReadingPosition>> {
        Ok(self.inner.lock().get(&book_id).cloned())
    }

    fn clear(&self, book_id: BookId) -> Result<()> {
        self.inner.lock().remove(&book_id);
        Ok(())
    }
}

// chapter files ordered by name: `001 Prologue.txt`, `002 The Road.txt`, ...
pub struct FsChapterSource {
    book_id: BookId,
    chapters: Vec<Chapter>,
    paths: HashMap<ChapterId, PathBuf>,
}

impl FsChapterSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let book_id = book_id_for_key(&dir.to_string_lossy());
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("failed to read book directory {:?}", dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map_or(false, |ext| ext == "txt"))
            .collect();
        files.sort();

        let mut chapters = Vec::with_capacity(files.len());
        let mut paths = HashMap::with_capacity(files.len());
        for (ordinal, path) in files.iter().enumerate() {
            let ordinal = ordinal as u32;
            let id = chapter_id_for(book_id, ordinal);
            chapters.push(Chapter {
                id,
                ordinal,
                title: chapter_title_from_path(path),
                is_paid: false,
            });
            paths.insert(id, path.clone());
        }

        Ok(Self {
            book_id,
            chapters,
            paths,
        })
    }

    pub fn book_id(&self) -> BookId {
        self.book_id
    }
}

fn chapter_title_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Untitled");
    let trimmed = stem
        .trim_start_matches(|c: char| c.is_ascii_digit())
        .trim_start_matches(['-', '_', '.', ' ']);
    if trimmed.is_empty() {
        stem.to_string()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl ChapterSource for FsChapterSource {
    async fn fetch_chapter_list(&self, book_id: BookId) -> Result<Vec<Chapter>> {
        if book_id != self.book_id {
            return Err(anyhow!("unknown book {}", book_id));
        }
        Ok(self.chapters.clone())
    }

    async fn fetch_chapter_content(&self, chapter_id: ChapterId) -> Result<String> {
        let path = self
            .paths
            .get(&chapter_id)
            .ok_or_else(|| anyhow!("unknown chapter {}", chapter_id))?;
        fs::read_to_string(path).with_context(|| format!("failed to read chapter file {:?}", path))
    }
}
