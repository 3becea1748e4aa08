use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument, warn};

use pageturn_core::{
    paginate, BookId, Chapter, ChapterId, ChapterSource, PageData, PositionStore, ReaderError,
    ReaderSettings, ReadingPosition, SessionCache, SESSION_CACHE_CAPACITY,
};

pub const PRELOAD_WINDOW: usize = 2;
pub const PRELOAD_MAX_ATTEMPTS: u32 = 3;
pub const FLIP_DEBOUNCE_MS: u64 = 300;
pub const CACHE_OPERATION_TIMEOUT_MS: u64 = 2_000;
// assumed for chapters that have not been paginated yet
pub const ESTIMATED_PAGES_PER_CHAPTER: u64 = 12;

const SWITCH_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub cache_capacity: usize,
    pub preload_window: usize,
    pub flip_debounce: Duration,
    pub switch_timeout: Duration,
    pub preload_max_attempts: u32,
    pub estimated_pages_per_chapter: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_capacity: SESSION_CACHE_CAPACITY,
            preload_window: PRELOAD_WINDOW,
            flip_debounce: Duration::from_millis(FLIP_DEBOUNCE_MS),
            switch_timeout: Duration::from_millis(CACHE_OPERATION_TIMEOUT_MS),
            preload_max_attempts: PRELOAD_MAX_ATTEMPTS,
            estimated_pages_per_chapter: ESTIMATED_PAGES_PER_CHAPTER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualPage {
    BookDetail,
    Content {
        chapter_id: ChapterId,
        page_index: u32,
    },
    ChapterSection {
        chapter_id: ChapterId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipDirection {
    Next,
    Previous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    Debounced,
    AtBookStart,
    AtBookEnd,
    SwitchTimedOut,
}

// silently ignoring NeedsRebuild desynchronizes the cursor from the list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipOutcome {
    PageChanged {
        page: VirtualPage,
        needs_preload_check: bool,
    },
    ChapterSwitched {
        chapter_id: ChapterId,
        page: VirtualPage,
    },
    NeedsRebuild,
    NoOp(NoOpReason),
}

// transient view over cache state; rebuilt, never mutated
#[derive(Debug, Clone, Default)]
pub struct VirtualPageList {
    pages: Vec<VirtualPage>,
}

impl VirtualPageList {
    pub fn build(chapters: &[Chapter], window: Range<usize>, cache: &SessionCache) -> Self {
        let mut pages = Vec::new();
        for ord in window {
            let chapter = match chapters.get(ord) {
                Some(chapter) => chapter,
                None => break,
            };
            if ord == 0 {
                pages.push(VirtualPage::BookDetail);
            }
            match cache.get(chapter.id) {
                Some(data) => {
                    for page_index in 0..data.page_count() {
                        pages.push(VirtualPage::Content {
                            chapter_id: chapter.id,
                            page_index: page_index as u32,
                        });
                    }
                }
                None => pages.push(VirtualPage::ChapterSection {
                    chapter_id: chapter.id,
                }),
            }
        }
        Self { pages }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<VirtualPage> {
        self.pages.get(index).copied()
    }

    pub fn pages(&self) -> &[VirtualPage] {
        &self.pages
    }

    /// Resolves a logical `(chapter, page)` position to a virtual index.
    /// A page beyond the chapter's current count clamps to its last page;
    /// an unpaginated chapter resolves to its section placeholder.
    pub fn position_of(&self, chapter_id: ChapterId, page_index: i32) -> Option<usize> {
        if page_index < 0 {
            return self
                .pages
                .iter()
                .position(|p| matches!(p, VirtualPage::BookDetail));
        }
        let mut last_of_chapter = None;
        let mut section = None;
        for (idx, page) in self.pages.iter().enumerate() {
            match *page {
                VirtualPage::Content {
                    chapter_id: c,
                    page_index: p,
                } if c == chapter_id => {
                    if i64::from(p) == i64::from(page_index) {
                        return Some(idx);
                    }
                    last_of_chapter = Some(idx);
                }
                VirtualPage::ChapterSection { chapter_id: c } if c == chapter_id => {
                    section = Some(idx);
                }
                _ => {}
            }
        }
        last_of_chapter.or(section)
    }

    pub fn first_of_chapter(&self, chapter_id: ChapterId) -> Option<usize> {
        self.pages.iter().position(|page| match *page {
            VirtualPage::Content { chapter_id: c, .. } => c == chapter_id,
            VirtualPage::ChapterSection { chapter_id: c } => c == chapter_id,
            VirtualPage::BookDetail => false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChapterSpan {
    pub start_global_page: u64,
    pub page_count: u64,
    pub exact: bool,
}

// progress math only, never navigation; counts are estimates until real
// pagination corrects them
pub struct PageCountCache {
    order: Vec<ChapterId>,
    spans: HashMap<ChapterId, ChapterSpan>,
}

impl PageCountCache {
    pub fn new(chapters: &[Chapter], estimated_pages_per_chapter: u64) -> Self {
        let estimate = estimated_pages_per_chapter.max(1);
        let order: Vec<ChapterId> = chapters.iter().map(|c| c.id).collect();
        let spans = order
            .iter()
            .map(|id| {
                (
                    *id,
                    ChapterSpan {
                        start_global_page: 0,
                        page_count: estimate,
                        exact: false,
                    },
                )
            })
            .collect();
        let mut cache = Self { order, spans };
        cache.rebuild_offsets();
        cache
    }

    fn rebuild_offsets(&mut self) {
        let mut next_start = 0u64;
        for id in &self.order {
            if let Some(span) = self.spans.get_mut(id) {
                span.start_global_page = next_start;
                next_start += span.page_count;
            }
        }
    }

    pub fn correct(&mut self, chapter_id: ChapterId, page_count: u64) {
        let page_count = page_count.max(1);
        match self.spans.get_mut(&chapter_id) {
            Some(span) if span.exact && span.page_count == page_count => {}
            Some(span) => {
                span.page_count = page_count;
                span.exact = true;
                self.rebuild_offsets();
            }
            None => {}
        }
    }

    pub fn span(&self, chapter_id: ChapterId) -> Option<ChapterSpan> {
        self.spans.get(&chapter_id).copied()
    }

    pub fn total_pages(&self) -> u64 {
        self.order
            .last()
            .and_then(|id| self.spans.get(id))
            .map(|span| span.start_global_page + span.page_count)
            .unwrap_or(0)
    }
}

// persistence failures cost durability only: logged and swallowed, the
// in-memory cursor is never affected
pub struct ProgressTracker {
    store: Arc<dyn PositionStore>,
    counts: Mutex<PageCountCache>,
}

impl ProgressTracker {
    pub fn new(
        store: Arc<dyn PositionStore>,
        chapters: &[Chapter],
        estimated_pages_per_chapter: u64,
    ) -> Self {
        Self {
            store,
            counts: Mutex::new(PageCountCache::new(chapters, estimated_pages_per_chapter)),
        }
    }

    pub fn record_page_count(&self, chapter_id: ChapterId, page_count: u64) {
        self.counts.lock().correct(chapter_id, page_count);
    }

    pub fn total_pages(&self) -> u64 {
        self.counts.lock().total_pages()
    }

    pub fn global_progress(&self, chapter_id: ChapterId, page_index: i32) -> f64 {
        let counts = self.counts.lock();
        let total = counts.total_pages().max(1) as f64;
        let span = match counts.span(chapter_id) {
            Some(span) => span,
            None => return 0.0,
        };
        let fraction = if page_index < 0 {
            span.start_global_page as f64 / total
        } else {
            (span.start_global_page + page_index as u64 + 1) as f64 / total
        };
        fraction.clamp(0.0, 1.0)
    }

    pub fn compute_position(
        &self,
        book_id: BookId,
        chapter_id: ChapterId,
        page_index: i32,
        flip_effect: pageturn_core::FlipEffect,
        global_progress: f64,
    ) -> ReadingPosition {
        let counts = self.counts.lock();
        let span = counts.span(chapter_id).unwrap_or(ChapterSpan {
            start_global_page: 0,
            page_count: 1,
            exact: false,
        });
        let chapter_progress =
            ((page_index + 1).max(0) as f64 / span.page_count.max(1) as f64).clamp(0.0, 1.0);
        let global_page_index = span.start_global_page + page_index.max(0) as u64;
        ReadingPosition {
            book_id,
            chapter_id,
            page_index_within_chapter: page_index,
            global_page_index,
            chapter_progress,
            global_progress: global_progress.clamp(0.0, 1.0),
            flip_effect,
        }
    }

    pub fn save_progress(
        &self,
        book_id: BookId,
        chapter_id: ChapterId,
        page_index: i32,
        flip_effect: pageturn_core::FlipEffect,
        global_progress: f64,
    ) -> ReadingPosition {
        let position =
            self.compute_position(book_id, chapter_id, page_index, flip_effect, global_progress);
        if let Err(err) = self.store.save(&position) {
            warn!(book = %book_id, error = %err, "failed to persist reading position");
        }
        position
    }

    pub fn load_progress(&self, book_id: BookId) -> Option<ReadingPosition> {
        match self.store.load(book_id) {
            Ok(position) => position,
            Err(err) => {
                warn!(book = %book_id, error = %err, "failed to load reading position");
                None
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadEvent {
    Loaded { chapter_id: ChapterId },
    Failed { chapter_id: ChapterId },
}

struct PlannerShared {
    source: Arc<dyn ChapterSource>,
    cache: Arc<SessionCache>,
    events: mpsc::UnboundedSender<PreloadEvent>,
    pending: Mutex<HashSet<ChapterId>>,
    failures: Mutex<HashMap<ChapterId, u32>>,
    max_attempts: u32,
    cancel: CancelFlag,
}

/// Background fetch+paginate for chapters adjacent to the cursor. At most
/// one task is in flight per chapter; a failed chapter is retried lazily on
/// the next boundary approach until its attempt budget is spent.
pub struct PreloadPlanner {
    shared: Arc<PlannerShared>,
}

impl PreloadPlanner {
    pub fn new(
        source: Arc<dyn ChapterSource>,
        cache: Arc<SessionCache>,
        cancel: CancelFlag,
        max_attempts: u32,
    ) -> (Self, mpsc::UnboundedReceiver<PreloadEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let planner = Self {
            shared: Arc::new(PlannerShared {
                source,
                cache,
                events,
                pending: Mutex::new(HashSet::new()),
                failures: Mutex::new(HashMap::new()),
                max_attempts: max_attempts.max(1),
                cancel,
            }),
        };
        (planner, receiver)
    }

    // nearest first
    pub fn schedule_window(
        &self,
        chapters: &[Chapter],
        current: usize,
        back: usize,
        forward: usize,
        settings: ReaderSettings,
    ) {
        for distance in 1..=back.max(forward) {
            if distance <= back {
                if let Some(ord) = current.checked_sub(distance) {
                    if let Some(chapter) = chapters.get(ord) {
                        self.schedule(chapter.clone(), settings);
                    }
                }
            }
            if distance <= forward {
                if let Some(chapter) = chapters.get(current + distance) {
                    self.schedule(chapter.clone(), settings);
                }
            }
        }
    }

    /// Returns whether a task was spawned.
    pub fn schedule(&self, chapter: Chapter, settings: ReaderSettings) -> bool {
        let chapter_id = chapter.id;
        if self.shared.cache.contains(chapter_id) {
            return false;
        }
        if self
            .shared
            .failures
            .lock()
            .get(&chapter_id)
            .map_or(false, |attempts| *attempts >= self.shared.max_attempts)
        {
            debug!(chapter = %chapter_id, "preload attempts exhausted; not rescheduling");
            return false;
        }
        if !self.shared.pending.lock().insert(chapter_id) {
            return false;
        }

        debug!(chapter = %chapter_id, ordinal = chapter.ordinal, "scheduling chapter preload");
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let result = shared.source.fetch_chapter_content(chapter_id).await;
            if shared.cancel.is_cancelled() {
                shared.pending.lock().remove(&chapter_id);
                return;
            }
            match result {
                Ok(text) => {
                    let data = paginate(chapter_id, &text, &settings);
                    if shared.cancel.is_cancelled() {
                        shared.pending.lock().remove(&chapter_id);
                        return;
                    }
                    // the chapter must be resident before it stops being
                    // pending: a switch polling the other way around would
                    // read a successful fetch as a failed one
                    shared.cache.insert(data);
                    shared.failures.lock().remove(&chapter_id);
                    shared.pending.lock().remove(&chapter_id);
                    let _ = shared.events.send(PreloadEvent::Loaded { chapter_id });
                }
                Err(err) => {
                    warn!(chapter = %chapter_id, error = %err, "chapter preload failed");
                    *shared.failures.lock().entry(chapter_id).or_insert(0) += 1;
                    shared.pending.lock().remove(&chapter_id);
                    let _ = shared.events.send(PreloadEvent::Failed { chapter_id });
                }
            }
        });
        true
    }

    pub fn is_pending(&self, chapter_id: ChapterId) -> bool {
        self.shared.pending.lock().contains(&chapter_id)
    }

    // an explicit switch target gets a fresh attempt budget
    pub fn reset_failures(&self, chapter_id: ChapterId) {
        self.shared.failures.lock().remove(&chapter_id);
    }
}

struct SessionState {
    chapters: Vec<Chapter>,
    settings: ReaderSettings,
    current_ord: usize,
    // -1 denotes the book-detail unit
    current_page: i32,
    window: Range<usize>,
    list: VirtualPageList,
    cursor: usize,
    last_commit: Option<Instant>,
    pending_rebuild: bool,
    streak_direction: Option<FlipDirection>,
    streak: u32,
    extra_back: usize,
    extra_forward: usize,
}

impl SessionState {
    fn current_chapter(&self) -> &Chapter {
        // current_ord is clamped to the chapter list everywhere it is set
        &self.chapters[self.current_ord.min(self.chapters.len() - 1)]
    }
}

/// One open book. All cursor, list, and cache mutations are serialized
/// behind a single async mutex; preload tasks only touch the cache and
/// report back over the event channel.
pub struct ReadingSession {
    book_id: BookId,
    config: SessionConfig,
    source: Arc<dyn ChapterSource>,
    cache: Arc<SessionCache>,
    tracker: ProgressTracker,
    planner: PreloadPlanner,
    events: Mutex<mpsc::UnboundedReceiver<PreloadEvent>>,
    cancel: CancelFlag,
    state: AsyncMutex<SessionState>,
}

impl ReadingSession {
    #[instrument(skip_all, fields(book = %book_id))]
    pub async fn open(
        book_id: BookId,
        source: Arc<dyn ChapterSource>,
        store: Arc<dyn PositionStore>,
        settings: ReaderSettings,
        config: SessionConfig,
    ) -> Result<Self, ReaderError> {
        let chapters = match source.fetch_chapter_list(book_id).await {
            Ok(chapters) => chapters,
            Err(err) => {
                warn!(error = %err, "chapter list fetch failed");
                return Err(ReaderError::BookUnavailable(book_id));
            }
        };
        if chapters.is_empty() {
            return Err(ReaderError::EmptyBook(book_id));
        }

        let cache = Arc::new(SessionCache::new(config.cache_capacity));
        let tracker = ProgressTracker::new(store, &chapters, config.estimated_pages_per_chapter);
        let cancel = CancelFlag::new();
        let (planner, events) = PreloadPlanner::new(
            Arc::clone(&source),
            Arc::clone(&cache),
            cancel.clone(),
            config.preload_max_attempts,
        );

        // restore the persisted position, or start at the book-detail unit
        let mut current_ord = 0usize;
        let mut current_page = -1i32;
        if let Some(position) = tracker.load_progress(book_id) {
            if let Some(ord) = chapters.iter().position(|c| c.id == position.chapter_id) {
                current_ord = ord;
                current_page = position.page_index_within_chapter;
            }
        }

        // paginate the entry chapter up front so the first render has real
        // pages; on failure the list degrades to a section placeholder and
        // preload retries later
        let entry = chapters[current_ord].clone();
        match source.fetch_chapter_content(entry.id).await {
            Ok(text) => {
                let data = paginate(entry.id, &text, &settings);
                tracker.record_page_count(entry.id, data.page_count() as u64);
                if current_page >= data.page_count() as i32 {
                    current_page = data.page_count() as i32 - 1;
                }
                cache.insert(data);
            }
            Err(err) => {
                warn!(chapter = %entry.id, error = %err, "entry chapter fetch failed");
            }
        }

        let session = Self {
            book_id,
            config,
            source,
            cache,
            tracker,
            planner,
            events: Mutex::new(events),
            cancel,
            state: AsyncMutex::new(SessionState {
                chapters,
                settings,
                current_ord,
                current_page,
                window: 0..0,
                list: VirtualPageList::default(),
                cursor: 0,
                last_commit: None,
                pending_rebuild: false,
                streak_direction: None,
                streak: 0,
                extra_back: 0,
                extra_forward: 0,
            }),
        };

        {
            let mut st = session.state.lock().await;
            session.rebuild_locked(&mut st);
            session.schedule_preload(&st);
        }
        Ok(session)
    }

    pub fn book_id(&self) -> BookId {
        self.book_id
    }

    /// Advances or retreats the virtual cursor by one unit. A chapter
    /// switch waits at most the configured timeout.
    pub async fn flip(&self, direction: FlipDirection) -> Result<FlipOutcome, ReaderError> {
        let mut st = self.state.lock().await;
        self.drain_events_locked(&mut st);

        if let Some(last) = st.last_commit {
            if last.elapsed() < self.config.flip_debounce {
                return Ok(FlipOutcome::NoOp(NoOpReason::Debounced));
            }
        }

        if st.pending_rebuild {
            // a freshly preloaded chapter shifted the index space; the
            // caller rebuilds and retries instead of trusting stale math
            return Ok(FlipOutcome::NeedsRebuild);
        }

        let target = match direction {
            FlipDirection::Next => {
                let next = st.cursor + 1;
                (next < st.list.len()).then_some(next)
            }
            FlipDirection::Previous => st.cursor.checked_sub(1),
        };

        match target.and_then(|idx| st.list.get(idx).map(|page| (idx, page))) {
            Some((idx, page)) => {
                let needs_preload_check = self.commit_locked(&mut st, idx, page, direction);
                self.persist_locked(&st);
                if needs_preload_check {
                    self.schedule_preload(&st);
                }
                Ok(FlipOutcome::PageChanged {
                    page,
                    needs_preload_check,
                })
            }
            None => self.switch_chapter_locked(&mut st, direction).await,
        }
    }

    pub async fn rebuild(&self) {
        let mut st = self.state.lock().await;
        self.drain_events_locked(&mut st);
        self.rebuild_locked(&mut st);
    }

    pub async fn needs_rebuild(&self) -> bool {
        let mut st = self.state.lock().await;
        self.drain_events_locked(&mut st);
        st.pending_rebuild
    }

    // the cursor re-resolves to the same proportional spot in the chapter,
    // not to page zero
    pub async fn apply_settings(&self, settings: ReaderSettings) {
        let mut st = self.state.lock().await;
        self.drain_events_locked(&mut st);

        let chapter_id = st.current_chapter().id;
        let old = self.cache.get(chapter_id);
        self.cache.invalidate_all();
        st.settings = settings;

        if let Some(old) = old {
            let data = paginate(chapter_id, old.raw_text(), &settings);
            let new_count = data.page_count();
            self.tracker
                .record_page_count(chapter_id, new_count as u64);
            if st.current_page >= 0 && old.page_count() > 0 && new_count > 0 {
                let proportion = st.current_page as f64 / old.page_count() as f64;
                st.current_page = ((proportion * new_count as f64).round() as i64)
                    .clamp(0, new_count as i64 - 1) as i32;
            }
            self.cache.insert(data);
        }

        self.rebuild_locked(&mut st);
        self.schedule_preload(&st);
    }

    pub async fn current_page(&self) -> Option<VirtualPage> {
        let st = self.state.lock().await;
        st.list.get(st.cursor)
    }

    pub async fn current_page_text(&self) -> Option<String> {
        let st = self.state.lock().await;
        match st.list.get(st.cursor) {
            Some(VirtualPage::Content {
                chapter_id,
                page_index,
            }) => self
                .cache
                .get(chapter_id)
                .and_then(|data| data.page_text(page_index as usize).map(str::to_owned)),
            _ => None,
        }
    }

    pub async fn current_chapter(&self) -> Chapter {
        let st = self.state.lock().await;
        st.current_chapter().clone()
    }

    pub async fn virtual_pages(&self) -> Vec<VirtualPage> {
        let st = self.state.lock().await;
        st.list.pages().to_vec()
    }

    pub async fn position(&self) -> ReadingPosition {
        let st = self.state.lock().await;
        let chapter_id = st.current_chapter().id;
        let global_progress = self.tracker.global_progress(chapter_id, st.current_page);
        self.tracker.compute_position(
            self.book_id,
            chapter_id,
            st.current_page,
            st.settings.flip_effect,
            global_progress,
        )
    }

    pub async fn persist(&self) -> ReadingPosition {
        let st = self.state.lock().await;
        self.persist_locked(&st)
    }

    pub async fn close(&self) -> ReadingPosition {
        self.cancel.cancel();
        let st = self.state.lock().await;
        self.persist_locked(&st)
    }

    // the combined span is clamped to the cache capacity; a window wider
    // than the cache would evict chapters it is about to reschedule on
    // every boundary hit
    fn preload_extent(&self, st: &SessionState) -> (usize, usize) {
        let base = self.config.preload_window;
        let mut back = base + st.extra_back;
        let mut forward = base + st.extra_forward;
        let capacity = self.config.cache_capacity.saturating_sub(1);
        while back + forward > capacity && (back > base || forward > base) {
            if back > base && back - base >= forward.saturating_sub(base) {
                back -= 1;
            } else {
                forward -= 1;
            }
        }
        (back, forward)
    }

    fn window_for(&self, st: &SessionState) -> Range<usize> {
        let (back, forward) = self.preload_extent(st);
        let start = st.current_ord.saturating_sub(back);
        let end = (st.current_ord + forward + 1).min(st.chapters.len());
        start..end
    }

    fn rebuild_locked(&self, st: &mut SessionState) {
        st.window = self.window_for(st);
        st.list = VirtualPageList::build(&st.chapters, st.window.clone(), &self.cache);

        if st.current_page < 0 && st.current_ord > 0 {
            // the book-detail unit only exists ahead of the first chapter
            st.current_page = 0;
        }
        let chapter_id = st.current_chapter().id;
        match st.list.position_of(chapter_id, st.current_page) {
            Some(idx) => {
                st.cursor = idx;
                match st.list.get(idx) {
                    Some(VirtualPage::Content { page_index, .. }) => {
                        st.current_page = page_index as i32;
                    }
                    Some(VirtualPage::BookDetail) => st.current_page = -1,
                    Some(VirtualPage::ChapterSection { .. }) => st.current_page = 0,
                    None => {}
                }
            }
            None => {
                warn!(chapter = %chapter_id, "position unresolvable after rebuild; falling back");
                self.fall_back_to_nearest(st);
            }
        }
        st.pending_rebuild = false;
    }

    fn fall_back_to_nearest(&self, st: &mut SessionState) {
        for distance in 0..st.chapters.len() {
            let below = st.current_ord.checked_sub(distance);
            let above = st.current_ord + distance;
            for ord in below.into_iter().chain(Some(above)) {
                if let Some(chapter) = st.chapters.get(ord) {
                    if let Some(idx) = st.list.first_of_chapter(chapter.id) {
                        st.current_ord = ord;
                        st.current_page = 0;
                        st.cursor = idx;
                        return;
                    }
                }
            }
        }
        st.cursor = 0;
        st.current_ord = 0;
        st.current_page = match st.list.get(0) {
            Some(VirtualPage::BookDetail) => -1,
            _ => 0,
        };
    }

    fn drain_events_locked(&self, st: &mut SessionState) {
        let mut events = self.events.lock();
        while let Ok(event) = events.try_recv() {
            match event {
                PreloadEvent::Loaded { chapter_id } => {
                    if let Some(data) = self.cache.get(chapter_id) {
                        self.tracker
                            .record_page_count(chapter_id, data.page_count() as u64);
                    }
                    let in_window = st
                        .chapters
                        .iter()
                        .position(|c| c.id == chapter_id)
                        .map_or(false, |ord| st.window.contains(&ord));
                    if in_window {
                        st.pending_rebuild = true;
                    }
                }
                PreloadEvent::Failed { .. } => {}
            }
        }
    }

    // returns whether the destination sits on a chapter boundary, the
    // preload trigger
    fn commit_locked(
        &self,
        st: &mut SessionState,
        idx: usize,
        page: VirtualPage,
        direction: FlipDirection,
    ) -> bool {
        st.cursor = idx;
        st.last_commit = Some(Instant::now());

        match page {
            VirtualPage::BookDetail => {
                st.current_ord = 0;
                st.current_page = -1;
            }
            VirtualPage::Content {
                chapter_id,
                page_index,
            } => {
                if let Some(ord) = st.chapters.iter().position(|c| c.id == chapter_id) {
                    st.current_ord = ord;
                }
                st.current_page = page_index as i32;
            }
            VirtualPage::ChapterSection { chapter_id } => {
                if let Some(ord) = st.chapters.iter().position(|c| c.id == chapter_id) {
                    st.current_ord = ord;
                }
                st.current_page = 0;
            }
        }

        let needs_preload_check = self.is_boundary(page);
        if needs_preload_check {
            // repeated boundary hits in one direction widen the window on
            // that side, keeping ahead of a fast flipper
            if st.streak_direction == Some(direction) {
                st.streak += 1;
            } else {
                // a direction change retires any widened span; the window
                // re-earns its extras through fresh boundary streaks
                st.streak_direction = Some(direction);
                st.streak = 1;
                st.extra_back = 0;
                st.extra_forward = 0;
            }
            if st.streak >= 2 {
                match direction {
                    FlipDirection::Next => {
                        st.extra_forward = (st.extra_forward + 1).min(self.config.preload_window);
                    }
                    FlipDirection::Previous => {
                        st.extra_back = (st.extra_back + 1).min(self.config.preload_window);
                    }
                }
            }
        } else {
            st.streak_direction = None;
            st.streak = 0;
        }
        needs_preload_check
    }

    fn is_boundary(&self, page: VirtualPage) -> bool {
        match page {
            VirtualPage::Content {
                chapter_id,
                page_index,
            } => match self.cache.get(chapter_id) {
                Some(data) => {
                    let last = data.page_count().saturating_sub(1);
                    page_index as usize == 0 || page_index as usize == last
                }
                None => true,
            },
            VirtualPage::ChapterSection { .. } => true,
            VirtualPage::BookDetail => false,
        }
    }

    async fn switch_chapter_locked(
        &self,
        st: &mut SessionState,
        direction: FlipDirection,
    ) -> Result<FlipOutcome, ReaderError> {
        let target_ord = match direction {
            FlipDirection::Next => {
                if st.current_ord + 1 >= st.chapters.len() {
                    return Ok(FlipOutcome::NoOp(NoOpReason::AtBookEnd));
                }
                st.current_ord + 1
            }
            FlipDirection::Previous => match st.current_ord.checked_sub(1) {
                Some(ord) => ord,
                None => return Ok(FlipOutcome::NoOp(NoOpReason::AtBookStart)),
            },
        };

        let chapter = st.chapters[target_ord].clone();
        let data = match self.cache.get(chapter.id) {
            Some(data) => data,
            None => {
                self.planner.reset_failures(chapter.id);
                self.planner.schedule(chapter.clone(), st.settings);
                let waited = tokio::time::timeout(
                    self.config.switch_timeout,
                    self.await_resident(chapter.id),
                )
                .await;
                match waited {
                    Ok(Some(data)) => data,
                    Ok(None) => return Err(ReaderError::ChapterUnavailable(chapter.id)),
                    Err(_) => {
                        // the fetch task keeps running and may still fill
                        // the cache for the next attempt
                        warn!(chapter = %chapter.id, "chapter switch timed out");
                        return Ok(FlipOutcome::NoOp(NoOpReason::SwitchTimedOut));
                    }
                }
            }
        };

        self.tracker
            .record_page_count(chapter.id, data.page_count() as u64);
        st.current_ord = target_ord;
        st.current_page = match direction {
            FlipDirection::Next => 0,
            FlipDirection::Previous => data.page_count() as i32 - 1,
        };
        self.rebuild_locked(st);
        st.last_commit = Some(Instant::now());
        self.persist_locked(st);
        self.schedule_preload(st);

        let page = st.list.get(st.cursor).unwrap_or(VirtualPage::BookDetail);
        Ok(FlipOutcome::ChapterSwitched {
            chapter_id: chapter.id,
            page,
        })
    }

    async fn await_resident(&self, chapter_id: ChapterId) -> Option<Arc<PageData>> {
        loop {
            if let Some(data) = self.cache.get(chapter_id) {
                return Some(data);
            }
            if !self.planner.is_pending(chapter_id) {
                // the task finished without populating the cache
                return None;
            }
            tokio::time::sleep(SWITCH_POLL_INTERVAL).await;
        }
    }

    fn persist_locked(&self, st: &SessionState) -> ReadingPosition {
        let chapter_id = st.current_chapter().id;
        let global_progress = self.tracker.global_progress(chapter_id, st.current_page);
        self.tracker.save_progress(
            self.book_id,
            chapter_id,
            st.current_page,
            st.settings.flip_effect,
            global_progress,
        )
    }

    fn schedule_preload(&self, st: &SessionState) {
        let (back, forward) = self.preload_extent(st);
        self.planner
            .schedule_window(&st.chapters, st.current_ord, back, forward, st.settings);
    }
}

impl Drop for ReadingSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use pageturn_core::{book_id_for_key, chapter_id_for, FlipEffect, MemoryPositionStore};

    struct FakeSource {
        book_id: BookId,
        chapters: Vec<Chapter>,
        contents: Mutex<HashMap<ChapterId, String>>,
        failing: Mutex<HashSet<ChapterId>>,
        fetch_counts: Mutex<HashMap<ChapterId, u32>>,
        delay: Mutex<HashMap<ChapterId, Duration>>,
    }

    impl FakeSource {
        fn new(book_key: &str, chapter_texts: &[&str]) -> Arc<Self> {
            let book_id = book_id_for_key(book_key);
            let mut chapters = Vec::new();
            let mut contents = HashMap::new();
            for (ordinal, text) in chapter_texts.iter().enumerate() {
                let id = chapter_id_for(book_id, ordinal as u32);
                chapters.push(Chapter {
                    id,
                    ordinal: ordinal as u32,
                    title: format!("Chapter {}", ordinal + 1),
                    is_paid: false,
                });
                contents.insert(id, text.to_string());
            }
            Arc::new(Self {
                book_id,
                chapters,
                contents: Mutex::new(contents),
                failing: Mutex::new(HashSet::new()),
                fetch_counts: Mutex::new(HashMap::new()),
                delay: Mutex::new(HashMap::new()),
            })
        }

        fn chapter_id(&self, ordinal: usize) -> ChapterId {
            self.chapters[ordinal].id
        }

        fn set_failing(&self, chapter_id: ChapterId) {
            self.failing.lock().insert(chapter_id);
        }

        fn set_delay(&self, chapter_id: ChapterId, delay: Duration) {
            self.delay.lock().insert(chapter_id, delay);
        }

        fn fetch_count(&self, chapter_id: ChapterId) -> u32 {
            self.fetch_counts.lock().get(&chapter_id).copied().unwrap_or(0)
        }

        fn total_fetches(&self) -> u32 {
            self.fetch_counts.lock().values().sum()
        }
    }

    #[async_trait]
    impl ChapterSource for FakeSource {
        async fn fetch_chapter_list(&self, book_id: BookId) -> Result<Vec<Chapter>> {
            if book_id != self.book_id {
                return Err(anyhow!("unknown book"));
            }
            Ok(self.chapters.clone())
        }

        async fn fetch_chapter_content(&self, chapter_id: ChapterId) -> Result<String> {
            *self.fetch_counts.lock().entry(chapter_id).or_insert(0) += 1;
            let delay = self.delay.lock().get(&chapter_id).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.lock().contains(&chapter_id) {
                return Err(anyhow!("chapter fetch failed"));
            }
            self.contents
                .lock()
                .get(&chapter_id)
                .cloned()
                .ok_or_else(|| anyhow!("no such chapter"))
        }
    }

    // 24 chars per line, 30 lines per page
    fn test_settings() -> ReaderSettings {
        ReaderSettings {
            font_size: 10.0,
            viewport_width: 144,
            viewport_height: 300,
            line_spacing: 1.0,
            flip_effect: FlipEffect::Slide,
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            flip_debounce: Duration::ZERO,
            switch_timeout: Duration::from_millis(500),
            ..SessionConfig::default()
        }
    }

    // splits into exactly 5 pages under test_settings
    fn five_page_text() -> String {
        let mut text = "ab ".repeat(1069);
        text.push('a');
        assert_eq!(text.len(), 3208);
        text
    }

    async fn open_session(source: Arc<FakeSource>, config: SessionConfig) -> ReadingSession {
        let store = Arc::new(MemoryPositionStore::new());
        ReadingSession::open(source.book_id, source, store, test_settings(), config)
            .await
            .expect("session opens")
    }

    // flip, servicing rebuild requests the way a UI would
    async fn flip_step(session: &ReadingSession, direction: FlipDirection) -> FlipOutcome {
        for _ in 0..10 {
            match session.flip(direction).await.expect("flip succeeds") {
                FlipOutcome::NeedsRebuild => session.rebuild().await,
                outcome => return outcome,
            }
        }
        panic!("flip kept demanding rebuilds");
    }

    // rebuild and poll until the list has content pages for every chapter
    async fn wait_until_loaded(session: &ReadingSession, chapter_ids: &[ChapterId]) {
        for _ in 0..200 {
            session.rebuild().await;
            let pages = session.virtual_pages().await;
            let all_loaded = chapter_ids.iter().all(|id| {
                pages.iter().any(|page| {
                    matches!(page, VirtualPage::Content { chapter_id, .. } if chapter_id == id)
                })
            });
            if all_loaded {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("preload never completed");
    }

    #[tokio::test]
    async fn fresh_session_starts_at_book_detail() {
        let source = FakeSource::new("fresh", &["hello world", "second"]);
        let session = open_session(Arc::clone(&source), test_config()).await;

        assert_eq!(session.current_page().await, Some(VirtualPage::BookDetail));
        let position = session.position().await;
        assert_eq!(position.page_index_within_chapter, -1);
        assert_eq!(position.chapter_progress, 0.0);
        assert_eq!(position.global_progress, 0.0);
    }

    #[tokio::test]
    async fn five_page_chapter_flips_through_and_crosses_into_next() {
        let text = five_page_text();
        let source = FakeSource::new("crossing", &[&text, "the next chapter"]);
        let session = open_session(Arc::clone(&source), test_config()).await;
        let chapter_a = source.chapter_id(0);
        let chapter_b = source.chapter_id(1);

        // book detail -> page 0
        let outcome = flip_step(&session, FlipDirection::Next).await;
        assert_eq!(
            outcome,
            FlipOutcome::PageChanged {
                page: VirtualPage::Content {
                    chapter_id: chapter_a,
                    page_index: 0,
                },
                needs_preload_check: true,
            }
        );

        // four flips from page 0 land on page 4, the last page
        for _ in 0..4 {
            flip_step(&session, FlipDirection::Next).await;
        }
        let position = session.position().await;
        assert_eq!(position.chapter_id, chapter_a);
        assert_eq!(position.page_index_within_chapter, 4);
        assert_eq!(position.chapter_progress, 1.0);

        // the fifth flip crosses into chapter B, page 0
        flip_step(&session, FlipDirection::Next).await;
        let position = session.position().await;
        assert_eq!(position.chapter_id, chapter_b);
        assert_eq!(position.page_index_within_chapter, 0);
    }

    #[tokio::test]
    async fn window_edge_flip_switches_chapter_explicitly() {
        let text = five_page_text();
        let source = FakeSource::new("explicit-switch", &[&text, "chapter two text"]);
        let config = SessionConfig {
            preload_window: 0,
            ..test_config()
        };
        let session = open_session(Arc::clone(&source), config).await;
        let chapter_b = source.chapter_id(1);

        for _ in 0..5 {
            flip_step(&session, FlipDirection::Next).await;
        }
        let outcome = flip_step(&session, FlipDirection::Next).await;
        match outcome {
            FlipOutcome::ChapterSwitched { chapter_id, page } => {
                assert_eq!(chapter_id, chapter_b);
                assert_eq!(
                    page,
                    VirtualPage::Content {
                        chapter_id: chapter_b,
                        page_index: 0,
                    }
                );
            }
            other => panic!("expected chapter switch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn switch_previous_lands_on_last_page() {
        let text = five_page_text();
        let source = FakeSource::new("switch-back", &[&text, "short second chapter"]);
        let config = SessionConfig {
            preload_window: 0,
            ..test_config()
        };
        let session = open_session(Arc::clone(&source), config).await;

        for _ in 0..6 {
            flip_step(&session, FlipDirection::Next).await;
        }
        assert_eq!(session.position().await.chapter_id, source.chapter_id(1));

        let outcome = flip_step(&session, FlipDirection::Previous).await;
        match outcome {
            FlipOutcome::ChapterSwitched { chapter_id, .. } => {
                assert_eq!(chapter_id, source.chapter_id(0));
            }
            other => panic!("expected chapter switch, got {:?}", other),
        }
        let position = session.position().await;
        assert_eq!(position.page_index_within_chapter, 4);
    }

    #[tokio::test]
    async fn rapid_flips_within_cooldown_are_dropped() {
        let source = FakeSource::new("debounce", &[&five_page_text()]);
        let config = SessionConfig {
            flip_debounce: Duration::from_secs(5),
            ..test_config()
        };
        let session = open_session(source, config).await;

        let first = flip_step(&session, FlipDirection::Next).await;
        assert!(matches!(first, FlipOutcome::PageChanged { .. }));
        let second = session.flip(FlipDirection::Next).await.unwrap();
        assert_eq!(second, FlipOutcome::NoOp(NoOpReason::Debounced));

        // exactly one committed transition
        let position = session.position().await;
        assert_eq!(position.page_index_within_chapter, 0);
    }

    #[tokio::test]
    async fn book_boundaries_are_terminal() {
        let source = FakeSource::new("terminal", &["only chapter"]);
        let session = open_session(source, test_config()).await;

        // book detail is the first unit; previous from it is a hard stop
        let outcome = session.flip(FlipDirection::Previous).await.unwrap();
        assert_eq!(outcome, FlipOutcome::NoOp(NoOpReason::AtBookStart));
        assert_eq!(session.current_page().await, Some(VirtualPage::BookDetail));

        // a one-page chapter: next, then next again hits the book end
        flip_step(&session, FlipDirection::Next).await;
        let outcome = session.flip(FlipDirection::Next).await.unwrap();
        assert_eq!(outcome, FlipOutcome::NoOp(NoOpReason::AtBookEnd));
        let position = session.position().await;
        assert_eq!(position.page_index_within_chapter, 0);
    }

    #[tokio::test]
    async fn preload_extends_the_virtual_list() {
        let source = FakeSource::new("preload", &["first chapter", "second chapter", "third"]);
        let session = open_session(Arc::clone(&source), test_config()).await;

        wait_until_loaded(&session, &[source.chapter_id(1), source.chapter_id(2)]).await;
        let pages = session.virtual_pages().await;
        let covers_second = pages.iter().any(|page| {
            matches!(page, VirtualPage::Content { chapter_id, .. } if *chapter_id == source.chapter_id(1))
        });
        assert!(covers_second, "second chapter not paginated: {:?}", pages);
    }

    #[tokio::test]
    async fn virtual_list_is_monotonic_in_book_order() {
        let source = FakeSource::new(
            "monotonic",
            &["alpha chapter", "beta chapter", "gamma chapter"],
        );
        let session = open_session(Arc::clone(&source), test_config()).await;
        wait_until_loaded(&session, &[source.chapter_id(1), source.chapter_id(2)]).await;

        let ordinal_of = |id: ChapterId| {
            source
                .chapters
                .iter()
                .position(|c| c.id == id)
                .expect("known chapter")
        };
        let pages = session.virtual_pages().await;
        let mut previous: Option<(usize, u32)> = None;
        for page in pages {
            let key = match page {
                VirtualPage::BookDetail => {
                    assert!(previous.is_none(), "book detail must come first");
                    continue;
                }
                VirtualPage::Content {
                    chapter_id,
                    page_index,
                } => (ordinal_of(chapter_id), page_index),
                VirtualPage::ChapterSection { chapter_id } => (ordinal_of(chapter_id), 0),
            };
            if let Some(previous) = previous {
                assert!(key > previous, "list not ordered: {:?} after {:?}", key, previous);
            }
            previous = Some(key);
        }
    }

    #[tokio::test]
    async fn failed_preload_retries_are_capped() {
        let text = five_page_text();
        let source = FakeSource::new("capped", &[&text, "unreachable chapter"]);
        let broken = source.chapter_id(1);
        source.set_failing(broken);
        let config = SessionConfig {
            preload_window: 1,
            ..test_config()
        };
        let session = open_session(Arc::clone(&source), config).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // bounce on and off the first page; every landing on a boundary
        // re-evaluates the preload window
        for _ in 0..5 {
            flip_step(&session, FlipDirection::Next).await;
            tokio::time::sleep(Duration::from_millis(30)).await;
            flip_step(&session, FlipDirection::Previous).await;
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        assert_eq!(source.fetch_count(broken), PRELOAD_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn steady_state_bounce_does_not_refetch() {
        let texts: Vec<String> = (0..12).map(|i| format!("chapter {} body", i)).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let source = FakeSource::new("bounce", &refs);
        let session = open_session(Arc::clone(&source), test_config()).await;

        // walk deep into the book, then a few chapters back, so streaks in
        // both directions have had their chance to widen the window
        for _ in 0..8 {
            flip_step(&session, FlipDirection::Next).await;
        }
        for _ in 0..3 {
            flip_step(&session, FlipDirection::Previous).await;
        }

        // let preloads settle until a bounce stops triggering fetches
        let mut settled = source.total_fetches();
        for _ in 0..5 {
            flip_step(&session, FlipDirection::Next).await;
            flip_step(&session, FlipDirection::Previous).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            let now = source.total_fetches();
            if now == settled {
                break;
            }
            settled = now;
        }

        // a stationary bounce over fully resident neighbors must not evict
        // and refetch anything
        let before = source.total_fetches();
        for _ in 0..6 {
            flip_step(&session, FlipDirection::Next).await;
            flip_step(&session, FlipDirection::Previous).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.total_fetches(), before);
    }

    #[tokio::test]
    async fn repeated_boundary_hits_widen_the_preload_window() {
        let source = FakeSource::new("widening", &["one", "two", "three", "four", "five"]);
        let config = SessionConfig {
            preload_window: 1,
            ..test_config()
        };
        let session = open_session(Arc::clone(&source), config).await;

        // one-page chapters: every landing is a boundary hit, and two in
        // the same direction earn an extra chapter of forward window
        flip_step(&session, FlipDirection::Next).await;
        flip_step(&session, FlipDirection::Next).await;
        {
            let st = session.state.lock().await;
            assert_eq!(st.extra_forward, 1);
            assert_eq!(st.extra_back, 0);
        }

        session.rebuild().await;
        {
            let st = session.state.lock().await;
            assert_eq!(st.current_ord, 1);
            assert_eq!(st.window, 0..4);
        }

        // reversing direction retires the widened span
        flip_step(&session, FlipDirection::Previous).await;
        let st = session.state.lock().await;
        assert_eq!(st.extra_forward, 0);
    }

    #[tokio::test]
    async fn unresolvable_position_falls_back_to_nearest_chapter_start() {
        let source = FakeSource::new("fallback", &["first text", "second text", "third text"]);
        let session = open_session(Arc::clone(&source), test_config()).await;
        flip_step(&session, FlipDirection::Next).await;
        assert_eq!(session.position().await.chapter_id, source.chapter_id(0));

        let mut st = session.state.lock().await;
        // hand the session a view that no longer covers its chapter, as
        // after an unexpected eviction
        st.list = VirtualPageList::build(&st.chapters, 1..3, &session.cache);
        session.fall_back_to_nearest(&mut st);

        assert_eq!(st.current_ord, 1);
        assert_eq!(st.current_page, 0);
        match st.list.get(st.cursor) {
            Some(VirtualPage::Content {
                chapter_id,
                page_index: 0,
            })
            | Some(VirtualPage::ChapterSection { chapter_id }) => {
                assert_eq!(chapter_id, source.chapter_id(1));
            }
            other => panic!("fell back to {:?}", other),
        }
    }

    #[tokio::test]
    async fn switch_waits_for_slow_but_successful_fetch() {
        let text = five_page_text();
        let source = FakeSource::new("slow-ok", &[&text, "arrives late"]);
        let slow = source.chapter_id(1);
        source.set_delay(slow, Duration::from_millis(60));
        let config = SessionConfig {
            preload_window: 0,
            ..test_config()
        };
        let session = open_session(Arc::clone(&source), config).await;

        for _ in 0..5 {
            flip_step(&session, FlipDirection::Next).await;
        }
        // the fetch outlives several wait polls but lands within the
        // timeout; the switch must report success, not unavailability
        let outcome = flip_step(&session, FlipDirection::Next).await;
        match outcome {
            FlipOutcome::ChapterSwitched { chapter_id, .. } => assert_eq!(chapter_id, slow),
            other => panic!("expected chapter switch, got {:?}", other),
        }
        assert_eq!(session.position().await.page_index_within_chapter, 0);
    }

    #[tokio::test]
    async fn switch_to_unreachable_chapter_surfaces_unavailable() {
        let text = five_page_text();
        let source = FakeSource::new("unreachable", &[&text, "never arrives"]);
        let broken = source.chapter_id(1);
        source.set_failing(broken);
        let config = SessionConfig {
            preload_window: 0,
            ..test_config()
        };
        let session = open_session(Arc::clone(&source), config).await;

        for _ in 0..5 {
            flip_step(&session, FlipDirection::Next).await;
        }
        let before = session.position().await;
        let result = session.flip(FlipDirection::Next).await;
        match result {
            Err(ReaderError::ChapterUnavailable(id)) => assert_eq!(id, broken),
            other => panic!("expected chapter unavailable, got {:?}", other),
        }
        // failed switch leaves the cursor where it was
        assert_eq!(session.position().await, before);
    }

    #[tokio::test]
    async fn slow_switch_times_out_as_noop() {
        let text = five_page_text();
        let source = FakeSource::new("slow", &[&text, "eventually"]);
        let slow = source.chapter_id(1);
        source.set_delay(slow, Duration::from_secs(30));
        let config = SessionConfig {
            preload_window: 0,
            switch_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let session = open_session(Arc::clone(&source), config).await;

        for _ in 0..5 {
            flip_step(&session, FlipDirection::Next).await;
        }
        let outcome = session.flip(FlipDirection::Next).await.unwrap();
        assert_eq!(outcome, FlipOutcome::NoOp(NoOpReason::SwitchTimedOut));
        assert_eq!(session.position().await.page_index_within_chapter, 4);
    }

    #[tokio::test]
    async fn settings_change_keeps_proportional_position() {
        let text = five_page_text();
        let source = FakeSource::new("reflow", &[&text]);
        let session = open_session(source, test_config()).await;

        for _ in 0..3 {
            flip_step(&session, FlipDirection::Next).await;
        }
        assert_eq!(session.position().await.page_index_within_chapter, 2);

        // halve the viewport width: 12-char lines, 360 bytes per page,
        // 3208 bytes now span 9 pages
        let mut narrow = test_settings();
        narrow.viewport_width = 72;
        session.apply_settings(narrow).await;

        let position = session.position().await;
        // page 2 of 5 is proportion 0.4; 0.4 * 9 rounds to page 4
        assert_eq!(position.page_index_within_chapter, 4);
        assert!(session.current_page_text().await.is_some());
    }

    #[tokio::test]
    async fn position_survives_reopening() {
        let text = five_page_text();
        let source = FakeSource::new("reopen", &[&text, "second chapter"]);
        let store = Arc::new(MemoryPositionStore::new());

        {
            let session = ReadingSession::open(
                source.book_id,
                Arc::clone(&source) as Arc<dyn ChapterSource>,
                Arc::clone(&store) as Arc<dyn PositionStore>,
                test_settings(),
                test_config(),
            )
            .await
            .unwrap();
            for _ in 0..4 {
                flip_step(&session, FlipDirection::Next).await;
            }
            session.close().await;
        }

        let session = ReadingSession::open(
            source.book_id,
            Arc::clone(&source) as Arc<dyn ChapterSource>,
            store,
            test_settings(),
            test_config(),
        )
        .await
        .unwrap();
        let position = session.position().await;
        assert_eq!(position.chapter_id, source.chapter_id(0));
        assert_eq!(position.page_index_within_chapter, 3);
    }

    #[tokio::test]
    async fn empty_book_fails_to_open() {
        let source = FakeSource::new("empty", &[]);
        let store = Arc::new(MemoryPositionStore::new());
        let result = ReadingSession::open(
            source.book_id,
            source,
            store,
            test_settings(),
            test_config(),
        )
        .await;
        assert!(matches!(result, Err(ReaderError::EmptyBook(_))));
    }

    #[test]
    fn page_count_cache_offsets_are_additive() {
        let book = book_id_for_key("additive");
        let chapters: Vec<Chapter> = (0..5)
            .map(|ordinal| Chapter {
                id: chapter_id_for(book, ordinal),
                ordinal,
                title: format!("Chapter {}", ordinal),
                is_paid: false,
            })
            .collect();
        let mut counts = PageCountCache::new(&chapters, 12);

        counts.correct(chapters[1].id, 5);
        counts.correct(chapters[3].id, 40);

        for pair in chapters.windows(2) {
            let a = counts.span(pair[0].id).unwrap();
            let b = counts.span(pair[1].id).unwrap();
            assert_eq!(b.start_global_page, a.start_global_page + a.page_count);
        }
        assert_eq!(counts.total_pages(), 12 + 5 + 12 + 40 + 12);
    }

    #[test]
    fn progress_fractions_stay_in_bounds() {
        let book = book_id_for_key("bounds");
        let chapters: Vec<Chapter> = (0..3)
            .map(|ordinal| Chapter {
                id: chapter_id_for(book, ordinal),
                ordinal,
                title: String::new(),
                is_paid: false,
            })
            .collect();
        let store = Arc::new(MemoryPositionStore::new());
        let tracker = ProgressTracker::new(store, &chapters, 10);
        tracker.record_page_count(chapters[0].id, 4);

        for chapter in &chapters {
            for page_index in [-1, 0, 3, 500] {
                let global = tracker.global_progress(chapter.id, page_index);
                let position = tracker.compute_position(
                    book,
                    chapter.id,
                    page_index,
                    FlipEffect::Slide,
                    global,
                );
                assert!((0.0..=1.0).contains(&position.chapter_progress));
                assert!((0.0..=1.0).contains(&position.global_progress));
            }
        }
    }

    #[test]
    fn book_detail_progress_is_zero() {
        let book = book_id_for_key("detail");
        let chapters = vec![Chapter {
            id: chapter_id_for(book, 0),
            ordinal: 0,
            title: String::new(),
            is_paid: false,
        }];
        let store = Arc::new(MemoryPositionStore::new());
        let tracker = ProgressTracker::new(Arc::clone(&store) as Arc<dyn PositionStore>, &chapters, 10);

        let position = tracker.save_progress(book, chapters[0].id, -1, FlipEffect::Slide, 0.0);
        assert_eq!(position.chapter_progress, 0.0);
        assert_eq!(position.global_page_index, 0);
        assert_eq!(store.load(book).unwrap(), Some(position));
    }

    #[test]
    fn virtual_list_builds_placeholders_for_unloaded_chapters() {
        let book = book_id_for_key("placeholders");
        let chapters: Vec<Chapter> = (0..3)
            .map(|ordinal| Chapter {
                id: chapter_id_for(book, ordinal),
                ordinal,
                title: String::new(),
                is_paid: false,
            })
            .collect();
        let cache = SessionCache::new(4);
        cache.insert(paginate(chapters[0].id, "resident text", &test_settings()));

        let list = VirtualPageList::build(&chapters, 0..3, &cache);
        assert_eq!(list.get(0), Some(VirtualPage::BookDetail));
        assert_eq!(
            list.get(1),
            Some(VirtualPage::Content {
                chapter_id: chapters[0].id,
                page_index: 0,
            })
        );
        assert_eq!(
            list.get(2),
            Some(VirtualPage::ChapterSection {
                chapter_id: chapters[1].id,
            })
        );
        assert_eq!(
            list.get(3),
            Some(VirtualPage::ChapterSection {
                chapter_id: chapters[2].id,
            })
        );
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn position_of_clamps_to_last_page_and_finds_sections() {
        let book = book_id_for_key("clamping");
        let chapters: Vec<Chapter> = (0..2)
            .map(|ordinal| Chapter {
                id: chapter_id_for(book, ordinal),
                ordinal,
                title: String::new(),
                is_paid: false,
            })
            .collect();
        let cache = SessionCache::new(4);
        let text = five_page_text();
        cache.insert(paginate(chapters[0].id, &text, &test_settings()));
        let list = VirtualPageList::build(&chapters, 0..2, &cache);

        assert_eq!(list.position_of(chapters[0].id, -1), Some(0));
        assert_eq!(list.position_of(chapters[0].id, 2), Some(3));
        // beyond the real count clamps to the chapter's last page
        assert_eq!(list.position_of(chapters[0].id, 99), Some(5));
        // the unloaded chapter resolves to its section placeholder
        assert_eq!(list.position_of(chapters[1].id, 3), Some(6));
        assert_eq!(list.position_of(chapter_id_for(book, 9), 0), None);
    }
}
