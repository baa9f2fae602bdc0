//! crcwatch store: render cache, sync cycle state and the Sync Loop owner task.
//!
//! One task owns the snapshot, the render cache and the filter.
//! Readers load published values through `ArcSwap` and follow the epoch
//! through a watch channel; writers send commands.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use crcwatch_api::{ApiError, ApiResult, DashboardApi};
use crcwatch_core::{CaseRunConfiguration, CrcId, Snapshot};
use crcwatch_search::{CancelScope, FilterController, FilterCriteria, FilterDebugInfo, MatchedSet};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

/// True when `new` differs from what was last rendered for its id.
pub fn should_render(old: Option<&CaseRunConfiguration>, new: &CaseRunConfiguration) -> bool {
    match old {
        Some(old) => old != new,
        None => true,
    }
}

/// Last rendered value per id. Entries are only ever replaced, never removed.
#[derive(Debug, Default)]
pub struct RenderCache {
    rendered: FxHashMap<CrcId, CaseRunConfiguration>,
}

impl RenderCache {
    pub fn new() -> Self { Self::default() }
    pub fn len(&self) -> usize { self.rendered.len() }
    pub fn is_empty(&self) -> bool { self.rendered.is_empty() }
    pub fn get(&self, id: &str) -> Option<&CaseRunConfiguration> { self.rendered.get(id) }

    /// Record `crc` if it is stale; returns whether it must be rendered.
    pub fn observe(&mut self, crc: &CaseRunConfiguration) -> bool {
        if !should_render(self.rendered.get(&crc.id), crc) {
            return false;
        }
        self.rendered.insert(crc.id.clone(), crc.clone());
        true
    }
}

/// Published filter state: criteria, matched ids and stage counts.
#[derive(Debug, Clone, Default)]
pub struct FilterView {
    pub criteria: FilterCriteria,
    pub matched: MatchedSet,
    pub active: bool,
    pub debug: FilterDebugInfo,
    /// Snapshot epoch the matched set was computed on.
    pub epoch: u64,
}

impl FilterView {
    fn from_controller(fc: &FilterController, epoch: u64) -> Self {
        Self {
            criteria: fc.criteria().clone(),
            matched: fc.matched().clone(),
            active: fc.is_active(),
            debug: fc.debug().clone(),
            epoch,
        }
    }

    pub fn is_visible(&self, id: &str) -> bool { !self.active || self.matched.contains(id) }

    /// What a cancel button means under this view; `None` is "cancel all".
    pub fn cancel_scope(&self, plan: Option<&str>) -> CancelScope {
        CancelScope::for_filter(self.active, &self.matched, plan)
    }
}

/// Render surface fed by the sync loop. Called only from the owner task.
pub trait RenderSink: Send + 'static {
    /// A record changed (or was seen for the first time).
    fn render(&mut self, crc: &CaseRunConfiguration);

    /// The matched set changed; rows outside it are hidden, not removed.
    fn apply_visibility(&mut self, _view: &FilterView) {}

    /// A cycle fetched nothing. Transient; the next tick retries.
    fn fetch_failed(&mut self, _err: &ApiError) {}
}

/// Outcome of applying one State Query response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub seq: u64,
    pub epoch: u64,
    pub items: usize,
    pub rendered: usize,
    /// Older than a response already applied; nothing changed.
    pub stale: bool,
}

/// Snapshot, render cache, filter and response ordering of the sync loop.
#[derive(Debug)]
pub struct SyncState {
    snapshot: Arc<Snapshot>,
    cache: RenderCache,
    filter: FilterController,
    last_seq: u64,
}

impl Default for SyncState {
    fn default() -> Self { Self::new() }
}

impl SyncState {
    pub fn new() -> Self {
        Self { snapshot: Arc::new(Snapshot::default()), cache: RenderCache::new(), filter: FilterController::new(), last_seq: 0 }
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> { &self.snapshot }
    pub fn cache(&self) -> &RenderCache { &self.cache }
    pub fn last_seq(&self) -> u64 { self.last_seq }

    pub fn filter_view(&self) -> FilterView { FilterView::from_controller(&self.filter, self.snapshot.epoch) }

    /// Replace the snapshot with `items` and render the changed records in
    /// server order. Responses issued before the last applied one are dropped.
    ///
    /// An active filter is re-evaluated on the new snapshot and handed to the
    /// sink before any record renders, so the sink knows what is hidden.
    pub fn apply_response(&mut self, seq: u64, items: Vec<CaseRunConfiguration>, sink: &mut dyn RenderSink) -> CycleReport {
        if seq <= self.last_seq {
            return CycleReport { seq, epoch: self.snapshot.epoch, items: items.len(), rendered: 0, stale: true };
        }
        self.last_seq = seq;
        let epoch = self.snapshot.epoch.saturating_add(1);
        let n = items.len();
        let snap = Arc::new(Snapshot::new(epoch, items));
        self.snapshot = Arc::clone(&snap);
        self.filter.on_snapshot(&snap);
        if self.filter.is_active() {
            sink.apply_visibility(&self.filter_view());
        }
        let mut rendered = 0usize;
        for crc in snap.items.iter() {
            if self.cache.observe(crc) {
                sink.render(crc);
                rendered += 1;
            }
        }
        CycleReport { seq, epoch, items: n, rendered, stale: false }
    }

    /// Replace the filter criteria; `None` clears them.
    pub fn set_filter(&mut self, criteria: Option<FilterCriteria>, sink: &mut dyn RenderSink) -> FilterView {
        match criteria {
            Some(criteria) => { self.filter.apply_filter(criteria, &self.snapshot); }
            None => self.filter.clear(&self.snapshot),
        }
        let view = self.filter_view();
        sink.apply_visibility(&view);
        view
    }
}

// ----------------- Sync loop -----------------

/// Sync loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Poll period; zero disables repetition after the initial fetch.
    pub interval: Duration,
    /// Command queue capacity; zero is raised to one.
    pub queue_cap: usize,
}

impl SyncConfig {
    /// `interval` plus the command queue capacity from `CRCWATCH_QUEUE_CAP`.
    pub fn from_env(interval: Duration) -> Self {
        let queue_cap = std::env::var("CRCWATCH_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(64);
        Self { interval, queue_cap: queue_cap.max(1) }
    }
}

impl Default for SyncConfig {
    fn default() -> Self { Self { interval: Duration::from_secs(1), queue_cap: 64 } }
}

/// Counters of the running loop, published after every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub epoch: u64,
    pub interval_ms: u64,
    pub paused: bool,
    pub issued: u64,
    pub cycles: u64,
    pub failures: u64,
    pub stale: u64,
    pub last_error: Option<String>,
}

#[derive(Debug)]
enum SyncCommand {
    SetInterval(Duration),
    SetPaused(bool),
    SetFilter(FilterCriteria),
    ClearFilter,
    RefreshNow,
    Stop,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync loop stopped")]
    Stopped,
}

/// Handle to a running sync loop.
pub struct SyncHandle {
    tx: mpsc::Sender<SyncCommand>,
    snap: Arc<ArcSwap<Snapshot>>,
    filter: Arc<ArcSwap<FilterView>>,
    status: Arc<ArcSwap<SyncStatus>>,
    epoch_rx: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn current(&self) -> Arc<Snapshot> { self.snap.load_full() }
    pub fn filter_view(&self) -> Arc<FilterView> { self.filter.load_full() }
    pub fn status(&self) -> Arc<SyncStatus> { self.status.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    async fn send(&self, cmd: SyncCommand) -> Result<(), SyncError> {
        self.tx.send(cmd).await.map_err(|_| SyncError::Stopped)
    }

    /// Cancel the pending timer and reschedule with `interval`; zero stops repetition.
    pub async fn set_interval(&self, interval: Duration) -> Result<(), SyncError> {
        self.send(SyncCommand::SetInterval(interval)).await
    }

    /// Suspend or resume timer-driven fetches; explicit refreshes still run.
    pub async fn set_paused(&self, paused: bool) -> Result<(), SyncError> {
        self.send(SyncCommand::SetPaused(paused)).await
    }

    pub async fn set_filter(&self, criteria: FilterCriteria) -> Result<(), SyncError> {
        self.send(SyncCommand::SetFilter(criteria)).await
    }

    pub async fn clear_filter(&self) -> Result<(), SyncError> {
        self.send(SyncCommand::ClearFilter).await
    }

    /// Issue one fetch now, independent of the timer.
    pub async fn refresh_now(&self) -> Result<(), SyncError> {
        self.send(SyncCommand::RefreshNow).await
    }

    /// Stop the loop and wait for the owner task to exit.
    pub async fn stop(self) {
        let _ = self.tx.send(SyncCommand::Stop).await;
        let _ = self.task.await;
    }
}

fn make_ticker(interval: Duration) -> Option<Interval> {
    if interval.is_zero() {
        return None;
    }
    let mut t = tokio::time::interval_at(Instant::now() + interval, interval);
    t.set_missed_tick_behavior(MissedTickBehavior::Skip);
    Some(t)
}

async fn next_tick(ticker: &mut Option<Interval>, paused: bool) {
    match ticker {
        Some(t) if !paused => { t.tick().await; }
        _ => std::future::pending::<()>().await,
    }
}

type FetchResult = (u64, ApiResult<Vec<CaseRunConfiguration>>);

// Fetches are not serialized; ordering is restored by sequence number.
fn issue_fetch(api: &Arc<dyn DashboardApi>, out: &mpsc::Sender<FetchResult>, next_seq: &mut u64) {
    *next_seq += 1;
    let seq = *next_seq;
    let api = Arc::clone(api);
    let out = out.clone();
    tokio::spawn(async move {
        let res = api.fetch_state().await;
        let _ = out.send((seq, res)).await;
    });
}

/// Spawn the sync loop. The first fetch is issued immediately, whatever the
/// interval.
pub fn spawn_sync<S: RenderSink>(api: Arc<dyn DashboardApi>, mut sink: S, cfg: SyncConfig) -> SyncHandle {
    let cap = cfg.queue_cap.max(1);
    let (tx, mut rx) = mpsc::channel::<SyncCommand>(cap);
    let (res_tx, mut res_rx) = mpsc::channel::<FetchResult>(cap);
    let snap = Arc::new(ArcSwap::from_pointee(Snapshot::default()));
    let filter = Arc::new(ArcSwap::from_pointee(FilterView::default()));
    let status = Arc::new(ArcSwap::from_pointee(SyncStatus {
        interval_ms: cfg.interval.as_millis() as u64,
        ..Default::default()
    }));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let (snap_w, filter_w, status_w) = (Arc::clone(&snap), Arc::clone(&filter), Arc::clone(&status));

    let task = tokio::spawn(async move {
        let mut state = SyncState::new();
        let mut st = SyncStatus { interval_ms: cfg.interval.as_millis() as u64, ..Default::default() };
        let mut ticker = make_ticker(cfg.interval);
        let mut next_seq = 0u64;
        info!(interval_ms = st.interval_ms, "sync: loop started");
        issue_fetch(&api, &res_tx, &mut next_seq);
        st.issued = next_seq;
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        None | Some(SyncCommand::Stop) => break,
                        Some(SyncCommand::SetInterval(interval)) => {
                            ticker = make_ticker(interval);
                            st.interval_ms = interval.as_millis() as u64;
                            info!(interval_ms = st.interval_ms, "sync: interval reconfigured");
                        }
                        Some(SyncCommand::SetPaused(paused)) => {
                            st.paused = paused;
                            info!(paused, "sync: autorefresh toggled");
                        }
                        Some(SyncCommand::SetFilter(criteria)) => {
                            filter_w.store(Arc::new(state.set_filter(Some(criteria), &mut sink)));
                        }
                        Some(SyncCommand::ClearFilter) => {
                            filter_w.store(Arc::new(state.set_filter(None, &mut sink)));
                        }
                        Some(SyncCommand::RefreshNow) => {
                            issue_fetch(&api, &res_tx, &mut next_seq);
                            st.issued = next_seq;
                        }
                    }
                }
                _ = next_tick(&mut ticker, st.paused) => {
                    issue_fetch(&api, &res_tx, &mut next_seq);
                    st.issued = next_seq;
                }
                Some((seq, res)) = res_rx.recv() => {
                    match res {
                        Ok(items) => {
                            let report = state.apply_response(seq, items, &mut sink);
                            if report.stale {
                                st.stale += 1;
                                metrics::counter!("sync_stale_responses_total", 1u64);
                                debug!(seq, applied = state.last_seq(), "sync: stale response discarded");
                            } else {
                                st.cycles += 1;
                                st.epoch = report.epoch;
                                st.last_error = None;
                                metrics::counter!("sync_cycles_total", 1u64);
                                metrics::counter!("sync_rendered_total", report.rendered as u64);
                                metrics::gauge!("snapshot_items", report.items as f64);
                                debug!(seq, epoch = report.epoch, items = report.items, rendered = report.rendered, "sync: cycle applied");
                                filter_w.store(Arc::new(state.filter_view()));
                                snap_w.store(Arc::clone(state.snapshot()));
                                let _ = epoch_tx.send(report.epoch);
                            }
                        }
                        Err(err) => {
                            st.failures += 1;
                            st.last_error = Some(err.to_string());
                            metrics::counter!("sync_fetch_failures_total", 1u64);
                            debug!(seq, error = %err, "sync: fetch failed; next tick retries");
                            sink.fetch_failed(&err);
                        }
                    }
                }
            }
            status_w.store(Arc::new(st.clone()));
        }
        info!(cycles = st.cycles, failures = st.failures, "sync: loop stopped");
    });

    SyncHandle { tx, snap, filter, status, epoch_rx, task }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder { rendered: Vec<CrcId> }

    impl RenderSink for Recorder {
        fn render(&mut self, crc: &CaseRunConfiguration) { self.rendered.push(crc.id.clone()); }
    }

    fn crc(id: &str, state: &str) -> CaseRunConfiguration {
        CaseRunConfiguration {
            id: id.into(),
            state: state.into(),
            running_for: std::iter::once("planA".to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn first_sight_and_any_field_change_render() {
        let a = crc("1", "running");
        assert!(should_render(None, &a));
        assert!(!should_render(Some(&a), &a));
        let mut b = a.clone();
        b.active = true;
        assert!(should_render(Some(&a), &b));
        let mut c = a.clone();
        c.display_status = "**x**".into();
        assert!(should_render(Some(&a), &c));
    }

    #[test]
    fn observe_is_idempotent() {
        let mut cache = RenderCache::new();
        let a = crc("1", "running");
        assert!(cache.observe(&a));
        assert!(!cache.observe(&a));
        assert!(!cache.observe(&a.clone()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn identical_snapshot_in_any_order_renders_nothing() {
        let mut st = SyncState::new();
        let mut sink = Recorder::default();
        let r1 = st.apply_response(1, vec![crc("1", "queued"), crc("2", "running")], &mut sink);
        assert_eq!(r1.rendered, 2);
        let r2 = st.apply_response(2, vec![crc("2", "running"), crc("1", "queued")], &mut sink);
        assert_eq!(r2.rendered, 0);
        assert_eq!(r2.epoch, 2);
        assert_eq!(sink.rendered, vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn changed_records_render_in_server_order() {
        let mut st = SyncState::new();
        let mut sink = Recorder::default();
        st.apply_response(1, vec![crc("1", "queued"), crc("2", "queued"), crc("3", "queued")], &mut sink);
        sink.rendered.clear();
        st.apply_response(2, vec![crc("3", "running"), crc("2", "queued"), crc("1", "running")], &mut sink);
        assert_eq!(sink.rendered, vec!["3".to_string(), "1".to_string()]);
    }

    #[test]
    fn disappeared_ids_stay_cached_but_leave_the_snapshot() {
        let mut st = SyncState::new();
        let mut sink = Recorder::default();
        st.apply_response(1, vec![crc("1", "queued"), crc("2", "queued")], &mut sink);
        st.apply_response(2, vec![crc("2", "queued")], &mut sink);
        assert!(!st.snapshot().contains("1"));
        assert!(st.cache().get("1").is_some());
        // Reappearing unchanged does not render again.
        let r = st.apply_response(3, vec![crc("1", "queued"), crc("2", "queued")], &mut sink);
        assert_eq!(r.rendered, 0);
    }

    #[test]
    fn stale_responses_are_dropped() {
        let mut st = SyncState::new();
        let mut sink = Recorder::default();
        st.apply_response(2, vec![crc("1", "running")], &mut sink);
        let r = st.apply_response(1, vec![crc("1", "queued")], &mut sink);
        assert!(r.stale);
        assert_eq!(r.rendered, 0);
        assert_eq!(st.snapshot().get("1").map(|c| c.state.as_str()), Some("running"));
        assert_eq!(st.last_seq(), 2);
    }

    #[derive(Default)]
    struct Visibility { log: Vec<String>, view: FilterView }

    impl RenderSink for Visibility {
        fn render(&mut self, crc: &CaseRunConfiguration) {
            let shown = if self.view.is_visible(&crc.id) { "shown" } else { "hidden" };
            self.log.push(format!("{} {}", crc.id, shown));
        }
        fn apply_visibility(&mut self, view: &FilterView) {
            self.view = view.clone();
            self.log.push(format!("view {}", view.matched.ids().join(",")));
        }
    }

    #[test]
    fn new_ids_render_after_the_filter_saw_them() {
        let mut st = SyncState::new();
        let mut sink = Visibility::default();
        st.apply_response(1, vec![crc("1", "queued")], &mut sink);
        let view = st.set_filter(Some(FilterCriteria::parse("state:queued")), &mut sink);
        assert_eq!(view.matched.ids(), &["1".to_string()]);
        sink.log.clear();
        st.apply_response(2, vec![crc("1", "queued"), crc("2", "running"), crc("3", "queued")], &mut sink);
        assert_eq!(sink.log, vec!["view 1,3".to_string(), "2 hidden".to_string(), "3 shown".to_string()]);
        let view = st.set_filter(None, &mut sink);
        assert!(!view.active);
        assert!(sink.view.is_visible("2"));
    }

    #[test]
    fn filter_view_hides_only_when_active() {
        let view = FilterView::default();
        assert!(view.is_visible("anything"));
        let view = FilterView { active: true, matched: MatchedSet::from_ids(vec!["1".to_string()]), ..Default::default() };
        assert!(view.is_visible("1"));
        assert!(!view.is_visible("2"));
    }
}
