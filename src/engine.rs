// =============================================================================
// Engine — process-wide owner of every subsystem, with an explicit lifecycle
// =============================================================================
//
// One struct holding every subsystem behind `Arc`, generalized away from
// module-level globals into a constructible, stoppable unit: no "monitor"/
// "mtf engine" singletons, one `Engine` with `start()`/`stop()` that
// guarantees every spawned task and outbound connection is released on
// every exit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregator::{Aggregator, Tick};
use crate::backtest::{BacktestReport, BacktestSimulator};
use crate::candle_store::CandleStore;
use crate::config::RuntimeConfig;
use crate::csv_import;
use crate::detector::{ConfirmOutcome, SignalDetector};
use crate::error::EngineError;
use crate::event_bus::{Event, EventBus, Subscriber};
use crate::feed::{self, FeedHandle, FeedMessage};
use crate::indicators::IndicatorEngine;
use crate::micro_stream::{BookLevel, MicroStream, OrderbookEvent, TradeEvent};
use crate::mtf::{ConfluenceInputs, MtfStateMachine};
use crate::scalp_card::ScalpCardComposer;
use crate::types::{MicroSnapshot, MtfConfluence, MtfState, ScalpCard, Side, Signal, Timeframe};
use crate::veto::VetoEvaluator;

/// Timeframes the confluence scorer needs context from, in addition to the
/// detector's own M5 series. Every active timeframe gets its own
/// `Aggregator`, each folding the same tick stream into its own disjoint
/// `CandleStore` slot — the single-writer-per-timeframe rule is satisfied by
/// construction since no two aggregators ever touch the same slot.
const CONTEXT_TIMEFRAMES: &[Timeframe] = &[
    Timeframe::M1,
    Timeframe::M5,
    Timeframe::M15,
    Timeframe::H1,
    Timeframe::H4,
    Timeframe::D1,
];

#[derive(Debug, Clone, Serialize)]
pub struct DataStatus {
    pub loaded: bool,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveStatus {
    pub running: bool,
    pub last_price: f64,
    pub candles_count: usize,
    pub reconnects: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MtfStatus {
    pub running: bool,
    pub state: MtfState,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub running: bool,
    pub reconnects: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub rows: usize,
    pub columns: usize,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScalpCardResponse {
    pub card: Option<ScalpCard>,
    pub message: Option<String>,
    pub veto: Option<crate::types::VetoSet>,
}

/// Background tasks the engine spawns on `start()`. Held here so `stop()`
/// can abort every one of them on every exit path, rather than leaking
/// tasks if the caller forgets to tear anything down individually.
struct Tasks {
    detector_loop: Option<JoinHandle<()>>,
    mtf_tick_loop: Option<JoinHandle<()>>,
    price_feed: Option<FeedHandle>,
    micro_feed: Option<FeedHandle>,
}

impl Tasks {
    fn empty() -> Self {
        Self {
            detector_loop: None,
            mtf_tick_loop: None,
            price_feed: None,
            micro_feed: None,
        }
    }

    fn abort_all(&mut self) {
        if let Some(h) = self.detector_loop.take() {
            h.abort();
        }
        if let Some(h) = self.mtf_tick_loop.take() {
            h.abort();
        }
        if let Some(f) = self.price_feed.take() {
            f.stop();
        }
        if let Some(f) = self.micro_feed.take() {
            f.stop();
        }
    }
}

pub struct Engine {
    // `Arc`-wrapped so the same cell can be cloned into the detector task
    // spawned by `live_start`: task writes and API reads must land on one
    // shared allocation, not a snapshot taken at spawn time.
    config: Arc<RwLock<RuntimeConfig>>,
    config_path: String,

    candles: Arc<CandleStore>,
    aggregators: Mutex<HashMap<Timeframe, Aggregator>>,
    last_m5_closed_epoch: RwLock<Option<i64>>,

    micro: Arc<MicroStream>,
    mtf: Arc<MtfStateMachine>,
    bus: Arc<EventBus>,

    last_signal: Arc<RwLock<Option<Signal>>>,
    last_card: Arc<RwLock<Option<ScalpCard>>>,
    last_confluence: Arc<RwLock<Option<MtfConfluence>>>,
    backtests: RwLock<HashMap<Uuid, BacktestReport>>,

    kill_switch: Arc<AtomicBool>,
    live_running: AtomicBool,
    stream_running: AtomicBool,
    mtf_running: AtomicBool,

    tasks: Mutex<Tasks>,
}

impl Engine {
    pub fn new(config: RuntimeConfig, config_path: impl Into<String>) -> Self {
        let candle_cap = config.candle_history_cap;
        let staleness_ms = config.staleness_ms;
        let depth_levels = config.depth_levels;
        let subscriber_buffer = config.subscriber_buffer;
        let mtf_params = config.mtf_params.clone();

        let mut aggregators = HashMap::new();
        for tf in CONTEXT_TIMEFRAMES {
            aggregators.insert(*tf, Aggregator::new(*tf));
        }

        Self {
            config: Arc::new(RwLock::new(config)),
            config_path: config_path.into(),
            candles: Arc::new(CandleStore::new(candle_cap)),
            aggregators: Mutex::new(aggregators),
            last_m5_closed_epoch: RwLock::new(None),
            micro: Arc::new(MicroStream::new(staleness_ms, depth_levels)),
            mtf: Arc::new(MtfStateMachine::new(mtf_params)),
            bus: Arc::new(EventBus::new(subscriber_buffer)),
            last_signal: Arc::new(RwLock::new(None)),
            last_card: Arc::new(RwLock::new(None)),
            last_confluence: Arc::new(RwLock::new(None)),
            backtests: RwLock::new(HashMap::new()),
            kill_switch: Arc::new(AtomicBool::new(false)),
            live_running: AtomicBool::new(false),
            stream_running: AtomicBool::new(false),
            mtf_running: AtomicBool::new(false),
            tasks: Mutex::new(Tasks::empty()),
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn subscribe(&self) -> Subscriber {
        self.bus.subscribe()
    }

    // ── Configuration ────────────────────────────────────────────────────

    pub fn config_snapshot(&self) -> RuntimeConfig {
        self.config.read().clone()
    }

    /// Hot-replace the runtime config and persist it atomically. Does not
    /// affect already-running ingest tasks' feed URLs (those are fixed for
    /// the lifetime of a `live_start`/`stream_start` call); strategy/veto/MTF
    /// parameter changes take effect on the next detector/MTF cycle.
    pub fn update_config(&self, new_config: RuntimeConfig) -> Result<(), EngineError> {
        new_config
            .backtest_params
            .validate()
            .map_err(EngineError::Config)?;
        *self.config.write() = new_config;
        if let Err(e) = self.config.read().save(&self.config_path) {
            warn!(error = %e, "failed to persist updated config");
        }
        Ok(())
    }

    // ── CSV import ───────────────────────────────────────────────────────

    pub fn upload_csv(&self, content: &str) -> Result<UploadResult, EngineError> {
        let max_rows = self.config.read().csv_max_rows;
        let bars = csv_import::parse_csv(content, max_rows)?;
        let rows = bars.len();

        self.candles.reset();
        for bar in bars {
            self.candles
                .append(Timeframe::M5, bar)
                .map_err(EngineError::Internal)?;
        }

        info!(rows, "CSV import loaded into CandleStore");
        Ok(UploadResult {
            rows,
            columns: 6,
            success: true,
            message: format!("loaded {rows} bars"),
        })
    }

    pub fn data_status(&self) -> DataStatus {
        let count = self.candles.size(Timeframe::M5);
        DataStatus {
            loaded: count > 0,
            count,
        }
    }

    // ── Signals / scalp card / stream snapshot ──────────────────────────

    pub fn signals_latest(&self) -> Result<Signal, EngineError> {
        self.last_signal
            .read()
            .clone()
            .ok_or(EngineError::NoSignal)
    }

    /// Stateless one-shot Stage 1 + Stage 2 scan over the closed M5 series
    /// using caller-supplied parameter overrides. Unlike the live pipeline
    /// this doesn't touch the `MtfStateMachine` —
    /// it answers "is there a confirmed signal in the data we already have"
    /// rather than advancing any running state.
    pub fn signals_latest_with_params(
        &self,
        params: &crate::config::StrategyParams,
    ) -> Result<Signal, EngineError> {
        let candidate = SignalDetector::scan_candidate(&self.candles, params)?
            .ok_or(EngineError::NoSignal)?;
        match SignalDetector::confirm(&candidate, &self.candles, params)? {
            ConfirmOutcome::Confirmed(signal) => Ok(signal),
            ConfirmOutcome::Pending | ConfirmOutcome::Expired => Err(EngineError::NoSignal),
        }
    }

    pub fn scalp_card(&self, force: bool) -> ScalpCardResponse {
        self.scalp_card_response(self.last_card.read().clone(), force)
    }

    /// Recomputes the veto set against the latest signal and the *current*
    /// `MicroSnapshot` using the caller's `enable_micro_gate` flag, rather
    /// than returning whatever gate setting was in effect when the card was
    /// first composed live.
    pub fn scalp_card_with_gate(&self, enable_micro_gate: bool, force: bool) -> ScalpCardResponse {
        let signal = match self.last_signal.read().clone() {
            Some(s) => s,
            None => {
                return ScalpCardResponse {
                    card: None,
                    message: Some("no signal".to_string()),
                    veto: None,
                }
            }
        };

        let cfg = self.config_snapshot();
        let bars = self.candles.all(Timeframe::M5);
        let confirm_bar = bars.get(signal.confirm_index).copied();
        let micro_snap = self.micro.snapshot(now_micros());

        let veto = match (enable_micro_gate, confirm_bar) {
            (true, Some(bar)) => {
                let indicators = IndicatorEngine::snapshot_at(&bars, signal.confirm_index);
                let risk_distance = (signal.entry - signal.stop_loss).abs();
                VetoEvaluator::evaluate(
                    &bar,
                    &indicators,
                    &micro_snap,
                    signal.side,
                    risk_distance,
                    self.kill_switch.load(Ordering::SeqCst),
                    &cfg.veto_params,
                )
            }
            _ => crate::types::VetoSet::new(),
        };

        let tier = self
            .last_confluence
            .read()
            .as_ref()
            .map(|c| c.final_.tier)
            .unwrap_or(crate::types::Tier::Skip);

        let card = ScalpCardComposer::compose(
            &cfg.symbol,
            "maker-post-only",
            tier,
            &signal,
            &veto,
            &micro_snap,
            &cfg.strategy_params,
        );
        self.scalp_card_response(Some(card), force)
    }

    fn scalp_card_response(&self, card: Option<ScalpCard>, force: bool) -> ScalpCardResponse {
        match card {
            Some(card) if force => ScalpCardResponse {
                card: Some(card),
                message: None,
                veto: None,
            },
            Some(card) if card.checks.micro_veto.is_empty() => ScalpCardResponse {
                card: Some(card),
                message: None,
                veto: None,
            },
            Some(card) => ScalpCardResponse {
                card: None,
                message: Some("vetoed".to_string()),
                veto: Some(card.checks.micro_veto),
            },
            None => ScalpCardResponse {
                card: None,
                message: Some("no signal".to_string()),
                veto: None,
            },
        }
    }

    pub fn stream_snapshot(&self) -> MicroSnapshot {
        self.micro.snapshot(now_micros())
    }

    // ── Live pipeline ────────────────────────────────────────────────────

    pub fn live_start(&self, feed_url: &str) -> Result<(), EngineError> {
        if self.live_running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Config("live pipeline already running".to_string()));
        }

        let candles = self.candles.clone();
        let aggregators_cell: Arc<Mutex<HashMap<Timeframe, Aggregator>>> =
            Arc::new(Mutex::new(std::mem::take(&mut *self.aggregators.lock())));
        let last_closed = Arc::new(RwLock::new(*self.last_m5_closed_epoch.read()));
        let detector_notify = Arc::new(tokio::sync::Notify::new());
        let notify_for_feed = detector_notify.clone();
        let last_closed_for_feed = last_closed.clone();

        let handle = feed::spawn(feed_url.to_string(), move |msg| {
            if let FeedMessage::Trade {
                epoch_micros,
                price,
                size,
                ..
            } = msg
            {
                let tick = Tick {
                    epoch_micros,
                    price,
                    size,
                };
                let mut aggs = aggregators_cell.lock();
                for tf in CONTEXT_TIMEFRAMES {
                    if let Some(agg) = aggs.get_mut(tf) {
                        agg.on_tick(tick, &candles);
                    }
                }
                drop(aggs);

                if let Some(closed) = candles.last_closed(Timeframe::M5) {
                    let mut last = last_closed_for_feed.write();
                    if *last != Some(closed.epoch_start) {
                        *last = Some(closed.epoch_start);
                        notify_for_feed.notify_one();
                    }
                }
            }
        });

        let engine_candles = self.candles.clone();
        let engine_mtf = self.mtf.clone();
        let engine_micro = self.micro.clone();
        let engine_bus = self.bus.clone();
        let config = self.config_snapshot_handle();
        let last_signal = self.last_signal_handle();
        let last_card = self.last_card_handle();
        let last_confluence = self.last_confluence_handle();
        let kill_switch = self.kill_switch_handle();

        let detector_task = tokio::spawn(async move {
            loop {
                detector_notify.notified().await;
                let now = now_epoch();
                run_detector_cycle(
                    &engine_candles,
                    &engine_mtf,
                    &engine_micro,
                    &engine_bus,
                    &config,
                    &last_signal,
                    &last_card,
                    &last_confluence,
                    &kill_switch,
                    now,
                );
            }
        });

        let mtf_for_tick = self.mtf.clone();
        let bus_for_tick = self.bus.clone();
        let tick_loop = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                interval.tick().await;
                let phase = mtf_for_tick.on_tick(now_epoch());
                bus_for_tick.publish(Event::State(mtf_for_tick.snapshot()));
                let _ = phase;
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.price_feed = Some(handle);
        tasks.detector_loop = Some(detector_task);
        tasks.mtf_tick_loop = Some(tick_loop);
        self.mtf_running.store(true, Ordering::SeqCst);

        info!(url = feed_url, "live pipeline started");
        Ok(())
    }

    pub fn live_stop(&self) {
        if !self.live_running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock();
        if let Some(f) = tasks.price_feed.take() {
            f.stop();
        }
        if let Some(h) = tasks.detector_loop.take() {
            h.abort();
        }
        if let Some(h) = tasks.mtf_tick_loop.take() {
            h.abort();
        }
        self.mtf_running.store(false, Ordering::SeqCst);
        info!("live pipeline stopped");
    }

    pub fn live_status(&self) -> LiveStatus {
        let reconnects = self
            .tasks
            .lock()
            .price_feed
            .as_ref()
            .map(|f| f.reconnect_count())
            .unwrap_or(0);
        LiveStatus {
            running: self.live_running.load(Ordering::SeqCst),
            last_price: self.micro.snapshot(now_micros()).last_trade_price,
            candles_count: self.candles.size(Timeframe::M5),
            reconnects,
        }
    }

    // ── MTF status / confluence ──────────────────────────────────────────

    pub fn mtf_start(&self) {
        self.mtf_running.store(true, Ordering::SeqCst);
    }

    pub fn mtf_stop(&self) {
        self.mtf_running.store(false, Ordering::SeqCst);
    }

    pub fn mtf_status(&self) -> MtfStatus {
        MtfStatus {
            running: self.mtf_running.load(Ordering::SeqCst),
            state: self.mtf.snapshot(),
        }
    }

    pub fn mtf_confluence(&self) -> Result<MtfConfluence, EngineError> {
        self.last_confluence.read().clone().ok_or(EngineError::NoSignal)
    }

    // ── Microstructure stream ────────────────────────────────────────────

    pub fn stream_start(&self, feed_url: &str) -> Result<(), EngineError> {
        if self.stream_running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Config("micro stream already running".to_string()));
        }
        let micro = self.micro.clone();
        let handle = feed::spawn(feed_url.to_string(), move |msg| match msg {
            FeedMessage::Trade {
                epoch_micros,
                price,
                size,
                side,
            } => {
                micro.on_trade(TradeEvent {
                    epoch_micros,
                    price,
                    size,
                    side,
                });
            }
            FeedMessage::Orderbook {
                epoch_micros,
                bids,
                asks,
            } => {
                let bids: Vec<BookLevel> = bids
                    .iter()
                    .map(|[p, s]| BookLevel { price: *p, size: *s })
                    .collect();
                let asks: Vec<BookLevel> = asks
                    .iter()
                    .map(|[p, s]| BookLevel { price: *p, size: *s })
                    .collect();
                micro.on_orderbook(OrderbookEvent {
                    epoch_micros,
                    bids: &bids,
                    asks: &asks,
                });
            }
        });
        self.tasks.lock().micro_feed = Some(handle);
        info!(url = feed_url, "micro stream started");
        Ok(())
    }

    pub fn stream_stop(&self) {
        if !self.stream_running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(f) = self.tasks.lock().micro_feed.take() {
            f.stop();
        }
        info!("micro stream stopped");
    }

    pub fn stream_status(&self) -> StreamStatus {
        let reconnects = self
            .tasks
            .lock()
            .micro_feed
            .as_ref()
            .map(|f| f.reconnect_count())
            .unwrap_or(0);
        StreamStatus {
            running: self.stream_running.load(Ordering::SeqCst),
            reconnects,
        }
    }

    // ── Backtest ─────────────────────────────────────────────────────────

    pub fn run_backtest(
        &self,
        bars: Option<Vec<crate::types::Bar>>,
    ) -> Result<(Uuid, BacktestReport), EngineError> {
        let config = self.config_snapshot();
        let bars = bars.unwrap_or_else(|| self.candles.all(Timeframe::M5));
        let report = BacktestSimulator::run(&bars, &config.strategy_params, &config.backtest_params)?;
        let id = Uuid::new_v4();
        self.backtests.write().insert(id, report.clone());
        Ok((id, report))
    }

    pub fn get_backtest(&self, id: Uuid) -> Result<BacktestReport, EngineError> {
        self.backtests
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::BadInput(format!("unknown backtest id {id}")))
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// No outbound connections are opened until `live_start`/`stream_start`
    /// are called explicitly; `start()` only readies in-process state.
    pub fn start(&self) {
        info!("engine started");
    }

    /// Tear down every spawned task and outbound connection, on every exit
    /// path, then persist the current config.
    pub fn stop(&self) {
        self.live_stop();
        self.stream_stop();
        self.tasks.lock().abort_all();
        if let Err(e) = self.config.read().save(&self.config_path) {
            warn!(error = %e, "failed to persist config on shutdown");
        }
        info!("engine stopped");
    }

    // ── Internal handle helpers (share the cell with background tasks) ──
    //
    // These clone the `Arc`, not the value: the detector task spawned by
    // `live_start` writes through the same cell these handles point at, so
    // `config_snapshot`/`signals_latest`/`scalp_card`/`mtf_confluence` (which
    // read `self.config`/`self.last_signal`/`self.last_card`/
    // `self.last_confluence` directly) observe the live pipeline's writes
    // and hot-reloaded config changes, rather than a copy frozen at
    // `live_start` time.

    fn config_snapshot_handle(&self) -> Arc<RwLock<RuntimeConfig>> {
        self.config.clone()
    }
    fn last_signal_handle(&self) -> Arc<RwLock<Option<Signal>>> {
        self.last_signal.clone()
    }
    fn last_card_handle(&self) -> Arc<RwLock<Option<ScalpCard>>> {
        self.last_card.clone()
    }
    fn last_confluence_handle(&self) -> Arc<RwLock<Option<MtfConfluence>>> {
        self.last_confluence.clone()
    }
    fn kill_switch_handle(&self) -> Arc<AtomicBool> {
        self.kill_switch.clone()
    }
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn now_micros() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// One pass of Stage 1 / Stage 2 / MTF scoring, run whenever the M5
/// aggregator closes a new bar. Owns no state of its own — everything it
/// touches is passed in by reference so it can run on the detector task
/// without holding `Engine`'s lock across the call.
#[allow(clippy::too_many_arguments)]
fn run_detector_cycle(
    candles: &CandleStore,
    mtf: &MtfStateMachine,
    micro: &MicroStream,
    bus: &EventBus,
    config: &RwLock<RuntimeConfig>,
    last_signal: &RwLock<Option<Signal>>,
    last_card: &RwLock<Option<ScalpCard>>,
    last_confluence: &RwLock<Option<MtfConfluence>>,
    kill_switch: &AtomicBool,
    now: i64,
) {
    let cfg = config.read().clone();

    match mtf.phase() {
        crate::types::MtfPhase::Idle => {
            match SignalDetector::scan_candidate(candles, &cfg.strategy_params) {
                Ok(Some(candidate)) => {
                    mtf.on_new_candidate(candidate, now);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "scan_candidate failed"),
            }
        }
        crate::types::MtfPhase::Candidate => {
            let candidate = match mtf.snapshot().candidate {
                Some(c) => c,
                None => return,
            };
            match SignalDetector::confirm(&candidate, candles, &cfg.strategy_params) {
                Ok(ConfirmOutcome::Pending) => {}
                Ok(ConfirmOutcome::Expired) => {
                    mtf.on_tick(now);
                }
                Ok(ConfirmOutcome::Confirmed(signal)) => {
                    on_confirmed(
                        signal, candles, mtf, micro, bus, &cfg, last_signal, last_card,
                        last_confluence, kill_switch, now,
                    );
                }
                Err(e) => warn!(error = %e, "confirm failed"),
            }
        }
        _ => {
            mtf.on_tick(now);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn on_confirmed(
    signal: Signal,
    candles: &CandleStore,
    mtf: &MtfStateMachine,
    micro: &MicroStream,
    bus: &EventBus,
    cfg: &RuntimeConfig,
    last_signal: &RwLock<Option<Signal>>,
    last_card: &RwLock<Option<ScalpCard>>,
    last_confluence: &RwLock<Option<MtfConfluence>>,
    kill_switch: &AtomicBool,
    now: i64,
) {
    let bars = candles.all(Timeframe::M5);
    let confirm_bar = match bars.get(signal.confirm_index) {
        Some(b) => *b,
        None => return,
    };
    let indicators = IndicatorEngine::snapshot_at(&bars, signal.confirm_index);
    let micro_snap = micro.snapshot(now_micros());
    let risk_distance = (signal.entry - signal.stop_loss).abs();

    let veto = if cfg.enable_micro_gate {
        VetoEvaluator::evaluate(
            &confirm_bar,
            &indicators,
            &micro_snap,
            signal.side,
            risk_distance,
            kill_switch.load(Ordering::SeqCst),
            &cfg.veto_params,
        )
    } else {
        crate::types::VetoSet::new()
    };

    let inputs = build_confluence_inputs(candles, &signal, micro_snap.cvd_slope);
    let result = mtf.on_confirmed(now, &inputs, &veto);
    bus.publish(Event::State(mtf.snapshot()));
    *last_confluence.write() = Some(result.confluence);

    if result.phase != crate::types::MtfPhase::Executable {
        return;
    }

    *last_signal.write() = Some(signal);
    bus.publish(Event::Signal(signal));

    let card = ScalpCardComposer::compose(
        &cfg.symbol,
        "maker-post-only",
        result.confluence.final_.tier,
        &signal,
        &veto,
        &micro_snap,
        &cfg.strategy_params,
    );
    *last_card.write() = Some(card);
}

fn build_confluence_inputs(candles: &CandleStore, signal: &Signal, cvd_slope: f64) -> ConfluenceInputs {
    let h1 = candles.all(Timeframe::H1);
    let h4 = candles.all(Timeframe::H4);
    let m15 = candles.all(Timeframe::M15);
    let d1 = candles.all(Timeframe::D1);
    let m1 = candles.all(Timeframe::M1);

    let snap_last = |bars: &[crate::types::Bar]| -> Option<crate::types::IndicatorSnapshot> {
        if bars.is_empty() {
            None
        } else {
            Some(IndicatorEngine::snapshot_at(bars, bars.len() - 1))
        }
    };

    let h1_snap = snap_last(&h1);
    let h4_snap = snap_last(&h4);
    let m15_snap = snap_last(&m15);
    let d1_snap = snap_last(&d1);

    let risk = (signal.entry - signal.stop_loss).abs().max(1e-9);
    let margin = (signal.entry - signal.candidate.extremum_price).abs();
    let trigger_quality = (margin / risk * 100.0).min(100.0);

    let last_5_1m_moves: Vec<f64> = m1
        .iter()
        .rev()
        .take(5)
        .map(|b| b.close - b.open)
        .rev()
        .collect();

    ConfluenceInputs {
        side: signal.side,
        ema_fast_1h: h1_snap.and_then(|s| s.ema_fast),
        ema_slow_1h: h1_snap.and_then(|s| s.ema_slow),
        ema_fast_4h: h4_snap.and_then(|s| s.ema_fast),
        ema_slow_4h: h4_snap.and_then(|s| s.ema_slow),
        rsi_15m: m15_snap.and_then(|s| s.rsi14),
        rsi_1h: h1_snap.and_then(|s| s.rsi14),
        ema_fast_1d: d1_snap.and_then(|s| s.ema_fast),
        ema_slow_1d: d1_snap.and_then(|s| s.ema_slow),
        trigger_quality,
        last_5_1m_moves,
        cvd_slope,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bar;

    fn sample_config() -> RuntimeConfig {
        RuntimeConfig::default()
    }

    #[test]
    fn new_engine_starts_with_no_data() {
        let engine = Engine::new(sample_config(), "/tmp/swing-signal-engine-test-config.json");
        let status = engine.data_status();
        assert!(!status.loaded);
        assert_eq!(status.count, 0);
    }

    #[test]
    fn upload_csv_populates_candle_store() {
        let engine = Engine::new(sample_config(), "/tmp/swing-signal-engine-test-config.json");
        let csv = "time,open,high,low,close,Volume\n0,100,101,99,100.5,10\n300,100.5,102,100,101,15\n";
        let result = engine.upload_csv(csv).unwrap();
        assert_eq!(result.rows, 2);
        assert_eq!(engine.data_status().count, 2);
    }

    #[test]
    fn signals_latest_is_no_signal_before_any_confirmation() {
        let engine = Engine::new(sample_config(), "/tmp/swing-signal-engine-test-config.json");
        assert!(matches!(engine.signals_latest(), Err(EngineError::NoSignal)));
    }

    #[test]
    fn run_backtest_rejects_insufficient_history() {
        let engine = Engine::new(sample_config(), "/tmp/swing-signal-engine-test-config.json");
        let bars: Vec<Bar> = Vec::new();
        let err = engine.run_backtest(Some(bars));
        assert!(matches!(err, Err(EngineError::InsufficientHistory { .. })));
    }

    #[test]
    fn update_config_rejects_invalid_backtest_params() {
        let engine = Engine::new(sample_config(), "/tmp/swing-signal-engine-test-config.json");
        let mut cfg = sample_config();
        cfg.backtest_params.risk_per_trade = 5.0;
        assert!(engine.update_config(cfg).is_err());
    }
}
