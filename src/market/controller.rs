use crate::error::AppError;
use crate::market::backoff::{run_poll_loop, BackoffPolicy};
use crate::market::poll::CandleSource;
use crate::market::series::Series;
use crate::market::stream::{StreamEvent, StreamSource, TradeFeed};
use crate::market::throttle::ThrottledAggregator;
use crate::market::types::{normalize_symbol, FeedInterval, FeedMode, FeedState};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STREAM_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub series_capacity: usize,
    pub throttle_interval: Duration,
    pub stream_min_spacing: Duration,
    pub backoff: BackoffPolicy,
}

struct SessionHandle {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

/// Everything a running session needs. Cloned into the spawned task.
#[derive(Clone)]
struct SessionContext {
    candles: Arc<dyn CandleSource>,
    trades: Arc<dyn TradeFeed>,
    settings: FeedSettings,
    state: Arc<watch::Sender<FeedState>>,
    symbol: String,
    interval: FeedInterval,
    cancel_token: CancellationToken,
}

impl SessionContext {
    /// Single mutation path for `FeedState`. Results arriving after teardown are discarded.
    fn update<F>(&self, modify: F) -> bool
    where
        F: FnOnce(&mut FeedState),
    {
        if self.cancel_token.is_cancelled() {
            return false;
        }
        self.state.send_modify(modify);
        true
    }

    fn current_series(&self) -> Series {
        let points = self.state.borrow().series.clone();
        Series::from_unordered(points, self.settings.series_capacity)
    }

    async fn fetch_snapshot(&self, interval: FeedInterval) -> Option<Result<Series, AppError>> {
        tokio::select! {
            _ = self.cancel_token.cancelled() => None,
            result = self.candles.fetch(&self.symbol, interval, self.settings.series_capacity) => Some(result),
        }
    }

    async fn historical_attempt(&self) -> ControlFlow<(), bool> {
        let Some(result) = self.fetch_snapshot(self.interval).await else {
            return ControlFlow::Break(());
        };

        match result {
            Ok(series) => {
                debug!(
                    symbol = %self.symbol,
                    interval = self.interval.as_str(),
                    points = series.len(),
                    "historical snapshot loaded"
                );
                self.update(|state| {
                    state.series = series.to_vec();
                    state.is_loading = false;
                    state.last_error = None;
                });
                ControlFlow::Break(())
            }
            Err(error) => {
                warn!(
                    symbol = %self.symbol,
                    interval = self.interval.as_str(),
                    error = %error,
                    "historical snapshot failed, keeping previous series"
                );
                self.update(|state| {
                    state.is_loading = false;
                    state.last_error = Some(error.to_string());
                });
                ControlFlow::Continue(false)
            }
        }
    }
}

async fn run_historical_session(context: SessionContext) {
    let policy = context.settings.backoff;
    let context = &context;
    run_poll_loop(policy, &context.cancel_token, move || async move {
        context.historical_attempt().await
    })
    .await;
}

async fn run_live_session(context: SessionContext) {
    let mut series = match context.fetch_snapshot(FeedInterval::Live).await {
        None => return,
        Some(Ok(seed)) => {
            context.update(|state| {
                state.series = seed.to_vec();
                state.is_loading = false;
                state.last_error = None;
            });
            seed
        }
        Some(Err(error)) => {
            warn!(symbol = %context.symbol, error = %error, "live seed fetch failed");
            context.update(|state| {
                state.is_loading = false;
                state.last_error = Some(error.to_string());
            });
            context.current_series()
        }
    };

    if context.cancel_token.is_cancelled() {
        return;
    }

    let (sink, mut events) = mpsc::channel(STREAM_EVENT_BUFFER);
    let mut stream = StreamSource::new(
        Arc::clone(&context.trades),
        context.settings.stream_min_spacing,
    );
    stream.start(&context.symbol, sink).await;
    info!(symbol = %context.symbol, "live feed streaming");

    let mut aggregator = ThrottledAggregator::new(context.settings.throttle_interval);
    let mut ticker = tokio::time::interval(context.settings.throttle_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stream_open = true;

    loop {
        tokio::select! {
            _ = context.cancel_token.cancelled() => {
                break;
            }
            maybe_event = events.recv(), if stream_open => {
                match maybe_event {
                    Some(StreamEvent::Tick(point)) => aggregator.push(point),
                    Some(StreamEvent::Failed(reason)) => {
                        context.update(|state| {
                            state.last_error = Some(reason);
                        });
                    }
                    None => stream_open = false,
                }
            }
            scheduled = ticker.tick() => {
                if aggregator.flush_into(scheduled, &mut series) {
                    let snapshot = series.to_vec();
                    context.update(|state| {
                        state.series = snapshot;
                    });
                }
            }
        }
    }

    stream.stop().await;
    debug!(symbol = %context.symbol, "live feed stopped");
}

/// Drives one tracked symbol through `Idle -> Historical <-> Live`.
///
/// Transitions are serialized: the running session is cancelled and awaited before the
/// next one is spawned, so only one source ever writes the series.
pub struct FeedController {
    candles: Arc<dyn CandleSource>,
    trades: Arc<dyn TradeFeed>,
    settings: FeedSettings,
    state: Arc<watch::Sender<FeedState>>,
    session: Mutex<Option<SessionHandle>>,
}

impl FeedController {
    pub fn new(
        candles: Arc<dyn CandleSource>,
        trades: Arc<dyn TradeFeed>,
        settings: FeedSettings,
        initial_symbol: String,
        initial_interval: FeedInterval,
    ) -> Self {
        let (state, _) = watch::channel(FeedState::idle(initial_symbol, initial_interval));
        Self {
            candles,
            trades,
            settings,
            state: Arc::new(state),
            session: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> FeedState {
        self.state.borrow().clone()
    }

    pub async fn start(&self, symbol: &str, interval: FeedInterval) -> Result<(), AppError> {
        let symbol = normalize_symbol(symbol)?;
        self.transition(symbol, interval).await;
        Ok(())
    }

    pub async fn select_symbol(&self, symbol: &str) -> Result<(), AppError> {
        let symbol = normalize_symbol(symbol)?;
        let interval = self.state.borrow().interval;
        self.transition(symbol, interval).await;
        Ok(())
    }

    pub async fn select_interval(&self, interval: FeedInterval) {
        let symbol = self.state.borrow().symbol.clone();
        self.transition(symbol, interval).await;
    }

    /// Re-enters the current selection; the manual retry path after errors.
    pub async fn retry(&self) {
        let (symbol, interval) = {
            let readable = self.state.borrow();
            (readable.symbol.clone(), readable.interval)
        };
        self.transition(symbol, interval).await;
    }

    pub async fn detach(&self) {
        let mut session_slot = self.session.lock().await;
        if let Some(handle) = session_slot.take() {
            handle.cancellation_token.cancel();
            let _ = handle.join_handle.await;
        }

        self.state.send_modify(|state| {
            state.mode = FeedMode::Idle;
            state.is_loading = false;
            state.last_error = None;
            state.series.clear();
        });
        debug!("feed detached");
    }

    async fn transition(&self, symbol: String, interval: FeedInterval) {
        let mut session_slot = self.session.lock().await;
        if let Some(handle) = session_slot.take() {
            handle.cancellation_token.cancel();
            let _ = handle.join_handle.await;
        }

        let mode = if interval.is_live() {
            FeedMode::Live
        } else {
            FeedMode::Historical
        };

        self.state.send_modify(|state| {
            if state.symbol != symbol {
                state.series.clear();
            }
            state.symbol = symbol.clone();
            state.interval = interval;
            state.mode = mode;
            state.is_loading = true;
            state.last_error = None;
        });
        info!(symbol = %symbol, interval = interval.as_str(), ?mode, "feed transition");

        let cancellation_token = CancellationToken::new();
        let context = SessionContext {
            candles: Arc::clone(&self.candles),
            trades: Arc::clone(&self.trades),
            settings: self.settings.clone(),
            state: Arc::clone(&self.state),
            symbol,
            interval,
            cancel_token: cancellation_token.clone(),
        };

        let join_handle = match mode {
            FeedMode::Live => tokio::spawn(run_live_session(context)),
            _ => tokio::spawn(run_historical_session(context)),
        };

        *session_slot = Some(SessionHandle {
            cancellation_token,
            join_handle,
        });
    }
}

impl Drop for FeedController {
    fn drop(&mut self) {
        if let Some(handle) = self.session.get_mut().take() {
            handle.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_STREAM_SPACING_MS;
    use crate::market::stream::TradeFrames;
    use crate::market::types::Candle;
    use async_trait::async_trait;
    use futures_util::stream;
    use futures_util::StreamExt;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type EventLog = Arc<SyncMutex<Vec<String>>>;

    struct FakeCandles {
        log: EventLog,
        failures_remaining: AtomicUsize,
    }

    #[async_trait]
    impl CandleSource for FakeCandles {
        async fn fetch(
            &self,
            symbol: &str,
            interval: FeedInterval,
            capacity: usize,
        ) -> Result<Series, AppError> {
            self.log
                .lock()
                .push(format!("fetch {symbol} {}", interval.as_str()));

            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(AppError::Timeout { after_ms: 10_000 });
            }

            let rows = match interval {
                FeedInterval::Live => 3,
                _ => 5,
            };
            let candles = (1..=rows)
                .rev()
                .map(|step| Candle {
                    timestamp_ms: step * 1_000,
                    close: step as f64,
                    volume: 1.0,
                })
                .collect();
            Ok(Series::from_unordered(candles, capacity))
        }
    }

    struct CloseGuard(EventLog);

    impl Drop for CloseGuard {
        fn drop(&mut self) {
            self.0.lock().push("stream closed".to_string());
        }
    }

    struct FakeTrades {
        log: EventLog,
        frames: SyncMutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    }

    #[async_trait]
    impl TradeFeed for FakeTrades {
        async fn connect(&self, symbol: &str) -> Result<TradeFrames, AppError> {
            self.log.lock().push(format!("connect {symbol}"));
            let receiver = self
                .frames
                .lock()
                .take()
                .ok_or_else(|| AppError::StreamClosed("no scripted connection".to_string()))?;
            let guard = CloseGuard(Arc::clone(&self.log));
            Ok(stream::unfold(
                (receiver, guard),
                |(mut receiver, guard)| async move {
                    receiver
                        .recv()
                        .await
                        .map(|payload| (Ok(payload), (receiver, guard)))
                },
            )
            .boxed())
        }
    }

    struct Harness {
        controller: FeedController,
        candles: Arc<FakeCandles>,
        log: EventLog,
        frames: mpsc::UnboundedSender<Vec<u8>>,
    }

    fn harness(failures: usize) -> Harness {
        let log: EventLog = Arc::new(SyncMutex::new(Vec::new()));
        let (frames, receiver) = mpsc::unbounded_channel();
        let candles = Arc::new(FakeCandles {
            log: Arc::clone(&log),
            failures_remaining: AtomicUsize::new(failures),
        });
        let trades = Arc::new(FakeTrades {
            log: Arc::clone(&log),
            frames: SyncMutex::new(Some(receiver)),
        });
        let settings = FeedSettings {
            series_capacity: 4,
            throttle_interval: Duration::from_secs(1),
            stream_min_spacing: Duration::from_millis(DEFAULT_STREAM_SPACING_MS),
            backoff: BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(60)),
        };
        let controller = FeedController::new(
            candles.clone(),
            trades,
            settings,
            "BTCUSDT".to_string(),
            FeedInterval::Day,
        );

        Harness {
            controller,
            candles,
            log,
            frames,
        }
    }

    fn trade(event_time: i64, price: f64) -> Vec<u8> {
        format!(r#"{{"E":{event_time},"p":"{price}"}}"#).into_bytes()
    }

    async fn wait_until<F>(receiver: &mut watch::Receiver<FeedState>, predicate: F) -> FeedState
    where
        F: Fn(&FeedState) -> bool,
    {
        let waited = tokio::time::timeout(Duration::from_secs(300), async {
            loop {
                {
                    let current = receiver.borrow_and_update();
                    if predicate(&current) {
                        return current.clone();
                    }
                }
                if receiver.changed().await.is_err() {
                    panic!("feed state sender dropped");
                }
            }
        })
        .await;
        waited.expect("feed state should reach the expected condition")
    }

    #[tokio::test(start_paused = true)]
    async fn historical_selection_replaces_series() {
        let harness = harness(0);
        let mut updates = harness.controller.subscribe();

        harness
            .controller
            .start("btcusdt", FeedInterval::Week)
            .await
            .expect("start should succeed");

        let state = wait_until(&mut updates, |state| !state.is_loading).await;
        assert_eq!(state.mode, FeedMode::Historical);
        assert_eq!(state.interval, FeedInterval::Week);
        assert_eq!(state.last_error, None);
        let stamps: Vec<i64> = state.series.iter().map(|point| point.timestamp_ms).collect();
        assert_eq!(stamps, vec![2_000, 3_000, 4_000, 5_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn historical_failure_keeps_previous_series_and_retries() {
        let harness = harness(0);
        let mut updates = harness.controller.subscribe();
        harness
            .controller
            .start("BTCUSDT", FeedInterval::Week)
            .await
            .expect("start");
        let loaded = wait_until(&mut updates, |state| !state.is_loading).await;

        harness.candles.failures_remaining.store(2, Ordering::SeqCst);
        harness.controller.select_interval(FeedInterval::Year).await;

        let failed = wait_until(&mut updates, |state| state.last_error.is_some()).await;
        assert_eq!(failed.mode, FeedMode::Historical);
        assert_eq!(failed.series, loaded.series);

        let recovered = wait_until(&mut updates, |state| {
            state.last_error.is_none() && !state.is_loading
        })
        .await;
        assert_eq!(recovered.series.len(), 4);

        let fetches = harness
            .log
            .lock()
            .iter()
            .filter(|entry| entry.as_str() == "fetch BTCUSDT 1y")
            .count();
        assert_eq!(fetches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn live_mode_seeds_before_streaming_and_throttles_ticks() {
        let harness = harness(0);
        let mut updates = harness.controller.subscribe();
        harness
            .controller
            .start("BTCUSDT", FeedInterval::Live)
            .await
            .expect("start");

        let seeded = wait_until(&mut updates, |state| !state.is_loading).await;
        assert_eq!(seeded.mode, FeedMode::Live);
        assert_eq!(seeded.series.len(), 3);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        for step in 0..10 {
            harness
                .frames
                .send(trade(10_000 + step * 20, 200.0 + step as f64))
                .expect("frame");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let streamed = wait_until(&mut updates, |state| state.series.len() == 4).await;
        let last = streamed.series.last().expect("streamed point");
        assert_eq!(last.close, 209.0);
        assert_eq!(last.timestamp_ms, 10_180);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let settled = harness.controller.snapshot();
        assert_eq!(settled.series.len(), 4);
        assert_eq!(settled.series.last().map(|point| point.close), Some(209.0));

        let log = harness.log.lock().clone();
        assert_eq!(log[0], "fetch BTCUSDT live");
        assert_eq!(log[1], "connect BTCUSDT");
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_live_stops_stream_before_historical_fetch() {
        let harness = harness(0);
        let mut updates = harness.controller.subscribe();
        harness
            .controller
            .start("BTCUSDT", FeedInterval::Live)
            .await
            .expect("start");
        wait_until(&mut updates, |state| !state.is_loading).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        harness.controller.select_interval(FeedInterval::Month).await;
        wait_until(&mut updates, |state| {
            state.mode == FeedMode::Historical && !state.is_loading
        })
        .await;

        let log = harness.log.lock().clone();
        assert_eq!(
            log,
            vec![
                "fetch BTCUSDT live".to_string(),
                "connect BTCUSDT".to_string(),
                "stream closed".to_string(),
                "fetch BTCUSDT 1m".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stream_disconnect_keeps_live_mode_and_series() {
        let harness = harness(0);
        let mut updates = harness.controller.subscribe();
        harness
            .controller
            .start("BTCUSDT", FeedInterval::Live)
            .await
            .expect("start");
        let seeded = wait_until(&mut updates, |state| !state.is_loading).await;

        let Harness {
            controller,
            log,
            frames,
            ..
        } = harness;
        drop(frames);

        let disconnected = wait_until(&mut updates, |state| state.last_error.is_some()).await;
        assert_eq!(disconnected.mode, FeedMode::Live);
        assert_eq!(disconnected.series, seeded.series);
        assert!(disconnected
            .last_error
            .as_deref()
            .is_some_and(|reason| reason.contains("disconnected")));

        tokio::time::sleep(Duration::from_secs(30)).await;
        let connects = log
            .lock()
            .iter()
            .filter(|entry| entry.starts_with("connect"))
            .count();
        assert_eq!(connects, 1);
        assert_eq!(controller.snapshot().mode, FeedMode::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn detach_returns_to_idle_and_closes_stream() {
        let harness = harness(0);
        let mut updates = harness.controller.subscribe();
        harness
            .controller
            .start("BTCUSDT", FeedInterval::Live)
            .await
            .expect("start");
        wait_until(&mut updates, |state| !state.is_loading).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        harness.controller.detach().await;

        let state = harness.controller.snapshot();
        assert_eq!(state.mode, FeedMode::Idle);
        assert!(state.series.is_empty());
        assert_eq!(harness.log.lock().last().map(String::as_str), Some("stream closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn switching_symbol_clears_series_and_refetches() {
        let harness = harness(0);
        let mut updates = harness.controller.subscribe();
        harness
            .controller
            .start("BTCUSDT", FeedInterval::Day)
            .await
            .expect("start");
        wait_until(&mut updates, |state| !state.is_loading).await;

        harness
            .controller
            .select_symbol("ethusdt")
            .await
            .expect("select symbol");
        let state = harness.controller.snapshot();
        assert_eq!(state.symbol, "ETHUSDT");
        assert_eq!(state.interval, FeedInterval::Day);
        assert!(state.series.is_empty());

        wait_until(&mut updates, |state| {
            state.symbol == "ETHUSDT" && !state.is_loading
        })
        .await;
        assert!(harness
            .log
            .lock()
            .contains(&"fetch ETHUSDT 1d".to_string()));
    }

    #[tokio::test]
    async fn rejects_malformed_symbols() {
        let harness = harness(0);
        assert!(harness.controller.select_symbol("btc-usdt").await.is_err());
        assert_eq!(harness.controller.snapshot().mode, FeedMode::Idle);
    }
}
