use crate::error::AppError;
use crate::market::types::{parse_trade_payload, PricePoint};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Raw payloads of one live connection; the sequence ends when the connection closes.
pub type TradeFrames = BoxStream<'static, Result<Vec<u8>, AppError>>;

#[async_trait]
pub trait TradeFeed: Send + Sync {
    async fn connect(&self, symbol: &str) -> Result<TradeFrames, AppError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Tick(PricePoint),
    Failed(String),
}

/// Trailing-edge spacing: the newest tick replaces any held one and is released once
/// `min_spacing` has passed since the first tick of the window arrived. Replaced ticks
/// are dropped, never queued.
#[derive(Debug, Clone)]
pub struct TickSpacing {
    min_spacing: Duration,
    held: Option<PricePoint>,
    held_since: Option<Instant>,
    dropped: u64,
}

impl TickSpacing {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            held: None,
            held_since: None,
            dropped: 0,
        }
    }

    pub fn hold(&mut self, point: PricePoint, arrived_at: Instant) {
        if self.held.replace(point).is_some() {
            self.dropped = self.dropped.saturating_add(1);
        } else {
            self.held_since = Some(arrived_at);
        }
    }

    /// When the held tick becomes due, if one is held.
    pub fn deadline(&self) -> Option<Instant> {
        self.held
            .as_ref()
            .and(self.held_since)
            .map(|since| since + self.min_spacing)
    }

    pub fn release(&mut self, now: Instant) -> Option<PricePoint> {
        match self.deadline() {
            Some(due) if now >= due => self.take_held(),
            _ => None,
        }
    }

    pub fn take_held(&mut self) -> Option<PricePoint> {
        self.held_since = None;
        self.held.take()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

struct ConnectionHandle {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

/// Owns at most one live trade connection at a time.
pub struct StreamSource {
    feed: Arc<dyn TradeFeed>,
    min_spacing: Duration,
    connection: Option<ConnectionHandle>,
}

impl StreamSource {
    pub fn new(feed: Arc<dyn TradeFeed>, min_spacing: Duration) -> Self {
        Self {
            feed,
            min_spacing,
            connection: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.connection
            .as_ref()
            .map(|connection| !connection.join_handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn start(&mut self, symbol: &str, sink: mpsc::Sender<StreamEvent>) {
        self.stop().await;

        let cancellation_token = CancellationToken::new();
        let task_token = cancellation_token.clone();
        let feed = Arc::clone(&self.feed);
        let symbol = symbol.to_string();
        let spacing = TickSpacing::new(self.min_spacing);

        let join_handle = tokio::spawn(async move {
            run_connection(feed, symbol, spacing, sink, task_token).await;
        });

        self.connection = Some(ConnectionHandle {
            cancellation_token,
            join_handle,
        });
    }

    pub async fn stop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.cancellation_token.cancel();
            let _ = connection.join_handle.await;
        }
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.cancellation_token.cancel();
        }
    }
}

async fn run_connection(
    feed: Arc<dyn TradeFeed>,
    symbol: String,
    mut spacing: TickSpacing,
    sink: mpsc::Sender<StreamEvent>,
    cancel_token: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel_token.cancelled() => return,
        connected = feed.connect(&symbol) => connected,
    };

    let mut frames = match connected {
        Ok(frames) => frames,
        Err(error) => {
            warn!(symbol = %symbol, error = %error, "trade stream connect failed");
            let _ = sink
                .send(StreamEvent::Failed(format!("live stream unavailable: {error}")))
                .await;
            return;
        }
    };

    loop {
        if let Some(point) = spacing.release(Instant::now()) {
            if sink.send(StreamEvent::Tick(point)).await.is_err() {
                return;
            }
        }
        let release_at = spacing.deadline();

        let frame = tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!(symbol = %symbol, dropped = spacing.dropped(), "trade stream stopped");
                return;
            }
            _ = tokio::time::sleep_until(release_at.unwrap_or_else(Instant::now)), if release_at.is_some() => {
                continue;
            }
            next_frame = frames.next() => next_frame,
        };

        let failure = match frame {
            Some(Ok(mut payload)) => {
                match parse_trade_payload(payload.as_mut_slice()) {
                    Ok(point) => spacing.hold(point, Instant::now()),
                    Err(error) => {
                        debug!(symbol = %symbol, error = %error, "dropping undecodable trade frame");
                    }
                }
                continue;
            }
            Some(Err(error)) => format!("live stream error: {error}"),
            None => "live stream disconnected".to_string(),
        };

        if cancel_token.is_cancelled() {
            return;
        }
        if let Some(point) = spacing.take_held() {
            let _ = sink.send(StreamEvent::Tick(point)).await;
        }
        info!(symbol = %symbol, reason = %failure, "trade stream ended");
        let _ = sink.send(StreamEvent::Failed(failure)).await;
        return;
    }
}
