//! Exchange abstraction for the grid engine - enables mocking for tests
//!
//! `ExchangeGateway` is the venue boundary. `OrderExecutor` wraps a gateway
//! with rate limiting and retry with capped exponential backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore, SemaphorePermit};
use tokio::time::Instant;

use super::config::EngineConfig;
use super::errors::{GridError, GridResult};
use super::types::{AckStatus, Fill, OrderAck, OrderRequest, OrderStatus, VenueOrder};

/// Errors reported by a venue adapter
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("connectivity: {0}")]
    Connectivity(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("order not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    /// Worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited(_) | GatewayError::Connectivity(_) | GatewayError::Timeout(_)
        )
    }

    /// The request may or may not have reached the venue
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, GatewayError::Connectivity(_) | GatewayError::Timeout(_))
    }
}

/// Outcome of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    /// Order was no longer open (filled, or already canceled)
    NotFound,
}

/// Venue operations trait - can be mocked for testing
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Current reference (mark/mid) price
    async fn get_price(&self, symbol: &str) -> Result<f64, GatewayError>;

    /// Leverage applied to new positions on `symbol`
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError>;

    /// Place a limit or market order
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<CancelOutcome, GatewayError>;

    /// Orders currently open on the venue
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<VenueOrder>, GatewayError>;

    /// Status of an individual order, open or not
    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<VenueOrder, GatewayError>;

    /// Look up an order by the client order id it was placed with
    async fn query_order_by_client_id(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<VenueOrder>, GatewayError>;

    /// Live fill stream
    async fn subscribe_fills(&self, symbol: &str) -> Result<mpsc::UnboundedReceiver<Fill>, GatewayError>;

    /// Fallback for venues without (or after losing) a fill stream
    async fn poll_fills(&self, _symbol: &str) -> Result<Vec<Fill>, GatewayError> {
        Ok(Vec::new())
    }
}

/// Capped exponential backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_order_retries.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Bounds concurrent requests and spaces out request starts
#[derive(Debug)]
pub struct RateLimiter {
    permits: Semaphore,
    min_spacing: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(max_in_flight: usize, min_spacing: Duration) -> Self {
        Self {
            permits: Semaphore::new(max_in_flight.max(1)),
            min_spacing,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.max_in_flight,
            Duration::from_millis(config.min_request_spacing_ms),
        )
    }

    /// Wait for a request slot; the permit is held for the request's duration
    pub async fn acquire(&self) -> GridResult<SemaphorePermit<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| GridError::Channel(e.to_string()))?;

        if !self.min_spacing.is_zero() {
            let wait_until = {
                let mut next = self.next_slot.lock().await;
                let now = Instant::now();
                let slot = (*next).max(now);
                *next = slot + self.min_spacing;
                slot
            };
            tokio::time::sleep_until(wait_until).await;
        }

        Ok(permit)
    }
}

/// Gateway wrapper adding rate limiting, retries and duplicate-safe placement
pub struct OrderExecutor<G: ExchangeGateway> {
    gateway: Arc<G>,
    symbol: String,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl<G: ExchangeGateway> OrderExecutor<G> {
    pub fn new(gateway: Arc<G>, symbol: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            gateway,
            symbol: symbol.into(),
            limiter: RateLimiter::from_config(config),
            retry: RetryPolicy::from_config(config),
        }
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn set_symbol(&mut self, symbol: impl Into<String>) {
        self.symbol = symbol.into();
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Execute with exponential backoff retry
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> GridResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempts = 0;
        loop {
            let result = {
                let _permit = self.limiter.acquire().await?;
                call().await
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    attempts += 1;
                    if attempts >= self.retry.max_attempts {
                        return Err(exhausted(attempts, e));
                    }
                    let delay = self.retry.delay_for(attempts);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {}ms: {}",
                        operation,
                        attempts,
                        self.retry.max_attempts,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn get_price(&self) -> GridResult<f64> {
        let gateway = self.gateway.clone();
        let symbol = self.symbol.clone();
        self.with_retry("get_price", || {
            let gateway = gateway.clone();
            let symbol = symbol.clone();
            async move { gateway.get_price(&symbol).await }
        })
        .await
    }

    pub async fn set_leverage(&self, leverage: u32) -> GridResult<()> {
        let gateway = self.gateway.clone();
        let symbol = self.symbol.clone();
        self.with_retry("set_leverage", || {
            let gateway = gateway.clone();
            let symbol = symbol.clone();
            async move { gateway.set_leverage(&symbol, leverage).await }
        })
        .await
    }

    /// Single price probe without retries
    pub async fn probe_price(&self) -> GridResult<f64> {
        let _permit = self.limiter.acquire().await?;
        Ok(self.gateway.get_price(&self.symbol).await?)
    }

    /// Place an order, retrying transient failures
    ///
    /// A timeout or connectivity error may hide an accepted order, so the
    /// venue is asked for the client order id before every retry.
    pub async fn place(&self, request: &OrderRequest) -> GridResult<OrderAck> {
        let mut attempts = 0;
        loop {
            let result = {
                let _permit = self.limiter.acquire().await?;
                self.gateway.place_order(request).await
            };

            let err = match result {
                Ok(ack) => return Ok(ack),
                Err(e) if !e.is_retryable() => return Err(e.into()),
                Err(e) => e,
            };

            if err.is_ambiguous() {
                if let Some(ack) = self.recover_placement(request).await {
                    debug!(
                        "Placement {} was accepted despite {}",
                        request.client_order_id, err
                    );
                    return Ok(ack);
                }
            }

            attempts += 1;
            if attempts >= self.retry.max_attempts {
                return Err(exhausted(attempts, err));
            }
            let delay = self.retry.delay_for(attempts);
            warn!(
                "Order placement {:?} @ {:?} failed (attempt {}/{}), retrying in {}ms: {}",
                request.side,
                request.price,
                attempts,
                self.retry.max_attempts,
                delay.as_millis(),
                err
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn recover_placement(&self, request: &OrderRequest) -> Option<OrderAck> {
        let _permit = self.limiter.acquire().await.ok()?;
        match self
            .gateway
            .query_order_by_client_id(&self.symbol, &request.client_order_id)
            .await
        {
            Ok(Some(order)) => Some(ack_from_venue(&order)),
            Ok(None) => None,
            Err(e) => {
                debug!("Client id lookup for {} failed: {}", request.client_order_id, e);
                None
            }
        }
    }

    pub async fn cancel(&self, order_id: &str) -> GridResult<CancelOutcome> {
        let gateway = self.gateway.clone();
        let symbol = self.symbol.clone();
        let order_id = order_id.to_string();
        self.with_retry("cancel_order", || {
            let gateway = gateway.clone();
            let symbol = symbol.clone();
            let order_id = order_id.clone();
            async move { gateway.cancel_order(&symbol, &order_id).await }
        })
        .await
    }

    pub async fn open_orders(&self) -> GridResult<Vec<VenueOrder>> {
        let gateway = self.gateway.clone();
        let symbol = self.symbol.clone();
        self.with_retry("get_open_orders", || {
            let gateway = gateway.clone();
            let symbol = symbol.clone();
            async move { gateway.get_open_orders(&symbol).await }
        })
        .await
    }

    pub async fn order(&self, order_id: &str) -> GridResult<VenueOrder> {
        let gateway = self.gateway.clone();
        let symbol = self.symbol.clone();
        let order_id = order_id.to_string();
        self.with_retry("get_order", || {
            let gateway = gateway.clone();
            let symbol = symbol.clone();
            let order_id = order_id.clone();
            async move { gateway.get_order(&symbol, &order_id).await }
        })
        .await
    }

    pub async fn poll_fills(&self) -> GridResult<Vec<Fill>> {
        let _permit = self.limiter.acquire().await?;
        Ok(self.gateway.poll_fills(&self.symbol).await?)
    }

    pub async fn subscribe_fills(&self) -> GridResult<mpsc::UnboundedReceiver<Fill>> {
        Ok(self.gateway.subscribe_fills(&self.symbol).await?)
    }
}

fn exhausted(attempts: u32, last: GatewayError) -> GridError {
    let class = GridError::from(last.clone()).class();
    GridError::RetriesExhausted {
        attempts,
        class,
        reason: last.to_string(),
    }
}

/// Build a placement ack from a venue order report
pub fn ack_from_venue(order: &VenueOrder) -> OrderAck {
    let status = if order.status == OrderStatus::Filled {
        AckStatus::Filled {
            avg_price: order.avg_fill_price,
            filled_size: order.filled_size,
        }
    } else {
        AckStatus::Resting
    };
    OrderAck {
        order_id: order.order_id.clone(),
        status,
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Scripted venue for testing the engine without a real exchange connection.
pub mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    use crate::grid::types::{OrderType, EPSILON};

    #[derive(Default)]
    struct Book {
        /// Every order ever accepted, by order id
        orders: HashMap<String, VenueOrder>,
        /// Client order id -> order id
        client_ids: HashMap<String, String>,
    }

    /// Mock exchange with failure injection and call recording
    pub struct MockExchange {
        pub price: Arc<Mutex<f64>>,
        /// Successfully accepted placement requests
        pub placed: Arc<Mutex<Vec<OrderRequest>>>,
        pub cancelled: Arc<Mutex<Vec<String>>>,
        pub leverage: Arc<Mutex<Option<u32>>>,
        book: Arc<Mutex<Book>>,
        place_failures: Arc<Mutex<VecDeque<GatewayError>>>,
        cancel_failures: Arc<Mutex<VecDeque<GatewayError>>>,
        price_failures: Arc<Mutex<VecDeque<GatewayError>>>,
        leverage_failures: Arc<Mutex<VecDeque<GatewayError>>>,
        /// Placements accepted by the venue but reported as timeouts
        accepted_timeouts: AtomicU32,
        fill_senders: Arc<Mutex<Vec<mpsc::UnboundedSender<Fill>>>>,
        polled_fills: Arc<Mutex<VecDeque<Fill>>>,
        place_calls: AtomicU32,
        next_oid: AtomicU64,
    }

    impl MockExchange {
        pub fn new(price: f64) -> Self {
            Self {
                price: Arc::new(Mutex::new(price)),
                placed: Arc::new(Mutex::new(Vec::new())),
                cancelled: Arc::new(Mutex::new(Vec::new())),
                leverage: Arc::new(Mutex::new(None)),
                book: Arc::new(Mutex::new(Book::default())),
                place_failures: Arc::new(Mutex::new(VecDeque::new())),
                cancel_failures: Arc::new(Mutex::new(VecDeque::new())),
                price_failures: Arc::new(Mutex::new(VecDeque::new())),
                leverage_failures: Arc::new(Mutex::new(VecDeque::new())),
                accepted_timeouts: AtomicU32::new(0),
                fill_senders: Arc::new(Mutex::new(Vec::new())),
                polled_fills: Arc::new(Mutex::new(VecDeque::new())),
                place_calls: AtomicU32::new(0),
                next_oid: AtomicU64::new(1),
            }
        }

        pub async fn set_price(&self, price: f64) {
            *self.price.lock().await = price;
        }

        /// Fail the next placement calls with these errors, in order
        pub async fn fail_next_places(&self, errors: impl IntoIterator<Item = GatewayError>) {
            self.place_failures.lock().await.extend(errors);
        }

        pub async fn fail_next_cancels(&self, errors: impl IntoIterator<Item = GatewayError>) {
            self.cancel_failures.lock().await.extend(errors);
        }

        pub async fn fail_next_prices(&self, errors: impl IntoIterator<Item = GatewayError>) {
            self.price_failures.lock().await.extend(errors);
        }

        pub async fn fail_next_leverage(&self, errors: impl IntoIterator<Item = GatewayError>) {
            self.leverage_failures.lock().await.extend(errors);
        }

        /// Leverage last set on the venue
        pub async fn current_leverage(&self) -> Option<u32> {
            *self.leverage.lock().await
        }

        /// Accept the next `count` placements but report them as timeouts
        pub fn timeout_after_accept(&self, count: u32) {
            self.accepted_timeouts.store(count, Ordering::SeqCst);
        }

        /// Number of place_order calls, successful or not
        pub fn place_calls(&self) -> u32 {
            self.place_calls.load(Ordering::SeqCst)
        }

        pub async fn placed_orders(&self) -> Vec<OrderRequest> {
            self.placed.lock().await.clone()
        }

        pub async fn cancelled_ids(&self) -> Vec<String> {
            self.cancelled.lock().await.clone()
        }

        pub async fn open_order_count(&self) -> usize {
            self.book
                .lock()
                .await
                .orders
                .values()
                .filter(|o| !o.status.is_terminal())
                .count()
        }

        /// Put an order on the venue that the engine never placed
        pub async fn inject_order(&self, order: VenueOrder) {
            let mut book = self.book.lock().await;
            if let Some(cid) = &order.client_order_id {
                book.client_ids.insert(cid.clone(), order.order_id.clone());
            }
            book.orders.insert(order.order_id.clone(), order);
        }

        /// Fill an open order on the venue and publish the fill
        ///
        /// `size` defaults to the order's remaining size.
        pub async fn fill_order(&self, order_id: &str, size: Option<f64>) -> Option<Fill> {
            let fill = self.fill_silently(order_id, size).await?;
            self.publish(fill.clone()).await;
            Some(fill)
        }

        /// Fill an order on the venue without publishing the fill (missed event)
        pub async fn fill_silently(&self, order_id: &str, size: Option<f64>) -> Option<Fill> {
            let mut book = self.book.lock().await;
            let order = book.orders.get_mut(order_id)?;
            if order.status.is_terminal() {
                return None;
            }
            let remaining = order.size - order.filled_size;
            let qty = size.unwrap_or(remaining).min(remaining);
            if qty <= EPSILON {
                return None;
            }
            let prev = order.filled_size;
            order.filled_size += qty;
            order.avg_fill_price = (order.avg_fill_price * prev + order.price * qty) / order.filled_size;
            order.status = if order.size - order.filled_size <= EPSILON {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            Some(Fill::new(order_id, order.side, order.price, qty))
        }

        /// Deliver a fill to subscribers, or queue it for polling when none listen
        pub async fn publish(&self, fill: Fill) {
            let mut senders = self.fill_senders.lock().await;
            senders.retain(|tx| !tx.is_closed());
            let mut delivered = false;
            for tx in senders.iter() {
                delivered |= tx.send(fill.clone()).is_ok();
            }
            if !delivered {
                self.polled_fills.lock().await.push_back(fill);
            }
        }

        /// Cancel an order on the venue side (e.g., expired)
        pub async fn drop_order(&self, order_id: &str) {
            if let Some(order) = self.book.lock().await.orders.get_mut(order_id) {
                order.status = OrderStatus::Canceled;
            }
        }

        /// Close all fill streams
        pub async fn disconnect_stream(&self) {
            self.fill_senders.lock().await.clear();
        }
    }

    #[async_trait]
    impl ExchangeGateway for MockExchange {
        async fn get_price(&self, _symbol: &str) -> Result<f64, GatewayError> {
            if let Some(err) = self.price_failures.lock().await.pop_front() {
                return Err(err);
            }
            Ok(*self.price.lock().await)
        }

        async fn set_leverage(&self, _symbol: &str, leverage: u32) -> Result<(), GatewayError> {
            if let Some(err) = self.leverage_failures.lock().await.pop_front() {
                return Err(err);
            }
            *self.leverage.lock().await = Some(leverage);
            Ok(())
        }

        async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
            self.place_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.place_failures.lock().await.pop_front() {
                return Err(err);
            }

            let mut book = self.book.lock().await;
            if book.client_ids.contains_key(&request.client_order_id) {
                return Err(GatewayError::Rejected("duplicate client order id".into()));
            }

            let order_id = format!("m{}", self.next_oid.fetch_add(1, Ordering::SeqCst));
            let mark = *self.price.lock().await;
            let (status, filled, avg) = match request.order_type {
                OrderType::Market => (OrderStatus::Filled, request.size, mark),
                OrderType::Limit => (OrderStatus::Open, 0.0, 0.0),
            };
            book.client_ids
                .insert(request.client_order_id.clone(), order_id.clone());
            book.orders.insert(
                order_id.clone(),
                VenueOrder {
                    order_id: order_id.clone(),
                    client_order_id: Some(request.client_order_id.clone()),
                    side: request.side,
                    price: request.price.unwrap_or(mark),
                    size: request.size,
                    filled_size: filled,
                    avg_fill_price: avg,
                    status,
                },
            );
            drop(book);
            self.placed.lock().await.push(request.clone());

            let pending = self.accepted_timeouts.load(Ordering::SeqCst);
            if pending > 0 {
                self.accepted_timeouts.store(pending - 1, Ordering::SeqCst);
                return Err(GatewayError::Timeout("response lost".into()));
            }

            let status = match request.order_type {
                OrderType::Market => AckStatus::Filled {
                    avg_price: mark,
                    filled_size: request.size,
                },
                OrderType::Limit => AckStatus::Resting,
            };
            Ok(OrderAck { order_id, status })
        }

        async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<CancelOutcome, GatewayError> {
            if let Some(err) = self.cancel_failures.lock().await.pop_front() {
                return Err(err);
            }
            let canceled = {
                let mut book = self.book.lock().await;
                match book.orders.get_mut(order_id) {
                    Some(order) if !order.status.is_terminal() => {
                        order.status = OrderStatus::Canceled;
                        true
                    }
                    _ => false,
                }
            };
            if !canceled {
                return Ok(CancelOutcome::NotFound);
            }
            self.cancelled.lock().await.push(order_id.to_string());
            Ok(CancelOutcome::Canceled)
        }

        async fn get_open_orders(&self, _symbol: &str) -> Result<Vec<VenueOrder>, GatewayError> {
            let book = self.book.lock().await;
            let mut open: Vec<VenueOrder> = book
                .orders
                .values()
                .filter(|o| !o.status.is_terminal())
                .cloned()
                .collect();
            open.sort_by(|a, b| a.order_id.cmp(&b.order_id));
            Ok(open)
        }

        async fn get_order(&self, _symbol: &str, order_id: &str) -> Result<VenueOrder, GatewayError> {
            self.book
                .lock()
                .await
                .orders
                .get(order_id)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))
        }

        async fn query_order_by_client_id(
            &self,
            _symbol: &str,
            client_order_id: &str,
        ) -> Result<Option<VenueOrder>, GatewayError> {
            let book = self.book.lock().await;
            Ok(book
                .client_ids
                .get(client_order_id)
                .and_then(|oid| book.orders.get(oid))
                .cloned())
        }

        async fn subscribe_fills(&self, _symbol: &str) -> Result<mpsc::UnboundedReceiver<Fill>, GatewayError> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.fill_senders.lock().await.push(tx);
            Ok(rx)
        }

        async fn poll_fills(&self, _symbol: &str) -> Result<Vec<Fill>, GatewayError> {
            Ok(self.polled_fills.lock().await.drain(..).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockExchange;
    use super::*;
    use crate::grid::errors::ErrorClass;
    use crate::grid::types::OrderSide;

    fn fast_config() -> EngineConfig {
        EngineConfig::default()
            .with_retry_config(4, 1)
            .with_rate_limit(4, 0)
    }

    fn executor(mock: Arc<MockExchange>) -> OrderExecutor<MockExchange> {
        OrderExecutor::new(mock, "BTCUSDT", &fast_config())
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(30), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let mock = Arc::new(MockExchange::new(100.0));
        mock.fail_next_places([GatewayError::RateLimited("slow down".into())]).await;
        let exec = executor(mock.clone());

        let request = OrderRequest::limit("BTCUSDT", 0, OrderSide::Buy, 99.0, 1.0);
        let ack = exec.place(&request).await.unwrap();
        assert_eq!(ack.status, AckStatus::Resting);
        assert_eq!(mock.place_calls(), 2);
    }

    #[tokio::test]
    async fn test_rejection_not_retried() {
        let mock = Arc::new(MockExchange::new(100.0));
        mock.fail_next_places([GatewayError::InsufficientMargin("need more".into())]).await;
        let exec = executor(mock.clone());

        let request = OrderRequest::limit("BTCUSDT", 0, OrderSide::Buy, 99.0, 1.0);
        let err = exec.place(&request).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::ExchangeRejection);
        assert_eq!(mock.place_calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let mock = Arc::new(MockExchange::new(100.0));
        mock.fail_next_places((0..4).map(|_| GatewayError::Connectivity("down".into()))).await;
        let exec = executor(mock.clone());

        let request = OrderRequest::limit("BTCUSDT", 0, OrderSide::Buy, 99.0, 1.0);
        match exec.place(&request).await {
            Err(GridError::RetriesExhausted { attempts, class, .. }) => {
                assert_eq!(attempts, 4);
                assert_eq!(class, ErrorClass::Connectivity);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(mock.place_calls(), 4);
    }

    #[tokio::test]
    async fn test_ambiguous_timeout_not_duplicated() {
        let mock = Arc::new(MockExchange::new(100.0));
        mock.timeout_after_accept(1);
        let exec = executor(mock.clone());

        let request = OrderRequest::limit("BTCUSDT", 0, OrderSide::Buy, 99.0, 1.0);
        let ack = exec.place(&request).await.unwrap();

        assert_eq!(mock.place_calls(), 1);
        assert_eq!(mock.open_order_count().await, 1);
        assert_eq!(ack.status, AckStatus::Resting);
    }

    #[tokio::test]
    async fn test_cancel_not_found() {
        let mock = Arc::new(MockExchange::new(100.0));
        let exec = executor(mock.clone());
        assert_eq!(exec.cancel("nope").await.unwrap(), CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_rate_limiter_spacing() {
        let limiter = RateLimiter::new(2, Duration::from_millis(20));
        let start = Instant::now();
        for _ in 0..3 {
            let _permit = limiter.acquire().await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
