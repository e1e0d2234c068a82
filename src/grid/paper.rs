//! Paper venue - simulated order matching against a mark price
//!
//! Limit orders rest until the mark price crosses them and then fill in full
//! at their limit price. Market orders fill at the mark immediately. The
//! venue keeps its own net position so reduce-only orders can be enforced.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::{mpsc, Mutex};

use super::executor::{CancelOutcome, ExchangeGateway, GatewayError};
use super::types::{
    AckStatus, Fill, OrderAck, OrderRequest, OrderSide, OrderStatus, OrderType, VenueOrder, EPSILON,
};

/// Internal order tracking for paper trading
#[derive(Debug, Clone)]
struct PaperOrder {
    venue: VenueOrder,
    seq: u64,
}

impl PaperOrder {
    fn is_active(&self) -> bool {
        !self.venue.status.is_terminal()
    }

    /// Check if this order should be filled at the given price
    fn should_fill(&self, mark_price: f64) -> bool {
        if !self.is_active() {
            return false;
        }
        match self.venue.side {
            // Buy order fills when mark price <= limit price
            OrderSide::Buy => mark_price <= self.venue.price,
            // Sell order fills when mark price >= limit price
            OrderSide::Sell => mark_price >= self.venue.price,
        }
    }

    fn fill_remaining(&mut self, price: f64) -> f64 {
        let qty = self.venue.size - self.venue.filled_size;
        let total_value = self.venue.avg_fill_price * self.venue.filled_size + price * qty;
        self.venue.filled_size = self.venue.size;
        self.venue.avg_fill_price = total_value / self.venue.filled_size;
        self.venue.status = OrderStatus::Filled;
        qty
    }
}

#[derive(Debug, Default)]
struct PaperBook {
    symbol: String,
    mark: f64,
    orders: HashMap<String, PaperOrder>,
    client_ids: HashMap<String, String>,
    /// Net position held on the venue (positive = long)
    position: f64,
    leverage: u32,
    /// Fills not delivered because nobody was subscribed
    undelivered: VecDeque<Fill>,
}

/// Simulated venue implementing `ExchangeGateway`
pub struct PaperExchange {
    book: Mutex<PaperBook>,
    fill_senders: Mutex<Vec<mpsc::UnboundedSender<Fill>>>,
    next_oid: AtomicU64,
    next_seq: AtomicU64,
}

impl PaperExchange {
    pub fn new(symbol: impl Into<String>, initial_price: f64) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                symbol: symbol.into(),
                mark: initial_price,
                leverage: 1,
                ..Default::default()
            }),
            fill_senders: Mutex::new(Vec::new()),
            next_oid: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
        }
    }

    pub async fn leverage(&self) -> u32 {
        self.book.lock().await.leverage
    }

    /// Net position the venue holds for the account
    pub async fn position(&self) -> f64 {
        self.book.lock().await.position
    }

    /// Move the mark price and fill every order it crosses
    pub async fn set_price(&self, price: f64) -> Vec<Fill> {
        let fills = {
            let mut book = self.book.lock().await;
            book.mark = price;

            let mut crossed: Vec<(u64, String)> = book
                .orders
                .iter()
                .filter(|(_, o)| o.should_fill(price))
                .map(|(id, o)| (o.seq, id.clone()))
                .collect();
            crossed.sort();

            let mut fills = Vec::with_capacity(crossed.len());
            for (_, order_id) in crossed {
                let Some(order) = book.orders.get_mut(&order_id) else {
                    continue;
                };
                let limit = order.venue.price;
                let side = order.venue.side;
                let qty = order.fill_remaining(limit);
                book.position += side.sign() * qty;
                info!("Paper fill: {:?} {} @ {} (order {})", side, qty, limit, order_id);
                fills.push(Fill::new(&order_id, side, limit, qty));
            }
            fills
        };

        for fill in &fills {
            self.publish(fill.clone()).await;
        }
        fills
    }

    async fn publish(&self, fill: Fill) {
        let mut senders = self.fill_senders.lock().await;
        senders.retain(|tx| !tx.is_closed());
        let mut delivered = false;
        for tx in senders.iter() {
            delivered |= tx.send(fill.clone()).is_ok();
        }
        drop(senders);
        if !delivered {
            self.book.lock().await.undelivered.push_back(fill);
        }
    }

    fn next_order_id(&self) -> String {
        format!("p{}", self.next_oid.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn get_price(&self, symbol: &str) -> Result<f64, GatewayError> {
        let book = self.book.lock().await;
        if symbol != book.symbol {
            return Err(GatewayError::InvalidParams(format!("unknown symbol {}", symbol)));
        }
        Ok(book.mark)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        let mut book = self.book.lock().await;
        if symbol != book.symbol {
            return Err(GatewayError::InvalidParams(format!("unknown symbol {}", symbol)));
        }
        if leverage == 0 {
            return Err(GatewayError::InvalidParams("leverage must be at least 1".into()));
        }
        info!("Paper leverage for {} set to {}x", symbol, leverage);
        book.leverage = leverage;
        Ok(())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
        if !(request.size > 0.0) {
            return Err(GatewayError::InvalidParams(format!("size {}", request.size)));
        }

        let mut book = self.book.lock().await;
        if request.symbol != book.symbol {
            return Err(GatewayError::InvalidParams(format!(
                "unknown symbol {}",
                request.symbol
            )));
        }
        if book.client_ids.contains_key(&request.client_order_id) {
            return Err(GatewayError::Rejected("duplicate client order id".into()));
        }
        if request.reduce_only {
            let increases = book.position.abs() <= EPSILON
                || book.position.signum() == request.side.sign();
            if increases || request.size > book.position.abs() + EPSILON {
                return Err(GatewayError::Rejected(
                    "reduce-only order would increase position".into(),
                ));
            }
        }

        let order_id = self.next_order_id();
        let mark = book.mark;
        let limit = match request.order_type {
            OrderType::Market => mark,
            OrderType::Limit => match request.price {
                Some(p) if p > 0.0 => p,
                _ => return Err(GatewayError::InvalidParams("limit order without price".into())),
            },
        };

        let mut order = PaperOrder {
            venue: VenueOrder {
                order_id: order_id.clone(),
                client_order_id: Some(request.client_order_id.clone()),
                side: request.side,
                price: limit,
                size: request.size,
                filled_size: 0.0,
                avg_fill_price: 0.0,
                status: OrderStatus::Open,
            },
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };

        // Market orders and crossing limits take liquidity immediately
        let status = if request.order_type == OrderType::Market || order.should_fill(mark) {
            let fill_price = if request.order_type == OrderType::Market { mark } else { limit };
            let qty = order.fill_remaining(fill_price);
            book.position += request.side.sign() * qty;
            AckStatus::Filled {
                avg_price: fill_price,
                filled_size: qty,
            }
        } else {
            AckStatus::Resting
        };

        debug!(
            "Paper order {}: {:?} {:?} {} @ {} -> {:?}",
            order_id, request.order_type, request.side, request.size, limit, status
        );

        book.client_ids
            .insert(request.client_order_id.clone(), order_id.clone());
        book.orders.insert(order_id.clone(), order);
        Ok(OrderAck { order_id, status })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<CancelOutcome, GatewayError> {
        let mut book = self.book.lock().await;
        match book.orders.get_mut(order_id) {
            Some(order) if order.is_active() => {
                order.venue.status = OrderStatus::Canceled;
                Ok(CancelOutcome::Canceled)
            }
            _ => Ok(CancelOutcome::NotFound),
        }
    }

    async fn get_open_orders(&self, _symbol: &str) -> Result<Vec<VenueOrder>, GatewayError> {
        let book = self.book.lock().await;
        let mut open: Vec<&PaperOrder> = book.orders.values().filter(|o| o.is_active()).collect();
        open.sort_by_key(|o| o.seq);
        Ok(open.into_iter().map(|o| o.venue.clone()).collect())
    }

    async fn get_order(&self, _symbol: &str, order_id: &str) -> Result<VenueOrder, GatewayError> {
        self.book
            .lock()
            .await
            .orders
            .get(order_id)
            .map(|o| o.venue.clone())
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
            .and_then(|id| book.orders.get(id))
            .map(|o| o.venue.clone()))
    }

    async fn subscribe_fills(&self, _symbol: &str) -> Result<mpsc::UnboundedReceiver<Fill>, GatewayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.fill_senders.lock().await.push(tx);
        Ok(rx)
    }

    async fn poll_fills(&self, _symbol: &str) -> Result<Vec<Fill>, GatewayError> {
        Ok(self.book.lock().await.undelivered.drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limit_fills_on_cross() {
        let venue = PaperExchange::new("BTCUSDT", 100.0);
        let mut fills = venue.subscribe_fills("BTCUSDT").await.unwrap();

        let buy = OrderRequest::limit("BTCUSDT", 0, OrderSide::Buy, 99.0, 1.0);
        let ack = venue.place_order(&buy).await.unwrap();
        assert_eq!(ack.status, AckStatus::Resting);

        assert!(venue.set_price(99.5).await.is_empty());
        let crossed = venue.set_price(98.9).await;
        assert_eq!(crossed.len(), 1);
        assert!((crossed[0].price - 99.0).abs() < EPSILON);

        let streamed = fills.recv().await.unwrap();
        assert_eq!(streamed.order_id, ack.order_id);
        assert!((venue.position().await - 1.0).abs() < EPSILON);
        assert!(venue.get_open_orders("BTCUSDT").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_market_order_fills_at_mark() {
        let venue = PaperExchange::new("BTCUSDT", 100.0);
        let order = OrderRequest::market("BTCUSDT", OrderSide::Sell, 2.0);
        let ack = venue.place_order(&order).await.unwrap();

        assert_eq!(
            ack.status,
            AckStatus::Filled {
                avg_price: 100.0,
                filled_size: 2.0
            }
        );
        assert!((venue.position().await + 2.0).abs() < EPSILON);
    }

    #[tokio::test]
    async fn test_reduce_only_enforced() {
        let venue = PaperExchange::new("BTCUSDT", 100.0);
        let tp = OrderRequest::limit("BTCUSDT", 3, OrderSide::Sell, 101.0, 1.0).reduce_only(true);
        assert!(matches!(
            venue.place_order(&tp).await,
            Err(GatewayError::Rejected(_))
        ));

        venue
            .place_order(&OrderRequest::market("BTCUSDT", OrderSide::Buy, 1.0))
            .await
            .unwrap();
        let tp = OrderRequest::limit("BTCUSDT", 3, OrderSide::Sell, 101.0, 1.0).reduce_only(true);
        assert!(venue.place_order(&tp).await.is_ok());
    }

    #[tokio::test]
    async fn test_set_leverage() {
        let venue = PaperExchange::new("BTCUSDT", 100.0);
        assert_eq!(venue.leverage().await, 1);

        venue.set_leverage("BTCUSDT", 5).await.unwrap();
        assert_eq!(venue.leverage().await, 5);

        assert!(matches!(
            venue.set_leverage("ETHUSDT", 2).await,
            Err(GatewayError::InvalidParams(_))
        ));
        assert!(venue.set_leverage("BTCUSDT", 0).await.is_err());
        assert_eq!(venue.leverage().await, 5);
    }

    #[tokio::test]
    async fn test_fills_queued_without_subscriber() {
        let venue = PaperExchange::new("BTCUSDT", 100.0);
        let buy = OrderRequest::limit("BTCUSDT", 0, OrderSide::Buy, 99.0, 1.0);
        venue.place_order(&buy).await.unwrap();

        venue.set_price(98.0).await;
        let polled = venue.poll_fills("BTCUSDT").await.unwrap();
        assert_eq!(polled.len(), 1);
        assert!(venue.poll_fills("BTCUSDT").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_and_lookup() {
        let venue = PaperExchange::new("BTCUSDT", 100.0);
        let buy = OrderRequest::limit("BTCUSDT", 0, OrderSide::Buy, 99.0, 1.0);
        let ack = venue.place_order(&buy).await.unwrap();

        let found = venue
            .query_order_by_client_id("BTCUSDT", &buy.client_order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.order_id, ack.order_id);

        assert_eq!(
            venue.cancel_order("BTCUSDT", &ack.order_id).await.unwrap(),
            CancelOutcome::Canceled
        );
        assert_eq!(
            venue.cancel_order("BTCUSDT", &ack.order_id).await.unwrap(),
            CancelOutcome::NotFound
        );
        let order = venue.get_order("BTCUSDT", &ack.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Canceled);
    }
}
