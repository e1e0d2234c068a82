//! Position accounting - net size, average entry and P&L
//!
//! Linear contracts average the entry price by size and book P&L in quote
//! currency. Inverse contracts average by contracts over price (harmonic
//! mean) and book P&L in the base asset.

use log::debug;
use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};
use super::types::{ContractType, Direction, Fill, OrderSide, EPSILON};

/// Point-in-time view of the position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// Signed net size (positive = long)
    pub net_size: f64,
    pub avg_entry_price: f64,
    pub direction: Direction,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub mark_price: f64,
    /// Traded notional across all fills
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub fill_count: u64,
    /// Fills that closed exposure and realized P&L
    #[serde(default)]
    pub round_trips: u64,
}

/// Result of applying a fill
#[derive(Debug, Clone, Copy)]
struct Transition {
    net_size: f64,
    avg_entry: f64,
    realized: f64,
    closed: bool,
}

/// Tracks one bot's position and enforces the directional invariant
#[derive(Debug, Clone)]
pub struct PositionAccountant {
    direction: Direction,
    contract_type: ContractType,
    net_size: f64,
    avg_entry: f64,
    realized_pnl: f64,
    mark_price: f64,
    volume: f64,
    fill_count: u64,
    round_trips: u64,
}

impl PositionAccountant {
    pub fn new(direction: Direction, contract_type: ContractType) -> Self {
        Self {
            direction,
            contract_type,
            net_size: 0.0,
            avg_entry: 0.0,
            realized_pnl: 0.0,
            mark_price: 0.0,
            volume: 0.0,
            fill_count: 0,
            round_trips: 0,
        }
    }

    /// Restore from a persisted snapshot
    pub fn from_snapshot(snapshot: &PositionSnapshot, contract_type: ContractType) -> Self {
        Self {
            direction: snapshot.direction,
            contract_type,
            net_size: snapshot.net_size,
            avg_entry: snapshot.avg_entry_price,
            realized_pnl: snapshot.realized_pnl,
            mark_price: snapshot.mark_price,
            volume: snapshot.volume,
            fill_count: snapshot.fill_count,
            round_trips: snapshot.round_trips,
        }
    }

    pub fn net_size(&self) -> f64 {
        self.net_size
    }

    pub fn avg_entry_price(&self) -> f64 {
        self.avg_entry
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn contract_type(&self) -> ContractType {
        self.contract_type
    }

    pub fn is_flat(&self) -> bool {
        self.net_size.abs() <= EPSILON
    }

    pub fn set_mark_price(&mut self, price: f64) {
        if price > 0.0 {
            self.mark_price = price;
        }
    }

    /// Apply a confirmed fill, returning the realized P&L delta
    ///
    /// A fill that would flip net exposure against a long or short bias is
    /// rejected with `InvariantViolation` and leaves the position unchanged.
    pub fn apply_fill(&mut self, fill: &Fill) -> GridResult<f64> {
        if !(fill.size > 0.0) || !(fill.price > 0.0) {
            return Err(GridError::InvariantViolation(format!(
                "fill {} has non-positive size {} or price {}",
                fill.fill_id, fill.size, fill.price
            )));
        }

        let next = self.transition(fill.side, fill.price, fill.size);

        match self.direction {
            Direction::Long if next.net_size < -EPSILON => {
                return Err(GridError::InvariantViolation(format!(
                    "{:?} fill of {} would flip long position {} to {}",
                    fill.side, fill.size, self.net_size, next.net_size
                )));
            }
            Direction::Short if next.net_size > EPSILON => {
                return Err(GridError::InvariantViolation(format!(
                    "{:?} fill of {} would flip short position {} to {}",
                    fill.side, fill.size, self.net_size, next.net_size
                )));
            }
            _ => {}
        }

        self.net_size = next.net_size;
        self.avg_entry = next.avg_entry;
        self.realized_pnl += next.realized;
        self.volume += self.contract_type.notional(fill.size, fill.price);
        self.fill_count += 1;
        if next.closed {
            self.round_trips += 1;
        }

        debug!(
            "Applied {:?} {} @ {}: net={} entry={:.4} realized_delta={:.6}",
            fill.side, fill.size, fill.price, self.net_size, self.avg_entry, next.realized
        );

        Ok(next.realized)
    }

    fn transition(&self, side: OrderSide, price: f64, size: f64) -> Transition {
        let qty = side.sign() * size;
        let current = self.net_size;

        // Opening or adding to exposure
        if current.abs() <= EPSILON || current.signum() == qty.signum() {
            let held = current.abs();
            let avg_entry = match self.contract_type {
                ContractType::Linear => (held * self.avg_entry + size * price) / (held + size),
                ContractType::Inverse => {
                    let weight = if held > EPSILON { held / self.avg_entry } else { 0.0 };
                    (held + size) / (weight + size / price)
                }
            };
            return Transition {
                net_size: current + qty,
                avg_entry,
                realized: 0.0,
                closed: false,
            };
        }

        // Reducing, possibly crossing zero
        let closing = size.min(current.abs());
        let realized = self.pnl(closing, self.avg_entry, price, current.signum());
        let net_size = current + qty;

        let (net_size, avg_entry) = if net_size.abs() <= EPSILON {
            (0.0, 0.0)
        } else if net_size.signum() != current.signum() {
            // Remainder opens fresh exposure at the fill price
            (net_size, price)
        } else {
            (net_size, self.avg_entry)
        };

        Transition {
            net_size,
            avg_entry,
            realized,
            closed: true,
        }
    }

    fn pnl(&self, size: f64, entry: f64, price: f64, sign: f64) -> f64 {
        if entry <= 0.0 || price <= 0.0 {
            return 0.0;
        }
        match self.contract_type {
            ContractType::Linear => (price - entry) * size * sign,
            ContractType::Inverse => size * (1.0 / entry - 1.0 / price) * sign,
        }
    }

    /// Unrealized P&L at `mark_price`
    pub fn unrealized_pnl(&self, mark_price: f64) -> f64 {
        if self.is_flat() {
            return 0.0;
        }
        self.pnl(
            self.net_size.abs(),
            self.avg_entry,
            mark_price,
            self.net_size.signum(),
        )
    }

    pub fn snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            net_size: self.net_size,
            avg_entry_price: self.avg_entry,
            direction: self.direction,
            realized_pnl: self.realized_pnl,
            unrealized_pnl: self.unrealized_pnl(self.mark_price),
            mark_price: self.mark_price,
            volume: self.volume,
            fill_count: self.fill_count,
            round_trips: self.round_trips,
        }
    }
}
