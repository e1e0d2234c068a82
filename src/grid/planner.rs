//! Grid planner - level layout, order sizing and re-entry mapping
//!
//! Everything here is a pure function of the bot configuration and a
//! reference price, so the engine can recompute the plan at any time.

use std::cmp::Ordering;

use log::{debug, warn};

use super::config::BotConfig;
use super::errors::{GridError, GridResult};
use super::types::{ContractType, Direction, GridLevel, LevelRole, OrderSide};

/// Relative slack allowed when comparing committed notional against capital
const CAPITAL_TOLERANCE: f64 = 1e-6;

/// Where a filled level's replacement order goes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReentryTarget {
    pub index: u32,
    pub side: OrderSide,
    pub role: LevelRole,
}

/// Stateless grid planner
#[derive(Debug, Clone, Copy, Default)]
pub struct GridPlanner;

impl GridPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Price bounds of the grid
    ///
    /// Explicit bounds win; otherwise the range is centered on the reference
    /// price with a full width of `range_pct` percent.
    pub fn bounds(&self, config: &BotConfig, reference_price: f64) -> GridResult<(f64, f64)> {
        let (lower, upper) = match (config.lower_price, config.upper_price, config.range_pct) {
            (Some(lower), Some(upper), _) => (lower, upper),
            (_, _, Some(pct)) => {
                if !(reference_price > 0.0) {
                    return Err(GridError::Configuration(format!(
                        "reference price must be positive, got {}",
                        reference_price
                    )));
                }
                let half_range = reference_price * pct / 100.0 / 2.0;
                (reference_price - half_range, reference_price + half_range)
            }
            _ => {
                return Err(GridError::Configuration(
                    "no price range configured".into(),
                ))
            }
        };

        let lower = config.precision.round_price(lower);
        let upper = config.precision.round_price(upper);
        if lower <= 0.0 || lower >= upper {
            return Err(GridError::Configuration(format!(
                "invalid grid range [{}, {}]",
                lower, upper
            )));
        }
        Ok((lower, upper))
    }

    /// Compute the ladder of grid levels around the reference price
    ///
    /// `grid_count + 1` evenly spaced points span the range; the point
    /// nearest the reference price is left out, so exactly `grid_count`
    /// levels remain. Levels below the reference buy, levels above sell.
    pub fn compute_levels(&self, config: &BotConfig, reference_price: f64) -> GridResult<Vec<GridLevel>> {
        config.validate()?;
        let (lower, upper) = self.bounds(config, reference_price)?;
        let step = (upper - lower) / config.grid_count as f64;

        let points: Vec<f64> = (0..=config.grid_count)
            .map(|i| config.precision.round_price(lower + step * i as f64))
            .collect();

        let skip = points
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                let diff_a = (*a - reference_price).abs();
                let diff_b = (*b - reference_price).abs();
                diff_a.partial_cmp(&diff_b).unwrap_or(Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(0);

        let prices: Vec<f64> = points
            .into_iter()
            .enumerate()
            .filter(|(i, _)| *i != skip)
            .map(|(_, p)| p)
            .collect();

        if prices.windows(2).any(|w| w[1] <= w[0]) {
            return Err(GridError::Configuration(format!(
                "grid step {:.8} collapses at tick size {}",
                step, config.precision.tick_size
            )));
        }

        let count = prices.len() as u32;
        let mut levels = Vec::with_capacity(prices.len());
        for (i, price) in prices.into_iter().enumerate() {
            let index = i as u32;
            let side = if price < reference_price {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            };
            let size = self.compute_order_size(config, price)?;
            let mut level = GridLevel::new(
                index,
                price,
                side,
                size,
                LevelRole::for_side(config.direction, side),
            );
            level.paired_index = self
                .compute_reentry_level(count, index, side, config.direction)
                .map(|t| t.index);
            levels.push(level);
        }

        debug!(
            "Computed {} levels in [{}, {}] step {:.4} around {}",
            levels.len(),
            lower,
            upper,
            step,
            reference_price
        );

        Ok(levels)
    }

    /// Order size for a level at `level_price`
    ///
    /// Linear: base-asset units, `capital_per_level × leverage / price`.
    /// Inverse: contracts, `capital_per_level × leverage`.
    /// Rounded down to the lot size.
    pub fn compute_order_size(&self, config: &BotConfig, level_price: f64) -> GridResult<f64> {
        if !(level_price > 0.0) {
            return Err(GridError::Configuration(format!(
                "level price must be positive, got {}",
                level_price
            )));
        }

        let notional = config.capital_per_level() * config.leverage as f64;
        let raw = match config.contract_type {
            ContractType::Linear => notional / level_price,
            ContractType::Inverse => notional,
        };
        let size = config.precision.round_size(raw);

        if size <= 0.0 || size < config.precision.min_qty {
            return Err(GridError::Configuration(format!(
                "order size {} at {} is below minimum quantity {}",
                size, level_price, config.precision.min_qty
            )));
        }
        Ok(size)
    }

    /// Size of the initial directional market order, if any
    pub fn initial_position_size(&self, config: &BotConfig, reference_price: f64) -> GridResult<Option<f64>> {
        if config.direction == Direction::Neutral || config.initial_position_pct <= 0.0 {
            return Ok(None);
        }

        let notional = config.initial_position_margin() * config.leverage as f64;
        let raw = match config.contract_type {
            ContractType::Linear => notional / reference_price,
            ContractType::Inverse => notional,
        };
        let size = config.precision.round_size(raw);

        if size <= 0.0 || size < config.precision.min_qty {
            return Err(GridError::Configuration(format!(
                "initial position size {} is below minimum quantity {}",
                size, config.precision.min_qty
            )));
        }
        Ok(Some(size))
    }

    /// Part of the initial position still to open when `held` is already carried
    ///
    /// None when the held position covers the target, or the remainder is
    /// below the minimum quantity.
    pub fn initial_top_up(&self, config: &BotConfig, initial_size: Option<f64>, held: f64) -> Option<f64> {
        let target = initial_size?;
        let size = config.precision.round_size(target - held.abs());
        if size <= 0.0 || size < config.precision.min_qty {
            None
        } else {
            Some(size)
        }
    }

    /// Where the replacement for a filled level goes
    ///
    /// A filled buy at index i re-opens as a sell at i+1, a filled sell at i
    /// as a buy at i-1. The direction only decides whether the new order is a
    /// take-profit or a re-entry. Returns None when the target falls off the
    /// ladder (grid exhaustion).
    pub fn compute_reentry_level(
        &self,
        level_count: u32,
        filled_index: u32,
        filled_side: OrderSide,
        direction: Direction,
    ) -> Option<ReentryTarget> {
        if level_count == 0 {
            return None;
        }
        let last = level_count as i64 - 1;
        let raw = match filled_side {
            OrderSide::Buy => filled_index as i64 + 1,
            OrderSide::Sell => filled_index as i64 - 1,
        };
        let clamped = raw.clamp(0, last) as u32;
        if clamped == filled_index {
            return None;
        }

        let side = filled_side.opposite();
        Some(ReentryTarget {
            index: clamped,
            side,
            role: LevelRole::for_side(direction, side),
        })
    }

    /// Same as `compute_reentry_level`, logging exhaustion
    pub fn replacement_for(&self, levels: &[GridLevel], filled: &GridLevel, direction: Direction) -> Option<ReentryTarget> {
        let target = self.compute_reentry_level(levels.len() as u32, filled.index, filled.side, direction);
        if target.is_none() {
            warn!(
                "Grid exhausted: {:?} fill at level {} ({}) has no replacement level",
                filled.side, filled.index, filled.price
            );
        }
        target
    }

    /// Leverage-adjusted capital committed by the levels and the position
    ///
    /// `position_size` is the absolute position the bot holds once started:
    /// any carried position plus the initial market order.
    pub fn committed_notional(
        &self,
        config: &BotConfig,
        levels: &[GridLevel],
        position_size: Option<f64>,
        reference_price: f64,
    ) -> f64 {
        let leverage = config.leverage.max(1) as f64;
        let levels_notional: f64 = levels
            .iter()
            .map(|l| config.contract_type.notional(l.size, l.price))
            .sum();
        let position_notional = position_size
            .map(|s| config.contract_type.notional(s.abs(), reference_price))
            .unwrap_or(0.0);
        (levels_notional + position_notional) / leverage
    }

    /// Fail if the plan commits more than the configured capital
    pub fn check_capital(
        &self,
        config: &BotConfig,
        levels: &[GridLevel],
        position_size: Option<f64>,
        reference_price: f64,
    ) -> GridResult<f64> {
        let committed = self.committed_notional(config, levels, position_size, reference_price);
        if committed > config.capital * (1.0 + CAPITAL_TOLERANCE) {
            return Err(GridError::Configuration(format!(
                "committed capital {:.2} exceeds configured capital {:.2}",
                committed, config.capital
            )));
        }
        Ok(committed)
    }
}
