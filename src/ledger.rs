//! Position Context & Paper Trader Contract (C7).
//!
//! Splits the trading surface into a read-side snapshot
//! ([`PositionContext`]) agents consult to decide what actions are even
//! legal, and a write-side ledger ([`PaperTraderLedger`]) that serializes
//! every position mutation behind a single trade lock so two concurrent
//! decision-tool calls can never race each other into an inconsistent
//! position.
//!
//! Write operations take a notional `amount_usdt`, not a percentage (§4.7):
//! callers compute `available_balance × amount_percent` themselves before
//! calling, per the engine-side responsibility the spec assigns.

use crate::error::LedgerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

/// An open position on the ledger's tracked symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Stable id assigned at open time, carried through to the
    /// [`TradeOutcome`] on close so the memory/reflection pipeline (C9) can
    /// pair a closed trade with the predictions agents made when it opened.
    pub trade_id: String,
    pub side: PositionSide,
    pub entry_price: f64,
    /// Notional USDT size, not a percentage.
    pub amount_usdt: f64,
    pub leverage: u32,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub opened_at: chrono::DateTime<chrono::Utc>,
}

impl Position {
    pub fn margin_used(&self) -> f64 {
        self.amount_usdt / self.leverage.max(1) as f64
    }

    /// Distance to liquidation as a percent of entry price, approximated as
    /// the inverse of leverage (100% margin loss at `1/leverage` adverse move).
    pub fn liquidation_distance_percent(&self) -> f64 {
        100.0 / self.leverage.max(1) as f64
    }

    fn unrealized_pnl_percent(&self, current_price: f64) -> f64 {
        match self.side {
            PositionSide::Long => {
                (current_price - self.entry_price) / self.entry_price * 100.0 * self.leverage as f64
            }
            PositionSide::Short => {
                (self.entry_price - current_price) / self.entry_price * 100.0 * self.leverage as f64
            }
        }
    }

    fn tp_distance_percent(&self) -> f64 {
        ((self.take_profit_price - self.entry_price) / self.entry_price * 100.0).abs()
    }

    fn sl_distance_percent(&self) -> f64 {
        ((self.stop_loss_price - self.entry_price) / self.entry_price * 100.0).abs()
    }

    fn holding_duration(&self) -> chrono::Duration {
        chrono::Utc::now() - self.opened_at
    }
}

/// Outcome of a closed trade, the unit the memory/reflection pipeline (C9)
/// trains on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub trade_id: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub exit_price: f64,
    pub amount_usdt: f64,
    pub leverage: u32,
    pub pnl_percent: f64,
    pub opened_at: chrono::DateTime<chrono::Utc>,
    pub closed_at: chrono::DateTime<chrono::Utc>,
}

impl TradeOutcome {
    pub fn is_win(&self) -> bool {
        self.pnl_percent > 0.0
    }

    /// Realized P&L in USDT terms (margin-relative, not notional-relative).
    pub fn pnl_usdt(&self) -> f64 {
        (self.pnl_percent / 100.0) * (self.amount_usdt / self.leverage.max(1) as f64)
    }
}

/// Read-side snapshot of account and position state, handed to agents each
/// round so their allowed-operations set can be derived without a ledger
/// round-trip per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionContext {
    pub symbol: String,
    pub current_price: f64,
    pub available_balance: f64,
    pub total_equity: f64,
    pub max_position_percent: f64,
    pub position: Option<Position>,
}

impl PositionContext {
    /// Decision-tool operations legal given this snapshot (§4.6
    /// position-aware option set): a flat book permits `open_long`,
    /// `open_short`, `hold`; an open position of direction D permits
    /// `close_position`, `hold`, `add_{D}`, `reverse`.
    pub fn allowed_operations(&self) -> Vec<String> {
        match &self.position {
            Some(position) => vec![
                "close_position".to_string(),
                "hold".to_string(),
                format!("add_{}", position.side.as_str()),
                "reverse".to_string(),
            ],
            None => vec!["open_long".to_string(), "open_short".to_string(), "hold".to_string()],
        }
    }

    pub fn has_position(&self) -> bool {
        self.position.is_some()
    }

    pub fn direction(&self) -> Option<&'static str> {
        self.position.as_ref().map(|p| p.side.as_str())
    }

    /// Unrealized PnL percent of the open position against `current_price`, if any.
    pub fn unrealized_pnl_percent(&self) -> Option<f64> {
        self.position.as_ref().map(|p| p.unrealized_pnl_percent(self.current_price))
    }

    pub fn unrealized_pnl_usdt(&self) -> Option<f64> {
        self.position.as_ref().map(|p| {
            self.unrealized_pnl_percent().unwrap_or(0.0) / 100.0 * p.margin_used()
        })
    }

    pub fn liquidation_distance_percent(&self) -> Option<f64> {
        self.position.as_ref().map(|p| p.liquidation_distance_percent())
    }

    pub fn take_profit_distance_percent(&self) -> Option<f64> {
        self.position.as_ref().map(|p| p.tp_distance_percent())
    }

    pub fn stop_loss_distance_percent(&self) -> Option<f64> {
        self.position.as_ref().map(|p| p.sl_distance_percent())
    }

    pub fn holding_duration(&self) -> Option<chrono::Duration> {
        self.position.as_ref().map(|p| p.holding_duration())
    }

    /// Notional capacity still available before `max_position_percent` of
    /// equity is committed, used to decide whether `add_{direction}` is legal.
    pub fn remaining_headroom_usdt(&self) -> f64 {
        let committed = self.position.as_ref().map(|p| p.amount_usdt).unwrap_or(0.0);
        let cap = self.total_equity * self.max_position_percent;
        (cap - committed).max(0.0)
    }

    pub fn can_add_more(&self) -> bool {
        self.position.is_some() && self.remaining_headroom_usdt() > 0.0
    }
}

/// A source of the current market price for the ledger's tracked symbol.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn current_price(&self, symbol: &str) -> Result<f64, String>;
}

/// A fixed-price feed, useful for tests and for degraded operation when a
/// live feed is unavailable.
pub struct FixedPriceFeed(pub f64);

#[async_trait]
impl PriceFeed for FixedPriceFeed {
    async fn current_price(&self, _symbol: &str) -> Result<f64, String> {
        Ok(self.0)
    }
}

struct LedgerState {
    position: Option<Position>,
    available_balance: f64,
}

/// Reference paper-trading ledger. Single-writer via an internal trade lock:
/// every mutating call holds the same `tokio::sync::Mutex` for its whole
/// duration, so `open_long`/`open_short`/`close_position` issued concurrently
/// from different agent turns serialize rather than race. The lock lives
/// behind an `Arc`, so the handle itself is cheap to clone into the
/// execution-phase dispatcher's tool resolvers without losing the shared
/// trade lock.
#[derive(Clone)]
pub struct PaperTraderLedger {
    symbol: String,
    state: Arc<Mutex<LedgerState>>,
    price_feed: Arc<dyn PriceFeed>,
    max_position_percent: f64,
}

impl PaperTraderLedger {
    pub fn new(symbol: impl Into<String>, starting_balance: f64, price_feed: Arc<dyn PriceFeed>) -> Self {
        Self {
            symbol: symbol.into(),
            state: Arc::new(Mutex::new(LedgerState {
                position: None,
                available_balance: starting_balance,
            })),
            price_feed,
            max_position_percent: 0.30,
        }
    }

    pub fn with_max_position_percent(mut self, max_position_percent: f64) -> Self {
        self.max_position_percent = max_position_percent;
        self
    }

    /// Build a read-side snapshot for agents to consult this round.
    pub async fn snapshot(&self) -> Result<PositionContext, LedgerError> {
        let price = self
            .price_feed
            .current_price(&self.symbol)
            .await
            .map_err(LedgerError::PreconditionFailure)?;
        let state = self.state.lock().await;
        let committed = state.position.as_ref().map(|p| p.amount_usdt).unwrap_or(0.0);
        Ok(PositionContext {
            symbol: self.symbol.clone(),
            current_price: price,
            available_balance: state.available_balance,
            total_equity: state.available_balance + committed,
            max_position_percent: self.max_position_percent,
            position: state.position.clone(),
        })
    }

    /// Open a long position. Fails with [`LedgerError::AlreadyHasPosition`]
    /// if one is already open.
    pub async fn open_long(
        &self,
        leverage: u32,
        amount_usdt: f64,
        take_profit_price: f64,
        stop_loss_price: f64,
    ) -> Result<Position, LedgerError> {
        self.open(PositionSide::Long, leverage, amount_usdt, take_profit_price, stop_loss_price)
            .await
    }

    /// Open a short position. Fails with [`LedgerError::AlreadyHasPosition`]
    /// if one is already open.
    pub async fn open_short(
        &self,
        leverage: u32,
        amount_usdt: f64,
        take_profit_price: f64,
        stop_loss_price: f64,
    ) -> Result<Position, LedgerError> {
        self.open(PositionSide::Short, leverage, amount_usdt, take_profit_price, stop_loss_price)
            .await
    }

    async fn open(
        &self,
        side: PositionSide,
        leverage: u32,
        amount_usdt: f64,
        take_profit_price: f64,
        stop_loss_price: f64,
    ) -> Result<Position, LedgerError> {
        if amount_usdt <= 0.0 {
            return Err(LedgerError::PreconditionFailure(
                "amount_usdt must be positive".to_string(),
            ));
        }
        let price = self
            .price_feed
            .current_price(&self.symbol)
            .await
            .map_err(LedgerError::PreconditionFailure)?;
        validate_tp_sl(side, price, take_profit_price, stop_loss_price)?;

        let mut state = self.state.lock().await;
        if state.position.is_some() {
            return Err(LedgerError::AlreadyHasPosition);
        }
        if amount_usdt > state.available_balance * 10.0 {
            // Sanity bound: notional can't exceed 10x available balance regardless of leverage input.
            return Err(LedgerError::PreconditionFailure(
                "amount_usdt exceeds available balance capacity".to_string(),
            ));
        }
        let position = Position {
            trade_id: uuid::Uuid::new_v4().to_string(),
            side,
            entry_price: price,
            amount_usdt,
            leverage: leverage.max(1),
            take_profit_price,
            stop_loss_price,
            opened_at: chrono::Utc::now(),
        };
        state.available_balance -= position.margin_used();
        state.position = Some(position.clone());
        Ok(position)
    }

    /// Increase the notional size of an existing position in the same
    /// direction. Fails with [`LedgerError::NoPosition`] if flat, and with
    /// [`LedgerError::PreconditionFailure`] if `additional_usdt` would exceed
    /// the `max_position_percent` headroom.
    pub async fn add_to_position(&self, additional_usdt: f64) -> Result<Position, LedgerError> {
        if additional_usdt <= 0.0 {
            return Err(LedgerError::PreconditionFailure(
                "additional_usdt must be positive".to_string(),
            ));
        }
        let mut state = self.state.lock().await;
        let committed = state.position.as_ref().map(|p| p.amount_usdt).unwrap_or(0.0);
        let equity = state.available_balance + committed;
        let cap = equity * self.max_position_percent;
        if committed + additional_usdt > cap {
            return Err(LedgerError::PreconditionFailure(
                "additional_usdt exceeds remaining headroom".to_string(),
            ));
        }
        let position = state.position.as_mut().ok_or(LedgerError::NoPosition)?;
        let additional_margin = additional_usdt / position.leverage.max(1) as f64;
        if additional_margin > state.available_balance {
            return Err(LedgerError::PreconditionFailure(
                "insufficient available balance for add".to_string(),
            ));
        }
        position.amount_usdt += additional_usdt;
        state.available_balance -= additional_margin;
        Ok(state.position.clone().unwrap())
    }

    /// Close the current position and immediately open the opposite
    /// direction at the same notional size and leverage. Fails with
    /// [`LedgerError::NoPosition`] if flat.
    pub async fn reverse_position(
        &self,
        take_profit_price: f64,
        stop_loss_price: f64,
    ) -> Result<(TradeOutcome, Position), LedgerError> {
        let outcome = self.close_position().await?;
        let new_side = outcome.side.opposite();
        let position = self
            .open(new_side, outcome.leverage, outcome.amount_usdt, take_profit_price, stop_loss_price)
            .await?;
        Ok((outcome, position))
    }

    /// Close the open position, returning the realized [`TradeOutcome`].
    /// Fails with [`LedgerError::NoPosition`] if the book is flat.
    pub async fn close_position(&self) -> Result<TradeOutcome, LedgerError> {
        let price = self
            .price_feed
            .current_price(&self.symbol)
            .await
            .map_err(LedgerError::PreconditionFailure)?;

        let mut state = self.state.lock().await;
        let position = state.position.take().ok_or(LedgerError::NoPosition)?;
        let pnl_percent = position.unrealized_pnl_percent(price);
        let margin = position.margin_used();
        state.available_balance += margin + margin * (pnl_percent / 100.0);
        Ok(TradeOutcome {
            trade_id: position.trade_id,
            side: position.side,
            entry_price: position.entry_price,
            exit_price: price,
            amount_usdt: position.amount_usdt,
            leverage: position.leverage,
            pnl_percent,
            opened_at: position.opened_at,
            closed_at: chrono::Utc::now(),
        })
    }

    /// No-op decision, recorded by callers for observability only.
    pub async fn hold(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// Enforce that TP sits above entry and SL below for a long, and the reverse
/// for a short (§3 Trading Signal invariant, also applied at the ledger
/// boundary so a malformed open is rejected rather than silently accepted).
fn validate_tp_sl(
    side: PositionSide,
    entry: f64,
    take_profit_price: f64,
    stop_loss_price: f64,
) -> Result<(), LedgerError> {
    let ok = match side {
        PositionSide::Long => take_profit_price > entry && entry > stop_loss_price,
        PositionSide::Short => take_profit_price < entry && entry < stop_loss_price,
    };
    if ok {
        Ok(())
    } else {
        Err(LedgerError::PreconditionFailure(format!(
            "tp/sl on wrong side of entry for {:?}: entry={} tp={} sl={}",
            side, entry, take_profit_price, stop_loss_price
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_at(price: f64) -> PaperTraderLedger {
        PaperTraderLedger::new("BTC-USDT-SWAP", 10_000.0, Arc::new(FixedPriceFeed(price)))
    }

    #[tokio::test]
    async fn snapshot_reflects_flat_book() {
        let ledger = ledger_at(100.0);
        let snap = ledger.snapshot().await.unwrap();
        assert!(!snap.has_position());
        assert_eq!(snap.allowed_operations(), vec!["open_long", "open_short", "hold"]);
    }

    #[tokio::test]
    async fn opening_twice_fails_with_already_has_position() {
        let ledger = ledger_at(100.0);
        ledger.open_long(5, 1000.0, 110.0, 90.0).await.unwrap();
        let err = ledger.open_short(5, 1000.0, 90.0, 110.0).await.unwrap_err();
        assert_eq!(err, LedgerError::AlreadyHasPosition);
    }

    #[tokio::test]
    async fn closing_flat_book_fails_with_no_position() {
        let ledger = ledger_at(100.0);
        let err = ledger.close_position().await.unwrap_err();
        assert_eq!(err, LedgerError::NoPosition);
    }

    #[tokio::test]
    async fn rejects_tp_sl_on_wrong_side_for_long() {
        let ledger = ledger_at(100.0);
        let err = ledger.open_long(2, 1000.0, 90.0, 110.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::PreconditionFailure(_)));
    }

    #[tokio::test]
    async fn long_position_at_unchanged_price_has_zero_pnl() {
        let ledger = ledger_at(100.0);
        ledger.open_long(2, 1000.0, 110.0, 90.0).await.unwrap();
        let outcome = ledger.close_position().await.unwrap();
        assert_eq!(outcome.pnl_percent, 0.0);
        assert!(!outcome.is_win());
    }

    #[tokio::test]
    async fn allowed_operations_restricted_when_position_open() {
        let ledger = ledger_at(100.0);
        ledger.open_short(3, 1000.0, 90.0, 110.0).await.unwrap();
        let snap = ledger.snapshot().await.unwrap();
        assert_eq!(
            snap.allowed_operations(),
            vec!["close_position", "hold", "add_short", "reverse"]
        );
    }

    #[tokio::test]
    async fn add_to_position_requires_existing_position() {
        let ledger = ledger_at(100.0);
        let err = ledger.add_to_position(500.0).await.unwrap_err();
        assert_eq!(err, LedgerError::NoPosition);
    }

    #[tokio::test]
    async fn add_to_position_respects_headroom_cap() {
        let ledger = ledger_at(100.0).with_max_position_percent(0.30);
        ledger.open_long(1, 2_000.0, 110.0, 90.0).await.unwrap();
        // 30% of 10_000 equity = 3_000 cap; already committed 2_000, so 2_000 more overflows.
        let err = ledger.add_to_position(2_000.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::PreconditionFailure(_)));
    }

    #[tokio::test]
    async fn add_to_position_within_headroom_increases_size() {
        let ledger = ledger_at(100.0).with_max_position_percent(0.30);
        ledger.open_long(1, 2_000.0, 110.0, 90.0).await.unwrap();
        let position = ledger.add_to_position(500.0).await.unwrap();
        assert_eq!(position.amount_usdt, 2_500.0);
    }

    #[tokio::test]
    async fn reverse_position_flips_direction() {
        let ledger = ledger_at(100.0);
        ledger.open_long(2, 1000.0, 110.0, 90.0).await.unwrap();
        let (outcome, new_position) = ledger.reverse_position(90.0, 110.0).await.unwrap();
        assert_eq!(outcome.side, PositionSide::Long);
        assert_eq!(new_position.side, PositionSide::Short);
    }

    #[tokio::test]
    async fn trade_lock_serializes_concurrent_opens() {
        let ledger = Arc::new(ledger_at(100.0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.open_long(2, 500.0, 110.0, 90.0).await
            }));
        }
        let results: Vec<_> = futures_util::future::join_all(handles).await;
        let successes = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn can_add_more_false_when_headroom_exhausted() {
        let ledger = ledger_at(100.0).with_max_position_percent(0.10);
        ledger.open_long(1, 1_000.0, 110.0, 90.0).await.unwrap();
        let snap = ledger.snapshot().await.unwrap();
        assert!(!snap.can_add_more());
    }
}
