use super::types::{Portfolio, Position, Trade};
use chrono::NaiveDate;
use rust_decimal::Decimal;

/// Opens and closes the single long position a portfolio may hold.
pub struct PositionManager;

impl PositionManager {
    /// Buys up to `size` units at `price`, capped by available cash.
    pub fn execute_buy(
        portfolio: &mut Portfolio,
        date: NaiveDate,
        price: Decimal,
        size: Decimal,
    ) -> Option<Position> {
        if portfolio.position.is_some() {
            tracing::debug!("Position already open on {}, ignoring buy", date);
            return None;
        }
        if price <= Decimal::ZERO || size <= Decimal::ZERO {
            tracing::warn!("Invalid buy on {}: price {} size {}", date, price, size);
            return None;
        }

        let affordable = portfolio.cash / price;
        let quantity = size.min(affordable);
        if quantity <= Decimal::ZERO {
            tracing::warn!("Insufficient cash for buy order on {}", date);
            return None;
        }
        if quantity < size {
            tracing::debug!(
                "Buy on {} reduced from {} to {} by available cash",
                date,
                size,
                quantity
            );
        }

        portfolio.cash -= quantity * price;
        let position = Position {
            entry_date: date,
            entry_price: price,
            size: quantity,
        };

        tracing::info!(
            "Opening LONG position on {} at {} (size: {})",
            date,
            price,
            quantity
        );

        portfolio.position = Some(position.clone());
        Some(position)
    }

    /// Sells the whole open position at `price`.
    pub fn close_position(
        portfolio: &mut Portfolio,
        date: NaiveDate,
        price: Decimal,
    ) -> Option<Trade> {
        let position = portfolio.position.take()?;
        portfolio.cash += position.size * price;

        let pnl = (price - position.entry_price) * position.size;
        let pnl_percent = if position.entry_price.is_zero() {
            Decimal::ZERO
        } else {
            (price - position.entry_price) / position.entry_price * Decimal::ONE_HUNDRED
        };

        tracing::info!(
            "Closing LONG position: {} -> {} | P&L: {} ({:.2}%)",
            position.entry_price,
            price,
            pnl,
            pnl_percent
        );

        Some(Trade {
            entry_date: position.entry_date,
            exit_date: date,
            entry_price: position.entry_price,
            exit_price: price,
            size: position.size,
            pnl,
            pnl_percent,
        })
    }
}
