use std::fmt;

use crate::types::money::Money;
use crate::types::order::{Direction, Order};

/// Derived account summary. Always recomputed from the book and the quote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Holdings {
    pub cash: Money,
    /// Shares held. Positive = long, negative = short.
    pub position: i64,
    /// Net asset value: cash plus position marked at the last trade price.
    pub nav: Money,
}

impl Holdings {
    pub fn apply_order(&mut self, order: &Order) {
        let filled = i64::try_from(order.total_filled).unwrap_or(i64::MAX);
        let cash_value = Money::from_unsigned(order.cash_value());

        match order.direction {
            Direction::Buy => {
                self.position = self.position.saturating_add(filled);
                self.cash -= cash_value;
            }
            Direction::Sell => {
                self.position = self.position.saturating_sub(filled);
                self.cash += cash_value;
            }
        }
    }

    pub fn mark(&mut self, last_price: u64) {
        self.nav = self.cash + Money::from_unsigned(last_price) * self.position;
    }

    /// True when cash and position match; NAV moves with every trade.
    pub fn same_position(&self, other: &Holdings) -> bool {
        self.cash == other.cash && self.position == other.position
    }
}

impl fmt::Display for Holdings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CASH : {} : POS : {} : NAV : {}",
            self.cash, self.position, self.nav
        )
    }
}
