use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    #[default]
    Buy,
    Sell,
}

impl Direction {
    pub fn as_wire(self) -> &'static str {
        match self {
            Direction::Buy => "buy",
            Direction::Sell => "sell",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUYY"),
            Direction::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(anyhow!("unknown direction: {other}")),
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OrderType {
    /// Matches what it can, rests the remainder until cancelled.
    #[default]
    Limit,
    /// Executes against the book at any price.
    Market,
    /// All-or-nothing immediate execution; cancelled when it cannot fill fully.
    FillOrKill,
    /// Immediate execution, partial fills allowed, remainder cancelled.
    ImmediateOrCancel,
}

impl OrderType {
    pub fn as_wire(self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
            OrderType::FillOrKill => "fill-or-kill",
            OrderType::ImmediateOrCancel => "immediate-or-cancel",
        }
    }

    /// Types whose remaining plus filled quantity always equals the original.
    pub fn conserves_quantity(self) -> bool {
        matches!(self, OrderType::Limit | OrderType::Market)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl FromStr for OrderType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "limit" => Ok(Self::Limit),
            "market" => Ok(Self::Market),
            "fill-or-kill" | "fok" => Ok(Self::FillOrKill),
            "immediate-or-cancel" | "ioc" => Ok(Self::ImmediateOrCancel),
            other => Err(anyhow!("unknown order type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fill {
    pub price: u64,
    pub quantity: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Order {
    pub open: bool,
    pub complete: bool,
    pub account: String,
    pub symbol: String,
    pub direction: Direction,
    pub order_type: OrderType,
    pub fills: Vec<Fill>,
    /// Requested quantity.
    pub original_quantity: u64,
    /// Price on the order, which may differ from the fill prices.
    pub price: u64,
    /// Unfilled quantity.
    pub remaining_quantity: u64,
    pub total_filled: u64,
    /// When the venue received the order.
    pub timestamp: String,
}

impl Order {
    /// Sum of price times quantity over every fill, in cents. Saturates.
    pub fn cash_value(&self) -> u64 {
        self.fills.iter().fold(0u64, |total, fill| {
            total.saturating_add(fill.price.saturating_mul(fill.quantity))
        })
    }

    pub fn last_fill(&self) -> Option<&Fill> {
        self.fills.last()
    }
}

/// Venue symbol plus the venue's order id, unique on that venue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderKey {
    pub venue: String,
    pub id: u64,
}

impl OrderKey {
    pub fn new(venue: impl Into<String>, id: u64) -> Self {
        Self {
            venue: venue.into(),
            id,
        }
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.venue, self.id)
    }
}

pub type OrderBook = BTreeMap<OrderKey, Order>;

#[derive(Debug, Clone, Default)]
pub struct Execution {
    pub order: Order,
    pub account: String,
    pub venue: String,
    pub symbol: String,
    pub standing_id: u64,
    pub incoming_id: u64,
    pub price: u64,
    pub filled: u64,
    pub filled_at: String,
    pub standing_complete: bool,
    pub incoming_complete: bool,
}
