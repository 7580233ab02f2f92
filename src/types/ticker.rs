use std::fmt;

/// Top of book plus the last trade for one symbol. Prices are cents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ticker {
    // Buyers
    /// Best price currently bid.
    pub bid: u64,
    /// Aggregate size of all orders at the best bid.
    pub bid_size: u64,
    /// Aggregate size of all bids.
    pub bid_depth: u64,

    // Sellers
    pub ask: u64,
    pub ask_size: u64,
    pub ask_depth: u64,

    pub last: u64,
    pub last_size: u64,

    /// Timestamp of the last trade.
    pub last_trade: String,
    /// Server timestamp of quote generation. ISO-8601, so string order is time order.
    pub quote_time: String,
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QUOT : {} ({}) : {} ({}) : {} ({})",
            self.bid, self.bid_size, self.last, self.last_size, self.ask, self.ask_size
        )
    }
}
