use std::collections::BTreeMap;

use anyhow::Result;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::types::order::{Execution, Fill, Order, OrderKey};
use crate::types::ticker::Ticker;
use crate::types::world::WorldStatus;
use crate::venue::client::error_check;
use crate::venue::error::VenueError;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FillMessage {
    pub price: u64,
    pub qty: u64,
    pub ts: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderMessage {
    pub id: u64,
    pub venue: String,
    pub account: String,
    pub symbol: String,
    pub direction: String,
    pub order_type: String,
    pub original_qty: u64,
    pub qty: u64,
    pub price: u64,
    pub total_filled: u64,
    pub ts: String,
    pub open: bool,
    pub fills: Vec<FillMessage>,
}

impl OrderMessage {
    pub fn into_entry(self) -> Result<(OrderKey, Order)> {
        let key = OrderKey::new(self.venue, self.id);

        let order = Order {
            open: self.open,
            complete: self.qty == 0,
            account: self.account,
            symbol: self.symbol,
            direction: self.direction.parse()?,
            order_type: self.order_type.parse()?,
            fills: self
                .fills
                .into_iter()
                .map(|fill| Fill {
                    price: fill.price,
                    quantity: fill.qty,
                    timestamp: fill.ts,
                })
                .collect(),
            original_quantity: self.original_qty,
            price: self.price,
            remaining_quantity: self.qty,
            total_filled: self.total_filled,
            timestamp: self.ts,
        };

        Ok((key, order))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuoteMessage {
    pub bid: u64,
    pub bid_size: u64,
    pub bid_depth: u64,
    pub ask: u64,
    pub ask_size: u64,
    pub ask_depth: u64,
    pub last: u64,
    pub last_size: u64,
    pub last_trade: String,
    pub quote_time: String,
}

impl From<QuoteMessage> for Ticker {
    fn from(quote: QuoteMessage) -> Self {
        Ticker {
            bid: quote.bid,
            bid_size: quote.bid_size,
            bid_depth: quote.bid_depth,
            ask: quote.ask,
            ask_size: quote.ask_size,
            ask_depth: quote.ask_depth,
            last: quote.last,
            last_size: quote.last_size,
            last_trade: quote.last_trade,
            quote_time: quote.quote_time,
        }
    }
}

/// One frame of the ticker tape stream.
#[derive(Debug, Deserialize)]
pub struct TickerMessage {
    pub quote: QuoteMessage,
}

/// One frame of the executions stream.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionMessage {
    pub order: OrderMessage,
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

impl ExecutionMessage {
    /// Keyed by the order it reports on.
    pub fn into_execution(self) -> Result<(OrderKey, Execution)> {
        let (key, order) = self.order.into_entry()?;

        let execution = Execution {
            order,
            account: self.account,
            venue: self.venue,
            symbol: self.symbol,
            standing_id: self.standing_id,
            incoming_id: self.incoming_id,
            price: self.price,
            filled: self.filled,
            filled_at: self.filled_at,
            standing_complete: self.standing_complete,
            incoming_complete: self.incoming_complete,
        };

        Ok((key, execution))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorldDetails {
    pub end_of_the_world_day: i32,
    pub trading_day: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WorldMessage {
    pub done: bool,
    pub state: String,
    pub flash: BTreeMap<String, Value>,
    pub details: WorldDetails,
}

impl WorldMessage {
    pub fn into_status(self) -> WorldStatus {
        let flash = self
            .flash
            .into_iter()
            .map(|(kind, text)| {
                let text = match text {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                (kind, text)
            })
            .collect();

        WorldStatus {
            done: self.done,
            state: self.state,
            last_trading_day: self.details.end_of_the_world_day,
            current_trading_day: self.details.trading_day.unwrap_or(-1),
            flash,
        }
    }
}

/// Reply to a level start.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LevelStart {
    pub account: String,
    pub instance_id: u64,
    pub seconds_per_trading_day: u64,
    pub tickers: Vec<String>,
    pub venues: Vec<String>,
    pub instructions: BTreeMap<String, String>,
}

pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| VenueError::Malformed(e.to_string()).into())
}

/// Parses a stream frame and rejects frames the venue flagged as errors.
pub fn decode_frame<T: DeserializeOwned>(text: &str) -> Result<T> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| VenueError::Malformed(format!("{e}; raw={text}")))?;
    error_check(&value)?;
    decode(value)
}

pub fn decode_ticker(text: &str) -> Result<Ticker> {
    let message: TickerMessage = decode_frame(text)?;
    Ok(message.quote.into())
}

pub fn decode_execution(text: &str) -> Result<(OrderKey, Execution)> {
    let message: ExecutionMessage = decode_frame(text)?;
    message.into_execution()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::order::{Direction, OrderType};

    #[test]
    fn test_decode_ticker_with_missing_sides() {
        let text = r#"{"ok":true,"quote":{"symbol":"FOOBAR","venue":"TESTEX",
            "bid":5100,"bidSize":392,"bidDepth":2748,
            "last":5125,"lastSize":52,"lastTrade":"2015-07-13T05:38:17.33640392Z",
            "quoteTime":"2015-07-13T05:38:17.33640392Z"}}"#;

        let ticker = decode_ticker(text).unwrap();

        assert_eq!(ticker.bid, 5100);
        assert_eq!(ticker.bid_depth, 2748);
        assert_eq!(ticker.ask, 0);
        assert_eq!(ticker.last, 5125);
        assert_eq!(ticker.quote_time, "2015-07-13T05:38:17.33640392Z");
    }

    #[test]
    fn test_decode_frame_rejects_error_frames() {
        assert!(decode_ticker(r#"{"ok":false,"error":"no such venue"}"#).is_err());
        assert!(decode_ticker("not json").is_err());
    }

    #[test]
    fn test_decode_execution() {
        let text = r#"{"ok":true,"account":"EXB123456","venue":"TESTEX","symbol":"FOOBAR",
            "order":{"ok":true,"symbol":"FOOBAR","venue":"TESTEX","direction":"buy",
                "originalQty":10,"qty":4,"price":5000,"orderType":"limit","id":43,
                "account":"EXB123456","ts":"2015-07-05T22:16:18+00:00",
                "fills":[{"price":4990,"qty":6,"ts":"2015-07-05T22:16:18+00:00"}],
                "totalFilled":6,"open":true},
            "standingId":43,"incomingId":44,"price":4990,"filled":6,
            "filledAt":"2015-07-05T22:16:18+00:00",
            "standingComplete":false,"incomingComplete":true}"#;

        let (key, execution) = decode_execution(text).unwrap();

        assert_eq!(key, OrderKey::new("TESTEX", 43));
        assert_eq!(execution.order.direction, Direction::Buy);
        assert_eq!(execution.order.order_type, OrderType::Limit);
        assert_eq!(execution.order.remaining_quantity, 4);
        assert_eq!(execution.order.cash_value(), 29940);
        assert!(!execution.order.complete);
        assert!(execution.incoming_complete);
    }

    #[test]
    fn test_world_without_trading_day() {
        let value = serde_json::json!({
            "ok": true,
            "done": false,
            "state": "open",
            "details": {"endOfTheWorldDay": 365},
            "flash": {"info": "welcome"}
        });

        let world = decode::<WorldMessage>(value).unwrap().into_status();

        assert_eq!(world.state, "open");
        assert_eq!(world.last_trading_day, 365);
        assert_eq!(world.current_trading_day, -1);
        assert_eq!(world.flash.get("info").map(String::as_str), Some("welcome"));
    }
}
