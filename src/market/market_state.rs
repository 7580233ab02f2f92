use anyhow::{Context, Result, anyhow, ensure};
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::scheduling::ReentrancyGuard;
use crate::types::holdings::Holdings;
use crate::types::order::{Direction, Execution, Order, OrderBook, OrderKey, OrderType};
use crate::types::ticker::Ticker;
use crate::types::world::WorldStatus;
use crate::venue::client::{OrderRequest, VenueClient, error_check};
use crate::venue::messages::LevelStart;

/// The running level instance this engine trades in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub instance_id: u64,
    pub account: String,
    pub venue: String,
    pub symbol: String,
    pub seconds_per_day: u64,
}

/// Outcome of a ticker merge. Both snapshots are copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerUpdate {
    pub changed: bool,
    pub previous: Ticker,
    pub current: Ticker,
}

#[derive(Debug, Default)]
struct Readiness {
    ready: bool,
    closed: bool,
}

/// Quote, order book and world status for one session.
///
/// The quote and the book are locked separately and no operation holds both.
/// Nothing here does I/O while holding a lock.
pub struct MarketState {
    client: VenueClient,
    session: RwLock<Option<Session>>,
    world: Mutex<WorldStatus>,
    refresh_guard: ReentrancyGuard,
    readiness: Mutex<Readiness>,
    world_ready: Condvar,
    quote: Mutex<Ticker>,
    book: Mutex<OrderBook>,
}

impl MarketState {
    pub fn new(client: VenueClient) -> Self {
        Self {
            client,
            session: RwLock::new(None),
            world: Mutex::new(WorldStatus::default()),
            refresh_guard: ReentrancyGuard::new(),
            readiness: Mutex::new(Readiness::default()),
            world_ready: Condvar::new(),
            quote: Mutex::new(Ticker::default()),
            book: Mutex::new(OrderBook::new()),
        }
    }

    pub fn client(&self) -> &VenueClient {
        &self.client
    }

    /// Starts `level` and binds the engine to its first venue and symbol.
    pub fn start(&self, level: &str) -> Result<LevelStart> {
        let started = self
            .client
            .start_level(level)
            .with_context(|| format!("failed to start level {level}"))?;

        let venue = started
            .venues
            .first()
            .ok_or_else(|| anyhow!("level {level} has no venues"))?;
        let symbol = started
            .tickers
            .first()
            .ok_or_else(|| anyhow!("level {level} has no tickers"))?;

        let session = Session {
            instance_id: started.instance_id,
            account: started.account.clone(),
            venue: venue.clone(),
            symbol: symbol.clone(),
            seconds_per_day: started.seconds_per_trading_day,
        };

        info!(
            instance = session.instance_id,
            account = %session.account,
            venue = %session.venue,
            symbol = %session.symbol,
            "level started"
        );

        *self.session.write() = Some(session);

        Ok(started)
    }

    pub fn session(&self) -> Result<Session> {
        self.session
            .read()
            .clone()
            .ok_or_else(|| anyhow!("no level is running"))
    }

    /// Fetches the world status. Returns `Ok(false)` without fetching when
    /// another refresh is already in flight.
    pub fn refresh(&self) -> Result<bool> {
        let Some(_sentry) = self.refresh_guard.try_acquire() else {
            debug!("world refresh already in flight; skipping");
            return Ok(false);
        };

        let instance_id = self.session()?.instance_id;
        let status = self.client.world(instance_id)?.into_status();
        let trading_day = status.current_trading_day;

        *self.world.lock() = status;

        if trading_day >= 0 {
            self.mark_ready();
        }

        Ok(true)
    }

    fn mark_ready(&self) {
        let mut readiness = self.readiness.lock();
        if !readiness.ready {
            readiness.ready = true;
            self.world_ready.notify_all();
        }
    }

    pub fn world(&self) -> WorldStatus {
        self.world.lock().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.lock().ready
    }

    /// Blocks until the first refresh that reports a trading day. Returns
    /// false when released by `close` instead.
    pub fn world_wide_wait(&self) -> bool {
        let mut readiness = self.readiness.lock();
        while !readiness.ready && !readiness.closed {
            self.world_ready.wait(&mut readiness);
        }
        readiness.ready
    }

    /// Releases every thread parked in `world_wide_wait`.
    pub fn close(&self) {
        let mut readiness = self.readiness.lock();
        readiness.closed = true;
        self.world_ready.notify_all();
    }

    /// Merges `incoming` into the quote. Stale quotes are dropped; a side is
    /// only replaced when its incoming price is non-zero.
    pub fn update_ticker(&self, incoming: &Ticker) -> TickerUpdate {
        let mut quote = self.quote.lock();
        let previous = quote.clone();

        if incoming.quote_time < quote.quote_time {
            return TickerUpdate {
                changed: false,
                current: previous.clone(),
                previous,
            };
        }

        if incoming.bid != 0 {
            quote.bid = incoming.bid;
            quote.bid_size = incoming.bid_size;
            quote.bid_depth = incoming.bid_depth;
        }

        if incoming.ask != 0 {
            quote.ask = incoming.ask;
            quote.ask_size = incoming.ask_size;
            quote.ask_depth = incoming.ask_depth;
        }

        if incoming.last != 0 {
            quote.last = incoming.last;
            quote.last_size = incoming.last_size;
            quote.last_trade = incoming.last_trade.clone();
        }

        quote.quote_time = incoming.quote_time.clone();

        TickerUpdate {
            changed: true,
            previous,
            current: quote.clone(),
        }
    }

    pub fn quote(&self) -> Ticker {
        self.quote.lock().clone()
    }

    /// Overwrites the book entry with the execution's order snapshot. Later
    /// reports win regardless of their fill count.
    pub fn update_position(&self, key: OrderKey, execution: &Execution) {
        self.book.lock().insert(key, execution.order.clone());
    }

    pub fn own_order(&self, key: &OrderKey) -> bool {
        self.book.lock().contains_key(key)
    }

    pub fn order(&self, key: &OrderKey) -> Option<Order> {
        self.book.lock().get(key).cloned()
    }

    pub fn holdings(&self) -> Holdings {
        let mut holdings = Holdings::default();

        {
            let book = self.book.lock();
            for order in book.values() {
                holdings.apply_order(order);
            }
        }

        let last = self.quote.lock().last;
        holdings.mark(last);

        holdings
    }

    pub fn buy(&self, price: u64, quantity: u64, order_type: OrderType) -> Result<(OrderKey, Order)> {
        self.place(Direction::Buy, price, quantity, order_type)
    }

    pub fn sell(&self, price: u64, quantity: u64, order_type: OrderType) -> Result<(OrderKey, Order)> {
        self.place(Direction::Sell, price, quantity, order_type)
    }

    fn place(
        &self,
        direction: Direction,
        price: u64,
        quantity: u64,
        order_type: OrderType,
    ) -> Result<(OrderKey, Order)> {
        let session = self.session()?;

        let (key, order) = self.client.place_order(&OrderRequest {
            account: &session.account,
            venue: &session.venue,
            symbol: &session.symbol,
            price,
            quantity,
            direction,
            order_type,
        })?;

        validate_echo(&session, &key, &order, direction, quantity, order_type)?;

        let mut book = self.book.lock();
        let entry = book.entry(key.clone()).or_insert(order).clone();

        Ok((key, entry))
    }

    pub fn cancel(&self, id: u64) -> Result<()> {
        let reply = self.cancel_nothrow(id);
        error_check(&reply).with_context(|| format!("cancel of order {id} failed"))?;
        Ok(())
    }

    /// Best-effort cancel. Returns the raw reply; a missing session, venue
    /// and transport errors all come back inside it.
    pub fn cancel_nothrow(&self, id: u64) -> Value {
        match self.session() {
            Ok(session) => self.client.cancel_order(&session.venue, &session.symbol, id),
            Err(e) => {
                warn!(order = id, "cancel skipped: {e:#}");
                json!({ "ok": false, "error": format!("{e:#}") })
            }
        }
    }
}

fn validate_echo(
    session: &Session,
    key: &OrderKey,
    order: &Order,
    direction: Direction,
    quantity: u64,
    order_type: OrderType,
) -> Result<()> {
    ensure!(
        key.venue == session.venue,
        "order {key} came back for venue {}, expected {}",
        key.venue,
        session.venue
    );
    ensure!(
        order.symbol == session.symbol,
        "order {key} came back for symbol {}, expected {}",
        order.symbol,
        session.symbol
    );
    ensure!(
        order.account == session.account,
        "order {key} came back for account {}, expected {}",
        order.account,
        session.account
    );
    ensure!(
        order.original_quantity == quantity,
        "order {key} came back with quantity {}, expected {quantity}",
        order.original_quantity
    );
    ensure!(
        order.order_type == order_type,
        "order {key} came back as {}, expected {order_type}",
        order.order_type
    );
    ensure!(
        order.direction == direction,
        "order {key} came back as {}, expected {direction}",
        order.direction
    );

    if order_type.conserves_quantity() {
        ensure!(
            order.remaining_quantity + order.total_filled == order.original_quantity,
            "order {key} quantities do not add up: {} remaining + {} filled != {} original",
            order.remaining_quantity,
            order.total_filled,
            order.original_quantity
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use serde_json::json;

    use crate::types::order::Fill;
    use crate::venue::client::Endpoints;
    use crate::venue::transport::testing::{FnTransport, ok};
    use crate::venue::transport::{ApiRequest, ApiResponse};

    const LEVEL: &str = r#"{"ok":true,"account":"ACC","instanceId":42,
        "secondsPerTradingDay":5,"tickers":["FOOBAR"],"venues":["TESTEX"],
        "instructions":{"Instructions":"buy low"}}"#;

    fn engine_with(
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse> + Send + Sync + 'static,
    ) -> (Arc<MarketState>, Arc<FnTransport>) {
        let transport = Arc::new(FnTransport::new(handler));
        let client = VenueClient::new(transport.clone(), Endpoints::default(), "key");
        (Arc::new(MarketState::new(client)), transport)
    }

    fn started_engine(
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse> + Send + Sync + 'static,
    ) -> (Arc<MarketState>, Arc<FnTransport>) {
        let (engine, transport) = engine_with(move |request| {
            if request.url.ends_with("levels/first_steps") {
                ok(LEVEL)
            } else {
                handler(request)
            }
        });
        engine.start("first_steps").unwrap();
        (engine, transport)
    }

    fn tick(quote_time: &str, bid: u64, ask: u64, last: u64) -> Ticker {
        Ticker {
            bid,
            bid_size: bid / 10,
            bid_depth: bid / 5,
            ask,
            ask_size: ask / 10,
            ask_depth: ask / 5,
            last,
            last_size: 1,
            last_trade: quote_time.to_string(),
            quote_time: quote_time.to_string(),
        }
    }

    fn filled(direction: Direction, quantity: u64, price: u64) -> Order {
        Order {
            direction,
            original_quantity: quantity,
            total_filled: quantity,
            fills: vec![Fill {
                price,
                quantity,
                timestamp: "t".to_string(),
            }],
            ..Default::default()
        }
    }

    fn execution(order: Order) -> Execution {
        Execution {
            order,
            ..Default::default()
        }
    }

    #[test]
    fn test_start_binds_session() {
        let (engine, _) = started_engine(|_| ok("{}"));
        let session = engine.session().unwrap();

        assert_eq!(session.instance_id, 42);
        assert_eq!(session.account, "ACC");
        assert_eq!(session.venue, "TESTEX");
        assert_eq!(session.symbol, "FOOBAR");
        assert_eq!(session.seconds_per_day, 5);
    }

    #[test]
    fn test_stale_ticker_is_dropped() {
        let (engine, _) = engine_with(|_| ok("{}"));

        let first = engine.update_ticker(&tick("2015-07-13T05:38:17.1Z", 100, 110, 105));
        let second = engine.update_ticker(&tick("2015-07-13T05:38:17.3Z", 101, 111, 106));
        let stale = engine.update_ticker(&tick("2015-07-13T05:38:17.1Z", 90, 95, 92));

        assert!(first.changed);
        assert!(second.changed);
        assert!(!stale.changed);
        assert_eq!(stale.previous, stale.current);
        assert_eq!(engine.quote(), second.current);
        assert_eq!(engine.quote().bid, 101);
    }

    #[test]
    fn test_zero_price_side_keeps_previous_values() {
        let (engine, _) = engine_with(|_| ok("{}"));

        engine.update_ticker(&tick("t1", 100, 110, 105));
        let update = engine.update_ticker(&tick("t2", 0, 120, 0));

        assert!(update.changed);
        assert_eq!(update.previous.ask, 110);
        assert_eq!(update.current.ask, 120);
        assert_eq!(update.current.ask_size, 12);
        assert_eq!(update.current.bid, 100);
        assert_eq!(update.current.bid_size, 10);
        assert_eq!(update.current.bid_depth, 20);
        assert_eq!(update.current.last, 105);
        assert_eq!(update.current.last_trade, "t1");
        assert_eq!(update.current.quote_time, "t2");
    }

    #[test]
    fn test_concurrent_refresh_fetches_once() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let entered_tx = parking_lot::Mutex::new(entered_tx);
        let release_rx = parking_lot::Mutex::new(release_rx);

        let (engine, _) = started_engine({
            let fetches = fetches.clone();
            move |request| {
                assert!(request.url.ends_with("instances/42"));
                fetches.fetch_add(1, Ordering::SeqCst);
                entered_tx.lock().send(()).unwrap();
                release_rx.lock().recv().unwrap();
                ok(r#"{"ok":true,"done":false,"state":"open",
                    "details":{"endOfTheWorldDay":10,"tradingDay":1}}"#)
            }
        });

        let first = {
            let engine = engine.clone();
            thread::spawn(move || engine.refresh().unwrap())
        };

        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let contenders: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                thread::spawn(move || engine.refresh().unwrap())
            })
            .collect();

        for contender in contenders {
            assert!(!contender.join().unwrap());
        }

        release_tx.send(()).unwrap();
        assert!(first.join().unwrap());

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(engine.world().current_trading_day, 1);
        assert_eq!(engine.world().last_trading_day, 10);
    }

    #[test]
    fn test_world_wide_wait_released_by_first_trading_day() {
        let day = Arc::new(AtomicUsize::new(0));
        let (engine, _) = started_engine({
            let day = day.clone();
            move |_| {
                if day.load(Ordering::SeqCst) == 0 {
                    ok(r#"{"ok":true,"state":"open","details":{"endOfTheWorldDay":10}}"#)
                } else {
                    ok(r#"{"ok":true,"state":"open","details":{"endOfTheWorldDay":10,"tradingDay":0}}"#)
                }
            }
        });

        let waiter = {
            let engine = engine.clone();
            thread::spawn(move || engine.world_wide_wait())
        };

        engine.refresh().unwrap();
        assert!(!engine.is_ready());

        day.store(1, Ordering::SeqCst);
        engine.refresh().unwrap();

        assert!(waiter.join().unwrap());
        assert!(engine.is_ready());
        assert!(engine.world_wide_wait());
    }

    #[test]
    fn test_close_releases_world_wide_wait() {
        let (engine, _) = engine_with(|_| ok("{}"));

        let waiter = {
            let engine = engine.clone();
            thread::spawn(move || engine.world_wide_wait())
        };

        thread::sleep(Duration::from_millis(20));
        engine.close();

        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_refresh_failure_is_returned() {
        let (engine, _) = started_engine(|_| ok(r#"{"ok":false,"error":"instance gone"}"#));

        let error = engine.refresh().unwrap_err();

        assert!(format!("{error:#}").contains("instance gone"));
        assert!(!engine.is_ready());
    }

    #[test]
    fn test_holdings_fold() {
        let (engine, _) = engine_with(|_| ok("{}"));

        engine.update_position(OrderKey::new("TESTEX", 1), &execution(filled(Direction::Buy, 10, 100)));
        engine.update_position(OrderKey::new("TESTEX", 2), &execution(filled(Direction::Sell, 4, 150)));
        engine.update_ticker(&tick("t1", 0, 0, 120));

        let holdings = engine.holdings();

        assert_eq!(holdings.cash.cents(), -400);
        assert_eq!(holdings.position, 6);
        assert_eq!(holdings.nav.cents(), 320);
    }

    #[test]
    fn test_update_position_is_last_writer_wins() {
        let (engine, _) = engine_with(|_| ok("{}"));
        let key = OrderKey::new("TESTEX", 7);

        let mut newer = filled(Direction::Buy, 10, 100);
        newer.total_filled = 10;
        let mut older = filled(Direction::Buy, 10, 100);
        older.total_filled = 4;
        older.fills[0].quantity = 4;

        engine.update_position(key.clone(), &execution(newer));
        engine.update_position(key.clone(), &execution(older));

        // An out-of-order report rolls the fill count back.
        assert_eq!(engine.order(&key).unwrap().total_filled, 4);
        assert_eq!(engine.holdings().position, 4);
    }

    #[test]
    fn test_buy_inserts_validated_order() {
        let (engine, transport) = started_engine(|_| {
            ok(r#"{"ok":true,"symbol":"FOOBAR","venue":"TESTEX","direction":"buy",
                "originalQty":10,"qty":0,"price":100,"orderType":"limit","id":5,
                "account":"ACC","ts":"t","fills":[{"price":100,"qty":10,"ts":"t"}],
                "totalFilled":10,"open":false}"#)
        });

        let (key, order) = engine.buy(100, 10, OrderType::Limit).unwrap();

        assert_eq!(key, OrderKey::new("TESTEX", 5));
        assert_eq!(order.total_filled, 10);
        assert!(engine.own_order(&key));
        assert!(!engine.own_order(&OrderKey::new("TESTEX", 6)));
        assert_eq!(engine.holdings().position, 10);

        let body = transport.requests().last().unwrap().body.clone().unwrap();
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["direction"], json!("buy"));
        assert_eq!(body["account"], json!("ACC"));
    }

    #[test]
    fn test_sell_rejects_mismatched_echo() {
        let (engine, _) = started_engine(|_| {
            ok(r#"{"ok":true,"symbol":"OTHER","venue":"TESTEX","direction":"sell",
                "originalQty":3,"qty":3,"price":100,"orderType":"limit","id":5,
                "account":"ACC","ts":"t","fills":[],"totalFilled":0,"open":true}"#)
        });

        let error = engine.sell(100, 3, OrderType::Limit).unwrap_err();

        assert!(error.to_string().contains("symbol OTHER"));
        assert!(!engine.own_order(&OrderKey::new("TESTEX", 5)));
    }

    #[test]
    fn test_limit_order_quantities_must_add_up() {
        let (engine, _) = started_engine(|_| {
            ok(r#"{"ok":true,"symbol":"FOOBAR","venue":"TESTEX","direction":"buy",
                "originalQty":10,"qty":8,"price":100,"orderType":"limit","id":5,
                "account":"ACC","ts":"t","fills":[],"totalFilled":1,"open":true}"#)
        });

        assert!(engine.buy(100, 10, OrderType::Limit).is_err());
    }

    #[test]
    fn test_cancel_variants() {
        let (engine, _) = started_engine(|request| {
            if request.url.ends_with("orders/5/cancel") {
                ok(r#"{"ok":true,"id":5,"open":false}"#)
            } else {
                ok(r#"{"ok":false,"error":"no such order"}"#)
            }
        });

        assert!(engine.cancel(5).is_ok());
        assert!(engine.cancel(6).is_err());

        let reply = engine.cancel_nothrow(6);
        assert_eq!(reply["ok"], json!(false));
    }

    #[test]
    fn test_cancel_nothrow_without_session() {
        let (engine, transport) = engine_with(|_| ok(r#"{"ok":true}"#));

        let reply = engine.cancel_nothrow(1);

        assert_eq!(reply["ok"], json!(false));
        assert_eq!(reply["error"], json!("no level is running"));
        assert!(transport.requests().is_empty());

        let error = engine.cancel(1).unwrap_err();
        assert!(format!("{error:#}").contains("no level is running"));
    }

    #[test]
    fn test_orders_need_a_session() {
        let (engine, transport) = engine_with(|_| ok("{}"));

        assert!(engine.buy(100, 1, OrderType::Market).is_err());
        assert!(engine.refresh().is_err());
        assert!(transport.requests().is_empty());
    }
}
