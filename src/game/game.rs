use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{Span, error, info, info_span, trace, warn};

use crate::config::settings::Settings;
use crate::game::csv_dump::CsvDump;
use crate::game::debounce::{AtomicDebounce, Debounce};
use crate::game::game_socket::GameSocket;
use crate::market::market_state::MarketState;
use crate::scheduling::{RecurringScheduler, TaskQueue};
use crate::types::holdings::Holdings;
use crate::types::money::Money;
use crate::types::order::{Order, OrderKey, OrderType};
use crate::types::ticker::Ticker;
use crate::venue::messages::{LevelStart, decode_execution, decode_ticker};
use crate::venue::stream::MessageStream;

/// World states after which there is nothing left to play.
pub const TERMINAL_STATES: [&str; 4] = ["won", "lost", "end", "ended"];

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Console orders go out as immediate-or-cancel so nothing rests on the book.
pub const CONSOLE_ORDER_TYPE: OrderType = OrderType::ImmediateOrCancel;

const MIN_WORLD_PING_INTERVAL: Duration = Duration::from_millis(100);

pub fn is_terminal_state(state: &str) -> bool {
    TERMINAL_STATES.contains(&state)
}

/// Everything a game is wired to.
pub struct GameContext {
    pub settings: Arc<Settings>,
    pub scheduler: Arc<RecurringScheduler>,
    pub queue: Arc<TaskQueue>,
    pub engine: Arc<MarketState>,
    pub ticker_stream: Arc<dyn MessageStream>,
    pub execution_stream: Arc<dyn MessageStream>,
}

struct WorldView {
    state: Debounce<String>,
    end_of_world: Debounce<i32>,
    today: Debounce<i32>,
    position: Debounce<(Money, i64)>,
    flash: Debounce<BTreeMap<String, String>>,
}

impl Default for WorldView {
    fn default() -> Self {
        Self {
            state: Debounce::default(),
            end_of_world: Debounce::default(),
            today: Debounce::new(-1),
            position: Debounce::new((Money::ZERO, 0)),
            flash: Debounce::default(),
        }
    }
}

#[derive(Default)]
struct QuoteView {
    bid: AtomicDebounce,
    last: AtomicDebounce,
    ask: AtomicDebounce,
}

/// One level played against the venue: streams in, orders out, the world
/// watched on a timer.
pub struct Game {
    settings: Arc<Settings>,
    scheduler: Arc<RecurringScheduler>,
    queue: Arc<TaskQueue>,
    engine: Arc<MarketState>,
    ticker: Arc<GameSocket>,
    executions: Arc<GameSocket>,
    raw_ticks: CsvDump,
    quote_changes: CsvDump,
    ping_failures: AtomicUsize,
    world_view: Mutex<WorldView>,
    quote_view: QuoteView,
}

impl Game {
    pub fn new(context: GameContext) -> Result<Arc<Self>> {
        let GameContext {
            settings,
            scheduler,
            queue,
            engine,
            ticker_stream,
            execution_stream,
        } = context;

        let raw_ticks = CsvDump::create(settings.derivative_file("_ticker_raw.csv"))?;
        let quote_changes = CsvDump::create(settings.derivative_file("_ticker_bla.csv"))?;

        Ok(Arc::new(Self {
            ticker: GameSocket::new("tickertape", ticker_stream, scheduler.clone()),
            executions: GameSocket::new("executions", execution_stream, scheduler.clone()),
            settings,
            scheduler,
            queue,
            engine,
            raw_ticks,
            quote_changes,
            ping_failures: AtomicUsize::new(0),
            world_view: Mutex::new(WorldView::default()),
            quote_view: QuoteView::default(),
        }))
    }

    /// Span naming the venue being played, or `MAIN` before the level starts.
    pub fn span(&self) -> Span {
        let venue = self
            .engine
            .session()
            .map(|session| session.venue)
            .unwrap_or_else(|_| "MAIN".to_string());

        info_span!("instance", venue = %venue)
    }

    /// Runs `start` on its own thread. The wait for the world must not hold a
    /// pool worker: the world ping that ends it runs on the pool.
    pub fn launch(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let game = self.clone();

        thread::Builder::new()
            .name("game-start".to_string())
            .spawn(move || {
                let _ = game.start();
            })
            .context("failed to spawn game start thread")
    }

    /// Starts the level and blocks until the world reports a trading day.
    /// Any failure stops the scheduler.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let result = self.try_start();

        if let Err(e) = &result {
            error!("game start failed: {e:#}");
            self.scheduler.terminate();
        }

        result
    }

    fn try_start(self: &Arc<Self>) -> Result<()> {
        let level = &self.settings.level;
        info!(%level, "starting level");

        let started = self.engine.start(level)?;
        let session = self.engine.session()?;
        let _span = self.span().entered();

        self.dump_instructions(&started)?;

        let client = self.engine.client();

        let game = Arc::downgrade(self);
        self.ticker.connect(
            client.ticker_tape_uri(&session.account, &session.venue),
            move |text| {
                if let Some(game) = game.upgrade() {
                    game.enqueue(text, Game::handle_tick);
                }
            },
        )?;

        let game = Arc::downgrade(self);
        self.executions.connect(
            client.executions_uri(&session.account, &session.venue),
            move |text| {
                if let Some(game) = game.upgrade() {
                    game.enqueue(text, Game::handle_execution);
                }
            },
        )?;

        let interval = Duration::from_millis(session.seconds_per_day * 1000 / 3)
            .max(MIN_WORLD_PING_INTERVAL);
        let game = Arc::downgrade(self);
        let ping = self.scheduler.insert(interval, move || match game.upgrade() {
            Some(game) => game.world_ping(),
            None => Ok(()),
        });
        self.scheduler.invoke(ping);

        info!(?interval, "waiting for the world to come online");
        if self.engine.world_wide_wait() {
            info!("world is online");
        }

        Ok(())
    }

    fn dump_instructions(&self, started: &LevelStart) -> Result<()> {
        for (name, text) in &started.instructions {
            let slug: String = name
                .chars()
                .map(|c| if c.is_whitespace() { '_' } else { c.to_ascii_lowercase() })
                .collect();
            let path = self
                .settings
                .derivative_file(&format!("_{}_{slug}.md", self.settings.level));

            fs::write(&path, text)
                .with_context(|| format!("failed to write instructions {}", path.display()))?;
            info!(path = %path.display(), "instructions saved");
        }

        Ok(())
    }

    fn enqueue(self: &Arc<Self>, text: &str, handle: fn(&Game, &str) -> Result<()>) {
        let game = Arc::downgrade(self);
        let text = text.to_string();

        self.queue.push(move || {
            let Some(game) = game.upgrade() else {
                return Ok(());
            };
            let _span = game.span().entered();
            handle(&game, &text)
        });
    }

    /// Refreshes the world and reacts to it. Consecutive failures up to the
    /// configured limit are tolerated; the limit stops the scheduler.
    pub fn world_ping(&self) -> Result<()> {
        let _span = self.span().entered();

        match self.engine.refresh() {
            Ok(false) => {}
            Ok(true) => {
                self.ping_failures.store(0, Ordering::Release);
                self.world_reaction();
            }
            Err(e) => {
                let failures = self.ping_failures.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(failures, "world refresh failed: {e:#}");

                if failures >= self.settings.world_ping_failure_limit {
                    error!(failures, "world is unreachable; aborting");
                    self.scheduler.terminate();
                }
            }
        }

        Ok(())
    }

    fn world_reaction(&self) {
        let world = self.engine.world();
        let mut view = self.world_view.lock();

        if view.state.update(world.state.clone()) {
            info!(state = %world.state.to_uppercase(), "world state");

            if is_terminal_state(&world.state) {
                info!(state = %world.state, "game over");
                self.scheduler.terminate();
            }
        }

        if view.end_of_world.update(world.last_trading_day) {
            info!(day = world.last_trading_day, "end of the world");
        }

        let today = world.current_trading_day;
        if view.today.update(today) && today >= 0 {
            info!(
                day = today,
                tickertape = self.ticker.connected(),
                executions = self.executions.connected(),
                "trading day"
            );

            let holdings = self.engine.holdings();
            if view.position.update((holdings.cash, holdings.position)) {
                info!(%holdings, "holdings");
            }
        }

        if view.flash.update(world.flash.clone()) {
            for (kind, text) in &world.flash {
                info!(kind = %kind.to_uppercase(), "{text}");
            }
        }
    }

    pub fn handle_tick(&self, text: &str) -> Result<()> {
        let ticker = decode_ticker(text)?;

        if let Ok(quoted_at) = DateTime::parse_from_rfc3339(&ticker.quote_time) {
            let lag = Utc::now().signed_duration_since(quoted_at);
            trace!(lag_ms = lag.num_milliseconds(), "tick received");
        }

        self.raw_ticks
            .write_row(&[&ticker.quote_time, &ticker.bid, &ticker.last, &ticker.ask])?;

        let update = self.engine.update_ticker(&ticker);
        if update.changed {
            self.ticker_reaction(&update.current)?;
        }

        Ok(())
    }

    fn ticker_reaction(&self, current: &Ticker) -> Result<()> {
        let bid = self.quote_view.bid.update(current.bid);
        let last = self.quote_view.last.update(current.last);
        let ask = self.quote_view.ask.update(current.ask);

        if bid || last || ask {
            self.quote_changes
                .write_row(&[&current.quote_time, &current.bid, &current.last, &current.ask])?;
        }

        Ok(())
    }

    pub fn handle_execution(&self, text: &str) -> Result<()> {
        let (key, execution) = decode_execution(text)?;
        self.engine.update_position(key.clone(), &execution);

        let order = &execution.order;
        if let Some(fill) = order.last_fill() {
            info!(
                direction = %order.direction,
                order = key.id,
                quantity = fill.quantity,
                price = %Money::from_unsigned(fill.price),
                filled = order.total_filled,
                original = order.original_quantity,
                at = %fill.timestamp,
                "fill"
            );
        }

        Ok(())
    }

    pub fn quote(&self) -> Ticker {
        self.engine.quote()
    }

    pub fn holdings(&self) -> Holdings {
        self.engine.holdings()
    }

    pub fn buy(&self, quantity: u64, price: u64) -> Result<(OrderKey, Order)> {
        let placed = self.engine.buy(price, quantity, CONSOLE_ORDER_TYPE)?;
        log_order(&placed);
        Ok(placed)
    }

    pub fn sell(&self, quantity: u64, price: u64) -> Result<(OrderKey, Order)> {
        let placed = self.engine.sell(price, quantity, CONSOLE_ORDER_TYPE)?;
        log_order(&placed);
        Ok(placed)
    }

    pub fn instance_id(&self) -> Option<u64> {
        self.engine.session().ok().map(|session| session.instance_id)
    }

    pub fn cancel(&self, id: u64) -> Result<()> {
        self.engine.cancel(id)?;
        info!(order = id, "order cancelled");
        Ok(())
    }

    pub fn restart(&self) -> Result<bool> {
        let session = self.engine.session()?;
        let reply = self.engine.client().restart_instance(session.instance_id)?;
        Ok(accepted("restart", session.instance_id, &reply))
    }

    pub fn resume(&self) -> Result<bool> {
        let session = self.engine.session()?;
        let reply = self.engine.client().resume_instance(session.instance_id)?;
        Ok(accepted("resume", session.instance_id, &reply))
    }

    /// Asks the service to stop the instance. Terminates when it agrees.
    pub fn stop(&self) -> Result<bool> {
        let session = self.engine.session()?;
        let reply = self.engine.client().stop_instance(session.instance_id)?;
        let stopped = accepted("stop", session.instance_id, &reply);

        if stopped {
            self.scheduler.terminate();
        }

        Ok(stopped)
    }

    /// Heartbeat against the API. A dead API ends the run.
    pub fn keepalive(&self) -> Result<()> {
        let result = self.engine.client().heartbeat();

        if let Err(e) = &result {
            error!("heartbeat failed: {e:#}");
            self.scheduler.terminate();
        }

        result
    }

    pub fn shutdown(&self) {
        self.ticker.disconnect();
        self.executions.disconnect();
        self.engine.close();
    }
}

fn accepted(command: &str, instance: u64, reply: &Value) -> bool {
    let ok = reply.get("ok").and_then(Value::as_bool) == Some(true);

    if ok {
        info!(instance, command, "instance command accepted");
    } else {
        warn!(instance, command, %reply, "instance command refused");
    }

    ok
}

fn log_order((key, order): &(OrderKey, Order)) {
    info!(
        order = %key,
        direction = %order.direction,
        quantity = order.original_quantity,
        price = %Money::from_unsigned(order.price),
        filled = order.total_filled,
        open = order.open,
        "order placed"
    );
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::venue::client::{Endpoints, VenueClient};
    use crate::venue::stream::testing::FakeStream;
    use crate::venue::transport::testing::{FnTransport, ok};
    use crate::venue::transport::{ApiRequest, ApiResponse};
    use tempfile::TempDir;

    pub const LEVEL: &str = r#"{"ok":true,"account":"ACC","instanceId":42,
        "secondsPerTradingDay":3,"tickers":["FOOBAR"],"venues":["TESTEX"],
        "instructions":{"Instructions":"buy low","Order Types":"ioc only"}}"#;

    pub struct Fixture {
        pub game: Arc<Game>,
        pub scheduler: Arc<RecurringScheduler>,
        pub engine: Arc<MarketState>,
        pub ticker: Arc<FakeStream>,
        pub executions: Arc<FakeStream>,
        pub transport: Arc<FnTransport>,
        pub settings: Arc<Settings>,
        pub _dir: TempDir,
    }

    /// A game over fake streams playing `first_steps`. Level starts are
    /// answered with `LEVEL`, everything else by `handler`.
    pub fn fixture(
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse> + Send + Sync + 'static,
    ) -> Fixture {
        fixture_for("first_steps", handler)
    }

    pub fn fixture_for(
        level: &str,
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse> + Send + Sync + 'static,
    ) -> Fixture {
        fixture_on(level, 2, handler)
    }

    pub fn fixture_on(
        level: &str,
        workers: usize,
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse> + Send + Sync + 'static,
    ) -> Fixture {
        let dir = TempDir::new().unwrap();
        let settings = Arc::new(Settings {
            dir: dir.path().to_path_buf(),
            stem: "test".to_string(),
            api_key: "key".to_string(),
            level: level.to_string(),
            worker_threads: workers,
            endpoints: Endpoints::default(),
            world_ping_failure_limit: 5,
        });

        let transport = Arc::new(FnTransport::new(move |request| {
            if request.url.ends_with("levels/first_steps") {
                ok(LEVEL)
            } else {
                handler(request)
            }
        }));

        let queue = Arc::new(TaskQueue::new(settings.worker_threads).unwrap());
        let scheduler = RecurringScheduler::new(queue.clone());
        let client = VenueClient::new(transport.clone(), settings.endpoints.clone(), "key");
        let engine = Arc::new(MarketState::new(client));
        let ticker = Arc::new(FakeStream::default());
        let executions = Arc::new(FakeStream::default());

        let game = Game::new(GameContext {
            settings: settings.clone(),
            scheduler: scheduler.clone(),
            queue,
            engine: engine.clone(),
            ticker_stream: ticker.clone(),
            execution_stream: executions.clone(),
        })
        .unwrap();

        Fixture {
            game,
            scheduler,
            engine,
            ticker,
            executions,
            transport,
            settings,
            _dir: dir,
        }
    }

    pub fn world(state: &str, trading_day: i32) -> Result<ApiResponse> {
        ok(format!(
            r#"{{"ok":true,"done":false,"state":"{state}",
                "details":{{"endOfTheWorldDay":10,"tradingDay":{trading_day}}}}}"#
        ))
    }
}
