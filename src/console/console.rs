use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::console::command::Command;
use crate::game::game::Game;
use crate::scheduling::{RecurringScheduler, TaskQueue};

pub const PROMPT: &str = "?> ";

type Output = Arc<Mutex<dyn Write + Send>>;

/// Reads commands from stdin on its own thread. Each line is handled on the
/// task queue.
pub fn spawn(
    game: Arc<Game>,
    scheduler: Arc<RecurringScheduler>,
    queue: Arc<TaskQueue>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            let output: Output = Arc::new(Mutex::new(io::stdout()));
            read_loop(io::stdin().lock(), output, &game, &scheduler, &queue);
        })
        .context("failed to spawn console thread")
}

fn read_loop<R: BufRead>(
    input: R,
    output: Output,
    game: &Arc<Game>,
    scheduler: &Arc<RecurringScheduler>,
    queue: &TaskQueue,
) {
    info!("console ready");
    let mut lines = input.lines();

    while !scheduler.done() {
        {
            let mut out = output.lock();
            let _ = write!(out, "{PROMPT}").and_then(|()| out.flush());
        }

        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                error!("console read failed: {e}");
                break;
            }
            None => break,
        };

        let game = game.clone();
        let scheduler = scheduler.clone();
        let output = output.clone();
        queue.push(move || {
            let _span = game.span().entered();
            handle_line(&line, &game, &scheduler, &output)
        });
    }

    info!("console finished");
}

/// Runs one console line against the game.
pub fn handle_line(
    line: &str,
    game: &Game,
    scheduler: &RecurringScheduler,
    output: &Mutex<dyn Write + Send>,
) -> Result<()> {
    let command = match line.parse::<Command>() {
        Ok(command) => command,
        Err(e) => {
            writeln!(output.lock(), "{e:#}")?;
            return Ok(());
        }
    };

    match command {
        Command::Quote => writeln!(output.lock(), "{}", game.quote())?,
        Command::Holdings => writeln!(output.lock(), " : {}", game.holdings())?,
        Command::Buy { quantity, price } => {
            let (key, order) = game.buy(quantity, price)?;
            writeln!(
                output.lock(),
                "{key} : {} filled {}/{}",
                order.direction, order.total_filled, order.original_quantity
            )?;
        }
        Command::Sell { quantity, price } => {
            let (key, order) = game.sell(quantity, price)?;
            writeln!(
                output.lock(),
                "{key} : {} filled {}/{}",
                order.direction, order.total_filled, order.original_quantity
            )?;
        }
        Command::Cancel { id } => {
            game.cancel(id)?;
            writeln!(output.lock(), "Cancelled {id}")?;
        }
        Command::Quit => {
            writeln!(output.lock(), "Bye!")?;
            scheduler.terminate();
        }
        Command::Stop => {
            let instance = game
                .instance_id()
                .map_or_else(|| "?".to_string(), |id| id.to_string());
            writeln!(output.lock(), "Stopping {instance}...")?;
            if !game.stop()? {
                writeln!(output.lock(), "Instance {instance} did not stop")?;
            }
        }
        Command::Restart => {
            let ok = game.restart()?;
            writeln!(output.lock(), "Restart {}", if ok { "accepted" } else { "refused" })?;
        }
        Command::Resume => {
            let ok = game.resume()?;
            writeln!(output.lock(), "Resume {}", if ok { "accepted" } else { "refused" })?;
        }
        Command::Unknown(_) => writeln!(output.lock(), "Huh?")?,
    }

    Ok(())
}
