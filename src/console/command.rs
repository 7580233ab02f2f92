use std::str::FromStr;

use anyhow::{Context, Result, bail};

/// One line typed at the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quote,
    Holdings,
    Buy { quantity: u64, price: u64 },
    Sell { quantity: u64, price: u64 },
    Cancel { id: u64 },
    Quit,
    Stop,
    Restart,
    Resume,
    Unknown(String),
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(word) = words.next() else {
            return Ok(Command::Unknown(String::new()));
        };

        let command = match word {
            "q" => Command::Quote,
            "h" => Command::Holdings,
            "b" => {
                let (quantity, price) = order_arguments(&mut words)?;
                Command::Buy { quantity, price }
            }
            "s" => {
                let (quantity, price) = order_arguments(&mut words)?;
                Command::Sell { quantity, price }
            }
            "c" => {
                let id = words.next().context("missing order id")?;
                let id = id.parse().with_context(|| format!("invalid order id: {id}"))?;
                Command::Cancel { id }
            }
            "quit" => Command::Quit,
            "stop" => Command::Stop,
            "restart" => Command::Restart,
            "resume" => Command::Resume,
            other => return Ok(Command::Unknown(other.to_string())),
        };

        if let Some(extra) = words.next() {
            bail!("unexpected argument: {extra}");
        }

        Ok(command)
    }
}

fn order_arguments<'a>(words: &mut impl Iterator<Item = &'a str>) -> Result<(u64, u64)> {
    let quantity = words.next().context("missing quantity")?;
    let price = words.next().context("missing price")?;

    let quantity = quantity
        .parse()
        .with_context(|| format!("invalid quantity: {quantity}"))?;
    let price = price
        .parse()
        .with_context(|| format!("invalid price: {price}"))?;

    Ok((quantity, price))
}
