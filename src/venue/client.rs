use std::sync::Arc;

use anyhow::Result;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::types::order::{Direction, Order, OrderKey, OrderType};
use crate::venue::error::VenueError;
use crate::venue::messages::{self, LevelStart, OrderMessage, WorldMessage};
use crate::venue::transport::{ApiRequest, ApiResponse, Method, Transport};

pub const AUTH_HEADER: &str = "X-Starfighter-Authorization";

/// Base URLs of the three services. Each ends with a slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub api_url: String,
    pub game_url: String,
    pub stream_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            api_url: "https://api.stockfighter.io/ob/api/".to_string(),
            game_url: "https://www.stockfighter.io/gm/".to_string(),
            stream_url: "wss://api.stockfighter.io/ob/api/ws/".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderRequest<'a> {
    pub account: &'a str,
    pub venue: &'a str,
    pub symbol: &'a str,
    pub price: u64,
    pub quantity: u64,
    pub direction: Direction,
    pub order_type: OrderType,
}

impl OrderRequest<'_> {
    fn to_json(&self) -> Value {
        json!({
            "account": self.account,
            "venue": self.venue,
            "stock": self.symbol,
            "price": self.price,
            "qty": self.quantity,
            "direction": self.direction.as_wire(),
            "orderType": self.order_type.as_wire(),
        })
    }
}

#[derive(Clone)]
pub struct VenueClient {
    transport: Arc<dyn Transport>,
    endpoints: Endpoints,
    api_key: String,
}

impl VenueClient {
    pub fn new(transport: Arc<dyn Transport>, endpoints: Endpoints, api_key: impl Into<String>) -> Self {
        Self {
            transport,
            endpoints,
            api_key: api_key.into(),
        }
    }

    pub fn heartbeat(&self) -> Result<()> {
        let url = format!("{}heartbeat", self.endpoints.api_url);
        self.get(&url, true)?;
        Ok(())
    }

    pub fn start_level(&self, level: &str) -> Result<LevelStart> {
        let url = format!("{}levels/{level}", self.endpoints.game_url);
        let value = self.post(&url, None, true)?;
        messages::decode(value)
    }

    pub fn world(&self, instance_id: u64) -> Result<WorldMessage> {
        let url = format!("{}instances/{instance_id}", self.endpoints.game_url);
        let value = self.get(&url, true)?;
        messages::decode(value)
    }

    /// Raw reply; callers inspect `ok` themselves.
    pub fn stop_instance(&self, instance_id: u64) -> Result<Value> {
        self.instance_command(instance_id, "stop")
    }

    pub fn restart_instance(&self, instance_id: u64) -> Result<Value> {
        self.instance_command(instance_id, "restart")
    }

    pub fn resume_instance(&self, instance_id: u64) -> Result<Value> {
        self.instance_command(instance_id, "resume")
    }

    fn instance_command(&self, instance_id: u64, command: &str) -> Result<Value> {
        let url = format!("{}instances/{instance_id}/{command}", self.endpoints.game_url);
        self.post(&url, None, false)
    }

    pub fn place_order(&self, request: &OrderRequest<'_>) -> Result<(OrderKey, Order)> {
        let url = format!(
            "{}venues/{}/stocks/{}/orders",
            self.endpoints.api_url, request.venue, request.symbol
        );
        let value = self.post(&url, Some(request.to_json()), true)?;
        let message: OrderMessage = messages::decode(value)?;
        message.into_entry()
    }

    /// Never fails. Transport and venue errors come back as `{ok: false, error}`.
    pub fn cancel_order(&self, venue: &str, symbol: &str, id: u64) -> Value {
        let url = format!(
            "{}venues/{venue}/stocks/{symbol}/orders/{id}/cancel",
            self.endpoints.api_url
        );

        match self.post(&url, None, false) {
            Ok(value) => value,
            Err(e) => {
                warn!(order = id, "cancel request failed: {e:#}");
                json!({ "ok": false, "error": format!("{e:#}") })
            }
        }
    }

    pub fn ticker_tape_uri(&self, account: &str, venue: &str) -> String {
        format!(
            "{}{account}/venues/{venue}/tickertape",
            self.endpoints.stream_url
        )
    }

    pub fn executions_uri(&self, account: &str, venue: &str) -> String {
        format!(
            "{}{account}/venues/{venue}/executions",
            self.endpoints.stream_url
        )
    }

    fn get(&self, url: &str, validate: bool) -> Result<Value> {
        self.perform(Method::Get, url, None, validate)
    }

    fn post(&self, url: &str, body: Option<Value>, validate: bool) -> Result<Value> {
        self.perform(Method::Post, url, body, validate)
    }

    fn perform(&self, method: Method, url: &str, body: Option<Value>, validate: bool) -> Result<Value> {
        let request = ApiRequest {
            method,
            url: url.to_string(),
            headers: vec![(AUTH_HEADER.to_string(), self.api_key.clone())],
            body: body.map(|body| body.to_string()),
        };

        debug!(%method, url, "venue request");
        let response = self.transport.request(&request)?;
        interpret(response, validate)
    }
}

/// Turns a raw reply into JSON. An empty 204 is `null`; an HTML page becomes
/// an `{ok: false}` object carrying the page.
fn interpret(response: ApiResponse, validate: bool) -> Result<Value> {
    let ApiResponse { status, body } = response;
    let success = (200..300).contains(&status);

    if status == 204 && body.trim().is_empty() {
        return Ok(Value::Null);
    }

    let value = if body.trim_start().starts_with('<') {
        json!({ "ok": false, "error": body.clone() })
    } else {
        match serde_json::from_str::<Value>(&body) {
            Ok(value) => value,
            Err(_) if !success => return Err(VenueError::Status { status, body }.into()),
            Err(e) => return Err(VenueError::Malformed(format!("{e}; raw={body}")).into()),
        }
    };

    if validate {
        error_check(&value)?;
        if !success {
            return Err(VenueError::Status { status, body }.into());
        }
    }

    Ok(value)
}

/// Fails unless `ok` is true and `error`, when present, is empty.
pub fn error_check(value: &Value) -> Result<(), VenueError> {
    let error = value.get("error").and_then(Value::as_str).unwrap_or_default();

    if !error.is_empty() {
        return Err(VenueError::Api(error.to_string()));
    }

    if value.get("ok").and_then(Value::as_bool) != Some(true) {
        return Err(VenueError::Api(format!("request not ok: {value}")));
    }

    Ok(())
}
