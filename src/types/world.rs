use std::collections::BTreeMap;

/// Session state of the simulation as last reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldStatus {
    pub done: bool,
    /// Free-form state string, passed through untouched.
    pub state: String,
    pub last_trading_day: i32,
    /// Negative until the service has reported a trading day.
    pub current_trading_day: i32,
    pub flash: BTreeMap<String, String>,
}

impl Default for WorldStatus {
    fn default() -> Self {
        Self {
            done: false,
            state: String::new(),
            last_trading_day: 0,
            current_trading_day: -1,
            flash: BTreeMap::new(),
        }
    }
}
