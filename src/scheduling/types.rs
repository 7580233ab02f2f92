use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

/// Opaque handle for a scheduled job, unique for the scheduler's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

pub type JobFn = Arc<dyn Fn() -> Result<()> + Send + Sync + 'static>;

#[derive(Clone)]
pub struct Job {
    pub token: Token,
    pub interval: Duration,
    pub function: JobFn,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("token", &self.token)
            .field("interval", &self.interval)
            .finish()
    }
}
