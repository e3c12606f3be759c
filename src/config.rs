use std::time::Duration;

/// Tunable timing knobs for the stack. Defaults match the fixed
/// constants used throughout `original_source/tcp.c`.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// How long a connection may go without an ACK advancing `snd.una`
    /// before it is forced closed.
    pub user_timeout: Duration,
    /// How long TIME_WAIT lingers before the TCB is released.
    pub time_wait_timeout: Duration,
    /// How often an unacknowledged segment is resent.
    pub retransmit_after: Duration,
    /// Timer thread wakeup granularity.
    pub tick_interval: Duration,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            user_timeout: Duration::from_secs(20),
            time_wait_timeout: Duration::from_secs(20),
            retransmit_after: Duration::from_secs(3),
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl StackConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_timeout(mut self, d: Duration) -> Self {
        self.user_timeout = d;
        self
    }

    pub fn time_wait_timeout(mut self, d: Duration) -> Self {
        self.time_wait_timeout = d;
        self
    }

    pub fn retransmit_after(mut self, d: Duration) -> Self {
        self.retransmit_after = d;
        self
    }

    pub fn tick_interval(mut self, d: Duration) -> Self {
        self.tick_interval = d;
        self
    }
}
