use std::time::Duration;

/// 默认的条目存活时间
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// 存储的配置。
///
/// ```
/// use std::time::Duration;
/// use ttl_cache::Config;
///
/// let config = Config::default().with_ttl(Duration::from_millis(500));
/// assert_eq!(config.ttl, Duration::from_millis(500));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// 每个条目从最近一次 set 起的存活时间
    pub ttl: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config { ttl: DEFAULT_TTL }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Config {
        self.ttl = ttl;
        self
    }
}
