/// Sink for operation counters. The metrics backend is out of scope; views
/// only emit through this seam.
pub trait StatsSink: Send + Sync {
    fn count(&self, name: &str, value: i64);
}

#[derive(Debug, Default)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn count(&self, _name: &str, _value: i64) {}
}
