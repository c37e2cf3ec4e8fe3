use std::any::Any;
use std::fmt;
use std::thread;
use std::time::Duration;

use crate::region::{RegionHandle, RegionId};

/// What went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashCause {
    /// A region or global tick panicked.
    Panic(String),
    /// A tick ran past the watchdog's hard limit.
    Stuck,
}

/// Everything known about a fatal tick failure, logged as one multi-line report.
#[derive(Debug, Clone)]
pub struct CrashReport {
    /// The failing region; [`RegionId::GLOBAL`] for the global tick.
    pub region: RegionId,
    /// The tick counter of the failing region when the failure happened.
    pub tick: u64,
    /// Columns owned by the region.
    pub chunks: usize,
    /// Entities owned by the region.
    pub entities: usize,
    /// How long the failing tick had been running.
    pub elapsed: Option<Duration>,
    /// The thread the tick ran on, if known.
    pub thread: Option<String>,
    /// The failure.
    pub cause: CrashCause,
}

impl CrashReport {
    pub(crate) fn for_region(region: &RegionHandle, tick: u64, cause: CrashCause) -> Self {
        let stats = region.stats();
        Self {
            region: region.id(),
            tick,
            chunks: stats.chunks,
            entities: stats.entities,
            elapsed: region.running_for(),
            thread: None,
            cause,
        }
    }

    /// A report for the global tick. Reads nothing that the global tick thread may hold locked.
    pub(crate) fn for_global(
        tick: u64,
        chunks: usize,
        entities: usize,
        elapsed: Option<Duration>,
        cause: CrashCause,
    ) -> Self {
        Self {
            region: RegionId::GLOBAL,
            tick,
            chunks,
            entities,
            elapsed,
            thread: None,
            cause,
        }
    }

    pub(crate) fn on_current_thread(mut self) -> Self {
        self.thread = thread::current().name().map(str::to_owned);
        self
    }

    pub(crate) fn log(&self) {
        log::error!("{self}");
    }
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "---- Region crash report ----")?;
        match &self.cause {
            CrashCause::Panic(message) => writeln!(f, "Cause: tick panicked: {message}")?,
            CrashCause::Stuck => writeln!(f, "Cause: tick did not finish in time")?,
        }
        if self.region == RegionId::GLOBAL {
            writeln!(f, "Region: global tick")?;
        } else {
            writeln!(f, "Region: {}", self.region)?;
        }
        writeln!(f, "Tick: {}", self.tick)?;
        writeln!(f, "Owned chunks: {}", self.chunks)?;
        writeln!(f, "Entities: {}", self.entities)?;
        if let Some(elapsed) = self.elapsed {
            writeln!(f, "Running for: {}ms", elapsed.as_millis())?;
        }
        write!(
            f,
            "Thread: {}",
            self.thread.as_deref().unwrap_or("<unnamed>")
        )
    }
}

/// Extracts the message of a caught panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_names_region_and_cause() {
        let report = CrashReport {
            region: RegionId(7),
            tick: 1200,
            chunks: 40,
            entities: 3,
            elapsed: Some(Duration::from_secs(61)),
            thread: Some("Region Tick Thread #2".to_owned()),
            cause: CrashCause::Stuck,
        };
        let text = report.to_string();
        assert!(text.contains("Region: #7"));
        assert!(text.contains("Tick: 1200"));
        assert!(text.contains("Running for: 61000ms"));
        assert!(text.contains("did not finish in time"));
    }

    #[test]
    fn test_panic_message_from_payload() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(5_u8);
        assert_eq!(panic_message(payload.as_ref()), "<non-string panic payload>");
    }
}
