use crate::types::ProgressEvent;

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

/// Turns a running count of transferred bytes into whole percentages.
///
/// Only increases are reported, so a consumer never sees the value go back.
#[derive(Debug, Clone)]
pub struct PercentTracker {
    total: u64,
    sent: u64,
    last: Option<u8>,
}

impl PercentTracker {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            sent: 0,
            last: None,
        }
    }

    /// An empty body is complete before the first byte moves.
    pub fn initial(&mut self) -> Option<u8> {
        if self.total == 0 {
            return self.bump(100);
        }
        None
    }

    pub fn advance(&mut self, bytes: u64) -> Option<u8> {
        self.sent = self.sent.saturating_add(bytes);
        let pct = if self.total == 0 {
            100
        } else {
            let p = (self.sent as u128 * 100) / self.total as u128;
            p.min(100) as u8
        };
        self.bump(pct)
    }

    pub fn last(&self) -> Option<u8> {
        self.last
    }

    fn bump(&mut self, pct: u8) -> Option<u8> {
        match self.last {
            Some(prev) if pct <= prev => None,
            _ => {
                self.last = Some(pct);
                Some(pct)
            }
        }
    }
}
