//! Overall upload progress, partitioned into fixed stage weights.
//!
//! ```text
//! 0 ────── compress ────── 50 ────── network ────── 100
//! ```

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStage {
    Compress,
    Network,
}

impl UploadStage {
    /// Inclusive range of overall percentage this stage covers.
    pub const fn span(self) -> (u8, u8) {
        match self {
            UploadStage::Compress => (0, 50),
            UploadStage::Network => (50, 100),
        }
    }

    /// Map a stage-local 0..=100 portion onto the overall scale.
    pub fn scale(self, portion: u8) -> u8 {
        let (start, end) = self.span();
        let portion = u16::from(portion.min(100));
        start + ((u16::from(end - start) * portion) / 100) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadProgress {
    pub stage: UploadStage,
    /// Overall percentage, 0..=100.
    pub percent: u8,
}

/// Forwards progress to a callback, never going backwards and never
/// repeating a percentage.
pub struct ProgressReporter<F> {
    callback: F,
    last: Option<u8>,
}

impl<F: FnMut(UploadProgress)> ProgressReporter<F> {
    pub fn new(callback: F) -> Self {
        Self { callback, last: None }
    }

    pub fn stage(&mut self, stage: UploadStage, portion: u8) {
        self.emit(stage, stage.scale(portion));
    }

    /// Network progress, linear in bytes sent.
    pub fn network(&mut self, sent: u64, total: u64) {
        let portion = if total == 0 {
            100
        } else {
            (sent.min(total) * 100 / total) as u8
        };
        self.stage(UploadStage::Network, portion);
    }

    pub fn finish(&mut self) {
        self.emit(UploadStage::Network, 100);
    }

    pub fn last(&self) -> Option<u8> {
        self.last
    }

    fn emit(&mut self, stage: UploadStage, percent: u8) {
        if self.last.is_some_and(|last| percent <= last) {
            return;
        }
        self.last = Some(percent);
        (self.callback)(UploadProgress { stage, percent });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_scale_into_their_span() {
        assert_eq!(UploadStage::Compress.scale(0), 0);
        assert_eq!(UploadStage::Compress.scale(100), 50);
        assert_eq!(UploadStage::Compress.scale(37), 18);
        assert_eq!(UploadStage::Network.scale(0), 50);
        assert_eq!(UploadStage::Network.scale(50), 75);
        assert_eq!(UploadStage::Network.scale(100), 100);
        assert_eq!(UploadStage::Network.scale(250), 100);
    }

    #[test]
    fn reporter_is_monotonic_and_deduplicated() {
        let mut seen = Vec::new();
        let mut reporter = ProgressReporter::new(|p: UploadProgress| seen.push(p.percent));
        reporter.stage(UploadStage::Compress, 10);
        reporter.stage(UploadStage::Compress, 10);
        reporter.stage(UploadStage::Compress, 100);
        reporter.network(0, 1000);
        reporter.network(500, 1000);
        reporter.network(400, 1000);
        reporter.finish();
        reporter.finish();
        drop(reporter);
        assert_eq!(seen, vec![5, 50, 75, 100]);
    }

    #[test]
    fn empty_network_payload_completes() {
        let mut seen = Vec::new();
        let mut reporter = ProgressReporter::new(|p: UploadProgress| seen.push((p.stage, p.percent)));
        reporter.network(0, 0);
        drop(reporter);
        assert_eq!(seen, vec![(UploadStage::Network, 100)]);
    }
}
