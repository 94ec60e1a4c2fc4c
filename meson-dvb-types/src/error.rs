//! Error types for the demux control core.

use std::fmt;

use thiserror::Error;

/// Finite hardware resources that can run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Channel (PID) slots of one demux engine.
    Channel,
    /// Hardware section filter slots.
    Filter,
    /// Software fallback filter slots.
    SoftwareFilter,
    /// Feed (consumer) slots.
    Feed,
    /// Section buffer pool.
    SectionBuffer,
    /// PES buffer pool.
    PesBuffer,
    /// Subtitle/teletext buffer pool.
    SubtitleBuffer,
    /// Small-section buffer pool.
    SmallSectionBuffer,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Channel => "channel",
            Resource::Filter => "filter",
            Resource::SoftwareFilter => "software filter",
            Resource::Feed => "feed",
            Resource::SectionBuffer => "section buffer",
            Resource::PesBuffer => "PES buffer",
            Resource::SubtitleBuffer => "subtitle buffer",
            Resource::SmallSectionBuffer => "small-section buffer",
        };
        f.write_str(name)
    }
}

/// Failure reported by the hardware abstraction layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{op} failed: {reason}")]
pub struct HalError {
    /// HAL call that failed (e.g. `dmx_init`).
    pub op: &'static str,
    /// Human readable reason.
    pub reason: String,
}

impl HalError {
    pub fn new(op: &'static str, reason: impl Into<String>) -> Self {
        Self {
            op,
            reason: reason.into(),
        }
    }
}

/// Errors returned by demux control operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DemuxError {
    /// A channel, filter, feed or buffer table is full.
    #[error("{0} table exhausted")]
    ResourceExhausted(Resource),

    /// Channel handle is not allocated (or belongs to a freed slot).
    #[error("Invalid channel")]
    InvalidChannel,

    /// Filter handle was never allocated.
    #[error("Invalid filter")]
    InvalidFilter,

    /// Feed handle is not allocated.
    #[error("Invalid feed")]
    InvalidFeed,

    /// Operation is not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Source value cannot be routed.
    #[error("Invalid source: {0}")]
    InvalidSource(String),

    /// HAL init failed; the instance is unavailable until re-probe.
    #[error("Hardware init failed on demux {dmx}: {reason}")]
    HardwareInitFailure { dmx: u8, reason: String },

    /// HAL call failed during start/stop/set-source.
    #[error("Hardware error: {0}")]
    Hardware(#[from] HalError),

    /// Instance is marked unavailable after an init or reset failure.
    #[error("Demux {0} unavailable")]
    Unavailable(u8),

    /// Channel produced no data within the timeout policy.
    #[error("Channel timeout on PID 0x{pid:04X}")]
    Timeout { pid: u16 },

    /// Section failed its CRC32 check.
    #[error("CRC mismatch on PID 0x{pid:04X}")]
    CrcMismatch { pid: u16 },

    /// PID is in the channel-ignore window and the policy refuses it.
    #[error("PID 0x{pid:04X} suppressed by channel-ignore policy")]
    Suppressed { pid: u16 },
}

impl DemuxError {
    /// Returns true for errors that indicate caller misuse rather than
    /// a hardware or resource condition.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            DemuxError::InvalidChannel
                | DemuxError::InvalidFilter
                | DemuxError::InvalidFeed
                | DemuxError::InvalidState(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DemuxError::ResourceExhausted(Resource::Filter);
        assert_eq!(err.to_string(), "filter table exhausted");

        let err = DemuxError::CrcMismatch { pid: 0x12 };
        assert_eq!(err.to_string(), "CRC mismatch on PID 0x0012");
    }

    #[test]
    fn test_hal_error_conversion() {
        let err: DemuxError = HalError::new("dmx_start_feed", "register timeout").into();
        assert_eq!(
            err.to_string(),
            "Hardware error: dmx_start_feed failed: register timeout"
        );
        assert!(!err.is_programming_error());
        assert!(DemuxError::InvalidFilter.is_programming_error());
    }
}
