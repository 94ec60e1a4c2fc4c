//! Frontend (tuner) collaborator interface and interrupt-cadence check.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Tuner driver hooks the core calls back into.
pub trait Frontend: Send + Sync {
    /// Ask the tuner to retune: it reports lock but delivers no data.
    fn retune(&self);
}

/// Result of an error-check session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorCheckReport {
    /// Interrupts seen in the current window.
    pub interrupts: u64,
    /// Retunes requested since the check started.
    pub retunes: u64,
}

/// Interrupt cadence tracking (`int_check_count` / `int_check_time`).
#[derive(Debug, Clone)]
pub struct ErrorCheck {
    enabled: bool,
    in_tune: bool,
    int_check_count: u64,
    int_check_time: Instant,
    retunes: u64,
}

impl ErrorCheck {
    pub fn new(now: Instant) -> Self {
        Self {
            enabled: false,
            in_tune: false,
            int_check_count: 0,
            int_check_time: now,
            retunes: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn in_tune(&self) -> bool {
        self.in_tune
    }

    pub fn start(&mut self, now: Instant) {
        self.enabled = true;
        self.int_check_count = 0;
        self.int_check_time = now;
        self.retunes = 0;
    }

    pub fn stop(&mut self) -> ErrorCheckReport {
        self.enabled = false;
        ErrorCheckReport {
            interrupts: self.int_check_count,
            retunes: self.retunes,
        }
    }

    pub fn before_retune(&mut self) {
        self.in_tune = false;
    }

    pub fn after_retune(&mut self, now: Instant) {
        self.in_tune = true;
        self.int_check_count = 0;
        self.int_check_time = now;
    }

    /// Count one data-ready interrupt.
    pub fn record_interrupt(&mut self) {
        self.int_check_count += 1;
    }

    /// Close the window if it has elapsed. Returns true when a whole window
    /// passed in tune without a single interrupt.
    pub fn poll(&mut self, now: Instant, window: Duration) -> bool {
        if !self.enabled || !self.in_tune {
            return false;
        }
        if now.saturating_duration_since(self.int_check_time) < window {
            return false;
        }
        let starved = self.int_check_count == 0;
        self.int_check_count = 0;
        self.int_check_time = now;
        if starved {
            self.retunes += 1;
        }
        starved
    }
}

/// First and latest PTS of the audio and video streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PtsTracker {
    pub first_video: Option<u64>,
    pub video: Option<u64>,
    pub first_audio: Option<u64>,
    pub audio: Option<u64>,
}

impl PtsTracker {
    pub fn record_video(&mut self, pts: u64) {
        self.first_video.get_or_insert(pts);
        self.video = Some(pts);
    }

    pub fn record_audio(&mut self, pts: u64) {
        self.first_audio.get_or_insert(pts);
        self.audio = Some(pts);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
