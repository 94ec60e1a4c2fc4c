//! Hardware abstraction layer consumed by the control core.
//!
//! Register programming of the demux, async FIFO and routing blocks lives
//! behind [`DemuxHal`]. [`SimHal`] records every call and can be told to
//! fail specific operations; the simulator binary and the tests run on it.

use std::collections::HashMap;
use std::sync::Mutex;

use log::trace;
use meson_dvb_types::{AfifoId, ChannelType, DmxId, DmxSource, HalError, TsSource};

/// Interrupt lines owned by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrqLine {
    /// Section/PES data ready.
    Demux(DmxId),
    /// DVR (raw passthrough) data ready.
    Dvr(DmxId),
    AsyncFifo(AfifoId),
}

/// Register-level operations. Every call may fail.
pub trait DemuxHal: Send + Sync {
    fn dmx_init(&self, dmx: DmxId) -> Result<(), HalError>;
    fn dmx_deinit(&self, dmx: DmxId) -> Result<(), HalError>;
    /// Program channel slot `channel` for `pid`.
    fn dmx_start_feed(
        &self,
        dmx: DmxId,
        channel: usize,
        pid: u16,
        kind: ChannelType,
    ) -> Result<(), HalError>;
    fn dmx_stop_feed(&self, dmx: DmxId, channel: usize, pid: u16) -> Result<(), HalError>;
    fn dmx_set_source(&self, dmx: DmxId, source: TsSource) -> Result<(), HalError>;
    fn dmx_set_dump_ts_select(&self, dmx: DmxId, dump: bool) -> Result<(), HalError>;
    fn stb_set_source(&self, source: DmxSource) -> Result<(), HalError>;
    fn tso_set_source(&self, source: DmxSource) -> Result<(), HalError>;
    fn set_skipbyte(&self, skipbyte: u8) -> Result<(), HalError>;
    fn afifo_init(&self, id: AfifoId) -> Result<(), HalError>;
    fn afifo_deinit(&self, id: AfifoId) -> Result<(), HalError>;
    fn afifo_set_source(&self, id: AfifoId, dmx: DmxId) -> Result<(), HalError>;
    fn afifo_reset(&self, id: AfifoId) -> Result<(), HalError>;
    fn set_irq_enabled(&self, line: IrqLine, enabled: bool) -> Result<(), HalError>;
}

/// A recorded HAL call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HalCall {
    DmxInit(DmxId),
    DmxDeinit(DmxId),
    DmxStartFeed {
        dmx: DmxId,
        channel: usize,
        pid: u16,
        kind: ChannelType,
    },
    DmxStopFeed {
        dmx: DmxId,
        channel: usize,
        pid: u16,
    },
    DmxSetSource(DmxId, TsSource),
    DmxSetDumpTsSelect(DmxId, bool),
    StbSetSource(DmxSource),
    TsoSetSource(DmxSource),
    SetSkipbyte(u8),
    AfifoInit(AfifoId),
    AfifoDeinit(AfifoId),
    AfifoSetSource(AfifoId, DmxId),
    AfifoReset(AfifoId),
    SetIrqEnabled(IrqLine, bool),
}

impl HalCall {
    /// Operation name, as used by [`SimHal::fail_next`].
    pub fn op(&self) -> &'static str {
        match self {
            HalCall::DmxInit(_) => "dmx_init",
            HalCall::DmxDeinit(_) => "dmx_deinit",
            HalCall::DmxStartFeed { .. } => "dmx_start_feed",
            HalCall::DmxStopFeed { .. } => "dmx_stop_feed",
            HalCall::DmxSetSource(..) => "dmx_set_source",
            HalCall::DmxSetDumpTsSelect(..) => "dmx_set_dump_ts_select",
            HalCall::StbSetSource(_) => "stb_set_source",
            HalCall::TsoSetSource(_) => "tso_set_source",
            HalCall::SetSkipbyte(_) => "set_skipbyte",
            HalCall::AfifoInit(_) => "afifo_init",
            HalCall::AfifoDeinit(_) => "afifo_deinit",
            HalCall::AfifoSetSource(..) => "afifo_set_source",
            HalCall::AfifoReset(_) => "afifo_reset",
            HalCall::SetIrqEnabled(..) => "set_irq_enabled",
        }
    }
}

/// Recording HAL with failure injection.
#[derive(Debug, Default)]
pub struct SimHal {
    calls: Mutex<Vec<HalCall>>,
    failures: Mutex<HashMap<&'static str, u32>>,
}

impl SimHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail.
    pub fn fail_next(&self, op: &'static str, times: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            *failures.entry(op).or_insert(0) += times;
        }
    }

    /// Successful calls so far, in order.
    pub fn calls(&self) -> Vec<HalCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    /// Channel programming calls, as `(channel, pid)`.
    pub fn started_feeds(&self, dmx: DmxId) -> Vec<(usize, u16)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                HalCall::DmxStartFeed {
                    dmx: d,
                    channel,
                    pid,
                    ..
                } if d == dmx => Some((channel, pid)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: HalCall) -> Result<(), HalError> {
        let op = call.op();
        if let Ok(mut failures) = self.failures.lock() {
            if let Some(left) = failures.get_mut(op) {
                if *left > 0 {
                    *left -= 1;
                    return Err(HalError::new(op, "injected failure"));
                }
            }
        }
        trace!("hal: {:?}", call);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        Ok(())
    }
}

impl DemuxHal for SimHal {
    fn dmx_init(&self, dmx: DmxId) -> Result<(), HalError> {
        self.record(HalCall::DmxInit(dmx))
    }

    fn dmx_deinit(&self, dmx: DmxId) -> Result<(), HalError> {
        self.record(HalCall::DmxDeinit(dmx))
    }

    fn dmx_start_feed(
        &self,
        dmx: DmxId,
        channel: usize,
        pid: u16,
        kind: ChannelType,
    ) -> Result<(), HalError> {
        self.record(HalCall::DmxStartFeed {
            dmx,
            channel,
            pid,
            kind,
        })
    }

    fn dmx_stop_feed(&self, dmx: DmxId, channel: usize, pid: u16) -> Result<(), HalError> {
        self.record(HalCall::DmxStopFeed { dmx, channel, pid })
    }

    fn dmx_set_source(&self, dmx: DmxId, source: TsSource) -> Result<(), HalError> {
        self.record(HalCall::DmxSetSource(dmx, source))
    }

    fn dmx_set_dump_ts_select(&self, dmx: DmxId, dump: bool) -> Result<(), HalError> {
        self.record(HalCall::DmxSetDumpTsSelect(dmx, dump))
    }

    fn stb_set_source(&self, source: DmxSource) -> Result<(), HalError> {
        self.record(HalCall::StbSetSource(source))
    }

    fn tso_set_source(&self, source: DmxSource) -> Result<(), HalError> {
        self.record(HalCall::TsoSetSource(source))
    }

    fn set_skipbyte(&self, skipbyte: u8) -> Result<(), HalError> {
        self.record(HalCall::SetSkipbyte(skipbyte))
    }

    fn afifo_init(&self, id: AfifoId) -> Result<(), HalError> {
        self.record(HalCall::AfifoInit(id))
    }

    fn afifo_deinit(&self, id: AfifoId) -> Result<(), HalError> {
        self.record(HalCall::AfifoDeinit(id))
    }

    fn afifo_set_source(&self, id: AfifoId, dmx: DmxId) -> Result<(), HalError> {
        self.record(HalCall::AfifoSetSource(id, dmx))
    }

    fn afifo_reset(&self, id: AfifoId) -> Result<(), HalError> {
        self.record(HalCall::AfifoReset(id))
    }

    fn set_irq_enabled(&self, line: IrqLine, enabled: bool) -> Result<(), HalError> {
        self.record(HalCall::SetIrqEnabled(line, enabled))
    }
}
