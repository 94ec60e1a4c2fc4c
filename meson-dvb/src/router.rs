//! Transport input routing: physical inputs, S2P converters and the
//! user-facing source numbering.

use log::info;
use meson_dvb_types::{
    DemuxError, DmxId, DmxSource, TsInputMode, TsSource, S2P_COUNT, TS_IN_COUNT,
};

use crate::config::DeviceConfig;
use crate::hal::DemuxHal;

/// One physical TS input.
#[derive(Debug, Clone, Default)]
pub struct TsInput {
    pub mode: TsInputMode,
    pub pinctrl: Option<String>,
    pub control: bool,
    pub s2p_id: u8,
}

/// Serial-to-parallel converter.
#[derive(Debug, Clone, Copy, Default)]
pub struct S2p {
    pub invert: bool,
}

#[derive(Debug, Clone)]
pub struct Router {
    inputs: Vec<TsInput>,
    s2p: Vec<S2p>,
    stb_source: Option<DmxSource>,
    tso_source: Option<DmxSource>,
    skipbyte: u8,
    ts_out_invert: bool,
}

impl Router {
    pub fn from_config(config: &DeviceConfig) -> Self {
        let mut inputs: Vec<TsInput> = config
            .inputs
            .iter()
            .take(TS_IN_COUNT)
            .map(|i| TsInput {
                mode: i.mode,
                pinctrl: i.pinctrl.clone(),
                control: i.control,
                s2p_id: i.s2p_id,
            })
            .collect();
        inputs.resize_with(TS_IN_COUNT, TsInput::default);

        let s2p = (0..S2P_COUNT)
            .map(|i| S2p {
                invert: config.s2p_invert.get(i).copied().unwrap_or(false),
            })
            .collect();

        Self {
            inputs,
            s2p,
            stb_source: None,
            tso_source: None,
            skipbyte: 0,
            ts_out_invert: config.ts_out_invert,
        }
    }

    pub fn inputs(&self) -> &[TsInput] {
        &self.inputs
    }

    pub fn s2p(&self) -> &[S2p] {
        &self.s2p
    }

    /// Hardware source an engine must select to receive `source`.
    pub fn resolve(&self, source: DmxSource) -> Result<TsSource, DemuxError> {
        match source {
            DmxSource::Front(n) => {
                let input = self
                    .inputs
                    .get(n as usize)
                    .ok_or_else(|| DemuxError::InvalidSource(format!("front{} has no input", n)))?;
                match input.mode {
                    TsInputMode::Disabled => Err(DemuxError::InvalidSource(format!(
                        "input {} is disabled",
                        n
                    ))),
                    TsInputMode::Parallel => TsSource::parallel(n as usize)
                        .ok_or_else(|| DemuxError::InvalidSource(format!("front{}", n))),
                    TsInputMode::Serial => TsSource::serial(input.s2p_id as usize)
                        .ok_or_else(|| DemuxError::InvalidSource(format!("s2p {}", input.s2p_id))),
                }
            }
            DmxSource::Dvr(_) => Ok(TsSource::Hiu),
            DmxSource::FrontOffset(n) => Ok(TsSource::cascade(DmxId::new(n as usize)?)),
        }
    }

    /// Check that data may be injected on `source`.
    pub fn check_input(&self, source: TsSource) -> Result<(), DemuxError> {
        match source {
            TsSource::Hiu => Ok(()),
            TsSource::Dmx0 | TsSource::Dmx1 | TsSource::Dmx2 => Err(DemuxError::InvalidSource(
                format!("{} is fed by another engine", source),
            )),
            TsSource::Ts0 | TsSource::Ts1 | TsSource::Ts2 => {
                let enabled = source
                    .port_index()
                    .and_then(|n| self.inputs.get(n))
                    .is_some_and(|i| i.mode == TsInputMode::Parallel);
                if enabled {
                    Ok(())
                } else {
                    Err(DemuxError::InvalidSource(format!("{} is not enabled", source)))
                }
            }
            TsSource::STs0 | TsSource::STs1 | TsSource::STs2 => {
                let converter = source.port_index();
                let enabled = self.inputs.iter().any(|i| {
                    i.mode == TsInputMode::Serial && Some(i.s2p_id as usize) == converter
                });
                if enabled {
                    Ok(())
                } else {
                    Err(DemuxError::InvalidSource(format!("{} has no serial input", source)))
                }
            }
        }
    }

    pub fn stb_source(&self) -> Option<DmxSource> {
        self.stb_source
    }

    pub fn tso_source(&self) -> Option<DmxSource> {
        self.tso_source
    }

    pub fn skipbyte(&self) -> u8 {
        self.skipbyte
    }

    pub fn ts_out_invert(&self) -> bool {
        self.ts_out_invert
    }

    pub fn set_stb_source(&mut self, hal: &dyn DemuxHal, source: DmxSource) -> Result<(), DemuxError> {
        if self.stb_source == Some(source) {
            return Ok(());
        }
        hal.stb_set_source(source)?;
        self.stb_source = Some(source);
        info!("STB source set to {:?}", source);
        Ok(())
    }

    pub fn set_tso_source(&mut self, hal: &dyn DemuxHal, source: DmxSource) -> Result<(), DemuxError> {
        if self.tso_source == Some(source) {
            return Ok(());
        }
        hal.tso_set_source(source)?;
        self.tso_source = Some(source);
        info!("TSO source set to {:?}", source);
        Ok(())
    }

    pub fn set_skipbyte(&mut self, hal: &dyn DemuxHal, skipbyte: u8) -> Result<(), DemuxError> {
        hal.set_skipbyte(skipbyte)?;
        self.skipbyte = skipbyte;
        Ok(())
    }
}

/// Whether `source` reaches the engine through an S2P converter.
pub fn dmx_get_ts_serial(source: TsSource) -> bool {
    source.is_serial()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TsInputConfig;
    use crate::hal::{HalCall, SimHal};

    fn router() -> Router {
        Router::from_config(&DeviceConfig {
            inputs: vec![
                TsInputConfig {
                    mode: TsInputMode::Parallel,
                    ..Default::default()
                },
                TsInputConfig {
                    mode: TsInputMode::Serial,
                    s2p_id: 1,
                    ..Default::default()
                },
            ],
            ..Default::default()
        })
    }

    #[test]
    fn test_resolve_sources() {
        let r = router();
        assert_eq!(r.resolve(DmxSource::Front(0)).unwrap(), TsSource::Ts0);
        assert_eq!(r.resolve(DmxSource::Front(1)).unwrap(), TsSource::STs1);
        assert!(matches!(
            r.resolve(DmxSource::Front(2)),
            Err(DemuxError::InvalidSource(_))
        ));
        assert!(r.resolve(DmxSource::Front(3)).is_err());
        assert_eq!(r.resolve(DmxSource::Dvr(2)).unwrap(), TsSource::Hiu);
        assert_eq!(r.resolve(DmxSource::FrontOffset(1)).unwrap(), TsSource::Dmx1);
        assert!(dmx_get_ts_serial(r.resolve(DmxSource::Front(1)).unwrap()));
    }

    #[test]
    fn test_check_input() {
        let r = router();
        assert!(r.check_input(TsSource::Ts0).is_ok());
        assert!(r.check_input(TsSource::Ts1).is_err());
        assert!(r.check_input(TsSource::STs1).is_ok());
        assert!(r.check_input(TsSource::STs0).is_err());
        assert!(r.check_input(TsSource::Hiu).is_ok());
        assert!(r.check_input(TsSource::Dmx0).is_err());
    }

    #[test]
    fn test_stb_source_programs_hal_once() {
        let hal = SimHal::new();
        let mut r = router();
        r.set_stb_source(&hal, DmxSource::Front(0)).unwrap();
        r.set_stb_source(&hal, DmxSource::Front(0)).unwrap();
        assert_eq!(hal.calls(), vec![HalCall::StbSetSource(DmxSource::Front(0))]);
        assert_eq!(r.stb_source(), Some(DmxSource::Front(0)));
    }
}
