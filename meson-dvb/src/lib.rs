//! Control core of a hardware MPEG-TS demultiplexer.
//!
//! A [`Device`] owns up to three demux engines, the async FIFO capture
//! units and the transport input router. Each engine ([`DemuxInstance`])
//! keeps its channel and filter tables, its section buffer pools and a pair
//! of drain workers fed by simulated interrupts. The watchdog resets an
//! engine when its channels stall or its sections keep failing CRC.
//!
//! Hardware access goes through [`DemuxHal`]; [`SimHal`] records the calls
//! and can inject failures.
//!
//! ```no_run
//! use std::sync::Arc;
//! use meson_dvb::{Config, Device, FeedSpec, FilterPattern, SimHal};
//! use meson_dvb_types::{DmxId, DmxSource};
//!
//! # async fn run() -> Result<(), meson_dvb_types::DemuxError> {
//! let device = Device::probe(Arc::new(SimHal::new()), Config::default()).await?;
//! let dmx = DmxId::new(0)?;
//! device.set_source(dmx, DmxSource::Dvr(0)).await?;
//!
//! let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
//! let feed = device.start_feed(dmx, FeedSpec::section(0x0000), tx).await?;
//! device.attach_filter(dmx, feed, FilterPattern::table_id(0x00), 1).await?;
//! # Ok(())
//! # }
//! ```

pub mod asyncfifo;
pub mod buffer;
pub mod config;
pub mod demux;
pub mod device;
pub mod frontend;
pub mod hal;
pub mod packet;
pub mod router;
pub mod section;
pub mod swfilter;
pub mod table;
pub mod watchdog;

pub use asyncfifo::{AsyncFifo, AsyncFifoSnapshot, CaptureTap};
pub use config::{Config, ConfigError};
pub use demux::{DemuxInstance, DemuxOutput, FeedKind, FeedSink, FeedSpec, WatchdogState};
pub use device::{DemuxReport, Device, DeviceState, DeviceStats};
pub use frontend::{ErrorCheckReport, Frontend};
pub use hal::{DemuxHal, HalCall, IrqLine, SimHal};
pub use router::{dmx_get_ts_serial, Router};
pub use swfilter::SwFilterStats;
pub use table::{ChannelId, FeedId, FilterId, FilterPattern, Polarity};
pub use watchdog::ResetIrq;
