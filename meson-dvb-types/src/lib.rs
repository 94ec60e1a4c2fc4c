//! Shared definitions for the meson-dvb demux control core.
//!
//! This crate holds the pieces that both the control core and its
//! collaborators (frontend drivers, HAL implementations, tools) need to
//! agree on:
//!
//! - Table and buffer sizing constants of the demux hardware
//! - [`DmxId`] / [`AfifoId`] engine identifiers
//! - [`TsSource`] (hardware routing) and [`DmxSource`] (DVB numbering)
//! - [`ChannelType`], [`PesType`] and [`SectionOrigin`]
//! - The [`DemuxError`] taxonomy and [`HalError`]
//!
//! ```rust
//! use meson_dvb_types::{DmxSource, PesType, DTO_CHDIS_VAS};
//!
//! let src: DmxSource = "dvr0".parse().unwrap();
//! assert_eq!(src.to_raw(), 16);
//! assert_ne!(DTO_CHDIS_VAS & PesType::Video.bit(), 0);
//! ```

pub mod error;
pub mod types;

pub use error::{DemuxError, HalError, Resource};
pub use types::{
    AfifoId, ChannelType, DmxId, DmxSource, PesType, SectionOrigin, TsInputMode, TsSource,
    ASYNCFIFO_COUNT, CHANNEL_COUNT, DMX_DEV_COUNT, DTO_CHDIS_VAS, DTO_TIMEOUT_DEF_MS,
    FILTER_COUNT, FILTER_LEN, MAX_SECTION_SIZE, S2P_COUNT, SEC_BUF_BUSY_SIZE,
    SEC_BUF_COUNT, SEC_BUF_GRP_COUNT, SEC_CNT_MAX, SF_BUFFER_SIZE, SS_BUFSIZE_DEF, SYNC_BYTE,
    TS_IN_COUNT, TS_PACKET_SIZE,
};
