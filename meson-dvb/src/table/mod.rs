//! Channel and filter tables of one demux engine.
//!
//! - [`ChannelTable`]: PID → channel slots with reference counting and the
//!   channel-ignore memory
//! - [`FilterTable`]: section filters bound to channels, hardware and
//!   software-fallback slots
//! - [`SlotTable`]: the generation-checked arena both are built on

pub mod channel;
pub mod filter;
pub mod slot;

pub use channel::{
    Allocation, Channel, ChannelIgnore, ChannelIgnoreList, ChannelTable, IgnoreMode,
    IgnorePolicy, Release,
};
pub use filter::{Filter, FilterPath, FilterPattern, FilterTable, Polarity};
pub use slot::{Lookup, SlotKey, SlotTable};

macro_rules! slot_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) SlotKey);

        impl $name {
            /// Hardware table index of this entry.
            pub fn index(self) -> usize {
                self.0.index()
            }
        }
    };
}

slot_id!(
    /// Handle to an allocated channel.
    ChannelId
);
slot_id!(
    /// Handle to an attached section filter.
    FilterId
);
slot_id!(
    /// Handle to a started feed.
    FeedId
);
