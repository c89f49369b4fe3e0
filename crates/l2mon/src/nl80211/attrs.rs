//! nl80211 command and attribute identifiers, with the policies the
//! reply parsers validate against.
//!
//! Only the identifiers this driver consumes are listed; the kernel
//! namespace is much larger.

use crate::netlink::attr::{AttrKind, AttrPolicy};

/// Generic netlink family name this driver binds to.
pub const FAMILY_NAME: &str = "nl80211";

/// Multicast group carrying MLME notifications.
pub const MLME_GROUP: &str = "mlme";

/// nl80211 commands.
pub mod cmd {
    pub const GET_STATION: u8 = 17;
    pub const NEW_STATION: u8 = 19;
    pub const DEL_STATION: u8 = 20;
    pub const GET_SCAN: u8 = 32;
    pub const NEW_SCAN_RESULTS: u8 = 34;
}

/// Top-level nl80211 attributes.
pub mod attr {
    pub const IFINDEX: u16 = 3;
    pub const MAC: u16 = 6;
    pub const STA_INFO: u16 = 21;
    pub const BSS: u16 = 47;

    /// Highest top-level attribute id the driver stores.
    pub const MAX: u16 = 47;
}

/// Nested station info attributes (NL80211_STA_INFO_*).
pub mod sta_info {
    pub const INACTIVE_TIME: u16 = 1;
    pub const RX_BYTES: u16 = 2;
    pub const TX_BYTES: u16 = 3;
    pub const LLID: u16 = 4;
    pub const PLID: u16 = 5;
    pub const PLINK_STATE: u16 = 6;
    pub const SIGNAL: u16 = 7;
    pub const TX_BITRATE: u16 = 8;
    pub const RX_PACKETS: u16 = 9;
    pub const TX_PACKETS: u16 = 10;
    pub const TX_RETRIES: u16 = 11;
    pub const TX_FAILED: u16 = 12;
    pub const RX_BITRATE: u16 = 14;

    pub const MAX: u16 = 14;
}

/// Nested rate info attributes (NL80211_RATE_INFO_*).
pub mod rate_info {
    pub const BITRATE: u16 = 1;
    pub const MCS: u16 = 2;
    pub const WIDTH_40_MHZ: u16 = 3;
    pub const SHORT_GI: u16 = 4;

    pub const MAX: u16 = 4;
}

/// Nested BSS attributes (NL80211_BSS_*).
pub mod bss {
    pub const BSSID: u16 = 1;
    pub const FREQUENCY: u16 = 2;
    pub const TSF: u16 = 3;
    pub const BEACON_INTERVAL: u16 = 4;
    pub const CAPABILITY: u16 = 5;
    pub const INFORMATION_ELEMENTS: u16 = 6;
    pub const SIGNAL_MBM: u16 = 7;
    pub const SIGNAL_UNSPEC: u16 = 8;
    pub const STATUS: u16 = 9;
    pub const SEEN_MS_AGO: u16 = 10;
    pub const BEACON_IES: u16 = 11;

    pub const MAX: u16 = 11;
}

/// Policy for top-level station dump attributes.
pub const STATION_POLICY: &[AttrPolicy] = &[
    (attr::IFINDEX, AttrKind::U32),
    (attr::MAC, AttrKind::Binary(6)),
    (attr::STA_INFO, AttrKind::Nested),
];

/// Policy for nested station info attributes.
pub const STA_INFO_POLICY: &[AttrPolicy] = &[
    (sta_info::INACTIVE_TIME, AttrKind::U32),
    (sta_info::RX_BYTES, AttrKind::U32),
    (sta_info::TX_BYTES, AttrKind::U32),
    (sta_info::LLID, AttrKind::U16),
    (sta_info::PLID, AttrKind::U16),
    (sta_info::PLINK_STATE, AttrKind::U8),
    (sta_info::SIGNAL, AttrKind::U8),
    (sta_info::TX_BITRATE, AttrKind::Nested),
    (sta_info::RX_PACKETS, AttrKind::U32),
    (sta_info::TX_PACKETS, AttrKind::U32),
    (sta_info::TX_RETRIES, AttrKind::U32),
    (sta_info::TX_FAILED, AttrKind::U32),
    (sta_info::RX_BITRATE, AttrKind::Nested),
];

/// Policy for nested rate info attributes.
pub const RATE_POLICY: &[AttrPolicy] = &[
    (rate_info::BITRATE, AttrKind::U16),
    (rate_info::MCS, AttrKind::U8),
    (rate_info::WIDTH_40_MHZ, AttrKind::Flag),
    (rate_info::SHORT_GI, AttrKind::Flag),
];

/// Policy for nested BSS attributes.
pub const BSS_POLICY: &[AttrPolicy] = &[
    (bss::BSSID, AttrKind::Binary(6)),
    (bss::FREQUENCY, AttrKind::U32),
    (bss::TSF, AttrKind::U64),
    (bss::BEACON_INTERVAL, AttrKind::U16),
    (bss::CAPABILITY, AttrKind::U16),
    (bss::SIGNAL_MBM, AttrKind::U32),
    (bss::SIGNAL_UNSPEC, AttrKind::U8),
    (bss::STATUS, AttrKind::U32),
    (bss::SEEN_MS_AGO, AttrKind::U32),
];
