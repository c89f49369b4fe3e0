//! Reply parsers for the nl80211 driver.
//!
//! All parsers take the attribute run that follows the generic netlink
//! header and produce plain records; applying them to the link-layer
//! model happens in the driver so the wire handling stays testable
//! without a kernel.

use winnow::Parser;
use winnow::binary::u8 as byte;
use winnow::error::ContextError;
use winnow::token::take;

use super::attrs::{BSS_POLICY, RATE_POLICY, STA_INFO_POLICY, STATION_POLICY, attr, bss, rate_info, sta_info};
use crate::error::{Error, Result};
use crate::layer2::NeighField;
use crate::netlink::attr::{AttrIter, get, parse_policy};
use crate::netlink::genl::{CtrlAttr, CtrlAttrMcastGrp};
use crate::util::addr::MacAddr;

type PResult<T> = core::result::Result<T, winnow::error::ErrMode<ContextError>>;

/// One family record from a CTRL_CMD_NEWFAMILY reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FamilyReply {
    pub name: String,
    pub id: u16,
    /// (group name, group id) pairs from CTRL_ATTR_MCAST_GROUPS.
    pub mcast_groups: Vec<(String, u32)>,
}

/// Parse a family record.
pub(crate) fn parse_family(data: &[u8]) -> Result<FamilyReply> {
    let mut name = None;
    let mut id = None;
    let mut mcast_groups = Vec::new();

    for (kind, payload) in AttrIter::new(data) {
        if kind == CtrlAttr::FamilyName as u16 {
            name = Some(get::string(payload)?.to_string());
        } else if kind == CtrlAttr::FamilyId as u16 {
            id = Some(get::u16_ne(payload)?);
        } else if kind == CtrlAttr::McastGroups as u16 {
            // Each nested entry is one group: { name, id }.
            for (_, group_payload) in AttrIter::new(payload) {
                let mut group_name = None;
                let mut group_id = None;
                for (gkind, gpayload) in AttrIter::new(group_payload) {
                    if gkind == CtrlAttrMcastGrp::Name as u16 {
                        group_name = Some(get::string(gpayload)?.to_string());
                    } else if gkind == CtrlAttrMcastGrp::Id as u16 {
                        group_id = Some(get::u32_ne(gpayload)?);
                    }
                }
                if let (Some(n), Some(i)) = (group_name, group_id) {
                    mcast_groups.push((n, i));
                }
            }
        }
    }

    let name = name.ok_or_else(|| Error::InvalidAttribute("missing family name".into()))?;
    let id = id.ok_or_else(|| Error::InvalidAttribute("missing family id".into()))?;
    Ok(FamilyReply {
        name,
        id,
        mcast_groups,
    })
}

/// Normalize an nl80211 bitrate (units of 100 kbit/s) to bits per
/// second.
pub(crate) fn bitrate_to_bps(raw: u16) -> i64 {
    (raw as i64 * 1024 * 1024) / 10
}

/// One station record from an NL80211_CMD_NEW_STATION reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StationRecord {
    pub if_index: u32,
    pub mac: MacAddr,
    /// Milliseconds since the station was last active.
    pub inactive_ms: Option<u32>,
    /// Scaled values ready for the link-layer model.
    pub values: Vec<(NeighField, i64)>,
}

fn parse_rate(data: &[u8], field: NeighField, out: &mut Vec<(NeighField, i64)>) -> Result<()> {
    let rinfo = parse_policy(data, rate_info::MAX, RATE_POLICY)?;
    if let Some(payload) = rinfo[rate_info::BITRATE as usize] {
        out.push((field, bitrate_to_bps(get::u16_ne(payload)?)));
    }
    Ok(())
}

/// Parse a station dump entry.
pub(crate) fn parse_station(data: &[u8]) -> Result<StationRecord> {
    let (if_index, mac) = parse_station_key(data)?;
    let tb = parse_policy(data, attr::MAX, STATION_POLICY)?;
    let sta = tb[attr::STA_INFO as usize]
        .ok_or_else(|| Error::InvalidAttribute("missing station info".into()))?;
    let sinfo = parse_policy(sta, sta_info::MAX, STA_INFO_POLICY)?;

    let mut values = Vec::new();
    let mut copy_u32 = |slot: Option<&[u8]>, field: NeighField| -> Result<()> {
        if let Some(payload) = slot {
            values.push((field, get::u32_ne(payload)? as i64));
        }
        Ok(())
    };
    copy_u32(sinfo[sta_info::RX_BYTES as usize], NeighField::RxBytes)?;
    copy_u32(sinfo[sta_info::RX_PACKETS as usize], NeighField::RxFrames)?;
    copy_u32(sinfo[sta_info::TX_BYTES as usize], NeighField::TxBytes)?;
    copy_u32(sinfo[sta_info::TX_PACKETS as usize], NeighField::TxFrames)?;
    copy_u32(sinfo[sta_info::TX_RETRIES as usize], NeighField::TxRetries)?;
    copy_u32(sinfo[sta_info::TX_FAILED as usize], NeighField::TxFailed)?;

    if let Some(payload) = sinfo[sta_info::SIGNAL as usize] {
        // dBm as a signed byte, scaled to milli-dBm.
        values.push((
            NeighField::Signal,
            1000 * (get::u8(payload)? as i8 as i64),
        ));
    }
    if let Some(payload) = sinfo[sta_info::TX_BITRATE as usize] {
        parse_rate(payload, NeighField::TxBitrate, &mut values)?;
    }
    if let Some(payload) = sinfo[sta_info::RX_BITRATE as usize] {
        parse_rate(payload, NeighField::RxBitrate, &mut values)?;
    }

    let inactive_ms = match sinfo[sta_info::INACTIVE_TIME as usize] {
        Some(payload) => Some(get::u32_ne(payload)?),
        None => None,
    };

    Ok(StationRecord {
        if_index,
        mac,
        inactive_ms,
        values,
    })
}

/// Parse just the (interface, station MAC) key, as carried by both
/// NEW_STATION and DEL_STATION.
pub(crate) fn parse_station_key(data: &[u8]) -> Result<(u32, MacAddr)> {
    let tb = parse_policy(data, attr::MAX, STATION_POLICY)?;
    let if_index = get::u32_ne(
        tb[attr::IFINDEX as usize]
            .ok_or_else(|| Error::InvalidAttribute("missing interface index".into()))?,
    )?;
    let mac = tb[attr::MAC as usize]
        .and_then(MacAddr::from_bytes)
        .ok_or_else(|| Error::InvalidAttribute("missing station MAC".into()))?;
    Ok((if_index, mac))
}

/// One BSS record from an NL80211_CMD_NEW_SCAN_RESULTS reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ScanRecord {
    pub if_index: u32,
    pub bssid: Option<MacAddr>,
    pub frequency_hz: Option<i64>,
    pub seen_ms_ago: Option<u32>,
    pub ssid: Option<String>,
    pub max_bitrate: Option<i64>,
}

/// Parse a scan dump entry.
pub(crate) fn parse_scan(data: &[u8]) -> Result<ScanRecord> {
    let tb = parse_policy(data, attr::MAX, &[(attr::IFINDEX, crate::netlink::attr::AttrKind::U32)])?;
    let if_index = get::u32_ne(
        tb[attr::IFINDEX as usize]
            .ok_or_else(|| Error::InvalidAttribute("missing interface index".into()))?,
    )?;
    let bss_data = tb[attr::BSS as usize]
        .ok_or_else(|| Error::InvalidAttribute("missing BSS info".into()))?;
    let binfo = parse_policy(bss_data, bss::MAX, BSS_POLICY)?;

    let mut record = ScanRecord {
        if_index,
        ..Default::default()
    };
    record.bssid = binfo[bss::BSSID as usize].and_then(MacAddr::from_bytes);
    if let Some(payload) = binfo[bss::FREQUENCY as usize] {
        // MHz on the wire.
        record.frequency_hz = Some(get::u32_ne(payload)? as i64 * 1_000_000);
    }
    if let Some(payload) = binfo[bss::SEEN_MS_AGO as usize] {
        record.seen_ms_ago = Some(get::u32_ne(payload)?);
    }

    let ies = binfo[bss::INFORMATION_ELEMENTS as usize].or(binfo[bss::BEACON_IES as usize]);
    if let Some(ies) = ies {
        let (ssid, max_bitrate) = parse_ies(ies);
        record.ssid = ssid;
        record.max_bitrate = max_bitrate;
    }
    Ok(record)
}

fn information_element<'a>(input: &mut &'a [u8]) -> PResult<(u8, &'a [u8])> {
    let tag = byte.parse_next(input)?;
    let len = byte.parse_next(input)?;
    let body = take(len as usize).parse_next(input)?;
    Ok((tag, body))
}

/// Walk 802.11 information elements collecting the SSID and the
/// highest supported rate in bits per second. Rates are carried in
/// half-Mbit units with the high bit marking "basic rate".
pub(crate) fn parse_ies(mut data: &[u8]) -> (Option<String>, Option<i64>) {
    let input = &mut data;
    let mut ssid = None;
    let mut max_rate: i64 = 0;

    while !input.is_empty() {
        let Ok((tag, body)) = information_element(input) else {
            break;
        };
        match tag {
            // SSID
            0 => {
                if ssid.is_none()
                    && let Ok(s) = std::str::from_utf8(body)
                {
                    ssid = Some(s.trim_end_matches('\0').to_string());
                }
            }
            // supported rates / extended supported rates
            1 | 50 => {
                for &b in body {
                    let rate = ((b & 0x7f) as i64) << 19;
                    if rate > max_rate {
                        max_rate = rate;
                    }
                }
            }
            _ => {}
        }
    }

    (ssid, (max_rate > 0).then_some(max_rate))
}
