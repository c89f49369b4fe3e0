//! Hand-built wire messages for tests.
//!
//! Attribute runs are assembled with the same framing rules the parser
//! expects, so the fixtures double as a second, independent encoder.

use crate::netlink::attr::{NLA_F_NESTED, NlAttr, nla_align};
use crate::netlink::genl::{CtrlAttr, CtrlAttrMcastGrp};
use crate::nl80211::attrs::{attr, bss, rate_info, sta_info};
use crate::util::addr::MacAddr;

/// Append one attribute with padding.
pub(crate) fn push_attr(buf: &mut Vec<u8>, attr_type: u16, data: &[u8]) {
    let header = NlAttr::new(attr_type, data.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(data);
    let aligned = nla_align(buf.len());
    buf.resize(aligned, 0);
}

/// Append a nested container attribute.
pub(crate) fn push_nested(buf: &mut Vec<u8>, attr_type: u16, inner: &[u8]) {
    push_attr(buf, attr_type | NLA_F_NESTED, inner);
}

/// Attribute run of a CTRL_CMD_NEWFAMILY record.
pub(crate) fn family_attrs(name: &str, id: u16, groups: &[(&str, u32)]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut name_z = name.as_bytes().to_vec();
    name_z.push(0);
    push_attr(&mut buf, CtrlAttr::FamilyName as u16, &name_z);
    push_attr(&mut buf, CtrlAttr::FamilyId as u16, &id.to_ne_bytes());

    if !groups.is_empty() {
        let mut container = Vec::new();
        for (index, (group_name, group_id)) in groups.iter().enumerate() {
            let mut entry = Vec::new();
            let mut group_z = group_name.as_bytes().to_vec();
            group_z.push(0);
            push_attr(&mut entry, CtrlAttrMcastGrp::Name as u16, &group_z);
            push_attr(&mut entry, CtrlAttrMcastGrp::Id as u16, &group_id.to_ne_bytes());
            push_nested(&mut container, index as u16 + 1, &entry);
        }
        push_nested(&mut buf, CtrlAttr::McastGroups as u16, &container);
    }
    buf
}

/// Attribute run of an NL80211_CMD_NEW_STATION record.
pub(crate) fn station_attrs(
    if_index: u32,
    mac: MacAddr,
    signal_dbm: i8,
    tx_bitrate_raw: u16,
    rx_bytes: u32,
    tx_bytes: u32,
) -> Vec<u8> {
    let mut buf = Vec::new();
    push_attr(&mut buf, attr::IFINDEX, &if_index.to_ne_bytes());
    push_attr(&mut buf, attr::MAC, &mac.octets());

    let mut sinfo = Vec::new();
    push_attr(&mut sinfo, sta_info::RX_BYTES, &rx_bytes.to_ne_bytes());
    push_attr(&mut sinfo, sta_info::TX_BYTES, &tx_bytes.to_ne_bytes());
    push_attr(&mut sinfo, sta_info::SIGNAL, &[signal_dbm as u8]);

    let mut rate = Vec::new();
    push_attr(&mut rate, rate_info::BITRATE, &tx_bitrate_raw.to_ne_bytes());
    push_nested(&mut sinfo, sta_info::TX_BITRATE, &rate);

    push_nested(&mut buf, attr::STA_INFO, &sinfo);
    buf
}

/// Attribute run of an NL80211_CMD_NEW_SCAN_RESULTS record.
pub(crate) fn scan_attrs(
    if_index: u32,
    bssid: MacAddr,
    freq_mhz: u32,
    seen_ms: u32,
    ssid: &str,
    rates_half_mbit: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::new();
    push_attr(&mut buf, attr::IFINDEX, &if_index.to_ne_bytes());

    let mut binfo = Vec::new();
    push_attr(&mut binfo, bss::BSSID, &bssid.octets());
    push_attr(&mut binfo, bss::FREQUENCY, &freq_mhz.to_ne_bytes());
    push_attr(&mut binfo, bss::SEEN_MS_AGO, &seen_ms.to_ne_bytes());

    let mut ies = Vec::new();
    ies.push(0u8);
    ies.push(ssid.len() as u8);
    ies.extend_from_slice(ssid.as_bytes());
    if !rates_half_mbit.is_empty() {
        ies.push(1u8);
        ies.push(rates_half_mbit.len() as u8);
        ies.extend_from_slice(rates_half_mbit);
    }
    push_attr(&mut binfo, bss::INFORMATION_ELEMENTS, &ies);

    push_nested(&mut buf, attr::BSS, &binfo);
    buf
}
