// Copyright 2022 Oxide Computer Company

//! The field registry. Every header field the classifier can match on is
//! described here: where it lives in the flow byte layout, how wide it is,
//! which pipeline stage it belongs to, and whether it has a canonical
//! big-endian prefix orientation (address fields).

use serde::{Deserialize, Serialize};

use crate::flow::FLOW_SIZE;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum FieldCategory {
    Metadata,
    L2,
    L3,
    L4,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[repr(usize)]
pub enum FieldId {
    Metadata = 0,
    InPort,
    EthSrc,
    VlanTci,
    EthDst,
    EthType,
    Ipv6Src,
    Ipv6Dst,
    Ipv4Src,
    Ipv4Dst,
    IpProto,
    IpTos,
    IpTtl,
    TpSrc,
    TpDst,
    TcpFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub id: FieldId,
    pub name: &'static str,
    /// Byte offset into the flow layout.
    pub offset: usize,
    /// Width in bytes.
    pub width: usize,
    pub category: FieldCategory,
    /// Address fields with a big-endian prefix orientation may back a
    /// prefix trie.
    pub prefix: bool,
}

use FieldId::*;

const META: FieldCategory = FieldCategory::Metadata;
const L2: FieldCategory = FieldCategory::L2;
const L3: FieldCategory = FieldCategory::L3;
const L4: FieldCategory = FieldCategory::L4;

/// Indexed by `FieldId` discriminant.
pub const FIELDS: &[FieldDef] = &[
    FieldDef { id: Metadata, name: "metadata", offset: 0, width: 8, category: META, prefix: false },
    FieldDef { id: InPort, name: "in_port", offset: 8, width: 4, category: META, prefix: false },
    FieldDef { id: EthSrc, name: "eth_src", offset: 16, width: 6, category: L2, prefix: false },
    FieldDef { id: VlanTci, name: "vlan_tci", offset: 22, width: 2, category: L2, prefix: false },
    FieldDef { id: EthDst, name: "eth_dst", offset: 24, width: 6, category: L2, prefix: false },
    FieldDef { id: EthType, name: "eth_type", offset: 30, width: 2, category: L2, prefix: false },
    FieldDef { id: Ipv6Src, name: "ipv6_src", offset: 32, width: 16, category: L3, prefix: true },
    FieldDef { id: Ipv6Dst, name: "ipv6_dst", offset: 48, width: 16, category: L3, prefix: true },
    FieldDef { id: Ipv4Src, name: "ipv4_src", offset: 64, width: 4, category: L3, prefix: true },
    FieldDef { id: Ipv4Dst, name: "ipv4_dst", offset: 68, width: 4, category: L3, prefix: true },
    FieldDef { id: IpProto, name: "ip_proto", offset: 72, width: 1, category: L3, prefix: false },
    FieldDef { id: IpTos, name: "ip_tos", offset: 73, width: 1, category: L3, prefix: false },
    FieldDef { id: IpTtl, name: "ip_ttl", offset: 74, width: 1, category: L3, prefix: false },
    FieldDef { id: TpSrc, name: "tp_src", offset: 80, width: 2, category: L4, prefix: false },
    FieldDef { id: TpDst, name: "tp_dst", offset: 82, width: 2, category: L4, prefix: false },
    FieldDef { id: TcpFlags, name: "tcp_flags", offset: 84, width: 2, category: L4, prefix: false },
];

/// One byte per flow byte, 0xff where some field covers it. Bytes outside
/// this map are padding and may never be pinned by a mask.
pub const REGISTERED_BYTES: [u8; FLOW_SIZE] = {
    let mut m = [0u8; FLOW_SIZE];
    let mut i = 0;
    while i < FIELDS.len() {
        let mut b = FIELDS[i].offset;
        while b < FIELDS[i].offset + FIELDS[i].width {
            m[b] = 0xff;
            b += 1;
        }
        i += 1;
    }
    m
};

impl FieldId {
    pub fn def(self) -> &'static FieldDef {
        &FIELDS[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.def().name
    }

    /// Width in bits.
    pub fn n_bits(self) -> usize {
        self.def().width * 8
    }

    /// The u64 word of the flow layout this field starts in.
    pub fn start_word(self) -> usize {
        self.def().offset / 8
    }
}
