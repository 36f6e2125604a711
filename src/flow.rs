// Copyright 2022 Oxide Computer Company

//! The flow header space. A `Flow` is the fixed byte layout all matching is
//! performed against; a `FlowMask` selects the bits of that layout a rule
//! pins or a lookup has examined. Both are plain value types. Masked
//! comparison and hashing work over u64 words so the staged subtable lookup
//! can hash a prefix of the layout and resume from where it left off.

use std::fmt;
use std::hash::{BuildHasher, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::ops::Range;

use ahash::{AHasher, RandomState};
use bitvec::prelude::*;

use crate::field::{FieldId, REGISTERED_BYTES};

/// Flow layout size in bytes.
pub const FLOW_SIZE: usize = 88;

/// Flow layout size in u64 words.
pub const FLOW_U64S: usize = FLOW_SIZE / 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flow {
    bytes: [u8; FLOW_SIZE],
}

impl Default for Flow {
    fn default() -> Self {
        Self { bytes: [0; FLOW_SIZE] }
    }
}

impl Flow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: [u8; FLOW_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8; FLOW_SIZE] {
        &self.bytes
    }

    /// Word `i` of the layout, taken big-endian so that cross-byte
    /// comparisons are well defined.
    pub(crate) fn word(&self, i: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.bytes[i * 8..i * 8 + 8]);
        u64::from_be_bytes(b)
    }

    pub fn field_bytes(&self, f: FieldId) -> &[u8] {
        let d = f.def();
        &self.bytes[d.offset..d.offset + d.width]
    }

    pub fn set_field_bytes(&mut self, f: FieldId, v: &[u8]) {
        let d = f.def();
        assert_eq!(v.len(), d.width);
        self.bytes[d.offset..d.offset + d.width].copy_from_slice(v);
    }

    pub fn metadata(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.field_bytes(FieldId::Metadata));
        u64::from_be_bytes(b)
    }

    pub fn set_metadata(&mut self, v: u64) {
        self.set_field_bytes(FieldId::Metadata, &v.to_be_bytes());
    }

    pub fn set_in_port(&mut self, v: u32) {
        self.set_field_bytes(FieldId::InPort, &v.to_be_bytes());
    }

    pub fn set_eth_src(&mut self, v: [u8; 6]) {
        self.set_field_bytes(FieldId::EthSrc, &v);
    }

    pub fn set_eth_dst(&mut self, v: [u8; 6]) {
        self.set_field_bytes(FieldId::EthDst, &v);
    }

    pub fn set_eth_type(&mut self, v: u16) {
        self.set_field_bytes(FieldId::EthType, &v.to_be_bytes());
    }

    pub fn set_vlan_tci(&mut self, v: u16) {
        self.set_field_bytes(FieldId::VlanTci, &v.to_be_bytes());
    }

    pub fn set_ipv4_src(&mut self, v: Ipv4Addr) {
        self.set_field_bytes(FieldId::Ipv4Src, &v.octets());
    }

    pub fn set_ipv4_dst(&mut self, v: Ipv4Addr) {
        self.set_field_bytes(FieldId::Ipv4Dst, &v.octets());
    }

    pub fn set_ipv6_src(&mut self, v: Ipv6Addr) {
        self.set_field_bytes(FieldId::Ipv6Src, &v.octets());
    }

    pub fn set_ipv6_dst(&mut self, v: Ipv6Addr) {
        self.set_field_bytes(FieldId::Ipv6Dst, &v.octets());
    }

    pub fn set_ip_proto(&mut self, v: u8) {
        self.set_field_bytes(FieldId::IpProto, &[v]);
    }

    pub fn set_ip_tos(&mut self, v: u8) {
        self.set_field_bytes(FieldId::IpTos, &[v]);
    }

    pub fn set_ip_ttl(&mut self, v: u8) {
        self.set_field_bytes(FieldId::IpTtl, &[v]);
    }

    pub fn set_tp_src(&mut self, v: u16) {
        self.set_field_bytes(FieldId::TpSrc, &v.to_be_bytes());
    }

    pub fn set_tp_dst(&mut self, v: u16) {
        self.set_field_bytes(FieldId::TpDst, &v.to_be_bytes());
    }

    pub fn set_tcp_flags(&mut self, v: u16) {
        self.set_field_bytes(FieldId::TcpFlags, &v.to_be_bytes());
    }

    /// Apply `mask`, zeroing every bit the mask does not pin.
    pub(crate) fn apply(&mut self, mask: &FlowMask) {
        for i in 0..FLOW_SIZE {
            self.bytes[i] &= mask.bytes[i];
        }
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flow(")?;
        for b in self.bytes.iter() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// A bit set over the flow layout. Bit `i` = 1 means the corresponding
/// header bit is pinned (in a rule mask) or was examined (in a lookup
/// result). An all-zero mask is a catchall.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowMask {
    bytes: [u8; FLOW_SIZE],
}

impl Default for FlowMask {
    fn default() -> Self {
        Self { bytes: [0; FLOW_SIZE] }
    }
}

impl FlowMask {
    /// The catchall mask: nothing pinned.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8; FLOW_SIZE] {
        &self.bytes
    }

    pub(crate) fn word(&self, i: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.bytes[i * 8..i * 8 + 8]);
        u64::from_be_bytes(b)
    }

    pub fn is_catchall(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    /// True if `self` pins no bit that `other` does not also pin.
    pub fn is_subset_of(&self, other: &FlowMask) -> bool {
        self.bytes
            .iter()
            .zip(other.bytes.iter())
            .all(|(a, b)| a & !b == 0)
    }

    /// First flow byte offset pinned outside any registered field, if any.
    pub(crate) fn unregistered_byte(&self) -> Option<usize> {
        self.bytes
            .iter()
            .enumerate()
            .find(|(i, b)| **b & !REGISTERED_BYTES[*i] != 0)
            .map(|(i, _)| i)
    }

    /// Pin the whole extent of `f`.
    pub fn set_field(&mut self, f: FieldId) {
        let d = f.def();
        for b in &mut self.bytes[d.offset..d.offset + d.width] {
            *b = 0xff;
        }
    }

    /// Pin the first `n_bits` bits of `f`, MSB first.
    pub fn set_field_prefix(&mut self, f: FieldId, n_bits: u8) {
        let d = f.def();
        let bits = self.bytes[d.offset..d.offset + d.width]
            .view_bits_mut::<Msb0>();
        bits[..n_bits as usize].fill(true);
    }

    /// True if `f` is fully pinned.
    pub fn field_is_exact(&self, f: FieldId) -> bool {
        let d = f.def();
        self.bytes[d.offset..d.offset + d.width]
            .iter()
            .all(|b| *b == 0xff)
    }

    pub fn field_bytes(&self, f: FieldId) -> &[u8] {
        let d = f.def();
        &self.bytes[d.offset..d.offset + d.width]
    }

    /// If `f`'s mask bits form a prefix (some leading ones, then only
    /// zeros), the prefix length. `Some(0)` when the field is untouched,
    /// `None` when the mask has holes.
    pub fn prefix_len(&self, f: FieldId) -> Option<u8> {
        let d = f.def();
        let bits =
            self.bytes[d.offset..d.offset + d.width].view_bits::<Msb0>();
        let ones =
            bits.iter().by_vals().take_while(|b| *b).count();
        if bits[ones..].any() {
            None
        } else {
            Some(ones as u8)
        }
    }

    /// OR in the bits of `mask` lying in the given word range.
    pub(crate) fn or_mask_range(
        &mut self,
        mask: &FlowMask,
        words: Range<usize>,
    ) {
        for b in words.start * 8..words.end * 8 {
            self.bytes[b] |= mask.bytes[b];
        }
    }

    pub(crate) fn or_mask(&mut self, mask: &FlowMask) {
        self.or_mask_range(mask, 0..FLOW_U64S);
    }

    /// True if the mask pins any bit in the given word range.
    pub(crate) fn has_bits_in(&self, words: Range<usize>) -> bool {
        words.clone().any(|w| self.word(w) != 0)
    }

    #[cfg(test)]
    pub(crate) fn set_byte_for_test(&mut self, i: usize, v: u8) {
        self.bytes[i] = v;
    }
}

impl fmt::Debug for FlowMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlowMask(")?;
        for b in self.bytes.iter() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Incremental masked hasher. Each subtable stage hashes the masked words
/// of the next layout range on top of what was already fed, so stage `k`'s
/// hash covers words `[0, boundary(k))` without rehashing the earlier
/// ranges.
pub(crate) struct FlowHasher {
    inner: AHasher,
}

impl FlowHasher {
    pub(crate) fn new(state: &RandomState) -> Self {
        Self { inner: state.build_hasher() }
    }

    pub(crate) fn feed(
        &mut self,
        flow: &Flow,
        mask: &FlowMask,
        words: Range<usize>,
    ) {
        for w in words {
            self.inner.write_u64(flow.word(w) & mask.word(w));
        }
    }

    /// Hash of everything fed so far. The hasher remains usable; feeding
    /// more words extends the key.
    pub(crate) fn stage_hash(&self) -> u64 {
        self.inner.clone().finish()
    }
}
