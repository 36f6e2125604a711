// Copyright 2022 Oxide Computer Company

use std::fmt;

use crate::field::FIELDS;
use crate::flow::{Flow, FlowMask, FLOW_U64S};

/// A value/mask pair over the flow layout. Bit `i` of the mask = 1 means a
/// matching flow must agree with the value at bit `i`. The value is kept
/// pre-masked, so two matches are equal iff their masks and stored values
/// are bytewise equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MiniMatch {
    value: Flow,
    mask: FlowMask,
}

impl MiniMatch {
    pub fn new(mut value: Flow, mask: FlowMask) -> Self {
        value.apply(&mask);
        Self { value, mask }
    }

    /// Match every flow.
    pub fn catchall() -> Self {
        Self { value: Flow::new(), mask: FlowMask::new() }
    }

    pub fn value(&self) -> &Flow {
        &self.value
    }

    pub fn mask(&self) -> &FlowMask {
        &self.mask
    }

    pub fn is_catchall(&self) -> bool {
        self.mask.is_catchall()
    }

    /// Two matches have the same shape iff their masks are equal; rules of
    /// one shape share a subtable.
    pub fn shape_eq(&self, other: &MiniMatch) -> bool {
        self.mask == other.mask
    }

    pub fn matches(&self, flow: &Flow) -> bool {
        (0..FLOW_U64S).all(|w| {
            flow.word(w) & self.mask.word(w) == self.value.word(w)
        })
    }

    /// True if every bit `criteria` pins is pinned identically here. This
    /// is the non-strict match used to select rules for iteration and
    /// bulk deletion.
    pub fn is_loose_match(&self, criteria: &MiniMatch) -> bool {
        criteria.mask.is_subset_of(&self.mask)
            && (0..FLOW_U64S).all(|w| {
                self.value.word(w) & criteria.mask.word(w)
                    == criteria.value.word(w)
            })
    }

    /// True if some flow satisfies both matches: wherever the two masks
    /// both pin a bit, the values agree.
    pub fn intersects(&self, other: &MiniMatch) -> bool {
        (0..FLOW_U64S).all(|w| {
            self.mask.word(w)
                & other.mask.word(w)
                & (self.value.word(w) ^ other.value.word(w))
                == 0
        })
    }
}

impl fmt::Display for MiniMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_catchall() {
            return write!(f, "*");
        }
        let mut first = true;
        for fd in FIELDS {
            let m = self.mask.field_bytes(fd.id);
            if m.iter().all(|b| *b == 0) {
                continue;
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}=0x", fd.name)?;
            for b in self.value.field_bytes(fd.id) {
                write!(f, "{:02x}", b)?;
            }
            if !self.mask.field_is_exact(fd.id) {
                write!(f, "/0x")?;
                for b in m {
                    write!(f, "{:02x}", b)?;
                }
            }
        }
        Ok(())
    }
}
