// Copyright 2022 Oxide Computer Company

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Error;
use crate::flow::Flow;
use crate::mmatch::MiniMatch;

/// A classifier rule: a match plus a priority. Rules are owned by the
/// caller and handed to the classifier behind an `Arc`; the classifier
/// flags them installed while it holds them. Higher numeric priority wins.
pub struct Rule {
    mmatch: MiniMatch,
    priority: u32,
    installed: AtomicBool,
}

impl Rule {
    /// Fails with `InvalidMatch` if the mask pins bits outside every
    /// registered field.
    pub fn new(mmatch: MiniMatch, priority: u32) -> Result<Self, Error> {
        if let Some(b) = mmatch.mask().unregistered_byte() {
            return Err(Error::InvalidMatch(b));
        }
        Ok(Self { mmatch, priority, installed: AtomicBool::new(false) })
    }

    pub fn mmatch(&self) -> &MiniMatch {
        &self.mmatch
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Whether some classifier currently holds this rule.
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    pub(crate) fn set_installed(&self, v: bool) {
        self.installed.store(v, Ordering::Release);
    }

    pub fn is_catchall(&self) -> bool {
        self.mmatch.is_catchall()
    }

    pub fn matches(&self, flow: &Flow) -> bool {
        self.mmatch.matches(flow)
    }

    /// True if every bit `criteria` pins, this rule pins identically.
    pub fn is_loose_match(&self, criteria: &MiniMatch) -> bool {
        self.mmatch.is_loose_match(criteria)
    }
}

impl Clone for Rule {
    fn clone(&self) -> Self {
        // A clone starts life uninstalled regardless of the original.
        Self {
            mmatch: self.mmatch,
            priority: self.priority,
            installed: AtomicBool::new(false),
        }
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.mmatch == other.mmatch && self.priority == other.priority
    }
}

impl Eq for Rule {}

impl Hash for Rule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mmatch.hash(state);
        self.priority.hash(state);
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("match", &format!("{}", self.mmatch))
            .field("priority", &self.priority)
            .field("installed", &self.is_installed())
            .finish()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "priority={} {}", self.priority, self.mmatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldId;
    use crate::flow::FlowMask;

    #[test]
    fn catchall_rule() {
        let r = Rule::new(MiniMatch::catchall(), 5).unwrap();
        assert!(r.is_catchall());
        assert!(!r.is_installed());
        assert_eq!(format!("{}", r), "priority=5 *");
    }

    #[test]
    fn unregistered_mask_bits_are_rejected() {
        let mut mask = FlowMask::new();
        mask.set_field(FieldId::TpDst);
        assert!(Rule::new(MiniMatch::new(Flow::new(), mask), 1).is_ok());

        // A mask pinning padding cannot be expressed through the field
        // API, so corrupt one directly.
        let mut bad = FlowMask::new();
        bad.set_byte_for_test(12, 0xff);
        match Rule::new(MiniMatch::new(Flow::new(), bad), 1) {
            Err(Error::InvalidMatch(12)) => {}
            other => panic!("expected InvalidMatch, got {:?}", other),
        }
    }
}
