//! Slots — bounded column allocation for keyed status lines.
//!
//! A keyed descriptor gets `budget` column groups. Keys are given the next
//! free group in the order they are first logged. When a key arrives and
//! every group is taken the pass is abandoned with an [`AllocationOverflow`];
//! the driver doubles the budget in a fresh [`SlotPlan`] epoch and parses the
//! file again from the start.

use std::collections::{HashMap, HashSet};
use serde::Serialize;

use crate::conf::{DescriptorId, DescriptorSet};

/// Budget above which a keyed descriptor is disabled instead of retried.
pub const DEFAULT_BUDGET_CEILING: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationOverflow {
    pub descriptor: DescriptorId,
    /// The key that did not fit
    pub key: String,
    pub budget: usize,
}

/// key → slot for one keyed descriptor within one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySlotTable {
    pub epoch: u32,
    pub budget: usize,
    /// Keys by slot index
    keys: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl KeySlotTable {
    pub fn new(budget: usize, epoch: u32) -> Self {
        Self {
            epoch,
            budget,
            keys: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Slot of `key`, assigning the next free one on first sight.
    pub fn slot_for(&mut self, key: &str) -> Result<usize, usize> {
        if let Some(slot) = self.index.get(key) {
            return Ok(*slot);
        }
        if self.keys.len() >= self.budget {
            return Err(self.budget);
        }
        let slot = self.keys.len();
        self.keys.push(key.to_string());
        self.index.insert(key.to_string(), slot);
        Ok(slot)
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Retry { budget: usize },
    Disabled { budget: usize },
}

/// Budgets for every keyed descriptor for one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPlan {
    pub epoch: u32,
    budgets: HashMap<DescriptorId, usize>,
    disabled: HashSet<DescriptorId>,
}

impl SlotPlan {
    pub fn initial(set: &DescriptorSet) -> Self {
        let budgets = set
            .iter()
            .filter_map(|d| d.keyed().map(|k| (d.id, k.initial_budget)))
            .collect();
        Self {
            epoch: 0,
            budgets,
            disabled: HashSet::new(),
        }
    }

    pub fn budget(&self, id: DescriptorId) -> Option<usize> {
        self.budgets.get(&id).copied()
    }

    pub fn is_disabled(&self, id: DescriptorId) -> bool {
        self.disabled.contains(&id)
    }

    /// Fresh, empty tables for a new pass.
    pub fn tables(&self) -> HashMap<DescriptorId, KeySlotTable> {
        self.budgets
            .iter()
            .filter(|(id, _)| !self.disabled.contains(id))
            .map(|(id, budget)| (*id, KeySlotTable::new(*budget, self.epoch)))
            .collect()
    }

    /// Double the overflowing descriptor's budget, or disable it when the
    /// doubled budget would exceed `ceiling`. Either way a new epoch starts.
    pub fn escalate(&mut self, overflow: &AllocationOverflow, ceiling: usize) -> Escalation {
        self.epoch += 1;
        let doubled = overflow.budget.saturating_mul(2);
        if doubled > ceiling {
            self.disabled.insert(overflow.descriptor);
            return Escalation::Disabled { budget: overflow.budget };
        }
        self.budgets.insert(overflow.descriptor, doubled);
        Escalation::Retry { budget: doubled }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed_set(budget: usize) -> DescriptorSet {
        DescriptorSet::from_json_str(&format!(
            r#"{{"userStatusLines": {{"Receiver": {{"keyRegex": "^Receiver (?P<key>\\S+):", "maxKeysToAllocateColumnsFor": {}}}}}}}"#,
            budget
        ))
        .unwrap()
    }

    // ── KeySlotTable ─────────────────────────────────────────────

    #[test]
    fn test_first_seen_order() {
        let mut t = KeySlotTable::new(3, 0);
        assert_eq!(t.slot_for("zeta"), Ok(0));
        assert_eq!(t.slot_for("alpha"), Ok(1));
        assert_eq!(t.slot_for("zeta"), Ok(0));
        assert_eq!(t.keys(), &["zeta".to_string(), "alpha".to_string()]);
    }

    #[test]
    fn test_overflow_reports_budget() {
        let mut t = KeySlotTable::new(2, 0);
        t.slot_for("a").unwrap();
        t.slot_for("b").unwrap();
        assert_eq!(t.slot_for("c"), Err(2));
        // Known keys still resolve when full
        assert_eq!(t.slot_for("b"), Ok(1));
        assert_eq!(t.len(), 2);
    }

    // ── SlotPlan ─────────────────────────────────────────────────

    #[test]
    fn test_plan_uses_configured_budget() {
        let set = keyed_set(2);
        let plan = SlotPlan::initial(&set);
        assert_eq!(plan.budget(DescriptorId(1)), Some(2));
        assert_eq!(plan.budget(DescriptorId(0)), None);
        assert_eq!(plan.tables()[&DescriptorId(1)].budget, 2);
    }

    #[test]
    fn test_escalate_doubles_and_bumps_epoch() {
        let set = keyed_set(2);
        let mut plan = SlotPlan::initial(&set);
        let overflow = AllocationOverflow { descriptor: DescriptorId(1), key: "c".into(), budget: 2 };
        assert_eq!(plan.escalate(&overflow, 1024), Escalation::Retry { budget: 4 });
        assert_eq!(plan.epoch, 1);
        assert_eq!(plan.budget(DescriptorId(1)), Some(4));
        assert_eq!(plan.tables()[&DescriptorId(1)].epoch, 1);
    }

    #[test]
    fn test_escalate_past_ceiling_disables() {
        let set = keyed_set(4);
        let mut plan = SlotPlan::initial(&set);
        let overflow = AllocationOverflow { descriptor: DescriptorId(1), key: "e".into(), budget: 4 };
        assert_eq!(plan.escalate(&overflow, 6), Escalation::Disabled { budget: 4 });
        assert!(plan.is_disabled(DescriptorId(1)));
        assert!(plan.tables().is_empty());
    }
}
