//! Category-indexed rule and trigger storage.
//!
//! One fixed slot per category id (0-255). Each slot holds an atomically
//! enabled flag plus immutable snapshots of its compiled rules and text
//! triggers behind an [`ArcSwap`]. Readers load a snapshot once and keep a
//! consistent view for the whole evaluation; loads and flushes build a new
//! snapshot off to the side and swap it in whole. Writers to the same slot
//! serialize on a per-slot mutex so concurrent appends cannot drop each
//! other's rules; writers never block readers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::category::{Category, CategoryId, UNFILTERED_CATEGORY};
use crate::rules::{
    compile_rule, compile_text_trigger, CompiledLine, FilterRule, HidingRule, TextTrigger,
};

/// Counts reported by a batch rule load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOutcome {
    /// Lines compiled and stored.
    pub loaded: u32,
    /// Malformed lines counted and dropped. Comments and blank lines are in
    /// neither count.
    pub failed: u32,
}

/// Immutable snapshot of one category's compiled rules.
#[derive(Debug, Default)]
pub struct RuleSet {
    pub exceptions: Vec<FilterRule>,
    pub blocking: Vec<FilterRule>,
    pub hiding: Vec<HidingRule>,
}

impl RuleSet {
    fn push(&mut self, line: CompiledLine) {
        match line {
            CompiledLine::Filter(rule) if rule.exception => self.exceptions.push(rule),
            CompiledLine::Filter(rule) => self.blocking.push(rule),
            CompiledLine::Hiding(rule) => self.hiding.push(rule),
            CompiledLine::Skip => {}
        }
    }

    /// Total rules in the snapshot.
    pub fn len(&self) -> usize {
        self.exceptions.len() + self.blocking.len() + self.hiding.len()
    }

    /// Whether the snapshot holds no rules.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clone_contents(&self) -> Self {
        Self {
            exceptions: self.exceptions.clone(),
            blocking: self.blocking.clone(),
            hiding: self.hiding.clone(),
        }
    }
}

struct CategorySlot {
    enabled: AtomicBool,
    rules: ArcSwap<RuleSet>,
    triggers: ArcSwap<Vec<TextTrigger>>,
    // Serializes writers; readers go through the ArcSwaps only.
    write_lock: Mutex<()>,
}

impl CategorySlot {
    fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            rules: ArcSwap::from_pointee(RuleSet::default()),
            triggers: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }
}

/// Mutable, concurrently readable store of all categories' rules and
/// triggers.
pub struct RuleIndex {
    slots: Box<[CategorySlot]>,
}

impl RuleIndex {
    /// Creates an index with all 256 category slots empty and (except the
    /// reserved id 0) disabled.
    pub fn new() -> Self {
        let slots: Vec<CategorySlot> = (0..=u8::MAX as usize).map(|_| CategorySlot::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    fn slot(&self, category: CategoryId) -> &CategorySlot {
        &self.slots[category as usize]
    }

    /// Compiles every line of `text` into `category`.
    ///
    /// Loading is best-effort per line: malformed lines increment `failed`
    /// and never abort the batch. With `flush_existing` the freshly
    /// compiled set replaces the old one; otherwise it is appended. Either
    /// way the swap happens only after the whole batch has compiled, so
    /// in-flight queries observe the old snapshot or the new one, never a
    /// mix.
    pub fn load_rules(&self, text: &str, category: CategoryId, flush_existing: bool) -> LoadOutcome {
        let mut outcome = LoadOutcome::default();
        let mut compiled = RuleSet::default();

        for line in text.lines() {
            match compile_rule(line) {
                Ok(CompiledLine::Skip) => {}
                Ok(parsed) => {
                    compiled.push(parsed);
                    outcome.loaded += 1;
                }
                Err(err) => {
                    tracing::debug!(category, line, %err, "dropping malformed rule line");
                    outcome.failed += 1;
                }
            }
        }

        let slot = self.slot(category);
        let _guard = slot.write_lock.lock();
        let next = if flush_existing {
            compiled
        } else {
            let mut merged = slot.rules.load().clone_contents();
            merged.exceptions.extend(compiled.exceptions);
            merged.blocking.extend(compiled.blocking);
            merged.hiding.extend(compiled.hiding);
            merged
        };
        slot.rules.store(Arc::new(next));

        tracing::info!(
            category,
            loaded = outcome.loaded,
            failed = outcome.failed,
            flush_existing,
            "rule list loaded"
        );
        outcome
    }

    /// Compiles every line of `text` into `category`'s trigger set and
    /// returns the number of triggers loaded. Blank lines are skipped.
    pub fn load_text_triggers(&self, text: &str, category: CategoryId, flush_existing: bool) -> u32 {
        let compiled: Vec<TextTrigger> = text.lines().filter_map(compile_text_trigger).collect();
        let loaded = compiled.len() as u32;

        let slot = self.slot(category);
        let _guard = slot.write_lock.lock();
        let next = if flush_existing {
            compiled
        } else {
            let mut merged = slot.triggers.load().as_ref().clone();
            merged.extend(compiled);
            merged
        };
        slot.triggers.store(Arc::new(next));

        tracing::info!(category, loaded, flush_existing, "text triggers loaded");
        loaded
    }

    /// Clears all rules for `category`. No-op if already empty.
    pub fn unload_category(&self, category: CategoryId) {
        let slot = self.slot(category);
        let _guard = slot.write_lock.lock();
        if !slot.rules.load().is_empty() {
            slot.rules.store(Arc::new(RuleSet::default()));
            tracing::info!(category, "rules unloaded");
        }
    }

    /// Clears all text triggers for `category`. No-op if already empty.
    pub fn unload_text_triggers(&self, category: CategoryId) {
        let slot = self.slot(category);
        let _guard = slot.write_lock.lock();
        if !slot.triggers.load().is_empty() {
            slot.triggers.store(Arc::new(Vec::new()));
            tracing::info!(category, "text triggers unloaded");
        }
    }

    /// Flips a category's enabled flag. The reserved id 0 is
    /// unrepresentable in [`Category`], so this cannot touch it.
    pub fn set_enabled(&self, category: Category, enabled: bool) {
        self.slot(category.id()).enabled.store(enabled, Ordering::Release);
    }

    /// Whether `category` participates in evaluation. The reserved id 0
    /// always reads enabled; a never-configured category reads disabled.
    pub fn is_enabled(&self, category: CategoryId) -> bool {
        category == UNFILTERED_CATEGORY || self.slot(category).enabled.load(Ordering::Acquire)
    }

    /// The current rule snapshot for `category`.
    pub fn rules(&self, category: CategoryId) -> Arc<RuleSet> {
        self.slot(category).rules.load_full()
    }

    /// The current trigger snapshot for `category`.
    pub fn triggers(&self, category: CategoryId) -> Arc<Vec<TextTrigger>> {
        self.slot(category).triggers.load_full()
    }
}

impl Default for RuleIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = "\
! comment
||ads.example.com^
@@||ads.example.com/safe.js
##.banner-ad
";

    #[test]
    fn load_counts_and_buckets() {
        let index = RuleIndex::new();
        let outcome = index.load_rules(LIST, 1, false);
        assert_eq!(outcome, LoadOutcome { loaded: 3, failed: 0 });

        let rules = index.rules(1);
        assert_eq!(rules.blocking.len(), 1);
        assert_eq!(rules.exceptions.len(), 1);
        assert_eq!(rules.hiding.len(), 1);
    }

    #[test]
    fn malformed_lines_are_counted_not_fatal() {
        let index = RuleIndex::new();
        let outcome = index.load_rules("||a.com^\n||b.com^$bogus-option\n||c.com^\n", 1, false);
        assert_eq!(outcome, LoadOutcome { loaded: 2, failed: 1 });
        assert_eq!(index.rules(1).blocking.len(), 2);
    }

    #[test]
    fn append_keeps_existing_rules() {
        let index = RuleIndex::new();
        index.load_rules("||a.com^\n", 1, false);
        index.load_rules("||b.com^\n", 1, false);
        assert_eq!(index.rules(1).blocking.len(), 2);
    }

    #[test]
    fn flush_replaces_existing_rules() {
        let index = RuleIndex::new();
        index.load_rules("||a.com^\n||b.com^\n", 1, false);
        index.load_rules("||c.com^\n", 1, true);
        let rules = index.rules(1);
        assert_eq!(rules.blocking.len(), 1);
        assert_eq!(rules.blocking[0].raw, "||c.com^");
    }

    #[test]
    fn flush_with_partial_failures_keeps_good_lines() {
        let index = RuleIndex::new();
        index.load_rules("||old.com^\n", 1, false);
        let outcome = index.load_rules("||new.com^\n$script\n", 1, true);
        assert_eq!(outcome, LoadOutcome { loaded: 1, failed: 1 });
        let rules = index.rules(1);
        assert_eq!(rules.blocking.len(), 1);
        assert_eq!(rules.blocking[0].raw, "||new.com^");
    }

    #[test]
    fn unload_clears_rules_only() {
        let index = RuleIndex::new();
        index.load_rules(LIST, 1, false);
        index.load_text_triggers("bad phrase\n", 1, false);

        index.unload_category(1);
        assert!(index.rules(1).is_empty());
        assert_eq!(index.triggers(1).len(), 1);

        index.unload_text_triggers(1);
        assert!(index.triggers(1).is_empty());
    }

    #[test]
    fn category_zero_is_always_enabled() {
        let index = RuleIndex::new();
        assert!(index.is_enabled(0));
        // No toggle path can reach id 0: Category::new(0) is None.
        assert!(Category::new(0).is_none());
        assert!(index.is_enabled(0));
    }

    #[test]
    fn categories_default_disabled_and_toggle() {
        let index = RuleIndex::new();
        assert!(!index.is_enabled(5));

        let cat = Category::new(5).unwrap();
        index.set_enabled(cat, true);
        assert!(index.is_enabled(5));
        index.set_enabled(cat, false);
        assert!(!index.is_enabled(5));
    }

    #[test]
    fn trigger_load_counts_and_flush() {
        let index = RuleIndex::new();
        assert_eq!(index.load_text_triggers("one\n\ntwo\n", 3, false), 2);
        assert_eq!(index.load_text_triggers("three\n", 3, false), 1);
        assert_eq!(index.triggers(3).len(), 3);
        assert_eq!(index.load_text_triggers("only\n", 3, true), 1);
        assert_eq!(index.triggers(3).len(), 1);
    }

    #[test]
    fn readers_keep_a_consistent_snapshot_across_flush() {
        let index = RuleIndex::new();
        index.load_rules("||a.com^\n||b.com^\n", 1, false);

        let before = index.rules(1);
        index.load_rules("||c.com^\n", 1, true);

        // The snapshot taken before the flush is unchanged.
        assert_eq!(before.blocking.len(), 2);
        assert_eq!(index.rules(1).blocking.len(), 1);
    }

    #[test]
    fn concurrent_appends_do_not_lose_rules() {
        let index = std::sync::Arc::new(RuleIndex::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let index = index.clone();
            handles.push(std::thread::spawn(move || {
                index.load_rules(&format!("||host{i}.com^\n"), 1, false);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(index.rules(1).blocking.len(), 8);
    }
}
