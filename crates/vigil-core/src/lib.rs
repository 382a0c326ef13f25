//! Vigil Core - Rule compilation, category indexing, and filtering
//! decisions.
//!
//! This crate is the CPU-bound half of the Vigil filtering engine: it
//! compiles ad-block-syntax rule lists and plain-text trigger lists into
//! immutable match units, stores them in per-category collections that can
//! be hot-swapped and toggled while matcher threads are querying, and
//! answers block/allow and element-hiding queries.
//!
//! Certificate authority management and the engine controller live in the
//! companion `vigil-proxy` crate.

mod category;
mod decision;
mod error;
mod index;
mod rules;

pub use category::{Category, CategoryId, EngineOption, UNFILTERED_CATEGORY};
pub use decision::{BlockReport, DecisionEngine, ElementReport, RequestVerdict, TriggerMatch};
pub use error::{ParseError, Result};
pub use index::{LoadOutcome, RuleIndex, RuleSet};
pub use rules::{
    compile_rule, compile_text_trigger, is_third_party, CompiledLine, FilterRule, HidingRule,
    PartyScope, RequestUrl, ResourceKind, ResourceMask, RuleOptions, RulePattern, TextTrigger,
};
