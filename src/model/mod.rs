//! Items, filters, rules and collections.

mod filter;
mod item;
mod parse;
mod rule;

pub use filter::{Filter, Predicate, Selector, FILTER_TAGS};
pub use item::{Item, ItemId, ItemKind, ItemState, ReviewState};
pub use parse::{parse_duration, AgeThreshold, Comparison, Threshold};
pub use rule::{Collection, DisplayPolicy, Rule};
