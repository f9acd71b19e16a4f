mod attribute_value;
mod condition;
mod eval;
mod evaluator;
mod fallback;
mod flag;
pub mod hash;
mod key;
mod matcher;
mod rule_based_segment;
mod store;
mod test_common;
mod util;

pub use attribute_value::*;
pub use condition::*;
pub use eval::{label, EvaluationResult, CONTROL};
pub use evaluator::*;
pub use fallback::*;
pub use flag::*;
pub use key::*;
pub use matcher::Matcher;
pub use rule_based_segment::{ExcludedSegment, ExcludedSegmentKind, RuleBasedSegment};
pub use store::*;
