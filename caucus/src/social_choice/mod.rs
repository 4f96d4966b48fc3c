//! Social choice — turning individual rankings into a group order.

pub mod schulze;
pub mod tie_break;

pub use schulze::{aggregate, AggregationError, SocialRanking};
pub use tie_break::tie_break_seed;
