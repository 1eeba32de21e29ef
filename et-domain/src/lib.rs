pub mod model;
pub mod scoring;

pub use model::*;
pub use scoring::{rank_candidates, score_order_book, score_routes, FeeSchedule, ScoringOptions};
