//! Recommendation Service
//!
//! Read-through over the recommendation cache. Lists are computed from the
//! graph by collaborative filtering over weighted relationships:
//!
//! ```text
//! score[c] += w(s→t) · w(u→t) · w(u→c)     for u ≠ s
//! ```
//!
//! When the graph is unavailable a stale cached list is served instead of
//! an error, labelled [`Freshness::Stale`].

mod service;

pub use service::{Freshness, Recommendations, RecommendationService};
