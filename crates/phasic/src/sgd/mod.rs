//! Two-phase minibatch SGD.
//!
//! Provides:
//! - `minibatches` - shuffled fixed-size minibatches over one policy's batch
//! - `make_minibatches` - auxiliary minibatches mixing rows across retained segments
//! - `averaged` / `standardized` - statistic and field normalization helpers
//! - `PhasicOptimizer` - main phase followed by the auxiliary phase, per policy

mod config;
mod minibatch;
mod optimizer;
mod segments;
mod stats;

pub use config::SgdConfig;
pub use minibatch::{minibatches, smallest_minibatch, Minibatches};
pub use optimizer::{Fetches, PhasicOptimizer, AUX_STATS_KEY};
pub use segments::{make_minibatches, Segment, SegmentMinibatches, SegmentPool};
pub use stats::{averaged, standardized, StatLists, StatValue, Stats, STD_FLOOR};
