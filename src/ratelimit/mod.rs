//! Rate limiting algorithms and their per-key state.

mod backend;
mod fixed_window;
mod leaky_bucket;
mod state;
mod token_bucket;

pub use backend::{Decision, RateLimiterBackend};
pub use fixed_window::{FixedWindowParams, LocalFixedWindow, SharedFixedWindow};
pub use leaky_bucket::{LeakyBucketParams, LocalLeakyBucket, SharedLeakyBucket};
pub use state::{BucketState, FixedWindowState, LeakyBucketState, TokenBucketState};
pub use token_bucket::{LocalTokenBucket, SharedTokenBucket, TokenBucketParams};
