//! Buffer handles and the reference-counting discipline behind them.

pub(crate) mod ref_count;

mod pooled;
mod view;

pub use pooled::PooledBuf;
