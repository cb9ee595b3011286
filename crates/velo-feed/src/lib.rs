//! velo-feed
//!
//! Upstream station feed boundary: the [`FeedProvider`] abstraction, the
//! Nextbike HTTP provider, and normalization of the raw payload into a
//! [`velo_schemas::Snapshot`].
//!
//! This crate does **not** touch the snapshot log; the poller in
//! `velo-runtime` fetches, normalizes and appends.

pub mod nextbike;
pub mod normalizer;
pub mod provider;

pub use nextbike::NextbikeFeedProvider;
pub use normalizer::{
    normalize, occupancy_fingerprint, FeedQualityReport, NormalizeError, NormalizeOptions,
};
pub use provider::{FeedError, FeedProvider, RawBike, RawCity, RawCountry, RawFeed, RawPlace};
