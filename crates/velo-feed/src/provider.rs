//! Provider boundary for the station occupancy feed.
//!
//! Defines the raw payload shape and the provider trait only. No
//! normalization and no log writes belong here.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Raw payload
// ---------------------------------------------------------------------------

/// Top-level feed document: `countries -> cities -> places`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawFeed {
    #[serde(default)]
    pub countries: Vec<RawCountry>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawCountry {
    #[serde(default)]
    pub cities: Vec<RawCity>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawCity {
    #[serde(default)]
    pub places: Vec<RawPlace>,
}

/// A place as reported upstream. `spot = true` is a docking station;
/// `spot = false` is a single free-floating bike location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPlace {
    pub uid: i64,
    pub lat: f64,
    pub lng: f64,
    pub name: String,
    pub spot: bool,
    #[serde(default)]
    pub bike_list: Vec<RawBike>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBike {
    pub number: String,
}

impl RawFeed {
    pub fn places(&self) -> impl Iterator<Item = &RawPlace> {
        self.countries
            .iter()
            .flat_map(|c| c.cities.iter())
            .flat_map(|c| c.places.iter())
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors a [`FeedProvider`] may return. Every variant is a skipped tick,
/// never a fatal error.
#[derive(Debug)]
pub enum FeedError {
    /// Network or transport failure (includes request timeouts).
    Transport(String),
    /// The endpoint answered with a non-success status.
    Http { status: u16 },
    /// The payload could not be decoded.
    Decode(String),
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedError::Transport(msg) => write!(f, "transport error: {msg}"),
            FeedError::Http { status } => write!(f, "feed http error status={status}"),
            FeedError::Decode(msg) => write!(f, "decode error: {msg}"),
        }
    }
}

impl std::error::Error for FeedError {}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Upstream station feed contract.
///
/// Object safe so the poller can hold an `Arc<dyn FeedProvider>`.
#[async_trait::async_trait]
pub trait FeedProvider: Send + Sync {
    /// Short name for logs (e.g. `"nextbike"`).
    fn source_name(&self) -> &'static str;

    /// Fetch the current live state of every place.
    async fn fetch(&self) -> Result<RawFeed, FeedError>;
}
