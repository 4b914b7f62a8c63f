//! Logpush Estimator
//!
//! Records the size of every payload accepted by the ingestion endpoint and
//! answers analytical queries over that history: totals, averages, hourly
//! trends and size-distribution histograms.
//!
//! ## Architecture
//!
//! ```text
//!  POST /ingest                                   GET /api/...
//! ┌──────────────┐   insert   ┌──────────────┐   all / range   ┌──────────────┐
//! │ Ingest       │───────────▶│ TimeSeries   │◀────────────────│ Query API    │
//! │ Router       │            │ Store        │                 │ Router       │
//! └──────────────┘            └──────────────┘                 └──────────────┘
//!                                    │                                │
//!                                    ▼                                ▼
//!                             ┌──────────────┐                 ┌──────────────┐
//!                             │ SQLite       │                 │ Analytics    │
//!                             │ (WAL)        │                 │ (pure fns)   │
//!                             └──────────────┘                 └──────────────┘
//! ```
//!
//! The store owns persistence and write serialization; the analytics functions
//! only read the observation slices handed to them.

pub mod analytics;
pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod ingest;
pub mod observation_store;

pub use analytics::{
    bucket_by_hour, size_distribution, sort_hour_buckets, summarize, HourBucket, SizeRange,
    SizeRangeBucket, SummaryStats, SIZE_RANGES,
};
pub use api::{ApiResponse, AppState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Result, StoreError};
pub use ingest::IngestState;
pub use observation_store::{Observation, StoreBuilder, TimeSeriesStore};
