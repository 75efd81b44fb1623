//! Findings-tracker publication.
//!
//! Every run correlates its scan artifacts under one engagement named
//! `CI/CD Build <number>`. The [`ScanResultPublisher`] creates that
//! engagement at most once and uploads artifacts against it one at a time
//! through a [`TrackerClient`].

mod client;
mod model;
mod publisher;
mod retry;

#[cfg(test)]
pub use client::MockTrackerClient;
pub use client::{HttpTrackerClient, TrackerClient};
pub use model::{
    EngagementRef, EngagementRequest, ImportScanRequest, ImportScanResponse, PublishResult,
    ENGAGEMENT_STATUS, ENGAGEMENT_TYPE,
};
pub use publisher::{ScanResultPublisher, DEFAULT_TOKEN_SECRET};
pub use retry::{JitterStrategy, RetryPolicy};
