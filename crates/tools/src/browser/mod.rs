//! Browser acquisition and control over the DevTools protocol.
//!
//! - `strategy`: ordered acquisition tiers (attach, cloned profile, profile-less, bundled)
//! - `manager`: owns the one live session, recycles it on TTL/health/memory triggers
//! - `page`: page actions behind `BrowserPage`, implemented over CDP by `CdpPage`

pub mod cdp;
pub mod discovery;
pub mod manager;
pub mod page;
pub mod profile;
pub mod session;
pub mod strategy;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::{BrowserSessionManager, RecycleReason, SharedBrowser};
pub use page::{wait_for_settle, BrowserPage, CdpPage, ContentQuery, ScrollTarget, SettleTiming};
pub use session::{BrowserSession, HealthReport};
pub use strategy::{standard_chain, AcquireStrategy};
