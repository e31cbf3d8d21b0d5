//! Scoped informer caches for the garden and seed clusters
//!
//! A [`CacheTopology`] decides, per kind, whether reads are served from a
//! cluster-wide or namespace-scoped informer, from a watch on the single
//! object being read, or directly from the API server. [`ScopedClient`]
//! applies that decision on every read; writes always go to the API server.

#![deny(missing_docs)]

mod client;
mod informer;
mod kind;
mod sync;
pub mod topology;

pub use client::{ScopedClient, DEFAULT_SYNC_TIMEOUT};
pub use kind::{CachedKind, ScopeApi};
pub use sync::SyncStatus;
pub use topology::{
    garden_topology, CacheStrategy, CacheTopology, CacheTopologyBuilder, FallbackRoute,
    ReadRoute, Selector, UnscopedKinds,
};
