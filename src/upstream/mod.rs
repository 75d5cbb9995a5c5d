//! Upstream cluster credentials for the reverse proxy.

pub mod cache;
pub mod minter;

pub use cache::{
    CacheStatsSnapshot, CachedUpstreamCredential, UpstreamCredential, UpstreamCredentialCache,
};
pub use minter::{ClusterCredentialBroker, ClusterTokenMinter, KubernetesTokenMinter, MintError};
