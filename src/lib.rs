//! Storefront Sync - real-time collection synchronization for a storefront/blog
//!
//! Keeps normalized, snapshot-replaced copies of remote document collections:
//! - `remote`: the remote collection contract, listener hub and in-memory backend
//! - `storage`: sled-backed persistent backend
//! - `sync`: normalizer, subscription registry, store, mutation gateway, status
//! - `collections`: catalog and blog specs, typed records and views
//! - `auth`, `upload`, `config`: service-side collaborators

pub mod auth;
pub mod collections;
pub mod config;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod upload;
