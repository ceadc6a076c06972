//! `durably` is an event-sourced storage and subscription engine.
//!
//! Events are appended to per-entity **streams**, streams are grouped into
//! **categories**, and all committed events compose a single totally-ordered
//! **log**. The [`store`] module contains the storage side: ordered append
//! with composable [write conditions][condition], resumable scans with
//! [query constraints][constraint], and configurable
//! [serialization guarantees][store::SerializationGuarantee].
//!
//! The [`broker`] module contains the subscription side: cluster-wide
//! distribution of subscriber-group → event-source assignments using advisory
//! locks, node liveness, and a coordinator/observer split.
//!
//! Persistent (PostgreSQL) implementations of the storage adapter, lock
//! manager, and cluster stores live in the companion `durably-postgres` crate.

#![deny(unsafe_code, trivial_casts)]
#![warn(clippy::all)]

pub mod broker;
pub mod codec;
pub mod condition;
pub mod constraint;
pub mod event;
pub mod identifier;
pub mod source;
pub mod store;
pub mod testing;
