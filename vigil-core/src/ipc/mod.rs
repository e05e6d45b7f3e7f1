//! Types published to consumers of the engine.
//!
//! Everything here derives `serde::Serialize` + `serde::Deserialize` so a host
//! can forward events or query results without reshaping them.

pub mod events;
