//! Poll settlement engine: phase clock and guard, vote aggregation with
//! delegate mandates, prediction settlement and area resolution, driven by a
//! scheduler over Postgres-backed polls.
//!
//! The pure engines live in [`engine`]; the actors in [`scheduler`],
//! [`settlement`], [`calendar`] and [`notify`] wire them to the database and
//! the in-process [`bus`].

pub mod bus;
pub mod calendar;
pub mod config;
pub mod core;
pub mod directory;
pub mod engine;
pub mod notify;
pub mod persistence;
pub mod scheduler;
pub mod settlement;
