//! classroom-live - Realtime session broker for classroom word games
//!
//! This crate provides the live-session layer behind the classroom app:
//! - Hosting sessions under short shareable codes and joining them
//! - Relaying opaque game state between a teacher and their students
//! - Two interchangeable relays: direct `WebSocket` push, or a change feed over
//!   persisted session rows

pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod relay;
pub mod routes;
pub mod sessions;
pub mod state;
