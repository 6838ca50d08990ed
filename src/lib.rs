//! ticketd: multi-tenant support-ticket backend for Discord guilds.
//!
//! Identity travels as an ambient, task-scoped [`actor::Actor`]; units of work
//! run inside ambient transactions from [`transaction`]; effective permissions
//! come from [`roles`], and ticket state transitions are coordinated by
//! [`lifecycle`].

pub mod actor;
pub mod audit;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod permissions;
pub mod roles;
pub mod scheduler;
pub mod tickets;
pub mod transaction;
