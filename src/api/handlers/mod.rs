//! API handlers.
//!
//! `auth` holds everything that decides who the caller is; `health` reports
//! build metadata and whether the admin credential is usable.

pub mod auth;
pub mod health;
