//! Courier: multi-tenant messaging connections and drip-campaign dispatch.
//!
//! Each tenant (staff identity) owns one persistent protocol session managed by
//! the [`connection::ConnectionManager`]. Campaigns send a sequence of steps to
//! their recipients through that session, driven by the
//! [`dispatcher::CampaignDispatcher`] with jittered delays and a daily cap.
//! All load-bearing state lives in SQLite ([`store`]), so both connections and
//! campaigns resume after a restart.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod store;

pub mod connection;
pub mod transport;

pub mod campaign;
pub mod dispatcher;
