//! Poll backing for the Jeju Vintage Holiday page: optimistic local voting
//! with per-device duplicate prevention, synced to a shared tally document
//! when a store is configured and fully functional offline when it is not.

pub mod config;
pub mod models;
pub mod store;
pub mod voter;
pub mod widget;
