//! Desktop notifications for new Adobe Digest security bulletins.
//!
//! The [`controller::NotificationController`] keeps an opt-in flag and a
//! last-check checkpoint in a local SQLite store, polls the JSON feed at most
//! once per check interval, and raises a desktop notification when the newest
//! entry is more recent than the last poll.

pub mod config;
pub mod controller;
pub mod feed;
pub mod notify;
pub mod storage;
pub mod util;
