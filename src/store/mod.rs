//! Database operations for the progress schema, grouped by table.

pub mod configs;
pub mod extraction;
pub mod inboxes;
pub mod notifications;
pub mod stats;
pub mod threads;
pub mod work_rows;
