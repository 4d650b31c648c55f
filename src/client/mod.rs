//! Echo client.
//!
//! - `flow`: byte accounting, backlog gating and rate reporting for one session
//! - `pump`: single-session driver over a mio poll loop
//! - `tasks`: multi-session driver on a tokio current-thread runtime

pub mod flow;
pub mod pump;
pub mod tasks;
