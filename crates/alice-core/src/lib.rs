//! Request handling core of the Alice bot.
//!
//! Ties storage and generation together: the [`ChatPipeline`] turns one
//! inbound message into one credit-metered reply, the [`RateLimiter`] gates
//! how often a user may send, and the [`CronScheduler`] drives the daily
//! [`ReplenishJob`].

pub mod error;
pub mod pipeline;
pub mod rate_limiter;
pub mod replenish;
pub mod scheduler;

pub use error::{ChatError, SchedulerError};
pub use pipeline::{ChatPipeline, ChatReply, InboundMessage, PipelineConfig};
pub use rate_limiter::RateLimiter;
pub use replenish::{REPLENISH_JOB_ID, ReplenishJob, spawn_replenish_worker, start_daily_replenish};
pub use scheduler::{CronEvent, CronScheduler, ScheduledJob, parse_schedule};
