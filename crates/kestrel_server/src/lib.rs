//! KestrelDB execution layer: per-thread cooperative schedulers,
//! sessions with prioritised command queues, and the per-URL session
//! pool.

pub mod scheduler;
pub mod session;
pub mod session_pool;

#[cfg(test)]
mod tests;

pub use scheduler::{CooperativeListener, Scheduler, SchedulerLoad};
pub use session::{CommandStep, Session, SessionCommand, SessionStatus, SessionTask, StepContext};
pub use session_pool::{
    ClientSession, LocalSessionFactory, SessionFactory, SessionKind, SessionPool,
};
