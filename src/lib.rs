//! Reply proxy. Decides whether and what to answer on a person's
//! behalf, then dispatches the reply after an urgency-dependent delay.

pub mod channels;
pub mod config;
pub mod decision;
pub mod dispatch;
pub mod error;
pub mod llm;
pub mod scheduler;
pub mod store;
