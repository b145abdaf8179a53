//! Inbound message sources.

mod stdin;

use std::pin::Pin;

use futures::Stream;

use crate::decision::types::Message;

pub use stdin::{StdinEvents, parse_event};

/// Stream of inbound messages. Ends when the source is exhausted.
pub type MessageStream = Pin<Box<dyn Stream<Item = Message> + Send>>;
