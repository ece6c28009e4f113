//! Execution context handed to every state-changing call

use nmx_core::{Ledger, Timestamp};

use crate::events::Event;

/// Current time, the value ledger and the event log of one operation
pub struct Context<'a> {
    pub now: Timestamp,
    pub ledger: &'a mut dyn Ledger,
    pub events: &'a mut Vec<Event>,
}

impl<'a> Context<'a> {
    pub fn new(now: Timestamp, ledger: &'a mut dyn Ledger, events: &'a mut Vec<Event>) -> Self {
        Self { now, ledger, events }
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }
}
