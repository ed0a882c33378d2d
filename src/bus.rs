use crate::cache::event::BusContinuation;
use crate::interconn::Payload;
use crate::mem_event::{Command, MemEvent};
use crate::sim::{Ctx, PortId};
use std::collections::VecDeque;

/// Outcome of a bus grant.
#[derive(Debug)]
pub enum Grant {
    /// Nothing left to send (everything queued was canceled); the grant was
    /// handed back with `CancelBusRequest`.
    Idle,
    /// The head event went out on the bus; run its continuation, then call
    /// [`BusQueue::rearm`].
    Sent(Option<BusContinuation>),
}

/// Client side of the snoop-bus arbiter: serializes this cache's broadcasts
/// and supports cancellation of queued events up to the moment they are
/// transmitted.
///
/// `requested` stays set from the first `RequestBus` until the matching
/// grant arrives, so piling more events onto the queue never produces a
/// second outstanding request.
#[derive(Debug)]
pub struct BusQueue {
    name: String,
    port: PortId,
    requested: bool,
    queue: VecDeque<(MemEvent, Option<BusContinuation>)>,
}

impl BusQueue {
    #[must_use]
    pub fn new(name: impl Into<String>, port: PortId) -> Self {
        Self {
            name: name.into(),
            port,
            requested: false,
            queue: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue `event` for broadcast, asking the arbiter for the bus if we
    /// have not already.
    pub fn request(
        &mut self,
        event: MemEvent,
        continuation: Option<BusContinuation>,
        ctx: &mut Ctx<'_, Payload>,
    ) {
        log::trace!("{}: bus queue <- {event}", self.name);
        self.queue.push_back((event, continuation));
        self.request_grant(ctx);
    }

    fn request_grant(&mut self, ctx: &mut Ctx<'_, Payload>) {
        if !self.requested {
            ctx.send(
                self.port,
                Payload::Mem(MemEvent::new(&self.name, 0, Command::RequestBus)),
            );
            self.requested = true;
        }
    }

    /// Remove a queued event before it is transmitted. Returns the
    /// continuation so the caller can release whatever resources the queued
    /// operation was holding. The grant request is left outstanding; if the
    /// grant arrives for an empty queue, [`Self::clear_to_send`] hands it
    /// back.
    pub fn cancel(&mut self, event_id: u64) -> Option<Option<BusContinuation>> {
        let pos = self.queue.iter().position(|(ev, _)| ev.id == event_id)?;
        let (ev, continuation) = self.queue.remove(pos).expect("position valid");
        log::trace!("{}: bus queue canceled {ev}", self.name);
        Some(continuation)
    }

    /// The arbiter granted us the bus.
    pub fn clear_to_send(&mut self, ctx: &mut Ctx<'_, Payload>) -> Grant {
        match self.queue.pop_front() {
            None => {
                // Every queued event was canceled while the request was in
                // flight; give the grant back.
                log::debug!("{}: no requests to send", self.name);
                ctx.send(
                    self.port,
                    Payload::Mem(MemEvent::new(&self.name, 0, Command::CancelBusRequest)),
                );
                self.requested = false;
                Grant::Idle
            }
            Some((ev, continuation)) => {
                log::debug!("{}: sending {ev} on bus", self.name);
                ctx.send(self.port, Payload::Mem(ev));
                Grant::Sent(continuation)
            }
        }
    }

    /// Finish a grant after its continuation ran: drop the satisfied
    /// request and re-request if more events queued up meanwhile.
    pub fn rearm(&mut self, ctx: &mut Ctx<'_, Payload>) {
        self.requested = false;
        if !self.queue.is_empty() {
            self.request_grant(ctx);
        }
    }
}
