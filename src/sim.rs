//! Minimal deterministic event kernel, plus the reference collaborators
//! (snoop-bus arbiter, flat memory) the cache component is exercised
//! against. The real kernel this component targets is external; this one
//! models only what the component's contract needs: typed messages on
//! links, per-link latency, and FIFO ordering among same-time events.

use crate::interconn::Payload;
use crate::mem_event::{Command, MemEvent};
use crate::{address, Time};
use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

pub type ComponentId = usize;
/// Component-local port number, assigned by the harness when linking.
pub type PortId = usize;

pub trait Component<P>: 'static {
    fn handle(&mut self, payload: P, port: PortId, ctx: &mut Ctx<'_, P>);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Endpoint {
    component: ComponentId,
    port: PortId,
}

#[derive(Debug, Clone, Copy)]
struct Wire {
    to: Endpoint,
    latency: Time,
}

#[derive(Debug)]
struct Scheduled<P> {
    time: Time,
    seq: u64,
    target: Endpoint,
    payload: P,
}

impl<P> PartialEq for Scheduled<P> {
    fn eq(&self, other: &Self) -> bool {
        (self.time, self.seq) == (other.time, other.seq)
    }
}

impl<P> Eq for Scheduled<P> {}

impl<P> PartialOrd for Scheduled<P> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Scheduled<P> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.time, self.seq).cmp(&(other.time, other.seq))
    }
}

/// The time wheel: current time, pending deliveries, and the link table.
#[derive(Debug)]
pub struct Scheduler<P> {
    time: Time,
    seq: u64,
    queue: BinaryHeap<Reverse<Scheduled<P>>>,
    wires: HashMap<Endpoint, Wire>,
}

impl<P> Default for Scheduler<P> {
    fn default() -> Self {
        Self {
            time: 0,
            seq: 0,
            queue: BinaryHeap::new(),
            wires: HashMap::new(),
        }
    }
}

impl<P> Scheduler<P> {
    #[must_use]
    pub fn now(&self) -> Time {
        self.time
    }

    /// Emit `payload` out of `from`'s side of its link. Delivery happens at
    /// `now + link latency + extra`; same-time deliveries keep send order.
    fn send_from(&mut self, from: Endpoint, extra: Time, payload: P) {
        let wire = *self
            .wires
            .get(&from)
            .unwrap_or_else(|| panic!("send on unconnected port {} of component {}", from.port, from.component));
        self.seq += 1;
        self.queue.push(Reverse(Scheduled {
            time: self.time + wire.latency + extra,
            seq: self.seq,
            target: wire.to,
            payload,
        }));
    }
}

/// Handed to a component while it handles one delivery.
pub struct Ctx<'a, P> {
    id: ComponentId,
    sched: &'a mut Scheduler<P>,
}

impl<P> Ctx<'_, P> {
    #[must_use]
    pub fn now(&self) -> Time {
        self.sched.now()
    }

    pub fn send(&mut self, port: PortId, payload: P) {
        self.send_delayed(port, 0, payload);
    }

    pub fn send_delayed(&mut self, port: PortId, extra: Time, payload: P) {
        let from = Endpoint {
            component: self.id,
            port,
        };
        self.sched.send_from(from, extra, payload);
    }
}

/// Single-threaded cooperative simulator: components run to completion, one
/// delivered event at a time, in simulated-time order.
pub struct Simulator<P> {
    names: Vec<String>,
    components: Vec<Option<Box<dyn Component<P>>>>,
    sched: Scheduler<P>,
}

impl<P: 'static> Default for Simulator<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: 'static> Simulator<P> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            components: Vec::new(),
            sched: Scheduler::default(),
        }
    }

    pub fn add(&mut self, name: impl Into<String>, component: Box<dyn Component<P>>) -> ComponentId {
        self.names.push(name.into());
        self.components.push(Some(component));
        self.components.len() - 1
    }

    /// Link two component ports with a fixed latency. Either side may send;
    /// delivery goes to the opposite endpoint.
    pub fn connect(
        &mut self,
        a: (ComponentId, PortId),
        b: (ComponentId, PortId),
        latency: Time,
    ) {
        let a = Endpoint {
            component: a.0,
            port: a.1,
        };
        let b = Endpoint {
            component: b.0,
            port: b.1,
        };
        assert!(
            self.sched.wires.insert(a, Wire { to: b, latency }).is_none(),
            "port already connected"
        );
        assert!(
            self.sched.wires.insert(b, Wire { to: a, latency }).is_none(),
            "port already connected"
        );
    }

    /// Loop a component's port back to itself, for delayed internal
    /// callbacks.
    pub fn connect_self(&mut self, component: ComponentId, port: PortId, latency: Time) {
        let end = Endpoint { component, port };
        assert!(
            self.sched
                .wires
                .insert(end, Wire { to: end, latency })
                .is_none(),
            "port already connected"
        );
    }

    /// Inject a payload as if `component` had sent it on `port`.
    pub fn inject(&mut self, component: ComponentId, port: PortId, extra: Time, payload: P) {
        self.sched
            .send_from(Endpoint { component, port }, extra, payload);
    }

    #[must_use]
    pub fn time(&self) -> Time {
        self.sched.now()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.sched.queue.len()
    }

    /// Deliver the next event. Returns false once the queue is drained.
    pub fn step(&mut self) -> bool {
        let Some(Reverse(next)) = self.sched.queue.pop() else {
            return false;
        };
        debug_assert!(next.time >= self.sched.time);
        self.sched.time = next.time;
        let id = next.target.component;
        let mut component = self.components[id]
            .take()
            .expect("component re-entered during its own handler");
        let mut ctx = Ctx {
            id,
            sched: &mut self.sched,
        };
        component.handle(next.payload, next.target.port, &mut ctx);
        self.components[id] = Some(component);
        true
    }

    /// Run until no events remain. Returns the number of deliveries.
    pub fn run(&mut self) -> u64 {
        let mut delivered = 0;
        while self.step() {
            delivered += 1;
        }
        delivered
    }

    #[must_use]
    pub fn name(&self, id: ComponentId) -> &str {
        &self.names[id]
    }

    /// Borrow a component back out of the simulator, by concrete type.
    #[must_use]
    pub fn get<T: 'static>(&self, id: ComponentId) -> &T {
        self.components[id]
            .as_ref()
            .expect("component busy")
            .as_any()
            .downcast_ref()
            .expect("component type mismatch")
    }

    pub fn get_mut<T: 'static>(&mut self, id: ComponentId) -> &mut T {
        self.components[id]
            .as_mut()
            .expect("component busy")
            .as_any_mut()
            .downcast_mut()
            .expect("component type mismatch")
    }
}

/// Broadcast snoop bus with request/grant arbitration.
///
/// `RequestBus` enqueues the sender; grants (`BusClearToSend`) go out one at
/// a time in request order. Anything else the granted component transmits is
/// broadcast to every attached port, the sender's included (components drop
/// their own reflections).
pub struct SnoopBus {
    name: String,
    ports: Vec<PortId>,
    granted: Option<PortId>,
    waiting: VecDeque<PortId>,
}

impl SnoopBus {
    #[must_use]
    pub fn new(name: impl Into<String>, num_ports: usize) -> Self {
        Self {
            name: name.into(),
            ports: (0..num_ports).collect(),
            granted: None,
            waiting: VecDeque::new(),
        }
    }

    fn grant_next(&mut self, ctx: &mut Ctx<'_, Payload>) {
        if self.granted.is_some() {
            return;
        }
        if let Some(port) = self.waiting.pop_front() {
            self.granted = Some(port);
            ctx.send(
                port,
                Payload::Mem(MemEvent::new(&self.name, 0, Command::BusClearToSend)),
            );
        }
    }
}

impl Component<Payload> for SnoopBus {
    fn handle(&mut self, payload: Payload, port: PortId, ctx: &mut Ctx<'_, Payload>) {
        let Payload::Mem(ev) = payload else {
            panic!("{}: non-memory payload on bus", self.name);
        };
        match ev.cmd {
            Command::RequestBus => {
                if !self.waiting.contains(&port) {
                    self.waiting.push_back(port);
                }
                self.grant_next(ctx);
            }
            Command::CancelBusRequest => {
                log::debug!("{}: request canceled by port {port}", self.name);
                if self.granted == Some(port) {
                    self.granted = None;
                    self.grant_next(ctx);
                }
            }
            _ => {
                log::trace!("{}: broadcasting {ev}", self.name);
                for &p in &self.ports {
                    ctx.send(p, Payload::Mem(ev.clone()));
                }
                if self.granted == Some(port) {
                    self.granted = None;
                    self.grant_next(ctx);
                }
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Flat downstream storage with a fixed supply latency.
///
/// Answers `RequestData` with a full block of `SupplyData`, absorbs
/// writebacks, and ignores coherence traffic (it has no peers to invalidate).
pub struct Memory {
    name: String,
    blocksize: usize,
    latency: Time,
    data: HashMap<address, Vec<u8>>,
}

impl Memory {
    #[must_use]
    pub fn new(name: impl Into<String>, blocksize: usize, latency: Time) -> Self {
        Self {
            name: name.into(),
            blocksize,
            latency,
            data: HashMap::new(),
        }
    }

    fn base(&self, addr: address) -> address {
        addr & !(self.blocksize as u64 - 1)
    }

    pub fn preload(&mut self, addr: address, bytes: Vec<u8>) {
        assert_eq!(bytes.len(), self.blocksize);
        let base = self.base(addr);
        self.data.insert(base, bytes);
    }

    #[must_use]
    pub fn block(&self, addr: address) -> Option<&[u8]> {
        self.data.get(&self.base(addr)).map(Vec::as_slice)
    }
}

impl Component<Payload> for Memory {
    fn handle(&mut self, payload: Payload, port: PortId, ctx: &mut Ctx<'_, Payload>) {
        let Payload::Mem(ev) = payload else {
            panic!("{}: non-memory payload", self.name);
        };
        match ev.cmd {
            Command::RequestData => {
                let base = self.base(ev.addr);
                let blocksize = self.blocksize;
                let block = self
                    .data
                    .entry(base)
                    .or_insert_with(|| vec![0; blocksize]);
                let mut resp = MemEvent::new(&self.name, base, Command::SupplyData);
                resp.dst = Some(ev.src.clone());
                resp.response_to = Some(ev.id);
                resp.set_payload(block.clone());
                log::debug!("{}: supplying 0x{base:x} to {}", self.name, ev.src);
                ctx.send_delayed(port, self.latency, Payload::Mem(resp));
            }
            Command::SupplyData if ev.is_writeback() => {
                let base = self.base(ev.addr);
                log::debug!("{}: writeback of 0x{base:x}", self.name);
                self.data.insert(base, ev.payload);
            }
            _ => {}
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
