pub mod block;
pub mod event;

use crate::bus::{BusQueue, Grant};
use crate::cache::block::Status;
use crate::cache::event::{BusContinuation, SelfEvent};
use crate::config::{self, Config};
use crate::interconn::{Channels, Payload, SourceKind};
use crate::mem_event::{Command, MemEvent, F_WRITEBACK};
use crate::mshr::{LoadEntry, LoadTable, SupplyTable};
use crate::sim::{Component, Ctx, PortId};
use crate::stats::Stats;
use crate::tag_array::TagArray;
use crate::Time;
use console::style;

/// A snoop-capable set-associative cache between upstream requesters and
/// downstream storage.
///
/// All state is private and touched only from event handlers, which the
/// kernel serializes; the only shared resource is the snoop bus, guarded by
/// the arbiter's request/grant handshake.
pub struct Cache {
    name: String,
    config: Config,
    channels: Channels,
    tags: TagArray,
    loads: LoadTable,
    supplies: SupplyTable,
    snoop_queue: Option<BusQueue>,
    stats: Stats,
}

impl Cache {
    pub fn new(
        name: impl Into<String>,
        config: Config,
        channels: Channels,
    ) -> Result<Self, config::Error> {
        config.validate()?;
        let name = name.into();
        assert_eq!(
            channels.upstream.len(),
            config.num_upstream,
            "{name}: upstream port count does not match num_upstream"
        );
        let tags = TagArray::new(&config);
        let snoop_queue = channels.snoop.map(|port| BusQueue::new(name.clone(), port));
        Ok(Self {
            name,
            config,
            channels,
            tags,
            loads: LoadTable::default(),
            supplies: SupplyTable::default(),
            snoop_queue,
            stats: Stats::default(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// The shutdown report: counters plus the storage array.
    #[must_use]
    pub fn report(&self) -> String {
        format!(
            "Cache {} stats:\n{}\n{}\n{}",
            self.name,
            self.stats,
            self.name,
            self.tags.dump()
        )
    }

    fn handle_mem_event(
        &mut self,
        ev: MemEvent,
        src: SourceKind,
        first_process: bool,
        ctx: &mut Ctx<'_, Payload>,
    ) {
        if src == SourceKind::SNOOP && ev.src == self.name {
            // our own broadcast, reflected back by the bus
            log::trace!("{}: dropping reflection of {ev}", self.name);
            return;
        }
        log::debug!("{}: received {} on {src}", self.name, style(&ev).cyan());
        match ev.cmd {
            Command::BusClearToSend => self.bus_granted(ctx),
            Command::ReadReq | Command::WriteReq => self.handle_cpu_request(ev, first_process, ctx),
            Command::RequestData => self.handle_data_request(ev, src, first_process, ctx),
            Command::SupplyData => self.handle_data_supply(ev, src, ctx),
            Command::Invalidate => self.handle_peer_invalidate(ev, ctx),
            _ => {}
        }
    }

    fn handle_self_event(&mut self, action: SelfEvent, ctx: &mut Ctx<'_, Payload>) {
        match action {
            SelfEvent::SendCpuResponse { ev, block } => self.send_cpu_response(ev, block, ctx),
            SelfEvent::SupplyData { ev, block, src } => self.supply_data(ev, block, src, ctx),
            SelfEvent::ReDispatch { ev, src } => self.handle_mem_event(ev, src, false, ctx),
        }
    }

    fn bus_granted(&mut self, ctx: &mut Ctx<'_, Payload>) {
        let queue = self
            .snoop_queue
            .as_mut()
            .expect("bus grant without a snoop link");
        match queue.clear_to_send(ctx) {
            Grant::Idle => {}
            Grant::Sent(continuation) => {
                if let Some(continuation) = continuation {
                    self.finish_bus_op(continuation, ctx);
                }
                self.snoop_queue.as_mut().unwrap().rearm(ctx);
            }
        }
    }

    /// Run the continuation of a bus event that just went out.
    fn finish_bus_op(&mut self, continuation: BusContinuation, ctx: &mut Ctx<'_, Payload>) {
        match continuation {
            BusContinuation::IssueInvalidate { ev, block } => {
                self.finish_issue_invalidate(ev, block, ctx);
            }
            BusContinuation::SupplyData { block, src } => {
                let base = {
                    let block = self.tags.get_mut(block);
                    block.lock_count -= 1;
                    block.base_addr
                };
                self.supplies
                    .remove(base, src)
                    .expect("supply entry missing at grant");
            }
            BusContinuation::Writeback {
                block,
                new_status,
                decrement_lock,
            } => self.finish_writeback_block(block, new_status, decrement_lock, ctx),
        }
    }

    fn handle_cpu_request(&mut self, ev: MemEvent, first_process: bool, ctx: &mut Ctx<'_, Payload>) {
        debug_assert!(matches!(ev.cmd, Command::ReadReq | Command::WriteReq));
        let is_read = ev.cmd == Command::ReadReq;
        let now = ctx.now();
        match self.tags.find_block(ev.addr, false) {
            Some(idx) => {
                log::debug!(
                    "{}: 0x{:x} {} HIT",
                    self.name,
                    ev.addr,
                    if is_read { "READ" } else { "WRITE" }
                );
                let status = self.tags.get(idx).status;
                if is_read {
                    if first_process {
                        self.stats.num_read_hit += 1;
                    }
                    self.tags.get_mut(idx).lock_count += 1;
                    ctx.send(
                        self.channels.self_port,
                        Payload::Action(SelfEvent::SendCpuResponse { ev, block: idx }),
                    );
                } else if status == Status::EXCLUSIVE {
                    if first_process {
                        self.stats.num_write_hit += 1;
                    }
                    self.tags.get_mut(idx).lock_count += 1;
                    ctx.send(
                        self.channels.self_port,
                        Payload::Action(SelfEvent::SendCpuResponse { ev, block: idx }),
                    );
                } else {
                    // write to a merely-shared block: take ownership first
                    if first_process {
                        self.stats.num_upgrade_miss += 1;
                    }
                    self.issue_invalidate(ev, idx, ctx);
                }
                self.tags.get_mut(idx).last_touched = now;
            }
            None => {
                log::debug!(
                    "{}: 0x{:x} {} MISS",
                    self.name,
                    ev.addr,
                    if is_read { "READ" } else { "WRITE" }
                );
                if first_process {
                    if is_read {
                        self.stats.num_read_miss += 1;
                    } else {
                        self.stats.num_write_miss += 1;
                    }
                }
                self.load_block(ev, SourceKind::UPSTREAM, ctx);
            }
        }
    }

    /// Complete a CPU request after the access latency has elapsed.
    fn send_cpu_response(&mut self, ev: MemEvent, idx: usize, ctx: &mut Ctx<'_, Payload>) {
        let now = ctx.now();
        let blocksize = self.tags.blocksize();
        let block = self.tags.get_mut(idx);
        let offset = (ev.addr - block.base_addr) as usize;
        let size = ev.size as usize;
        assert!(
            offset + size <= blocksize,
            "request for 0x{:x} (offset {offset}, size {size}) spans a block boundary \
             (blocksize {blocksize}); split requests are unsupported",
            ev.addr,
        );
        let mut resp = ev.make_response(&self.name);
        match ev.cmd {
            Command::ReadReq => {
                resp.set_payload(block.data[offset..offset + size].to_vec());
            }
            Command::WriteReq => {
                block.data[offset..offset + size].copy_from_slice(&ev.payload[..size]);
                block.last_touched = now;
            }
            other => panic!("cpu response for {other}"),
        }
        block.lock_count -= 1;
        log::debug!(
            "{}: responding to {} for 0x{:x} (in response to {})",
            self.name,
            ev.src,
            ev.addr,
            ev.id
        );
        // the CPU is always upstream link 0
        let port = self
            .channels
            .upstream
            .first()
            .copied()
            .expect("no upstream link for cpu response");
        ctx.send(port, Payload::Mem(resp));
    }

    /// Ask every other holder of this block to drop it so a write can take
    /// ownership.
    fn issue_invalidate(&mut self, ev: MemEvent, idx: usize, ctx: &mut Ctx<'_, Payload>) {
        if self.snoop_queue.is_some() {
            let base = self.tags.get(idx).base_addr;
            let invalidate = MemEvent::new(&self.name, base, Command::Invalidate);
            self.tags.get_mut(idx).current_event = Some(invalidate.id);
            self.snoop_queue.as_mut().unwrap().request(
                invalidate,
                Some(BusContinuation::IssueInvalidate { ev, block: idx }),
                ctx,
            );
        } else {
            self.finish_issue_invalidate(ev, idx, ctx);
        }
    }

    fn finish_issue_invalidate(&mut self, ev: MemEvent, idx: usize, ctx: &mut Ctx<'_, Payload>) {
        let base = self.tags.get(idx).base_addr;
        if let Some(port) = self.channels.downstream {
            ctx.send(
                port,
                Payload::Mem(MemEvent::new(&self.name, base, Command::Invalidate)),
            );
        }
        if let Some(port) = self.channels.directory {
            ctx.send(
                port,
                Payload::Mem(MemEvent::new(&self.name, base, Command::Invalidate)),
            );
        }
        for (i, &port) in self.channels.upstream.iter().enumerate() {
            if ev.link == Some(i) {
                continue; // not back to the originator
            }
            ctx.send(
                port,
                Payload::Mem(MemEvent::new(&self.name, base, Command::Invalidate)),
            );
        }
        {
            let block = self.tags.get_mut(idx);
            block.status = Status::EXCLUSIVE;
            block.current_event = None;
        }
        // The only thing that issues an invalidate is a write wanting
        // ownership; it is a genuine hit now.
        self.handle_cpu_request(ev, true, ctx);
    }

    /// Begin (or join) a fill for the block containing `ev.addr`.
    fn load_block(&mut self, ev: MemEvent, src: SourceKind, ctx: &mut Ctx<'_, Payload>) {
        let base = self.tags.block_addr(ev.addr);
        if let Some(entry) = self.loads.get_mut(base) {
            // one outstanding request satisfies every waiter
            log::debug!("{}: fill of 0x{base:x} already outstanding", self.name);
            entry.deferred.push((ev, src));
            return;
        }
        let idx = self.tags.lru_victim(ev.addr);
        if self.tags.get(idx).status == Status::EXCLUSIVE {
            // dirty victim leaves through the point-to-point links; it no
            // longer exists here, so the bus is not involved
            self.finish_writeback_block(idx, Status::INVALID, false, ctx);
        }
        let tag = self.tags.tag(ev.addr);
        {
            let block = self.tags.get_mut(idx);
            block.activate(tag, base);
            block.lock_count += 1;
        }
        self.loads.insert(
            base,
            LoadEntry {
                block: idx,
                deferred: vec![(ev, src)],
            },
        );
        if self.snoop_queue.is_some() {
            let mut request = MemEvent::new(&self.name, base, Command::RequestData);
            if let Some(next_level) = self.config.next_level() {
                request.dst = Some(next_level.to_string());
            }
            self.snoop_queue.as_mut().unwrap().request(request, None, ctx);
        }
        if let Some(port) = self.channels.downstream {
            ctx.send(
                port,
                Payload::Mem(MemEvent::new(&self.name, base, Command::RequestData)),
            );
        }
    }

    /// A peer (or the directory, or downstream) wants data from us.
    fn handle_data_request(
        &mut self,
        ev: MemEvent,
        src: SourceKind,
        first_process: bool,
        ctx: &mut Ctx<'_, Payload>,
    ) {
        match self.tags.find_block(ev.addr, false) {
            Some(idx) => {
                if first_process {
                    self.stats.num_supply_hit += 1;
                }
                let base = self.tags.get(idx).base_addr;
                if let Some(entry) = self.supplies.get(base, src) {
                    if !entry.canceled {
                        log::debug!("{}: already supplying 0x{base:x} to {src}", self.name);
                        return;
                    }
                }
                self.supplies.insert(base, src);
                ctx.send(
                    self.channels.self_port,
                    Payload::Action(SelfEvent::SupplyData {
                        ev,
                        block: idx,
                        src,
                    }),
                );
                let now = ctx.now();
                let block = self.tags.get_mut(idx);
                block.lock_count += 1;
                block.last_touched = now;
            }
            None => {
                let ours = ev.dst.as_deref() == Some(self.name.as_str());
                let directed = match src {
                    SourceKind::SNOOP => ours,
                    _ => ours || ev.dst.is_none(),
                };
                // Requests relayed over the point-to-point links can warm
                // this cache even when they name another destination. An
                // unaddressed request on the snoop bus is never ours to
                // answer; whoever it names will.
                let speculative =
                    self.config.prefetch_peer_misses && src != SourceKind::SNOOP;
                if directed || speculative {
                    if first_process {
                        self.stats.num_supply_miss += 1;
                    }
                    self.load_block(ev, src, ctx);
                }
            }
        }
    }

    /// Perform a reply to a peer's data request, after the access latency.
    fn supply_data(
        &mut self,
        ev: MemEvent,
        idx: usize,
        src: SourceKind,
        ctx: &mut Ctx<'_, Payload>,
    ) {
        let base = self.tags.get(idx).base_addr;
        let canceled = self
            .supplies
            .get(base, src)
            .expect("supply not tracked")
            .canceled;
        if canceled {
            log::debug!("{}: supply of 0x{base:x} was canceled", self.name);
            self.supplies.remove(base, src);
            self.tags.get_mut(idx).lock_count -= 1;
            return;
        }
        let mut resp = MemEvent::new(&self.name, base, Command::SupplyData);
        resp.set_payload(self.tags.get(idx).data.clone());
        if src == SourceKind::SNOOP {
            self.supplies.get_mut(base, src).unwrap().bus_event = Some(resp.id);
            self.snoop_queue
                .as_mut()
                .expect("snoop supply without a snoop link")
                .request(resp, Some(BusContinuation::SupplyData { block: idx, src }), ctx);
        } else {
            let port = self
                .channels
                .port(src, ev.link)
                .expect("no link back to requester");
            ctx.send(port, Payload::Mem(resp));
            self.tags.get_mut(idx).lock_count -= 1;
            self.supplies.remove(base, src);
        }
    }

    /// A peer put data on the wire. Cancel any supply of ours it subsumes,
    /// and complete a waiting fill.
    fn handle_data_supply(&mut self, ev: MemEvent, src: SourceKind, ctx: &mut Ctx<'_, Payload>) {
        if src == SourceKind::SNOOP {
            let mut queued = None;
            if let Some(entry) = self.supplies.get_mut(ev.addr, src) {
                log::debug!("{}: marking supply of 0x{:x} canceled", self.name, ev.addr);
                entry.canceled = true;
                queued = entry.bus_event.take();
            }
            if let Some(bus_event) = queued {
                // Queued but not yet transmitted: pull it off the bus and
                // release the lock the queued supply held. The delayed
                // supply already ran, so nothing else references the entry.
                let continuation = self
                    .snoop_queue
                    .as_mut()
                    .expect("supply queued without a snoop link")
                    .cancel(bus_event)
                    .expect("canceled supply not in bus queue");
                if let Some(BusContinuation::SupplyData { block, .. }) = continuation {
                    self.tags.get_mut(block).lock_count -= 1;
                }
                self.supplies.remove(ev.addr, src);
            }
        }

        match self.loads.remove(ev.addr) {
            Some(entry) => {
                let idx = entry.block;
                self.update_block(&ev, idx, ctx.now());
                {
                    let block = self.tags.get_mut(idx);
                    block.lock_count -= 1; // the fill's reservation
                    block.status = Status::SHARED;
                }
                for (n, (deferred, deferred_src)) in entry.deferred.into_iter().enumerate() {
                    // Peers that asked over the snoop bus saw this same
                    // supply; no need to re-process them.
                    if src == SourceKind::SNOOP && deferred_src == SourceKind::SNOOP {
                        continue;
                    }
                    // index-based delay keeps arrival order on re-dispatch
                    ctx.send_delayed(
                        self.channels.self_port,
                        n as Time,
                        Payload::Action(SelfEvent::ReDispatch {
                            ev: deferred,
                            src: deferred_src,
                        }),
                    );
                }
            }
            None => {
                assert_eq!(
                    src,
                    SourceKind::SNOOP,
                    "{}: unmatched supply {ev}",
                    self.name
                );
                if ev.dst.as_deref() == Some(self.name.as_str()) {
                    panic!("{}: received an unmatched message {ev}", self.name);
                }
            }
        }
    }

    fn handle_peer_invalidate(&mut self, ev: MemEvent, ctx: &mut Ctx<'_, Payload>) {
        if ev.src == self.name {
            return; // never cancel our own
        }
        let Some(idx) = self.tags.find_block(ev.addr, false) else {
            return;
        };
        if self.tags.get(idx).current_event.is_some() {
            // Another cache won the invalidate race; our pending write
            // re-issues from the cancel path.
            self.cancel_invalidate(idx, ctx);
        }
        match self.tags.get(idx).status {
            Status::SHARED => self.tags.get_mut(idx).status = Status::INVALID,
            Status::EXCLUSIVE => self.writeback_block(idx, Status::INVALID, ctx),
            _ => {}
        }
    }

    fn cancel_invalidate(&mut self, idx: usize, ctx: &mut Ctx<'_, Payload>) {
        // only outbound invalidates park their id on the block
        let event_id = self
            .tags
            .get_mut(idx)
            .current_event
            .take()
            .expect("block not waiting on an invalidate");
        let continuation = self
            .snoop_queue
            .as_mut()
            .expect("pending invalidate without a snoop link")
            .cancel(event_id)
            .expect("pending invalidate not in bus queue");
        let Some(BusContinuation::IssueInvalidate { ev, .. }) = continuation else {
            panic!("{}: canceled event was not an invalidate", self.name);
        };
        log::debug!(
            "{}: peer invalidate won the race for 0x{:x}; retrying the write",
            self.name,
            ev.addr
        );
        self.handle_cpu_request(ev, false, ctx);
    }

    /// Push a dirty block toward downstream and the directory, leaving it in
    /// `new_status`.
    fn writeback_block(&mut self, idx: usize, new_status: Status, ctx: &mut Ctx<'_, Payload>) {
        if self.snoop_queue.is_some() {
            let block = self.tags.get_mut(idx);
            let mut ev = MemEvent::new(&self.name, block.base_addr, Command::SupplyData);
            ev.set_flag(F_WRITEBACK);
            ev.set_payload(block.data.clone());
            block.lock_count += 1;
            self.snoop_queue.as_mut().unwrap().request(
                ev,
                Some(BusContinuation::Writeback {
                    block: idx,
                    new_status,
                    decrement_lock: true,
                }),
                ctx,
            );
        } else {
            self.finish_writeback_block(idx, new_status, false, ctx);
        }
    }

    fn finish_writeback_block(
        &mut self,
        idx: usize,
        new_status: Status,
        decrement_lock: bool,
        ctx: &mut Ctx<'_, Payload>,
    ) {
        let (base, payload) = {
            let block = self.tags.get(idx);
            (block.base_addr, block.data.clone())
        };
        if decrement_lock {
            // the queued bus copy held the reference
            self.tags.get_mut(idx).lock_count -= 1;
        }
        for port in [self.channels.downstream, self.channels.directory]
            .into_iter()
            .flatten()
        {
            let mut ev = MemEvent::new(&self.name, base, Command::SupplyData);
            ev.set_flag(F_WRITEBACK);
            ev.set_payload(payload.clone());
            ctx.send(port, Payload::Mem(ev));
        }
        let block = self.tags.get_mut(idx);
        assert_eq!(
            block.lock_count, 0,
            "writeback of 0x{base:x} finished with live references"
        );
        block.status = new_status;
        log::debug!(
            "{}: wrote back 0x{base:x}, now {:?}",
            self.name,
            block.status
        );
    }

    /// Copy a supply's payload into the fill target: the whole block when
    /// sizes match, a partial overwrite otherwise.
    fn update_block(&mut self, ev: &MemEvent, idx: usize, now: Time) {
        let blocksize = self.tags.blocksize();
        let block = self.tags.get_mut(idx);
        if ev.size as usize == blocksize {
            // equal sizes imply equal base addresses
            block.data.copy_from_slice(&ev.payload);
        } else {
            let offset = (ev.addr - block.base_addr) as usize;
            block.data[offset..offset + ev.size as usize]
                .copy_from_slice(&ev.payload[..ev.size as usize]);
        }
        block.last_touched = now;
    }
}

impl Component<Payload> for Cache {
    fn handle(&mut self, payload: Payload, port: PortId, ctx: &mut Ctx<'_, Payload>) {
        match payload {
            Payload::Mem(mut ev) => {
                let Some((src, upstream_link)) = self.channels.classify(port) else {
                    panic!("{}: event on unknown port {port}", self.name);
                };
                assert_ne!(
                    src,
                    SourceKind::SELF,
                    "{}: raw memory event on the self channel",
                    self.name
                );
                ev.link = upstream_link;
                self.handle_mem_event(ev, src, true, ctx);
            }
            Payload::Action(action) => {
                assert_eq!(
                    self.channels.classify(port),
                    Some((SourceKind::SELF, None)),
                    "{}: scheduled action on an external channel",
                    self.name
                );
                self.handle_self_event(action, ctx);
            }
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
