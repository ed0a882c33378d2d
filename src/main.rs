use clap::Parser;
use color_eyre::eyre::{self, eyre, WrapErr};
use snoopsim::interconn::{Channels, Payload};
use snoopsim::mem_event::{Command, MemEvent};
use snoopsim::sim::{Component, Ctx, Memory, PortId, Simulator, SnoopBus};
use snoopsim::{Cache, Config};
use std::path::{Path, PathBuf};

/// Replay a memory trace against a single cache backed by a flat memory.
///
/// Trace format, one request per line (`#` starts a comment):
///   R <addr> <size>
///   W <addr> <size> <byte>
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Options {
    /// Trace file to replay
    trace: PathBuf,

    #[arg(long, default_value_t = 2)]
    ways: usize,
    #[arg(long, default_value_t = 16)]
    rows: usize,
    #[arg(long, default_value_t = 64)]
    blocksize: usize,
    #[arg(long, default_value = "10 ns")]
    access_time: String,

    /// Put a snoop bus between the cache and a passive peer cache
    #[arg(long)]
    with_peer: bool,

    /// Write the final counters as JSON
    #[arg(long, value_name = "FILE")]
    stats_out: Option<PathBuf>,
}

/// Feeds the trace one request at a time: the next request goes out when the
/// previous response comes back.
struct TraceCpu {
    name: String,
    pending: std::collections::VecDeque<MemEvent>,
    completed: usize,
}

impl TraceCpu {
    fn next(&mut self, ctx: &mut Ctx<'_, Payload>) {
        if let Some(request) = self.pending.pop_front() {
            ctx.send(0, Payload::Mem(request));
        }
    }
}

impl Component<Payload> for TraceCpu {
    fn handle(&mut self, payload: Payload, _port: PortId, ctx: &mut Ctx<'_, Payload>) {
        match payload {
            Payload::Mem(ev)
                if matches!(ev.cmd, Command::ReadResp | Command::WriteResp) =>
            {
                log::debug!("{}: {} complete at {}", self.name, ev, ctx.now());
                self.completed += 1;
                self.next(ctx);
            }
            _ => {}
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

fn parse_number(field: &str) -> eyre::Result<u64> {
    let parsed = if let Some(hex) = field.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        field.parse()
    };
    parsed.wrap_err_with(|| format!("bad number {field:?}"))
}

fn parse_trace(path: &Path) -> eyre::Result<Vec<MemEvent>> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read trace {}", path.display()))?;
    let mut requests = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let lineno = lineno + 1;
        let op = fields.next().unwrap();
        let addr = parse_number(fields.next().ok_or_else(|| eyre!("line {lineno}: missing address"))?)?;
        let size = parse_number(fields.next().ok_or_else(|| eyre!("line {lineno}: missing size"))?)? as u32;
        let request = match op {
            "R" => {
                let mut ev = MemEvent::new("cpu0", addr, Command::ReadReq);
                ev.size = size;
                ev
            }
            "W" => {
                let byte = parse_number(
                    fields
                        .next()
                        .ok_or_else(|| eyre!("line {lineno}: missing write byte"))?,
                )? as u8;
                let mut ev = MemEvent::new("cpu0", addr, Command::WriteReq);
                ev.set_payload(vec![byte; size as usize]);
                ev
            }
            other => return Err(eyre!("line {lineno}: unknown op {other:?}")),
        };
        requests.push(request);
    }
    Ok(requests)
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let options = Options::parse();
    let config = Config {
        num_ways: options.ways,
        num_rows: options.rows,
        blocksize: options.blocksize,
        num_upstream: 1,
        next_level_name: snoopsim::config::NO_NEXT_LEVEL.to_string(),
        access_time: options.access_time.clone(),
        prefetch_peer_misses: true,
    };
    let access = config.access_latency()?;
    let requests = parse_trace(&options.trace)?;
    let num_requests = requests.len();

    let mut sim = Simulator::new();
    let channels = Channels {
        upstream: vec![1],
        downstream: Some(2),
        snoop: options.with_peer.then_some(3),
        directory: None,
        self_port: 0,
    };
    let cache = sim.add("l1", Box::new(Cache::new("l1", config.clone(), channels)?));
    let cpu = sim.add(
        "cpu0",
        Box::new(TraceCpu {
            name: "cpu0".to_string(),
            pending: requests.into_iter().collect(),
            completed: 0,
        }),
    );
    let mem = sim.add(
        "mem",
        Box::new(Memory::new("mem", options.blocksize, 100_000)),
    );
    sim.connect_self(cache, 0, access);
    sim.connect((cpu, 0), (cache, 1), 50);
    sim.connect((cache, 2), (mem, 0), 1_000);

    // a passive sibling on a shared snoop bus: no cpu of its own, it only
    // snoops the broadcasts
    let peer = if options.with_peer {
        let peer_config = Config {
            num_upstream: 0,
            ..config
        };
        let peer_channels = Channels {
            upstream: vec![],
            downstream: None,
            snoop: Some(1),
            directory: None,
            self_port: 0,
        };
        let bus = sim.add("bus", Box::new(SnoopBus::new("bus", 2)));
        let peer = sim.add("l1b", Box::new(Cache::new("l1b", peer_config, peer_channels)?));
        sim.connect_self(peer, 0, access);
        sim.connect((cache, 3), (bus, 0), 50);
        sim.connect((peer, 1), (bus, 1), 50);
        Some(peer)
    } else {
        None
    };

    // prime the pump; each response triggers the next request
    let first = {
        let cpu_ref: &mut TraceCpu = sim.get_mut(cpu);
        cpu_ref.pending.pop_front()
    };
    if let Some(first) = first {
        sim.inject(cpu, 0, 0, Payload::Mem(first));
    }
    let delivered = sim.run();

    let completed = sim.get::<TraceCpu>(cpu).completed;
    if completed != num_requests {
        return Err(eyre!(
            "trace stalled: {completed}/{num_requests} requests completed"
        ));
    }
    let cache_ref: &Cache = sim.get(cache);
    println!(
        "{} requests in {} ps ({delivered} events)",
        num_requests,
        sim.time()
    );
    println!("{}", cache_ref.report());
    if let Some(peer) = peer {
        println!("{}", sim.get::<Cache>(peer).report());
    }

    if let Some(path) = options.stats_out {
        let writer = std::fs::File::create(&path)
            .wrap_err_with(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(writer, cache_ref.stats())?;
    }
    Ok(())
}
