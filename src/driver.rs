use std::io::{self, Error, ErrorKind};
use std::process;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::connection::Connection;
use crate::coordinator::Coordinator;
use crate::options::Options;
use crate::stats::ConnectionStats;
use crate::worker;
use crate::Clock;

/// Delay between consecutive socket creations under `--moderate`.
const MODERATE_CONNECT_DELAY: Duration = Duration::from_millis(25);

/// Per-process knobs that never travel in the Options blob.
#[derive(Clone, Debug, Default)]
pub struct RunConfig {
    pub lambda_mul: u32,
    pub agentmode: bool,
    pub affinity: bool,
    pub wait: u32,
    pub measure_connections: Option<u32>,
    pub measure_qps: Option<u32>,
    pub measure_depth: Option<u32>,
}

struct WorkerCtx {
    master: bool,
    servers: Vec<String>,
    options: Options,
    cfg: RunConfig,
    barrier: Arc<Barrier>,
    coordinator: Option<Arc<Mutex<Coordinator>>>,
    clock: Clock,
    payload: Arc<Vec<u8>>,
    pin_cpu: Option<usize>,
}

/// Run one barrier-synchronized measurement (with optional warmup) across
/// this process's worker threads, and — on the master — across the agent
/// fleet.  Returns the merged stats.
pub fn run(
    servers: &[String],
    options: &mut Options,
    cfg: &RunConfig,
    coordinator: Option<&Arc<Mutex<Coordinator>>>,
    clock: Clock,
    payload: &Arc<Vec<u8>>,
) -> ConnectionStats {
    if let Some(coord) = coordinator {
        let mut guard = coord.lock().unwrap();
        if guard.is_master() {
            if let Err(e) = guard.prep(options, servers, cfg) {
                error!("agent preparation failed: {}", e);
                process::exit(1);
            }
        }
    }

    let threads = options.threads as usize;
    let barrier = Arc::new(Barrier::new(threads));
    let cpus = if cfg.affinity {
        worker::inherited_cpus()
    } else {
        Vec::new()
    };

    debug!("starting {} worker threads", threads);
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let ctx = WorkerCtx {
                master: t == 0,
                servers: thread_servers(servers, t, threads, options.roundrobin),
                options: options.clone(),
                cfg: cfg.clone(),
                barrier: barrier.clone(),
                coordinator: coordinator.cloned(),
                clock,
                payload: payload.clone(),
                pin_cpu: if cpus.is_empty() {
                    None
                } else {
                    Some(cpus[t % cpus.len()])
                },
            };
            thread::Builder::new()
                .name(format!("worker-{}", t))
                .spawn(move || worker_main(ctx))
                .unwrap_or_else(|e| {
                    error!("failed to spawn worker thread: {}", e);
                    process::exit(1);
                })
        })
        .collect();

    let mut stats = ConnectionStats::new();
    for handle in handles {
        match handle.join() {
            Ok(cs) => stats.accumulate(&cs),
            Err(_) => {
                error!("worker thread panicked");
                process::exit(1);
            }
        }
    }

    if let Some(coord) = coordinator {
        let mut guard = coord.lock().unwrap();
        if guard.is_master() {
            let total = stats.gets + stats.sets;
            debug!(
                "local QPS = {:.1} ({} / {:.1}s)",
                total as f64 / stats.window(),
                total,
                stats.window()
            );
            guard.finish(&mut stats);
        }
    }

    stats
}

/// Round-robin mode hands thread t every `threads`-th server starting at
/// `t mod |servers|`; otherwise every thread drives the full list.
fn thread_servers(servers: &[String], t: usize, threads: usize, roundrobin: bool) -> Vec<String> {
    if !roundrobin {
        return servers.to_vec();
    }
    let mut out = Vec::new();
    let mut i = t % servers.len();
    while i < servers.len() {
        out.push(servers[i].clone());
        i += threads;
    }
    out
}

pub fn split_host_port(server: &str) -> io::Result<(String, u16)> {
    let mut parts = server.rsplitn(2, ':');
    let port_str = parts.next().unwrap_or("");
    let host = parts.next();
    match host {
        Some(h) => {
            let port = port_str.parse::<u16>().map_err(|_| {
                Error::new(
                    ErrorKind::InvalidInput,
                    format!("bad port in server spec: {}", server),
                )
            })?;
            Ok((h.to_string(), port))
        }
        None => Ok((server.to_string(), 11211)),
    }
}

fn fatal(context: &str, e: &io::Error) -> ! {
    error!("{}: {}", context, e);
    process::exit(1);
}

fn worker_main(ctx: WorkerCtx) -> ConnectionStats {
    if let Some(cpu) = ctx.pin_cpu {
        match worker::pin_to_cpu(cpu) {
            Ok(()) => debug!("pinned to cpu {}", cpu),
            Err(e) => warn!("failed to pin to cpu {}: {}", cpu, e),
        }
    }

    let conns_per_server = ctx.cfg.measure_connections.unwrap_or(ctx.options.connections);
    let should_load = !ctx.cfg.agentmode;

    // Build connections; the first per server is the lead used for the
    // DB load.
    let mut conns: Vec<Connection> = Vec::new();
    let mut leads: Vec<usize> = Vec::new();
    for server in &ctx.servers {
        let (host, port) = match split_host_port(server) {
            Ok(hp) => hp,
            Err(e) => fatal("bad server spec", &e),
        };
        for c in 0..conns_per_server {
            if ctx.options.moderate && !conns.is_empty() {
                thread::sleep(MODERATE_CONNECT_DELAY);
            }
            match Connection::new(&host, port, &ctx.options, ctx.payload.clone(), should_load) {
                Ok(conn) => {
                    if c == 0 {
                        leads.push(conns.len());
                    }
                    conns.push(conn);
                }
                Err(e) => {
                    let lead_needed = c == 0 && !ctx.options.noload && should_load;
                    if lead_needed {
                        fatal(&format!("lead connection to {} failed", server), &e);
                    }
                    warn!("connection to {} failed, continuing without it: {}", server, e);
                }
            }
        }
    }
    if conns.is_empty() {
        fatal(
            "no connections established",
            &Error::new(ErrorKind::NotConnected, "every connect failed"),
        );
    }

    // Wait for all connections to become IDLE (TCP + SASL handshakes).
    if let Err(e) = worker::drain_until_idle(&mut conns, &ctx.clock) {
        fatal("connection setup failed", &e);
    }

    // Load the database on the lead connection for each server.
    if !ctx.options.noload {
        for &i in &leads {
            if let Err(e) = conns[i].start_loading() {
                fatal("database load failed", &e);
            }
        }
        if let Err(e) = worker::drain_until_idle(&mut conns, &ctx.clock) {
            fatal("database load failed", &e);
        }
    }

    if ctx.options.loadonly {
        return ConnectionStats::new();
    }

    // The load phase is not part of the measurement.
    for conn in conns.iter_mut() {
        conn.reset();
    }

    let agent_involved = ctx.coordinator.is_some();

    if ctx.options.warmup > 0 {
        if ctx.master {
            info!("warmup start");
        }
        if agent_involved {
            sync_point(&ctx);
        }
        let start = ctx.clock.now();
        worker::run_window(&mut conns, &ctx.clock, start, f64::from(ctx.options.warmup));
        for conn in conns.iter_mut() {
            conn.reset();
        }
        if ctx.master {
            info!("warmup stop");
        }
    }

    ctx.barrier.wait();

    // Hold off until the fleet-wide boot offset has passed.
    if ctx.master && ctx.cfg.wait > 0 {
        let target = f64::from(ctx.cfg.wait);
        let now = ctx.clock.now();
        if now < target {
            debug!("sleeping {:.1}s for --wait", target - now);
            thread::sleep(Duration::from_secs_f64(target - now));
        }
    }

    if agent_involved {
        sync_point(&ctx);
    }

    let start = ctx.clock.now();
    let stop = worker::run_window(&mut conns, &ctx.clock, start, f64::from(ctx.options.time));

    let mut stats = ConnectionStats::new();
    for conn in conns.iter() {
        stats.accumulate(&conn.stats);
    }
    stats.start = start;
    stats.stop = stop;
    stats
}

/// Thread barrier, agent barrier, thread barrier: our threads are ready
/// before agents are told to go, and nobody is released until every live
/// agent has arrived.
fn sync_point(ctx: &WorkerCtx) {
    ctx.barrier.wait();
    if ctx.master {
        if let Some(coord) = &ctx.coordinator {
            let mut guard = coord.lock().unwrap();
            let errors = guard.sync();
            if errors > 0 {
                if guard.is_master() {
                    // Failed agents are already out of the active set; the
                    // run continues with whatever capacity is left, down to
                    // the master alone.
                    warn!(
                        "{} synchronization errors, {} agents still active",
                        errors,
                        guard.peers_alive()
                    );
                } else {
                    error!("lost synchronization with master; aborting");
                    process::exit(1);
                }
            }
        }
    }
    ctx.barrier.wait();
}
