#[macro_use]
extern crate clap;

extern crate byteorder;
extern crate env_logger;
extern crate hostname;
extern crate itertools;
extern crate libc;
extern crate log;
extern crate rand;
extern crate rand_distr;
extern crate rand_mt;

use std::fs::File;
use std::io::Write as _;
use std::net::{TcpStream, ToSocketAddrs};
use std::process;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{App, Arg, ArgMatches};
use itertools::Itertools;
use log::{debug, error, info, warn, LevelFilter};
use rand::{Rng, RngCore};
use rand_mt::Mt64;

mod connection;
mod coordinator;
mod distribution;
mod driver;
mod memcached;
mod options;
mod sampler;
mod stats;
mod worker;

use coordinator::Coordinator;
use distribution::{Distribution, SizeGenerator};
use driver::RunConfig;
use options::Options;
use stats::{AgentStats, ConnectionStats};

const MAXIMUM_CONNECTIONS: u32 = 512;
/// Value payload pool; SETs carve their bytes out of this shared buffer.
const VALUE_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// The search loop gives up narrowing once the bracket is this tight.
const SEARCH_PEAK_FLOOR: f64 = 0.01;
/// Fine-tune backs the target off by 1% per step.
const FINE_TUNE_STEP: f64 = 0.99;

/// Monotonic boot-relative clock; every timestamp in the process is a
/// number of seconds since this was created.
#[derive(Copy, Clone)]
pub struct Clock {
    boot: Instant,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            boot: Instant::now(),
        }
    }

    pub fn now(&self) -> f64 {
        self.boot.elapsed().as_secs_f64()
    }
}

/// Owned input buffer: bytes arrive at the head, complete replies are
/// pulled from the tail.
pub struct Buffer {
    buf: Vec<u8>,
    head: usize,
    tail: usize,
}

impl Buffer {
    pub fn with_capacity(n: usize) -> Buffer {
        Buffer {
            buf: vec![0; n],
            head: 0,
            tail: 0,
        }
    }

    pub fn data_size(&self) -> usize {
        self.head - self.tail
    }

    pub fn get_data(&self) -> &[u8] {
        &self.buf[self.tail..self.head]
    }

    pub fn push_data(&mut self, size: usize) {
        self.head += size;
        assert!(self.head <= self.buf.len());
    }

    pub fn pull_data(&mut self, size: usize) {
        assert!(size <= self.data_size());
        self.tail += size;
        if self.tail == self.head {
            self.tail = 0;
            self.head = 0;
        }
    }

    pub fn get_empty_buf(&mut self) -> &mut [u8] {
        &mut self.buf[self.head..]
    }

    /// Guarantee `need` bytes of free space at the head, compacting first
    /// and growing only when compaction is not enough.
    pub fn make_room(&mut self, need: usize) {
        if self.buf.len() - self.head >= need {
            return;
        }
        if self.tail > 0 {
            self.buf.copy_within(self.tail..self.head, 0);
            self.head -= self.tail;
            self.tail = 0;
        }
        if self.buf.len() - self.head < need {
            self.buf.resize(self.head + need, 0);
        }
    }
}

fn die(msg: &str) -> ! {
    error!("{}", msg);
    process::exit(1);
}

fn main() {
    let matches = App::new("mcblast")
        .version(crate_version!())
        .about("Distributed load generator for the memcached text/binary protocol")
        .arg(
            Arg::with_name("server")
                .long("server")
                .short("s")
                .value_name("HOST[:PORT]")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Memcached server to load (repeatable)"),
        )
        .arg(
            Arg::with_name("threads")
                .long("threads")
                .short("T")
                .value_name("N")
                .default_value("1")
                .help("Number of worker threads"),
        )
        .arg(
            Arg::with_name("connections")
                .long("connections")
                .short("c")
                .value_name("N")
                .default_value("1")
                .help("Connections per server per thread"),
        )
        .arg(
            Arg::with_name("qps")
                .long("qps")
                .short("q")
                .value_name("N")
                .default_value("0")
                .help("Aggregate target QPS (0 = open loop, bounded by --depth)"),
        )
        .arg(
            Arg::with_name("time")
                .long("time")
                .short("t")
                .value_name("SEC")
                .default_value("5")
                .help("Measurement window in seconds"),
        )
        .arg(
            Arg::with_name("warmup")
                .long("warmup")
                .short("w")
                .value_name("SEC")
                .default_value("0")
                .help("Warmup seconds before the measurement window"),
        )
        .arg(
            Arg::with_name("wait")
                .long("wait")
                .short("W")
                .value_name("SEC")
                .default_value("0")
                .help("Delay the measurement until SEC after process boot"),
        )
        .arg(
            Arg::with_name("depth")
                .long("depth")
                .short("d")
                .value_name("N")
                .default_value("1")
                .help("Maximum outstanding operations per connection"),
        )
        .arg(
            Arg::with_name("update")
                .long("update")
                .short("u")
                .value_name("FRACTION")
                .default_value("0.0")
                .help("Fraction of SET operations [0.0..1.0]"),
        )
        .arg(
            Arg::with_name("records")
                .long("records")
                .short("r")
                .value_name("N")
                .default_value("10000")
                .help("Total records to load, split across servers"),
        )
        .arg(
            Arg::with_name("keysize")
                .long("keysize")
                .short("K")
                .value_name("SPEC")
                .default_value("30")
                .help("Key size spec: N, fixed:N, uniform:LO:HI, normal:MEAN:SD"),
        )
        .arg(
            Arg::with_name("valuesize")
                .long("valuesize")
                .short("V")
                .value_name("SPEC")
                .default_value("200")
                .help("Value size spec: N, fixed:N, uniform:LO:HI, normal:MEAN:SD"),
        )
        .arg(
            Arg::with_name("iadist")
                .long("iadist")
                .short("i")
                .value_name("DIST")
                .possible_values(&["exp", "exponential", "uniform", "fixed"])
                .default_value("exponential")
                .help("Inter-arrival time distribution"),
        )
        .arg(
            Arg::with_name("roundrobin")
                .long("roundrobin")
                .help("One socket per (thread, server) pairing instead of the full cross product"),
        )
        .arg(
            Arg::with_name("binary")
                .long("binary")
                .help("Use the binary protocol instead of text"),
        )
        .arg(
            Arg::with_name("username")
                .long("username")
                .value_name("USER")
                .takes_value(true)
                .requires("password")
                .help("SASL username (requires --binary)"),
        )
        .arg(
            Arg::with_name("password")
                .long("password")
                .value_name("PASS")
                .takes_value(true)
                .help("SASL password"),
        )
        .arg(
            Arg::with_name("no_nodelay")
                .long("no_nodelay")
                .help("Leave Nagle's algorithm enabled on load connections"),
        )
        .arg(
            Arg::with_name("blocking")
                .long("blocking")
                .help("Sleep in poll between scheduled issues instead of busy-polling"),
        )
        .arg(
            Arg::with_name("loadonly")
                .long("loadonly")
                .help("Load the database and exit"),
        )
        .arg(
            Arg::with_name("noload")
                .long("noload")
                .help("Skip the database load phase"),
        )
        .arg(
            Arg::with_name("skip")
                .long("skip")
                .help("Drop scheduled issues missed while the pipeline is full"),
        )
        .arg(
            Arg::with_name("moderate")
                .long("moderate")
                .help("Pace connection startup"),
        )
        .arg(
            Arg::with_name("getq_freq")
                .long("getq_freq")
                .value_name("F")
                .default_value("0.0")
                .help("Probability a GET becomes a quiet multi-get batch"),
        )
        .arg(
            Arg::with_name("getq_size")
                .long("getq_size")
                .value_name("N")
                .default_value("100")
                .help("Keys per quiet multi-get batch"),
        )
        .arg(
            Arg::with_name("agent")
                .long("agent")
                .short("a")
                .value_name("HOST")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Agent host to enlist (repeatable)"),
        )
        .arg(
            Arg::with_name("agent_port")
                .long("agent_port")
                .short("p")
                .value_name("PORT")
                .default_value("5556")
                .help("Agent coordination port"),
        )
        .arg(
            Arg::with_name("agentmode")
                .long("agentmode")
                .short("A")
                .conflicts_with_all(&["server", "agent", "search", "scan", "save"])
                .help("Run as an agent: accept work from a master"),
        )
        .arg(
            Arg::with_name("agent_timeout")
                .long("agent_timeout")
                .value_name("SEC")
                .default_value("0")
                .help("Poll budget for agent exchanges; 0 blocks forever"),
        )
        .arg(
            Arg::with_name("lambda_mul")
                .long("lambda_mul")
                .short("l")
                .value_name("N")
                .default_value("1")
                .help("Weight this process's connections in the rate split"),
        )
        .arg(
            Arg::with_name("measure_connections")
                .long("measure_connections")
                .value_name("N")
                .takes_value(true)
                .help("Master opens this many connections per server for latency sampling"),
        )
        .arg(
            Arg::with_name("measure_qps")
                .long("measure_qps")
                .value_name("N")
                .takes_value(true)
                .help("Master samples at this rate; agents absorb the rest of --qps"),
        )
        .arg(
            Arg::with_name("measure_depth")
                .long("measure_depth")
                .value_name("N")
                .takes_value(true)
                .help("Pipeline depth override for the master's measurement connections"),
        )
        .arg(
            Arg::with_name("search")
                .long("search")
                .value_name("N:X")
                .takes_value(true)
                .conflicts_with("scan")
                .help("Binary-search for the max QPS with Nth-percentile (or avg) latency <= X us"),
        )
        .arg(
            Arg::with_name("search_converge")
                .long("search_converge")
                .value_name("RATIO")
                .default_value("1.02")
                .help("Stop narrowing when high <= low * RATIO"),
        )
        .arg(
            Arg::with_name("search_floor")
                .long("search_floor")
                .value_name("FRACTION")
                .default_value("0.90")
                .help("Fine-tune floor as a fraction of the binary-search low"),
        )
        .arg(
            Arg::with_name("scan")
                .long("scan")
                .value_name("MIN:MAX:STEP")
                .takes_value(true)
                .help("Run one measurement per QPS step and emit a row each"),
        )
        .arg(
            Arg::with_name("save")
                .long("save")
                .value_name("PATH")
                .takes_value(true)
                .help("Dump retained GET samples to a file"),
        )
        .arg(
            Arg::with_name("affinity")
                .long("affinity")
                .help("Pin worker threads to CPUs from the inherited mask"),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .multiple(true)
                .help("More diagnostics on stderr (stackable)"),
        )
        .arg(
            Arg::with_name("quiet")
                .long("quiet")
                .conflicts_with("verbose")
                .help("Errors only"),
        )
        .get_matches();

    let level = if matches.is_present("quiet") {
        LevelFilter::Error
    } else {
        match matches.occurrences_of("verbose") {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_micros()
        .init();

    validate_args(&matches);

    let clock = Clock::new();
    let payload = init_value_buffer();
    let lambda_mul = value_t_or_exit!(matches, "lambda_mul", u32);

    if matches.is_present("agentmode") {
        agent_mode(&matches, lambda_mul, clock, &payload);
    }

    let cfg = RunConfig {
        lambda_mul,
        agentmode: false,
        affinity: matches.is_present("affinity"),
        wait: value_t_or_exit!(matches, "wait", u32),
        measure_connections: opt_value(&matches, "measure_connections"),
        measure_qps: opt_value(&matches, "measure_qps"),
        measure_depth: opt_value(&matches, "measure_depth"),
    };

    let coordinator = if matches.is_present("agent") {
        let hosts: Vec<String> = matches
            .values_of("agent")
            .unwrap()
            .map(str::to_string)
            .collect();
        let port = value_t_or_exit!(matches, "agent_port", u16);
        let timeout_s = value_t_or_exit!(matches, "agent_timeout", u64);
        let timeout = if timeout_s == 0 {
            None
        } else {
            Some(Duration::from_secs(timeout_s))
        };
        match Coordinator::connect_master(&hosts, port, timeout) {
            Ok(c) => Some(Arc::new(Mutex::new(c))),
            Err(e) => die(&e.to_string()),
        }
    } else {
        None
    };

    let servers: Vec<String> = matches
        .values_of("server")
        .unwrap()
        .map(name_to_ipaddr)
        .collect();
    info!("targets: {}", servers.iter().join(", "));

    let base = args_to_options(&matches, lambda_mul);

    if let Some(spec) = matches.value_of("scan") {
        run_scan(
            spec,
            &servers,
            &base,
            &cfg,
            coordinator.as_ref(),
            clock,
            &payload,
        );
        return;
    }

    let mut search_peak = None;
    let stats = if let Some(spec) = matches.value_of("search") {
        let converge = value_t_or_exit!(matches, "search_converge", f64);
        let floor = value_t_or_exit!(matches, "search_floor", f64);
        let (stats, peak) = run_search(
            spec,
            converge,
            floor,
            &servers,
            &base,
            &cfg,
            coordinator.as_ref(),
            clock,
            &payload,
        );
        search_peak = Some(peak);
        stats
    } else {
        run_once(
            &servers,
            &base,
            None,
            &cfg,
            coordinator.as_ref(),
            clock,
            &payload,
        )
    };

    if base.loadonly {
        return;
    }

    print_report(&stats, search_peak);

    if let Some(path) = matches.value_of("save") {
        info!("saving latency samples to {}", path);
        if let Err(e) = save_samples(path, &stats) {
            die(&format!("--save: failed to write {}: {}", path, e));
        }
    }
}

fn validate_args(matches: &ArgMatches) {
    if value_t_or_exit!(matches, "depth", u32) < 1 {
        die("--depth must be >= 1");
    }
    if value_t_or_exit!(matches, "time", u32) < 1 {
        die("--time must be >= 1");
    }
    let update = value_t_or_exit!(matches, "update", f64);
    if !(0.0..=1.0).contains(&update) {
        die("--update must be >= 0.0 and <= 1.0");
    }
    let getq_freq = value_t_or_exit!(matches, "getq_freq", f64);
    if !(0.0..=1.0).contains(&getq_freq) {
        die("--getq_freq must be >= 0.0 and <= 1.0");
    }
    let connections = value_t_or_exit!(matches, "connections", u32);
    if connections < 1 || connections > MAXIMUM_CONNECTIONS {
        die(&format!(
            "--connections must be between [1,{}]",
            MAXIMUM_CONNECTIONS
        ));
    }
    if value_t_or_exit!(matches, "threads", u32) < 1 {
        die("--threads must be >= 1");
    }
    if !matches.is_present("server") && !matches.is_present("agentmode") {
        die("--server or --agentmode must be specified");
    }
    if matches.is_present("username") && !matches.is_present("binary") {
        die("--username/--password (SASL) require --binary");
    }
    if let Err(e) = Distribution::create(matches.value_of("iadist").unwrap()) {
        die(&format!("--iadist: {}", e));
    }
    if let Err(e) = SizeGenerator::create(matches.value_of("keysize").unwrap()) {
        die(&format!("--keysize: {}", e));
    }
    if let Err(e) = SizeGenerator::create(matches.value_of("valuesize").unwrap()) {
        die(&format!("--valuesize: {}", e));
    }
}

fn opt_value(matches: &ArgMatches, name: &str) -> Option<u32> {
    if matches.is_present(name) {
        Some(value_t_or_exit!(matches, name, u32))
    } else {
        None
    }
}

fn args_to_options(matches: &ArgMatches, lambda_mul: u32) -> Options {
    let mut options = Options::default();

    options.connections = value_t_or_exit!(matches, "connections", u32);
    options.blocking = matches.is_present("blocking");
    options.qps = value_t_or_exit!(matches, "qps", u32);
    options.threads = value_t_or_exit!(matches, "threads", u32);
    options.server_given = matches
        .values_of("server")
        .map(|v| v.len() as u32)
        .unwrap_or(0)
        .max(1);
    options.roundrobin = matches.is_present("roundrobin");

    options.records =
        (value_t_or_exit!(matches, "records", u64) / u64::from(options.server_given)).max(1);

    options.binary = matches.is_present("binary");
    options.sasl = matches.is_present("username");
    options.username = matches.value_of("username").unwrap_or("").to_string();
    options.password = matches.value_of("password").unwrap_or("").to_string();

    options.keysize = matches.value_of("keysize").unwrap().to_string();
    options.valuesize = matches.value_of("valuesize").unwrap().to_string();
    options.update = value_t_or_exit!(matches, "update", f64);
    options.time = value_t_or_exit!(matches, "time", u32);
    options.warmup = value_t_or_exit!(matches, "warmup", u32);
    options.loadonly = matches.is_present("loadonly");
    options.noload = matches.is_present("noload");
    options.depth = value_t_or_exit!(matches, "depth", u32);
    options.no_nodelay = matches.is_present("no_nodelay");
    options.iadist = matches.value_of("iadist").unwrap().to_string();
    options.oob_thread = false;
    options.skip = matches.is_present("skip");
    options.moderate = matches.is_present("moderate");
    options.getq_freq = value_t_or_exit!(matches, "getq_freq", f64);
    options.getq_size = value_t_or_exit!(matches, "getq_size", u32);

    options.lambda_denom = options.local_connection_count(lambda_mul);
    options.recompute_lambda(lambda_mul);
    options
}

fn init_value_buffer() -> Arc<Vec<u8>> {
    let mut rng = Mt64::new(rand::thread_rng().gen::<u64>());
    let mut buf = vec![0u8; VALUE_BUFFER_SIZE];
    rng.fill_bytes(&mut buf);
    Arc::new(buf)
}

/// Resolve `HOST[:PORT]` to `ip:port`, defaulting to the memcached port.
fn name_to_ipaddr(spec: &str) -> String {
    let (host, port) = match driver::split_host_port(spec) {
        Ok(hp) => hp,
        Err(e) => die(&e.to_string()),
    };
    let addr = match (host.as_str(), port).to_socket_addrs() {
        Ok(mut addrs) => addrs.next(),
        Err(e) => die(&format!("error while resolving '{}': {}", spec, e)),
    };
    match addr {
        Some(a) => {
            debug!("resolved {} to {}", spec, a);
            a.to_string()
        }
        None => die(&format!("no DNS answer for '{}'", spec)),
    }
}

fn run_once(
    servers: &[String],
    base: &Options,
    qps: Option<u32>,
    cfg: &RunConfig,
    coordinator: Option<&Arc<Mutex<Coordinator>>>,
    clock: Clock,
    payload: &Arc<Vec<u8>>,
) -> ConnectionStats {
    let mut options = base.clone();
    if let Some(q) = qps {
        options.qps = q;
        options.recompute_lambda(cfg.lambda_mul);
    }
    driver::run(servers, &mut options, cfg, coordinator, clock, payload)
}

fn parse_search_spec(spec: &str) -> Result<(Option<f64>, f64), String> {
    let mut parts = spec.splitn(2, ':');
    let n = parts.next().unwrap_or("");
    let x = parts
        .next()
        .ok_or_else(|| format!("invalid --search argument: {}", spec))?;
    let x: f64 = x
        .trim_end_matches("us")
        .parse()
        .map_err(|_| format!("invalid --search latency: {}", spec))?;
    if n == "avg" {
        return Ok((None, x));
    }
    let pct: f64 = n
        .parse()
        .map_err(|_| format!("invalid --search percentile: {}", spec))?;
    if !(0.0..=100.0).contains(&pct) {
        return Err(format!("--search percentile out of range: {}", spec));
    }
    Ok((Some(pct), x))
}

fn parse_scan_spec(spec: &str) -> Result<(u32, u32, u32), String> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() != 3 {
        return Err(format!("invalid --scan argument: {}", spec));
    }
    let min = parts[0]
        .parse::<u32>()
        .map_err(|_| format!("invalid --scan min: {}", spec))?;
    let max = parts[1]
        .parse::<u32>()
        .map_err(|_| format!("invalid --scan max: {}", spec))?;
    let step = parts[2]
        .parse::<u32>()
        .map_err(|_| format!("invalid --scan step: {}", spec))?;
    if step == 0 || max < min {
        return Err(format!("--scan wants MIN <= MAX and STEP > 0: {}", spec));
    }
    Ok((min, max, step))
}

/// Find the highest QPS whose latency meets the SLO: one uncapped run to
/// discover the peak, a binary search over the bracket, then a downward
/// fine-tune guarding against an over-optimistic low.
fn run_search(
    spec: &str,
    converge: f64,
    floor: f64,
    servers: &[String],
    base: &Options,
    cfg: &RunConfig,
    coordinator: Option<&Arc<Mutex<Coordinator>>>,
    clock: Clock,
    payload: &Arc<Vec<u8>>,
) -> (ConnectionStats, f64) {
    let (pct, x) = match parse_search_spec(spec) {
        Ok(v) => v,
        Err(e) => die(&e),
    };
    let latency_of = |stats: &ConnectionStats| match pct {
        None => stats.get_avg(),
        Some(p) => stats.get_nth(p),
    };
    match pct {
        None => info!("search mode: find QPS @ {}us avg latency", x),
        Some(p) => info!("search mode: find QPS @ {}us {}th percentile", x, p),
    }

    let mut stats = run_once(servers, base, None, cfg, coordinator, clock, payload);
    let mut nth = latency_of(&stats);
    let peak_qps = stats.get_qps();
    info!("peak qps = {:8.0}, latency = {:.1}us", peak_qps, nth);

    if nth > x {
        let mut high_qps = peak_qps;
        let mut low_qps = 1.0;
        let mut cur_qps = peak_qps;

        while high_qps > low_qps * converge && cur_qps > peak_qps * SEARCH_PEAK_FLOOR {
            cur_qps = (high_qps + low_qps) / 2.0;
            stats = run_once(
                servers,
                base,
                Some(cur_qps as u32),
                cfg,
                coordinator,
                clock,
                payload,
            );
            nth = latency_of(&stats);
            info!(
                ". target = {:8.0}, latency = {:.1}us, high = {:.0}, low = {:.0}, qps = {:.1}",
                cur_qps,
                nth,
                high_qps,
                low_qps,
                stats.get_qps()
            );
            if nth > x {
                high_qps = cur_qps;
            } else {
                low_qps = cur_qps;
            }
        }

        // The converged low may still be optimistic; back off by 1% at a
        // time, but never below 90% of it (or 1% of peak).
        while nth > x && cur_qps > peak_qps * SEARCH_PEAK_FLOOR && cur_qps > low_qps * floor {
            cur_qps *= FINE_TUNE_STEP;
            stats = run_once(
                servers,
                base,
                Some(cur_qps as u32),
                cfg,
                coordinator,
                clock,
                payload,
            );
            nth = latency_of(&stats);
            info!(
                ". target = {:8.0}, latency = {:.1}us, high = {:.0}, low = {:.0}, qps = {:.1}",
                cur_qps,
                nth,
                high_qps,
                low_qps,
                stats.get_qps()
            );
        }

        if cur_qps <= peak_qps * SEARCH_PEAK_FLOOR {
            warn!(
                "search: operating point collapsed below {:.0}% of peak; result is degenerate",
                SEARCH_PEAK_FLOOR * 100.0
            );
        }
    }

    (stats, peak_qps)
}

fn run_scan(
    spec: &str,
    servers: &[String],
    base: &Options,
    cfg: &RunConfig,
    coordinator: Option<&Arc<Mutex<Coordinator>>>,
    clock: Clock,
    payload: &Arc<Vec<u8>>,
) {
    let (min, max, step) = match parse_scan_spec(spec) {
        Ok(v) => v,
        Err(e) => die(&e),
    };

    ConnectionStats::print_header(false);
    println!(" {:>8} {:>8}", "QPS", "target");

    let mut q = min;
    while q <= max {
        let stats = run_once(servers, base, Some(q), cfg, coordinator, clock, payload);
        stats.print_stats("read", &stats.get_sampler, false);
        print!(" {:8.1}", stats.get_qps());
        println!(" {:8}", q);
        q += step;
    }
}

fn print_report(stats: &ConnectionStats, search_peak: Option<f64>) {
    ConnectionStats::print_header(true);
    stats.print_stats("read", &stats.get_sampler, true);
    stats.print_stats("update", &stats.set_sampler, true);
    stats.print_stats("op_q", &stats.op_q_sampler, true);

    let total = stats.gets + stats.sets;
    println!();
    println!(
        "Total QPS = {:.1} ({} / {:.1}s)",
        stats.get_qps(),
        total,
        stats.window()
    );
    if let Some(peak) = search_peak {
        println!("Peak QPS  = {:.1}", peak);
    }
    println!();
    println!(
        "Misses = {} ({:.1}%)",
        stats.get_misses,
        percent(stats.get_misses, stats.gets)
    );
    println!(
        "Skipped TXs = {} ({:.1}%)",
        stats.skips,
        percent(stats.skips, total)
    );
    println!();
    println!(
        "RX {:>10} bytes : {:>6.1} MB/s",
        stats.rx_bytes,
        mb_per_sec(stats.rx_bytes, stats.window())
    );
    println!(
        "TX {:>10} bytes : {:>6.1} MB/s",
        stats.tx_bytes,
        mb_per_sec(stats.tx_bytes, stats.window())
    );
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}

fn mb_per_sec(bytes: u64, window: f64) -> f64 {
    if window <= 0.0 {
        return 0.0;
    }
    bytes as f64 / 1024.0 / 1024.0 / window
}

/// One line per retained GET sample: start time relative to boot, then
/// duration, both in seconds, in capture order.
fn save_samples(path: &str, stats: &ConnectionStats) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    for op in stats.get_sampler.samples() {
        writeln!(file, "{:.6} {:.6}", op.start_time, op.time())?;
    }
    Ok(())
}

/// Agent mode: accept masters forever, serving one run per preparation
/// exchange.  Scan and search on the master arrive here as a sequence of
/// runs over the same connection.
fn agent_mode(matches: &ArgMatches, lambda_mul: u32, clock: Clock, payload: &Arc<Vec<u8>>) -> ! {
    let port = value_t_or_exit!(matches, "agent_port", u16);
    let threads = value_t_or_exit!(matches, "threads", u32);
    let connections = value_t_or_exit!(matches, "connections", u32);
    let affinity = matches.is_present("affinity");

    let backlog = coordinator::agent_backlog(connections, threads);
    let listener = match coordinator::agent_listener(port, backlog) {
        Ok(l) => l,
        Err(e) => die(&format!("failed to bind agent port {}: {}", port, e)),
    };
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "<unknown>".to_string());
    info!("agent on {} listening on port {} (backlog {})", host, port, backlog);

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("master connected from {}", peer);
                if let Err(e) = coordinator::configure_peer(&stream, None) {
                    warn!("failed to configure master socket: {}", e);
                    continue;
                }
                serve_master(stream, threads, lambda_mul, affinity, clock, payload);
                info!("master session ended");
            }
            Err(e) => warn!("accept failed: {}", e),
        }
    }
}

/// One master session: repeat the preparation / run / stats exchange until
/// the master goes away.
fn serve_master(
    mut stream: TcpStream,
    threads: u32,
    lambda_mul: u32,
    affinity: bool,
    clock: Clock,
    payload: &Arc<Vec<u8>>,
) {
    loop {
        let blob = match coordinator::recv_frame(&mut stream) {
            Ok(b) => b,
            Err(_) => return,
        };
        let mut options = match Options::decode(&mut &blob[..]) {
            Ok(o) => o,
            Err(e) => {
                warn!("bad options blob from master: {}", e);
                return;
            }
        };
        debug!(
            "got options: {} connections, qps = {}{}",
            options.connections,
            options.qps,
            if options.loadonly {
                ", loadonly"
            } else if options.noload {
                ", noload"
            } else {
                ""
            }
        );

        if coordinator::send_u32(&mut stream, threads * lambda_mul).is_err() {
            return;
        }

        let mut servers = Vec::new();
        for _ in 0..options.server_given {
            let server = coordinator::recv_token(&mut stream);
            if server == coordinator::FAIL_RECV {
                return;
            }
            debug!("got server = {}", server);
            servers.push(server);
            if coordinator::send_token(&mut stream, coordinator::TOKEN_ACK).is_err() {
                return;
            }
        }

        options.threads = threads;
        options.lambda_denom = match coordinator::recv_u32(&mut stream) {
            Ok(v) => v,
            Err(_) => return,
        };
        if coordinator::send_token(&mut stream, coordinator::TOKEN_THANKS).is_err() {
            return;
        }
        options.recompute_lambda(lambda_mul);
        debug!(
            "lambda_denom = {}, lambda = {:.2}, qps = {}",
            options.lambda_denom, options.lambda, options.qps
        );

        let sync_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to clone master socket: {}", e);
                return;
            }
        };
        let coord = Arc::new(Mutex::new(Coordinator::agent(sync_stream)));
        let cfg = RunConfig {
            lambda_mul,
            agentmode: true,
            affinity,
            wait: 0,
            measure_connections: None,
            measure_qps: None,
            measure_depth: None,
        };
        let stats = driver::run(&servers, &mut options, &cfg, Some(&coord), clock, payload);

        let req = coordinator::recv_token(&mut stream);
        if req != coordinator::TOKEN_STATS {
            warn!("expected stats request, got {:?}", req);
            return;
        }
        let mut reply = Vec::new();
        AgentStats::from_stats(&stats).encode(&mut reply);
        if coordinator::send_frame(&mut stream, &reply).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_push_pull() {
        let mut buf = Buffer::with_capacity(16);
        buf.get_empty_buf()[..5].copy_from_slice(b"hello");
        buf.push_data(5);
        assert_eq!(buf.data_size(), 5);
        assert_eq!(buf.get_data(), b"hello");

        buf.pull_data(2);
        assert_eq!(buf.get_data(), b"llo");

        // Draining resets the cursors.
        buf.pull_data(3);
        assert_eq!(buf.data_size(), 0);
        assert_eq!(buf.get_empty_buf().len(), 16);
    }

    #[test]
    fn buffer_compacts_before_growing() {
        let mut buf = Buffer::with_capacity(8);
        buf.get_empty_buf()[..8].copy_from_slice(b"abcdefgh");
        buf.push_data(8);
        buf.pull_data(6);

        buf.make_room(4);
        assert_eq!(buf.get_data(), b"gh");
        assert!(buf.get_empty_buf().len() >= 4);
    }

    #[test]
    fn buffer_grows_when_compaction_is_not_enough() {
        let mut buf = Buffer::with_capacity(4);
        buf.get_empty_buf()[..4].copy_from_slice(b"abcd");
        buf.push_data(4);

        buf.make_room(64);
        assert_eq!(buf.get_data(), b"abcd");
        assert!(buf.get_empty_buf().len() >= 64);
    }

    #[test]
    fn search_spec_parses() {
        assert_eq!(parse_search_spec("95:500").unwrap(), (Some(95.0), 500.0));
        assert_eq!(parse_search_spec("99:1500us").unwrap(), (Some(99.0), 1500.0));
        assert_eq!(parse_search_spec("avg:300").unwrap(), (None, 300.0));
        assert!(parse_search_spec("95").is_err());
        assert!(parse_search_spec("105:500").is_err());
        assert!(parse_search_spec("p95:500").is_err());
    }

    #[test]
    fn scan_spec_parses() {
        assert_eq!(parse_scan_spec("1000:5000:1000").unwrap(), (1000, 5000, 1000));
        assert!(parse_scan_spec("1000:5000").is_err());
        assert!(parse_scan_spec("5000:1000:100").is_err());
        assert!(parse_scan_spec("0:100:0").is_err());
    }

    #[test]
    fn scan_emits_inclusive_steps() {
        let (min, max, step) = parse_scan_spec("1000:5000:1000").unwrap();
        let points: Vec<u32> = (min..=max).step_by(step as usize).collect();
        assert_eq!(points, vec![1000, 2000, 3000, 4000, 5000]);
    }

    #[test]
    fn clock_is_monotone() {
        let clock = Clock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a >= 0.0);
    }
}
