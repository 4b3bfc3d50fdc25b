use std::collections::VecDeque;
use std::io::{self, Error, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;
use rand::Rng;
use rand_mt::Mt64;

use crate::distribution::{index_rng, Distribution, SizeGenerator};
use crate::memcached::{Opcode, Protocol, ResponseStatus};
use crate::options::Options;
use crate::sampler::{OpKind, Operation};
use crate::stats::ConnectionStats;
use crate::Buffer;

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);
const RECV_CHUNK: usize = 16 * 1024;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ReadState {
    InitRead,
    ConnSetup,
    Idle,
    WaitingForGet,
    WaitingForSet,
    WaitingForGetqNoop,
    Loading,
}

/// An issued, unreplied operation.  Responses are matched head-first;
/// memcached preserves order per connection.
struct Pending {
    start: f64,
    kind: OpKind,
    batch: u32,
}

/// One rate-shaped stream of memcached operations on one TCP socket.
///
/// The write machine issues operations whenever the schedule and the
/// pipeline depth permit; the read machine pops the FIFO as complete
/// responses arrive and feeds the latency samplers.
pub struct Connection {
    sock: TcpStream,
    pub read_state: ReadState,
    pub options: Options,
    protocol: Protocol,
    valuesize: SizeGenerator,
    iagen: Distribution,
    payload: Arc<Vec<u8>>,
    rng: Mt64,

    fifo: VecDeque<Pending>,
    batch_hits: u32,

    tx: Vec<u8>,
    rx: Buffer,

    pub start_time: f64,
    window: f64,
    next_time: f64,

    should_load: bool,
    loading: bool,
    load_next: u64,

    pub stats: ConnectionStats,
    peer: String,
}

impl Connection {
    pub fn new(
        host: &str,
        port: u16,
        options: &Options,
        payload: Arc<Vec<u8>>,
        should_load: bool,
    ) -> io::Result<Connection> {
        let keysize = SizeGenerator::create(&options.keysize)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, format!("--keysize: {}", e)))?;
        let valuesize = SizeGenerator::create(&options.valuesize)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, format!("--valuesize: {}", e)))?;
        let iagen = Distribution::create(&options.iadist)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, format!("--iadist: {}", e)))?;

        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no address for {}", host)))?;

        let sock = connect_with_retry(addr)?;
        sock.set_nodelay(!options.no_nodelay)?;
        sock.set_nonblocking(true)?;

        let mut conn = Connection {
            sock,
            read_state: ReadState::InitRead,
            options: options.clone(),
            protocol: Protocol::new(options.binary, keysize),
            valuesize,
            iagen,
            payload,
            rng: Mt64::new(rand::thread_rng().gen::<u64>()),
            fifo: VecDeque::new(),
            batch_hits: 0,
            tx: Vec::new(),
            rx: Buffer::with_capacity(RECV_CHUNK),
            start_time: 0.0,
            window: 0.0,
            next_time: 0.0,
            should_load,
            loading: false,
            load_next: 0,
            stats: ConnectionStats::new(),
            peer: format!("{}:{}", host, port),
        };

        if conn.options.sasl {
            let (user, pass) = (conn.options.username.clone(), conn.options.password.clone());
            conn.protocol.sasl_request(&user, &pass, &mut conn.tx);
            conn.read_state = ReadState::ConnSetup;
            conn.flush()?;
        } else {
            conn.read_state = ReadState::Idle;
        }

        Ok(conn)
    }

    pub fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn has_tx_pending(&self) -> bool {
        !self.tx.is_empty()
    }

    /// Begin a measurement window: the first scheduled issue instant is the
    /// window start itself.
    pub fn arm(&mut self, start: f64, window: f64) {
        self.start_time = start;
        self.window = window;
        self.next_time = start;
    }

    /// Issue SETs for every key this server owns; IDLE again once the last
    /// one is acknowledged.  Only the lead connection of a loading process
    /// calls this; agents skip the load phase entirely.
    pub fn start_loading(&mut self) -> io::Result<()> {
        if !self.should_load {
            return Ok(());
        }
        self.read_state = ReadState::Loading;
        self.loading = true;
        self.load_next = 0;
        self.refill_load();
        self.flush()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// The tick function: issue as many operations as the schedule and the
    /// pipeline depth currently permit, then push bytes toward the socket.
    pub fn drive_write_machine(&mut self, now: f64) -> io::Result<()> {
        match self.read_state {
            ReadState::InitRead | ReadState::ConnSetup => return self.flush(),
            ReadState::Loading => {
                self.refill_load();
                return self.flush();
            }
            _ => {}
        }

        // Past the window end nothing new is issued; the pipeline drains.
        if now >= self.start_time + self.window {
            return self.flush();
        }

        let depth = self.options.depth as usize;
        let lambda = self.options.lambda;

        loop {
            if self.fifo.len() >= depth {
                if lambda > 0.0 && self.options.skip && now >= self.next_time {
                    // Dropped slot: time advances so the offered load keeps
                    // its temporal shape.
                    self.stats.skips += 1;
                    self.advance_schedule();
                    continue;
                }
                break;
            }

            if lambda <= 0.0 {
                // Closed loop: keep the pipeline full.
                self.issue_op(now);
                continue;
            }

            if now < self.next_time {
                break;
            }

            let t = self.next_time;
            self.issue_op(t);
            self.advance_schedule();
        }

        self.flush()
    }

    /// The instant the write machine next wants to run, for the blocking
    /// loop's poll timeout.
    pub fn next_wakeup(&self) -> Option<f64> {
        if self.options.lambda <= 0.0 {
            return None;
        }
        match self.read_state {
            ReadState::Idle
            | ReadState::WaitingForGet
            | ReadState::WaitingForSet
            | ReadState::WaitingForGetqNoop => Some(self.next_time),
            _ => None,
        }
    }

    pub fn check_exit_condition(&self, now: f64) -> bool {
        !self.loading && now >= self.start_time + self.window && self.fifo.is_empty()
    }

    /// Clear accumulated stats and the FIFO; used between warmup and
    /// measurement (the caller drains first).
    pub fn reset(&mut self) {
        self.stats = ConnectionStats::new();
        self.fifo.clear();
        self.batch_hits = 0;
        self.next_time = 0.0;
        if !matches!(
            self.read_state,
            ReadState::InitRead | ReadState::ConnSetup | ReadState::Loading
        ) {
            self.read_state = ReadState::Idle;
        }
    }

    /// Pull everything the socket has, then match complete responses
    /// against the head of the FIFO.
    pub fn handle_read(&mut self, now: f64) -> io::Result<()> {
        loop {
            self.rx.make_room(RECV_CHUNK);
            match self.sock.read(self.rx.get_empty_buf()) {
                Ok(0) => {
                    return Err(Error::new(
                        ErrorKind::UnexpectedEof,
                        format!("{}: server closed connection", self.peer),
                    ))
                }
                Ok(n) => {
                    self.rx.push_data(n);
                    self.stats.rx_bytes += n as u64;
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.process_responses(now)
    }

    /// Write as much of the transmit buffer as the socket accepts; a short
    /// write is re-armed by the event loop via POLLOUT.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.tx.is_empty() {
            match self.sock.write(&self.tx) {
                Ok(0) => {
                    return Err(Error::new(
                        ErrorKind::WriteZero,
                        format!("{}: zero-length write", self.peer),
                    ))
                }
                Ok(n) => {
                    self.stats.tx_bytes += n as u64;
                    self.tx.drain(..n);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn advance_schedule(&mut self) {
        let gap = self.iagen.sample(&mut self.rng) / self.options.lambda;
        self.next_time += gap;
    }

    fn issue_op(&mut self, t: f64) {
        if self.rng.gen::<f64>() < self.options.update {
            let key = self.rng.gen_range(0..self.options.records);
            self.emit_set(key);
            self.push_pending(t, OpKind::Set, 0);
        } else {
            self.issue_get(t);
        }
    }

    fn issue_get(&mut self, t: f64) {
        if self.options.getq_freq > 0.0 && self.rng.gen::<f64>() < self.options.getq_freq {
            let n = self.options.getq_size.max(1);
            let keys: Vec<u64> = (0..n)
                .map(|_| self.rng.gen_range(0..self.options.records))
                .collect();
            self.protocol.getq_request(&keys, &mut self.tx);
            self.push_pending(t, OpKind::OpQ, n);
        } else {
            let key = self.rng.gen_range(0..self.options.records);
            self.protocol.get_request(key, &mut self.tx);
            self.push_pending(t, OpKind::Get, 0);
        }
    }

    fn emit_set(&mut self, key: u64) {
        let len = self.valuesize.generate(key).min(self.payload.len());
        let max_off = self.payload.len() - len;
        // Offset is derived from the key, like the value size, so every
        // process writes the same bytes for the same record.
        let off = if max_off == 0 {
            0
        } else {
            index_rng(key).gen_range(0..max_off as u64) as usize
        };
        self.protocol
            .set_request(key, &self.payload[off..off + len], &mut self.tx);
    }

    fn push_pending(&mut self, start: f64, kind: OpKind, batch: u32) {
        self.fifo.push_back(Pending { start, kind, batch });
        if self.fifo.len() == 1 {
            self.read_state = waiting_state(kind);
        }
    }

    fn refill_load(&mut self) {
        let depth = self.options.depth as usize;
        while self.fifo.len() < depth && self.load_next < self.options.records {
            let key = self.load_next;
            self.emit_set(key);
            self.fifo.push_back(Pending {
                start: 0.0,
                kind: OpKind::Set,
                batch: 0,
            });
            self.load_next += 1;
        }
    }

    fn process_responses(&mut self, now: f64) -> io::Result<()> {
        loop {
            match self.read_state {
                ReadState::ConnSetup => {
                    let resp = match self.protocol.parse_binary(&mut self.rx)? {
                        Some(r) => r,
                        None => return Ok(()),
                    };
                    if resp.opcode != Opcode::SaslAuth as u8
                        || resp.status != ResponseStatus::NoError as u16
                    {
                        return Err(Error::new(
                            ErrorKind::PermissionDenied,
                            format!("{}: SASL authentication failed", self.peer),
                        ));
                    }
                    debug!("{}: SASL authenticated", self.peer);
                    self.read_state = ReadState::Idle;
                }

                ReadState::Loading => {
                    let complete = if self.protocol.is_binary() {
                        match self.protocol.parse_binary(&mut self.rx)? {
                            Some(r) => {
                                if r.status != ResponseStatus::NoError as u16 {
                                    return Err(Error::new(
                                        ErrorKind::InvalidData,
                                        format!("{}: load SET failed ({})", self.peer, r.status),
                                    ));
                                }
                                true
                            }
                            None => false,
                        }
                    } else {
                        self.protocol.parse_text_set(&mut self.rx)?.is_some()
                    };
                    if !complete {
                        return Ok(());
                    }
                    self.fifo.pop_front();
                    self.refill_load();
                    self.flush()?;
                    if self.fifo.is_empty() && self.load_next >= self.options.records {
                        self.loading = false;
                        self.read_state = ReadState::Idle;
                        debug!("{}: loaded {} records", self.peer, self.options.records);
                    }
                }

                ReadState::WaitingForGet => {
                    let miss = if self.protocol.is_binary() {
                        match self.protocol.parse_binary(&mut self.rx)? {
                            Some(r) => match r.status {
                                s if s == ResponseStatus::NoError as u16 => false,
                                s if s == ResponseStatus::KeyNotFound as u16 => true,
                                s => {
                                    return Err(Error::new(
                                        ErrorKind::InvalidData,
                                        format!("{}: GET failed ({})", self.peer, s),
                                    ))
                                }
                            },
                            None => return Ok(()),
                        }
                    } else {
                        match self.protocol.parse_text_get(&mut self.rx)? {
                            Some(reply) => reply.hits == 0,
                            None => return Ok(()),
                        }
                    };
                    self.complete_head(now, miss as u64);
                }

                ReadState::WaitingForSet => {
                    let complete = if self.protocol.is_binary() {
                        match self.protocol.parse_binary(&mut self.rx)? {
                            Some(r) => {
                                if r.status != ResponseStatus::NoError as u16 {
                                    return Err(Error::new(
                                        ErrorKind::InvalidData,
                                        format!("{}: SET failed ({})", self.peer, r.status),
                                    ));
                                }
                                true
                            }
                            None => false,
                        }
                    } else {
                        self.protocol.parse_text_set(&mut self.rx)?.is_some()
                    };
                    if !complete {
                        return Ok(());
                    }
                    self.complete_head(now, 0);
                }

                ReadState::WaitingForGetqNoop => {
                    if self.protocol.is_binary() {
                        let resp = match self.protocol.parse_binary(&mut self.rx)? {
                            Some(r) => r,
                            None => return Ok(()),
                        };
                        if resp.opcode == Opcode::GetKQ as u8 {
                            self.batch_hits += 1;
                            continue;
                        }
                        if resp.opcode != Opcode::Noop as u8 {
                            return Err(Error::new(
                                ErrorKind::InvalidData,
                                format!(
                                    "{}: unexpected opcode {:#x} in getq batch",
                                    self.peer, resp.opcode
                                ),
                            ));
                        }
                        let batch = self.fifo.front().map(|p| p.batch).unwrap_or(0);
                        let misses = batch.saturating_sub(self.batch_hits) as u64;
                        self.batch_hits = 0;
                        self.complete_head(now, misses);
                    } else {
                        let reply = match self.protocol.parse_text_get(&mut self.rx)? {
                            Some(r) => r,
                            None => return Ok(()),
                        };
                        let batch = self.fifo.front().map(|p| p.batch).unwrap_or(0);
                        let misses = batch.saturating_sub(reply.hits) as u64;
                        self.complete_head(now, misses);
                    }
                }

                ReadState::InitRead | ReadState::Idle => {
                    if self.rx.data_size() > 0 {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            format!("{}: unsolicited data from server", self.peer),
                        ));
                    }
                    return Ok(());
                }
            }
        }
    }

    fn complete_head(&mut self, now: f64, misses: u64) {
        let head = match self.fifo.pop_front() {
            Some(h) => h,
            None => return,
        };
        let op = Operation {
            start_time: head.start,
            end_time: now,
            kind: head.kind,
        };
        match head.kind {
            OpKind::Get => {
                self.stats.get_sampler.sample(op);
                self.stats.gets += 1;
                self.stats.get_misses += misses;
            }
            OpKind::Set => {
                self.stats.set_sampler.sample(op);
                self.stats.sets += 1;
            }
            OpKind::OpQ => {
                self.stats.op_q_sampler.sample(op);
                self.stats.gets += head.batch as u64;
                self.stats.get_misses += misses;
            }
        }
        match self.fifo.front() {
            None => self.read_state = ReadState::Idle,
            Some(p) => self.read_state = waiting_state(p.kind),
        }
    }
}

fn waiting_state(kind: OpKind) -> ReadState {
    match kind {
        OpKind::Get => ReadState::WaitingForGet,
        OpKind::Set => ReadState::WaitingForSet,
        OpKind::OpQ => ReadState::WaitingForGetqNoop,
    }
}

fn connect_with_retry(addr: SocketAddr) -> io::Result<TcpStream> {
    for _ in 1..CONNECT_ATTEMPTS {
        match TcpStream::connect(addr) {
            Ok(s) => return Ok(s),
            Err(e) => {
                debug!("connect {} failed, retrying: {}", addr, e);
                thread::sleep(CONNECT_RETRY_DELAY);
            }
        }
    }
    TcpStream::connect(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use std::net::TcpListener;
    use std::time::Instant;

    fn test_options() -> Options {
        let mut o = Options::default();
        o.keysize = "8".to_string();
        o.valuesize = "8".to_string();
        o.iadist = "fixed".to_string();
        o.records = 10;
        o.update = 0.0;
        o
    }

    fn payload() -> Arc<Vec<u8>> {
        Arc::new(vec![0x5a; 4096])
    }

    /// Poll handle_read until the predicate holds or we give up.
    fn pump(conn: &mut Connection, now: f64, until: impl Fn(&Connection) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !until(conn) {
            assert!(Instant::now() < deadline, "timed out waiting on connection");
            conn.handle_read(now).unwrap();
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn synchronous_get_records_a_miss() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut req = vec![0u8; b"get 0AAAAAAA\r\n".len()];
            s.read_exact(&mut req).unwrap();
            s.write_all(b"END\r\n").unwrap();
            s
        });

        let mut opts = test_options();
        opts.depth = 1;
        opts.lambda = 0.0;
        let mut conn = Connection::new("127.0.0.1", port, &opts, payload(), false).unwrap();
        assert_eq!(conn.read_state, ReadState::Idle);

        conn.arm(0.0, 10.0);
        conn.drive_write_machine(0.0).unwrap();
        assert_eq!(conn.read_state, ReadState::WaitingForGet);
        assert_eq!(conn.fifo.len(), 1);

        pump(&mut conn, 0.5, |c| c.fifo.is_empty());
        let _ = server.join().unwrap();

        assert_eq!(conn.read_state, ReadState::Idle);
        assert_eq!(conn.stats.gets, 1);
        assert_eq!(conn.stats.get_misses, 1);
        assert_eq!(conn.stats.get_sampler.total(), 1);
        assert!((conn.stats.get_sampler.get_avg() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn closed_loop_fills_pipeline_to_depth() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _guard = thread::spawn(move || listener.accept().unwrap());

        let mut opts = test_options();
        opts.depth = 8;
        opts.lambda = 0.0;
        let mut conn = Connection::new("127.0.0.1", port, &opts, payload(), false).unwrap();

        conn.arm(0.0, 10.0);
        conn.drive_write_machine(0.0).unwrap();
        assert_eq!(conn.fifo.len(), 8);
        assert_eq!(conn.stats.sets, 0);

        // A second tick must not overfill.
        conn.drive_write_machine(1.0).unwrap();
        assert_eq!(conn.fifo.len(), 8);
    }

    #[test]
    fn full_pipeline_with_skip_drops_slots_and_advances() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _guard = thread::spawn(move || listener.accept().unwrap());

        let mut opts = test_options();
        opts.depth = 2;
        opts.skip = true;
        opts.lambda = 100.0; // fixed inter-arrival of 10 ms
        let mut conn = Connection::new("127.0.0.1", port, &opts, payload(), false).unwrap();

        conn.arm(0.0, 10.0);
        conn.drive_write_machine(0.0).unwrap();
        assert_eq!(conn.fifo.len(), 1);

        conn.drive_write_machine(0.055).unwrap();
        assert_eq!(conn.fifo.len(), 2);
        // Slots at 20, 30, 40, 50 ms were missed while the pipeline was full.
        assert_eq!(conn.stats.skips, 4);

        // Without further missed deadlines the skip count holds.
        conn.drive_write_machine(0.056).unwrap();
        assert_eq!(conn.stats.skips, 4);
    }

    #[test]
    fn full_pipeline_without_skip_backlogs() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _guard = thread::spawn(move || listener.accept().unwrap());

        let mut opts = test_options();
        opts.depth = 2;
        opts.skip = false;
        opts.lambda = 100.0;
        let mut conn = Connection::new("127.0.0.1", port, &opts, payload(), false).unwrap();

        conn.arm(0.0, 10.0);
        conn.drive_write_machine(0.055).unwrap();
        assert_eq!(conn.fifo.len(), 2);
        assert_eq!(conn.stats.skips, 0);
    }

    #[test]
    fn issuing_stops_at_window_end() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _guard = thread::spawn(move || listener.accept().unwrap());

        let mut opts = test_options();
        opts.depth = 4;
        opts.lambda = 0.0;
        let mut conn = Connection::new("127.0.0.1", port, &opts, payload(), false).unwrap();

        conn.arm(0.0, 1.0);
        conn.drive_write_machine(1.5).unwrap();
        assert_eq!(conn.fifo.len(), 0);
        assert!(!conn.check_exit_condition(0.5));
        assert!(conn.check_exit_condition(1.5));
    }

    #[test]
    fn loading_issues_every_record_and_returns_to_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let records = 10u64;
        let server = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let req_len = b"set 0AAAAAAA 0 0 8\r\n".len() + 8 + 2;
            let mut seen = 0;
            let mut buf = vec![0u8; req_len];
            while seen < records {
                s.read_exact(&mut buf).unwrap();
                s.write_all(b"STORED\r\n").unwrap();
                seen += 1;
            }
        });

        let mut opts = test_options();
        opts.depth = 4;
        opts.records = records;
        let mut conn = Connection::new("127.0.0.1", port, &opts, payload(), true).unwrap();

        conn.start_loading().unwrap();
        assert_eq!(conn.read_state, ReadState::Loading);
        assert!(conn.is_loading());

        let deadline = Instant::now() + Duration::from_secs(5);
        while conn.is_loading() {
            assert!(Instant::now() < deadline, "load did not finish");
            conn.handle_read(0.0).unwrap();
            conn.drive_write_machine(0.0).unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        server.join().unwrap();

        assert_eq!(conn.read_state, ReadState::Idle);
        // Load SETs are drained before measurement; reset discards them.
        conn.reset();
        assert_eq!(conn.stats.sets, 0);
    }

    #[test]
    fn non_loader_ignores_start_loading() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _guard = thread::spawn(move || listener.accept().unwrap());

        let mut conn =
            Connection::new("127.0.0.1", port, &test_options(), payload(), false).unwrap();
        conn.start_loading().unwrap();
        assert_eq!(conn.read_state, ReadState::Idle);
        assert!(!conn.is_loading());
    }

    #[test]
    fn set_payload_is_derived_from_the_key() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _guard = thread::spawn(move || {
            let a = listener.accept().unwrap();
            let b = listener.accept().unwrap();
            (a, b)
        });

        let opts = test_options();
        let pool: Arc<Vec<u8>> = Arc::new((0..4096u32).map(|i| i as u8).collect());
        let mut a = Connection::new("127.0.0.1", port, &opts, pool.clone(), false).unwrap();
        let mut b = Connection::new("127.0.0.1", port, &opts, pool, false).unwrap();

        // Two connections with independently seeded RNGs must emit the
        // same bytes for the same record.
        for key in [0u64, 7, 9] {
            a.tx.clear();
            b.tx.clear();
            a.emit_set(key);
            b.emit_set(key);
            assert_eq!(a.tx, b.tx, "key {}", key);
        }
    }

    #[test]
    fn fifo_matches_responses_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let req_len = b"get 0AAAAAAA\r\n".len() * 2;
            let mut buf = vec![0u8; req_len];
            s.read_exact(&mut buf).unwrap();
            // First reply is a hit, second a miss.
            s.write_all(b"VALUE k 0 2\r\nok\r\nEND\r\nEND\r\n").unwrap();
            s
        });

        let mut opts = test_options();
        opts.depth = 2;
        opts.lambda = 0.0;
        let mut conn = Connection::new("127.0.0.1", port, &opts, payload(), false).unwrap();
        conn.arm(0.0, 10.0);
        conn.drive_write_machine(0.0).unwrap();
        assert_eq!(conn.fifo.len(), 2);

        pump(&mut conn, 1.0, |c| c.stats.gets == 2);
        let _ = server.join().unwrap();
        assert_eq!(conn.stats.get_misses, 1);
        // Both ops started at the same instant; order preserved head-first.
        let samples = conn.stats.get_sampler.samples();
        assert_eq!(samples.len(), 2);
        assert!(samples[0].end_time <= samples[1].end_time);
    }
}
