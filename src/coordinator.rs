//! Master/agent coordination.
//!
//! The master holds one request socket per agent and always speaks first;
//! every message it sends is answered before the next is sent.  The
//! schedule is:
//!
//! PREPARATION, per agent: Options blob -> num; server strings -> "ack"
//! each; lambda_denom -> "THANKS".
//!
//! SYNC, per barrier point: "sync_req" -> "sync", "proceed" -> "ack".
//! The master cannot release itself until every live agent has answered.
//!
//! FINISH: "stats" -> AgentStats blob.
//!
//! Any timed-out or failed exchange removes the agent from the active set
//! and the run continues with reduced capacity; lambda_denom is not
//! rebalanced mid-run, so the aggregate falls short by the failed agent's
//! share.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};

use crate::driver::RunConfig;
use crate::options::Options;
use crate::stats::{AgentStats, ConnectionStats};

pub const TOKEN_SYNC_REQ: &str = "sync_req";
pub const TOKEN_SYNC: &str = "sync";
pub const TOKEN_PROCEED: &str = "proceed";
pub const TOKEN_ACK: &str = "ack";
pub const TOKEN_THANKS: &str = "THANKS";
pub const TOKEN_STATS: &str = "stats";
/// Sentinel a recv resolves to on timeout or socket failure.
pub const FAIL_RECV: &str = "FAIL-RECV";

const MAX_FRAME: usize = 16 * 1024 * 1024;
const LINGER_SECS: i32 = 10;
/// Head start for agents to open their memcached connections, so the
/// master is never the very first set of connections.
const AGENT_HEAD_START: Duration = Duration::from_millis(1500);

struct AgentPeer {
    stream: TcpStream,
    addr: String,
}

enum Role {
    Master { peers: Vec<AgentPeer> },
    Agent { stream: TcpStream },
}

pub struct Coordinator {
    role: Role,
}

impl Coordinator {
    /// Master side: connect to every agent's coordination port.  A
    /// connection refusal here is a configuration error surfaced to the
    /// caller, not an agent failure.
    pub fn connect_master(
        agents: &[String],
        port: u16,
        timeout: Option<Duration>,
    ) -> io::Result<Coordinator> {
        let mut peers = Vec::new();
        for host in agents {
            let addr = format!("{}:{}", host, port);
            let stream = TcpStream::connect((host.as_str(), port)).map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!(
                        "agent not available at {}; is the agent process running? ({})",
                        addr, e
                    ),
                )
            })?;
            configure_peer(&stream, timeout)?;
            debug!("connected to agent at {}", addr);
            peers.push(AgentPeer { stream, addr });
        }
        Ok(Coordinator {
            role: Role::Master { peers },
        })
    }

    /// Agent side: wrap the accepted master connection.
    pub fn agent(stream: TcpStream) -> Coordinator {
        Coordinator {
            role: Role::Agent { stream },
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self.role, Role::Master { .. })
    }

    pub fn peers_alive(&self) -> usize {
        match &self.role {
            Role::Master { peers } => peers.len(),
            Role::Agent { .. } => 1,
        }
    }

    /// PREPARATION: broadcast options, gather per-agent weighted thread
    /// counts, compute and broadcast lambda_denom, and derive this
    /// process's lambda.  Master only.
    pub fn prep(
        &mut self,
        options: &mut Options,
        servers: &[String],
        cfg: &RunConfig,
    ) -> io::Result<()> {
        let peers = match &mut self.role {
            Role::Master { peers } => peers,
            Role::Agent { .. } => return Ok(()),
        };

        let mut sum = options.lambda_denom;
        if let Some(mc) = cfg.measure_connections {
            sum = mc * options.server_given * options.threads;
        }
        let master_sum = sum;
        if let Some(mq) = cfg.measure_qps {
            // The agents carry the load; the master only measures.
            sum = 0;
            if options.qps > 0 {
                options.qps = options.qps.saturating_sub(mq);
            }
        }

        let mut blob = Vec::new();
        options.encode(&mut blob);

        let mut i = 0;
        while i < peers.len() {
            let num = match prep_one(&mut peers[i], &blob, servers) {
                Ok(num) => num,
                Err(e) => {
                    warn!(
                        "agent failure detected, skipping agent {}: {}",
                        peers[i].addr, e
                    );
                    peers.remove(i);
                    continue;
                }
            };
            sum += options.connections
                * if options.roundrobin {
                    (servers.len() as u32).max(num)
                } else {
                    servers.len() as u32 * num
                };
            i += 1;
        }

        options.lambda_denom = sum;
        options.recompute_lambda(cfg.lambda_mul);
        debug!("lambda_denom = {}", sum);

        if let Some(mq) = cfg.measure_qps {
            let master_lambda = f64::from(mq) / f64::from(master_sum.max(1));
            if options.qps > 0 && master_lambda > options.lambda {
                warn!(
                    "measurement lambda ({:.1}) exceeds fleet lambda ({:.1})",
                    master_lambda, options.lambda
                );
            }
            options.lambda = master_lambda;
        }
        if let Some(md) = cfg.measure_depth {
            options.depth = md;
        }

        let mut denom = [0u8; 4];
        BigEndian::write_u32(&mut denom, sum);
        let mut i = 0;
        while i < peers.len() {
            let ok = send_frame(&mut peers[i].stream, &denom).is_ok()
                && recv_token(&mut peers[i].stream) == TOKEN_THANKS;
            if !ok {
                warn!(
                    "agent failure detected, skipping agent {}",
                    peers[i].addr
                );
                peers.remove(i);
                continue;
            }
            i += 1;
        }

        if peers.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "every agent failed during preparation",
            ));
        }

        debug!("master sleeps {:?} before connecting", AGENT_HEAD_START);
        thread::sleep(AGENT_HEAD_START);
        Ok(())
    }

    /// One barrier point.  Returns the number of synchronization errors
    /// observed; failed agents are removed from the active set.
    pub fn sync(&mut self) -> usize {
        match &mut self.role {
            Role::Master { peers } => {
                let mut errors = 0;

                for peer in peers.iter_mut() {
                    if let Err(e) = send_token(&mut peer.stream, TOKEN_SYNC_REQ) {
                        warn!("{}: sync_req send failed: {}", peer.addr, e);
                        errors += 1;
                    }
                }

                errors += collect_replies(peers, TOKEN_SYNC);

                for peer in peers.iter_mut() {
                    if let Err(e) = send_token(&mut peer.stream, TOKEN_PROCEED) {
                        warn!("{}: proceed send failed: {}", peer.addr, e);
                        errors += 1;
                    }
                }

                errors += collect_replies(peers, TOKEN_ACK);
                errors
            }
            Role::Agent { stream } => {
                let mut errors = 0;
                let rep = recv_token(stream);
                if rep != TOKEN_SYNC_REQ {
                    warn!("out of sync: expected sync_req, got {:?}", rep);
                    errors += 1;
                }
                let _ = send_token(stream, TOKEN_SYNC);
                let rep = recv_token(stream);
                if rep != TOKEN_PROCEED {
                    warn!("out of sync: expected proceed, got {:?}", rep);
                    errors += 1;
                }
                let _ = send_token(stream, TOKEN_ACK);
                errors
            }
        }
    }

    /// FINISH: collect AgentStats from every surviving agent and fold them
    /// into the master's totals.
    pub fn finish(&mut self, stats: &mut ConnectionStats) {
        let peers = match &mut self.role {
            Role::Master { peers } => peers,
            Role::Agent { .. } => return,
        };

        let mut i = 0;
        while i < peers.len() {
            let collected = (|| -> io::Result<AgentStats> {
                send_token(&mut peers[i].stream, TOKEN_STATS)?;
                let blob = recv_frame(&mut peers[i].stream)?;
                AgentStats::decode(&mut &blob[..])
            })();
            match collected {
                Ok(agent_stats) => {
                    debug!(
                        "agent {}: {} gets, {} sets",
                        peers[i].addr, agent_stats.gets, agent_stats.sets
                    );
                    stats.accumulate_agent(&agent_stats);
                    i += 1;
                }
                Err(e) => {
                    warn!(
                        "agent failure detected, dropping stats from {}: {}",
                        peers[i].addr, e
                    );
                    peers.remove(i);
                }
            }
        }
    }
}

fn prep_one(peer: &mut AgentPeer, options_blob: &[u8], servers: &[String]) -> io::Result<u32> {
    send_frame(&mut peer.stream, options_blob)?;
    let rep = recv_frame(&mut peer.stream)?;
    if rep.len() != 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad thread-count reply length: {}", rep.len()),
        ));
    }
    let num = BigEndian::read_u32(&rep);

    for server in servers {
        send_frame(&mut peer.stream, server.as_bytes())?;
        let ack = recv_token(&mut peer.stream);
        if ack != TOKEN_ACK {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected ack for server string, got {:?}", ack),
            ));
        }
    }
    Ok(num)
}

/// Receive one reply from every peer, removing peers whose socket failed
/// and counting every mismatched token as an error.
fn collect_replies(peers: &mut Vec<AgentPeer>, expected: &str) -> usize {
    let mut errors = 0;
    let mut i = 0;
    while i < peers.len() {
        let rep = recv_token(&mut peers[i].stream);
        if rep != expected {
            warn!(
                "out of sync: agent {} sent {:?}, expected {:?}",
                peers[i].addr, rep, expected
            );
            errors += 1;
            if rep == FAIL_RECV {
                warn!(
                    "agent failure detected, skipping agent {}",
                    peers[i].addr
                );
                peers.remove(i);
                continue;
            }
        }
        i += 1;
    }
    errors
}

/// Frame = u32 big-endian length, then payload.
pub fn send_frame(stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    let mut hdr = [0u8; 4];
    BigEndian::write_u32(&mut hdr, payload.len() as u32);
    stream.write_all(&hdr)?;
    stream.write_all(payload)
}

pub fn recv_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut hdr = [0u8; 4];
    stream.read_exact(&mut hdr)?;
    let len = BigEndian::read_u32(&hdr) as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("oversized frame: {} bytes", len),
        ));
    }
    let mut payload = vec![0; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn send_token(stream: &mut TcpStream, token: &str) -> io::Result<()> {
    send_frame(stream, token.as_bytes())
}

/// Receive a control token; timeouts and socket failures resolve to the
/// FAIL-RECV sentinel so callers can treat them uniformly.
pub fn recv_token(stream: &mut TcpStream) -> String {
    match recv_frame(stream) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => FAIL_RECV.to_string(),
    }
}

pub fn send_u32(stream: &mut TcpStream, v: u32) -> io::Result<()> {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, v);
    send_frame(stream, &buf)
}

pub fn recv_u32(stream: &mut TcpStream) -> io::Result<u32> {
    let rep = recv_frame(stream)?;
    if rep.len() != 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad integer frame length: {}", rep.len()),
        ));
    }
    Ok(BigEndian::read_u32(&rep))
}

/// Socket settings shared by both ends: no Nagle delay on the tiny control
/// frames, symmetric send/recv timeouts, and a finite LINGER so process
/// exit never hangs on a stuck peer.
pub fn configure_peer(stream: &TcpStream, timeout: Option<Duration>) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;
    set_linger(stream, LINGER_SECS)
}

fn set_linger(stream: &TcpStream, secs: i32) -> io::Result<()> {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: secs,
    };
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const libc::linger as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Agent coordination listener with a backlog sized for the whole fleet's
/// reconnect burst.
pub fn agent_listener(port: u16, backlog: i32) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    // Re-listen on the bound socket to widen the kernel backlog past the
    // standard library's default.
    let rc = unsafe { libc::listen(listener.as_raw_fd(), backlog) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(listener)
}

pub fn agent_backlog(connections: u32, threads: u32) -> i32 {
    let total = 2 * (connections as i32 + 1) * (threads as i32 + 1);
    total.max(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn frame_roundtrip() {
        let (mut a, mut b) = pair();
        send_frame(&mut a, b"hello agents").unwrap();
        assert_eq!(recv_frame(&mut b).unwrap(), b"hello agents");

        send_u32(&mut b, 0xdead_beef).unwrap();
        assert_eq!(recv_u32(&mut a).unwrap(), 0xdead_beef);
    }

    #[test]
    fn token_timeout_yields_sentinel() {
        let (mut a, _b) = pair();
        a.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        assert_eq!(recv_token(&mut a), FAIL_RECV);
    }

    #[test]
    fn options_blob_over_the_wire() {
        let (mut a, mut b) = pair();
        let mut opts = Options::default();
        opts.qps = 12_000;
        opts.server_given = 2;
        let mut blob = Vec::new();
        opts.encode(&mut blob);
        send_frame(&mut a, &blob).unwrap();
        let received = recv_frame(&mut b).unwrap();
        assert_eq!(Options::decode(&mut &received[..]).unwrap(), opts);
    }

    #[test]
    fn backlog_floor_is_100() {
        assert_eq!(agent_backlog(1, 1), 100);
        assert_eq!(agent_backlog(50, 8), 2 * 51 * 9);
    }

    /// Scenario from the protocol design: master with one connection and
    /// weight 1, one agent with one thread and weight 2, 3000 QPS in
    /// aggregate.  lambda_denom must come out as 3, the master's lambda as
    /// 1000, the agent's as 2000.
    #[test]
    fn prep_negotiates_lambda_denom() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let agent_thread = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            // Options blob.
            let blob = recv_frame(&mut s).unwrap();
            let mut opts = Options::decode(&mut &blob[..]).unwrap();
            // num = threads(1) * lambda_mul(2)
            send_u32(&mut s, 2).unwrap();
            // Server strings.
            for _ in 0..opts.server_given {
                let server = recv_frame(&mut s).unwrap();
                assert!(!server.is_empty());
                send_token(&mut s, TOKEN_ACK).unwrap();
            }
            // lambda_denom.
            opts.lambda_denom = recv_u32(&mut s).unwrap();
            send_token(&mut s, TOKEN_THANKS).unwrap();
            opts.recompute_lambda(2);
            (opts.lambda_denom, opts.lambda)
        });

        let mut coord =
            Coordinator::connect_master(&["127.0.0.1".to_string()], port, None).unwrap();

        let mut opts = Options::default();
        opts.qps = 3000;
        opts.connections = 1;
        opts.threads = 1;
        opts.server_given = 1;
        opts.lambda_denom = opts.local_connection_count(1);
        let cfg = RunConfig {
            lambda_mul: 1,
            ..Default::default()
        };
        let servers = vec!["127.0.0.1:11211".to_string()];
        coord.prep(&mut opts, &servers, &cfg).unwrap();

        let (agent_denom, agent_lambda) = agent_thread.join().unwrap();
        assert_eq!(opts.lambda_denom, 3);
        assert_eq!(agent_denom, 3);
        assert!((opts.lambda - 1000.0).abs() < 1e-9);
        assert!((agent_lambda - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn sync_barrier_exchanges_tokens() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let agent_thread = thread::spawn(move || {
            let (s, _) = listener.accept().unwrap();
            let mut agent = Coordinator::agent(s);
            agent.sync()
        });

        let mut master =
            Coordinator::connect_master(&["127.0.0.1".to_string()], port, None).unwrap();
        assert_eq!(master.sync(), 0);
        assert_eq!(agent_thread.join().unwrap(), 0);
        assert_eq!(master.peers_alive(), 1);
    }

    #[test]
    fn dead_agent_is_removed_during_sync() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = thread::spawn(move || {
            let (s, _) = listener.accept().unwrap();
            drop(s); // agent dies immediately
        });

        let mut master = Coordinator::connect_master(
            &["127.0.0.1".to_string()],
            port,
            Some(Duration::from_millis(100)),
        )
        .unwrap();
        accept.join().unwrap();

        let errors = master.sync();
        assert!(errors > 0);
        assert_eq!(master.peers_alive(), 0);
    }

    #[test]
    fn finish_collects_agent_stats() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let agent_thread = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            assert_eq!(recv_token(&mut s), TOKEN_STATS);
            let stats = AgentStats {
                gets: 1000,
                sets: 10,
                get_misses: 5,
                skips: 0,
                rx_bytes: 4096,
                tx_bytes: 2048,
                start: 1.0,
                stop: 11.0,
            };
            let mut blob = Vec::new();
            stats.encode(&mut blob);
            send_frame(&mut s, &blob).unwrap();
        });

        let mut master =
            Coordinator::connect_master(&["127.0.0.1".to_string()], port, None).unwrap();
        let mut stats = ConnectionStats::new();
        stats.gets = 500;
        stats.start = 0.5;
        stats.stop = 10.5;
        master.finish(&mut stats);
        agent_thread.join().unwrap();

        assert_eq!(stats.gets, 1500);
        assert_eq!(stats.sets, 10);
        assert_eq!(stats.start, 0.5);
        assert_eq!(stats.stop, 11.0);
    }
}
