use std::io;
use std::mem;

use log::warn;

use crate::connection::{Connection, ReadState};
use crate::Clock;

/// Bound on any single poll so exit conditions are re-checked even when no
/// socket turns ready; also guards the drain phases against an all-idle set
/// parking the loop.
pub const DRAIN_POLL_MS: i32 = 4000;
const WINDOW_POLL_CAP_MS: i32 = 1000;

/// One poll pass over a worker's connections: wait for readiness (bounded
/// by `timeout_ms`), then service every ready socket.  The timestamp fed to
/// the read path is taken once, after the poll returns.  Returns the
/// indices of connections that failed, in ascending order.
pub fn poll_connections(
    conns: &mut Vec<Connection>,
    timeout_ms: i32,
    clock: &Clock,
) -> Vec<(usize, io::Error)> {
    let mut fds: Vec<libc::pollfd> = conns
        .iter()
        .map(|c| libc::pollfd {
            fd: c.fd(),
            events: libc::POLLIN | if c.has_tx_pending() { libc::POLLOUT } else { 0 },
            revents: 0,
        })
        .collect();

    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc <= 0 {
        // Timeout, or EINTR; either way the caller re-evaluates.
        return Vec::new();
    }

    let now = clock.now();
    let mut failed = Vec::new();
    for (i, fd) in fds.iter().enumerate() {
        if fd.revents == 0 {
            continue;
        }
        let conn = &mut conns[i];
        let mut result = Ok(());
        if fd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0 {
            result = conn.handle_read(now);
        }
        if result.is_ok() && fd.revents & libc::POLLOUT != 0 {
            result = conn.flush();
        }
        if let Err(e) = result {
            failed.push((i, e));
        }
    }
    failed
}

/// Run the loop until every connection is IDLE.  Used for the setup, SASL,
/// and load phases.  The IDLE predicate is checked before each poll, so a
/// set that is already idle never enters the kernel.  Any failure here is
/// fatal to the run: a dead connection during setup would skew the
/// negotiated rate, and a dead lead connection would leave the DB
/// half-loaded.
pub fn drain_until_idle(conns: &mut Vec<Connection>, clock: &Clock) -> io::Result<()> {
    loop {
        if conns
            .iter()
            .all(|c| c.read_state == ReadState::Idle)
        {
            return Ok(());
        }

        let failed = poll_connections(conns, DRAIN_POLL_MS, clock);
        if let Some((i, e)) = failed.into_iter().next() {
            return Err(io::Error::new(
                e.kind(),
                format!("{}: {}", conns[i].peer(), e),
            ));
        }

        let now = clock.now();
        for conn in conns.iter_mut() {
            conn.drive_write_machine(now)?;
        }
    }
}

/// Drive a warmup or measurement window until every connection's exit
/// condition holds.  Per-connection failures here tear the connection down
/// and discard its stats; the run continues with the survivors.  Returns
/// the cached timestamp at loop exit.
pub fn run_window(conns: &mut Vec<Connection>, clock: &Clock, start: f64, window: f64) -> f64 {
    let blocking = conns.first().map_or(false, |c| c.options.blocking);

    for conn in conns.iter_mut() {
        conn.arm(start, window);
    }
    // Kick the write machines into motion.
    let now = clock.now();
    reap(conns, |conn| conn.drive_write_machine(now));

    loop {
        let now = clock.now();
        if conns.iter().all(|c| c.check_exit_condition(now)) {
            return now;
        }

        let timeout = if blocking {
            window_timeout_ms(conns, now, start + window)
        } else {
            0
        };

        let failed = poll_connections(conns, timeout, clock);
        for (i, e) in failed.into_iter().rev() {
            warn!("{}: connection failed, dropping: {}", conns[i].peer(), e);
            conns.remove(i);
        }
        if conns.is_empty() {
            return clock.now();
        }

        let now = clock.now();
        reap(conns, |conn| conn.drive_write_machine(now));
    }
}

fn reap<F>(conns: &mut Vec<Connection>, mut f: F)
where
    F: FnMut(&mut Connection) -> io::Result<()>,
{
    let mut i = 0;
    while i < conns.len() {
        match f(&mut conns[i]) {
            Ok(()) => i += 1,
            Err(e) => {
                warn!("{}: connection failed, dropping: {}", conns[i].peer(), e);
                conns.remove(i);
            }
        }
    }
}

/// Poll timeout for the blocking loop: the nearest scheduled issue instant
/// or the window end, whichever comes first.
fn window_timeout_ms(conns: &[Connection], now: f64, window_end: f64) -> i32 {
    let mut next = window_end;
    for conn in conns {
        if let Some(t) = conn.next_wakeup() {
            if t < next {
                next = t;
            }
        }
    }
    let dt_ms = ((next - now).max(0.0) * 1000.0).ceil() as i64;
    dt_ms.min(WINDOW_POLL_CAP_MS as i64) as i32
}

/// CPUs in this process's inherited affinity mask, ascending.
pub fn inherited_cpus() -> Vec<usize> {
    let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
    let rc = unsafe { libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) };
    if rc != 0 {
        warn!(
            "sched_getaffinity failed: {}",
            io::Error::last_os_error()
        );
        return Vec::new();
    }
    (0..libc::CPU_SETSIZE as usize)
        .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &set) })
        .collect()
}

/// Pin the calling thread to one CPU.
pub fn pin_to_cpu(cpu: usize) -> io::Result<()> {
    let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
    }
    let rc = unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
