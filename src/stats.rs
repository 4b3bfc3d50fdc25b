use std::io::{self, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::sampler::Sampler;

/// Per-connection aggregate; merged per worker, per process, per fleet.
#[derive(Clone, Debug, Default)]
pub struct ConnectionStats {
    pub get_sampler: Sampler,
    pub set_sampler: Sampler,
    pub op_q_sampler: Sampler,

    pub gets: u64,
    pub sets: u64,
    pub get_misses: u64,
    pub skips: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,

    pub start: f64,
    pub stop: f64,
}

impl ConnectionStats {
    pub fn new() -> ConnectionStats {
        ConnectionStats::default()
    }

    pub fn accumulate(&mut self, other: &ConnectionStats) {
        self.get_sampler.merge(&other.get_sampler);
        self.set_sampler.merge(&other.set_sampler);
        self.op_q_sampler.merge(&other.op_q_sampler);

        self.gets += other.gets;
        self.sets += other.sets;
        self.get_misses += other.get_misses;
        self.skips += other.skips;
        self.rx_bytes += other.rx_bytes;
        self.tx_bytes += other.tx_bytes;

        self.merge_window(other.start, other.stop);
    }

    pub fn accumulate_agent(&mut self, other: &AgentStats) {
        self.gets += other.gets;
        self.sets += other.sets;
        self.get_misses += other.get_misses;
        self.skips += other.skips;
        self.rx_bytes += other.rx_bytes;
        self.tx_bytes += other.tx_bytes;

        self.merge_window(other.start, other.stop);
    }

    fn merge_window(&mut self, start: f64, stop: f64) {
        if self.start == 0.0 || (start != 0.0 && start < self.start) {
            self.start = start;
        }
        if stop > self.stop {
            self.stop = stop;
        }
    }

    pub fn window(&self) -> f64 {
        self.stop - self.start
    }

    pub fn get_qps(&self) -> f64 {
        let window = self.window();
        if window <= 0.0 {
            return 0.0;
        }
        (self.gets + self.sets) as f64 / window
    }

    /// p-th percentile of GET latency in microseconds.
    pub fn get_nth(&self, p: f64) -> f64 {
        self.get_sampler.get_nth(p) * 1e6
    }

    /// Mean GET latency in microseconds.
    pub fn get_avg(&self) -> f64 {
        self.get_sampler.get_avg() * 1e6
    }

    pub fn print_header(newline: bool) {
        print!(
            "{:<7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7}",
            "#type", "avg", "std", "min", "5th", "10th", "90th", "95th", "99th"
        );
        if newline {
            println!();
        }
    }

    pub fn print_stats(&self, tag: &str, sampler: &Sampler, newline: bool) {
        if sampler.is_empty() {
            print!(
                "{:<7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7}",
                tag, 0, 0, 0, 0, 0, 0, 0, 0
            );
        } else {
            print!(
                "{:<7} {:>7.1} {:>7.1} {:>7.1} {:>7.1} {:>7.1} {:>7.1} {:>7.1} {:>7.1}",
                tag,
                sampler.get_avg() * 1e6,
                sampler.get_stddev() * 1e6,
                sampler.get_nth(0.0) * 1e6,
                sampler.get_nth(5.0) * 1e6,
                sampler.get_nth(10.0) * 1e6,
                sampler.get_nth(90.0) * 1e6,
                sampler.get_nth(95.0) * 1e6,
                sampler.get_nth(99.0) * 1e6
            );
        }
        if newline {
            println!();
        }
    }
}

/// The slice of ConnectionStats that travels between processes.  Latency
/// samples stay local: agents contribute to throughput and byte counters,
/// the master reports only its own latency distributions.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct AgentStats {
    pub gets: u64,
    pub sets: u64,
    pub get_misses: u64,
    pub skips: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub start: f64,
    pub stop: f64,
}

impl AgentStats {
    pub fn from_stats(stats: &ConnectionStats) -> AgentStats {
        AgentStats {
            gets: stats.gets,
            sets: stats.sets,
            get_misses: stats.get_misses,
            skips: stats.skips,
            rx_bytes: stats.rx_bytes,
            tx_bytes: stats.tx_bytes,
            start: stats.start,
            stop: stats.stop,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.gets).unwrap();
        buf.write_u64::<BigEndian>(self.sets).unwrap();
        buf.write_u64::<BigEndian>(self.get_misses).unwrap();
        buf.write_u64::<BigEndian>(self.skips).unwrap();
        buf.write_u64::<BigEndian>(self.rx_bytes).unwrap();
        buf.write_u64::<BigEndian>(self.tx_bytes).unwrap();
        buf.write_f64::<BigEndian>(self.start).unwrap();
        buf.write_f64::<BigEndian>(self.stop).unwrap();
    }

    pub fn decode<R: Read>(reader: &mut R) -> io::Result<AgentStats> {
        Ok(AgentStats {
            gets: reader.read_u64::<BigEndian>()?,
            sets: reader.read_u64::<BigEndian>()?,
            get_misses: reader.read_u64::<BigEndian>()?,
            skips: reader.read_u64::<BigEndian>()?,
            rx_bytes: reader.read_u64::<BigEndian>()?,
            tx_bytes: reader.read_u64::<BigEndian>()?,
            start: reader.read_f64::<BigEndian>()?,
            stop: reader.read_f64::<BigEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{OpKind, Operation};

    fn stats_with(gets: u64, sets: u64, start: f64, stop: f64) -> ConnectionStats {
        let mut s = ConnectionStats::new();
        s.gets = gets;
        s.sets = sets;
        s.start = start;
        s.stop = stop;
        s
    }

    #[test]
    fn counters_add_under_merge() {
        let mut a = stats_with(10, 2, 1.0, 11.0);
        a.rx_bytes = 100;
        let mut b = stats_with(5, 1, 0.5, 10.5);
        b.rx_bytes = 50;
        b.get_misses = 3;

        a.accumulate(&b);
        assert_eq!(a.gets, 15);
        assert_eq!(a.sets, 3);
        assert_eq!(a.get_misses, 3);
        assert_eq!(a.rx_bytes, 150);
        assert_eq!(a.start, 0.5);
        assert_eq!(a.stop, 11.0);
    }

    #[test]
    fn merge_is_commutative_on_counters() {
        let a = stats_with(7, 3, 2.0, 12.0);
        let b = stats_with(4, 9, 1.0, 13.0);

        let mut ab = a.clone();
        ab.accumulate(&b);
        let mut ba = b.clone();
        ba.accumulate(&a);

        assert_eq!(ab.gets, ba.gets);
        assert_eq!(ab.sets, ba.sets);
        assert_eq!(ab.start, ba.start);
        assert_eq!(ab.stop, ba.stop);
    }

    #[test]
    fn unset_window_does_not_poison_start() {
        let mut a = ConnectionStats::new();
        let b = stats_with(1, 0, 5.0, 6.0);
        a.accumulate(&b);
        assert_eq!(a.start, 5.0);
        assert_eq!(a.stop, 6.0);
    }

    #[test]
    fn qps_uses_window() {
        let s = stats_with(900, 100, 10.0, 20.0);
        assert!((s.get_qps() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn samplers_merge_with_stats() {
        let mut a = ConnectionStats::new();
        let mut b = ConnectionStats::new();
        b.get_sampler.sample(Operation {
            start_time: 1.0,
            end_time: 1.001,
            kind: OpKind::Get,
        });
        a.accumulate(&b);
        assert_eq!(a.get_sampler.total(), 1);
    }

    #[test]
    fn agent_stats_roundtrip() {
        let a = AgentStats {
            gets: 1,
            sets: 2,
            get_misses: 3,
            skips: 4,
            rx_bytes: 5,
            tx_bytes: 6,
            start: 7.5,
            stop: 8.25,
        };
        let mut buf = Vec::new();
        a.encode(&mut buf);
        assert_eq!(buf.len(), 64);
        let b = AgentStats::decode(&mut &buf[..]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn agent_stats_accumulate() {
        let mut s = stats_with(10, 0, 2.0, 4.0);
        let a = AgentStats {
            gets: 5,
            sets: 5,
            get_misses: 1,
            skips: 0,
            rx_bytes: 9,
            tx_bytes: 9,
            start: 1.0,
            stop: 5.0,
        };
        s.accumulate_agent(&a);
        assert_eq!(s.gets, 15);
        assert_eq!(s.start, 1.0);
        assert_eq!(s.stop, 5.0);
    }
}
