use std::io::{self, Error, ErrorKind, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Immutable per-run configuration.  The master broadcasts this value to
/// every agent during preparation; each process then derives its own
/// `lambda` from the negotiated `lambda_denom` and its local weight.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    pub connections: u32,
    pub blocking: bool,
    pub qps: u32,
    pub threads: u32,
    pub server_given: u32,
    pub roundrobin: bool,

    pub records: u64,

    pub binary: bool,
    pub sasl: bool,
    pub username: String,
    pub password: String,

    pub keysize: String,
    pub valuesize: String,
    pub update: f64,
    pub time: u32,
    pub warmup: u32,

    pub loadonly: bool,
    pub noload: bool,
    pub depth: u32,
    pub no_nodelay: bool,
    pub iadist: String,
    pub oob_thread: bool,
    pub skip: bool,
    pub moderate: bool,

    pub getq_freq: f64,
    pub getq_size: u32,

    pub lambda_denom: u32,
    pub lambda: f64,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            connections: 1,
            blocking: false,
            qps: 0,
            threads: 1,
            server_given: 1,
            roundrobin: false,
            records: 10_000,
            binary: false,
            sasl: false,
            username: String::new(),
            password: String::new(),
            keysize: "30".to_string(),
            valuesize: "200".to_string(),
            update: 0.0,
            time: 5,
            warmup: 0,
            loadonly: false,
            noload: false,
            depth: 1,
            no_nodelay: false,
            iadist: "exponential".to_string(),
            oob_thread: false,
            skip: false,
            moderate: false,
            getq_freq: 0.0,
            getq_size: 100,
            lambda_denom: 1,
            lambda: 0.0,
        }
    }
}

impl Options {
    /// This process's weighted connection count before any agent
    /// negotiation.  Round-robin mode opens one socket per (thread, server)
    /// pairing instead of a full cross product.
    pub fn local_connection_count(&self, lambda_mul: u32) -> u32 {
        let mut connections = self.connections
            * if self.roundrobin {
                self.server_given.max(self.threads)
            } else {
                self.server_given * self.threads
            };
        if connections < 1 {
            connections = 1;
        }
        if lambda_mul > 1 {
            connections *= lambda_mul;
        }
        if self.threads < 1 {
            connections = 0;
        }
        connections
    }

    pub fn recompute_lambda(&mut self, lambda_mul: u32) {
        self.lambda = if self.lambda_denom == 0 {
            0.0
        } else {
            f64::from(self.qps) / f64::from(self.lambda_denom) * f64::from(lambda_mul)
        };
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(self.connections).unwrap();
        write_bool(buf, self.blocking);
        buf.write_u32::<BigEndian>(self.qps).unwrap();
        buf.write_u32::<BigEndian>(self.threads).unwrap();
        buf.write_u32::<BigEndian>(self.server_given).unwrap();
        write_bool(buf, self.roundrobin);
        buf.write_u64::<BigEndian>(self.records).unwrap();
        write_bool(buf, self.binary);
        write_bool(buf, self.sasl);
        write_string(buf, &self.username);
        write_string(buf, &self.password);
        write_string(buf, &self.keysize);
        write_string(buf, &self.valuesize);
        buf.write_f64::<BigEndian>(self.update).unwrap();
        buf.write_u32::<BigEndian>(self.time).unwrap();
        buf.write_u32::<BigEndian>(self.warmup).unwrap();
        write_bool(buf, self.loadonly);
        write_bool(buf, self.noload);
        buf.write_u32::<BigEndian>(self.depth).unwrap();
        write_bool(buf, self.no_nodelay);
        write_string(buf, &self.iadist);
        write_bool(buf, self.oob_thread);
        write_bool(buf, self.skip);
        write_bool(buf, self.moderate);
        buf.write_f64::<BigEndian>(self.getq_freq).unwrap();
        buf.write_u32::<BigEndian>(self.getq_size).unwrap();
        buf.write_u32::<BigEndian>(self.lambda_denom).unwrap();
        buf.write_f64::<BigEndian>(self.lambda).unwrap();
    }

    pub fn decode<R: Read>(reader: &mut R) -> io::Result<Options> {
        Ok(Options {
            connections: reader.read_u32::<BigEndian>()?,
            blocking: read_bool(reader)?,
            qps: reader.read_u32::<BigEndian>()?,
            threads: reader.read_u32::<BigEndian>()?,
            server_given: reader.read_u32::<BigEndian>()?,
            roundrobin: read_bool(reader)?,
            records: reader.read_u64::<BigEndian>()?,
            binary: read_bool(reader)?,
            sasl: read_bool(reader)?,
            username: read_string(reader)?,
            password: read_string(reader)?,
            keysize: read_string(reader)?,
            valuesize: read_string(reader)?,
            update: reader.read_f64::<BigEndian>()?,
            time: reader.read_u32::<BigEndian>()?,
            warmup: reader.read_u32::<BigEndian>()?,
            loadonly: read_bool(reader)?,
            noload: read_bool(reader)?,
            depth: reader.read_u32::<BigEndian>()?,
            no_nodelay: read_bool(reader)?,
            iadist: read_string(reader)?,
            oob_thread: read_bool(reader)?,
            skip: read_bool(reader)?,
            moderate: read_bool(reader)?,
            getq_freq: reader.read_f64::<BigEndian>()?,
            getq_size: reader.read_u32::<BigEndian>()?,
            lambda_denom: reader.read_u32::<BigEndian>()?,
            lambda: reader.read_f64::<BigEndian>()?,
        })
    }
}

fn write_bool(buf: &mut Vec<u8>, v: bool) {
    buf.write_u8(v as u8).unwrap();
}

fn read_bool<R: Read>(reader: &mut R) -> io::Result<bool> {
    match reader.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        v => Err(Error::new(
            ErrorKind::InvalidData,
            format!("bad bool byte in options blob: {}", v),
        )),
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    assert!(s.len() <= u16::MAX as usize);
    buf.write_u16::<BigEndian>(s.len() as u16).unwrap();
    buf.extend_from_slice(s.as_bytes());
}

fn read_string<R: Read>(reader: &mut R) -> io::Result<String> {
    let len = reader.read_u16::<BigEndian>()? as usize;
    let mut bytes = vec![0; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| Error::new(ErrorKind::InvalidData, "non-utf8 string in options blob"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip() {
        let mut o = Options::default();
        o.connections = 4;
        o.qps = 30_000;
        o.threads = 8;
        o.server_given = 3;
        o.roundrobin = true;
        o.records = 1_000_000;
        o.binary = true;
        o.sasl = true;
        o.username = "bench".to_string();
        o.password = "hunter2".to_string();
        o.keysize = "uniform:20:40".to_string();
        o.update = 0.1;
        o.time = 30;
        o.warmup = 5;
        o.depth = 16;
        o.iadist = "fixed".to_string();
        o.skip = true;
        o.getq_freq = 0.05;
        o.getq_size = 10;
        o.lambda_denom = 96;
        o.recompute_lambda(1);

        let mut buf = Vec::new();
        o.encode(&mut buf);
        let back = Options::decode(&mut &buf[..]).unwrap();
        assert_eq!(o, back);
    }

    #[test]
    fn truncated_blob_is_an_error() {
        let mut buf = Vec::new();
        Options::default().encode(&mut buf);
        buf.truncate(buf.len() - 3);
        assert!(Options::decode(&mut &buf[..]).is_err());
    }

    #[test]
    fn connection_count_cross_product() {
        let mut o = Options::default();
        o.connections = 4;
        o.threads = 2;
        o.server_given = 3;
        assert_eq!(o.local_connection_count(1), 24);
    }

    #[test]
    fn connection_count_roundrobin() {
        let mut o = Options::default();
        o.connections = 2;
        o.threads = 2;
        o.server_given = 5;
        o.roundrobin = true;
        assert_eq!(o.local_connection_count(1), 10);

        o.threads = 8;
        assert_eq!(o.local_connection_count(1), 16);
    }

    #[test]
    fn lambda_mul_weights_the_count() {
        let mut o = Options::default();
        o.connections = 1;
        o.threads = 1;
        o.server_given = 1;
        assert_eq!(o.local_connection_count(2), 2);
    }

    #[test]
    fn lambda_split_example() {
        // master: 1 thread x 1 conn x 1 server (weight 1);
        // agent: same shape with lambda_mul = 2 => denom 3.
        let mut master = Options::default();
        master.qps = 3000;
        master.lambda_denom = master.local_connection_count(1) + 2;
        master.recompute_lambda(1);
        assert!((master.lambda - 1000.0).abs() < 1e-9);

        let mut agent = master.clone();
        agent.recompute_lambda(2);
        assert!((agent.lambda - 2000.0).abs() < 1e-9);
    }
}
