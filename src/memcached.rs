use std::io::{self, Error, ErrorKind};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::distribution::SizeGenerator;
use crate::Buffer;

#[allow(dead_code)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Noop = 0x0a,
    GetKQ = 0x0d,
    SaslAuth = 0x21,
}

enum Magic {
    Request = 0x80,
    Response = 0x81,
}

#[allow(dead_code)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ResponseStatus {
    NoError = 0x00,
    KeyNotFound = 0x01,
    KeyExists = 0x02,
    ValueTooLarge = 0x03,
    InvalidArguments = 0x04,
    AuthError = 0x20,
}

#[derive(Debug, Default)]
pub struct PacketHeader {
    pub magic: u8,
    pub opcode: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    pub vbucket_id_or_status: u16,
    pub total_body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl PacketHeader {
    pub const SIZE: usize = 24;

    fn write<W: io::Write>(self, writer: &mut W) -> io::Result<()> {
        writer.write_u8(self.magic)?;
        writer.write_u8(self.opcode)?;
        writer.write_u16::<BigEndian>(self.key_length)?;
        writer.write_u8(self.extras_length)?;
        writer.write_u8(self.data_type)?;
        writer.write_u16::<BigEndian>(self.vbucket_id_or_status)?;
        writer.write_u32::<BigEndian>(self.total_body_length)?;
        writer.write_u32::<BigEndian>(self.opaque)?;
        writer.write_u64::<BigEndian>(self.cas)?;
        Ok(())
    }

    fn read<R: io::Read>(reader: &mut R) -> io::Result<PacketHeader> {
        let magic = reader.read_u8()?;
        if magic != Magic::Response as u8 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("bad magic number in response header: {:#x}", magic),
            ));
        }
        Ok(PacketHeader {
            magic,
            opcode: reader.read_u8()?,
            key_length: reader.read_u16::<BigEndian>()?,
            extras_length: reader.read_u8()?,
            data_type: reader.read_u8()?,
            vbucket_id_or_status: reader.read_u16::<BigEndian>()?,
            total_body_length: reader.read_u32::<BigEndian>()?,
            opaque: reader.read_u32::<BigEndian>()?,
            cas: reader.read_u64::<BigEndian>()?,
        })
    }
}

/// One complete binary-protocol response, header only; the body has already
/// been consumed from the input buffer when this is returned.
#[derive(Copy, Clone, Debug)]
pub struct BinaryResponse {
    pub opcode: u8,
    pub status: u16,
}

/// One complete text-protocol retrieval reply (everything up to `END`).
#[derive(Copy, Clone, Debug)]
pub struct TextGetReply {
    pub hits: u32,
}

#[inline(always)]
fn write_key(buf: &mut Vec<u8>, key: u64, key_size: usize) {
    let mut pushed = 0;
    let mut k = key;
    loop {
        buf.push(48 + (k % 10) as u8);
        k /= 10;
        pushed += 1;
        if k == 0 {
            break;
        }
    }
    for _ in pushed..key_size {
        buf.push(b'A');
    }
}

/// Request encoder / response decoder for one connection.  Emits exactly one
/// request per operation; yields exactly one logical response per
/// head-of-FIFO request.
#[derive(Clone, Debug)]
pub struct Protocol {
    binary: bool,
    keysize: SizeGenerator,
}

impl Protocol {
    pub fn new(binary: bool, keysize: SizeGenerator) -> Protocol {
        Protocol { binary, keysize }
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    fn key_bytes(&self, key: u64) -> Vec<u8> {
        let size = self.keysize.generate(key);
        let mut k = Vec::with_capacity(size);
        write_key(&mut k, key, size);
        k
    }

    pub fn get_request(&self, key: u64, buf: &mut Vec<u8>) {
        let k = self.key_bytes(key);
        if self.binary {
            PacketHeader {
                magic: Magic::Request as u8,
                opcode: Opcode::Get as u8,
                key_length: k.len() as u16,
                total_body_length: k.len() as u32,
                ..Default::default()
            }
            .write(buf)
            .unwrap();
            buf.extend_from_slice(&k);
        } else {
            buf.extend_from_slice(b"get ");
            buf.extend_from_slice(&k);
            buf.extend_from_slice(b"\r\n");
        }
    }

    pub fn set_request(&self, key: u64, value: &[u8], buf: &mut Vec<u8>) {
        let k = self.key_bytes(key);
        if self.binary {
            PacketHeader {
                magic: Magic::Request as u8,
                opcode: Opcode::Set as u8,
                key_length: k.len() as u16,
                extras_length: 8,
                total_body_length: (8 + k.len() + value.len()) as u32,
                ..Default::default()
            }
            .write(buf)
            .unwrap();
            // Flags and expiration, both zero.
            buf.write_u64::<BigEndian>(0).unwrap();
            buf.extend_from_slice(&k);
            buf.extend_from_slice(value);
        } else {
            buf.extend_from_slice(b"set ");
            buf.extend_from_slice(&k);
            buf.extend_from_slice(format!(" 0 0 {}\r\n", value.len()).as_bytes());
            buf.extend_from_slice(value);
            buf.extend_from_slice(b"\r\n");
        }
    }

    /// A quiet multi-get batch: `n` GETKQ requests terminated by a NOOP in
    /// binary mode, a single multi-key `get` in text mode.  Either way the
    /// batch occupies one pipeline slot.
    pub fn getq_request(&self, keys: &[u64], buf: &mut Vec<u8>) {
        if self.binary {
            for &key in keys {
                let k = self.key_bytes(key);
                PacketHeader {
                    magic: Magic::Request as u8,
                    opcode: Opcode::GetKQ as u8,
                    key_length: k.len() as u16,
                    total_body_length: k.len() as u32,
                    ..Default::default()
                }
                .write(buf)
                .unwrap();
                buf.extend_from_slice(&k);
            }
            PacketHeader {
                magic: Magic::Request as u8,
                opcode: Opcode::Noop as u8,
                ..Default::default()
            }
            .write(buf)
            .unwrap();
        } else {
            buf.extend_from_slice(b"get");
            for &key in keys {
                buf.push(b' ');
                buf.extend_from_slice(&self.key_bytes(key));
            }
            buf.extend_from_slice(b"\r\n");
        }
    }

    /// SASL PLAIN authentication (binary protocol only).
    pub fn sasl_request(&self, username: &str, password: &str, buf: &mut Vec<u8>) {
        let mech = b"PLAIN";
        let body_len = mech.len() + 2 + username.len() + password.len();
        PacketHeader {
            magic: Magic::Request as u8,
            opcode: Opcode::SaslAuth as u8,
            key_length: mech.len() as u16,
            total_body_length: body_len as u32,
            ..Default::default()
        }
        .write(buf)
        .unwrap();
        buf.extend_from_slice(mech);
        buf.push(0);
        buf.extend_from_slice(username.as_bytes());
        buf.push(0);
        buf.extend_from_slice(password.as_bytes());
    }

    /// Pop one complete binary response (header + body) off the input
    /// buffer.  Returns None until a whole response is available.
    pub fn parse_binary(&self, buf: &mut Buffer) -> io::Result<Option<BinaryResponse>> {
        let data = buf.get_data();
        if data.len() < PacketHeader::SIZE {
            return Ok(None);
        }
        let hdr = PacketHeader::read(&mut &data[..PacketHeader::SIZE])?;
        let total = PacketHeader::SIZE + hdr.total_body_length as usize;
        if data.len() < total {
            return Ok(None);
        }
        buf.pull_data(total);
        Ok(Some(BinaryResponse {
            opcode: hdr.opcode,
            status: hdr.vbucket_id_or_status,
        }))
    }

    /// Pop one complete text retrieval reply (`VALUE`* then `END`).
    /// Returns None until the terminating `END` line has arrived; nothing is
    /// consumed until the whole reply is present.
    pub fn parse_text_get(&self, buf: &mut Buffer) -> io::Result<Option<TextGetReply>> {
        let (consumed, hits) = {
            let data = buf.get_data();
            let mut pos = 0;
            let mut hits = 0u32;

            loop {
                let eol = match find_crlf(data, pos) {
                    Some(i) => i,
                    None => return Ok(None),
                };
                let line = &data[pos..eol];

                if line == b"END" {
                    break (eol + 2, hits);
                }
                if line.starts_with(b"VALUE ") {
                    let nbytes = value_line_bytes(line)?;
                    let next = eol + 2 + nbytes + 2;
                    if data.len() < next {
                        return Ok(None);
                    }
                    if &data[next - 2..next] != b"\r\n" {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            "text protocol: data block not CRLF-terminated",
                        ));
                    }
                    hits += 1;
                    pos = next;
                    continue;
                }
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "text protocol: unexpected reply line: {}",
                        String::from_utf8_lossy(line)
                    ),
                ));
            }
        };
        buf.pull_data(consumed);
        Ok(Some(TextGetReply { hits }))
    }

    /// Pop one complete text storage reply.  Ok(Some(true)) means STORED.
    pub fn parse_text_set(&self, buf: &mut Buffer) -> io::Result<Option<bool>> {
        let data = buf.get_data();
        let eol = match find_crlf(data, 0) {
            Some(i) => i,
            None => return Ok(None),
        };
        let stored = match &data[..eol] {
            b"STORED" => true,
            b"NOT_STORED" | b"EXISTS" | b"NOT_FOUND" => false,
            line => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "text protocol: unexpected storage reply: {}",
                        String::from_utf8_lossy(line)
                    ),
                ))
            }
        };
        buf.pull_data(eol + 2);
        Ok(Some(stored))
    }
}

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    if data.len() < 2 {
        return None;
    }
    (from..data.len() - 1).find(|&i| data[i] == b'\r' && data[i + 1] == b'\n')
}

/// Byte count from a `VALUE <key> <flags> <bytes> [<cas>]` line.
fn value_line_bytes(line: &[u8]) -> io::Result<usize> {
    let text = std::str::from_utf8(line)
        .map_err(|_| Error::new(ErrorKind::InvalidData, "text protocol: non-ascii VALUE line"))?;
    let nbytes = text
        .split_whitespace()
        .nth(3)
        .and_then(|f| f.parse::<usize>().ok());
    match nbytes {
        Some(n) => Ok(n),
        None => Err(Error::new(
            ErrorKind::InvalidData,
            format!("text protocol: malformed VALUE line: {}", text),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proto(binary: bool) -> Protocol {
        Protocol::new(binary, SizeGenerator::Fixed(8))
    }

    fn buffer_with(bytes: &[u8]) -> Buffer {
        let mut buf = Buffer::with_capacity(4096);
        buf.get_empty_buf()[..bytes.len()].copy_from_slice(bytes);
        buf.push_data(bytes.len());
        buf
    }

    fn response_bytes(opcode: Opcode, status: u16, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        PacketHeader {
            magic: Magic::Response as u8,
            opcode: opcode as u8,
            vbucket_id_or_status: status,
            total_body_length: body.len() as u32,
            ..Default::default()
        }
        .write(&mut out)
        .unwrap();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn binary_get_request_shape() {
        let mut out = Vec::new();
        proto(true).get_request(7, &mut out);
        assert_eq!(out.len(), PacketHeader::SIZE + 8);
        assert_eq!(out[0], 0x80);
        assert_eq!(out[1], Opcode::Get as u8);
        // key = "7" padded with 'A' to 8 bytes
        assert_eq!(&out[PacketHeader::SIZE..], b"7AAAAAAA");
    }

    #[test]
    fn binary_set_request_carries_extras_and_value() {
        let mut out = Vec::new();
        proto(true).set_request(12, b"xyz", &mut out);
        assert_eq!(out[1], Opcode::Set as u8);
        assert_eq!(out[4], 8); // extras length
        let body_len = u32::from_be_bytes([out[8], out[9], out[10], out[11]]);
        assert_eq!(body_len as usize, 8 + 8 + 3);
        assert_eq!(&out[out.len() - 3..], b"xyz");
    }

    #[test]
    fn binary_response_parses_when_complete() {
        let bytes = response_bytes(Opcode::Get, ResponseStatus::NoError as u16, b"12345");
        let p = proto(true);

        // Header alone is not enough.
        let mut partial = buffer_with(&bytes[..PacketHeader::SIZE]);
        assert!(p.parse_binary(&mut partial).unwrap().is_none());

        let mut full = buffer_with(&bytes);
        let resp = p.parse_binary(&mut full).unwrap().unwrap();
        assert_eq!(resp.opcode, Opcode::Get as u8);
        assert_eq!(resp.status, ResponseStatus::NoError as u16);
        assert_eq!(full.data_size(), 0);
    }

    #[test]
    fn binary_bad_magic_is_fatal() {
        let mut bytes = response_bytes(Opcode::Get, 0, b"");
        bytes[0] = 0x80; // request magic on a response
        let mut buf = buffer_with(&bytes);
        assert!(proto(true).parse_binary(&mut buf).is_err());
    }

    #[test]
    fn getq_batch_ends_with_noop() {
        let mut out = Vec::new();
        proto(true).getq_request(&[1, 2, 3], &mut out);
        // Last header on the wire must be the NOOP.
        let tail = &out[out.len() - PacketHeader::SIZE..];
        assert_eq!(tail[1], Opcode::Noop as u8);
    }

    #[test]
    fn sasl_request_is_plain() {
        let mut out = Vec::new();
        proto(true).sasl_request("user", "pass", &mut out);
        assert_eq!(out[1], Opcode::SaslAuth as u8);
        assert_eq!(&out[PacketHeader::SIZE..PacketHeader::SIZE + 5], b"PLAIN");
        assert_eq!(&out[PacketHeader::SIZE + 5..], b"\0user\0pass");
    }

    #[test]
    fn text_get_hit_and_miss() {
        let p = proto(false);

        let mut hit = buffer_with(b"VALUE 7AAAAAAA 0 3\r\nabc\r\nEND\r\n");
        let reply = p.parse_text_get(&mut hit).unwrap().unwrap();
        assert_eq!(reply.hits, 1);
        assert_eq!(hit.data_size(), 0);

        let mut miss = buffer_with(b"END\r\n");
        let reply = p.parse_text_get(&mut miss).unwrap().unwrap();
        assert_eq!(reply.hits, 0);
    }

    #[test]
    fn text_get_waits_for_complete_reply() {
        let p = proto(false);
        let full = b"VALUE k 0 5\r\nhello\r\nEND\r\n";
        for cut in 1..full.len() {
            let mut buf = buffer_with(&full[..cut]);
            assert!(
                p.parse_text_get(&mut buf).unwrap().is_none(),
                "cut at {} should be incomplete",
                cut
            );
            assert_eq!(buf.data_size(), cut, "partial parse must not consume");
        }
    }

    #[test]
    fn text_multiget_counts_hits() {
        let p = proto(false);
        let mut buf = buffer_with(b"VALUE a 0 1\r\nx\r\nVALUE b 0 2\r\nyy\r\nEND\r\n");
        let reply = p.parse_text_get(&mut buf).unwrap().unwrap();
        assert_eq!(reply.hits, 2);
    }

    #[test]
    fn text_value_containing_crlf_is_skipped_whole() {
        let p = proto(false);
        let mut buf = buffer_with(b"VALUE k 0 9\r\nab\r\ncd\r\nX\r\nEND\r\n");
        let reply = p.parse_text_get(&mut buf).unwrap().unwrap();
        assert_eq!(reply.hits, 1);
        assert_eq!(buf.data_size(), 0);
    }

    #[test]
    fn text_set_replies() {
        let p = proto(false);
        let mut buf = buffer_with(b"STORED\r\n");
        assert_eq!(p.parse_text_set(&mut buf).unwrap(), Some(true));

        let mut buf = buffer_with(b"NOT_STORED\r\n");
        assert_eq!(p.parse_text_set(&mut buf).unwrap(), Some(false));

        let mut buf = buffer_with(b"STO");
        assert_eq!(p.parse_text_set(&mut buf).unwrap(), None);

        let mut buf = buffer_with(b"SERVER_ERROR out of memory\r\n");
        assert!(p.parse_text_set(&mut buf).is_err());
    }

    #[test]
    fn text_request_shapes() {
        let p = proto(false);
        let mut get = Vec::new();
        p.get_request(3, &mut get);
        assert_eq!(&get[..], b"get 3AAAAAAA\r\n");

        let mut set = Vec::new();
        p.set_request(3, b"hello", &mut set);
        assert_eq!(&set[..], b"set 3AAAAAAA 0 0 5\r\nhello\r\n");

        let mut multi = Vec::new();
        p.getq_request(&[1, 2], &mut multi);
        assert_eq!(&multi[..], b"get 1AAAAAAA 2AAAAAAA\r\n");
    }
}
