//! # Guacamole Protocol
//!
//! The minimal slice of the Guacamole text protocol the gateway needs to
//! talk to guacd: instruction framing, the connect handshake, and the
//! internal-opcode filter.
//!
//! An instruction is `LEN.VALUE,LEN.VALUE,...;` where LEN counts
//! *characters*, not bytes; the first element is the opcode. Example:
//! `6.select,3.vnc;`. Everything between the gateway and guacd is this
//! framing; browser clients exchange the same frames untouched except
//! for the internal set below.

use std::io;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::protocol::WindowSize;

// ─── Internal Opcodes ───────────────────────────────────────────

/// Broker-housekeeping opcodes that must never cross the client
/// boundary in either direction: the reserved empty opcode plus the
/// handshake-control vocabulary. Stream opcodes like `size` stay
/// forwardable; clients send them mid-session to resize.
pub const INTERNAL_OPCODES: &[&str] = &["", "select", "args", "connect", "ready"];

/// Whether a raw frame carries an internal opcode (or no opcode at all).
pub fn is_internal(frame: &str) -> bool {
    match opcode_of(frame) {
        Some(op) => INTERNAL_OPCODES.contains(&op),
        None => true,
    }
}

// ─── Instruction Codec ──────────────────────────────────────────

/// One decoded Guacamole instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: String,
    pub args: Vec<String>,
}

impl Instruction {
    pub fn new(opcode: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            opcode: opcode.into(),
            args,
        }
    }

    /// Renders the wire form, lengths counted in characters.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (i, elem) in std::iter::once(&self.opcode).chain(self.args.iter()).enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&elem.chars().count().to_string());
            out.push('.');
            out.push_str(elem);
        }
        out.push(';');
        out
    }
}

/// Extracts the opcode of a raw frame without a full parse.
pub fn opcode_of(frame: &str) -> Option<&str> {
    let (len_str, rest) = frame.split_once('.')?;
    let len: usize = len_str.parse().ok()?;
    let end = if len == 0 {
        0
    } else {
        let (i, c) = rest.char_indices().nth(len - 1)?;
        i + c.len_utf8()
    };
    match rest[end..].chars().next() {
        Some(',') | Some(';') => Some(&rest[..end]),
        _ => None,
    }
}

/// Fully decodes a raw frame.
pub fn parse(frame: &str) -> Option<Instruction> {
    let mut elems = Vec::new();
    let mut rest = frame;
    loop {
        let (len_str, tail) = rest.split_once('.')?;
        let len: usize = len_str.parse().ok()?;
        let end = if len == 0 {
            0
        } else {
            let (i, c) = tail.char_indices().nth(len - 1)?;
            i + c.len_utf8()
        };
        elems.push(tail[..end].to_string());
        match tail[end..].chars().next() {
            Some(',') => rest = &tail[end + 1..],
            Some(';') => break,
            _ => return None,
        }
    }
    let opcode = elems.remove(0);
    Some(Instruction { opcode, args: elems })
}

/// Finds the byte length of the first complete instruction in `s`.
///
/// `Ok(None)` means more data is needed; `Err` means the stream is not
/// speaking the protocol.
fn frame_end(s: &str) -> io::Result<Option<usize>> {
    let malformed = || io::Error::new(io::ErrorKind::InvalidData, "malformed guacamole frame");
    let mut it = s.char_indices();
    loop {
        let mut len: usize = 0;
        let mut digits = false;
        loop {
            match it.next() {
                Some((_, c)) if c.is_ascii_digit() => {
                    len = len * 10 + (c as usize - '0' as usize);
                    digits = true;
                }
                Some((_, '.')) if digits => break,
                Some(_) => return Err(malformed()),
                None => return Ok(None),
            }
        }
        for _ in 0..len {
            if it.next().is_none() {
                return Ok(None);
            }
        }
        match it.next() {
            Some((_, ',')) => continue,
            Some((i, ';')) => return Ok(Some(i + 1)),
            Some(_) => return Err(malformed()),
            None => return Ok(None),
        }
    }
}

// ─── Frame Reader ───────────────────────────────────────────────

/// Incremental reader yielding one raw instruction frame at a time.
///
/// Reads may end mid-instruction or even mid-character; the buffer keeps
/// whatever is incomplete until the next read.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8192),
        }
    }

    /// Returns the next frame, or `None` on a clean end of stream.
    pub async fn read_frame(&mut self) -> io::Result<Option<String>> {
        loop {
            let valid_len = match std::str::from_utf8(&self.buf) {
                Ok(_) => self.buf.len(),
                Err(e) => e.valid_up_to(),
            };
            if valid_len > 0 {
                if let Ok(text) = std::str::from_utf8(&self.buf[..valid_len]) {
                    if let Some(end) = frame_end(text)? {
                        let frame = text[..end].to_string();
                        self.buf.advance(end);
                        return Ok(Some(frame));
                    }
                }
            }

            let mut chunk = [0u8; 8192];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "guacd closed mid-instruction",
                ));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

// ─── Tunnel ─────────────────────────────────────────────────────

/// Parameters for opening a tunnel through guacd.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// `rdp` or `vnc`.
    pub protocol: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub size: WindowSize,
    /// Existing connection id to join instead of opening a new
    /// connection (monitor mode).
    pub join: Option<String>,
}

impl ConnectParams {
    /// Answers one argument name advertised by guacd's `args`.
    fn value_for(&self, name: &str) -> String {
        match name {
            "hostname" => self.hostname.clone(),
            "port" => self.port.to_string(),
            "username" => self.username.clone(),
            "password" => self.password.clone(),
            "ignore-cert" => "true".to_string(),
            "read-only" if self.join.is_some() => "true".to_string(),
            _ => String::new(),
        }
    }
}

/// An established guacd tunnel, ready to pump instructions.
pub struct GuacTunnel {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Tunnel-assigned connection id, used to rejoin for monitoring.
    pub connection_id: String,
}

impl GuacTunnel {
    /// Dials guacd and runs the connect handshake:
    /// `select` → `args` → `size`/`audio`/`video`/`image` → `connect` →
    /// `ready`.
    pub async fn open(addr: &str, params: &ConnectParams) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| GatewayError::ConnectServer(format!("guacd {addr}: {e}")))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = write_half;

        let select_target = params
            .join
            .clone()
            .unwrap_or_else(|| params.protocol.clone());
        send(&mut writer, &Instruction::new("select", vec![select_target])).await?;

        let args = expect(&mut reader, "args").await?;
        debug!("guacd advertises {} connection arguments", args.args.len());

        let size = params.size;
        send(
            &mut writer,
            &Instruction::new(
                "size",
                vec![
                    size.width.to_string(),
                    size.height.to_string(),
                    size.dpi.to_string(),
                ],
            ),
        )
        .await?;
        send(&mut writer, &Instruction::new("audio", vec![])).await?;
        send(&mut writer, &Instruction::new("video", vec![])).await?;
        send(&mut writer, &Instruction::new("image", vec![])).await?;

        // The first advertised "argument" of recent brokers is the
        // protocol version, echoed back verbatim.
        let values = args
            .args
            .iter()
            .map(|name| {
                if name.starts_with("VERSION") {
                    name.clone()
                } else {
                    params.value_for(name)
                }
            })
            .collect();
        send(&mut writer, &Instruction::new("connect", values)).await?;

        let ready = expect(&mut reader, "ready").await?;
        let connection_id = ready.args.first().cloned().unwrap_or_default();
        Ok(Self {
            reader,
            writer,
            connection_id,
        })
    }

    /// Next raw instruction frame from guacd; `None` on end of stream.
    pub async fn read_frame(&mut self) -> io::Result<Option<String>> {
        self.reader.read_frame().await
    }

    /// Forwards a raw frame (already in wire form) to guacd.
    pub async fn write_frame(&mut self, frame: &str) -> io::Result<()> {
        self.writer.write_all(frame.as_bytes()).await
    }
}

async fn send(writer: &mut OwnedWriteHalf, instr: &Instruction) -> Result<()> {
    writer
        .write_all(instr.encode().as_bytes())
        .await
        .map_err(|e| GatewayError::ConnectServer(format!("guacd handshake write: {e}")))
}

/// Reads frames until `opcode` arrives, surfacing broker errors.
async fn expect(reader: &mut FrameReader<OwnedReadHalf>, opcode: &str) -> Result<Instruction> {
    loop {
        let frame = reader
            .read_frame()
            .await
            .map_err(|e| GatewayError::ConnectServer(format!("guacd handshake read: {e}")))?
            .ok_or_else(|| {
                GatewayError::ConnectServer("guacd closed during handshake".to_string())
            })?;
        let Some(instr) = parse(&frame) else {
            return Err(GatewayError::ConnectServer(
                "unparsable guacd handshake frame".to_string(),
            ));
        };
        if instr.opcode == opcode {
            return Ok(instr);
        }
        if instr.opcode == "error" {
            let message = instr.args.first().cloned().unwrap_or_default();
            return Err(GatewayError::ConnectServer(format!("guacd: {message}")));
        }
        // Anything else (nop and friends) is skipped during handshake.
    }
}

/// Connection parameters keyed by protocol string `rdp:<port>` /
/// `vnc:<port>`, resolved against asset and account records.
pub fn split_protocol(protocol: &str) -> Option<(String, u16)> {
    let (name, port) = match protocol.split_once(':') {
        Some((name, port)) => (name, port.parse().ok()?),
        None => (protocol, default_port(protocol)?),
    };
    if name != "rdp" && name != "vnc" {
        return None;
    }
    Some((name.to_string(), port))
}

fn default_port(protocol: &str) -> Option<u16> {
    match protocol {
        "rdp" => Some(3389),
        "vnc" => Some(5900),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_counts_characters_not_bytes() {
        let instr = Instruction::new("select", vec!["vnc".to_string()]);
        assert_eq!(instr.encode(), "6.select,3.vnc;");
        let unicode = Instruction::new("name", vec!["héllo".to_string()]);
        assert_eq!(unicode.encode(), "4.name,5.héllo;");
    }

    #[test]
    fn parse_round_trips_encode() {
        let instr = Instruction::new(
            "connect",
            vec!["VERSION_1_1_0".to_string(), "".to_string(), "中文".to_string()],
        );
        assert_eq!(parse(&instr.encode()).unwrap(), instr);
    }

    #[test]
    fn opcode_of_reads_only_the_head() {
        assert_eq!(opcode_of("4.sync,8.12345678;"), Some("sync"));
        assert_eq!(opcode_of("0.,4.ping;"), Some(""));
        assert_eq!(opcode_of("garbage"), None);
    }

    #[test]
    fn internal_opcodes_are_flagged_in_both_shapes() {
        assert!(is_internal("6.select,3.vnc;"));
        assert!(is_internal("5.ready,5.$conn;"));
        assert!(is_internal("0.,4.ping;"));
        assert!(!is_internal("4.sync,8.12345678;"));
        assert!(!is_internal("3.key,2.65,1.1;"));
        // Unparsable frames must never be forwarded either.
        assert!(is_internal("not-a-frame"));
    }

    #[test]
    fn frame_end_waits_for_the_terminator() {
        assert_eq!(frame_end("6.select,3.vn").unwrap(), None);
        assert_eq!(frame_end("6.select,3.vnc;tail").unwrap(), Some(15));
        assert!(frame_end("x.select;").is_err());
    }

    #[test]
    fn split_protocol_parses_port_suffixes() {
        assert_eq!(split_protocol("rdp:13389"), Some(("rdp".to_string(), 13389)));
        assert_eq!(split_protocol("vnc"), Some(("vnc".to_string(), 5900)));
        assert_eq!(split_protocol("ssh"), None);
        assert_eq!(split_protocol("rdp:junk"), None);
    }

    #[tokio::test]
    async fn frame_reader_reassembles_split_instructions() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        tokio::io::AsyncWriteExt::write_all(&mut client, b"4.sync,8.123")
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, "45678;3.img,1.中;".as_bytes())
            .await
            .unwrap();
        drop(client);

        assert_eq!(
            reader.read_frame().await.unwrap().unwrap(),
            "4.sync,8.12345678;"
        );
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), "3.img,1.中;");
        assert!(reader.read_frame().await.unwrap().is_none());
    }
}
