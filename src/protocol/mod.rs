use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const DEFAULT_MAX_FRAME_SIZE: usize = 10240;
const FRAME_HEADER_LEN: usize = 4;

/// Body key carrying the heartbeat send timestamp (Unix nanoseconds).
pub const KEY_VALUE: &str = "value";
/// Body key carrying the heartbeat companion field.
pub const KEY_SERIAL: &str = "serial";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode packet: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode packet: {0}")]
    Decode(#[source] bincode::Error),

    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unknown message type {0:#06x}")]
    UnknownType(u16),

    #[error("heartbeat is missing integer field `{0}`")]
    MissingTimestamp(&'static str),

    #[error("frame i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Body(BTreeMap<String, Value>);

impl Body {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.0.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn int_value_of(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(Value::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn float_value_of(&self, key: &str) -> Option<f64> {
        match self.get(key) {
            Some(Value::Float(v)) => Some(*v),
            Some(Value::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Heartbeat = 0x0001,
    Acknowledge = 0x0002,
}

impl MessageType {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(Self::Heartbeat),
            0x0002 => Some(Self::Acknowledge),
            _ => None,
        }
    }
}

/// Wire-level unit: a type code plus a key/value body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub kind: u16,
    pub body: Body,
}

impl Packet {
    pub fn new(kind: MessageType, body: Body) -> Self {
        Self {
            kind: kind.code(),
            body,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(ProtocolError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(ProtocolError::Decode)
    }

    /// Encodes the packet with its length prefix, ready to be written as-is.
    pub fn to_frame(&self, max_frame_size: usize) -> Result<Vec<u8>, ProtocolError> {
        let payload = self.to_bytes()?;
        if payload.len() > max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                len: payload.len(),
                max: max_frame_size,
            });
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }
}

/// Reads one length-prefixed payload. `Ok(None)` means the peer closed the
/// stream cleanly between frames.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: max_frame_size,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// A packet classified into one of the kinds this client understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Heartbeat(Heartbeat),
    Acknowledge(Body),
}

impl TryFrom<Packet> for Message {
    type Error = ProtocolError;

    fn try_from(packet: Packet) -> Result<Self, Self::Error> {
        match MessageType::from_code(packet.kind) {
            Some(MessageType::Heartbeat) => Heartbeat::from_body(&packet.body).map(Message::Heartbeat),
            Some(MessageType::Acknowledge) => Ok(Message::Acknowledge(packet.body)),
            None => Err(ProtocolError::UnknownType(packet.kind)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Heartbeat {
    pub sent_at_nanos: i64,
    pub serial: f64,
}

impl Heartbeat {
    /// A heartbeat stamped with the current wall clock.
    pub fn now() -> Self {
        Self {
            sent_at_nanos: unix_nanos(),
            serial: rand::random::<f64>() * 10_000.0,
        }
    }

    fn from_body(body: &Body) -> Result<Self, ProtocolError> {
        let sent_at_nanos = body
            .int_value_of(KEY_VALUE)
            .ok_or(ProtocolError::MissingTimestamp(KEY_VALUE))?;
        Ok(Self {
            sent_at_nanos,
            serial: body.float_value_of(KEY_SERIAL).unwrap_or_default(),
        })
    }

    pub fn to_packet(&self) -> Packet {
        let body = Body::new()
            .with(KEY_VALUE, Value::Int(self.sent_at_nanos))
            .with(KEY_SERIAL, Value::Float(self.serial));
        Packet::new(MessageType::Heartbeat, body)
    }

    /// Round trip measured against `now_nanos`; clock steps backwards read as zero.
    pub fn latency_at(&self, now_nanos: i64) -> Duration {
        u64::try_from(now_nanos.saturating_sub(self.sent_at_nanos))
            .map(Duration::from_nanos)
            .unwrap_or(Duration::ZERO)
    }

    pub fn latency(&self) -> Duration {
        self.latency_at(unix_nanos())
    }
}

pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
