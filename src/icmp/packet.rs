use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::icmp::IcmpError;

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_HEADER_LEN: usize = 8;
pub const TIMESTAMP_LEN: usize = 8;

const FILLER: u8 = 0x61;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpPacket {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl IcmpPacket {
    pub fn new_echo_request(identifier: u16, sequence: u16, payload: Vec<u8>) -> Self {
        let mut packet = Self {
            icmp_type: ICMP_ECHO_REQUEST,
            code: 0,
            checksum: 0,
            identifier,
            sequence,
            payload,
        };

        packet.calculate_checksum();
        packet
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, IcmpError> {
        if data.len() < ICMP_HEADER_LEN {
            return Err(IcmpError::Malformed("message shorter than the ICMP header"));
        }

        let mut cursor = Cursor::new(data);
        let short = |_| IcmpError::Malformed("truncated ICMP header");
        let icmp_type = cursor.read_u8().map_err(short)?;
        let code = cursor.read_u8().map_err(short)?;
        let checksum = cursor.read_u16::<BigEndian>().map_err(short)?;
        let identifier = cursor.read_u16::<BigEndian>().map_err(short)?;
        let sequence = cursor.read_u16::<BigEndian>().map_err(short)?;

        let mut payload = Vec::with_capacity(data.len() - ICMP_HEADER_LEN);
        cursor
            .read_to_end(&mut payload)
            .map_err(|_| IcmpError::Malformed("unreadable payload"))?;

        Ok(Self {
            icmp_type,
            code,
            checksum,
            identifier,
            sequence,
            payload,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; ICMP_HEADER_LEN];
        bytes[0] = self.icmp_type;
        bytes[1] = self.code;
        BigEndian::write_u16(&mut bytes[2..4], self.checksum);
        BigEndian::write_u16(&mut bytes[4..6], self.identifier);
        BigEndian::write_u16(&mut bytes[6..8], self.sequence);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn calculate_checksum(&mut self) {
        self.checksum = 0;
        let bytes = self.to_bytes();
        self.checksum = compute_checksum(&bytes);
    }

    pub fn verify_checksum(&self) -> bool {
        compute_checksum(&self.to_bytes()) == 0
    }

    pub fn is_echo_reply(&self) -> bool {
        self.icmp_type == ICMP_ECHO_REPLY
    }
}

/// RFC 1071 internet checksum.
pub fn compute_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += BigEndian::read_u16(word) as u32;
    }

    // Odd trailing byte is padded with zero
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }

    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Builds an Echo Request whose payload is `size` bytes: the send timestamp
/// (big-endian nanoseconds since the epoch) followed by filler.
pub fn encode_echo_request(
    identifier: u16,
    sequence: u16,
    size: usize,
    now: SystemTime,
) -> Result<Vec<u8>, IcmpError> {
    if size < TIMESTAMP_LEN {
        return Err(IcmpError::PacketTooSmall(size));
    }

    let nanos = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64;
    let mut payload = Vec::with_capacity(size);
    payload
        .write_u64::<BigEndian>(nanos)
        .map_err(|_| IcmpError::Malformed("cannot write timestamp"))?;
    payload.resize(size, FILLER);

    Ok(IcmpPacket::new_echo_request(identifier, sequence, payload).to_bytes())
}

/// Parses `data` as an Echo Reply to the request identified by
/// `identifier`/`sequence` and returns its payload.
pub fn decode_echo_reply(
    identifier: u16,
    sequence: u16,
    data: &[u8],
) -> Result<Vec<u8>, IcmpError> {
    let packet = IcmpPacket::from_bytes(data)?;

    if !packet.verify_checksum() {
        return Err(IcmpError::BadChecksum);
    }
    if !packet.is_echo_reply() {
        return Err(IcmpError::UnexpectedType(packet.icmp_type));
    }
    if packet.identifier != identifier || packet.sequence != sequence {
        return Err(IcmpError::IdentityMismatch {
            identifier: packet.identifier,
            sequence: packet.sequence,
        });
    }

    Ok(packet.payload)
}

/// Reads the send timestamp written by [`encode_echo_request`].
pub fn extract_timestamp(payload: &[u8]) -> Result<SystemTime, IcmpError> {
    if payload.len() < TIMESTAMP_LEN {
        return Err(IcmpError::Malformed("payload shorter than the timestamp"));
    }
    let nanos = BigEndian::read_u64(&payload[..TIMESTAMP_LEN]);
    Ok(UNIX_EPOCH + Duration::from_nanos(nanos))
}

#[cfg(test)]
pub(crate) fn echo_reply_for(request: &[u8]) -> Vec<u8> {
    let mut packet = IcmpPacket::from_bytes(request).unwrap();
    packet.icmp_type = ICMP_ECHO_REPLY;
    packet.calculate_checksum();
    packet.to_bytes()
}
