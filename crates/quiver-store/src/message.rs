//! Commit log record codec.
//!
//! Every record is self-describing: a big-endian fixed header, the body,
//! the topic and a properties block. The header carries the record's own
//! physical offset, which lets recovery tell a real record from stale or
//! zeroed bytes.

use crate::hash::tags_hash_code;
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};

pub const MESSAGE_MAGIC_CODE: u32 = 0xDAA3_20A7;
pub const BLANK_MAGIC_CODE: u32 = 0xCBD4_3194;

pub const PROPERTY_TAGS: &str = "TAGS";
pub const PROPERTY_KEYS: &str = "KEYS";

const NAME_VALUE_SEPARATOR: char = '\u{1}';
const PROPERTY_SEPARATOR: char = '\u{2}';

/// Bytes before the variable-length body
pub const FIXED_HEADER_SIZE: usize = 84;
/// Smallest well-formed record: fixed header plus three empty length prefixes
pub const MIN_RECORD_SIZE: usize = FIXED_HEADER_SIZE + 4 + 1 + 2;
/// Size of the end-of-segment blank marker
pub const BLANK_MARKER_SIZE: usize = 8;

pub const MAX_TOPIC_LEN: usize = u8::MAX as usize;
pub const MAX_PROPERTIES_LEN: usize = i16::MAX as usize;

const QUEUE_OFFSET_POS: usize = 20;
const PHYSICAL_OFFSET_POS: usize = 28;
const STORE_TIMESTAMP_POS: usize = 56;

/// A message as submitted by a producer, before the store assigns offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub topic: String,
    pub queue_id: u32,
    pub flag: u32,
    pub sys_flag: u32,
    pub body: Bytes,
    pub properties: BTreeMap<String, String>,
    pub born_timestamp: i64,
    pub born_host: SocketAddrV4,
    pub reconsume_times: u32,
    pub prepared_transaction_offset: u64,
}

impl NewMessage {
    pub fn new(topic: impl Into<String>, queue_id: u32, body: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            queue_id,
            flag: 0,
            sys_flag: 0,
            body: body.into(),
            properties: BTreeMap::new(),
            born_timestamp: chrono::Utc::now().timestamp_millis(),
            born_host: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            reconsume_times: 0,
            prepared_transaction_offset: 0,
        }
    }

    pub fn with_tags(self, tags: impl Into<String>) -> Self {
        self.with_property(PROPERTY_TAGS, tags)
    }

    /// Space-separated message keys, each indexed for `query_by_key`
    pub fn with_keys(self, keys: impl Into<String>) -> Self {
        self.with_property(PROPERTY_KEYS, keys)
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_born_host(mut self, host: SocketAddrV4) -> Self {
        self.born_host = host;
        self
    }

    pub fn tags(&self) -> Option<&str> {
        self.properties.get(PROPERTY_TAGS).map(String::as_str)
    }

    /// Serialize with zeroed offsets; [`EncodedMessage::stamp`] fills them in
    /// once the commit log has assigned a position.
    pub fn encode(&self, store_host: SocketAddrV4) -> Result<EncodedMessage> {
        validate_topic(&self.topic)?;
        let properties = encode_properties(&self.properties)?;
        if properties.len() > MAX_PROPERTIES_LEN {
            return Err(Error::InvalidMessage(format!(
                "properties length {} exceeds {}",
                properties.len(),
                MAX_PROPERTIES_LEN
            )));
        }

        let total = FIXED_HEADER_SIZE
            + 4
            + self.body.len()
            + 1
            + self.topic.len()
            + 2
            + properties.len();
        if total > u32::MAX as usize {
            return Err(Error::MessageTooLarge {
                size: total,
                max: u32::MAX as usize,
            });
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(total as u32);
        buf.put_u32(MESSAGE_MAGIC_CODE);
        buf.put_u32(body_crc(&self.body));
        buf.put_u32(self.queue_id);
        buf.put_u32(self.flag);
        buf.put_u64(0); // queue offset
        buf.put_u64(0); // physical offset
        buf.put_u32(self.sys_flag);
        buf.put_i64(self.born_timestamp);
        put_host(&mut buf, self.born_host);
        buf.put_i64(0); // store timestamp
        put_host(&mut buf, store_host);
        buf.put_u32(self.reconsume_times);
        buf.put_u64(self.prepared_transaction_offset);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
        buf.put_u8(self.topic.len() as u8);
        buf.put_slice(self.topic.as_bytes());
        buf.put_u16(properties.len() as u16);
        buf.put_slice(properties.as_bytes());
        debug_assert_eq!(buf.len(), total);

        Ok(EncodedMessage {
            buf,
            topic: self.topic.clone(),
            queue_id: self.queue_id,
        })
    }
}

/// Serialized record waiting for its commit log position.
#[derive(Debug)]
pub struct EncodedMessage {
    buf: BytesMut,
    topic: String,
    queue_id: u32,
}

impl EncodedMessage {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    pub fn stamp(&mut self, queue_offset: u64, physical_offset: u64, store_timestamp: i64) {
        self.buf[QUEUE_OFFSET_POS..QUEUE_OFFSET_POS + 8]
            .copy_from_slice(&queue_offset.to_be_bytes());
        self.buf[PHYSICAL_OFFSET_POS..PHYSICAL_OFFSET_POS + 8]
            .copy_from_slice(&physical_offset.to_be_bytes());
        self.buf[STORE_TIMESTAMP_POS..STORE_TIMESTAMP_POS + 8]
            .copy_from_slice(&store_timestamp.to_be_bytes());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// A record read back from the commit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub total_size: u32,
    pub body_crc: u32,
    pub queue_id: u32,
    pub flag: u32,
    pub queue_offset: u64,
    pub physical_offset: u64,
    pub sys_flag: u32,
    pub born_timestamp: i64,
    pub born_host: SocketAddrV4,
    pub store_timestamp: i64,
    pub store_host: SocketAddrV4,
    pub reconsume_times: u32,
    pub prepared_transaction_offset: u64,
    pub body: Bytes,
    pub topic: String,
    pub properties: BTreeMap<String, String>,
}

impl StoredRecord {
    pub fn tags(&self) -> Option<&str> {
        self.properties.get(PROPERTY_TAGS).map(String::as_str)
    }

    pub fn tags_code(&self) -> u64 {
        tags_hash_code(self.tags())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.properties
            .get(PROPERTY_KEYS)
            .map(String::as_str)
            .unwrap_or("")
            .split(' ')
            .filter(|k| !k.is_empty())
    }

    pub fn end_offset(&self) -> u64 {
        self.physical_offset + self.total_size as u64
    }
}

/// What the bytes at a record boundary hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordHeader {
    Message { size: u32 },
    Blank { size: u32 },
}

/// Classify the 8 bytes at a record boundary. `None` means the bytes are
/// neither a record nor a blank marker (end of valid data or corruption).
pub fn peek_header(buf: &[u8]) -> Option<RecordHeader> {
    if buf.len() < BLANK_MARKER_SIZE {
        return None;
    }
    let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let magic = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    match magic {
        MESSAGE_MAGIC_CODE if size as usize >= MIN_RECORD_SIZE => {
            Some(RecordHeader::Message { size })
        }
        BLANK_MAGIC_CODE if size as usize >= BLANK_MARKER_SIZE => Some(RecordHeader::Blank { size }),
        _ => None,
    }
}

/// Decode and verify the record starting at `buf[0]`, which must sit at
/// commit log position `at`.
pub fn decode_record(buf: &[u8], at: u64) -> Result<StoredRecord> {
    let total_size = match peek_header(buf) {
        Some(RecordHeader::Message { size }) => size as usize,
        Some(RecordHeader::Blank { .. }) => {
            return Err(Error::corrupted(at, "blank marker where a record was expected"))
        }
        None => return Err(Error::corrupted(at, "bad magic or size")),
    };
    if buf.len() < total_size {
        return Err(Error::corrupted(
            at,
            format!("record of {} bytes truncated to {}", total_size, buf.len()),
        ));
    }

    let mut cur = &buf[8..total_size];
    let body_crc_stored = cur.get_u32();
    let queue_id = cur.get_u32();
    let flag = cur.get_u32();
    let queue_offset = cur.get_u64();
    let physical_offset = cur.get_u64();
    let sys_flag = cur.get_u32();
    let born_timestamp = cur.get_i64();
    let born_host = get_host(&mut cur);
    let store_timestamp = cur.get_i64();
    let store_host = get_host(&mut cur);
    let reconsume_times = cur.get_u32();
    let prepared_transaction_offset = cur.get_u64();

    if physical_offset != at {
        return Err(Error::corrupted(
            at,
            format!("record claims physical offset {}", physical_offset),
        ));
    }

    let body_len = cur.get_u32() as usize;
    if cur.remaining() < body_len + 1 {
        return Err(Error::corrupted(at, "body length exceeds record"));
    }
    let body = Bytes::copy_from_slice(&cur[..body_len]);
    cur.advance(body_len);
    if body_crc(&body) != body_crc_stored {
        return Err(Error::corrupted(at, "body crc mismatch"));
    }

    let topic_len = cur.get_u8() as usize;
    if cur.remaining() < topic_len + 2 {
        return Err(Error::corrupted(at, "topic length exceeds record"));
    }
    let topic = std::str::from_utf8(&cur[..topic_len])
        .map_err(|_| Error::corrupted(at, "topic is not utf-8"))?
        .to_string();
    cur.advance(topic_len);

    let props_len = cur.get_u16() as usize;
    if cur.remaining() != props_len {
        return Err(Error::corrupted(at, "properties length disagrees with total size"));
    }
    let props = std::str::from_utf8(cur).map_err(|_| Error::corrupted(at, "properties are not utf-8"))?;

    Ok(StoredRecord {
        total_size: total_size as u32,
        body_crc: body_crc_stored,
        queue_id,
        flag,
        queue_offset,
        physical_offset,
        sys_flag,
        born_timestamp,
        born_host,
        store_timestamp,
        store_host,
        reconsume_times,
        prepared_transaction_offset,
        body,
        topic,
        properties: decode_properties(props),
    })
}

/// End-of-segment filler covering `remaining` bytes.
pub fn encode_blank(remaining: u32) -> [u8; BLANK_MARKER_SIZE] {
    let mut out = [0u8; BLANK_MARKER_SIZE];
    out[..4].copy_from_slice(&remaining.to_be_bytes());
    out[4..].copy_from_slice(&BLANK_MAGIC_CODE.to_be_bytes());
    out
}

/// CRC32 of the body, masked to 31 bits.
pub fn body_crc(body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(body);
    hasher.finalize() & 0x7FFF_FFFF
}

/// Topics name directories on disk, so only `[A-Za-z0-9_%|-]` is allowed.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
        return Err(Error::InvalidMessage(format!(
            "topic length {} outside 1..={}",
            topic.len(),
            MAX_TOPIC_LEN
        )));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '%' | '|');
    if !topic.chars().all(allowed) {
        return Err(Error::InvalidMessage(format!(
            "topic {:?} contains illegal characters",
            topic
        )));
    }
    Ok(())
}

fn put_host(buf: &mut BytesMut, host: SocketAddrV4) {
    buf.put_slice(&host.ip().octets());
    buf.put_u32(host.port() as u32);
}

fn get_host(cur: &mut &[u8]) -> SocketAddrV4 {
    let ip = Ipv4Addr::new(cur.get_u8(), cur.get_u8(), cur.get_u8(), cur.get_u8());
    let port = cur.get_u32() as u16;
    SocketAddrV4::new(ip, port)
}

fn encode_properties(properties: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::new();
    for (k, v) in properties {
        let reserved = |s: &str| s.contains([NAME_VALUE_SEPARATOR, PROPERTY_SEPARATOR]);
        if k.is_empty() || reserved(k) || reserved(v) {
            return Err(Error::InvalidMessage(format!(
                "property {:?} contains reserved separator characters",
                k
            )));
        }
        out.push_str(k);
        out.push(NAME_VALUE_SEPARATOR);
        out.push_str(v);
        out.push(PROPERTY_SEPARATOR);
    }
    Ok(out)
}

fn decode_properties(raw: &str) -> BTreeMap<String, String> {
    raw.split(PROPERTY_SEPARATOR)
        .filter_map(|pair| pair.split_once(NAME_VALUE_SEPARATOR))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
