///! # Wire Protocol
///!
///! Every message travels as a single length prefixed frame. The receiver reads
///! the length first and reserves exactly that many bytes before decoding.
///!
///! Frame = Length Header Body
///!     Length : u32 = <length of the entire frame, including Length>
///!     Header = MType Source Index
///!         MType  : u8  = <message type>
///!         Source : u32 = <rank of the sender>
///!         Index  : u32 = <index id>
///!
///! Field = FieldLen Bytes
///!     FieldLen : u32 = <length of Bytes, 0 when the field is absent>
///!
///! ## Requests
///!
///! Put        (1)  = Key:Field Value:Field
///! BulkPut    (2)  = Count:u32 (Key:Field Value:Field)*
///! Get        (3)  = Op:u8 Key:Field
///! BulkGet    (4)  = Op:u8 NumRecords:u32 Count:u32 Key:Field*
///! Delete     (5)  = Key:Field
///! BulkDelete (6)  = Count:u32 Key:Field*
///! Close      (7)  =
///! Commit     (11) =
///!
///! ## Responses
///!
///! Receipt        (8)  = Error:i32
///! GetReceipt     (9)  = Error:i32 Key:Field Value:Field
///! BulkGetReceipt (10) = Error:i32 Count:u32 (Key:Field Value:Field)*
///!
///! ## Statistics
///!
///! StatGather    (12) = Count:u32 Row*
///! StatBroadcast (13) = Count:u32 Row*
///!     Row = Float:u8 Slice:u64 Rank:u32 Num:u64 Min:u64 Max:u64
///!
///! ## Index creation
///!
///! ManifestVerdict (14) = Error:i32
use crate::error::{Error, ErrorCode, Result};
use crate::stats::{Stat, StatRow, StatValue};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Length, type, source rank and index id.
pub const HEADER_LEN: usize = 13;
const FIELD_LEN: usize = 4;
const STAT_ROW_LEN: usize = 37;

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = i32::MAX as usize;

const PUT: u8 = 1;
const BULK_PUT: u8 = 2;
const GET: u8 = 3;
const BULK_GET: u8 = 4;
const DELETE: u8 = 5;
const BULK_DELETE: u8 = 6;
const CLOSE: u8 = 7;
const RECEIPT: u8 = 8;
const GET_RECEIPT: u8 = 9;
const BULK_GET_RECEIPT: u8 = 10;
const COMMIT: u8 = 11;
const STAT_GATHER: u8 = 12;
const STAT_BROADCAST: u8 = 13;
const MANIFEST_VERDICT: u8 = 14;

/// Lookup performed by a get.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GetOp {
    Equal,
    Next,
    Prev,
    First,
    Last,
}

impl GetOp {
    fn code(self) -> u8 {
        match self {
            GetOp::Equal => 0,
            GetOp::Next => 1,
            GetOp::Prev => 2,
            GetOp::First => 3,
            GetOp::Last => 4,
        }
    }

    fn from_code(code: u8) -> Result<GetOp> {
        match code {
            0 => Ok(GetOp::Equal),
            1 => Ok(GetOp::Next),
            2 => Ok(GetOp::Prev),
            3 => Ok(GetOp::First),
            4 => Ok(GetOp::Last),
            _ => Err(Error::Protocol(format!("unknown get op {}", code))),
        }
    }

    /// Whether the op is resolved through statistics rather than the partitioner.
    pub fn is_directional(self) -> bool {
        self != GetOp::Equal
    }
}

/// A key and value that may each be missing.
pub type Record = (Option<Bytes>, Option<Bytes>);

#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Put {
        key: Bytes,
        value: Bytes,
    },
    BulkPut {
        records: Vec<(Bytes, Bytes)>,
    },
    Get {
        op: GetOp,
        key: Option<Bytes>,
    },
    /// With `num_records > 1` the server walks `num_records` successive keys
    /// from the first key instead of looking up each key.
    BulkGet {
        op: GetOp,
        num_records: u32,
        keys: Vec<Bytes>,
    },
    Delete {
        key: Bytes,
    },
    BulkDelete {
        keys: Vec<Bytes>,
    },
    Commit,
    Close,
    Receipt {
        error: ErrorCode,
    },
    GetReceipt {
        error: ErrorCode,
        key: Option<Bytes>,
        value: Option<Bytes>,
    },
    BulkGetReceipt {
        error: ErrorCode,
        records: Vec<Record>,
    },
    StatGather {
        rows: Vec<StatRow>,
    },
    StatBroadcast {
        rows: Vec<StatRow>,
    },
    /// Outcome of the manifest check done by server 1 of a persistent index.
    ManifestVerdict {
        error: ErrorCode,
    },
}

impl Body {
    fn mtype(&self) -> u8 {
        match self {
            Body::Put { .. } => PUT,
            Body::BulkPut { .. } => BULK_PUT,
            Body::Get { .. } => GET,
            Body::BulkGet { .. } => BULK_GET,
            Body::Delete { .. } => DELETE,
            Body::BulkDelete { .. } => BULK_DELETE,
            Body::Commit => COMMIT,
            Body::Close => CLOSE,
            Body::Receipt { .. } => RECEIPT,
            Body::GetReceipt { .. } => GET_RECEIPT,
            Body::BulkGetReceipt { .. } => BULK_GET_RECEIPT,
            Body::StatGather { .. } => STAT_GATHER,
            Body::StatBroadcast { .. } => STAT_BROADCAST,
            Body::ManifestVerdict { .. } => MANIFEST_VERDICT,
        }
    }

    /// Short name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Body::Put { .. } => "put",
            Body::BulkPut { .. } => "bulk_put",
            Body::Get { .. } => "get",
            Body::BulkGet { .. } => "bulk_get",
            Body::Delete { .. } => "delete",
            Body::BulkDelete { .. } => "bulk_delete",
            Body::Commit => "commit",
            Body::Close => "close",
            Body::Receipt { .. } => "receipt",
            Body::GetReceipt { .. } => "get_receipt",
            Body::BulkGetReceipt { .. } => "bulk_get_receipt",
            Body::StatGather { .. } => "stat_gather",
            Body::StatBroadcast { .. } => "stat_broadcast",
            Body::ManifestVerdict { .. } => "manifest_verdict",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub source: u32,
    pub index: u32,
    pub body: Body,
}

#[inline]
fn field_len(b: &[u8]) -> usize {
    FIELD_LEN + b.len()
}

#[inline]
fn opt_field_len(b: &Option<Bytes>) -> usize {
    FIELD_LEN + b.as_ref().map(|b| b.len()).unwrap_or(0)
}

impl Message {
    pub fn new(source: u32, index: u32, body: Body) -> Message {
        Message {
            source,
            index,
            body,
        }
    }

    /// Exact size of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + match &self.body {
                Body::Put { key, value } => field_len(key) + field_len(value),
                Body::BulkPut { records } => {
                    4 + records
                        .iter()
                        .map(|(k, v)| field_len(k) + field_len(v))
                        .sum::<usize>()
                }
                Body::Get { key, .. } => 1 + opt_field_len(key),
                Body::BulkGet { keys, .. } => {
                    1 + 4 + 4 + keys.iter().map(|k| field_len(k)).sum::<usize>()
                }
                Body::Delete { key } => field_len(key),
                Body::BulkDelete { keys } => 4 + keys.iter().map(|k| field_len(k)).sum::<usize>(),
                Body::Commit | Body::Close => 0,
                Body::Receipt { .. } | Body::ManifestVerdict { .. } => 4,
                Body::GetReceipt { key, value, .. } => {
                    4 + opt_field_len(key) + opt_field_len(value)
                }
                Body::BulkGetReceipt { records, .. } => {
                    4 + 4
                        + records
                            .iter()
                            .map(|(k, v)| opt_field_len(k) + opt_field_len(v))
                            .sum::<usize>()
                }
                Body::StatGather { rows } | Body::StatBroadcast { rows } => {
                    4 + rows.len() * STAT_ROW_LEN
                }
            }
    }

    /// Fails with `MessageTooLarge` when the frame would exceed `max`.
    pub fn check_size(&self, max: usize) -> Result<usize> {
        let size = self.encoded_len();
        if size > max || size > u32::MAX as usize {
            Err(Error::MessageTooLarge { size, max })
        } else {
            Ok(size)
        }
    }
}

fn put_field(dst: &mut BytesMut, b: &[u8]) {
    dst.put_u32_le(b.len() as u32);
    dst.put_slice(b);
}

fn put_opt_field(dst: &mut BytesMut, b: &Option<Bytes>) {
    match b {
        Some(b) => put_field(dst, b),
        None => dst.put_u32_le(0),
    }
}

fn put_rows(dst: &mut BytesMut, rows: &[StatRow]) {
    dst.put_u32_le(rows.len() as u32);
    for row in rows {
        dst.put_u8(row.stat.min.is_float() as u8);
        dst.put_u64_le(row.slice);
        dst.put_u32_le(row.rank);
        dst.put_u64_le(row.stat.num);
        dst.put_u64_le(row.stat.min.to_bits());
        dst.put_u64_le(row.stat.max.to_bits());
    }
}

/// Reads frames into `Message`s and writes `Message`s as frames.
#[derive(Clone, Copy, Debug)]
pub struct MessageCodec {
    max_message_bytes: usize,
}

impl MessageCodec {
    pub fn new(max_message_bytes: usize) -> MessageCodec {
        MessageCodec { max_message_bytes }
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }
}

impl Default for MessageCodec {
    fn default() -> MessageCodec {
        MessageCodec::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let len = item.check_size(self.max_message_bytes)?;
        dst.reserve(len);
        dst.put_u32_le(len as u32);
        dst.put_u8(item.body.mtype());
        dst.put_u32_le(item.source);
        dst.put_u32_le(item.index);

        match &item.body {
            Body::Put { key, value } => {
                put_field(dst, key);
                put_field(dst, value);
            }
            Body::BulkPut { records } => {
                dst.put_u32_le(records.len() as u32);
                for (key, value) in records {
                    put_field(dst, key);
                    put_field(dst, value);
                }
            }
            Body::Get { op, key } => {
                dst.put_u8(op.code());
                put_opt_field(dst, key);
            }
            Body::BulkGet {
                op,
                num_records,
                keys,
            } => {
                dst.put_u8(op.code());
                dst.put_u32_le(*num_records);
                dst.put_u32_le(keys.len() as u32);
                for key in keys {
                    put_field(dst, key);
                }
            }
            Body::Delete { key } => put_field(dst, key),
            Body::BulkDelete { keys } => {
                dst.put_u32_le(keys.len() as u32);
                for key in keys {
                    put_field(dst, key);
                }
            }
            Body::Commit | Body::Close => {}
            Body::Receipt { error } | Body::ManifestVerdict { error } => {
                dst.put_i32_le(error.code())
            }
            Body::GetReceipt { error, key, value } => {
                dst.put_i32_le(error.code());
                put_opt_field(dst, key);
                put_opt_field(dst, value);
            }
            Body::BulkGetReceipt { error, records } => {
                dst.put_i32_le(error.code());
                dst.put_u32_le(records.len() as u32);
                for (key, value) in records {
                    put_opt_field(dst, key);
                    put_opt_field(dst, value);
                }
            }
            Body::StatGather { rows } | Body::StatBroadcast { rows } => put_rows(dst, rows),
        }
        Ok(())
    }
}

/// Cursor over the body of a single frame.
struct FrameReader {
    buf: Bytes,
}

impl FrameReader {
    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            Err(Error::Protocol(format!(
                "truncated frame: needed {} bytes, {} remain",
                n,
                self.buf.remaining()
            )))
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    /// Count of entries that each take at least `min_entry` bytes.
    fn count(&mut self, min_entry: usize) -> Result<usize> {
        let count = self.u32()? as usize;
        self.need(count.saturating_mul(min_entry))?;
        Ok(count)
    }

    fn opt_field(&mut self) -> Result<Option<Bytes>> {
        let len = self.u32()? as usize;
        if len == 0 {
            return Ok(None);
        }
        self.need(len)?;
        Ok(Some(self.buf.split_to(len)))
    }

    fn field(&mut self) -> Result<Bytes> {
        Ok(self.opt_field()?.unwrap_or_else(Bytes::new))
    }

    fn rows(&mut self) -> Result<Vec<StatRow>> {
        let count = self.count(STAT_ROW_LEN)?;
        let mut rows = Vec::with_capacity(count);
        for _ in 0..count {
            let float = self.u8()? != 0;
            let slice = self.u64()?;
            let rank = self.u32()?;
            let num = self.u64()?;
            let min = StatValue::from_bits(float, self.u64()?);
            let max = StatValue::from_bits(float, self.u64()?);
            rows.push(StatRow {
                slice,
                rank,
                stat: Stat { min, max, num },
            });
        }
        Ok(rows)
    }

    fn finish(self, body: Body) -> Result<Body> {
        if self.buf.has_remaining() {
            Err(Error::Protocol(format!(
                "{} trailing bytes after {}",
                self.buf.remaining(),
                body.name()
            )))
        } else {
            Ok(body)
        }
    }
}

fn decode_body(mtype: u8, buf: Bytes) -> Result<Body> {
    let mut r = FrameReader { buf };
    let body = match mtype {
        PUT => {
            let key = r.field()?;
            let value = r.field()?;
            Body::Put { key, value }
        }
        BULK_PUT => {
            let count = r.count(2 * FIELD_LEN)?;
            let mut records = Vec::with_capacity(count);
            for _ in 0..count {
                let key = r.field()?;
                let value = r.field()?;
                records.push((key, value));
            }
            Body::BulkPut { records }
        }
        GET => {
            let op = GetOp::from_code(r.u8()?)?;
            let key = r.opt_field()?;
            Body::Get { op, key }
        }
        BULK_GET => {
            let op = GetOp::from_code(r.u8()?)?;
            let num_records = r.u32()?;
            let count = r.count(FIELD_LEN)?;
            let mut keys = Vec::with_capacity(count);
            for _ in 0..count {
                keys.push(r.field()?);
            }
            Body::BulkGet {
                op,
                num_records,
                keys,
            }
        }
        DELETE => Body::Delete { key: r.field()? },
        BULK_DELETE => {
            let count = r.count(FIELD_LEN)?;
            let mut keys = Vec::with_capacity(count);
            for _ in 0..count {
                keys.push(r.field()?);
            }
            Body::BulkDelete { keys }
        }
        COMMIT => Body::Commit,
        CLOSE => Body::Close,
        RECEIPT => Body::Receipt {
            error: ErrorCode::from_code(r.i32()?),
        },
        GET_RECEIPT => {
            let error = ErrorCode::from_code(r.i32()?);
            let key = r.opt_field()?;
            let value = r.opt_field()?;
            Body::GetReceipt { error, key, value }
        }
        BULK_GET_RECEIPT => {
            let error = ErrorCode::from_code(r.i32()?);
            let count = r.count(2 * FIELD_LEN)?;
            let mut records = Vec::with_capacity(count);
            for _ in 0..count {
                let key = r.opt_field()?;
                let value = r.opt_field()?;
                records.push((key, value));
            }
            Body::BulkGetReceipt { error, records }
        }
        STAT_GATHER => Body::StatGather { rows: r.rows()? },
        STAT_BROADCAST => Body::StatBroadcast { rows: r.rows()? },
        MANIFEST_VERDICT => Body::ManifestVerdict {
            error: ErrorCode::from_code(r.i32()?),
        },
        mtype => {
            error!("Unknown message type {:X}", mtype);
            return Err(Error::Protocol(format!("unknown message type {}", mtype)));
        }
    };
    r.finish(body)
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < 4 {
            trace!("Not enough bytes for the frame length: {}", src.len());
            return Ok(None);
        }

        let len = LittleEndian::read_u32(&src[0..4]) as usize;
        if len > self.max_message_bytes {
            return Err(Error::MessageTooLarge {
                size: len,
                max: self.max_message_bytes,
            });
        }
        if len < HEADER_LEN {
            return Err(Error::Protocol(format!("frame length {} is too small", len)));
        }

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(len);
        frame.advance(4);
        let mtype = frame.get_u8();
        let source = frame.get_u32_le();
        let index = frame.get_u32_le();
        let body = decode_body(mtype, frame.freeze())?;
        Ok(Some(Message {
            source,
            index,
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    fn round_trip(msg: Message) -> Message {
        let mut codec = MessageCodec::default();
        let mut bytes = BytesMut::new();
        codec.encode(msg.clone(), &mut bytes).unwrap();
        assert_eq!(msg.encoded_len(), bytes.len());
        let decoded = codec.decode(&mut bytes).unwrap().unwrap();
        assert!(bytes.is_empty());
        decoded
    }

    #[test]
    fn encode_decode_requests() {
        let messages = vec![
            Message::new(
                1,
                0,
                Body::Put {
                    key: b("k"),
                    value: b("value"),
                },
            ),
            Message::new(
                2,
                3,
                Body::BulkPut {
                    records: vec![(b("a"), b("1")), (b("bb"), b("22"))],
                },
            ),
            Message::new(
                0,
                0,
                Body::Get {
                    op: GetOp::Prev,
                    key: Some(b("key")),
                },
            ),
            Message::new(
                0,
                0,
                Body::Get {
                    op: GetOp::First,
                    key: None,
                },
            ),
            Message::new(
                4,
                1,
                Body::BulkGet {
                    op: GetOp::Next,
                    num_records: 10,
                    keys: vec![b("x")],
                },
            ),
            Message::new(4, 1, Body::Delete { key: b("gone") }),
            Message::new(
                4,
                1,
                Body::BulkDelete {
                    keys: vec![b("a"), b("b")],
                },
            ),
            Message::new(5, 0, Body::Commit),
            Message::new(5, 0, Body::Close),
        ];
        for msg in messages {
            assert_eq!(msg, round_trip(msg.clone()));
        }
    }

    #[test]
    fn encode_decode_responses() {
        let messages = vec![
            Message::new(
                1,
                0,
                Body::Receipt {
                    error: ErrorCode::DbError,
                },
            ),
            Message::new(
                1,
                0,
                Body::GetReceipt {
                    error: ErrorCode::Success,
                    key: Some(b("k")),
                    value: Some(b("v")),
                },
            ),
            Message::new(
                1,
                0,
                Body::BulkGetReceipt {
                    error: ErrorCode::Success,
                    records: vec![(Some(b("k")), Some(b("v"))), (None, None)],
                },
            ),
            Message::new(
                2,
                0,
                Body::StatGather {
                    rows: vec![StatRow {
                        slice: 7,
                        rank: 2,
                        stat: Stat {
                            min: StatValue::Float(0.25),
                            max: StatValue::Float(0.5),
                            num: 3,
                        },
                    }],
                },
            ),
            Message::new(
                1,
                0,
                Body::StatBroadcast {
                    rows: vec![StatRow {
                        slice: 1,
                        rank: 1,
                        stat: Stat {
                            min: StatValue::Int(1),
                            max: StatValue::Int(100),
                            num: 100,
                        },
                    }],
                },
            ),
            Message::new(
                1,
                2,
                Body::ManifestVerdict {
                    error: ErrorCode::DbError,
                },
            ),
        ];
        for msg in messages {
            assert_eq!(msg, round_trip(msg.clone()));
        }
    }

    #[test]
    fn empty_bulk_messages() {
        let msg = Message::new(1, 0, Body::BulkPut { records: vec![] });
        assert_eq!(HEADER_LEN + 4, msg.encoded_len());
        assert_eq!(msg, round_trip(msg.clone()));

        let msg = Message::new(
            1,
            0,
            Body::BulkGetReceipt {
                error: ErrorCode::NotFound,
                records: vec![],
            },
        );
        assert_eq!(msg, round_trip(msg.clone()));
    }

    #[test]
    fn zero_length_fields_are_absent() {
        let msg = Message::new(
            1,
            0,
            Body::GetReceipt {
                error: ErrorCode::NotFound,
                key: Some(Bytes::new()),
                value: None,
            },
        );
        match round_trip(msg).body {
            Body::GetReceipt { key, value, .. } => {
                assert_eq!(None, key);
                assert_eq!(None, value);
            }
            body => panic!("unexpected body {:?}", body),
        }
    }

    #[test]
    fn decode_partial() {
        let mut codec = MessageCodec::default();
        let mut bytes = BytesMut::new();
        let msg = Message::new(
            1,
            0,
            Body::Put {
                key: b("key"),
                value: b("value"),
            },
        );
        codec.encode(msg.clone(), &mut bytes).unwrap();

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&bytes[0..2]);
        assert_eq!(None, codec.decode(&mut partial).unwrap());
        partial.extend_from_slice(&bytes[2..10]);
        assert_eq!(None, codec.decode(&mut partial).unwrap());
        partial.extend_from_slice(&bytes[10..]);
        assert_eq!(Some(msg), codec.decode(&mut partial).unwrap());
    }

    #[test]
    fn oversized_messages_rejected() {
        let mut codec = MessageCodec::new(32);
        let msg = Message::new(
            1,
            0,
            Body::Put {
                key: b("key"),
                value: Bytes::from(vec![0u8; 64]),
            },
        );
        let mut bytes = BytesMut::new();
        match codec.encode(msg, &mut bytes) {
            Err(Error::MessageTooLarge { max: 32, .. }) => {}
            res => panic!("unexpected result {:?}", res),
        }
        assert!(bytes.is_empty());

        // length prefix alone is enough to reject on decode
        let mut bytes = BytesMut::new();
        bytes.put_u32_le(64);
        assert!(codec.decode(&mut bytes).is_err());
    }

    #[test]
    fn malformed_frames_rejected() {
        let mut codec = MessageCodec::default();

        let mut bytes = BytesMut::new();
        bytes.put_u32_le(HEADER_LEN as u32);
        bytes.put_u8(99);
        bytes.put_u32_le(0);
        bytes.put_u32_le(0);
        assert!(codec.decode(&mut bytes).is_err());

        // count claims more keys than the frame holds
        let mut bytes = BytesMut::new();
        bytes.put_u32_le(HEADER_LEN as u32 + 4);
        bytes.put_u8(BULK_DELETE);
        bytes.put_u32_le(0);
        bytes.put_u32_le(0);
        bytes.put_u32_le(1000);
        assert!(codec.decode(&mut bytes).is_err());
    }
}
