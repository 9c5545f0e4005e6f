// Prepare-state payload assembly and parsing.
//
// The payload written under a single PREPARE WAL record:
//
//   1. header (magic, total_len, xid, database, prepared_at, owner,
//      segment counts, gid)
//   2. TransactionId[nsubxacts]        committed children
//   3. RelFileNode[ncommitrels]        files to unlink on commit
//   4. RelFileNode[nabortrels]         files to unlink on abort
//   5. resource-manager records, each a fixed entry followed by opaque
//      data, terminated by an entry with rmid = TWOPHASE_RM_END_ID
//   6. (the WAL frame CRC covers the payload; total_len includes it)
//
// Every segment is padded to an 8-byte boundary; the CRC is not. All
// integers are little-endian.

use bytes::{BufMut, BytesMut};

use crate::common::{Oid, RelFileNode, TransactionId};

use super::error::{TwoPhaseError, TwoPhaseResult};
use super::rmgr::{RmgrId, TWOPHASE_RM_END_ID};
use super::types::{GID_SIZE, MAX_ALIGN, TWOPHASE_MAGIC};

/// Fixed header size before alignment padding.
const HEADER_LEN: usize = 44 + GID_SIZE;

/// Fixed size of one on-disk record entry (len, rmid, pad, info).
const RECORD_ENTRY_LEN: usize = 8;

/// Size of one serialized RelFileNode.
const REL_FILE_NODE_LEN: usize = 12;

/// Bytes the trailing checksum contributes to `total_len`.
const CRC_LEN: u32 = 4;

/// Rounds `len` up to the platform maximum-alignment boundary.
pub(crate) fn maxalign(len: usize) -> usize {
    (len + MAX_ALIGN - 1) & !(MAX_ALIGN - 1)
}

/// Parsed form of the fixed payload header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadHeader {
    pub xid: TransactionId,
    pub database: Oid,
    pub prepared_at_micros: i64,
    pub owner: Oid,
    pub nsubxacts: u32,
    pub ncommitrels: u32,
    pub nabortrels: u32,
    pub gid: String,
    /// Total payload length including the checksum; zero until the
    /// builder finishes.
    pub total_len: u32,
}

impl PayloadHeader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        xid: TransactionId,
        database: Oid,
        owner: Oid,
        prepared_at_micros: i64,
        gid: &str,
        nsubxacts: u32,
        ncommitrels: u32,
        nabortrels: u32,
    ) -> Self {
        Self {
            xid,
            database,
            prepared_at_micros,
            owner,
            nsubxacts,
            ncommitrels,
            nabortrels,
            gid: gid.to_string(),
            total_len: 0,
        }
    }
}

/// In-memory assembler for one prepare-state payload.
///
/// Owned by the preparing session; consumed by
/// [`finish`](PayloadBuilder::finish) once every resource manager has
/// registered its records.
pub struct PayloadBuilder {
    buf: BytesMut,
    /// Running total of padded segment bytes, excluding the checksum.
    total_len: u32,
}

impl PayloadBuilder {
    /// Starts a payload: emplaces the header and the subxact/relation
    /// segments.
    pub fn begin(
        header: &PayloadHeader,
        subxids: &[TransactionId],
        commit_rels: &[RelFileNode],
        abort_rels: &[RelFileNode],
    ) -> Self {
        assert!(header.gid.len() < GID_SIZE, "gid length validated at reserve");
        debug_assert_eq!(header.nsubxacts as usize, subxids.len());
        debug_assert_eq!(header.ncommitrels as usize, commit_rels.len());
        debug_assert_eq!(header.nabortrels as usize, abort_rels.len());

        let mut builder = Self {
            buf: BytesMut::with_capacity(512),
            total_len: 0,
        };

        let mut hdr = BytesMut::with_capacity(HEADER_LEN);
        hdr.put_u32_le(TWOPHASE_MAGIC);
        hdr.put_u32_le(0); // total_len, patched by finish()
        hdr.put_u64_le(header.xid);
        hdr.put_u32_le(header.database);
        hdr.put_i64_le(header.prepared_at_micros);
        hdr.put_u32_le(header.owner);
        hdr.put_u32_le(header.nsubxacts);
        hdr.put_u32_le(header.ncommitrels);
        hdr.put_u32_le(header.nabortrels);
        hdr.put_slice(header.gid.as_bytes());
        hdr.put_bytes(0, GID_SIZE - header.gid.len());
        builder.append(&hdr);

        if !subxids.is_empty() {
            let mut seg = BytesMut::with_capacity(subxids.len() * 8);
            for &xid in subxids {
                seg.put_u64_le(xid);
            }
            builder.append(&seg);
        }
        if !commit_rels.is_empty() {
            builder.append(&encode_rels(commit_rels));
        }
        if !abort_rels.is_empty() {
            builder.append(&encode_rels(abort_rels));
        }

        builder
    }

    /// Copies a segment into the payload, padding to the alignment
    /// boundary.
    fn append(&mut self, data: &[u8]) {
        let padded = maxalign(data.len());
        self.buf.put_slice(data);
        self.buf.put_bytes(0, padded - data.len());
        self.total_len += padded as u32;
    }

    /// Registers one resource-manager record. Ordering across calls is
    /// preserved in the payload.
    pub fn register_record(&mut self, rmid: RmgrId, info: u16, data: &[u8]) {
        assert!(rmid < TWOPHASE_RM_END_ID, "rmid {} is the end sentinel", rmid);

        let mut entry = BytesMut::with_capacity(RECORD_ENTRY_LEN);
        entry.put_u32_le(data.len() as u32);
        entry.put_u8(rmid);
        entry.put_u8(0);
        entry.put_u16_le(info);
        self.append(&entry);
        if !data.is_empty() {
            self.append(data);
        }
    }

    /// Appends the end sentinel, back-patches `total_len`, and hands back
    /// the finished payload. Fails when the payload exceeds `max_len`.
    pub fn finish(mut self, max_len: usize) -> TwoPhaseResult<Vec<u8>> {
        let mut sentinel = BytesMut::with_capacity(RECORD_ENTRY_LEN);
        sentinel.put_u32_le(0);
        sentinel.put_u8(TWOPHASE_RM_END_ID);
        sentinel.put_u8(0);
        sentinel.put_u16_le(0);
        self.append(&sentinel);

        let total_len = self.total_len + CRC_LEN;
        self.buf[4..8].copy_from_slice(&total_len.to_le_bytes());

        if total_len as usize > max_len {
            return Err(TwoPhaseError::LimitExceeded {
                total_len: total_len as u64,
                max: max_len as u64,
            });
        }
        Ok(self.buf.to_vec())
    }
}

fn encode_rels(rels: &[RelFileNode]) -> BytesMut {
    let mut seg = BytesMut::with_capacity(rels.len() * REL_FILE_NODE_LEN);
    for rel in rels {
        seg.put_u32_le(rel.spc_node);
        seg.put_u32_le(rel.db_node);
        seg.put_u32_le(rel.rel_node);
    }
    seg
}

/// A payload read back from the log, disassembled along its aligned
/// segment boundaries.
#[derive(Debug)]
pub struct ParsedPayload {
    pub header: PayloadHeader,
    pub subxids: Vec<TransactionId>,
    pub commit_rels: Vec<RelFileNode>,
    pub abort_rels: Vec<RelFileNode>,
    records_offset: usize,
    buf: Vec<u8>,
}

impl ParsedPayload {
    /// Validates framing and disassembles the header area. The buffer is
    /// the WAL record body (the checksum lives in the record frame).
    pub fn parse(buf: Vec<u8>) -> TwoPhaseResult<Self> {
        if buf.len() < maxalign(HEADER_LEN) {
            return Err(TwoPhaseError::MalformedPayload(format!(
                "payload of {} bytes is shorter than the header",
                buf.len()
            )));
        }

        let magic = read_u32(&buf, 0);
        if magic != TWOPHASE_MAGIC {
            return Err(TwoPhaseError::MalformedPayload(format!(
                "bad magic {:#x}",
                magic
            )));
        }

        let total_len = read_u32(&buf, 4);
        if total_len as usize != buf.len() + CRC_LEN as usize {
            return Err(TwoPhaseError::MalformedPayload(format!(
                "total_len {} does not match payload of {} bytes",
                total_len,
                buf.len()
            )));
        }

        let xid = read_u64(&buf, 8);
        let database = read_u32(&buf, 16);
        let prepared_at_micros = i64::from_le_bytes(buf[20..28].try_into().unwrap_or_default());
        let owner = read_u32(&buf, 28);
        let nsubxacts = read_u32(&buf, 32);
        let ncommitrels = read_u32(&buf, 36);
        let nabortrels = read_u32(&buf, 40);
        let gid_bytes = &buf[44..44 + GID_SIZE];
        let gid_len = gid_bytes.iter().position(|&b| b == 0).unwrap_or(GID_SIZE);
        let gid = String::from_utf8_lossy(&gid_bytes[..gid_len]).into_owned();

        let mut offset = maxalign(HEADER_LEN);

        let subxids = {
            let seg_len = nsubxacts as usize * 8;
            check_segment(&buf, offset, seg_len, "subtransaction ids")?;
            let xids = (0..nsubxacts as usize)
                .map(|i| read_u64(&buf, offset + i * 8))
                .collect();
            offset += maxalign(seg_len);
            xids
        };
        let commit_rels = parse_rels(&buf, &mut offset, ncommitrels, "commit relations")?;
        let abort_rels = parse_rels(&buf, &mut offset, nabortrels, "abort relations")?;

        Ok(Self {
            header: PayloadHeader {
                xid,
                database,
                prepared_at_micros,
                owner,
                nsubxacts,
                ncommitrels,
                nabortrels,
                gid,
                total_len,
            },
            subxids,
            commit_rels,
            abort_rels,
            records_offset: offset,
            buf,
        })
    }

    /// Iterates the resource-manager records up to the end sentinel.
    pub fn records(&self) -> PayloadRecords<'_> {
        PayloadRecords {
            buf: &self.buf,
            offset: self.records_offset,
            done: false,
        }
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap_or_default())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap_or_default())
}

fn check_segment(buf: &[u8], offset: usize, len: usize, what: &str) -> TwoPhaseResult<()> {
    if offset + len > buf.len() {
        return Err(TwoPhaseError::MalformedPayload(format!(
            "{} segment extends past the end of the payload",
            what
        )));
    }
    Ok(())
}

fn parse_rels(
    buf: &[u8],
    offset: &mut usize,
    count: u32,
    what: &str,
) -> TwoPhaseResult<Vec<RelFileNode>> {
    let seg_len = count as usize * REL_FILE_NODE_LEN;
    check_segment(buf, *offset, seg_len, what)?;
    let rels = (0..count as usize)
        .map(|i| {
            let base = *offset + i * REL_FILE_NODE_LEN;
            RelFileNode {
                spc_node: read_u32(buf, base),
                db_node: read_u32(buf, base + 4),
                rel_node: read_u32(buf, base + 8),
            }
        })
        .collect();
    *offset += maxalign(seg_len);
    Ok(rels)
}

/// One resource-manager record in a parsed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadRecord<'a> {
    pub rmid: RmgrId,
    pub info: u16,
    pub data: &'a [u8],
}

/// Iterator over a payload's resource-manager records.
pub struct PayloadRecords<'a> {
    buf: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> Iterator for PayloadRecords<'a> {
    type Item = TwoPhaseResult<PayloadRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.offset + RECORD_ENTRY_LEN > self.buf.len() {
            self.done = true;
            return Some(Err(TwoPhaseError::MalformedPayload(
                "record stream is not terminated".to_string(),
            )));
        }

        let len = read_u32(self.buf, self.offset) as usize;
        let rmid = self.buf[self.offset + 4];
        let info = u16::from_le_bytes(
            self.buf[self.offset + 6..self.offset + 8]
                .try_into()
                .unwrap_or_default(),
        );
        if rmid == TWOPHASE_RM_END_ID {
            self.done = true;
            return None;
        }

        let data_start = self.offset + RECORD_ENTRY_LEN;
        if data_start + len > self.buf.len() {
            self.done = true;
            return Some(Err(TwoPhaseError::MalformedPayload(format!(
                "record data for rmid {} extends past the end of the payload",
                rmid
            ))));
        }

        self.offset = data_start + maxalign(len);
        Some(Ok(PayloadRecord {
            rmid,
            info,
            data: &self.buf[data_start..data_start + len],
        }))
    }
}
