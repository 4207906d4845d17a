//! Sample decoding for raw kernel ring records.
//!
//! Decodes byte slices read from the per-CPU sample buffers into a
//! [`Sample`] and its [`BranchStack`]. The layout must match `ms_sample` in
//! the kernel sampler headers: a 64-byte fixed header followed by a fixed
//! 16-slot array of branch entries, of which only the first `branch_count`
//! are meaningful. All fields are native-endian.

use thiserror::Error;

use super::event::{BranchEntry, BranchStack, Sample, MAX_BRANCH_ENTRIES};

/// Fixed header size in bytes (fields plus alignment padding before the
/// branch slots).
pub const HEADER_SIZE: usize = 64;

/// One inline branch slot: two u64 addresses.
pub const BRANCH_ENTRY_SIZE: usize = 16;

/// Full record size with every branch slot present.
pub const RECORD_SIZE: usize = HEADER_SIZE + MAX_BRANCH_ENTRIES * BRANCH_ENTRY_SIZE;

/// Errors that can occur during sample parsing.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("sample record too short: {size} bytes")]
    Truncated { size: usize },
}

/// Parse a raw ring record into a sample and its branch stack.
///
/// Records may be shorter than [`RECORD_SIZE`]: trailing branch slots the
/// producer did not fill can be absent, and any bytes beyond the fixed slot
/// array are ignored.
pub fn parse_sample(data: &[u8]) -> Result<(Sample, BranchStack), ParseError> {
    if data.len() < HEADER_SIZE {
        return Err(ParseError::Truncated { size: data.len() });
    }

    let sample = Sample {
        tsc: read_u64(data, 0),
        cpu: read_u32(data, 8),
        pid: read_u32(data, 12),
        tid: read_u32(data, 16),
        pmu_event: read_u32(data, 20),
        ip: read_u64(data, 24),
        data_addr: read_u64(data, 32),
        flow_id: read_u64(data, 40),
        gso_segs: read_u32(data, 48),
        ingress_ifindex: read_u16(data, 52),
        numa_node: read_u16(data, 54),
        l4_proto: data[56],
        direction: data[57],
        branch_count: data[58],
    };

    let declared = usize::from(sample.branch_count).min(MAX_BRANCH_ENTRIES);
    let available = (data.len() - HEADER_SIZE) / BRANCH_ENTRY_SIZE;
    let count = declared.min(available);

    let mut stack = Vec::with_capacity(count);
    for i in 0..count {
        let off = HEADER_SIZE + i * BRANCH_ENTRY_SIZE;
        stack.push(BranchEntry {
            from: read_u64(data, off),
            to: read_u64(data, off + 8),
        });
    }

    Ok((sample, stack))
}

#[inline(always)]
fn read_u16(data: &[u8], offset: usize) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&data[offset..offset + 2]);
    u16::from_ne_bytes(buf)
}

#[inline(always)]
fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_ne_bytes(buf)
}

#[inline(always)]
fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    u64::from_ne_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(sample: &Sample, branches: &[BranchEntry]) -> Vec<u8> {
        let mut buf = vec![0u8; RECORD_SIZE];
        buf[0..8].copy_from_slice(&sample.tsc.to_ne_bytes());
        buf[8..12].copy_from_slice(&sample.cpu.to_ne_bytes());
        buf[12..16].copy_from_slice(&sample.pid.to_ne_bytes());
        buf[16..20].copy_from_slice(&sample.tid.to_ne_bytes());
        buf[20..24].copy_from_slice(&sample.pmu_event.to_ne_bytes());
        buf[24..32].copy_from_slice(&sample.ip.to_ne_bytes());
        buf[32..40].copy_from_slice(&sample.data_addr.to_ne_bytes());
        buf[40..48].copy_from_slice(&sample.flow_id.to_ne_bytes());
        buf[48..52].copy_from_slice(&sample.gso_segs.to_ne_bytes());
        buf[52..54].copy_from_slice(&sample.ingress_ifindex.to_ne_bytes());
        buf[54..56].copy_from_slice(&sample.numa_node.to_ne_bytes());
        buf[56] = sample.l4_proto;
        buf[57] = sample.direction;
        buf[58] = sample.branch_count;
        for (i, entry) in branches.iter().enumerate() {
            let off = HEADER_SIZE + i * BRANCH_ENTRY_SIZE;
            buf[off..off + 8].copy_from_slice(&entry.from.to_ne_bytes());
            buf[off + 8..off + 16].copy_from_slice(&entry.to.to_ne_bytes());
        }
        buf
    }

    #[test]
    fn test_parse_full_record() {
        let sample = Sample {
            tsc: 1_234_567,
            cpu: 3,
            pid: 100,
            tid: 101,
            pmu_event: 1,
            ip: 0x4021f0,
            data_addr: 0x7f00_0000_1000,
            flow_id: 42,
            gso_segs: 4,
            ingress_ifindex: 2,
            numa_node: 1,
            l4_proto: 6,
            direction: 0,
            branch_count: 2,
        };
        let branches = [
            BranchEntry { from: 0x401000, to: 0x402000 },
            BranchEntry { from: 0x403000, to: 0x404000 },
        ];
        let data = encode(&sample, &branches);

        let (parsed, stack) = parse_sample(&data).expect("parse");
        assert_eq!(parsed.tsc, 1_234_567);
        assert_eq!(parsed.cpu, 3);
        assert_eq!(parsed.flow_id, 42);
        assert_eq!(parsed.gso_segs, 4);
        assert_eq!(parsed.ingress_ifindex, 2);
        assert_eq!(parsed.numa_node, 1);
        assert_eq!(parsed.l4_proto, 6);
        assert_eq!(stack.len(), 2);
        assert_eq!(stack[0].from, 0x401000);
        assert_eq!(stack[1].to, 0x404000);
    }

    #[test]
    fn test_parse_truncated_header() {
        let data = vec![0u8; HEADER_SIZE - 1];
        assert!(matches!(
            parse_sample(&data),
            Err(ParseError::Truncated { .. })
        ));
    }

    #[test]
    fn test_parse_partial_branch_slots() {
        // branch_count declares 4 entries but the record only carries 1.
        let sample = Sample {
            branch_count: 4,
            ..Sample::default()
        };
        let branches = [BranchEntry { from: 0x10, to: 0x20 }];
        let mut data = encode(&sample, &branches);
        data.truncate(HEADER_SIZE + BRANCH_ENTRY_SIZE);

        let (_, stack) = parse_sample(&data).expect("parse");
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].from, 0x10);
    }

    #[test]
    fn test_parse_ignores_trailing_slots() {
        // branch_count = 1 but all 16 slots are present; extras are ignored.
        let sample = Sample {
            branch_count: 1,
            ..Sample::default()
        };
        let branches: Vec<BranchEntry> = (0..16)
            .map(|i| BranchEntry { from: i, to: i + 1 })
            .collect();
        let data = encode(&sample, &branches);

        let (_, stack) = parse_sample(&data).expect("parse");
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_parse_branch_count_capped() {
        let sample = Sample {
            branch_count: 200,
            ..Sample::default()
        };
        let branches: Vec<BranchEntry> = (0..16)
            .map(|i| BranchEntry { from: i, to: i })
            .collect();
        let data = encode(&sample, &branches);

        let (_, stack) = parse_sample(&data).expect("parse");
        assert_eq!(stack.len(), MAX_BRANCH_ENTRIES);
    }
}
