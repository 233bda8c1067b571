//! GPT and MBR partition table parsing.
//!
//! No precedent exists in the retrieved corpus for either format, so this is
//! authored directly from the on-disk layouts rather than adapted from an
//! existing module. It follows the general shape of this core's other
//! fixed-capacity binary parsers (`drivers::pci`'s config-space reads,
//! `drivers::ahci`'s FIS construction): read raw bytes into a `repr(C)`
//! struct, validate a signature, extract what's needed into a plain owned
//! value. GPT is tried first (LBA 1); MBR is the fallback (LBA 0).

use alloc::format;
use alloc::string::String;

use super::{BlockDevice, BLOCK_SIZE};
use crate::error::{KernelError, KernelResult};

pub const MAX_PARTITIONS: usize = 16;
const SECTOR_SIZE: u64 = 512;
const SECTORS_PER_BLOCK: u64 = (BLOCK_SIZE as u64) / SECTOR_SIZE;

const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
const MBR_BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const MBR_PROTECTIVE_TYPE: u8 = 0xEE;

const GPT_MIN_HEADER_SIZE: usize = 92;
const GPT_MAX_NUM_ENTRIES: usize = 4096;
const GPT_MAX_ENTRY_ARRAY_SECTORS: u64 = 1024;

/// Where a `PartitionEntry` was read from, carrying the format-specific tag
/// a caller needs to distinguish or re-identify it (an MBR type byte, or a
/// GPT type/unique GUID pair).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provenance {
    Mbr { partition_type: u8 },
    Gpt { type_guid: [u8; 16], unique_guid: [u8; 16] },
}

#[derive(Clone, Debug)]
pub struct PartitionEntry {
    pub first_lba: u64,
    pub last_lba: u64,
    /// `<parent>p<N>`, numbered from 1 in discovery order.
    pub name: String,
    pub provenance: Provenance,
}

impl PartitionEntry {
    pub fn sector_count(&self) -> u64 {
        self.last_lba - self.first_lba + 1
    }
}

#[derive(Debug)]
pub struct PartitionTable {
    entries: [Option<PartitionEntry>; MAX_PARTITIONS],
    count: usize,
}

impl PartitionTable {
    fn empty() -> Self {
        PartitionTable {
            entries: core::array::from_fn(|_| None),
            count: 0,
        }
    }

    fn push(&mut self, entry: PartitionEntry) -> bool {
        if self.count >= MAX_PARTITIONS {
            return false;
        }
        self.entries[self.count] = Some(entry);
        self.count += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn get(&self, index: usize) -> Option<&PartitionEntry> {
        if index < self.count {
            self.entries[index].as_ref()
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionEntry> + '_ {
        self.entries[..self.count].iter().filter_map(|e| e.as_ref())
    }

    /// Builds a `BlockDevice` scoped to this entry, with LBA sector bounds
    /// converted into this core's 4 KiB block addressing. Partitions whose
    /// bounds aren't block-aligned are rejected rather than silently
    /// rounded, since misaligned I/O would corrupt the neighboring block.
    pub fn open(&self, index: usize) -> KernelResult<BlockDevice> {
        let entry = self.get(index).ok_or(KernelError::InvalidArgument)?;
        if entry.first_lba % SECTORS_PER_BLOCK != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let lba_start = entry.first_lba / SECTORS_PER_BLOCK;
        let lba_count = entry.sector_count() / SECTORS_PER_BLOCK;
        Ok(BlockDevice::partition(lba_start, lba_count))
    }
}

fn read_sector(disk: &BlockDevice, sector: u64, out: &mut [u8; SECTOR_SIZE as usize]) -> KernelResult<()> {
    let block_num = sector / SECTORS_PER_BLOCK;
    let offset = ((sector % SECTORS_PER_BLOCK) * SECTOR_SIZE) as usize;
    let mut block = [0u8; BLOCK_SIZE];
    disk.read_block(block_num, &mut block)?;
    out.copy_from_slice(&block[offset..offset + SECTOR_SIZE as usize]);
    Ok(())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

/// The three sanity checks a GPT header must pass before `entry_lba`/
/// `entry_count`/`entry_size` are trusted to drive a read loop: a plausible
/// `header_size`, a bounded `num_entries`, and a bounded total entry-array
/// footprint. Kept free of any I/O so it can be exercised directly.
fn gpt_header_sane(header_size: usize, entry_count: usize, entry_size: usize) -> bool {
    if header_size < GPT_MIN_HEADER_SIZE || header_size > SECTOR_SIZE as usize {
        return false;
    }
    if entry_count == 0 || entry_count > GPT_MAX_NUM_ENTRIES {
        return false;
    }
    if entry_size < 128 || entry_size > SECTOR_SIZE as usize {
        return false;
    }
    let entry_array_sectors = (entry_count * entry_size).div_ceil(SECTOR_SIZE as usize) as u64;
    entry_array_sectors <= GPT_MAX_ENTRY_ARRAY_SECTORS
}

/// Whether an MBR partition-type byte marks a slot to skip rather than
/// register: unused (`0`) or protective-MBR (`0xEE`, meaning the real
/// partition table is GPT).
fn mbr_type_is_skippable(partition_type: u8) -> bool {
    partition_type == 0 || partition_type == MBR_PROTECTIVE_TYPE
}

/// Parses the GUID Partition Table header at LBA 1 and every entry in its
/// partition entry array, skipping unused (all-zero type GUID) slots.
/// `header_size`, `num_entries`, and the total entry-array footprint are all
/// bounds-checked before any of them drive a loop or an index, so a
/// corrupted header can't turn into an unbounded number of sector reads.
/// Entries past `MAX_PARTITIONS` are dropped rather than causing an error.
fn parse_gpt(disk: &BlockDevice, parent_name: &str) -> KernelResult<PartitionTable> {
    let mut header = [0u8; SECTOR_SIZE as usize];
    read_sector(disk, 1, &mut header)?;

    if header[0..8] != GPT_SIGNATURE {
        return Err(KernelError::InvalidArgument);
    }

    let header_size = read_u32(&header, 12) as usize;
    let entry_lba = read_u64(&header, 72);
    let entry_count = read_u32(&header, 80) as usize;
    let entry_size = read_u32(&header, 84) as usize;
    if !gpt_header_sane(header_size, entry_count, entry_size) {
        return Err(KernelError::InvalidArgument);
    }

    let entries_per_sector = SECTOR_SIZE as usize / entry_size;
    let mut table = PartitionTable::empty();

    let mut remaining = entry_count;
    let mut sector = entry_lba;
    let mut sector_buf = [0u8; SECTOR_SIZE as usize];
    while remaining > 0 && table.len() < MAX_PARTITIONS {
        read_sector(disk, sector, &mut sector_buf)?;
        for i in 0..entries_per_sector.min(remaining) {
            let off = i * entry_size;
            let type_guid_bytes = &sector_buf[off..off + 16];
            if type_guid_bytes.iter().all(|&b| b == 0) {
                continue;
            }
            let first_lba = read_u64(&sector_buf, off + 32);
            let last_lba = read_u64(&sector_buf, off + 40);
            if last_lba < first_lba {
                continue;
            }

            let mut type_guid = [0u8; 16];
            type_guid.copy_from_slice(type_guid_bytes);
            let mut unique_guid = [0u8; 16];
            unique_guid.copy_from_slice(&sector_buf[off + 16..off + 32]);

            let name = format!("{}p{}", parent_name, table.len() + 1);
            if !table.push(PartitionEntry {
                first_lba,
                last_lba,
                name,
                provenance: Provenance::Gpt { type_guid, unique_guid },
            }) {
                break;
            }
        }
        remaining = remaining.saturating_sub(entries_per_sector);
        sector += 1;
    }

    Ok(table)
}

/// Parses the classic MBR partition table at LBA 0: four 16-byte entries
/// starting at offset 446, validated by the 0x55AA boot signature.
/// Protective-MBR entries (type `0xEE`, marking a GPT disk) are skipped
/// just like empty (type `0`) slots. Extended/logical partitions are not
/// walked.
fn parse_mbr(disk: &BlockDevice, parent_name: &str) -> KernelResult<PartitionTable> {
    let mut sector = [0u8; SECTOR_SIZE as usize];
    read_sector(disk, 0, &mut sector)?;

    if sector[510..512] != MBR_BOOT_SIGNATURE {
        return Err(KernelError::InvalidArgument);
    }

    let mut table = PartitionTable::empty();
    for i in 0..4 {
        let off = 446 + i * 16;
        let partition_type = sector[off + 4];
        if mbr_type_is_skippable(partition_type) {
            continue;
        }
        let first_lba = read_u32(&sector, off + 8) as u64;
        let sector_count = read_u32(&sector, off + 12) as u64;
        if sector_count == 0 {
            continue;
        }
        let name = format!("{}p{}", parent_name, table.len() + 1);
        table.push(PartitionEntry {
            first_lba,
            last_lba: first_lba + sector_count - 1,
            name,
            provenance: Provenance::Mbr { partition_type },
        });
    }

    Ok(table)
}

/// Tries GPT first, falls back to MBR. An unpartitioned or unrecognized
/// disk yields an empty table rather than an error — callers decide whether
/// that's fatal. `parent_name` seeds the `<parent>p<N>` naming scheme for
/// whatever partitions are found.
pub fn scan(disk: &BlockDevice, parent_name: &str) -> PartitionTable {
    match parse_gpt(disk, parent_name) {
        Ok(table) => table,
        Err(_) => parse_mbr(disk, parent_name).unwrap_or_else(|_| PartitionTable::empty()),
    }
}

#[cfg(test)]
mod partition_tests {
    use super::*;

    fn build_mbr_sector(entries: &[(u8, u32, u32)]) -> [u8; SECTOR_SIZE as usize] {
        let mut sector = [0u8; SECTOR_SIZE as usize];
        for (i, (ptype, first_lba, count)) in entries.iter().enumerate() {
            let off = 446 + i * 16;
            sector[off + 4] = *ptype;
            sector[off + 8..off + 12].copy_from_slice(&first_lba.to_le_bytes());
            sector[off + 12..off + 16].copy_from_slice(&count.to_le_bytes());
        }
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    #[test_case]
    fn mbr_entries_parse_from_raw_sector() {
        let sector = build_mbr_sector(&[(0x83, 2048, 204800), (0, 0, 0), (0, 0, 0), (0, 0, 0)]);
        assert_eq!(sector[510..512], MBR_BOOT_SIGNATURE);

        let off = 446;
        let ptype = sector[off + 4];
        let first_lba = read_u32(&sector, off + 8) as u64;
        let count = read_u32(&sector, off + 12) as u64;
        assert_eq!(ptype, 0x83);
        assert_eq!(first_lba, 2048);
        assert_eq!(count, 204800);
    }

    #[test_case]
    fn mbr_type_zero_and_protective_are_skippable_but_real_types_are_not() {
        assert!(mbr_type_is_skippable(0));
        assert!(mbr_type_is_skippable(MBR_PROTECTIVE_TYPE));
        assert!(!mbr_type_is_skippable(0x83));
        assert!(!mbr_type_is_skippable(0x07));
    }

    #[test_case]
    fn gpt_signature_bytes_match_on_disk_magic() {
        assert_eq!(&GPT_SIGNATURE, b"EFI PART");
    }

    #[test_case]
    fn gpt_header_sane_accepts_a_realistic_header() {
        assert!(gpt_header_sane(92, 128, 128));
    }

    #[test_case]
    fn gpt_header_sane_rejects_undersized_header_size() {
        assert!(!gpt_header_sane(GPT_MIN_HEADER_SIZE - 1, 128, 128));
    }

    #[test_case]
    fn gpt_header_sane_rejects_zero_num_entries() {
        assert!(!gpt_header_sane(92, 0, 128));
    }

    #[test_case]
    fn gpt_header_sane_rejects_num_entries_over_the_cap() {
        assert!(!gpt_header_sane(92, GPT_MAX_NUM_ENTRIES + 1, 128));
    }

    #[test_case]
    fn gpt_header_sane_rejects_an_entry_array_too_big_to_fit_the_sector_cap() {
        // 4096 entries * 128 bytes = 512 KiB = 1024 sectors, right at the
        // cap; one more entry should push it over.
        assert!(gpt_header_sane(92, GPT_MAX_NUM_ENTRIES, 128));
        assert!(!gpt_header_sane(92, GPT_MAX_NUM_ENTRIES, 256));
    }

    fn sample_entry(n: u64) -> PartitionEntry {
        PartitionEntry {
            first_lba: n * 100,
            last_lba: n * 100 + 99,
            name: format!("disk0p{}", n + 1),
            provenance: Provenance::Mbr { partition_type: 0x83 },
        }
    }

    #[test_case]
    fn partition_table_push_respects_capacity() {
        let mut table = PartitionTable::empty();
        for i in 0..MAX_PARTITIONS {
            assert!(table.push(sample_entry(i as u64)));
        }
        assert!(!table.push(sample_entry(MAX_PARTITIONS as u64)));
        assert_eq!(table.len(), MAX_PARTITIONS);
    }

    #[test_case]
    fn pushed_entries_are_named_in_parent_p_n_order() {
        let mut table = PartitionTable::empty();
        table.push(sample_entry(0));
        table.push(sample_entry(1));
        assert_eq!(table.get(0).unwrap().name, "disk0p1");
        assert_eq!(table.get(1).unwrap().name, "disk0p2");
    }

    #[test_case]
    fn sector_count_is_inclusive_of_last_lba() {
        let entry = sample_entry(0);
        assert_eq!(entry.sector_count(), 100);
    }
}
