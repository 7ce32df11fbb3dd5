// Copyright 2024 Mara Kessler
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! File system core: owns an [`LDisk`] and an [`OpenFileTable`], and
//! implements allocation, the directory, and the byte-granular file
//! operations on top of them.

use std::io::{Read, Write};

use log::{debug, info, warn};
use pvfs_disk::{
    pack_name, unpack_name, Descriptor, DirectoryEntry, LDisk, DATA_BLOCK_OFFSET,
    DIRECTORY_BLOCKS, DIRECTORY_DESCRIPTOR, MAX_FILE_LENGTH, NUM_BLOCKS, NUM_DESCRIPTORS,
    NUM_DIRECTORY_ENTRIES,
};
pub use pvfs_err::{Error, Result};
use serde::{Deserialize, Serialize};

/// Number of slots in the open file table.
pub const OFT_SIZE: usize = 4;
/// Bytes per block (also: bytes per descriptor reference slot).
pub const BLOCK_SIZE: usize = 64;

/// One slot of the open file table: the cached contents of one data block,
/// the byte position within the file, which descriptor is open, and the
/// file's length as of open (refreshed as the file grows).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OpenFileTableEntry {
    buffer: [i32; 16],
    current_pos: i32,
    descriptor_index: i32,
    file_length: i32,
}

impl OpenFileTableEntry {
    const FREE: OpenFileTableEntry = OpenFileTableEntry {
        buffer: [0; 16],
        current_pos: -1,
        descriptor_index: -1,
        file_length: -1,
    };

    fn is_free(&self) -> bool {
        self.current_pos == -1
    }

    /// Reads the byte at `current_pos % 64` out of the cached buffer.
    fn read_byte(&self) -> u8 {
        let p = (self.current_pos as usize) % BLOCK_SIZE;
        let cell = p / 4;
        let shift = 8 * (3 - p % 4);
        ((self.buffer[cell] >> shift) & 0xFF) as u8
    }

    /// Writes `byte` at `current_pos % 64` into the cached buffer.
    fn write_byte(&mut self, byte: u8) {
        let p = (self.current_pos as usize) % BLOCK_SIZE;
        let cell = p / 4;
        let shift = 8 * (3 - p % 4);
        self.buffer[cell] = (self.buffer[cell] & !(0xFFi32 << shift)) | ((byte as i32) << shift);
    }
}

impl Default for OpenFileTableEntry {
    fn default() -> Self {
        Self::FREE
    }
}

/// Four cached file buffers. Slot 0 is permanently bound to the directory
/// (descriptor 0) and is never freed by [`FileSystem::close`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenFileTable {
    entries: [OpenFileTableEntry; OFT_SIZE],
}

impl OpenFileTable {
    fn new() -> Self {
        Self {
            entries: [OpenFileTableEntry::FREE; OFT_SIZE],
        }
    }

    fn find_free(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.is_free())
    }
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A previously-saved snapshot of the disk and open file table, as written
/// by [`FileSystem::save`] and read back by [`FileSystem::restore`].
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    disk: LDisk,
    oft: OpenFileTable,
}

/// The file system: a disk plus the open file table caching blocks from it.
pub struct FileSystem {
    disk: LDisk,
    oft: OpenFileTable,
}

impl FileSystem {
    /// Builds a fresh disk: the bitmap/descriptor region (blocks 0-6) and
    /// the directory's own data blocks (7-9) marked used, the directory
    /// descriptor populated, and open file table slot 0 bound to it.
    pub fn initialize() -> Self {
        let mut disk = LDisk::new();
        for b in DIRECTORY_BLOCKS {
            disk.set_block_used(b);
        }
        disk.write_descriptor(
            DIRECTORY_DESCRIPTOR,
            Descriptor {
                file_length: 48,
                refs: [0, 1, 2],
            },
        );

        let mut oft = OpenFileTable::new();
        oft.entries[0] = OpenFileTableEntry {
            buffer: [0; 16],
            current_pos: 0,
            descriptor_index: DIRECTORY_DESCRIPTOR as i32,
            file_length: MAX_FILE_LENGTH,
        };

        info!("disk initialized");
        Self { disk, oft }
    }

    /// Restores a [`FileSystem`] from a previously-saved snapshot.
    pub fn restore(reader: impl Read) -> Result<Self> {
        let snapshot: Snapshot = bincode::deserialize_from(reader)
            .map_err(pvfs_err::SnapshotError::from)
            .map_err(Error::from)?;
        info!("disk restored from snapshot");
        Ok(Self {
            disk: snapshot.disk,
            oft: snapshot.oft,
        })
    }

    /// Closes every open file (slot 0 excepted, since it never closes) and
    /// writes the disk and open file table out as a snapshot.
    pub fn save(&mut self, mut writer: impl Write) -> Result<()> {
        for k in 0..OFT_SIZE {
            // Slot 0 is a permanent no-op; the others are either open
            // (and get flushed) or already closed, which is not an error
            // here.
            let _ = self.close(k);
        }
        let snapshot = Snapshot {
            disk: self.disk.clone(),
            oft: self.oft.clone(),
        };
        bincode::serialize_into(&mut writer, &snapshot)
            .map_err(pvfs_err::SnapshotError::from)
            .map_err(Error::from)?;
        info!("disk saved");
        Ok(())
    }

    // ---- allocation primitives ----------------------------------------

    fn find_free_block(&self) -> Option<usize> {
        (0..NUM_BLOCKS).find(|&b| self.disk.is_block_free(b))
    }

    fn find_free_descriptor(&self) -> Option<usize> {
        let descriptors = self.disk.read_descriptors();
        (1..NUM_DESCRIPTORS).find(|&i| descriptors[i].is_free())
    }

    fn find_free_directory(&self) -> Option<usize> {
        let directory = self.disk.read_directory();
        (0..NUM_DIRECTORY_ENTRIES).find(|&i| directory[i].is_free())
    }

    fn find_by_name(&self, name: &str) -> Result<(usize, DirectoryEntry)> {
        let packed = pack_name(name)?;
        let directory = self.disk.read_directory();
        directory
            .iter()
            .position(|e| !e.is_free() && e.name_packed == packed)
            .map(|i| (i, directory[i]))
            .ok_or_else(|| {
                warn!("{name} not found");
                Error::NotFound
            })
    }

    // ---- file operations ------------------------------------------------

    /// Creates a new, empty file named `name`.
    pub fn create(&mut self, name: &str) -> Result<()> {
        let packed = pack_name(name)?;
        if self
            .disk
            .read_directory()
            .iter()
            .any(|e| !e.is_free() && e.name_packed == packed)
        {
            warn!("create: {name} already exists");
            return Err(Error::NameExists);
        }
        let descriptor_index = self.find_free_descriptor().ok_or_else(|| {
            warn!("create: descriptor table full");
            Error::DescriptorTableFull
        })?;
        let directory_index = self.find_free_directory().ok_or_else(|| {
            warn!("create: directory full");
            Error::DirectoryFull
        })?;

        self.disk.write_descriptor(
            descriptor_index,
            Descriptor {
                file_length: 0,
                refs: [-1, -1, -1],
            },
        );
        self.disk.write_directory_entry(
            directory_index,
            DirectoryEntry {
                name_packed: packed,
                descriptor_index: descriptor_index as i32,
            },
        );
        debug!("created {name} (descriptor {descriptor_index}, directory slot {directory_index})");
        Ok(())
    }

    /// Destroys the file named `name`, releasing its descriptor, directory
    /// entry and data blocks. Always persists the bitmap change.
    pub fn destroy(&mut self, name: &str) -> Result<()> {
        let (directory_index, entry) = self.find_by_name(name)?;
        let descriptor = self.disk.read_descriptors()[entry.descriptor_index as usize];

        self.disk
            .write_descriptor(entry.descriptor_index as usize, Descriptor::FREE);
        self.disk
            .write_directory_entry(directory_index, DirectoryEntry::FREE);

        for r in descriptor.refs {
            if r != -1 {
                self.disk.clear_block_used(r as usize + DATA_BLOCK_OFFSET);
            }
        }
        debug!("destroyed {name}");
        Ok(())
    }

    /// Opens `name`, returning the open file table slot it now occupies.
    pub fn open(&mut self, name: &str) -> Result<usize> {
        let (_, entry) = self.find_by_name(name)?;
        let descriptor_index = entry.descriptor_index as usize;
        let descriptor = self.disk.read_descriptors()[descriptor_index];

        let slot = self.oft.find_free().ok_or_else(|| {
            warn!("open: open file table full");
            Error::OftFull
        })?;

        let buffer = match descriptor.refs[0] {
            -1 => [0i32; 16],
            b => self.disk.read_block(b as usize + DATA_BLOCK_OFFSET),
        };
        self.oft.entries[slot] = OpenFileTableEntry {
            buffer,
            current_pos: 0,
            descriptor_index: descriptor_index as i32,
            file_length: descriptor.file_length,
        };
        debug!("opened {name} at slot {slot}");
        Ok(slot)
    }

    /// Closes open file table slot `k`. Slot 0 is a permanent no-op.
    pub fn close(&mut self, k: usize) -> Result<()> {
        if k == 0 {
            return Ok(());
        }
        self.checked_entry(k)?;
        self.flush(k)?;
        self.oft.entries[k] = OpenFileTableEntry::FREE;
        debug!("closed slot {k}");
        Ok(())
    }

    /// Reads up to `count` bytes from slot `k`, stopping early at the end
    /// of the file.
    pub fn read(&mut self, k: usize, count: usize) -> Result<Vec<u8>> {
        self.checked_entry(k)?;
        let mut out = Vec::with_capacity(count);
        while out.len() < count
            && self.oft.entries[k].current_pos < self.oft.entries[k].file_length
        {
            out.push(self.oft.entries[k].read_byte());
            self.advance(k)?;
            if self.oft.entries[k].current_pos == self.oft.entries[k].file_length {
                break;
            }
        }
        Ok(out)
    }

    /// Writes `count` copies of `byte` into slot `k`, stopping at the
    /// 192-byte file size ceiling. Returns the number of bytes written.
    /// If the disk runs out of free blocks mid-write, returns
    /// [`Error::DiskFull`]; bytes belonging to already-flushed blocks stay
    /// durable, the partially filled block in progress does not.
    pub fn write(&mut self, k: usize, byte: u8, count: usize) -> Result<usize> {
        self.checked_entry(k)?;
        let mut written = 0;
        while written < count && self.oft.entries[k].current_pos < MAX_FILE_LENGTH {
            self.oft.entries[k].write_byte(byte);
            self.advance(k)?;
            written += 1;
        }
        self.commit_file_length(k);
        Ok(written)
    }

    /// Moves slot `k`'s position to `pos`. Rejects `pos >= file_length`.
    ///
    /// The current block is flushed (and, if it had never crossed a
    /// boundary before, allocated) before the target block is loaded, so
    /// that loading never races the flush over the same block slot.
    pub fn lseek(&mut self, k: usize, pos: i32) -> Result<()> {
        self.checked_entry(k)?;
        if pos >= self.oft.entries[k].file_length {
            warn!("lseek: position {pos} out of range for slot {k}");
            return Err(Error::InvalidSeek);
        }
        self.flush(k)?;

        let descriptor_index = self.oft.entries[k].descriptor_index as usize;
        let refs = self.disk.descriptor_references(descriptor_index);
        let block_slot = pos as usize / BLOCK_SIZE;
        self.oft.entries[k].buffer = match refs.get(block_slot) {
            Some(&r) if r != -1 => self.disk.read_block(r as usize + DATA_BLOCK_OFFSET),
            _ => [0i32; 16],
        };
        self.oft.entries[k].current_pos = pos;
        Ok(())
    }

    /// The names of every file currently in the directory, in slot order.
    pub fn directory(&self) -> Vec<String> {
        self.disk
            .read_directory()
            .iter()
            .filter(|e| !e.is_free())
            .map(|e| unpack_name(e.name_packed))
            .collect()
    }

    // ---- internals -------------------------------------------------------

    fn checked_entry(&self, k: usize) -> Result<()> {
        match self.oft.entries.get(k) {
            Some(e) if !e.is_free() => Ok(()),
            _ => {
                warn!("open file table slot {k} is not open");
                Err(Error::InvalidOft)
            }
        }
    }

    /// Flushes slot `k`'s buffer to the block backing its current
    /// position, allocating and linking a fresh block first if the
    /// descriptor has none there yet. Fails with [`Error::DiskFull`] if no
    /// block is free to allocate.
    fn flush(&mut self, k: usize) -> Result<()> {
        let entry = &self.oft.entries[k];
        if entry.current_pos == 0 {
            // Nothing has been read or written since the position sits at
            // the very start; there is no completed block behind it to
            // flush, and for a brand-new file flushing here would allocate
            // a block that was never asked for.
            return Ok(());
        }
        let descriptor_index = entry.descriptor_index as usize;
        // The block just finished is the one preceding current_pos.
        let block_slot = (entry.current_pos as usize - 1) / BLOCK_SIZE;
        let buffer = entry.buffer;

        let mut refs = self.disk.descriptor_references(descriptor_index);
        if refs[block_slot] == -1 {
            let b = self.find_free_block().ok_or_else(|| {
                warn!("flush: disk full, slot {k} block {block_slot} not persisted");
                Error::DiskFull
            })?;
            self.disk.set_block_used(b);
            refs[block_slot] = (b - DATA_BLOCK_OFFSET) as i32;
            let mut descriptor = self.disk.read_descriptors()[descriptor_index];
            descriptor.refs = refs;
            self.disk.write_descriptor(descriptor_index, descriptor);
        }
        let block = refs[block_slot] as usize + DATA_BLOCK_OFFSET;
        self.disk.write_block(block, buffer);
        Ok(())
    }

    /// Advances slot `k`'s position by one byte, handling the 64-byte
    /// block-boundary crossing: flush the completed block (allocating it
    /// if needed) and, if another block lies ahead, preload it.
    fn advance(&mut self, k: usize) -> Result<()> {
        self.oft.entries[k].current_pos += 1;
        let pos = self.oft.entries[k].current_pos;
        if pos % BLOCK_SIZE as i32 != 0 {
            return Ok(());
        }
        self.flush(k)?;
        if pos >= MAX_FILE_LENGTH {
            return Ok(());
        }
        let descriptor_index = self.oft.entries[k].descriptor_index as usize;
        let refs = self.disk.descriptor_references(descriptor_index);
        let block_slot = pos as usize / BLOCK_SIZE;
        self.oft.entries[k].buffer = match refs.get(block_slot) {
            Some(&r) if r != -1 => self.disk.read_block(r as usize + DATA_BLOCK_OFFSET),
            _ => [0i32; 16],
        };
        Ok(())
    }

    /// Writes the in-memory file length back to the descriptor if it grew.
    fn commit_file_length(&mut self, k: usize) {
        let descriptor_index = self.oft.entries[k].descriptor_index as usize;
        let mut descriptor = self.disk.read_descriptors()[descriptor_index];
        if descriptor.file_length < self.oft.entries[k].current_pos {
            descriptor.file_length = self.oft.entries[k].current_pos;
            self.oft.entries[k].file_length = descriptor.file_length;
            self.disk.write_descriptor(descriptor_index, descriptor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() -> FileSystem {
        let _ = env_logger::builder().is_test(true).try_init();
        FileSystem::initialize()
    }

    #[test]
    fn create_then_open_then_write_then_read_round_trips() {
        let mut fs = init();
        fs.create("foo").unwrap();
        let k = fs.open("foo").unwrap();
        assert_ne!(k, 0);
        let written = fs.write(k, b'x', 10).unwrap();
        assert_eq!(written, 10);
        fs.lseek(k, 0).unwrap();
        let data = fs.read(k, 10).unwrap();
        assert_eq!(data, vec![b'x'; 10]);
    }

    #[test]
    fn write_fills_all_192_bytes_and_caps_there() {
        let mut fs = init();
        fs.create("foo").unwrap();
        let k = fs.open("foo").unwrap();
        let written = fs.write(k, b'a', 192).unwrap();
        assert_eq!(written, 192);
        fs.close(k).unwrap();

        let k = fs.open("foo").unwrap();
        fs.lseek(k, 191).unwrap();
        assert_eq!(fs.read(k, 1).unwrap(), vec![b'a']);
        assert!(fs.lseek(k, 192).is_err());
    }

    #[test]
    fn destroy_frees_descriptor_directory_and_bitmap() {
        let mut fs = init();
        fs.create("foo").unwrap();
        let k = fs.open("foo").unwrap();
        fs.write(k, b'z', 192).unwrap();
        fs.close(k).unwrap();
        fs.destroy("foo").unwrap();
        assert!(fs.directory().is_empty());

        fs.create("foo").unwrap();
        let k = fs.open("foo").unwrap();
        assert_eq!(fs.read(k, 10).unwrap().len(), 0);
    }

    #[test]
    fn create_duplicate_name_errors() {
        let mut fs = init();
        fs.create("foo").unwrap();
        assert!(fs.create("foo").is_err());
    }

    #[test]
    fn destroy_then_recreate_then_list_directory() {
        let mut fs = init();
        fs.create("foo").unwrap();
        fs.destroy("foo").unwrap();
        fs.create("foo").unwrap();
        assert_eq!(fs.directory(), vec!["foo".to_string()]);
    }

    #[test]
    fn directory_lists_names_in_slot_order() {
        let mut fs = init();
        fs.create("abcc").unwrap();
        fs.create("bcaa").unwrap();
        fs.create("cbaa").unwrap();
        assert_eq!(
            fs.directory(),
            vec!["abcc".to_string(), "bcaa".to_string(), "cbaa".to_string()]
        );
    }

    #[test]
    fn save_then_restore_round_trips_file_contents() {
        let mut fs = init();
        fs.create("foo").unwrap();
        let k = fs.open("foo").unwrap();
        fs.write(k, b'q', 70).unwrap();

        let mut buf = Vec::new();
        fs.save(&mut buf).unwrap();

        let mut restored = FileSystem::restore(buf.as_slice()).unwrap();
        assert_eq!(restored.directory(), vec!["foo".to_string()]);
        let k = restored.open("foo").unwrap();
        let data = restored.read(k, 70).unwrap();
        assert_eq!(data, vec![b'q'; 70]);
    }

    #[test]
    fn fills_descriptor_table_then_errors_cleanly() {
        let mut fs = init();
        for i in 0..23 {
            fs.create(&format!("f{i}")).unwrap();
        }
        // descriptor table (23 usable slots, index 0 reserved) is now full.
        assert!(fs.create("overflow").is_err());
        // the directory has one slot left over, so it is descriptor
        // exhaustion specifically being reported, not directory exhaustion.
        assert_eq!(fs.directory().len(), 23);
    }

    #[test]
    fn fills_data_blocks_then_write_reports_disk_full() {
        let mut fs = init();
        // 54 data blocks (10..=63) / 3 blocks per file = 18 full files.
        for i in 0..18 {
            let name = format!("f{i}");
            fs.create(&name).unwrap();
            let k = fs.open(&name).unwrap();
            assert_eq!(fs.write(k, b'x', 192).unwrap(), 192);
            fs.close(k).unwrap();
        }
        fs.create("overflow").unwrap();
        let k = fs.open("overflow").unwrap();
        assert!(matches!(fs.write(k, b'y', 64), Err(Error::DiskFull)));
    }
}
