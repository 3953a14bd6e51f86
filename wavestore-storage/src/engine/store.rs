//! TSC file store
//!
//! Files live under `<root>/<measure_id>/<device_id>/<name>.tsc`; the
//! metadata index records only the file name, so `to_abs_path` re-derives
//! the on-disk location from the stream ids. The optimizer writes
//! replacement files through a staging handle that only takes its final
//! name after the index transaction commits.

use super::index::BlockRow;
use wavestore_core::{Error, Result};

use tempfile::NamedTempFile;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// One coalesced read spanning adjacent blocks of a single file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CondensedRead {
    pub file_id: i64,
    pub start_byte: u64,
    pub num_bytes: u64,
}

/// Coalesces touching same-file block reads into single I/O operations
///
/// Blocks are taken in the given order; a read is extended while the next
/// block continues exactly where the previous one ended in the same file.
pub fn condense_read_list(blocks: &[BlockRow]) -> Vec<CondensedRead> {
    let mut reads: Vec<CondensedRead> = Vec::new();
    for block in blocks {
        if let Some(last) = reads.last_mut() {
            if last.file_id == block.file_id
                && last.start_byte + last.num_bytes == block.start_byte
            {
                last.num_bytes += block.num_bytes;
                continue;
            }
        }
        reads.push(CondensedRead {
            file_id: block.file_id,
            start_byte: block.start_byte,
            num_bytes: block.num_bytes,
        });
    }
    reads
}

/// Directory tree of TSC files
pub struct TscFileStore {
    root: PathBuf,
}

impl TscFileStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stream_dir(&self, measure_id: i64, device_id: i64) -> PathBuf {
        self.root.join(measure_id.to_string()).join(device_id.to_string())
    }

    /// Resolves an index-relative file name to its on-disk location
    pub fn to_abs_path(&self, file_name: &str, measure_id: i64, device_id: i64) -> PathBuf {
        self.stream_dir(measure_id, device_id).join(file_name)
    }

    fn generate_file_name() -> String {
        format!("{:016x}.tsc", rand::random::<u64>())
    }

    /// Writes a new TSC file, returning its index-relative name
    pub fn write_file(&self, measure_id: i64, device_id: i64, bytes: &[u8]) -> Result<String> {
        let dir = self.stream_dir(measure_id, device_id);
        std::fs::create_dir_all(&dir)?;
        let file_name = Self::generate_file_name();
        let mut file = File::create(dir.join(&file_name))?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(file_name)
    }

    /// Writes bytes to a staging file next to its final location
    ///
    /// The file only becomes visible under its `.tsc` name once
    /// [`StagedTscFile::promote`] runs; dropping the handle removes the
    /// staging file.
    pub fn stage_file(
        &self,
        measure_id: i64,
        device_id: i64,
        bytes: &[u8],
    ) -> Result<StagedTscFile> {
        let dir = self.stream_dir(measure_id, device_id);
        std::fs::create_dir_all(&dir)?;
        let file_name = Self::generate_file_name();

        let mut temp = tempfile::Builder::new()
            .prefix(".staging-")
            .tempfile_in(&dir)
            .map_err(|e| Error::Io(e))?;
        temp.write_all(bytes)?;
        temp.flush()?;

        Ok(StagedTscFile {
            temp,
            final_path: dir.join(&file_name),
            file_name,
        })
    }

    /// Reads `num_bytes` at `start_byte` from the given file
    pub fn read_range(&self, abs_path: &Path, start_byte: u64, num_bytes: u64) -> Result<Vec<u8>> {
        let mut file = File::open(abs_path)?;
        file.seek(SeekFrom::Start(start_byte))?;
        let mut buf = vec![0u8; num_bytes as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads the given blocks as one condensed byte stream
    ///
    /// `resolve` maps a file id to its absolute path; block bytes are
    /// concatenated in the order the blocks were given.
    pub fn read_blocks(
        &self,
        blocks: &[BlockRow],
        mut resolve: impl FnMut(i64) -> Result<PathBuf>,
    ) -> Result<Vec<u8>> {
        let reads = condense_read_list(blocks);
        let total: u64 = reads.iter().map(|r| r.num_bytes).sum();
        let mut out = Vec::with_capacity(total as usize);
        for read in reads {
            let path = resolve(read.file_id)?;
            out.extend(self.read_range(&path, read.start_byte, read.num_bytes)?);
        }
        Ok(out)
    }

    /// Walks the store and unlinks every file whose name is in `names`
    ///
    /// Returns how many files were removed.
    pub fn remove_files_by_name(&self, names: &std::collections::HashSet<String>) -> Result<usize> {
        let mut removed = 0;
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if names.contains(name) {
                        log::info!("deleting unreferenced TSC file {}", path.display());
                        std::fs::remove_file(&path)?;
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// A TSC file written but not yet visible under its final name
pub struct StagedTscFile {
    temp: NamedTempFile,
    final_path: PathBuf,
    file_name: String,
}

impl StagedTscFile {
    /// Index-relative name the file will have after promotion
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Moves the staging file to its final name
    pub fn promote(self) -> Result<()> {
        self.temp
            .persist(&self.final_path)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}
