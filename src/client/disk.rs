use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use super::torrent::FileEntry;

/// One logical byte array laid over the torrent's files, in order.
#[derive(Debug)]
pub struct DiskStore {
    files: Vec<File>,
    // offsets[i] is where file i starts; the last entry is the total length.
    offsets: Vec<usize>,
}

impl DiskStore {
    /// Opens (creating if needed) every file under `root`, sized to its
    /// entry. Existing contents are kept so a download can resume.
    pub fn open(root: &Path, entries: &[FileEntry]) -> io::Result<Self> {
        let mut files = Vec::with_capacity(entries.len());
        let mut offsets = Vec::with_capacity(entries.len() + 1);
        let mut offset = 0;

        for entry in entries {
            let path = root.join(&entry.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            if file.metadata()?.len() != entry.length as u64 {
                file.set_len(entry.length as u64)?;
            }
            debug!(path = %path.display(), length = entry.length, "opened backing file");
            files.push(file);
            offsets.push(offset);
            offset += entry.length;
        }
        offsets.push(offset);

        Ok(DiskStore { files, offsets })
    }

    pub fn len(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self, start: usize, end: usize) -> io::Result<Vec<u8>> {
        let mut data = vec![0; end.saturating_sub(start)];
        self.for_each_span(start, end, |file, file_offset, range| {
            let mut handle = file;
            handle.seek(SeekFrom::Start(file_offset as u64))?;
            handle.read_exact(&mut data[range])
        })?;
        Ok(data)
    }

    pub fn write(&mut self, start: usize, data: &[u8]) -> io::Result<()> {
        // File is unbuffered, so write_all hands the bytes to the OS directly.
        self.for_each_span(start, start + data.len(), |file, file_offset, range| {
            let mut handle = file;
            handle.seek(SeekFrom::Start(file_offset as u64))?;
            handle.write_all(&data[range])
        })
    }

    pub fn zero(&mut self, start: usize, end: usize) -> io::Result<()> {
        let zeros = vec![0; end.saturating_sub(start)];
        self.write(start, &zeros)
    }

    // Splits [start, end) into per-file pieces. `range` is relative to start.
    fn for_each_span<F>(&self, start: usize, end: usize, mut f: F) -> io::Result<()>
    where
        F: FnMut(&File, usize, std::ops::Range<usize>) -> io::Result<()>,
    {
        assert!(
            start <= end && end <= self.len(),
            "disk access {}..{} outside 0..{}",
            start,
            end,
            self.len()
        );
        let mut pos = start;
        while pos < end {
            // First file whose end lies past pos; skips empty files.
            let index = self.offsets[1..].partition_point(|&file_end| file_end <= pos);
            let file_start = self.offsets[index];
            let file_end = self.offsets[index + 1];
            let chunk_end = end.min(file_end);
            f(&self.files[index], pos - file_start, pos - start..chunk_end - start)?;
            pos = chunk_end;
        }
        Ok(())
    }
}
