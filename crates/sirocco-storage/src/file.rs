use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{DiskError, Result};
use crate::{checked_span, BlockBackend, BlockMode, Submission, SECTOR_SIZE};

/// A raw disk image backed by a host file.
///
/// The sector count is fixed at open time (`file length / 512`; a trailing
/// partial sector is not addressable). In [`BlockMode::Snapshot`] the image
/// is opened read-only and guest writes land in a per-sector in-memory
/// table that shadows the file until the device is torn down.
pub struct FileDisk {
    file: File,
    mode: BlockMode,
    nb_sectors: u64,
    /// One slot per sector; populated lazily in snapshot mode only.
    sector_table: Vec<Option<Box<[u8; SECTOR_SIZE]>>>,
}

impl FileDisk {
    pub fn open(path: impl AsRef<Path>, mode: BlockMode) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(mode == BlockMode::ReadWrite)
            .open(path)?;
        let nb_sectors = file.metadata()?.len() / SECTOR_SIZE as u64;

        let mut sector_table = Vec::new();
        if mode == BlockMode::Snapshot {
            sector_table.resize_with(nb_sectors as usize, || None);
        }

        tracing::debug!(?path, ?mode, sectors = nb_sectors, "opened block image");
        Ok(Self {
            file,
            mode,
            nb_sectors,
            sector_table,
        })
    }

    pub fn mode(&self) -> BlockMode {
        self.mode
    }

    fn read_file(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn read_span(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let count = checked_span(sector, buf.len(), self.nb_sectors)?;
        if self.mode == BlockMode::Snapshot {
            for i in 0..count {
                let dst = &mut buf[i as usize * SECTOR_SIZE..][..SECTOR_SIZE];
                match &self.sector_table[(sector + i) as usize] {
                    Some(shadow) => dst.copy_from_slice(&shadow[..]),
                    None => {
                        let offset = (sector + i) * SECTOR_SIZE as u64;
                        self.read_file(offset, dst)?;
                    }
                }
            }
        } else {
            self.read_file(sector * SECTOR_SIZE as u64, buf)?;
        }
        Ok(())
    }

    fn write_span(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        let count = checked_span(sector, buf.len(), self.nb_sectors)?;
        match self.mode {
            BlockMode::ReadOnly => Err(DiskError::ReadOnly),
            BlockMode::ReadWrite => {
                self.file.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
                self.file.write_all(buf)?;
                Ok(())
            }
            BlockMode::Snapshot => {
                for i in 0..count {
                    let src = &buf[i as usize * SECTOR_SIZE..][..SECTOR_SIZE];
                    let slot = &mut self.sector_table[(sector + i) as usize];
                    let shadow =
                        slot.get_or_insert_with(|| Box::new([0u8; SECTOR_SIZE]));
                    shadow.copy_from_slice(src);
                }
                Ok(())
            }
        }
    }
}

impl BlockBackend for FileDisk {
    fn sector_count(&self) -> u64 {
        self.nb_sectors
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Submission {
        Submission::Complete(self.read_span(sector, buf))
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Submission {
        Submission::Complete(self.write_span(sector, buf))
    }
}
