use std::path::{Path, PathBuf};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::error::BenchError;

pub const PAGE_SHIFT: u32 = 12;

/// Shape of every read: its size and the page range it may land in.
#[derive(Debug, Clone, clap::Args)]
pub struct ReadShape {
    /// log2 of the read size in bytes (9 = 512 bytes, at most one page)
    #[clap(long, default_value_t = 9)]
    pub read_size_shift: u32,
    /// Reads land on pages [0, max_page_index) of each file
    #[clap(long, default_value_t = 1 << 23)]
    pub max_page_index: u64,
    /// Go through the page cache instead of opening with O_DIRECT
    #[clap(long)]
    pub buffered: bool,
}

impl ReadShape {
    pub fn read_size(&self) -> usize {
        1 << self.read_size_shift
    }

    pub fn disk_access_kind(&self) -> DiskAccessKind {
        if self.buffered {
            DiskAccessKind::CachedIo
        } else {
            DiskAccessKind::DirectIo
        }
    }

    pub fn validate(&self) -> Result<(), BenchError> {
        if !(9..=PAGE_SHIFT).contains(&self.read_size_shift) {
            return Err(BenchError::InvalidConfig(format!(
                "read size shift {} outside 9..={PAGE_SHIFT}",
                self.read_size_shift
            )));
        }
        if self.max_page_index == 0 || self.max_page_index > u64::MAX >> PAGE_SHIFT {
            return Err(BenchError::InvalidConfig(format!(
                "max page index {} out of range",
                self.max_page_index
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskAccessKind {
    DirectIo,
    CachedIo,
}

pub fn open_file_direct_io(
    disk_access_kind: DiskAccessKind,
    path: &Path,
) -> Result<std::fs::File, BenchError> {
    use std::os::unix::prelude::OpenOptionsExt;
    let mut options = std::fs::OpenOptions::new();
    options.read(true);
    match disk_access_kind {
        DiskAccessKind::DirectIo => {
            options.custom_flags(libc::O_DIRECT);
        }
        DiskAccessKind::CachedIo => {}
    }
    options.open(path).map_err(|source| BenchError::OpenFile {
        path: path.to_owned(),
        source,
    })
}

pub fn open_all(
    disk_access_kind: DiskAccessKind,
    paths: &[PathBuf],
) -> Result<Vec<std::fs::File>, BenchError> {
    paths
        .iter()
        .map(|path| open_file_direct_io(disk_access_kind, path))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum PlacementKind {
    /// Target derived from the slot and round, reproducible across runs
    #[default]
    Slot,
    /// Target drawn from one process-wide generator
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub file_index: u32,
    pub page_index: u64,
}

impl Target {
    pub fn pick<R: Rng>(rng: &mut R, num_files: u32, max_page_index: u64) -> Self {
        Target {
            file_index: rng.gen_range(0..num_files),
            page_index: rng.gen_range(0..max_page_index),
        }
    }

    pub fn offset(&self) -> u64 {
        self.page_index << PAGE_SHIFT
    }
}

/// Chooses which registered file and page each submission reads.
pub struct Placement {
    kind: PlacementKind,
    num_files: u32,
    max_page_index: u64,
    rng: StdRng,
}

impl Placement {
    pub fn new(
        kind: PlacementKind,
        num_files: usize,
        max_page_index: u64,
    ) -> Result<Self, BenchError> {
        let num_files = u32::try_from(num_files)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| BenchError::InvalidConfig(format!("{num_files} target files")))?;
        if max_page_index == 0 {
            return Err(BenchError::InvalidConfig("max page index is 0".into()));
        }
        Ok(Placement {
            kind,
            num_files,
            max_page_index,
            rng: StdRng::from_entropy(),
        })
    }

    /// Target for round `round` of slot `tag`.
    pub fn target(&mut self, tag: u64, round: u32) -> Target {
        match self.kind {
            PlacementKind::Slot => {
                let seed = tag.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ u64::from(round);
                Target::pick(
                    &mut StdRng::seed_from_u64(seed),
                    self.num_files,
                    self.max_page_index,
                )
            }
            PlacementKind::Random => {
                Target::pick(&mut self.rng, self.num_files, self.max_page_index)
            }
        }
    }
}
