use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("out of bounds: sector={sector} count={count} capacity={capacity}")]
    OutOfBounds {
        sector: u64,
        count: u64,
        capacity: u64,
    },

    #[error("block device is read-only")]
    ReadOnly,

    #[error("buffer length {len} is not a multiple of the sector size")]
    UnalignedLength { len: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
