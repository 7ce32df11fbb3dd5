use std::io;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Name already exists")]
    NameExists,
    #[error("No free descriptor")]
    DescriptorTableFull,
    #[error("No free directory slot")]
    DirectoryFull,
    #[error("No free block")]
    DiskFull,
    #[error("Open file table is full")]
    OftFull,
    #[error("Not found")]
    NotFound,
    #[error("Invalid open file table index")]
    InvalidOft,
    #[error("Invalid seek position")]
    InvalidSeek,
    #[error("Invalid name")]
    InvalidName,
    #[error("Snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    #[error("Encode: {0}")]
    Encode(#[from] bincode::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
