//! Errors

use std::{io, string};

use thiserror::Error;

/// Errors generated by this crate.
///
/// Not every variant can occur from both the read and write side, but
/// callers should not assume any particular one is impossible.
#[derive(Error, Debug)]
pub enum SquashfsError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("deku error: {0:?}")]
    Deku(#[from] deku::DekuError),

    #[error("string error: {0:?}")]
    StringUtf8(#[from] string::FromUtf8Error),

    #[error("string error: {0:?}")]
    StrUtf8(#[from] std::str::Utf8Error),

    #[error("corrupted or invalid squashfs image: {0}")]
    Corrupted(&'static str),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("value overflowed a fixed-width on-disk field")]
    Overflow,

    #[error("reference pointed outside of the image bounds")]
    OutOfBounds,

    #[error("superblock magic did not match any known squashfs magic")]
    SuperMagic,

    #[error("superblock version is not supported")]
    SuperVersion,

    #[error("superblock declared an implausible total image size")]
    SuperBlockSize,

    #[error("not a regular file")]
    NotFile,

    #[error("not a directory")]
    NotDir,

    #[error("no such entry")]
    NoEntry,

    #[error("symlink resolution formed a cycle")]
    LinkLoop,

    #[error("invalid argument: {0}")]
    ArgInvalid(&'static str),

    #[error("operation called out of sequence: {0}")]
    Sequence(&'static str),

    #[error("codec error: {0}")]
    Codec(Box<dyn std::error::Error + Send + Sync>),
}

impl From<SquashfsError> for io::Error {
    fn from(value: SquashfsError) -> Self {
        use SquashfsError::*;
        match value {
            Io(io) => io,
            Deku(e) => e.into(),
            StringUtf8(e) => Self::new(io::ErrorKind::InvalidData, e),
            StrUtf8(e) => Self::new(io::ErrorKind::InvalidData, e),
            e @ Unsupported(_) => Self::new(io::ErrorKind::Unsupported, e),
            e @ NoEntry => Self::new(io::ErrorKind::NotFound, e),
            e @ (Corrupted(_)
            | Overflow
            | OutOfBounds
            | SuperMagic
            | SuperVersion
            | SuperBlockSize
            | NotFile
            | NotDir
            | LinkLoop
            | ArgInvalid(_)
            | Sequence(_)
            | Codec(_)) => Self::new(io::ErrorKind::InvalidData, e),
        }
    }
}
