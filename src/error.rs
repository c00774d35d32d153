use crate::repr::BlockId;
use std::io;

/// String like type that occupies the same space as one usize
type TinyStr = Box<String>;

/// Errors returned by the tree and the block stores.
///
/// Any error returned from [crate::BpTree::add] may leave the tree partially mutated,
/// the last durably written metadata remains the recovery point.
#[derive(Debug, Display, Error)]
#[display("{:?}", self)]
#[non_exhaustive]
pub enum Error {
    /// The supplied key doesn't have the tree fixed key size
    KeySizeMismatch { expected: usize, got: usize },
    /// The block type tag is not recognized, usually a sign of corruption
    UnknownBlockType { block: BlockId, flags: u8 },
    /// The block store can't satisfy an allocation
    AllocationFailure { requested: u64, available: u64 },
    /// A copy destination is smaller than its source
    InsufficientBuffer { needed: usize, available: usize },
    /// A leaf expected to hold entries is empty
    EmptyBlock(#[error(not(source))] BlockId),
    #[allow(missing_docs)]
    Validation(#[error(not(source))] TinyStr),
    #[allow(missing_docs)]
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        let kind = match &value {
            Error::Io(i) => i.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, value)
    }
}

macro_rules! error_validation {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::Validation(msg.into())
    }}
}

macro_rules! io_invalid_data {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        let io_error = ::std::io::Error::new(::std::io::ErrorKind::InvalidData, msg);
        crate::Error::Io(io_error)
    }}
}

pub(crate) use error_validation;
pub(crate) use io_invalid_data;
