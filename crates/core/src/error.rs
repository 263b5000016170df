use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("bit span needs {required} bytes, buffer has {actual}")]
    BufferTooSmall { required: usize, actual: usize },

    #[error("invalid bit count: {0}")]
    InvalidBitCount(usize),

    #[error("insufficient bits: requested {requested}, available {available}")]
    InsufficientBits { requested: usize, available: usize },

    #[error("value {value} of field `{field}` does not fit in {bits} bits")]
    FieldOverflow {
        field: &'static str,
        value: u64,
        bits: usize,
    },

    #[error("level id {0} is already registered")]
    DuplicateLevelId(u8),

    #[error("level id {id} outside 1..={max}")]
    LevelIdOutOfRange { id: u8, max: u8 },

    #[error("converter registry is full ({max} converters)")]
    RegistryFull { max: u8 },

    #[error("converter `{converter}` announced {expected} bits but wrote {written}")]
    LengthMismatch {
        converter: &'static str,
        expected: usize,
        written: usize,
    },

    #[error("wire type space of {bits} bits is exhausted")]
    WireTypeSpaceExhausted { bits: u8 },

    #[error("unknown wire type id {0}")]
    UnknownWireType(u32),

    #[error("no registered converter can build a mini-packet")]
    NoMiniPacketConverter,

    #[error("invalid field widths: {0}")]
    InvalidWidths(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;
