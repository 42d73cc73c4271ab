use thiserror::Error;

/// An error that occurred when producing or consuming a whole frame.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Frame is compressed, but no compression negotiated for connection.")]
    NoCompressionNegotiated,
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received a frame from version {0}, but only versions 3 and 4 are supported")]
    VersionNotSupported(u8),
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
    #[error("Frame decompression failed.")]
    FrameDecompression,
    #[error("Frame compression failed.")]
    FrameCompression,
    #[error(transparent)]
    StdIoError(#[from] std::io::Error),
    #[error("Unrecognized response opcode {0}")]
    UnknownResponseOpcode(u8),
    #[error("Error compressing lz4 data {0}")]
    Lz4CompressError(#[from] lz4_flex::block::CompressError),
    #[error("Error decompressing lz4 data {0}")]
    Lz4DecompressError(#[from] lz4_flex::block::DecompressError),
}

/// An error that occurred when parsing or serializing a frame body.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Could not serialize frame: {0}")]
    BadData(String),
    #[error("Bad incoming data: {0}")]
    BadIncomingData(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Not enough bytes in buffer: expected {expected}, received {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("UTF8 deserialization failed: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
    #[error("Value length went out of range: {0}")]
    ValueLengthOverflow(#[from] std::num::TryFromIntError),
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(u16),
    #[error("Invalid inet length: {0}")]
    InvalidInetLength(u8),
    #[error("CQL type not supported, id: {0}")]
    TypeNotSupported(u16),
}
