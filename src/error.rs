//! Error types for slimjpeg

use std::fmt;

/// Result type for slimjpeg operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for slimjpeg operations
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Invalid image dimensions or stride
    InvalidDimensions {
        width: usize,
        height: usize,
        stride: usize,
    },
    /// Pixel buffer is smaller than `stride * height`
    InvalidPixelData { expected: usize, actual: usize },
    /// A single EXIF or XMP chunk would exceed the 65533-byte marker payload
    MetadataTooLarge {
        kind: &'static str,
        size: usize,
        max: usize,
    },
    /// ICC profile would need more than 255 chunks
    IccpTooManyChunks { chunks: usize },
    /// Extended XMP payload lacks the `xmpNote:HasExtendedXMP` placeholder
    XmpMissingExtensionTag,
    /// Internal encoder error
    Internal(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidDimensions {
                width,
                height,
                stride,
            } => {
                write!(
                    f,
                    "Invalid dimensions {}x{} with stride {}",
                    width, height, stride
                )
            }
            Error::InvalidPixelData { expected, actual } => {
                write!(f, "Expected {} bytes of pixel data, got {}", expected, actual)
            }
            Error::MetadataTooLarge { kind, size, max } => {
                write!(f, "{} payload of {} bytes exceeds {} bytes", kind, size, max)
            }
            Error::IccpTooManyChunks { chunks } => {
                write!(f, "ICC profile needs {} chunks, at most 255 allowed", chunks)
            }
            Error::XmpMissingExtensionTag => {
                write!(f, "Extended XMP payload has no xmpNote:HasExtendedXMP tag")
            }
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
