//! Layered error definitions
//!
//! Categorized by source: config / hardware / transport / capacity / protocol

use thiserror::Error;

/// Unified error type
#[derive(Debug, Error)]
pub enum ContractError {
    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    // ===== Runtime Errors =====
    /// Haptic driver failure
    #[error(transparent)]
    Hardware(#[from] HwError),

    /// Radio link failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Bounded queue rejected an item
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    /// Malformed wire message
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    // ===== General Errors =====
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl ContractError {
    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Haptic driver errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HwError {
    /// Finger index outside the driver's actuator range
    #[error("finger {finger} out of range (max {max})")]
    InvalidFinger { finger: u8, max: u8 },

    /// Bus / device level failure
    #[error("haptic driver error on finger {finger}: {message}")]
    Device { finger: u8, message: String },
}

impl HwError {
    /// Create device error
    pub fn device(finger: u8, message: impl Into<String>) -> Self {
        Self::Device {
            finger,
            message: message.into(),
        }
    }
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Peer is not connected / link shut down
    #[error("link '{link}' is closed")]
    Closed { link: String },

    /// Message exceeds the link's practical payload size
    #[error("payload of {len} bytes exceeds link limit of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    /// Outbound queue is full
    #[error("link '{link}' send queue full")]
    QueueFull { link: String },
}

impl TransportError {
    /// Create closed-link error
    pub fn closed(link: impl Into<String>) -> Self {
        Self::Closed { link: link.into() }
    }

    /// Create queue-full error
    pub fn queue_full(link: impl Into<String>) -> Self {
        Self::QueueFull { link: link.into() }
    }
}

/// Returned by every bounded container when it cannot take another item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("capacity of {capacity} exhausted")]
pub struct CapacityError {
    pub capacity: usize,
}

impl CapacityError {
    pub fn full(capacity: usize) -> Self {
        Self { capacity }
    }
}

/// Wire protocol errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Unknown message prefix
    #[error("unknown message type: '{0}'")]
    UnknownKind(String),

    /// A field failed to parse or was missing
    #[error("malformed {kind} message: {message}")]
    Malformed { kind: &'static str, message: String },

    /// Declared event count does not match the event blocks
    #[error("macrocycle declares {declared} events but carries {actual}")]
    CountMismatch { declared: usize, actual: usize },

    /// Macrocycle carries more events than allowed
    #[error("macrocycle carries {count} events (max {max})")]
    TooManyEvents { count: usize, max: usize },

    /// Message is not valid ASCII/UTF-8
    #[error("message is not valid text")]
    NotText,

    /// Accumulated bytes exceeded the framer limit without a terminator
    #[error("frame exceeded {max} bytes without terminator")]
    FrameOverflow { max: usize },
}

impl ProtocolError {
    /// Create malformed-message error
    pub fn malformed(kind: &'static str, message: impl Into<String>) -> Self {
        Self::Malformed {
            kind,
            message: message.into(),
        }
    }
}
