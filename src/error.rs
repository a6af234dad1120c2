//! Error taxonomy for the active engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ActiveError {
    /// Shapes or sizes disagree between the window and its underlying sources.
    #[error("inconsistent: {0}")]
    Inconsistent(String),

    /// An event id vanished from a store before this consumer processed it.
    #[error("lost event {id} in {store}")]
    LostEvent { store: String, id: u64 },

    #[error("missing rule for slice {0}")]
    MissingRule(u64),

    #[error("variable address space exhausted (bits {bits}, block {block})")]
    AllocatorExhausted { bits: u32, block: u64 },

    #[error("rule needs {needed} variables but a block holds {capacity}")]
    BlockOverflow { needed: usize, capacity: u64 },

    #[error("callback failed: {0}")]
    Callback(String),

    #[error("engine terminated")]
    Terminated,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("format: {0}")]
    Format(String),
}

impl ActiveError {
    /// Fatal errors leave the engine in its terminal state; only reset and
    /// reload recover from them.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ActiveError::Io(_) | ActiveError::Format(_) | ActiveError::Terminated)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ActiveError::Inconsistent(_) => "inconsistent",
            ActiveError::LostEvent { .. } => "lost_event",
            ActiveError::MissingRule(_) => "missing_rule",
            ActiveError::AllocatorExhausted { .. } => "allocator_exhausted",
            ActiveError::BlockOverflow { .. } => "block_overflow",
            ActiveError::Callback(_) => "callback",
            ActiveError::Terminated => "terminated",
            ActiveError::Io(_) => "io",
            ActiveError::Format(_) => "format",
        }
    }
}

pub type Result<T> = std::result::Result<T, ActiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ActiveError::LostEvent { store: "dense0".into(), id: 3 }.is_fatal());
        assert!(ActiveError::Inconsistent("x".into()).is_fatal());
        assert!(!ActiveError::Format("short read".into()).is_fatal());
        assert!(!ActiveError::Terminated.is_fatal());
    }

    #[test]
    fn test_io_converts() {
        let e: ActiveError = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
        assert_eq!(e.kind(), "io");
    }
}
