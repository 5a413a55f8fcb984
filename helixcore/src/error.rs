//! Error types shared across the toolchain.
//!
//! Lexer/parser failures accumulate and are reported together; everything
//! else aborts the current run. Guest-side errno values never surface
//! here — they stay inside the syscall ABI (see `crate::adapter`).

use thiserror::Error;

/// One accumulated lexer/parser failure, with its source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

impl SyntaxIssue {
    pub fn new(line: usize, col: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            col,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SyntaxIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.col, self.message)
    }
}

/// Top-level error type returned by every fallible toolchain operation.
#[derive(Debug, Error)]
pub enum Error {
    /// One or more lexer/parser rejections, accumulated over a full pass.
    #[error("{} syntax error(s)", issues.len())]
    Syntax { issues: Vec<SyntaxIssue> },

    /// `_start` missing, or a relocation's target is not in any section.
    #[error("undefined symbol `{symbol}`")]
    UndefinedSymbol { symbol: String },

    /// A 32-bit relocation patch value didn't fit in signed 32 bits.
    #[error(
        "relocation overflow patching {section}+{offset:#x}: value {value:#x} does not fit in {size} byte(s)"
    )]
    RelocationOverflow {
        section: String,
        offset: usize,
        size: u8,
        value: i64,
    },

    /// The emulator reported an unrecoverable condition mid-run.
    #[error("guest fault at {address:#018x}: {message}")]
    GuestFault {
        address: u64,
        message: String,
        /// Source-map annotation, when the faulting address maps back to a
        /// statement (line, col).
        location: Option<(usize, usize)>,
    },

    /// Input used a feature the C or ASM front end does not implement.
    #[error("unsupported input: {0}")]
    HostUnsupported(String),

    /// I/O failure in the virtual file store's durable backing layer.
    #[error("file store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Renders the full accumulated message, including every syntax issue
    /// on its own line and the guest-fault source annotation if present.
    pub fn full_message(&self) -> String {
        match self {
            Error::Syntax { issues } => issues
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
            Error::GuestFault {
                message, location, ..
            } => match location {
                Some((line, col)) => format!("{self} (at {line}:{col}: {message})"),
                None => self.to_string(),
            },
            other => other.to_string(),
        }
    }

    pub fn syntax(issues: Vec<SyntaxIssue>) -> Self {
        Error::Syntax { issues }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
