//! Engine Error Taxonomy
//!
//! Every failure in the engine is terminal: there is no recoverable-error
//! channel. Internally errors propagate as [`EngineResult`] so call sites can
//! attach context with `?`; the public entry points convert any error into a
//! diagnostic and abort the process via [`fatal`].
//!
//! The taxonomy distinguishes:
//! - unsupported constructs (opcode, cast width, operand bit-width, argument
//!   count outside the enumerated support matrix),
//! - consistency violations (unresolved SSA values, phi without a matching
//!   predecessor, symbol clashes, scope-stack imbalance, failed verification),
//! - native compilation failures.
//!
//! Speculation failure is intentionally absent here: it is realized at trace
//! run time as a guard branch into a trap block, never as an `EngineError`.

use std::fmt;

/// All the ways interpretation, trace building, or compilation can fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Instruction kind the interpreter does not implement
    UnsupportedInstruction(String),

    /// Operand bit-width outside the support matrix for an operation
    UnsupportedWidth { what: &'static str, bits: u64 },

    /// Memory access size outside the support matrix
    UnsupportedAccessSize { what: &'static str, size: u64 },

    /// Call-site argument count outside the native ABI subset
    UnsupportedArgCount(usize),

    /// Constant expression kind the evaluator does not implement
    UnsupportedConstant(String),

    /// A value kind that cannot be reduced to a concrete scalar
    NotMaterializable(&'static str),

    /// A value kind that cannot be invoked as a callee
    NotCallable(&'static str),

    /// A value kind that cannot be stored through
    NotStorable(&'static str),

    /// Reading the scalar of an unmaterialized runtime value
    PointedScalar,

    /// Name with no registered address
    UnknownSymbol(String),

    /// Address with no exact-match symbol
    UnknownAddress(usize),

    /// Function name absent from the module registry
    UnknownFunction(String),

    /// Global name absent from the defining module
    UnknownGlobal(String),

    /// SSA value used before definition
    UndefinedValue(String),

    /// Conflicting registration for a symbol name or address
    SymbolClash(String),

    /// A later module redefines an already-indexed function
    FunctionClash(String),

    /// Phi instruction with no incoming entry for the predecessor block
    PhiWithoutPredecessor(String),

    /// Structural invariant broken (diagnosed outside the verifier)
    Consistency(String),

    /// Residual function failed structural verification
    VerifyFailed(String),

    /// Scoped residual map popped past its balance point
    ScopeImbalance,

    /// Inline recursion exceeded the configured bound
    InlineDepthExceeded(usize),

    /// Call or invocation with the wrong number of arguments
    ArgCountMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    /// Native backend failure
    Compile(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::UnsupportedInstruction(inst) => {
                write!(f, "unsupported instruction: {}", inst)
            }
            EngineError::UnsupportedWidth { what, bits } => {
                write!(f, "unsupported {} width: {} bits", what, bits)
            }
            EngineError::UnsupportedAccessSize { what, size } => {
                write!(f, "unsupported {} size: {} bytes", what, size)
            }
            EngineError::UnsupportedArgCount(n) => {
                write!(f, "unsupported native call argument count: {}", n)
            }
            EngineError::UnsupportedConstant(c) => write!(f, "unsupported constant: {}", c),
            EngineError::NotMaterializable(kind) => {
                write!(f, "{} cannot be materialized to a runtime value", kind)
            }
            EngineError::NotCallable(kind) => write!(f, "{} cannot be called", kind),
            EngineError::NotStorable(kind) => write!(f, "{} cannot be stored through", kind),
            EngineError::PointedScalar => {
                write!(f, "scalar read from an unmaterialized runtime value")
            }
            EngineError::UnknownSymbol(name) => write!(f, "symbol '{}' not found", name),
            EngineError::UnknownAddress(addr) => {
                write!(f, "no exact symbol match for address {:#x}", addr)
            }
            EngineError::UnknownFunction(name) => {
                write!(f, "function '{}' not found in registry", name)
            }
            EngineError::UnknownGlobal(name) => write!(f, "global '{}' not found", name),
            EngineError::UndefinedValue(v) => write!(f, "use of undefined value: {}", v),
            EngineError::SymbolClash(name) => {
                write!(f, "conflicting registration for symbol '{}'", name)
            }
            EngineError::FunctionClash(name) => {
                write!(f, "function '{}' already defined by an earlier module", name)
            }
            EngineError::PhiWithoutPredecessor(inst) => {
                write!(f, "phi has no entry for the predecessor block: {}", inst)
            }
            EngineError::Consistency(msg) => write!(f, "consistency violation: {}", msg),
            EngineError::VerifyFailed(msg) => write!(f, "verification failed: {}", msg),
            EngineError::ScopeImbalance => write!(f, "residual scope stack imbalance"),
            EngineError::InlineDepthExceeded(limit) => {
                write!(f, "inline depth exceeded the bound of {}", limit)
            }
            EngineError::ArgCountMismatch {
                name,
                expected,
                got,
            } => write!(
                f,
                "'{}' expects {} arguments, got {}",
                name, expected, got
            ),
            EngineError::Compile(msg) => write!(f, "compilation error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Report a terminal error and abort the process.
///
/// There is no partial result and no graceful degradation: every error that
/// reaches a public entry point ends the process here.
pub fn fatal(err: &EngineError) -> ! {
    tracing::error!(error = %err, "fatal engine error");
    eprintln!("tracelet: fatal: {}", err);
    std::process::abort();
}
