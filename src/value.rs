//! Runtime Values and the Value Abstraction
//!
//! [`RuntimeValue`] is the concrete datum a computation produces while
//! interpreting: an immediate 64-bit scalar (reinterpreted as integer or
//! pointer as consumers need) or an unmaterialized placeholder whose scalar
//! cannot be read.
//!
//! [`Value`] pairs the runtime side with the residual side. It is a closed
//! set of capabilities:
//! - [`Value::Real`] — the common case: a concrete scalar plus the value's
//!   node in the residual function;
//! - [`Value::DeferredPointer`] — an address whose pointee is tracked
//!   symbolically rather than through real memory; storing through it
//!   rebinds the pointee and never touches memory;
//! - [`Value::Intrinsic`] — a non-materializable calling-convention marker
//!   intercepted at call sites.
//!
//! Each operation dispatches explicitly over the variants; unsupported
//! combinations report a distinct error kind instead of falling through.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{EngineError, EngineResult};
use crate::ir;

/// The concrete result of an interpreted computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeValue {
    /// A concrete 64-bit scalar
    Immediate(i64),
    /// Not materialized; reading its scalar is an error
    Pointed,
}

impl RuntimeValue {
    /// The concrete scalar. Fails on [`RuntimeValue::Pointed`].
    pub fn scalar(&self) -> EngineResult<i64> {
        match self {
            RuntimeValue::Immediate(v) => Ok(*v),
            RuntimeValue::Pointed => Err(EngineError::PointedScalar),
        }
    }
}

/// Calling-convention intrinsics recognized at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicKind {
    VaBegin,
    VaEnd,
}

/// A concrete value together with its node in the residual function.
///
/// `residual` is `None` only for the void sentinel produced by calls and
/// returns that carry no value.
#[derive(Debug, Clone)]
pub struct RealValue {
    pub runtime: RuntimeValue,
    pub residual: Option<ir::ValueRef>,
}

impl RealValue {
    pub fn new(scalar: i64, residual: ir::ValueRef) -> RealValue {
        RealValue {
            runtime: RuntimeValue::Immediate(scalar),
            residual: Some(residual),
        }
    }

    /// The "nothing meaningful" result of void calls and returns.
    pub fn void() -> RealValue {
        RealValue {
            runtime: RuntimeValue::Immediate(0),
            residual: None,
        }
    }
}

/// An interpreted value.
#[derive(Debug, Clone)]
pub enum Value {
    Real(RealValue),
    DeferredPointer(Rc<RefCell<Value>>),
    Intrinsic(IntrinsicKind),
}

impl Value {
    pub fn real(scalar: i64, residual: ir::ValueRef) -> Value {
        Value::Real(RealValue::new(scalar, residual))
    }

    pub fn void() -> Value {
        Value::Real(RealValue::void())
    }

    pub fn deferred(pointee: Value) -> Value {
        Value::DeferredPointer(Rc::new(RefCell::new(pointee)))
    }

    /// Reduce to a concrete value. Only [`Value::Real`] supports this.
    pub fn materialize(&self) -> EngineResult<RealValue> {
        match self {
            Value::Real(rv) => Ok(rv.clone()),
            Value::DeferredPointer(_) => Err(EngineError::NotMaterializable("deferred pointer")),
            Value::Intrinsic(_) => {
                Err(EngineError::NotMaterializable("calling-convention intrinsic"))
            }
        }
    }

    /// Store `value` through this value.
    ///
    /// For a real value the concrete scalar is an address and `size` bytes of
    /// `value`'s scalar are written there (4- and 8-byte stores are
    /// supported). A deferred pointer simply rebinds its pointee.
    pub fn store(&self, value: &Value, size: u64) -> EngineResult<()> {
        match self {
            Value::Real(rv) => {
                let addr = rv.runtime.scalar()? as usize;
                let datum = value.materialize()?.runtime.scalar()?;
                match size {
                    4 => unsafe {
                        (addr as *mut i32).write_unaligned(datum as i32);
                    },
                    8 => unsafe {
                        (addr as *mut i64).write_unaligned(datum);
                    },
                    other => {
                        return Err(EngineError::UnsupportedAccessSize {
                            what: "store",
                            size: other,
                        })
                    }
                }
                Ok(())
            }
            Value::DeferredPointer(pointee) => {
                *pointee.borrow_mut() = value.clone();
                Ok(())
            }
            Value::Intrinsic(_) => Err(EngineError::NotStorable("calling-convention intrinsic")),
        }
    }
}

/// An owned simulated-memory buffer.
///
/// Buffers live for the whole top-level interpretation; nothing frees one
/// mid-run, so addresses handed out stay valid until the run ends.
#[derive(Debug)]
pub struct Allocation {
    buf: Box<[u8]>,
}

impl Allocation {
    pub fn new(size: usize) -> Allocation {
        Allocation {
            buf: vec![0u8; size].into_boxed_slice(),
        }
    }

    /// Copy of `bytes` as a fresh buffer.
    pub fn from_bytes(bytes: &[u8]) -> Allocation {
        Allocation {
            buf: bytes.to_vec().into_boxed_slice(),
        }
    }

    pub fn addr(&self) -> usize {
        self.buf.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
