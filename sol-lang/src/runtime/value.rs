//! The values stored in registers and constant pools.

use std::fmt::{self, Debug, Display, Write};
use std::sync::Arc;

use crate::vm::{Function, HookContext};

/// A value that can be manipulated by instructions.
#[derive(Default, Clone, Debug)]
pub enum Value {
    /// The absence of a value.
    #[default]
    Nil,
    /// Boolean true.
    True,
    /// Boolean false.
    False,
    /// A double precision floating point number.
    Number(f64),
    /// A reference to a function that can be called or spawned.
    Function(Arc<Function>),
    /// A host callback, invoked by the `HOOK` instruction.
    Opaque(Hook),
}

impl Value {
    /// Returns [`Value::True`] or [`Value::False`].
    #[must_use]
    pub const fn from_bool(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }

    /// Returns true if this value is one of the three atoms: `nil`, `true`,
    /// or `false`.
    #[must_use]
    pub const fn is_atom(&self) -> bool {
        matches!(self, Value::Nil | Value::True | Value::False)
    }

    /// Returns true if this value is considered true by `NOT`.
    ///
    /// `nil`, `false`, and `0` are false. Everything else is true.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Value::Nil | Value::False => false,
            Value::Number(n) => *n != 0.,
            Value::True | Value::Function(_) | Value::Opaque(_) => true,
        }
    }

    /// Returns the contained number, if this is a [`Value::Number`].
    #[must_use]
    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the contained function, if this is a [`Value::Function`].
    #[must_use]
    pub const fn as_function(&self) -> Option<&Arc<Function>> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Renders this value into `buffer`, truncating the output if it does not
    /// fit. The returned string borrows from `buffer`.
    pub fn repr<'b>(&self, buffer: &'b mut [u8]) -> &'b str {
        let mut writer = BoundedWriter {
            buffer,
            written: 0,
        };
        let _truncated = write!(writer, "{self}");
        let BoundedWriter { buffer, written } = writer;
        let buffer: &'b [u8] = buffer;
        // The writer only ever copies whole characters.
        std::str::from_utf8(&buffer[..written]).unwrap_or_default()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil)
            | (Value::True, Value::True)
            | (Value::False, Value::False) => true,
            (Value::Number(lhs), Value::Number(rhs)) => lhs == rhs,
            (Value::Function(lhs), Value::Function(rhs)) => Arc::ptr_eq(lhs, rhs),
            (Value::Opaque(lhs), Value::Opaque(rhs)) => lhs == rhs,
            _ => false,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::from_bool(value)
    }
}

impl From<Arc<Function>> for Value {
    fn from(value: Arc<Function>) -> Self {
        Self::Function(value)
    }
}

impl From<Function> for Value {
    fn from(value: Function) -> Self {
        Self::Function(Arc::new(value))
    }
}

impl From<Hook> for Value {
    fn from(value: Hook) -> Self {
        Self::Opaque(value)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::True => f.write_str("true"),
            Value::False => f.write_str("false"),
            Value::Number(n) => write!(f, "{n:.6}"),
            Value::Function(func) => write!(f, "<function {:p}>", Arc::as_ptr(func)),
            Value::Opaque(_) => f.write_str("<opaque>"),
        }
    }
}

struct BoundedWriter<'a> {
    buffer: &'a mut [u8],
    written: usize,
}

impl Write for BoundedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for ch in s.chars() {
            let len = ch.len_utf8();
            let Some(dest) = self.buffer.get_mut(self.written..self.written + len) else {
                return Err(fmt::Error);
            };
            ch.encode_utf8(dest);
            self.written += len;
        }
        Ok(())
    }
}

/// A host callback that programs can invoke with the `HOOK` instruction.
///
/// Hooks receive a [`HookContext`] describing the task that invoked them and
/// the state of its scheduler. They exist to let embedders and tests observe
/// running programs.
#[derive(Clone)]
pub struct Hook(Arc<dyn Fn(&HookContext<'_>) + Send + Sync>);

impl Hook {
    /// Returns a new hook that invokes `hook`.
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn(&HookContext<'_>) + Send + Sync + 'static,
    {
        Self(Arc::new(hook))
    }

    /// Invokes this hook.
    pub fn invoke(&self, context: &HookContext<'_>) {
        (self.0)(context);
    }
}

impl PartialEq for Hook {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hook").field(&Arc::as_ptr(&self.0)).finish()
    }
}
