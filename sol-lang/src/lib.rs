//! A register-based bytecode virtual machine built for cooperative
//! multitasking.
//!
//! Programs are supplied as already-encoded [`vm::Function`]s: a constant
//! pool plus an array of [`vm::Instruction`]s. [`vm::execute`] runs a task's
//! call stack until it yields, suspends, returns, faults, or exhausts its
//! fairness budget. Scheduling is left to the embedder through the
//! [`vm::Host`] trait.

#[cfg(feature = "tracing")]
#[macro_use]
extern crate tracing;
#[cfg(not(feature = "tracing"))]
#[macro_use]
mod mock_tracing;

pub mod runtime;
pub mod vm;

#[cfg(test)]
mod tests;

/// Summarizes an error's kind.
pub trait ErrorKind {
    /// Returns the summary of the error being raised.
    fn kind(&self) -> &'static str;
}
