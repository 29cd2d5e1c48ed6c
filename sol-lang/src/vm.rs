//! Functions, activation records, and the instruction execution loop.

use std::fmt::{self, Debug, Display};
use std::mem;
use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::value::{Hook, Value};

pub mod instruction;

pub use instruction::{Instruction, Opcode, RK_CONSTANT};

/// The number of registers in each activation record.
pub const REGISTER_COUNT: usize = 10;

/// The default number of instructions a task may execute before it is forced
/// to yield.
pub const DEFAULT_EXEC_LIMIT: usize = 100;

const MAX_WAIT_MILLISECONDS: f64 = 1e12;

/// A process-wide unique task identifier.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Returns the next unused task id.
    ///
    /// Ids are allocated from a 64-bit counter and are never reused.
    #[must_use]
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A unit of executable code: a constant pool and the instructions that
/// reference it.
///
/// Functions are immutable once created and are shared between every task
/// and activation record executing them.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    constants: Vec<Value>,
    instructions: Vec<Instruction>,
}

impl Function {
    /// Returns a new function.
    #[must_use]
    pub fn new(
        constants: impl IntoIterator<Item = Value>,
        instructions: impl IntoIterator<Item = Instruction>,
    ) -> Self {
        Self {
            constants: constants.into_iter().collect(),
            instructions: instructions.into_iter().collect(),
        }
    }

    /// Returns this function's constant pool.
    #[must_use]
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// Returns this function's instructions.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }
}

/// A virtual machine register index.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Register(pub u8);

impl From<u8> for Register {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<Register> for usize {
    fn from(value: Register) -> Self {
        usize::from(value.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Landing {
    register: u32,
    count: u32,
}

/// An activation record: one level of a task's call stack.
#[derive(Debug, Clone)]
pub struct Frame {
    function: Arc<Function>,
    pc: usize,
    registers: [Value; REGISTER_COUNT],
    landing: Option<Landing>,
    parent: Option<Box<Frame>>,
}

impl Frame {
    /// Returns a new entry frame that begins executing `function` at its
    /// first instruction.
    #[must_use]
    pub fn new(function: Arc<Function>) -> Self {
        Self {
            function,
            pc: 0,
            registers: Default::default(),
            landing: None,
            parent: None,
        }
    }

    /// Returns the function this frame is executing.
    #[must_use]
    pub fn function(&self) -> &Arc<Function> {
        &self.function
    }

    /// Returns the index of the next instruction this frame will execute.
    #[must_use]
    pub const fn pc(&self) -> usize {
        self.pc
    }

    /// Returns this frame's registers.
    #[must_use]
    pub const fn registers(&self) -> &[Value; REGISTER_COUNT] {
        &self.registers
    }

    /// Returns the calling frame, if this frame was created by `CALL`.
    #[must_use]
    pub fn parent(&self) -> Option<&Frame> {
        self.parent.as_deref()
    }

    /// Returns the number of frames in this call stack, including this one.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut frame = self;
        while let Some(parent) = frame.parent() {
            depth += 1;
            frame = parent;
        }
        depth
    }

    fn register(&self, index: u32) -> Result<&Value, Fault> {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.registers.get(index))
            .ok_or(Fault::InvalidRegister)
    }

    fn register_mut(&mut self, index: u32) -> Result<&mut Value, Fault> {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.registers.get_mut(index))
            .ok_or(Fault::InvalidRegister)
    }

    fn constant(&self, index: u32) -> Result<&Value, Fault> {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.function.constants.get(index))
            .ok_or(Fault::InvalidConstant)
    }

    fn rk(&self, index: u32) -> Result<&Value, Fault> {
        if index < RK_CONSTANT {
            self.register(index)
        } else {
            self.constant(index - RK_CONSTANT)
        }
    }

    fn number(&self, index: u32) -> Result<f64, Fault> {
        self.rk(index)?.as_number().ok_or(Fault::TypeMismatch)
    }

    fn jump(&mut self, offset: i32) -> Result<(), Fault> {
        let offset = isize::try_from(offset).map_err(|_| Fault::InvalidInstructionAddress)?;
        match self.pc.checked_add_signed(offset) {
            Some(target) if target <= self.function.instructions.len() => {
                self.pc = target;
                Ok(())
            }
            _ => Err(Fault::InvalidInstructionAddress),
        }
    }
}

impl Index<Register> for Frame {
    type Output = Value;

    fn index(&self, index: Register) -> &Self::Output {
        &self.registers[usize::from(index)]
    }
}

impl IndexMut<Register> for Frame {
    fn index_mut(&mut self, index: Register) -> &mut Self::Output {
        &mut self.registers[usize::from(index)]
    }
}

/// The event a suspended task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Wait {
    /// Resume after the duration has elapsed.
    Timer(Duration),
    /// Resume once a message is available in the task's inbox.
    Message,
}

/// The outcome of running a task with [`execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    /// The task can continue running. It either yielded explicitly or
    /// exhausted its execution limit.
    Yield,
    /// The task is blocked until an event occurs.
    Suspend(Wait),
    /// The task's entry function returned these values.
    End(Vec<Value>),
    /// The task faulted and cannot continue.
    Error(Fault),
}

/// A fault that ends the task that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fault {
    /// An instruction contained an unknown opcode.
    InvalidOpcode(u8),
    /// A `YIELD` instruction contained an unknown kind of yield.
    InvalidYield(u32),
    /// An instruction's operand was not of the type it requires.
    TypeMismatch,
    /// `CALL` or `SPAWN` was given a value that is not a function.
    NotAFunction,
    /// A comparison was not followed by a `JUMP`.
    ExpectedJump,
    /// Execution moved outside of the function's instructions.
    InvalidInstructionAddress,
    /// An instruction referenced a register that does not exist.
    InvalidRegister,
    /// An instruction referenced a constant that does not exist.
    InvalidConstant,
}

impl crate::ErrorKind for Fault {
    fn kind(&self) -> &'static str {
        match self {
            Fault::InvalidOpcode(_) => "invalid opcode",
            Fault::InvalidYield(_) => "invalid yield",
            Fault::TypeMismatch => "type mismatch",
            Fault::NotAFunction => "not a function",
            Fault::ExpectedJump => "expected jump",
            Fault::InvalidInstructionAddress => "invalid instruction address",
            Fault::InvalidRegister => "invalid register",
            Fault::InvalidConstant => "invalid constant",
        }
    }
}

impl Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::InvalidOpcode(op) => write!(f, "invalid opcode {op}"),
            Fault::InvalidYield(kind) => write!(f, "invalid yield kind {kind}"),
            other => f.write_str(crate::ErrorKind::kind(other)),
        }
    }
}

impl std::error::Error for Fault {}

/// Information passed to a [`Hook`] when a program invokes it.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    /// The task invoking the hook.
    pub task: TaskId,
    /// The frame that executed the `HOOK` instruction.
    pub frame: &'a Frame,
    /// The tasks in the scheduler's run queue, in order.
    pub run_queue: &'a [TaskId],
    /// The tasks in the scheduler's wait queue, in order.
    pub wait_queue: &'a [TaskId],
}

/// The environment a task executes within.
///
/// [`execute`] calls into its host for every operation that reaches outside
/// of the task's own call stack.
pub trait Host {
    /// Creates a child of the running task that executes `function`,
    /// returning the new task's id.
    fn spawn(&mut self, function: Arc<Function>) -> TaskId;

    /// Removes the next message from the running task's inbox.
    fn receive(&mut self) -> Option<Value>;

    /// Invokes `hook` on behalf of the running task.
    fn hook(&mut self, hook: &Hook, frame: &Frame);
}

enum Flow {
    Continue,
    Exit(Status),
}

/// Executes instructions in `frame` until the task yields, suspends, ends,
/// faults, or executes `exec_limit` instructions.
///
/// An `exec_limit` of 0 disables the limit. Reaching the limit stores the
/// program counter and returns [`Status::Yield`]. A comparison and the `JUMP`
/// following it count as one instruction, while `CALL` with arguments and
/// `RETURN` into a calling frame each cost one additional instruction.
pub fn execute<H>(frame: &mut Box<Frame>, host: &mut H, exec_limit: usize) -> Status
where
    H: Host + ?Sized,
{
    let mut executed = 0;
    loop {
        match step(frame, host, &mut executed) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Exit(status)) => return status,
            Err(fault) => {
                debug!(pc = frame.pc, %fault, "fault");
                return Status::Error(fault);
            }
        }

        executed += 1;
        if exec_limit > 0 && executed >= exec_limit {
            trace!(limit = exec_limit, "execution limit reached");
            return Status::Yield;
        }
    }
}

#[allow(clippy::too_many_lines)]
fn step<H>(frame: &mut Box<Frame>, host: &mut H, executed: &mut usize) -> Result<Flow, Fault>
where
    H: Host + ?Sized,
{
    let pc = frame.pc;
    let instruction = frame
        .function
        .instructions
        .get(pc)
        .copied()
        .ok_or(Fault::InvalidInstructionAddress)?;
    frame.pc = pc + 1;
    let op = instruction.opcode().map_err(Fault::InvalidOpcode)?;
    trace!(pc, ?instruction, "exec");

    match op {
        Opcode::Return => {
            let first = instruction.a();
            let count = instruction.b();
            let Some(caller) = frame.parent.take() else {
                let values = (first..first + count)
                    .map(|index| frame.register(index).cloned())
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(Flow::Exit(Status::End(values)));
            };
            let returning = mem::replace(frame, caller);
            if let Some(landing) = returning.landing {
                for offset in 0..count.min(landing.count) {
                    *frame.register_mut(landing.register + offset)? =
                        returning.register(first + offset)?.clone();
                }
            }
            *executed += 1;
        }
        Opcode::Yield => match instruction.a() {
            0 => return Ok(Flow::Exit(Status::Yield)),
            1 => {
                let milliseconds = frame.number(instruction.b())?;
                let milliseconds = if milliseconds.is_nan() {
                    0.
                } else {
                    milliseconds.clamp(0., MAX_WAIT_MILLISECONDS)
                };
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let after = Duration::from_nanos((milliseconds * 1_000_000.) as u64);
                return Ok(Flow::Exit(Status::Suspend(Wait::Timer(after))));
            }
            2 => {
                let destination = instruction.b();
                frame.register(destination)?;
                if let Some(message) = host.receive() {
                    *frame.register_mut(destination)? = message;
                } else {
                    // Re-execute the receive when the task is resumed.
                    frame.pc = pc;
                    return Ok(Flow::Exit(Status::Suspend(Wait::Message)));
                }
            }
            other => return Err(Fault::InvalidYield(other)),
        },
        Opcode::Move => {
            let value = frame.register(instruction.b())?.clone();
            *frame.register_mut(instruction.a())? = value;
        }
        Opcode::LoadConstant => {
            let value = frame.constant(instruction.bu())?.clone();
            *frame.register_mut(instruction.a())? = value;
        }
        Opcode::Call => {
            let base = instruction.a();
            let function = frame
                .register(base)?
                .as_function()
                .cloned()
                .ok_or(Fault::NotAFunction)?;
            let arguments = instruction.b();
            let mut callee = Frame::new(function);
            for index in 0..arguments {
                *callee.register_mut(index)? = frame.register(base + 1 + index)?.clone();
            }
            if arguments > 0 {
                *executed += 1;
            }
            callee.landing = Some(Landing {
                register: base,
                count: instruction.c(),
            });
            let caller = mem::replace(frame, Box::new(callee));
            frame.parent = Some(caller);
        }
        Opcode::Spawn => {
            let function = frame
                .rk(instruction.b())?
                .as_function()
                .cloned()
                .ok_or(Fault::NotAFunction)?;
            frame.register(instruction.a())?;
            let child = host.spawn(function);
            #[allow(clippy::cast_precision_loss)]
            let child = Value::Number(child.0 as f64);
            *frame.register_mut(instruction.a())? = child;
        }
        Opcode::Add => arithmetic(frame, instruction, |lhs, rhs| lhs + rhs)?,
        Opcode::Subtract => arithmetic(frame, instruction, |lhs, rhs| lhs - rhs)?,
        Opcode::Multiply => arithmetic(frame, instruction, |lhs, rhs| lhs * rhs)?,
        Opcode::Divide => arithmetic(frame, instruction, |lhs, rhs| lhs / rhs)?,
        Opcode::Not => {
            let value = Value::from_bool(!frame.register(instruction.b())?.truthy());
            *frame.register_mut(instruction.a())? = value;
        }
        Opcode::Equal => compare(frame, instruction, |lhs, rhs| Ok(lhs == rhs))?,
        Opcode::LessThan => compare(frame, instruction, |lhs, rhs| {
            Ok(numeric(lhs)? < numeric(rhs)?)
        })?,
        Opcode::LessThanOrEqual => compare(frame, instruction, |lhs, rhs| {
            Ok(numeric(lhs)? <= numeric(rhs)?)
        })?,
        Opcode::Jump => frame.jump(instruction.bss())?,
        Opcode::Hook => {
            let Value::Opaque(hook) = frame.rk(instruction.b())?.clone() else {
                return Err(Fault::TypeMismatch);
            };
            host.hook(&hook, frame);
        }
        Opcode::DumpRegisters => {
            for index in [instruction.a(), instruction.b(), instruction.c()] {
                #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
                let value = frame.register(index)?;
                trace!(register = index, %value, "dump");
            }
        }
    }

    Ok(Flow::Continue)
}

fn numeric(value: &Value) -> Result<f64, Fault> {
    value.as_number().ok_or(Fault::TypeMismatch)
}

fn arithmetic(
    frame: &mut Frame,
    instruction: Instruction,
    op: impl FnOnce(f64, f64) -> f64,
) -> Result<(), Fault> {
    let lhs = frame.number(instruction.b())?;
    let rhs = frame.number(instruction.c())?;
    *frame.register_mut(instruction.a())? = Value::Number(op(lhs, rhs));
    Ok(())
}

fn compare(
    frame: &mut Frame,
    instruction: Instruction,
    test: impl FnOnce(&Value, &Value) -> Result<bool, Fault>,
) -> Result<(), Fault> {
    let condition = test(frame.rk(instruction.b())?, frame.rk(instruction.c())?)?;
    let jump = frame
        .function
        .instructions
        .get(frame.pc)
        .copied()
        .filter(|next| next.opcode() == Ok(Opcode::Jump))
        .ok_or(Fault::ExpectedJump)?;
    frame.pc += 1;
    if condition != (instruction.a() != 0) {
        frame.jump(jump.bss())?;
    }
    Ok(())
}
