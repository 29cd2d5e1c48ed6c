use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sol::reactor::{Exit, Scheduler, SchedulerConfig};
use sol::runtime::value::Value;
use sol::vm::{Fault, Function, Instruction, Opcode, DEFAULT_EXEC_LIMIT, RK_CONSTANT};
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Nil,
    True,
    False,
    Number(f64),
    /// An index into the case's `functions`.
    Function(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    R(u32),
    K(u32),
}

impl Operand {
    const fn rk(self) -> u32 {
        match self {
            Operand::R(register) => register,
            Operand::K(constant) => RK_CONSTANT + constant,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Return(u32, u32),
    Yield,
    Sleep(Operand),
    Receive(u32),
    Move(u32, u32),
    LoadK(u32, u32),
    Call(u32, u32, u32),
    Spawn(u32, Operand),
    Add(u32, Operand, Operand),
    Sub(u32, Operand, Operand),
    Mul(u32, Operand, Operand),
    Div(u32, Operand, Operand),
    Not(u32, u32),
    Eq(bool, Operand, Operand),
    Lt(bool, Operand, Operand),
    Le(bool, Operand, Operand),
    Jump(i32),
    YieldKind(u32),
    Raw(u32),
}

impl From<Op> for Instruction {
    fn from(op: Op) -> Self {
        match op {
            Op::Return(first, count) => Instruction::return_values(first, count),
            Op::Yield => Instruction::yield_now(),
            Op::Sleep(duration) => Instruction::sleep(duration.rk()),
            Op::Receive(destination) => Instruction::receive(destination),
            Op::Move(destination, source) => Instruction::move_register(destination, source),
            Op::LoadK(destination, constant) => Instruction::load_constant(destination, constant),
            Op::Call(function, arguments, results) => {
                Instruction::call(function, arguments, results)
            }
            Op::Spawn(destination, function) => Instruction::spawn(destination, function.rk()),
            Op::Add(dest, lhs, rhs) => Instruction::add(dest, lhs.rk(), rhs.rk()),
            Op::Sub(dest, lhs, rhs) => Instruction::sub(dest, lhs.rk(), rhs.rk()),
            Op::Mul(dest, lhs, rhs) => Instruction::mul(dest, lhs.rk(), rhs.rk()),
            Op::Div(dest, lhs, rhs) => Instruction::div(dest, lhs.rk(), rhs.rk()),
            Op::Not(destination, source) => Instruction::not(destination, source),
            Op::Eq(expected, lhs, rhs) => Instruction::eq(u32::from(expected), lhs.rk(), rhs.rk()),
            Op::Lt(expected, lhs, rhs) => Instruction::lt(u32::from(expected), lhs.rk(), rhs.rk()),
            Op::Le(expected, lhs, rhs) => Instruction::le(u32::from(expected), lhs.rk(), rhs.rk()),
            Op::Jump(offset) => Instruction::jump(offset),
            Op::YieldKind(kind) => Instruction::abc(Opcode::Yield, kind, 0, 0),
            Op::Raw(raw) => Instruction(raw),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub constants: Vec<Constant>,
    pub code: Vec<Op>,
}

impl Program {
    fn build(&self, functions: &[Arc<Function>]) -> Arc<Function> {
        build(&self.constants, &self.code, functions)
    }
}

fn build(constants: &[Constant], code: &[Op], functions: &[Arc<Function>]) -> Arc<Function> {
    Arc::new(Function::new(
        constants.iter().map(|constant| match constant {
            Constant::Nil => Value::Nil,
            Constant::True => Value::True,
            Constant::False => Value::False,
            Constant::Number(number) => Value::Number(*number),
            Constant::Function(index) => Value::Function(functions[*index].clone()),
        }),
        code.iter().copied().map(Instruction::from),
    ))
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum TestOutput {
    Returned(Vec<Constant>),
    Fault(Fault),
    Orphaned,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Case {
    /// Functions referenced by `Constant::Function`. Each may only reference
    /// functions declared before it.
    #[serde(default)]
    pub functions: Vec<Program>,
    #[serde(default)]
    pub constants: Vec<Constant>,
    pub code: Vec<Op>,
    /// Messages delivered to the task before it starts.
    #[serde(default)]
    pub messages: Vec<f64>,
    #[serde(default = "default_exec_limit")]
    pub exec_limit: usize,
    pub output: TestOutput,
}

const fn default_exec_limit() -> usize {
    DEFAULT_EXEC_LIMIT
}

impl Case {
    fn run(&self) -> TestOutput {
        let mut functions = Vec::with_capacity(self.functions.len());
        for program in &self.functions {
            let function = program.build(&functions);
            functions.push(function);
        }
        let entry = build(&self.constants, &self.code, &functions);

        let mut scheduler =
            Scheduler::with_config(SchedulerConfig::new().with_exec_limit(self.exec_limit));
        let task = scheduler.spawn(entry, None);
        for message in &self.messages {
            assert!(scheduler.send(task, Value::Number(*message), None));
        }
        let exit = Arc::new(Mutex::new(None));
        scheduler.watch(task, {
            let exit = exit.clone();
            move |_, ended: &Exit| *exit.lock() = Some(ended.clone())
        });
        scheduler.run();

        let exit = exit.lock().take();
        match exit {
            Some(Exit::Returned(values)) => TestOutput::Returned(
                values
                    .into_iter()
                    .map(|value| match value {
                        Value::Nil => Constant::Nil,
                        Value::True => Constant::True,
                        Value::False => Constant::False,
                        Value::Number(number) => Constant::Number(number),
                        other => unreachable!(
                            "test returned {other:?}, but the harness doesn't support it"
                        ),
                    })
                    .collect(),
            ),
            Some(Exit::Faulted(fault)) => TestOutput::Fault(fault),
            Some(Exit::Orphaned) => TestOutput::Orphaned,
            None => unreachable!("task did not end"),
        }
    }
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .try_init();

    for entry in std::fs::read_dir("tests/cases").unwrap() {
        let entry = entry.unwrap().path();
        if entry.extension().map_or(false, |ext| ext == "rsn") {
            run_test_cases(&entry);
        }
    }
}

fn run_test_cases(path: &Path) {
    let contents = std::fs::read_to_string(path).unwrap();

    let cases: BTreeMap<String, Case> = match rsn::parser::Config::default()
        .allow_implicit_map(true)
        .deserialize(&contents)
    {
        Ok(cases) => cases,
        Err(err) => unreachable!("error parsing {}: {err}", path.display()),
    };
    for (name, case) in cases {
        println!("Running {name}");
        let output = case.run();
        assert_eq!(
            output,
            case.output,
            "in {path} @ {name}: expected {expected:?}, got {output:?}",
            path = path.display(),
            expected = case.output
        );
    }
}
