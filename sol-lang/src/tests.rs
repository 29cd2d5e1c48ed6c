use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::filter::LevelFilter;

use crate::runtime::value::{Hook, Value};
use crate::vm::instruction::{
    Opcode, A_MAX, BSS_MAX, BSS_MIN, BS_MAX, BS_MIN, BUU_MAX, BU_MAX, B_MAX, C_MAX,
};
use crate::vm::{
    execute, Fault, Frame, Function, Host, HookContext, Instruction, Register, Status, TaskId,
    Wait, DEFAULT_EXEC_LIMIT, RK_CONSTANT,
};

fn initialize_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .try_init();
}

const fn k(index: u32) -> u32 {
    RK_CONSTANT + index
}

#[derive(Default)]
struct TestHost {
    id: Option<TaskId>,
    spawned: Vec<Arc<Function>>,
    inbox: VecDeque<Value>,
}

impl Host for TestHost {
    fn spawn(&mut self, function: Arc<Function>) -> TaskId {
        self.spawned.push(function);
        TaskId::next()
    }

    fn receive(&mut self) -> Option<Value> {
        self.inbox.pop_front()
    }

    fn hook(&mut self, hook: &Hook, frame: &Frame) {
        let task = *self.id.get_or_insert_with(TaskId::next);
        hook.invoke(&HookContext {
            task,
            frame,
            run_queue: &[task],
            wait_queue: &[],
        });
    }
}

fn run(constants: Vec<Value>, instructions: Vec<Instruction>) -> Status {
    initialize_tracing();
    let mut frame = Box::new(Frame::new(Arc::new(Function::new(constants, instructions))));
    execute(&mut frame, &mut TestHost::default(), 0)
}

fn returned(status: Status) -> Vec<Value> {
    match status {
        Status::End(values) => values,
        other => unreachable!("expected end, got {other:?}"),
    }
}

#[test]
fn abc_fields() {
    let i = Instruction::abc(Opcode::Add, 1, 2, 3);
    assert_eq!(i.opcode(), Ok(Opcode::Add));
    assert_eq!((i.a(), i.b(), i.c()), (1, 2, 3));

    let i = Instruction::abc(Opcode::Add, A_MAX, B_MAX, C_MAX);
    assert_eq!((i.a(), i.b(), i.c()), (A_MAX, B_MAX, C_MAX));
    assert_eq!(i.opcode(), Ok(Opcode::Add));
}

#[test]
fn wide_fields() {
    let i = Instruction::abu(Opcode::LoadConstant, 7, BU_MAX);
    assert_eq!((i.a(), i.bu()), (7, BU_MAX));

    for value in [BS_MIN, -1, 0, 1, BS_MAX] {
        let i = Instruction::abs(Opcode::LoadConstant, A_MAX, value);
        assert_eq!(i.bs(), value);
        assert_eq!(i.a(), A_MAX);
    }

    let i = Instruction::wide(Opcode::Jump, BUU_MAX);
    assert_eq!(i.buu(), BUU_MAX);
    assert_eq!(i.opcode(), Ok(Opcode::Jump));

    for value in [BSS_MIN, -3, 0, 3, BSS_MAX] {
        assert_eq!(Instruction::jump(value).bss(), value);
        let i = Instruction::wide_signed(Opcode::Jump, value);
        assert_eq!(i.bss(), value);
        assert_eq!(i.buu(), Instruction::jump(value).buu());
    }
}

#[test]
fn overflowing_fields_wrap() {
    let i = Instruction::abc(Opcode::Move, A_MAX + 1, 5, 6);
    assert_eq!(i.a(), 0);
    assert_eq!((i.b(), i.c()), (5, 6));
    assert_eq!(i.opcode(), Ok(Opcode::Move));

    let i = Instruction::abc(Opcode::Move, 4, B_MAX + 1, 6);
    assert_eq!(i.b(), 0);
    assert_eq!((i.a(), i.c()), (4, 6));

    let i = Instruction::abc(Opcode::Move, 4, 5, C_MAX + 1);
    assert_eq!(i.c(), 0);
    assert_eq!((i.a(), i.b()), (4, 5));
    assert_eq!(i.opcode(), Ok(Opcode::Move));

    let i = Instruction::abu(Opcode::LoadConstant, 9, BU_MAX + 1);
    assert_eq!(i.bu(), 0);
    assert_eq!(i.a(), 9);

    let i = Instruction::abs(Opcode::LoadConstant, 9, BS_MAX + 1);
    assert_eq!(i.bs(), BS_MIN);
    assert_eq!(i.a(), 9);

    let i = Instruction::wide(Opcode::Jump, BUU_MAX + 1);
    assert_eq!(i.buu(), 0);
    assert_eq!(i.opcode(), Ok(Opcode::Jump));

    let i = Instruction::jump(BSS_MAX + 1);
    assert_eq!(i.bss(), BSS_MIN);
    assert_eq!(i.opcode(), Ok(Opcode::Jump));
}

#[test]
fn rk_threshold() {
    let constants = vec![Value::Number(100.), Value::Number(20.)];
    let values = returned(run(
        constants,
        vec![
            Instruction::load_constant(1, 1),
            Instruction::add(0, 1, k(0)),
            Instruction::add(2, k(0), k(1)),
            Instruction::return_values(0, 3),
        ],
    ));
    assert_eq!(
        values,
        [Value::Number(120.), Value::Number(20.), Value::Number(120.)]
    );
}

#[test]
fn data_movement() {
    let values = returned(run(
        vec![Value::True, Value::Number(3.)],
        vec![
            Instruction::load_constant(0, 0),
            Instruction::load_constant(1, 1),
            Instruction::move_register(2, 1),
            Instruction::return_values(0, 4),
        ],
    ));
    assert_eq!(
        values,
        [Value::True, Value::Number(3.), Value::Number(3.), Value::Nil]
    );
}

#[test]
fn arithmetic() {
    let values = returned(run(
        vec![Value::Number(6.), Value::Number(4.), Value::Number(0.)],
        vec![
            Instruction::add(0, k(0), k(1)),
            Instruction::sub(1, k(0), k(1)),
            Instruction::mul(2, k(0), k(1)),
            Instruction::div(3, k(0), k(1)),
            Instruction::div(4, k(0), k(2)),
            Instruction::return_values(0, 5),
        ],
    ));
    assert_eq!(
        values,
        [
            Value::Number(10.),
            Value::Number(2.),
            Value::Number(24.),
            Value::Number(1.5),
            Value::Number(f64::INFINITY)
        ]
    );
}

#[test]
fn arithmetic_type_mismatch() {
    assert_eq!(
        run(
            vec![Value::Number(1.)],
            vec![
                Instruction::add(0, 1, k(0)),
                Instruction::return_values(0, 1),
            ],
        ),
        Status::Error(Fault::TypeMismatch)
    );
    assert_eq!(
        run(
            vec![Value::True, Value::Number(1.)],
            vec![
                Instruction::lt(0, k(0), k(1)),
                Instruction::jump(0),
                Instruction::return_values(0, 0),
            ],
        ),
        Status::Error(Fault::TypeMismatch)
    );
}

fn branch(test: fn(u32, u32, u32) -> Instruction, lhs: Value, rhs: Value) -> bool {
    let values = returned(run(
        vec![lhs, rhs, Value::False, Value::True],
        vec![
            test(0, k(0), k(1)),
            Instruction::jump(2),
            Instruction::load_constant(0, 2),
            Instruction::return_values(0, 1),
            Instruction::load_constant(0, 3),
            Instruction::return_values(0, 1),
        ],
    ));
    values[0] == Value::True
}

#[test]
fn comparisons() {
    assert!(branch(Instruction::eq, Value::Number(5.), Value::Number(5.)));
    assert!(!branch(Instruction::eq, Value::Number(5.), Value::Number(4.)));
    assert!(branch(Instruction::eq, Value::Nil, Value::Nil));
    assert!(!branch(Instruction::eq, Value::Nil, Value::False));
    assert!(!branch(Instruction::eq, Value::Number(0.), Value::False));

    assert!(branch(Instruction::lt, Value::Number(1.), Value::Number(2.)));
    assert!(!branch(Instruction::lt, Value::Number(2.), Value::Number(2.)));
    assert!(branch(Instruction::le, Value::Number(2.), Value::Number(2.)));
    assert!(!branch(Instruction::le, Value::Number(3.), Value::Number(2.)));
}

#[test]
fn inverted_comparison() {
    // With A = 1 the jump is taken when the comparison is false.
    let values = returned(run(
        vec![Value::Number(1.), Value::Number(2.)],
        vec![
            Instruction::eq(1, k(0), k(1)),
            Instruction::jump(1),
            Instruction::return_values(0, 0),
            Instruction::load_constant(0, 1),
            Instruction::return_values(0, 1),
        ],
    ));
    assert_eq!(values, [Value::Number(2.)]);
}

#[test]
fn comparison_requires_jump() {
    assert_eq!(
        run(
            vec![Value::Number(1.)],
            vec![
                Instruction::eq(0, k(0), k(0)),
                Instruction::return_values(0, 0),
            ],
        ),
        Status::Error(Fault::ExpectedJump)
    );
}

#[test]
fn not() {
    let values = returned(run(
        vec![Value::Number(5.), Value::Number(0.)],
        vec![
            Instruction::load_constant(0, 0),
            Instruction::load_constant(1, 1),
            Instruction::not(0, 0),
            Instruction::not(1, 1),
            Instruction::not(2, 2),
            Instruction::return_values(0, 3),
        ],
    ));
    assert_eq!(values, [Value::False, Value::True, Value::True]);
}

#[test]
fn call_with_arguments() {
    let callee = Function::new(
        [],
        [
            Instruction::add(0, 0, 1),
            Instruction::return_values(0, 1),
        ],
    );
    let values = returned(run(
        vec![callee.into(), Value::Number(3.), Value::Number(4.)],
        vec![
            Instruction::load_constant(1, 0),
            Instruction::load_constant(2, 1),
            Instruction::load_constant(3, 2),
            Instruction::call(1, 2, 1),
            Instruction::return_values(1, 1),
        ],
    ));
    assert_eq!(values, [Value::Number(7.)]);
}

#[test]
fn call_return_landing() {
    let callee = Function::new(
        [Value::Number(1.), Value::Number(2.)],
        [
            Instruction::load_constant(0, 0),
            Instruction::load_constant(1, 1),
            Instruction::return_values(0, 2),
        ],
    );
    let values = returned(run(
        vec![callee.into(), Value::Number(99.)],
        vec![
            Instruction::load_constant(3, 0),
            Instruction::load_constant(5, 1),
            Instruction::call(3, 0, 3),
            Instruction::return_values(3, 3),
        ],
    ));
    // Only two values were returned, so the third landing slot is untouched.
    assert_eq!(
        values,
        [Value::Number(1.), Value::Number(2.), Value::Number(99.)]
    );

    let values = returned(run(
        vec![
            Function::new(
                [Value::Number(1.), Value::Number(2.)],
                [
                    Instruction::load_constant(0, 0),
                    Instruction::load_constant(1, 1),
                    Instruction::return_values(0, 2),
                ],
            )
            .into(),
            Value::Number(99.),
        ],
        vec![
            Instruction::load_constant(3, 0),
            Instruction::load_constant(4, 1),
            Instruction::call(3, 0, 1),
            Instruction::return_values(3, 2),
        ],
    ));
    // One value was requested, so the second returned value is dropped.
    assert_eq!(values, [Value::Number(1.), Value::Number(99.)]);
}

#[test]
fn call_requires_function() {
    assert_eq!(
        run(
            vec![],
            vec![Instruction::call(0, 0, 0), Instruction::return_values(0, 0)],
        ),
        Status::Error(Fault::NotAFunction)
    );
}

fn counting_loop() -> Box<Frame> {
    Box::new(Frame::new(Arc::new(Function::new(
        [Value::Number(0.), Value::Number(1.), Value::Number(10.)],
        [
            Instruction::load_constant(0, 0),
            Instruction::add(0, 0, k(1)),
            Instruction::lt(0, 0, k(2)),
            Instruction::jump(-3),
            Instruction::return_values(0, 1),
        ],
    ))))
}

#[test]
fn execution_limit_forces_yield() {
    initialize_tracing();
    let mut frame = counting_loop();
    let mut host = TestHost::default();
    let mut yields = 0;
    let values = loop {
        match execute(&mut frame, &mut host, 5) {
            Status::Yield => yields += 1,
            Status::End(values) => break values,
            other => unreachable!("unexpected status {other:?}"),
        }
    };
    // 22 instructions execute in total: 4 full turns of 5, then 2 more.
    assert_eq!(yields, 4);
    assert_eq!(values, [Value::Number(10.)]);

    let mut frame = counting_loop();
    assert_eq!(
        execute(&mut frame, &mut host, 0),
        Status::End(vec![Value::Number(10.)])
    );
    let mut frame = counting_loop();
    assert!(matches!(
        execute(&mut frame, &mut host, DEFAULT_EXEC_LIMIT),
        Status::End(_)
    ));
}

#[test]
fn yields() {
    initialize_tracing();
    let mut frame = Box::new(Frame::new(Arc::new(Function::new(
        [Value::Number(5.), Value::Number(-5.)],
        [
            Instruction::yield_now(),
            Instruction::sleep(k(0)),
            Instruction::sleep(k(1)),
            Instruction::abc(Opcode::Yield, 3, 0, 0),
        ],
    ))));
    let mut host = TestHost::default();
    assert_eq!(execute(&mut frame, &mut host, 0), Status::Yield);
    assert_eq!(frame.pc(), 1);
    assert_eq!(
        execute(&mut frame, &mut host, 0),
        Status::Suspend(Wait::Timer(Duration::from_millis(5)))
    );
    assert_eq!(
        execute(&mut frame, &mut host, 0),
        Status::Suspend(Wait::Timer(Duration::ZERO))
    );
    assert_eq!(
        execute(&mut frame, &mut host, 0),
        Status::Error(Fault::InvalidYield(3))
    );
}

#[test]
fn receive_waits_for_message() {
    initialize_tracing();
    let mut frame = Box::new(Frame::new(Arc::new(Function::new(
        [],
        [Instruction::receive(4), Instruction::return_values(4, 1)],
    ))));
    let mut host = TestHost::default();
    assert_eq!(
        execute(&mut frame, &mut host, 0),
        Status::Suspend(Wait::Message)
    );
    assert_eq!(frame.pc(), 0);

    host.inbox.push_back(Value::Number(42.));
    assert_eq!(
        execute(&mut frame, &mut host, 0),
        Status::End(vec![Value::Number(42.)])
    );
}

#[test]
fn spawn_stores_child_id() {
    initialize_tracing();
    let child = Arc::new(Function::new([], [Instruction::return_values(0, 0)]));
    let mut frame = Box::new(Frame::new(Arc::new(Function::new(
        [Value::Function(child.clone())],
        [Instruction::spawn(2, k(0)), Instruction::return_values(2, 1)],
    ))));
    let mut host = TestHost::default();
    let values = returned(execute(&mut frame, &mut host, 0));
    assert_eq!(host.spawned.len(), 1);
    assert!(Arc::ptr_eq(&host.spawned[0], &child));
    assert!(matches!(values[0], Value::Number(id) if id >= 1.));
}

#[test]
fn hooks_observe_frame() {
    let invoked = Arc::new(AtomicUsize::new(0));
    let hook = Hook::new({
        let invoked = invoked.clone();
        move |context: &HookContext<'_>| {
            assert_eq!(context.frame[Register(0)], Value::Number(8.));
            assert_eq!(context.run_queue, [context.task]);
            invoked.fetch_add(1, Ordering::Relaxed);
        }
    });
    let values = returned(run(
        vec![Value::Number(8.), hook.into()],
        vec![
            Instruction::load_constant(0, 0),
            Instruction::hook(k(1)),
            Instruction::dump_registers(0, 1, 2),
            Instruction::hook(k(1)),
            Instruction::return_values(0, 1),
        ],
    ));
    assert_eq!(values, [Value::Number(8.)]);
    assert_eq!(invoked.load(Ordering::Relaxed), 2);
}

#[test]
fn invalid_programs() {
    assert_eq!(
        run(vec![], vec![Instruction(63)]),
        Status::Error(Fault::InvalidOpcode(63))
    );
    assert_eq!(
        run(vec![], vec![Instruction::move_register(0, 1)]),
        Status::Error(Fault::InvalidInstructionAddress)
    );
    assert_eq!(
        run(vec![], vec![Instruction::move_register(10, 0)]),
        Status::Error(Fault::InvalidRegister)
    );
    assert_eq!(
        run(vec![], vec![Instruction::load_constant(0, 0)]),
        Status::Error(Fault::InvalidConstant)
    );
    assert_eq!(
        run(vec![], vec![Instruction::jump(-2)]),
        Status::Error(Fault::InvalidInstructionAddress)
    );
}

#[test]
fn repr() {
    let mut buffer = [0; 16];
    assert_eq!(Value::Nil.repr(&mut buffer), "nil");
    assert_eq!(Value::True.repr(&mut buffer), "true");
    assert_eq!(Value::False.repr(&mut buffer), "false");
    assert_eq!(Value::Number(1.5).repr(&mut buffer), "1.500000");

    let mut small = [0; 4];
    assert_eq!(Value::Number(1.5).repr(&mut small), "1.50");
    assert_eq!(Value::False.repr(&mut small), "fals");

    let function = Value::from(Function::new([], []));
    assert!(function.repr(&mut [0; 64]).starts_with("<function"));
}

#[test]
fn debug_format() {
    assert_eq!(format!("{:?}", Instruction::add(1, 2, 3)), "ADD 1 2 3");
    assert_eq!(format!("{:?}", Instruction::load_constant(4, 300)), "LOADK 4 300");
    assert_eq!(format!("{:?}", Instruction::jump(-3)), "JUMP -3");
}
