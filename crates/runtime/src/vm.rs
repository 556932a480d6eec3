//! The virtual machine.
//!
//! A stack VM over the bytecode in [`jmpl_core::chunk`]. Call frames window
//! the value stack; closures capture locals through upvalue objects kept in
//! a list sorted by descending stack slot, closed when their slot leaves the
//! stack. The VM owns the heap and drives its collector from allocation
//! sites, where every root (value stack, frame closures and stashes, open
//! upvalues, globals, temp stack) can be enumerated.

use std::io::{self, IsTerminal, Write};
use std::time::Instant;

use jmpl_core::chunk::OpCode;
use jmpl_core::object::{ClosureObj, NativeObj, ObjKind, ObjRef, Payload, UpvalueLoc, UpvalueObj};
use jmpl_core::{Heap, Roots, Table, UINT8_COUNT, Value};

use crate::config::RuntimeConfig;
use crate::native::{self, NativeDef};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * UINT8_COUNT;

/// Outcome of interpreting one source buffer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

pub struct RuntimeError {
    pub message: String,
}

/// One activation record. `base` indexes the callee's slot on the value
/// stack; `stash` holds the frame's implicit-return value.
#[derive(Clone, Copy)]
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    base: usize,
    stash: Value,
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Option<ObjRef>,
    natives: Vec<NativeDef>,
    start: Instant,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new(config: RuntimeConfig) -> Vm {
        Vm::with_output(config, Box::new(io::stdout()))
    }

    /// Build a VM writing program output (`out`, `print`, `println`) to the
    /// given sink.
    pub fn with_output(config: RuntimeConfig, out: Box<dyn Write>) -> Vm {
        let mut vm = Vm {
            heap: Heap::new(config.stress_gc),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: None,
            natives: Vec::new(),
            start: Instant::now(),
            out,
        };
        vm.install_natives();
        vm
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Compile and run one source buffer. Globals persist across calls, so
    /// a REPL can feed lines to the same VM.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let Some(function) = jmpl_compiler::compile(source, &mut self.heap) else {
            return InterpretResult::CompileError;
        };

        // Root the script function while its closure is allocated.
        self.heap.push_temp(Value::Obj(function));
        self.collect_if_needed();
        let closure = self.heap.alloc(Payload::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        }));
        self.heap.pop_temp();

        self.stack.clear();
        self.stack.push(Value::Obj(closure));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: 0,
            stash: Value::Null,
        });

        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(error) => {
                self.report_runtime_error(&error);
                self.reset();
                InterpretResult::RuntimeError
            }
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    // --- Native registry ---

    fn install_natives(&mut self) {
        for def in native::registry() {
            let index = self.natives.len() as u32;
            self.natives.push(def);

            let name = self.heap.intern(def.name);
            let hash = self.heap.as_str(name).hash;
            let obj = self.heap.alloc(Payload::Native(NativeObj {
                native: index,
                arity: def.arity,
            }));
            self.globals.set(name, hash, Value::Obj(obj));
        }
    }

    // --- Stack primitives ---

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.error("Stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn error(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError {
            message: message.into(),
        }
    }

    // --- Instruction decoding ---

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let function = self.heap.as_closure(frame.closure).function;
        let byte = self.heap.as_function(function).chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_u16() as usize;
        let function = self.heap.as_closure(self.frame().closure).function;
        self.heap.as_function(function).chunk.constants[index]
    }

    /// Read a global-name operand: a u16 constant index of an interned
    /// string, returned with its hash.
    fn read_global_name(&mut self) -> (ObjRef, u64) {
        let name = match self.read_constant() {
            Value::Obj(r) => r,
            _ => unreachable!("global name constant must be a string"),
        };
        (name, self.heap.as_str(name).hash)
    }

    // --- Garbage collection driving ---

    /// Run a collection when the heap asks for one. Call sites must have
    /// every live value rooted (on the stack or the heap's temp stack).
    pub fn collect_if_needed(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let closures: Vec<ObjRef> = self.frames.iter().map(|f| f.closure).collect();
        let mut values: Vec<Value> = self.stack.clone();
        values.extend(self.frames.iter().map(|f| f.stash));
        let roots = Roots {
            stack: &values,
            closures: &closures,
            open_upvalues: self.open_upvalues,
            globals: Some(&self.globals),
        };
        self.heap.collect(&roots);
    }

    /// Intern with a collection opportunity first.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        self.collect_if_needed();
        self.heap.intern(text)
    }

    // --- Upvalues ---

    /// Find or create the open upvalue for a stack slot. The list is kept
    /// sorted by descending slot so close-on-return is O(k).
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut cur = self.open_upvalues;

        while let Some(u) = cur {
            match self.heap.as_upvalue(u).location {
                UpvalueLoc::Stack(s) if s > slot => {
                    prev = Some(u);
                    cur = self.heap.as_upvalue(u).next_open;
                }
                UpvalueLoc::Stack(s) if s == slot => return u,
                _ => break,
            }
        }

        self.collect_if_needed();
        let created = self.heap.alloc(Payload::Upvalue(UpvalueObj {
            location: UpvalueLoc::Stack(slot),
            next_open: cur,
        }));

        match prev {
            None => self.open_upvalues = Some(created),
            Some(p) => self.heap.as_upvalue_mut(p).next_open = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `from_slot`: copy the stack
    /// value into the upvalue and unlink it.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(u) = self.open_upvalues {
            let slot = match self.heap.as_upvalue(u).location {
                UpvalueLoc::Stack(s) => s,
                UpvalueLoc::Closed(_) => break,
            };
            if slot < from_slot {
                break;
            }

            let value = self.stack[slot];
            let upvalue = self.heap.as_upvalue_mut(u);
            self.open_upvalues = upvalue.next_open;
            upvalue.location = UpvalueLoc::Closed(value);
            upvalue.next_open = None;
        }
    }

    // --- Calls ---

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        let Value::Obj(r) = callee else {
            return Err(self.error("Can only call functions"));
        };

        match self.heap.kind(r) {
            ObjKind::Closure => self.call_closure(r, arg_count),
            ObjKind::Native => self.call_native(r, arg_count),
            _ => Err(self.error("Can only call functions")),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let arity = {
            let function = self.heap.as_closure(closure).function;
            self.heap.as_function(function).arity
        };
        if arity != arg_count {
            return Err(self.error(format!(
                "Expected {arity} arguments but got {arg_count}"
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.error("Stack overflow"));
        }

        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - arg_count - 1,
            stash: Value::Null,
        });
        Ok(())
    }

    fn call_native(&mut self, native: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let (index, arity) = {
            let n = self.heap.as_native(native);
            (n.native as usize, n.arity)
        };
        if arity != arg_count {
            return Err(self.error(format!(
                "Expected {arity} arguments but got {arg_count}"
            )));
        }

        let args: Vec<Value> = self.stack[self.stack.len() - arg_count..].to_vec();
        let func = self.natives[index].func;
        let result = func(self, &args)?;

        self.stack.truncate(self.stack.len() - arg_count - 1);
        self.push(result)
    }

    // --- Output ---

    pub fn write_value(&mut self, value: Value) {
        let text = self.heap.value_to_string(value);
        let _ = write!(self.out, "{text}");
    }

    pub fn writeln_value(&mut self, value: Value) {
        let text = self.heap.value_to_string(value);
        let _ = writeln!(self.out, "{text}");
    }

    // --- Error reporting ---

    fn report_runtime_error(&mut self, error: &RuntimeError) {
        tracing::debug!(target: "jmpl::vm", message = %error.message, "runtime error");
        let _ = self.out.flush();
        if io::stderr().is_terminal() {
            eprintln!("\x1b[31mRuntime error\x1b[0m: {}", error.message);
        } else {
            eprintln!("Runtime error: {}", error.message);
        }

        // Innermost frame first, the script last.
        for frame in self.frames.iter().rev() {
            let function = self.heap.as_closure(frame.closure).function;
            let f = self.heap.as_function(function);
            let line = f.chunk.line_for(frame.ip.saturating_sub(1));
            match f.name {
                Some(name) => {
                    eprintln!("  [line {}] in {}()", line, self.heap.as_str(name).as_str())
                }
                None => eprintln!("  [line {line}] in script"),
            }
        }
    }

    // --- Dispatch loop ---

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let byte = self.read_byte();
            let op = OpCode::from_byte(byte)
                .ok_or_else(|| self.error(format!("Unknown opcode {byte}")))?;

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value)?;
                }
                OpCode::Null => self.push(Value::Null)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().base + slot];
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0);
                }

                OpCode::GetGlobal => {
                    let (name, hash) = self.read_global_name();
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value)?,
                        None => {
                            return Err(self.undefined_variable(name));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let (name, hash) = self.read_global_name();
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let (name, hash) = self.read_global_name();
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        self.globals.delete(name, hash);
                        return Err(self.undefined_variable(name));
                    }
                }

                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap.as_closure(self.frame().closure).upvalues[index];
                    let value = match self.heap.as_upvalue(upvalue).location {
                        UpvalueLoc::Stack(slot) => self.stack[slot],
                        UpvalueLoc::Closed(value) => value,
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.peek(0);
                    let upvalue = self.heap.as_closure(self.frame().closure).upvalues[index];
                    match self.heap.as_upvalue(upvalue).location {
                        UpvalueLoc::Stack(slot) => self.stack[slot] = value,
                        UpvalueLoc::Closed(_) => {
                            self.heap.as_upvalue_mut(upvalue).location = UpvalueLoc::Closed(value)
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    let equal = self.heap.values_equal(a, b);
                    self.push(Value::Bool(equal))?;
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    let equal = self.heap.values_equal(a, b);
                    self.push(Value::Bool(!equal))?;
                }
                OpCode::Greater => self.numeric_compare(|a, b| a > b)?,
                OpCode::GreaterEqual => self.numeric_compare(|a, b| a >= b)?,
                OpCode::Less => self.numeric_compare(|a, b| a < b)?,
                OpCode::LessEqual => self.numeric_compare(|a, b| a <= b)?,

                OpCode::Add => self.add()?,
                OpCode::Subtract => self.numeric_binary(|a, b| Ok(a - b))?,
                OpCode::Multiply => self.numeric_binary(|a, b| Ok(a * b))?,
                OpCode::Divide => self.numeric_binary(|a, b| {
                    if b == 0.0 {
                        Err("Division by zero")
                    } else {
                        Ok(a / b)
                    }
                })?,
                OpCode::Exponent => self.numeric_binary(|a, b| Ok(a.powf(b)))?,
                // IEEE remainder semantics: a zero divisor yields NaN.
                OpCode::Mod => self.numeric_binary(|a, b| Ok(a % b))?,
                OpCode::Negate => {
                    let value = self.pop();
                    match value.as_number() {
                        Some(n) => self.push(Value::Number(-n))?,
                        None => return Err(self.error("Operand must be a number")),
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()))?;
                }
                OpCode::Xor => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.is_falsey() != b.is_falsey()))?;
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.pop().is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::JumpIfFalsePeek => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(r) => r,
                        _ => unreachable!("closure constant must be a function"),
                    };
                    self.collect_if_needed();
                    let closure = self.heap.alloc(Payload::Closure(ClosureObj {
                        function,
                        upvalues: Vec::new(),
                    }));
                    self.push(Value::Obj(closure))?;

                    let count = self.heap.as_function(function).upvalue_count;
                    for _ in 0..count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frame().base;
                            self.capture_upvalue(base + index)
                        } else {
                            self.heap.as_closure(self.frame().closure).upvalues[index]
                        };
                        self.heap.as_closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::Return => {
                    let implicit = self.read_byte() == 1;
                    let frame = *self.frame();
                    let result = if implicit { frame.stash } else { self.pop() };

                    self.close_upvalues(frame.base);
                    self.frames.pop();

                    if self.frames.is_empty() {
                        self.stack.clear();
                        return Ok(());
                    }

                    self.stack.truncate(frame.base);
                    self.push(result)?;
                }
                OpCode::Stash => {
                    let value = self.pop();
                    self.frame_mut().stash = value;
                }
                OpCode::Out => {
                    let value = self.pop();
                    self.writeln_value(value);
                }

                OpCode::SetCreate => {
                    self.collect_if_needed();
                    let set = self.heap.set_new();
                    self.push(Value::Obj(set))?;
                }
                OpCode::SetInsert => {
                    let count = self.read_byte() as usize;
                    let set = match self.pop() {
                        Value::Obj(r) => r,
                        _ => unreachable!("set insert without a set"),
                    };
                    let split = self.stack.len() - count;
                    let elements: Vec<Value> = self.stack.split_off(split);
                    for element in elements {
                        self.heap.set_insert(set, element);
                    }
                    self.push(Value::Obj(set))?;
                }
                OpCode::SetOmission => self.set_omission()?,
                OpCode::SetIn => self.membership()?,
                OpCode::SetIntersect => self.set_binary(OpCode::SetIntersect)?,
                OpCode::SetUnion => self.set_binary(OpCode::SetUnion)?,
                OpCode::SetDifference => self.set_binary(OpCode::SetDifference)?,
                OpCode::Subset => self.subset_compare(true)?,
                OpCode::SubsetEq => self.subset_compare(false)?,
                OpCode::Size => {
                    let value = self.pop();
                    let size = match value {
                        Value::Obj(r) => match self.heap.kind(r) {
                            ObjKind::Set => self.heap.as_set(r).len(),
                            ObjKind::Tuple => self.heap.as_tuple(r).len(),
                            ObjKind::String => self.heap.as_str(r).len(),
                            _ => return Err(self.error("Operand must be a set, tuple, or string")),
                        },
                        _ => return Err(self.error("Operand must be a set, tuple, or string")),
                    };
                    self.push(Value::Number(size as f64))?;
                }
                OpCode::Arb => {
                    let value = self.peek(0);
                    let set = match value {
                        Value::Obj(r) if self.heap.kind(r) == ObjKind::Set => r,
                        _ => return Err(self.error("Operand must be a set")),
                    };
                    let picked = self.heap.set_arb(set);
                    self.pop();
                    self.push(picked)?;
                }

                OpCode::CreateTuple => {
                    let count = self.read_byte() as usize;
                    self.collect_if_needed();
                    let split = self.stack.len() - count;
                    let elements: Vec<Value> = self.stack.split_off(split);
                    // The elements left the stack; keep them rooted while
                    // the tuple is allocated.
                    for &element in &elements {
                        self.heap.push_temp(element);
                    }
                    let tuple = self.heap.tuple_new(elements);
                    for _ in 0..count {
                        self.heap.pop_temp();
                    }
                    self.push(Value::Obj(tuple))?;
                }
                OpCode::TupleOmission => self.tuple_omission()?,
                OpCode::Subscript => self.subscript()?,

                OpCode::CreateIterator => {
                    let target = match self.peek(0) {
                        Value::Obj(r) if self.heap.is_iterable(r) => r,
                        _ => {
                            return Err(
                                self.error("Can only iterate over sets, tuples, and strings")
                            );
                        }
                    };
                    self.collect_if_needed();
                    let iterator = self.heap.iterator_new(target);
                    self.pop();
                    self.push(Value::Obj(iterator))?;
                }
                OpCode::Iterate => {
                    let slot = self.read_byte() as usize;
                    let offset = self.read_u16() as usize;
                    let iterator = match self.peek(0) {
                        Value::Obj(r) => r,
                        _ => unreachable!("iterate without an iterator"),
                    };
                    // String iteration allocates one-code-point strings.
                    self.collect_if_needed();
                    match self.heap.iterate(iterator) {
                        Some(value) => {
                            let base = self.frame().base;
                            self.stack[base + slot] = value;
                        }
                        None => self.frame_mut().ip += offset,
                    }
                }
            }
        }
    }

    fn undefined_variable(&self, name: ObjRef) -> RuntimeError {
        self.error(format!(
            "Undefined variable '{}'",
            self.heap.as_str(name).as_str()
        ))
    }

    // --- Operator helpers ---

    fn numeric_compare(&mut self, op: fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let (b, a) = (self.pop(), self.pop());
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => self.push(Value::Bool(op(x, y))),
            _ => Err(self.error("Operands must be numbers")),
        }
    }

    fn numeric_binary(
        &mut self,
        op: fn(f64, f64) -> Result<f64, &'static str>,
    ) -> Result<(), RuntimeError> {
        let (b, a) = (self.pop(), self.pop());
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => match op(x, y) {
                Ok(result) => self.push(Value::Number(result)),
                Err(message) => Err(self.error(message)),
            },
            _ => Err(self.error("Operands must be numbers")),
        }
    }

    /// `+`: numbers add, tuples concatenate, and any mix involving a string
    /// concatenates textually.
    fn add(&mut self) -> Result<(), RuntimeError> {
        let (b, a) = (self.peek(0), self.peek(1));

        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            self.pop();
            self.pop();
            return self.push(Value::Number(x + y));
        }

        let kind_of = |heap: &Heap, v: Value| v.as_obj().map(|r| heap.kind(r));
        let (ka, kb) = (kind_of(&self.heap, a), kind_of(&self.heap, b));

        if ka == Some(ObjKind::String) || kb == Some(ObjKind::String) {
            let b = self.pop();
            let a = self.pop();
            self.heap.push_temp(a);
            self.heap.push_temp(b);
            self.collect_if_needed();

            let result = if ka == Some(ObjKind::String) && kb == Some(ObjKind::String) {
                // Both strings: probe the intern table for the joined text
                // without materialising it first.
                let (ra, rb) = (
                    a.as_obj().expect("string operand"),
                    b.as_obj().expect("string operand"),
                );
                self.heap.intern_joined(ra, rb)
            } else {
                let text = format!(
                    "{}{}",
                    self.heap.value_to_string(a),
                    self.heap.value_to_string(b)
                );
                self.heap.intern(&text)
            };

            self.heap.pop_temp();
            self.heap.pop_temp();
            return self.push(Value::Obj(result));
        }

        if ka == Some(ObjKind::Tuple) && kb == Some(ObjKind::Tuple) {
            self.collect_if_needed();
            let (ra, rb) = (
                a.as_obj().expect("tuple operand"),
                b.as_obj().expect("tuple operand"),
            );
            let result = self.heap.tuple_concat(ra, rb);
            self.pop();
            self.pop();
            return self.push(Value::Obj(result));
        }

        Err(self.error("Operands must be numbers, tuples, or involve a string"))
    }

    fn membership(&mut self) -> Result<(), RuntimeError> {
        let (container, element) = (self.pop(), self.pop());
        let Value::Obj(r) = container else {
            return Err(self.error("Right operand of '∈' must be a set, tuple, or string"));
        };

        let found = match self.heap.kind(r) {
            ObjKind::Set => self.heap.set_contains(r, element),
            ObjKind::Tuple => {
                let elements: Vec<Value> = self.heap.as_tuple(r).elements.to_vec();
                elements
                    .into_iter()
                    .any(|e| self.heap.values_equal(e, element))
            }
            ObjKind::String => {
                let Some(e) = element.as_obj().filter(|&e| self.heap.kind(e) == ObjKind::String)
                else {
                    return Err(self.error("Left operand of '∈' on a string must be a string"));
                };
                let hay = self.heap.as_str(r).as_str();
                let needle = self.heap.as_str(e).as_str();
                hay.contains(needle)
            }
            _ => return Err(self.error("Right operand of '∈' must be a set, tuple, or string")),
        };

        self.push(Value::Bool(found))
    }

    fn set_binary(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let (b, a) = (self.peek(0), self.peek(1));
        let (ra, rb) = match (self.set_operand(a), self.set_operand(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => return Err(self.error("Operands must be sets")),
        };

        self.collect_if_needed();
        let result = match op {
            OpCode::SetIntersect => self.heap.set_intersect(ra, rb),
            OpCode::SetUnion => self.heap.set_union(ra, rb),
            _ => self.heap.set_difference(ra, rb),
        };
        self.pop();
        self.pop();
        self.push(Value::Obj(result))
    }

    fn subset_compare(&mut self, proper: bool) -> Result<(), RuntimeError> {
        let (b, a) = (self.pop(), self.pop());
        let (ra, rb) = match (self.set_operand(a), self.set_operand(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => return Err(self.error("Operands must be sets")),
        };
        let result = if proper {
            self.heap.set_is_proper_subset(ra, rb)
        } else {
            self.heap.set_is_subset(ra, rb)
        };
        self.push(Value::Bool(result))
    }

    fn set_operand(&self, value: Value) -> Option<ObjRef> {
        value
            .as_obj()
            .filter(|&r| self.heap.kind(r) == ObjKind::Set)
    }

    // --- Omissions ---

    fn omission_bounds(
        &mut self,
        with_step: bool,
    ) -> Result<(i64, i64, i64), RuntimeError> {
        let last = self.pop();
        let second = if with_step { Some(self.pop()) } else { None };
        let first = self.pop();

        let to_int = |v: Value| -> Option<i64> {
            match v {
                Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(n as i64),
                _ => None,
            }
        };

        let first = to_int(first).ok_or_else(|| self.error("Omission bounds must be integers"))?;
        let last = to_int(last).ok_or_else(|| self.error("Omission bounds must be integers"))?;
        let step = match second {
            None => 1,
            Some(v) => {
                let second =
                    to_int(v).ok_or_else(|| self.error("Omission bounds must be integers"))?;
                second - first
            }
        };
        if step == 0 {
            return Err(self.error("Omission step cannot be zero"));
        }

        Ok((first, last, step))
    }

    fn set_omission(&mut self) -> Result<(), RuntimeError> {
        let with_step = self.read_byte() == 1;
        let (first, last, step) = self.omission_bounds(with_step)?;

        self.collect_if_needed();
        let set = self.heap.set_new();
        let mut v = first;
        while (step > 0 && v <= last) || (step < 0 && v >= last) {
            self.heap.set_insert(set, Value::Number(v as f64));
            v += step;
        }
        self.push(Value::Obj(set))
    }

    fn tuple_omission(&mut self) -> Result<(), RuntimeError> {
        let with_step = self.read_byte() == 1;
        let (first, last, step) = self.omission_bounds(with_step)?;

        self.collect_if_needed();
        let mut elements = Vec::new();
        let mut v = first;
        while (step > 0 && v <= last) || (step < 0 && v >= last) {
            elements.push(Value::Number(v as f64));
            v += step;
        }
        let tuple = self.heap.tuple_new(elements);
        self.push(Value::Obj(tuple))
    }

    // --- Subscripts ---

    fn subscript(&mut self) -> Result<(), RuntimeError> {
        let is_slice = self.read_byte() == 1;
        if is_slice {
            self.subscript_slice()
        } else {
            self.subscript_index()
        }
    }

    fn subscript_index(&mut self) -> Result<(), RuntimeError> {
        let index_v = self.pop();
        let target_v = self.pop();

        let Value::Obj(target) = target_v else {
            return Err(self.error("Can only subscript strings and tuples"));
        };
        let length = match self.heap.kind(target) {
            ObjKind::Tuple => self.heap.as_tuple(target).len(),
            ObjKind::String => self.heap.as_str(target).len(),
            _ => return Err(self.error("Can only subscript strings and tuples")),
        };

        let index = self.normalize_index(index_v, length)?;
        let Some(index) = index.filter(|&i| i < length) else {
            return Err(self.error("Index out of bounds"));
        };

        let value = match self.heap.kind(target) {
            ObjKind::Tuple => self.heap.as_tuple(target).elements[index],
            _ => {
                self.heap.push_temp(target_v);
                self.collect_if_needed();
                let value = self.heap.index_string(target, index);
                self.heap.pop_temp();
                value
            }
        };
        self.push(value)
    }

    fn subscript_slice(&mut self) -> Result<(), RuntimeError> {
        let end_v = self.pop();
        let start_v = self.pop();
        let target_v = self.pop();

        let Value::Obj(target) = target_v else {
            return Err(self.error("Can only subscript strings and tuples"));
        };
        let kind = self.heap.kind(target);
        let length = match kind {
            ObjKind::Tuple => self.heap.as_tuple(target).len(),
            ObjKind::String => self.heap.as_str(target).len(),
            _ => return Err(self.error("Can only subscript strings and tuples")),
        };

        // Open ends default to the first and last element; everything is
        // clamped into range.
        let mut start = match start_v {
            Value::Null => 0i64,
            v => self.raw_index(v)?,
        };
        let mut end = match end_v {
            Value::Null => length as i64 - 1,
            v => self.raw_index(v)?,
        };
        if start < 0 {
            start += length as i64;
        }
        if end < 0 {
            end += length as i64;
        }
        let start = start.max(0);
        let end = end.min(length as i64 - 1);

        self.heap.push_temp(target_v);
        self.collect_if_needed();
        let result = if length == 0 || start > end {
            match kind {
                ObjKind::Tuple => Value::Obj(self.heap.tuple_new(Vec::new())),
                _ => Value::Obj(self.heap.intern("")),
            }
        } else {
            let (start, end) = (start as usize, end as usize);
            match kind {
                ObjKind::Tuple => Value::Obj(self.heap.tuple_slice(target, start, end)),
                _ => Value::Obj(self.heap.slice_string(target, start, end)),
            }
        };
        self.heap.pop_temp();
        self.push(result)
    }

    /// An integer subscript operand, without range normalisation.
    fn raw_index(&self, value: Value) -> Result<i64, RuntimeError> {
        match value {
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Ok(n as i64),
            _ => Err(self.error("Subscript index must be an integer")),
        }
    }

    /// Python-style negative indexing: -1 is the last element. Returns
    /// `None` when the normalised index falls below zero.
    fn normalize_index(
        &self,
        value: Value,
        length: usize,
    ) -> Result<Option<usize>, RuntimeError> {
        let raw = self.raw_index(value)?;
        let adjusted = if raw < 0 { raw + length as i64 } else { raw };
        if adjusted < 0 {
            Ok(None)
        } else {
            Ok(Some(adjusted as usize))
        }
    }
}
