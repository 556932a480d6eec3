//! The object heap and its mark-and-sweep collector.
//!
//! Objects live in an index-addressed slot arena. The object header's
//! intrusive `next` link threads every live object into a list starting at
//! `head`; sweep walks that list, unlinks unmarked objects, and recycles
//! their slots through a free list. The heap also owns the string intern
//! table (weak: unmarked keys are removed before each sweep) and the
//! temp-root stack that protects values which are mid-flight between VM
//! stack slots during compound operations.
//!
//! The heap itself never starts a collection: `should_collect` tells the
//! caller when a cycle is due, and the VM runs `collect` from sites where it
//! can enumerate every root.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::hash::{
    FALSE_HASH, NULL_HASH, TRUE_HASH, avalanche, hash_bytes, hash_joined_bytes, hash_number,
};
use crate::object::{
    ClosureObj, FunctionObj, IterObj, NativeObj, Obj, ObjKind, ObjRef, Payload, UpvalueLoc,
    UpvalueObj,
};
use crate::set::SetObj;
use crate::string::StrObj;
use crate::table::Table;
use crate::tuple::TupleObj;
use crate::value::Value;

/// First collection threshold: 1 MiB.
const INITIAL_GC: usize = 1024 * 1024;
const GC_HEAP_GROW_FACTOR: usize = 2;

/// External roots for a collection cycle. The heap adds its own temp stack
/// and handles the weak intern table itself.
pub struct Roots<'a> {
    /// Live VM value stack, `[stack, stackTop)`.
    pub stack: &'a [Value],
    /// Closure of every active call frame.
    pub closures: &'a [ObjRef],
    /// Head of the VM's open-upvalue list.
    pub open_upvalues: Option<ObjRef>,
    /// The globals table.
    pub globals: Option<&'a Table>,
}

impl Roots<'_> {
    pub fn empty() -> Roots<'static> {
        Roots {
            stack: &[],
            closures: &[],
            open_upvalues: None,
            globals: None,
        }
    }
}

pub struct Heap {
    slots: Vec<Option<Obj>>,
    /// Head of the intrusive live-object list.
    head: Option<ObjRef>,
    free: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    gray: Vec<ObjRef>,
    temp_roots: Vec<Value>,
    /// String intern table; weak (keys die when unreachable elsewhere).
    strings: Table,
    stress: bool,
    arb_state: u64,
}

impl Heap {
    /// `stress` forces a collection opportunity at every allocation site.
    pub fn new(stress: bool) -> Heap {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
            .unwrap_or(0x9E37_79B9)
            | 1;

        Heap {
            slots: Vec::new(),
            head: None,
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC,
            gray: Vec::new(),
            temp_roots: Vec::new(),
            strings: Table::new(),
            stress,
            arb_state: seed,
        }
    }

    // --- Allocation ---

    /// Allocate an object, linking it at the head of the object list. New
    /// objects start unmarked.
    pub fn alloc(&mut self, payload: Payload) -> ObjRef {
        let iterable = payload.kind().is_iterable();
        self.bytes_allocated += Self::payload_size(&payload) + std::mem::size_of::<Obj>();

        let obj = Obj {
            marked: false,
            iterable,
            next: self.head,
            payload,
        };

        let r = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(obj);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(obj));
                ObjRef(self.slots.len() as u32 - 1)
            }
        };

        self.head = Some(r);
        r
    }

    fn payload_size(payload: &Payload) -> usize {
        match payload {
            Payload::Str(s) => s.byte_size(),
            Payload::Set(s) => s.byte_size(),
            Payload::Tuple(t) => t.byte_size(),
            _ => 0,
        }
    }

    /// Record container growth that happened in place.
    pub(crate) fn add_bytes(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Whether the caller should run a collection before allocating more.
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    pub fn is_stress(&self) -> bool {
        self.stress
    }

    /// Number of live objects on the intrusive list.
    pub fn live_objects(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while let Some(r) = cur {
            n += 1;
            cur = self.get(r).next;
        }
        n
    }

    // --- Accessors ---

    pub fn get(&self, r: ObjRef) -> &Obj {
        self.slots[r.0 as usize]
            .as_ref()
            .expect("stale object reference")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.slots[r.0 as usize]
            .as_mut()
            .expect("stale object reference")
    }

    pub fn kind(&self, r: ObjRef) -> ObjKind {
        self.get(r).payload.kind()
    }

    pub fn is_iterable(&self, r: ObjRef) -> bool {
        self.get(r).iterable
    }

    pub fn as_str(&self, r: ObjRef) -> &StrObj {
        match &self.get(r).payload {
            Payload::Str(s) => s,
            p => panic!("expected string, found {:?}", p.kind()),
        }
    }

    pub fn as_set(&self, r: ObjRef) -> &SetObj {
        match &self.get(r).payload {
            Payload::Set(s) => s,
            p => panic!("expected set, found {:?}", p.kind()),
        }
    }

    pub fn as_tuple(&self, r: ObjRef) -> &TupleObj {
        match &self.get(r).payload {
            Payload::Tuple(t) => t,
            p => panic!("expected tuple, found {:?}", p.kind()),
        }
    }

    pub fn as_function(&self, r: ObjRef) -> &FunctionObj {
        match &self.get(r).payload {
            Payload::Function(f) => f,
            p => panic!("expected function, found {:?}", p.kind()),
        }
    }

    pub fn as_function_mut(&mut self, r: ObjRef) -> &mut FunctionObj {
        match &mut self.get_mut(r).payload {
            Payload::Function(f) => f,
            p => panic!("expected function, found {:?}", p.kind()),
        }
    }

    pub fn as_closure(&self, r: ObjRef) -> &ClosureObj {
        match &self.get(r).payload {
            Payload::Closure(c) => c,
            p => panic!("expected closure, found {:?}", p.kind()),
        }
    }

    pub fn as_closure_mut(&mut self, r: ObjRef) -> &mut ClosureObj {
        match &mut self.get_mut(r).payload {
            Payload::Closure(c) => c,
            p => panic!("expected closure, found {:?}", p.kind()),
        }
    }

    pub fn as_upvalue(&self, r: ObjRef) -> &UpvalueObj {
        match &self.get(r).payload {
            Payload::Upvalue(u) => u,
            p => panic!("expected upvalue, found {:?}", p.kind()),
        }
    }

    pub fn as_upvalue_mut(&mut self, r: ObjRef) -> &mut UpvalueObj {
        match &mut self.get_mut(r).payload {
            Payload::Upvalue(u) => u,
            p => panic!("expected upvalue, found {:?}", p.kind()),
        }
    }

    pub fn as_native(&self, r: ObjRef) -> &NativeObj {
        match &self.get(r).payload {
            Payload::Native(n) => n,
            p => panic!("expected native, found {:?}", p.kind()),
        }
    }

    pub fn as_iter(&self, r: ObjRef) -> &IterObj {
        match &self.get(r).payload {
            Payload::Iter(i) => i,
            p => panic!("expected iterator, found {:?}", p.kind()),
        }
    }

    pub fn as_iter_mut(&mut self, r: ObjRef) -> &mut IterObj {
        match &mut self.get_mut(r).payload {
            Payload::Iter(i) => i,
            p => panic!("expected iterator, found {:?}", p.kind()),
        }
    }

    // --- Temp roots ---

    /// Root a value that is not (or no longer) on the VM stack for the
    /// duration of a compound allocation.
    pub fn push_temp(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn pop_temp(&mut self) -> Value {
        self.temp_roots.pop().expect("temp root stack underflow")
    }

    // --- Interning ---

    /// Intern a string, returning the canonical object for these bytes.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        let hash = hash_bytes(text.as_bytes());
        if let Some(existing) = self.find_interned(text.as_bytes(), hash) {
            return existing;
        }

        let r = self.alloc(Payload::Str(StrObj::from_str_hashed(text, hash)));
        self.strings.set(r, hash, Value::Null);
        r
    }

    /// Intern the concatenation `a || b`, probing the table against the two
    /// halves before materialising the joined buffer.
    pub fn intern_joined(&mut self, a: ObjRef, b: ObjRef) -> ObjRef {
        let hash = {
            let (sa, sb) = (self.as_str(a), self.as_str(b));
            hash_joined_bytes(sa.utf8_bytes(), sb.utf8_bytes())
        };

        if let Some(existing) = self.find_interned_joined(a, b, hash) {
            return existing;
        }

        let joined = {
            let (sa, sb) = (self.as_str(a), self.as_str(b));
            let mut bytes = Vec::with_capacity(sa.utf8_bytes().len() + sb.utf8_bytes().len());
            bytes.extend_from_slice(sa.utf8_bytes());
            bytes.extend_from_slice(sb.utf8_bytes());
            // Both halves are valid UTF-8, so the concatenation is too.
            String::from_utf8(bytes).unwrap_or_default()
        };

        let r = self.alloc(Payload::Str(StrObj::from_str_hashed(&joined, hash)));
        self.strings.set(r, hash, Value::Null);
        r
    }

    /// Intern a string built from raw code points.
    pub fn intern_code_points(&mut self, points: &[u32]) -> ObjRef {
        let mut text = String::with_capacity(points.len());
        for &cp in points {
            text.push(char::from_u32(cp).unwrap_or(char::REPLACEMENT_CHARACTER));
        }
        self.intern(&text)
    }

    fn find_interned(&self, bytes: &[u8], hash: u64) -> Option<ObjRef> {
        self.probe_interned(hash, |s| s.utf8_bytes() == bytes)
    }

    fn find_interned_joined(&self, a: ObjRef, b: ObjRef, hash: u64) -> Option<ObjRef> {
        let (sa, sb) = (self.as_str(a), self.as_str(b));
        let (ba, bb) = (sa.utf8_bytes(), sb.utf8_bytes());
        let total = ba.len() + bb.len();
        self.probe_interned(hash, |s| {
            let bytes = s.utf8_bytes();
            bytes.len() == total && &bytes[..ba.len()] == ba && &bytes[ba.len()..] == bb
        })
    }

    fn probe_interned(&self, hash: u64, mut matches: impl FnMut(&StrObj) -> bool) -> Option<ObjRef> {
        if self.strings.is_empty() {
            return None;
        }

        let mask = self.strings.entries.len() as u64 - 1;
        let mut index = hash & mask;
        let mut perturb = hash;

        loop {
            let entry = &self.strings.entries[index as usize];
            match entry.key {
                None => {
                    // Stop at a true empty; probe through tombstones.
                    if entry.value.is_null() {
                        return None;
                    }
                }
                Some(key) => {
                    if entry.hash == hash && matches(self.as_str(key)) {
                        return Some(key);
                    }
                }
            }

            index = (index.wrapping_mul(5).wrapping_add(1).wrapping_add(perturb)) & mask;
            perturb >>= 5;
        }
    }

    // --- String operations ---

    /// `s[index]` as a one-code-point string. `index` must be in range.
    pub fn index_string(&mut self, s: ObjRef, index: usize) -> Value {
        let cp = self.as_str(s).char_at(index);
        Value::Obj(self.intern_code_points(&[cp]))
    }

    /// `s[start … end]`, inclusive, bounds already validated.
    pub fn slice_string(&mut self, s: ObjRef, start: usize, end: usize) -> ObjRef {
        let points = self.as_str(s).slice_points(start, end);
        self.intern_code_points(&points)
    }

    // --- Structural equality and hashing ---

    /// Structural for immediates, element-wise for sets and tuples, object
    /// identity for everything else (strings are interned, so identity is
    /// byte equality).
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Obj(x), Value::Obj(y)) => {
                let kind = self.kind(x);
                if kind != self.kind(y) {
                    return false;
                }
                match kind {
                    ObjKind::Set => self.sets_equal(x, y),
                    ObjKind::Tuple => self.tuples_equal(x, y),
                    _ => x == y,
                }
            }
            _ => false,
        }
    }

    pub fn hash_value(&self, value: Value) -> u64 {
        match value {
            Value::Bool(true) => TRUE_HASH,
            Value::Bool(false) => FALSE_HASH,
            Value::Null => NULL_HASH,
            Value::Number(n) => hash_number(n),
            Value::Obj(r) => match self.kind(r) {
                ObjKind::String => self.as_str(r).hash,
                ObjKind::Set => self.hash_set(r),
                ObjKind::Tuple => self.hash_tuple(r),
                _ => avalanche(r.index() as u64 + 1),
            },
        }
    }

    // --- Display ---

    /// Render a value for printing. Raw contents, no quoting.
    pub fn value_to_string(&self, value: Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => if b { "true" } else { "false" }.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(r) => self.object_to_string(r),
        }
    }

    fn object_to_string(&self, r: ObjRef) -> String {
        match &self.get(r).payload {
            Payload::Str(s) => s.as_str().to_string(),
            Payload::Function(f) => self.function_name(f.name),
            Payload::Closure(c) => self.function_name(self.as_function(c.function).name),
            Payload::Native(_) => "<native fn>".to_string(),
            Payload::Upvalue(_) => "<upvalue>".to_string(),
            Payload::Iter(_) => "<iterator>".to_string(),
            Payload::Tuple(t) => {
                let parts: Vec<String> = t
                    .elements
                    .iter()
                    .map(|&e| self.value_to_string(e))
                    .collect();
                if parts.len() == 1 {
                    format!("({},)", parts[0])
                } else {
                    format!("({})", parts.join(", "))
                }
            }
            Payload::Set(s) => {
                let parts: Vec<String> = s.iter().map(|(e, _)| self.value_to_string(e)).collect();
                format!("{{{}}}", parts.join(", "))
            }
        }
    }

    fn function_name(&self, name: Option<ObjRef>) -> String {
        match name {
            Some(n) => format!("<func {}>", self.as_str(n).as_str()),
            None => "<script>".to_string(),
        }
    }

    // --- Garbage collection ---

    /// One full mark-and-sweep cycle over the given roots.
    pub fn collect(&mut self, roots: &Roots) {
        let before = self.bytes_allocated;

        for &value in roots.stack {
            self.mark_value(value);
        }
        for &closure in roots.closures {
            self.mark_object(closure);
        }
        let mut upvalue = roots.open_upvalues;
        while let Some(u) = upvalue {
            self.mark_object(u);
            upvalue = self.as_upvalue(u).next_open;
        }
        if let Some(globals) = roots.globals {
            for entry in globals.entries.iter() {
                if let Some(key) = entry.key {
                    self.mark_object(key);
                    self.mark_value(entry.value);
                }
            }
        }
        let temps = self.temp_roots.clone();
        for value in temps {
            self.mark_value(value);
        }

        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }

        self.intern_remove_white();
        self.sweep();

        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
        debug!(
            target: "jmpl::gc",
            collected = before.saturating_sub(self.bytes_allocated),
            before,
            after = self.bytes_allocated,
            next = self.next_gc,
            "gc cycle"
        );
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let obj = self.get_mut(r);
        if obj.marked {
            return;
        }
        obj.marked = true;
        self.gray.push(r);
    }

    /// Mark the children of a gray object.
    fn blacken(&mut self, r: ObjRef) {
        let mut child_objects: Vec<ObjRef> = Vec::new();
        let mut child_values: Vec<Value> = Vec::new();

        match &self.get(r).payload {
            Payload::Closure(c) => {
                child_objects.push(c.function);
                child_objects.extend(c.upvalues.iter().copied());
            }
            Payload::Function(f) => {
                if let Some(name) = f.name {
                    child_objects.push(name);
                }
                child_values.extend(f.chunk.constants.iter().copied());
            }
            Payload::Upvalue(u) => {
                if let UpvalueLoc::Closed(v) = u.location {
                    child_values.push(v);
                }
            }
            Payload::Set(s) => child_values.extend(s.iter().map(|(v, _)| v)),
            Payload::Tuple(t) => child_values.extend(t.elements.iter().copied()),
            Payload::Iter(i) => child_objects.push(i.target),
            Payload::Native(_) | Payload::Str(_) => {}
        }

        for child in child_objects {
            self.mark_object(child);
        }
        for child in child_values {
            self.mark_value(child);
        }
    }

    /// Drop intern entries whose keys did not survive marking.
    fn intern_remove_white(&mut self) {
        for i in 0..self.strings.entries.len() {
            let (key, hash) = {
                let entry = &self.strings.entries[i];
                (entry.key, entry.hash)
            };
            if let Some(k) = key
                && !self.get(k).marked
            {
                self.strings.delete(k, hash);
            }
        }
    }

    /// Walk the object list, freeing unmarked objects and clearing marks on
    /// survivors.
    fn sweep(&mut self) {
        let mut prev: Option<ObjRef> = None;
        let mut cur = self.head;

        while let Some(r) = cur {
            if self.get(r).marked {
                self.get_mut(r).marked = false;
                prev = Some(r);
                cur = self.get(r).next;
            } else {
                let next = self.get(r).next;
                match prev {
                    Some(p) => self.get_mut(p).next = next,
                    None => self.head = next,
                }
                self.free_object(r);
                cur = next;
            }
        }
    }

    fn free_object(&mut self, r: ObjRef) {
        let size = {
            let obj = self.get(r);
            Self::payload_size(&obj.payload) + std::mem::size_of::<Obj>()
        };
        self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
        self.slots[r.0 as usize] = None;
        self.free.push(r.0);
    }

    // --- Misc ---

    /// xorshift step for arbitrary-element selection.
    pub(crate) fn arb_next(&mut self) -> u64 {
        let mut x = self.arb_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.arb_state = x;
        x
    }
}

/// `%g`-style rendering: six significant figures with trailing zeros
/// stripped, switching to exponent form below 1e-4 and at 1e6 and above.
/// Integer-valued doubles therefore print without a fractional part.
fn format_number(n: f64) -> String {
    if !n.is_finite() {
        return if n.is_nan() {
            "nan".to_string()
        } else if n > 0.0 {
            "inf".to_string()
        } else {
            "-inf".to_string()
        };
    }
    if n == 0.0 {
        return if n.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // Round to six significant figures first; the exponent of the rounded
    // value decides between fixed and exponent form (999999.5 becomes 1e+06).
    let sci = format!("{:.5e}", n);
    let Some((mantissa, exponent)) = sci.split_once('e') else {
        return sci;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if (-4..6).contains(&exponent) {
        let precision = (5 - exponent).max(0) as usize;
        let fixed = format!("{:.*}", precision, n);
        if fixed.contains('.') {
            fixed.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            fixed
        }
    } else {
        let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exponent.abs())
    }
}
