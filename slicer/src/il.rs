//! The program representation analyzed and cloned by the slicer.
//!
//! A [`Program`] is a set of [`Function`]s (each either a declaration, or a body of basic blocks
//! over [`Instruction`]s) together with a list of [`Global`]s. Instruction identities
//! ([`InstId`]) name their enclosing function, so that any instruction handed around between the
//! analyses can always be traced back to the function it lives in, including functions that are
//! not (or not yet) part of the program, such as clones.

use crate::containers::unordered::UnorderedMap;
use crate::log::*;

/// Identity of a function. Unique across a program and every clone made from it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub usize);

impl std::fmt::Debug for FunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// Identity of an instruction: its enclosing function, and its index into that function's
/// [`Function::instructions`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId {
    pub function: FunctionId,
    pub index: usize,
}

impl std::fmt::Debug for InstId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "%{}.{}", self.function.0, self.index)
    }
}

/// Identity of a global variable; an index into [`Program::globals`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct GlobalId(pub usize);

/// A (very) coarse type, sufficient to tell function signatures apart.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Type {
    Void,
    Integer { bits: u16 },
    Float { bits: u16 },
    Pointer,
    Aggregate { size: usize },
}

/// The type of a function. Two functions with equal signatures are interchangeable targets for
/// an indirect call through a pointer of that signature.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Signature {
    pub params: Vec<Type>,
    pub ret: Type,
    pub variadic: bool,
}

impl Signature {
    /// A non-variadic signature
    pub fn new(params: impl IntoIterator<Item = Type>, ret: Type) -> Self {
        Self {
            params: params.into_iter().collect(),
            ret,
            variadic: false,
        }
    }

    /// Whether functions of this signature produce no return value
    pub fn returns_void(&self) -> bool {
        self.ret == Type::Void
    }
}

/// An operand of an instruction.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    /// The result of an instruction
    Inst(InstId),
    /// The `index`th formal parameter of `function`
    Argument { function: FunctionId, index: usize },
    /// The address of a function
    Function(FunctionId),
    /// The address of a global
    Global(GlobalId),
    /// Constant or "immediate" value
    Constant { value: u64, size: usize },
    /// Placeholder left behind when the referenced entity is removed from the program
    Undef,
}

impl Value {
    /// The instruction this value is the result of, if any
    pub fn as_inst(&self) -> Option<InstId> {
        match self {
            Value::Inst(i) => Some(*i),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Value::Inst(i) => write!(f, "{:?}", i),
            Value::Argument { function, index } => write!(f, "%{}.arg{}", function.0, index),
            Value::Function(fid) => write!(f, "{:?}", fid),
            Value::Global(g) => write!(f, "global#{}", g.0),
            Value::Constant { value, size } => {
                if f.alternate() {
                    write!(f, "${:#x}u{}", value, size)
                } else {
                    write!(f, "${:}u{}", value, size)
                }
            }
            Value::Undef => write!(f, "undef"),
        }
    }
}

/// Target of a call instruction.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Callee {
    /// A statically named callee
    Direct(FunctionId),
    /// A call through a function pointer of the given signature
    Indirect { pointer: Value, signature: Signature },
}

/// The operation performed by an [`Instruction`], along with its operands.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum InstKind {
    /// Allocate a `size`-byte stack object, living until the enclosing function returns
    Alloca { size: usize },
    /// Load from `address`
    Load { address: Value },
    /// Store `value` into `address`
    Store { address: Value, value: Value },
    /// Call `callee` with `args`
    Call { callee: Callee, args: Vec<Value> },
    /// Branch to one of the `targets` blocks; unconditional if there is no `condition`
    Branch {
        condition: Option<Value>,
        targets: Vec<usize>,
    },
    /// Return from the function
    Return { value: Option<Value> },
    /// Anything else; only its operands matter to the analyses
    Other {
        opcode: String,
        operands: Vec<Value>,
    },
}

/// Classification of instructions as far as the analyses are concerned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Opcode {
    Call,
    Load,
    Store,
    Return,
    Other,
}

impl InstKind {
    /// Classify the instruction
    pub fn opcode(&self) -> Opcode {
        match self {
            InstKind::Call { .. } => Opcode::Call,
            InstKind::Load { .. } => Opcode::Load,
            InstKind::Store { .. } => Opcode::Store,
            InstKind::Return { .. } => Opcode::Return,
            InstKind::Alloca { .. } | InstKind::Branch { .. } | InstKind::Other { .. } => {
                Opcode::Other
            }
        }
    }

    /// All value operands, in order. For calls, an indirect callee pointer comes before the
    /// arguments.
    pub fn operands(&self) -> Vec<&Value> {
        match self {
            InstKind::Alloca { .. } => vec![],
            InstKind::Load { address } => vec![address],
            InstKind::Store { address, value } => vec![address, value],
            InstKind::Call { callee, args } => match callee {
                Callee::Direct(_) => args.iter().collect(),
                Callee::Indirect { pointer, .. } => {
                    std::iter::once(pointer).chain(args.iter()).collect()
                }
            },
            InstKind::Branch { condition, .. } => condition.iter().collect(),
            InstKind::Return { value } => value.iter().collect(),
            InstKind::Other { operands, .. } => operands.iter().collect(),
        }
    }

    fn operands_mut(&mut self) -> Vec<&mut Value> {
        match self {
            InstKind::Alloca { .. } => vec![],
            InstKind::Load { address } => vec![address],
            InstKind::Store { address, value } => vec![address, value],
            InstKind::Call { callee, args } => match callee {
                Callee::Direct(_) => args.iter_mut().collect(),
                Callee::Indirect { pointer, .. } => {
                    std::iter::once(pointer).chain(args.iter_mut()).collect()
                }
            },
            InstKind::Branch { condition, .. } => condition.iter_mut().collect(),
            InstKind::Return { value } => value.iter_mut().collect(),
            InstKind::Other { operands, .. } => operands.iter_mut().collect(),
        }
    }

    /// The address operand of a memory access
    pub fn pointer_operand(&self) -> Option<&Value> {
        match self {
            InstKind::Load { address } | InstKind::Store { address, .. } => Some(address),
            _ => None,
        }
    }
}

/// An instruction, along with its own identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Instruction {
    pub id: InstId,
    pub kind: InstKind,
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?} = ", self.id)?;
        match &self.kind {
            InstKind::Alloca { size } => write!(f, "alloca {}", size),
            InstKind::Load { address } => write!(f, "load {:?}", address),
            InstKind::Store { address, value } => write!(f, "store {:?} -> {:?}", value, address),
            InstKind::Call { callee, args } => {
                match callee {
                    Callee::Direct(fid) => write!(f, "call {:?}", fid)?,
                    Callee::Indirect { pointer, .. } => write!(f, "call *{:?}", pointer)?,
                }
                write!(f, "{:?}", args)
            }
            InstKind::Branch { condition, targets } => match condition {
                Some(c) => write!(f, "br {:?} {:?}", c, targets),
                None => write!(f, "br {:?}", targets),
            },
            InstKind::Return { value } => match value {
                Some(v) => write!(f, "ret {:?}", v),
                None => write!(f, "ret"),
            },
            InstKind::Other { opcode, operands } => write!(f, "{} {:?}", opcode, operands),
        }
    }
}

impl Instruction {
    /// Classify the instruction
    pub fn opcode(&self) -> Opcode {
        self.kind.opcode()
    }

    /// Confirms the validity of the instruction within `func`. Panics if invalid.
    fn confirm_valid(&self, func: &Function, program: &Program) {
        if let Err(e) = self.try_confirm_valid(func, program) {
            panic!("Invalid instruction in function {}: {}", func.name, e);
        }
    }

    /// Confirms the validity of the instruction within `func`. Any referenced instruction or
    /// argument must belong to `func`, and any referenced function or global must exist.
    pub fn try_confirm_valid(&self, func: &Function, program: &Program) -> Result<(), String> {
        if self.id.function != func.id {
            return Err(format!(
                "Instruction {:?} claims to be in {:?}, but found in {:?}",
                self.id, self.id.function, func.id
            ));
        }
        for v in self.kind.operands() {
            match v {
                Value::Inst(i) => {
                    if i.function != func.id || i.index >= func.instructions.len() {
                        return Err(format!(
                            "Operand {:?} of {:?} does not refer to an instruction of the \
                             enclosing function",
                            v, self
                        ));
                    }
                }
                Value::Argument { function, index } => {
                    if *function != func.id || *index >= func.signature.params.len() {
                        return Err(format!(
                            "Operand {:?} of {:?} does not refer to a parameter of the \
                             enclosing function",
                            v, self
                        ));
                    }
                }
                Value::Function(fid) => {
                    if *fid != func.id && program.function(*fid).is_none() {
                        return Err(format!("Unknown function {:?} used by {:?}", fid, self));
                    }
                }
                Value::Global(g) => {
                    if g.0 >= program.globals.len() {
                        return Err(format!("Unknown global {:?} used by {:?}", g, self));
                    }
                }
                Value::Constant { .. } | Value::Undef => {}
            }
        }
        match &self.kind {
            InstKind::Call {
                callee: Callee::Direct(fid),
                ..
            } => {
                if *fid != func.id && program.function(*fid).is_none() {
                    return Err(format!("Call to unknown function {:?}", fid));
                }
            }
            InstKind::Branch { condition, targets } => {
                if targets.is_empty() || (condition.is_some() && targets.len() < 2) {
                    return Err(format!("Malformed branch {:?}", self));
                }
                if let Some(t) = targets.iter().find(|&&t| t >= func.blocks.len()) {
                    return Err(format!("Branch to non-existent block {} in {:?}", t, self));
                }
            }
            InstKind::Return { value } => {
                if value.is_some() == func.signature.returns_void() {
                    return Err(format!(
                        "Return {:?} does not match signature {:?}",
                        self, func.signature
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// A function: either a declaration (no body) or a list of basic blocks over its instructions.
#[derive(Clone)]
pub struct Function {
    pub id: FunctionId,
    pub name: String,
    pub signature: Signature,
    /// Each basic block is a list of indexes into `instructions`. Every instruction belongs to
    /// exactly one block.
    pub blocks: Vec<Vec<usize>>,
    pub instructions: Vec<Instruction>,
}

impl Function {
    /// A body-less function, defined outside the program
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Whether the function produces no return value
    pub fn returns_void(&self) -> bool {
        self.signature.returns_void()
    }

    /// Iterate over all instructions of the function, block by block
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.blocks
            .iter()
            .flat_map(move |bb| bb.iter().map(move |&i| &self.instructions[i]))
    }

    /// Get the instruction `id`, if it lives in this function
    pub fn instruction(&self, id: InstId) -> Option<&Instruction> {
        if id.function != self.id {
            return None;
        }
        self.instructions.get(id.index)
    }

    /// Produce a structurally identical copy of this function, with identity `new_id` and name
    /// `new_name`. Operands referring to this function's own instructions or parameters are
    /// rewired to the copy's; every other operand is shared.
    ///
    /// Also returns the correspondence `(original, copy)` of every copied instruction.
    pub fn clone_structurally(
        &self,
        new_id: FunctionId,
        new_name: impl Into<String>,
    ) -> (Function, Vec<(InstId, InstId)>) {
        let old_id = self.id;
        let rewire = |v: &mut Value| match v {
            Value::Inst(i) if i.function == old_id => i.function = new_id,
            Value::Argument { function, .. } if *function == old_id => *function = new_id,
            _ => {}
        };

        let mut correspondence = Vec::with_capacity(self.instructions.len());
        let instructions = self
            .instructions
            .iter()
            .map(|ins| {
                let id = InstId {
                    function: new_id,
                    index: ins.id.index,
                };
                correspondence.push((ins.id, id));
                let mut kind = ins.kind.clone();
                kind.operands_mut().into_iter().for_each(|v| rewire(v));
                Instruction { id, kind }
            })
            .collect();

        (
            Function {
                id: new_id,
                name: new_name.into(),
                signature: self.signature.clone(),
                blocks: self.blocks.clone(),
                instructions,
            },
            correspondence,
        )
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_declaration() {
            return writeln!(f, "declare {} {:?} {:?}", self.name, self.id, self.signature);
        }
        writeln!(f, "define {} {:?} {:?} {{", self.name, self.id, self.signature)?;
        for (i, bb) in self.blocks.iter().enumerate() {
            writeln!(f, "  bb{}:", i)?;
            for &ins in bb {
                writeln!(f, "    {:?}", self.instructions[ins])?;
            }
        }
        writeln!(f, "}}")
    }
}

/// A global variable. Its initializer may refer to functions (e.g., a table of function
/// pointers), which counts as a use of those functions.
#[derive(Clone, Debug)]
pub struct Global {
    pub name: String,
    pub initializer: Vec<Value>,
}

/// A place where a function is used.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Use {
    /// The statically named callee of the call `inst`
    DirectCallee { inst: InstId },
    /// Passed as the `position`th argument of the call `inst`
    CallArgument { inst: InstId, position: usize },
    /// Any other operand of `inst`
    Operand { inst: InstId },
    /// Inside the initializer of `global`
    GlobalInitializer { global: GlobalId },
}

/// The actual program
pub struct Program {
    functions: UnorderedMap<FunctionId, Function>,
    names: UnorderedMap<String, FunctionId>,
    /// Global variables, indexed by [`GlobalId`]
    pub globals: Vec<Global>,
    next_function_id: usize,
    /// The function currently being built, along with the block new instructions are added to
    building: Option<(Function, usize)>,
}

impl Program {
    /// Build a new empty program
    pub fn new() -> Self {
        Self {
            functions: Default::default(),
            names: Default::default(),
            globals: vec![],
            next_function_id: 0,
            building: None,
        }
    }

    /// Add a global named `name`
    pub fn add_global(
        &mut self,
        name: impl Into<String>,
        initializer: impl IntoIterator<Item = Value>,
    ) -> GlobalId {
        let id = GlobalId(self.globals.len());
        self.globals.push(Global {
            name: name.into(),
            initializer: initializer.into_iter().collect(),
        });
        id
    }

    /// Declare a (body-less) function. A body can later be given to it with
    /// [`Self::define_function`].
    pub fn declare_function(&mut self, name: impl Into<String>, signature: Signature) -> FunctionId {
        let name = name.into();
        assert!(
            !self.names.contains_key(&name),
            "Function {} declared more than once",
            name
        );
        let id = FunctionId(self.next_function_id);
        self.next_function_id += 1;
        self.names.insert(name.clone(), id);
        self.functions.insert(
            id,
            Function {
                id,
                name,
                signature,
                blocks: vec![],
                instructions: vec![],
            },
        );
        id
    }

    /// Declare a function and start adding instructions to its body. Must be followed by
    /// [`Self::end_function`].
    pub fn begin_function(&mut self, name: impl Into<String>, signature: Signature) -> FunctionId {
        let id = self.declare_function(name, signature);
        self.define_function(id);
        id
    }

    /// Start adding instructions to the body of the previously declared function `id`. Must be
    /// followed by [`Self::end_function`].
    pub fn define_function(&mut self, id: FunctionId) {
        assert!(
            self.building.is_none(),
            "Should have called `end_function` before defining another function"
        );
        let mut func = self
            .functions
            .remove(&id)
            .unwrap_or_else(|| panic!("Defining unknown function {:?}", id));
        assert!(func.is_declaration(), "Function {} defined twice", func.name);
        func.blocks.push(vec![]);
        self.building = Some((func, 0));
    }

    /// Add a new basic block to the function being built, and direct subsequent instructions to
    /// it. Returns the index of the block.
    pub fn add_block(&mut self) -> usize {
        let (func, cur) = self.building.as_mut().expect("No function being built");
        func.blocks.push(vec![]);
        *cur = func.blocks.len() - 1;
        *cur
    }

    /// Direct subsequent instructions to the (already added) block `bb`
    pub fn switch_to_block(&mut self, bb: usize) {
        let (func, cur) = self.building.as_mut().expect("No function being built");
        assert!(bb < func.blocks.len());
        *cur = bb;
    }

    /// The value of the `index`th parameter of the function being built
    pub fn argument(&self, index: usize) -> Value {
        let (func, _) = self.building.as_ref().expect("No function being built");
        Value::Argument {
            function: func.id,
            index,
        }
    }

    /// Append an instruction to the current block of the function being built, returning the
    /// value it produces.
    pub fn push(&mut self, kind: InstKind) -> Value {
        let (func, cur) = self.building.as_mut().expect("No function being built");
        let id = InstId {
            function: func.id,
            index: func.instructions.len(),
        };
        func.instructions.push(Instruction { id, kind });
        func.blocks[*cur].push(id.index);
        Value::Inst(id)
    }

    /// Finish the function being built. Confirms validity of all of its instructions, panicking if
    /// any is malformed.
    pub fn end_function(&mut self) -> FunctionId {
        let (func, _) = self.building.take().expect("No function being built");
        for ins in &func.instructions {
            ins.confirm_valid(&func, self);
        }
        let id = func.id;
        self.functions.insert(id, func);
        id
    }

    /// Get function `id`, if it exists in the program
    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(&id)
    }

    /// Look up a function by name
    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.names.get(name).cloned()
    }

    /// Iterate over all functions in the program
    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.values()
    }

    /// Number of functions in the program
    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    /// Get instruction `id`, if its function exists in the program
    pub fn instruction(&self, id: InstId) -> Option<&Instruction> {
        self.function(id.function)?.instruction(id)
    }

    /// An upper bound on all function ids handed out so far. Any id at or above this bound is
    /// free to be used for functions created outside of the program.
    pub fn fresh_function_id_bound(&self) -> usize {
        self.next_function_id
    }

    /// Find all uses of function `f` across the program
    pub fn uses_of(&self, f: FunctionId) -> Vec<Use> {
        let mut uses = vec![];
        for func in self.functions() {
            for ins in func.instructions() {
                if let InstKind::Call { callee, args } = &ins.kind {
                    if *callee == Callee::Direct(f) {
                        uses.push(Use::DirectCallee { inst: ins.id });
                    }
                    if let Callee::Indirect { pointer, .. } = callee {
                        if *pointer == Value::Function(f) {
                            uses.push(Use::Operand { inst: ins.id });
                        }
                    }
                    for (position, a) in args.iter().enumerate() {
                        if *a == Value::Function(f) {
                            uses.push(Use::CallArgument {
                                inst: ins.id,
                                position,
                            });
                        }
                    }
                } else {
                    for _ in ins
                        .kind
                        .operands()
                        .into_iter()
                        .filter(|&v| *v == Value::Function(f))
                    {
                        uses.push(Use::Operand { inst: ins.id });
                    }
                }
            }
        }
        for (i, g) in self.globals.iter().enumerate() {
            if g.initializer.contains(&Value::Function(f)) {
                uses.push(Use::GlobalInitializer {
                    global: GlobalId(i),
                });
            }
        }
        uses
    }

    /// Replace every use of function `f` with [`Value::Undef`]. Direct calls to `f` become
    /// indirect calls through an undefined pointer of `f`'s signature.
    pub fn replace_all_uses_with_undef(&mut self, f: FunctionId) {
        let signature = match self.function(f) {
            Some(func) => func.signature.clone(),
            None => return,
        };
        for func in self.functions.values_mut() {
            for ins in func.instructions.iter_mut() {
                if let InstKind::Call { callee, .. } = &mut ins.kind {
                    if *callee == Callee::Direct(f) {
                        *callee = Callee::Indirect {
                            pointer: Value::Undef,
                            signature: signature.clone(),
                        };
                    }
                }
                for v in ins.kind.operands_mut() {
                    if *v == Value::Function(f) {
                        *v = Value::Undef;
                    }
                }
            }
        }
        for g in self.globals.iter_mut() {
            for v in g.initializer.iter_mut() {
                if *v == Value::Function(f) {
                    *v = Value::Undef;
                }
            }
        }
    }

    /// Remove function `f` from the program, returning it. Uses of `f` are left dangling; see
    /// [`Self::replace_all_uses_with_undef`].
    pub fn erase_function(&mut self, f: FunctionId) -> Option<Function> {
        let func = self.functions.remove(&f)?;
        self.names.remove(&func.name);
        trace!("Erased function"; "name" => &func.name, "id" => ?f);
        Some(func)
    }

    /// Insert a function created outside the program (say, a clone being materialized).
    pub fn insert_function(&mut self, func: Function) -> Result<(), String> {
        if self.functions.contains_key(&func.id) {
            return Err(format!("Function id {:?} already in use", func.id));
        }
        if self.names.contains_key(&func.name) {
            return Err(format!("Function name {} already in use", func.name));
        }
        for ins in &func.instructions {
            ins.try_confirm_valid(&func, self)?;
        }
        self.next_function_id = self.next_function_id.max(func.id.0 + 1);
        self.names.insert(func.name.clone(), func.id);
        self.functions.insert(func.id, func);
        Ok(())
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (i, g) in self.globals.iter().enumerate() {
            writeln!(f, "global#{} {} = {:?}", i, g.name, g.initializer)?;
        }
        for func in self.functions() {
            write!(f, "{:?}", func)?;
        }
        Ok(())
    }
}
