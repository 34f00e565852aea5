//! In-memory intermediate representation.
//!
//! A [`Module`] owns functions and read-only global data. Every function
//! keeps its instructions in one flat arena (`Vec<Inst>`) and its blocks as
//! ordered lists of [`InstId`]s into that arena, so the whole module is plain
//! index-addressed data: trivially movable, no interior pointers, no
//! lifetimes. Operands are [`Value`]s referring to function parameters or
//! prior instructions; integer constants and global addresses enter the value
//! graph through their own defining instructions (`IConst`, `GlobalAddr`).
//!
//! The module is built with [`builder::ModuleBuilder`], checked by
//! [`verifier`], printed by the [`print`] module and otherwise consumed
//! read-only by the codegen pipeline.

pub mod builder;
pub mod print;
pub mod verifier;

use std::fmt;

use crate::target::DataLayout;

/// Index of an instruction in its function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstId(pub u32);

/// Index of a block in its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// Index of a function in its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub u32);

/// Index of a global in its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalId(pub u32);

/// First-class types. `Void` appears only as a return type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    I8,
    I16,
    I32,
    I64,
    Ptr,
    Void,
}

impl Type {
    pub fn is_int(self) -> bool {
        matches!(self, Type::I8 | Type::I16 | Type::I32 | Type::I64)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::I8 => write!(f, "i8"),
            Type::I16 => write!(f, "i16"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::Ptr => write!(f, "ptr"),
            Type::Void => write!(f, "void"),
        }
    }
}

/// Symbol visibility outside the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Not visible to the linker; gets a local symbol.
    Internal,
    /// Visible to (and linkable by) other objects.
    External,
}

/// Function type: return, parameters, variadic tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub ret: Type,
    pub params: Vec<Type>,
    pub variadic: bool,
}

impl Signature {
    pub fn new(ret: Type, params: Vec<Type>) -> Self {
        Self {
            ret,
            params,
            variadic: false,
        }
    }

    pub fn variadic(ret: Type, params: Vec<Type>) -> Self {
        Self {
            ret,
            params,
            variadic: true,
        }
    }
}

/// Reference to a value computed earlier in the same function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    /// The n-th function parameter.
    Param(u32),
    /// The result of an instruction.
    Inst(InstId),
}

/// Signed integer comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntPredicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
}

impl fmt::Display for IntPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntPredicate::Eq => write!(f, "eq"),
            IntPredicate::Ne => write!(f, "ne"),
            IntPredicate::Slt => write!(f, "slt"),
            IntPredicate::Sle => write!(f, "sle"),
            IntPredicate::Sgt => write!(f, "sgt"),
            IntPredicate::Sge => write!(f, "sge"),
        }
    }
}

/// Instruction payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    /// Materialize an integer constant.
    IConst { ty: Type, value: i64 },
    /// Materialize the address of a global.
    GlobalAddr { global: GlobalId },
    IAdd { ty: Type, lhs: Value, rhs: Value },
    ISub { ty: Type, lhs: Value, rhs: Value },
    /// Signed comparison producing an `i8` that is 0 or 1.
    ICmp {
        pred: IntPredicate,
        ty: Type,
        lhs: Value,
        rhs: Value,
    },
    Call { callee: FuncId, args: Vec<Value> },
    Ret { value: Option<Value> },
    Br { target: BlockId },
    CondBr {
        cond: Value,
        then_dest: BlockId,
        else_dest: BlockId,
    },
    Unreachable,
}

impl InstKind {
    /// Terminators end a block; nothing may follow them.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Ret { .. }
                | InstKind::Br { .. }
                | InstKind::CondBr { .. }
                | InstKind::Unreachable
        )
    }

    /// All value operands, in evaluation order.
    pub fn operands(&self) -> Vec<Value> {
        match self {
            InstKind::IConst { .. } | InstKind::GlobalAddr { .. } => Vec::new(),
            InstKind::IAdd { lhs, rhs, .. }
            | InstKind::ISub { lhs, rhs, .. }
            | InstKind::ICmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            InstKind::Call { args, .. } => args.clone(),
            InstKind::Ret { value } => value.iter().copied().collect(),
            InstKind::Br { .. } | InstKind::Unreachable => Vec::new(),
            InstKind::CondBr { cond, .. } => vec![*cond],
        }
    }

    /// Blocks this instruction can branch to.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Br { target } => vec![*target],
            InstKind::CondBr {
                then_dest,
                else_dest,
                ..
            } => vec![*then_dest, *else_dest],
            _ => Vec::new(),
        }
    }
}

/// One instruction in a function's arena.
#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub kind: InstKind,
}

/// A basic block: a name for printing and an ordered instruction list.
#[derive(Debug, Clone)]
pub struct Block {
    pub name: String,
    pub insts: Vec<InstId>,
}

/// A function definition or declaration. Declarations have no blocks.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub sig: Signature,
    pub linkage: Linkage,
    pub blocks: Vec<Block>,
    /// Instruction arena; blocks index into this.
    pub insts: Vec<Inst>,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.0 as usize]
    }

    /// Type of a value in this function's context. The module is needed to
    /// look through calls to their callee's return type. Out-of-range
    /// references type as `Void`; the verifier reports them properly.
    pub fn value_type(&self, module: &Module, value: Value) -> Type {
        match value {
            Value::Param(i) => self
                .sig
                .params
                .get(i as usize)
                .copied()
                .unwrap_or(Type::Void),
            Value::Inst(id) => match self.insts.get(id.0 as usize).map(|i| &i.kind) {
                Some(InstKind::IConst { ty, .. }) => *ty,
                Some(InstKind::GlobalAddr { .. }) => Type::Ptr,
                Some(InstKind::IAdd { ty, .. }) | Some(InstKind::ISub { ty, .. }) => *ty,
                Some(InstKind::ICmp { .. }) => Type::I8,
                Some(InstKind::Call { callee, .. }) => module
                    .functions
                    .get(callee.0 as usize)
                    .map(|f| f.sig.ret)
                    .unwrap_or(Type::Void),
                _ => Type::Void,
            },
        }
    }
}

/// Read-only byte data placed in the object's data sections.
#[derive(Debug, Clone)]
pub struct GlobalData {
    pub name: String,
    pub linkage: Linkage,
    pub bytes: Vec<u8>,
    pub align: u32,
}

/// A compilation unit.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    /// Target triple string; set by the driver once the target is resolved.
    pub triple: String,
    data_layout: Option<DataLayout>,
    pub functions: Vec<Function>,
    pub globals: Vec<GlobalData>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triple: String::new(),
            data_layout: None,
            functions: Vec::new(),
            globals: Vec::new(),
        }
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn global(&self, id: GlobalId) -> &GlobalData {
        &self.globals[id.0 as usize]
    }

    pub fn find_function(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    /// Attach the target machine's data layout. Lowering requires this.
    pub fn set_data_layout(&mut self, layout: DataLayout) {
        self.data_layout = Some(layout);
    }

    pub fn data_layout(&self) -> Option<&DataLayout> {
        self.data_layout.as_ref()
    }

    /// Functions with bodies, in module order.
    pub fn defined_functions(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.is_declaration())
            .map(|(i, f)| (FuncId(i as u32), f))
    }
}
