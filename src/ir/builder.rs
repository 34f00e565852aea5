//! Programmatic IR construction.
//!
//! [`ModuleBuilder`] creates globals and functions; [`FunctionBuilder`] is a
//! cursor over one function under construction. Function declarations use
//! get-or-insert semantics: declaring a name twice yields the same handle,
//! and defining a previously declared function fills in the existing slot,
//! so call sites created before the definition stay valid.

use super::{
    Block, BlockId, FuncId, Function, GlobalData, GlobalId, Inst, InstId, InstKind, IntPredicate,
    Linkage, Module, Signature, Type, Value,
};

/// Builds a [`Module`] from scratch.
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            module: Module::new(name),
        }
    }

    /// Add a NUL-terminated string constant with internal linkage.
    pub fn add_global_string(&mut self, name: impl Into<String>, text: &str) -> GlobalId {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.add_global_bytes(name, bytes, 1, Linkage::Internal)
    }

    /// Add raw read-only byte data.
    pub fn add_global_bytes(
        &mut self,
        name: impl Into<String>,
        bytes: Vec<u8>,
        align: u32,
        linkage: Linkage,
    ) -> GlobalId {
        let id = GlobalId(self.module.globals.len() as u32);
        self.module.globals.push(GlobalData {
            name: name.into(),
            linkage,
            bytes,
            align,
        });
        id
    }

    /// Declare an external function, or return the existing handle if the
    /// name is already present. The signature of an existing entry is left
    /// untouched; mismatched call sites are the verifier's to report.
    pub fn declare_function(&mut self, name: &str, sig: Signature) -> FuncId {
        if let Some(id) = self.module.find_function(name) {
            return id;
        }
        let id = FuncId(self.module.functions.len() as u32);
        self.module.functions.push(Function {
            name: name.to_string(),
            sig,
            linkage: Linkage::External,
            blocks: Vec::new(),
            insts: Vec::new(),
        });
        id
    }

    /// Start defining a function body. If `name` was declared earlier the
    /// declaration is upgraded in place, keeping its handle stable. An entry
    /// block is created and the returned builder points at it.
    pub fn define_function(
        &mut self,
        name: &str,
        sig: Signature,
        linkage: Linkage,
    ) -> FunctionBuilder<'_> {
        let id = match self.module.find_function(name) {
            Some(id) if self.module.function(id).is_declaration() => {
                let func = &mut self.module.functions[id.0 as usize];
                func.sig = sig;
                func.linkage = linkage;
                id
            }
            _ => {
                let id = FuncId(self.module.functions.len() as u32);
                self.module.functions.push(Function {
                    name: name.to_string(),
                    sig,
                    linkage,
                    blocks: Vec::new(),
                    insts: Vec::new(),
                });
                id
            }
        };

        let func = &mut self.module.functions[id.0 as usize];
        func.blocks.push(Block {
            name: "entry".to_string(),
            insts: Vec::new(),
        });

        FunctionBuilder {
            module: &mut self.module,
            func: id,
            block: BlockId(0),
        }
    }

    pub fn finish(self) -> Module {
        self.module
    }
}

/// Cursor appending instructions to one function.
pub struct FunctionBuilder<'m> {
    module: &'m mut Module,
    func: FuncId,
    block: BlockId,
}

impl FunctionBuilder<'_> {
    pub fn func_id(&self) -> FuncId {
        self.func
    }

    /// Create a new block; the cursor stays where it is.
    pub fn create_block(&mut self, name: impl Into<String>) -> BlockId {
        let func = self.func_mut();
        let id = BlockId(func.blocks.len() as u32);
        func.blocks.push(Block {
            name: name.into(),
            insts: Vec::new(),
        });
        id
    }

    /// Move the insertion point to `block`.
    pub fn switch_to_block(&mut self, block: BlockId) {
        self.block = block;
    }

    pub fn param(&self, index: u32) -> Value {
        Value::Param(index)
    }

    pub fn iconst(&mut self, ty: Type, value: i64) -> Value {
        self.push(InstKind::IConst { ty, value })
    }

    pub fn global_addr(&mut self, global: GlobalId) -> Value {
        self.push(InstKind::GlobalAddr { global })
    }

    pub fn iadd(&mut self, ty: Type, lhs: Value, rhs: Value) -> Value {
        self.push(InstKind::IAdd { ty, lhs, rhs })
    }

    pub fn isub(&mut self, ty: Type, lhs: Value, rhs: Value) -> Value {
        self.push(InstKind::ISub { ty, lhs, rhs })
    }

    pub fn icmp(&mut self, pred: IntPredicate, ty: Type, lhs: Value, rhs: Value) -> Value {
        self.push(InstKind::ICmp { pred, ty, lhs, rhs })
    }

    /// Call a previously declared or defined function. The result value is
    /// only meaningful for non-void callees.
    pub fn call(&mut self, callee: FuncId, args: &[Value]) -> Value {
        self.push(InstKind::Call {
            callee,
            args: args.to_vec(),
        })
    }

    pub fn ret(&mut self, value: Option<Value>) {
        self.push(InstKind::Ret { value });
    }

    pub fn br(&mut self, target: BlockId) {
        self.push(InstKind::Br { target });
    }

    pub fn cond_br(&mut self, cond: Value, then_dest: BlockId, else_dest: BlockId) {
        self.push(InstKind::CondBr {
            cond,
            then_dest,
            else_dest,
        });
    }

    pub fn unreachable(&mut self) {
        self.push(InstKind::Unreachable);
    }

    fn push(&mut self, kind: InstKind) -> Value {
        let block = self.block;
        let func = self.func_mut();
        let id = InstId(func.insts.len() as u32);
        func.insts.push(Inst { kind });
        func.blocks[block.0 as usize].insts.push(id);
        Value::Inst(id)
    }

    fn func_mut(&mut self) -> &mut Function {
        &mut self.module.functions[self.func.0 as usize]
    }
}
