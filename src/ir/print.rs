//! Textual rendering of modules.
//!
//! Debug output only, never parsed back. Instruction results are numbered by
//! arena index (`%0`, `%1`, ...), parameters print as `%arg0`, `%arg1`, ...
//! and blocks are referenced by name.

use std::fmt;

use super::{Function, GlobalData, InstKind, Module, Type, Value};

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name)?;
        if !self.triple.is_empty() {
            writeln!(f, "target triple = \"{}\"", self.triple)?;
        }
        if let Some(layout) = self.data_layout() {
            writeln!(f, "target datalayout = \"{}\"", layout.descriptor)?;
        }

        for global in &self.globals {
            writeln!(f)?;
            write_global(f, global)?;
        }

        for func in &self.functions {
            writeln!(f)?;
            write_function(f, self, func)?;
        }
        Ok(())
    }
}

fn write_global(f: &mut fmt::Formatter<'_>, global: &GlobalData) -> fmt::Result {
    let linkage = match global.linkage {
        super::Linkage::Internal => "internal ",
        super::Linkage::External => "",
    };
    write!(
        f,
        "@{} = {}constant [{} x i8] c\"",
        global.name,
        linkage,
        global.bytes.len()
    )?;
    for &b in &global.bytes {
        if (0x20..0x7f).contains(&b) && b != b'"' && b != b'\\' {
            write!(f, "{}", b as char)?;
        } else {
            write!(f, "\\{b:02X}")?;
        }
    }
    writeln!(f, "\", align {}", global.align)
}

fn write_function(f: &mut fmt::Formatter<'_>, module: &Module, func: &Function) -> fmt::Result {
    let keyword = if func.is_declaration() {
        "declare"
    } else {
        "define"
    };
    let linkage = match func.linkage {
        super::Linkage::Internal => "internal ",
        super::Linkage::External => "",
    };
    write!(f, "{keyword} {linkage}{} @{}(", func.sig.ret, func.name)?;
    for (i, param) in func.sig.params.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{param}")?;
        if !func.is_declaration() {
            write!(f, " %arg{i}")?;
        }
    }
    if func.sig.variadic {
        if !func.sig.params.is_empty() {
            write!(f, ", ")?;
        }
        write!(f, "...")?;
    }
    write!(f, ")")?;

    if func.is_declaration() {
        return writeln!(f);
    }

    writeln!(f, " {{")?;
    for block in &func.blocks {
        writeln!(f, "{}:", block.name)?;
        for &id in &block.insts {
            write!(f, "  ")?;
            write_inst(f, module, func, id.0 as usize)?;
        }
    }
    writeln!(f, "}}")
}

fn write_inst(
    f: &mut fmt::Formatter<'_>,
    module: &Module,
    func: &Function,
    index: usize,
) -> fmt::Result {
    let typed = |v: Value| TypedValue {
        module,
        func,
        value: v,
    };

    match &func.insts[index].kind {
        InstKind::IConst { ty, value } => writeln!(f, "%{index} = iconst {ty} {value}"),
        InstKind::GlobalAddr { global } => {
            let name = module
                .globals
                .get(global.0 as usize)
                .map(|g| g.name.as_str())
                .unwrap_or("<bad global>");
            writeln!(f, "%{index} = globaladdr @{name}")
        }
        InstKind::IAdd { ty, lhs, rhs } => {
            writeln!(f, "%{index} = iadd {ty} {}, {}", V(*lhs), V(*rhs))
        }
        InstKind::ISub { ty, lhs, rhs } => {
            writeln!(f, "%{index} = isub {ty} {}, {}", V(*lhs), V(*rhs))
        }
        InstKind::ICmp { pred, ty, lhs, rhs } => {
            writeln!(f, "%{index} = icmp {pred} {ty} {}, {}", V(*lhs), V(*rhs))
        }
        InstKind::Call { callee, args } => {
            let callee_fn = module.functions.get(callee.0 as usize);
            let ret = callee_fn.map(|c| c.sig.ret).unwrap_or(Type::Void);
            let name = callee_fn.map(|c| c.name.as_str()).unwrap_or("<bad callee>");
            if ret == Type::Void {
                write!(f, "call void @{name}(")?;
            } else {
                write!(f, "%{index} = call {ret} @{name}(")?;
            }
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", typed(*arg))?;
            }
            writeln!(f, ")")
        }
        InstKind::Ret { value } => match value {
            Some(v) => writeln!(f, "ret {}", typed(*v)),
            None => writeln!(f, "ret void"),
        },
        InstKind::Br { target } => {
            writeln!(f, "br label %{}", block_name(func, target.0))
        }
        InstKind::CondBr {
            cond,
            then_dest,
            else_dest,
        } => writeln!(
            f,
            "condbr {}, label %{}, label %{}",
            typed(*cond),
            block_name(func, then_dest.0),
            block_name(func, else_dest.0)
        ),
        InstKind::Unreachable => writeln!(f, "unreachable"),
    }
}

fn block_name(func: &Function, id: u32) -> &str {
    func.blocks
        .get(id as usize)
        .map(|b| b.name.as_str())
        .unwrap_or("<bad block>")
}

/// Bare value reference, e.g. `%3` or `%arg0`.
struct V(Value);

impl fmt::Display for V {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::Param(i) => write!(f, "%arg{i}"),
            Value::Inst(id) => write!(f, "%{}", id.0),
        }
    }
}

/// Value reference with its type, e.g. `ptr %0`.
struct TypedValue<'a> {
    module: &'a Module,
    func: &'a Function,
    value: Value,
}

impl fmt::Display for TypedValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ty = self.func.value_type(self.module, self.value);
        write!(f, "{ty} {}", V(self.value))
    }
}
