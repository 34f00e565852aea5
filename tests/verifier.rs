//! Module verification at the library boundary.

use ingot::ir::builder::ModuleBuilder;
use ingot::ir::verifier::verify;
use ingot::ir::{
    Block, Function, Inst, InstId, InstKind, IntPredicate, Linkage, Module, Signature, Type, Value,
};

fn hello_module() -> Module {
    let mut mb = ModuleBuilder::new("hello");
    let text = mb.add_global_string("hello_str", "Hello World!\n");
    let puts = mb.declare_function("puts", Signature::new(Type::I32, vec![Type::Ptr]));
    let mut fb = mb.define_function("main", Signature::new(Type::I64, vec![]), Linkage::External);
    let addr = fb.global_addr(text);
    fb.call(puts, &[addr]);
    let zero = fb.iconst(Type::I64, 0);
    fb.ret(Some(zero));
    mb.finish()
}

#[test]
fn well_formed_module_verifies() {
    let mut module = hello_module();
    assert!(verify(&mut module).is_ok());
}

#[test]
fn dangling_operand_reference_names_the_instruction() {
    let mut module = Module::new("m");
    module.functions.push(Function {
        name: "f".to_string(),
        sig: Signature::new(Type::I64, vec![]),
        linkage: Linkage::External,
        blocks: vec![Block {
            name: "entry".to_string(),
            insts: vec![InstId(0)],
        }],
        insts: vec![Inst {
            kind: InstKind::Ret {
                value: Some(Value::Inst(InstId(7))),
            },
        }],
    });

    let err = verify(&mut module).unwrap_err();
    let rendered: Vec<String> = err.violations.iter().map(|v| v.to_string()).collect();
    assert!(
        rendered
            .iter()
            .any(|m| m.contains("in @f") && m.contains("operand %7 is not defined in any block")),
        "got: {rendered:?}"
    );
}

#[test]
fn unterminated_block_is_reported() {
    let mut mb = ModuleBuilder::new("m");
    let mut fb = mb.define_function("f", Signature::new(Type::I64, vec![]), Linkage::External);
    fb.iconst(Type::I64, 1);
    let mut module = mb.finish();

    let err = verify(&mut module).unwrap_err();
    assert!(err
        .violations
        .iter()
        .any(|v| v.message.contains("does not end in a terminator")));
}

#[test]
fn call_arity_and_argument_types_are_checked() {
    let mut mb = ModuleBuilder::new("m");
    let puts = mb.declare_function("puts", Signature::new(Type::I32, vec![Type::Ptr]));
    let mut fb = mb.define_function("f", Signature::new(Type::Void, vec![]), Linkage::External);
    fb.call(puts, &[]);
    let n = fb.iconst(Type::I64, 5);
    fb.call(puts, &[n]);
    fb.ret(None);
    let mut module = mb.finish();

    let err = verify(&mut module).unwrap_err();
    assert!(err
        .violations
        .iter()
        .any(|v| v.message.contains("call to @puts expects 1 argument(s), got 0")));
    assert!(err
        .violations
        .iter()
        .any(|v| v.message.contains("argument 0 of call to @puts: expected ptr, got i64")));
}

#[test]
fn variadic_callees_accept_extra_arguments() {
    let mut mb = ModuleBuilder::new("m");
    let printf = mb.declare_function("printf", Signature::variadic(Type::I32, vec![Type::Ptr]));
    let fmt = mb.add_global_string("fmt", "%d %d\n");
    let mut fb = mb.define_function("f", Signature::new(Type::Void, vec![]), Linkage::External);
    let s = fb.global_addr(fmt);
    let a = fb.iconst(Type::I64, 1);
    let b = fb.iconst(Type::I64, 2);
    fb.call(printf, &[s, a, b]);
    fb.ret(None);
    let mut module = mb.finish();

    assert!(verify(&mut module).is_ok());
}

#[test]
fn duplicate_symbol_across_function_and_global() {
    let mut mb = ModuleBuilder::new("m");
    mb.add_global_string("puts", "not a function");
    mb.declare_function("puts", Signature::new(Type::I32, vec![Type::Ptr]));
    let mut module = mb.finish();

    let err = verify(&mut module).unwrap_err();
    assert!(err
        .violations
        .iter()
        .any(|v| v.message.contains("duplicate symbol '@puts'")));
}

#[test]
fn all_violations_are_collected_in_one_pass() {
    let mut mb = ModuleBuilder::new("m");
    let mut fb = mb.define_function("f", Signature::new(Type::I64, vec![Type::I64]), Linkage::External);
    // Condition is i64, not the i8 a cond_br needs.
    let cond = fb.param(0);
    let then_b = fb.create_block("then");
    let else_b = fb.create_block("else");
    fb.cond_br(cond, then_b, else_b);
    fb.switch_to_block(then_b);
    fb.iconst(Type::I64, 1); // unterminated
    fb.switch_to_block(else_b);
    fb.ret(None); // missing value for i64 return
    let mut module = mb.finish();

    let err = verify(&mut module).unwrap_err();
    assert!(err.violations.len() >= 3, "got: {:?}", err.violations);
    assert!(err
        .violations
        .iter()
        .any(|v| v.message.contains("expected i8, got i64")));
    assert!(err
        .violations
        .iter()
        .any(|v| v.message.contains("does not end in a terminator")));
    assert!(err
        .violations
        .iter()
        .any(|v| v.message.contains("missing return value for i64 function")));
}

#[test]
fn conditional_flow_with_a_back_edge_verifies() {
    // Count down from the parameter to zero, then return the parameter.
    let mut mb = ModuleBuilder::new("m");
    let mut fb = mb.define_function(
        "spin",
        Signature::new(Type::I64, vec![Type::I64]),
        Linkage::External,
    );
    let header = fb.create_block("header");
    let body = fb.create_block("body");
    let exit = fb.create_block("exit");

    let zero = fb.iconst(Type::I64, 0);
    fb.br(header);

    fb.switch_to_block(header);
    let done = fb.icmp(IntPredicate::Sle, Type::I64, fb.param(0), zero);
    fb.cond_br(done, exit, body);

    fb.switch_to_block(body);
    fb.br(header);

    fb.switch_to_block(exit);
    fb.ret(Some(fb.param(0)));

    let mut module = mb.finish();
    assert!(verify(&mut module).is_ok());
}
