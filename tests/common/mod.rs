use std::collections::HashMap;

use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::passes::PassManager;
use inkwell::values::FunctionValue;
use inkwell::OptimizationLevel;

use kaleido::{runtime, Codegen, Lexer, Parser, Token, ANONYMOUS_FUNCTION_NAME};

fn new_fpm<'ctx>(module: &Module<'ctx>) -> PassManager<FunctionValue<'ctx>> {
    let fpm = PassManager::create(module);
    fpm.add_promote_memory_to_register_pass();
    fpm.add_instruction_combining_pass();
    fpm.add_reassociate_pass();
    fpm.add_gvn_pass();
    fpm.add_cfg_simplification_pass();
    fpm.initialize();
    fpm
}

/// Parse and lower a whole program (with at most one top-level expression)
/// into a single module, JIT it, and return what the expression evaluates
/// to. Forms are lowered as they are parsed, so operator definitions affect
/// the source that follows them.
pub fn evaluate(source: &str) -> f64 {
    let context = Context::create();
    let module = context.create_module("test");
    let builder = context.create_builder();
    let fpm = new_fpm(&module);
    let mut protos = HashMap::new();
    let mut parser = Parser::new(Lexer::new(source.as_bytes()));

    loop {
        match parser.current().clone() {
            Token::Eof => break,
            Token::Char(b';') => parser.advance(),
            Token::Def => {
                let fun = parser.parse_definition().unwrap();
                Codegen::new(&context, &builder, &module, &fpm, &mut protos)
                    .compile_function(&fun, parser.ops_mut())
                    .unwrap();
            }
            Token::Extern => {
                let proto = parser.parse_extern().unwrap();
                Codegen::new(&context, &builder, &module, &fpm, &mut protos).compile_extern(proto);
            }
            _ => {
                let fun = parser.parse_top_level_expr().unwrap();
                Codegen::new(&context, &builder, &module, &fpm, &mut protos)
                    .compile_function(&fun, parser.ops_mut())
                    .unwrap();
            }
        }
    }

    let engine = module
        .create_jit_execution_engine(OptimizationLevel::None)
        .unwrap();
    runtime::bind_shims(&engine, &module);

    let anon = unsafe {
        engine.get_function::<unsafe extern "C" fn() -> f64>(ANONYMOUS_FUNCTION_NAME)
    }
    .unwrap();
    unsafe { anon.call() }
}
