//! Code generation
//!
//! This module lowers the AST into LLVM IR. Every expression produces
//! exactly one `f64` SSA value. Mutable variables (parameters, `var`
//! bindings, loop induction variables) live in stack slots allocated in the
//! function's entry block; the promote-memory-to-register pass turns them
//! back into registers and φ-nodes afterwards, which is why all `alloca`s
//! must sit in the entry block.
//!
//! The lowerer owns the scope table for the function being compiled and
//! borrows the process-wide prototype registry, which lets a module
//! materialize declarations for functions that were compiled into earlier
//! modules of the same JIT session.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use inkwell::basic_block::BasicBlock;
use inkwell::builder::{Builder, BuilderError};
use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::passes::PassManager;
use inkwell::types::BasicMetadataTypeEnum;
use inkwell::values::{
    AnyValue, BasicMetadataValueEnum, FloatValue, FunctionValue, PointerValue,
};
use inkwell::FloatPredicate;

use crate::ast::{self, Expr, Prototype};
use crate::parser::PrecedenceTable;

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("The LLVM builder failed")]
    Builder(#[from] BuilderError),

    #[error("Unknown variable name")]
    UnknownVariable(String),

    #[error("Unknown function referenced")]
    UnknownFunction(String),

    #[error("Unknown unary operator")]
    UnknownUnaryOperator(char),

    #[error("Incorrect # arguments passed")]
    IncorrectArgumentCount { expected: u32, found: usize },

    #[error("destination of '=' must be a variable")]
    InvalidAssignmentTarget,
}

type Result<T> = std::result::Result<T, CodegenError>;

pub struct Codegen<'a, 'ctx> {
    context: &'ctx Context,
    builder: &'a Builder<'ctx>,
    module: &'a Module<'ctx>,
    fpm: &'a PassManager<FunctionValue<'ctx>>,
    /// Process-wide prototype registry, shared across module swaps.
    protos: &'a mut HashMap<String, Prototype>,
    /// Name → entry-block stack slot for the function being compiled.
    variables: HashMap<String, PointerValue<'ctx>>,
    function: Option<FunctionValue<'ctx>>,
}

impl<'a, 'ctx> Codegen<'a, 'ctx> {
    pub fn new(
        context: &'ctx Context,
        builder: &'a Builder<'ctx>,
        module: &'a Module<'ctx>,
        fpm: &'a PassManager<FunctionValue<'ctx>>,
        protos: &'a mut HashMap<String, Prototype>,
    ) -> Self {
        Self {
            context,
            builder,
            module,
            fpm,
            protos,
            variables: HashMap::new(),
            function: None,
        }
    }

    /// Declare an `extern` prototype and record it in the registry.
    pub fn compile_extern(&mut self, proto: Prototype) -> FunctionValue<'ctx> {
        let function = self.compile_prototype(&proto);
        self.protos.insert(proto.name.clone(), proto);
        function
    }

    /// Compile a function definition into the current module.
    ///
    /// A binary-operator definition installs its precedence before the body
    /// is lowered, so the body (and everything after it) can already use the
    /// operator. If the body fails to lower, the half-built function is
    /// erased from the module and the precedence entry is retracted.
    pub fn compile_function(
        &mut self,
        fun: &ast::Function,
        ops: &mut PrecedenceTable,
    ) -> Result<FunctionValue<'ctx>> {
        let proto = &fun.proto;
        self.protos.insert(proto.name.clone(), proto.clone());
        let function = self
            .get_function(&proto.name)
            .expect("prototype was just registered");

        if proto.is_binary_op() {
            debug!(
                "installing binary operator '{}' at precedence {}",
                proto.operator_symbol() as char,
                proto.precedence
            );
            ops.install(proto.operator_symbol(), proto.precedence);
        }

        let entry = self.context.append_basic_block(function, "entry");
        self.builder.position_at_end(entry);
        self.function = Some(function);
        self.variables.clear();

        match self.compile_function_body(function, fun) {
            Ok(()) => {
                assert!(function.verify(true), "generated function failed verification");
                self.fpm.run_on(&function);
                Ok(function)
            }
            Err(err) => {
                unsafe { function.delete() };
                if proto.is_binary_op() {
                    debug!(
                        "retracting binary operator '{}' after failed body",
                        proto.operator_symbol() as char
                    );
                    ops.retract(proto.operator_symbol());
                }
                Err(err)
            }
        }
    }

    fn compile_function_body(
        &mut self,
        function: FunctionValue<'ctx>,
        fun: &ast::Function,
    ) -> Result<()> {
        for (param, name) in function.get_param_iter().zip(&fun.proto.params) {
            let slot = self.create_entry_block_alloca(name)?;
            self.builder.build_store(slot, param.into_float_value())?;
            self.variables.insert(name.clone(), slot);
        }

        let ret = self.compile_expr(&fun.body)?;
        self.builder.build_return(Some(&ret))?;
        Ok(())
    }

    /// Declare a function from its prototype in the current module.
    fn compile_prototype(&self, proto: &Prototype) -> FunctionValue<'ctx> {
        let f64_type = self.context.f64_type();
        let param_types: Vec<BasicMetadataTypeEnum> =
            vec![f64_type.into(); proto.params.len()];
        let fn_type = f64_type.fn_type(&param_types, false);
        let function = self.module.add_function(&proto.name, fn_type, None);

        for (param, name) in function.get_param_iter().zip(&proto.params) {
            param.into_float_value().set_name(name);
        }

        function
    }

    /// Look up a callee: first in the current module, then in the prototype
    /// registry, materializing a fresh declaration.
    fn get_function(&mut self, name: &str) -> Option<FunctionValue<'ctx>> {
        if let Some(function) = self.module.get_function(name) {
            return Some(function);
        }
        let proto = self.protos.get(name).cloned()?;
        Some(self.compile_prototype(&proto))
    }

    fn current_function(&self) -> FunctionValue<'ctx> {
        self.function.expect("no function is being compiled")
    }

    /// Stack slot in the entry block, regardless of where the binding
    /// appears in the source. Required for mem2reg to promote it.
    fn create_entry_block_alloca(&self, name: &str) -> Result<PointerValue<'ctx>> {
        let entry = self
            .current_function()
            .get_first_basic_block()
            .expect("function has an entry block");

        let tmp = self.context.create_builder();
        match entry.get_first_instruction() {
            Some(first) => tmp.position_before(&first),
            None => tmp.position_at_end(entry),
        }
        Ok(tmp.build_alloca(self.context.f64_type(), name)?)
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<FloatValue<'ctx>> {
        match expr {
            Expr::Number(value) => Ok(self.context.f64_type().const_float(*value)),

            Expr::Variable(name) => match self.variables.get(name) {
                Some(slot) => Ok(self
                    .builder
                    .build_load(*slot, name)?
                    .into_float_value()),
                None => Err(CodegenError::UnknownVariable(name.clone())),
            },

            Expr::Unary(unary) => {
                let operand = self.compile_expr(&unary.operand)?;
                let Some(callee) = self.get_function(&Prototype::unary_name(unary.op)) else {
                    return Err(CodegenError::UnknownUnaryOperator(unary.op as char));
                };
                let call = self.builder.build_call(callee, &[operand.into()], "unop")?;
                Ok(call.as_any_value_enum().into_float_value())
            }

            Expr::Binary(binary) => self.compile_binary(binary),

            Expr::Call { callee, args } => {
                let Some(function) = self.get_function(callee) else {
                    return Err(CodegenError::UnknownFunction(callee.clone()));
                };
                if function.count_params() as usize != args.len() {
                    return Err(CodegenError::IncorrectArgumentCount {
                        expected: function.count_params(),
                        found: args.len(),
                    });
                }

                let mut compiled_args: Vec<BasicMetadataValueEnum> =
                    Vec::with_capacity(args.len());
                for arg in args {
                    compiled_args.push(self.compile_expr(arg)?.into());
                }

                let call = self.builder.build_call(function, &compiled_args, "calltmp")?;
                Ok(call.as_any_value_enum().into_float_value())
            }

            Expr::If(branch) => self.compile_if(branch),

            Expr::For(f) => self.compile_for(f),

            Expr::Var(var) => {
                let mut shadowed = Vec::with_capacity(var.bindings.len());
                let result = self.compile_var_bindings(var, &mut shadowed);
                // Restore on both success and error paths, newest first.
                for (name, old) in shadowed.into_iter().rev() {
                    match old {
                        Some(slot) => {
                            self.variables.insert(name, slot);
                        }
                        None => {
                            self.variables.remove(&name);
                        }
                    }
                }
                result
            }
        }
    }

    fn compile_binary(&mut self, binary: &ast::Binary) -> Result<FloatValue<'ctx>> {
        // Assignment doesn't evaluate its left-hand side.
        if binary.op == b'=' {
            let Expr::Variable(name) = &binary.lhs else {
                return Err(CodegenError::InvalidAssignmentTarget);
            };
            let value = self.compile_expr(&binary.rhs)?;
            let slot = match self.variables.get(name) {
                Some(slot) => *slot,
                None => return Err(CodegenError::UnknownVariable(name.clone())),
            };
            self.builder.build_store(slot, value)?;
            return Ok(value);
        }

        let lhs = self.compile_expr(&binary.lhs)?;
        let rhs = self.compile_expr(&binary.rhs)?;

        match binary.op {
            b'+' => Ok(self.builder.build_float_add(lhs, rhs, "addtmp")?),
            b'-' => Ok(self.builder.build_float_sub(lhs, rhs, "subtmp")?),
            b'*' => Ok(self.builder.build_float_mul(lhs, rhs, "multmp")?),
            b'<' => {
                let cmp = self
                    .builder
                    .build_float_compare(FloatPredicate::ULT, lhs, rhs, "cmptmp")?;
                Ok(self.builder.build_unsigned_int_to_float(
                    cmp,
                    self.context.f64_type(),
                    "booltmp",
                )?)
            }
            op => {
                // Anything else was installed by a `def binary` and must
                // have a function behind it.
                let callee = self
                    .get_function(&Prototype::binary_name(op))
                    .expect("binary operator not found");
                let call = self
                    .builder
                    .build_call(callee, &[lhs.into(), rhs.into()], "binop")?;
                Ok(call.as_any_value_enum().into_float_value())
            }
        }
    }

    fn compile_if(&mut self, branch: &ast::If) -> Result<FloatValue<'ctx>> {
        let cond = self.compile_expr(&branch.cond)?;
        let zero = self.context.f64_type().const_zero();
        let cond = self
            .builder
            .build_float_compare(FloatPredicate::ONE, cond, zero, "ifcond")?;

        let function = self.current_function();
        let then_bb = self.context.append_basic_block(function, "then");
        let else_bb = self.context.append_basic_block(function, "else");
        let merge_bb = self.context.append_basic_block(function, "ifcont");

        self.builder.build_conditional_branch(cond, then_bb, else_bb)?;

        self.builder.position_at_end(then_bb);
        let then_value = self.compile_expr(&branch.then)?;
        self.builder.build_unconditional_branch(merge_bb)?;
        // Lowering the branch may have moved the insertion point; the phi
        // needs the arm's terminal block.
        let then_end = self.builder.get_insert_block().expect("builder is positioned");

        self.builder.position_at_end(else_bb);
        let else_value = self.compile_expr(&branch.otherwise)?;
        self.builder.build_unconditional_branch(merge_bb)?;
        let else_end = self.builder.get_insert_block().expect("builder is positioned");

        self.builder.position_at_end(merge_bb);
        let phi = self.builder.build_phi(self.context.f64_type(), "iftmp")?;
        phi.add_incoming(&[(&then_value, then_end), (&else_value, else_end)]);

        Ok(phi.as_any_value_enum().into_float_value())
    }

    fn compile_for(&mut self, f: &ast::For) -> Result<FloatValue<'ctx>> {
        let function = self.current_function();
        let slot = self.create_entry_block_alloca(&f.var)?;

        // The start value is evaluated outside the induction variable's
        // scope.
        let start = self.compile_expr(&f.start)?;
        self.builder.build_store(slot, start)?;

        let loop_bb = self.context.append_basic_block(function, "loop");
        self.builder.build_unconditional_branch(loop_bb)?;
        self.builder.position_at_end(loop_bb);

        let shadowed = self.variables.insert(f.var.clone(), slot);
        let result = self.compile_loop_tail(function, f, slot, loop_bb);
        match shadowed {
            Some(old) => {
                self.variables.insert(f.var.clone(), old);
            }
            None => {
                self.variables.remove(&f.var);
            }
        }
        result?;

        // A for expression always evaluates to 0.0.
        Ok(self.context.f64_type().const_zero())
    }

    fn compile_loop_tail(
        &mut self,
        function: FunctionValue<'ctx>,
        f: &ast::For,
        slot: PointerValue<'ctx>,
        loop_bb: BasicBlock<'ctx>,
    ) -> Result<()> {
        // The body's value is discarded, but it must still lower.
        self.compile_expr(&f.body)?;

        let step = match &f.step {
            Some(step) => self.compile_expr(step)?,
            None => self.context.f64_type().const_float(1.0),
        };
        let end = self.compile_expr(&f.end)?;

        let cur = self
            .builder
            .build_load(slot, &f.var)?
            .into_float_value();
        let next = self.builder.build_float_add(cur, step, "nextvar")?;
        self.builder.build_store(slot, next)?;

        let zero = self.context.f64_type().const_zero();
        let end_cond = self
            .builder
            .build_float_compare(FloatPredicate::ONE, end, zero, "loopcond")?;

        let after_bb = self.context.append_basic_block(function, "afterloop");
        self.builder
            .build_conditional_branch(end_cond, loop_bb, after_bb)?;
        self.builder.position_at_end(after_bb);

        Ok(())
    }

    fn compile_var_bindings(
        &mut self,
        var: &ast::Var,
        shadowed: &mut Vec<(String, Option<PointerValue<'ctx>>)>,
    ) -> Result<FloatValue<'ctx>> {
        for (name, init) in &var.bindings {
            // The initializer sees the outer binding, not the new one:
            // `var a = a in ...` refers to the enclosing `a`.
            let value = match init {
                Some(init) => self.compile_expr(init)?,
                None => self.context.f64_type().const_zero(),
            };

            let slot = self.create_entry_block_alloca(name)?;
            self.builder.build_store(slot, value)?;
            shadowed.push((name.clone(), self.variables.insert(name.clone(), slot)));
        }

        self.compile_expr(&var.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::{Lexer, Token};
    use crate::parser::Parser;

    struct Lowered<'ctx> {
        module: Module<'ctx>,
        ops: PrecedenceTable,
        protos: HashMap<String, Prototype>,
        results: Vec<std::result::Result<(), CodegenError>>,
    }

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

    /// Parse and lower every top-level form of `source` into one module,
    /// interleaved the way the driver does it (so operator definitions are
    /// live for the forms that follow).
    fn lower_all<'ctx>(context: &'ctx Context, source: &str) -> Lowered<'ctx> {
        let module = context.create_module("test");
        let builder = context.create_builder();
        let fpm = new_fpm(&module);
        let mut protos = HashMap::new();
        let mut parser = Parser::new(Lexer::new(source.as_bytes()));
        let mut results = Vec::new();

        loop {
            match parser.current().clone() {
                Token::Eof => break,
                Token::Char(b';') => parser.advance(),
                Token::Def => {
                    let fun = parser.parse_definition().expect("parse error");
                    let mut codegen =
                        Codegen::new(context, &builder, &module, &fpm, &mut protos);
                    results.push(codegen.compile_function(&fun, parser.ops_mut()).map(|_| ()));
                }
                Token::Extern => {
                    let proto = parser.parse_extern().expect("parse error");
                    let mut codegen =
                        Codegen::new(context, &builder, &module, &fpm, &mut protos);
                    codegen.compile_extern(proto);
                    results.push(Ok(()));
                }
                _ => {
                    let fun = parser.parse_top_level_expr().expect("parse error");
                    let mut codegen =
                        Codegen::new(context, &builder, &module, &fpm, &mut protos);
                    results.push(codegen.compile_function(&fun, parser.ops_mut()).map(|_| ()));
                }
            }
        }

        Lowered {
            module,
            ops: parser.ops().clone(),
            protos,
            results,
        }
    }

    #[test]
    fn function_definition_compiles() {
        let context = Context::create();
        let lowered = lower_all(
            &context,
            "def fib(x) if x < 3 then 1 else fib(x-1) + fib(x-2);",
        );
        assert!(lowered.results.iter().all(Result::is_ok));

        let fib = lowered.module.get_function("fib").unwrap();
        assert_eq!(fib.count_params(), 1);
        assert!(lowered.protos.contains_key("fib"));
    }

    #[test]
    fn control_flow_and_locals_compile() {
        let context = Context::create();
        let lowered = lower_all(
            &context,
            "def loop(n) for i = 1, i < n in i; \
             def locals(x) var a = 1, b in a + b + x; \
             def assign(x) x = 4;",
        );
        assert!(lowered.results.iter().all(Result::is_ok));
    }

    #[test]
    fn unknown_variable_erases_the_function() {
        let context = Context::create();
        let lowered = lower_all(&context, "def f(x) y;");

        assert!(matches!(
            lowered.results[0],
            Err(CodegenError::UnknownVariable(_))
        ));
        assert_eq!(
            lowered.results[0].as_ref().unwrap_err().to_string(),
            "Unknown variable name"
        );
        assert!(lowered.module.get_function("f").is_none());
    }

    #[test]
    fn binary_operator_definition_installs_precedence() {
        let context = Context::create();
        let lowered = lower_all(&context, "def binary : 1 (x y) y; def binary& (a b) a;");

        assert!(lowered.results.iter().all(Result::is_ok));
        assert_eq!(lowered.ops.precedence(b':'), Some(1));
        assert_eq!(lowered.ops.precedence(b'&'), Some(30));
        assert!(lowered.module.get_function("binary:").is_some());
    }

    #[test]
    fn failed_operator_body_retracts_the_precedence_entry() {
        let context = Context::create();
        let lowered = lower_all(&context, "def binary % (x y) nosuchvariable;");

        assert!(lowered.results[0].is_err());
        assert_eq!(lowered.ops.precedence(b'%'), None);
        assert!(lowered.module.get_function("binary%").is_none());
    }

    #[test]
    fn user_operator_is_usable_by_later_definitions() {
        let context = Context::create();
        let lowered = lower_all(
            &context,
            "def binary : 1 (x y) y; def seq(a b) a : b;",
        );
        assert!(lowered.results.iter().all(Result::is_ok));
    }

    #[test]
    fn assignment_target_must_be_a_variable() {
        let context = Context::create();
        let lowered = lower_all(&context, "def f(x) 1 = 2;");

        assert!(matches!(
            lowered.results[0],
            Err(CodegenError::InvalidAssignmentTarget)
        ));
        assert_eq!(
            lowered.results[0].as_ref().unwrap_err().to_string(),
            "destination of '=' must be a variable"
        );
    }

    #[test]
    fn call_arity_is_checked() {
        let context = Context::create();
        let lowered = lower_all(&context, "def f(x) x; def g(y) f(y, y);");

        assert!(matches!(
            lowered.results[1],
            Err(CodegenError::IncorrectArgumentCount {
                expected: 1,
                found: 2
            })
        ));
    }

    #[test]
    fn unknown_unary_operator_is_reported() {
        let context = Context::create();
        let lowered = lower_all(&context, "def f(x) $x;");

        assert!(matches!(
            lowered.results[0],
            Err(CodegenError::UnknownUnaryOperator('$'))
        ));
    }

    #[test]
    fn unknown_callee_is_reported() {
        let context = Context::create();
        let lowered = lower_all(&context, "nosuchfunction(1);");

        assert!(matches!(
            lowered.results[0],
            Err(CodegenError::UnknownFunction(_))
        ));
    }

    #[test]
    fn registry_materializes_declarations_in_fresh_modules() {
        let context = Context::create();
        let builder = context.create_builder();
        let mut protos = HashMap::new();

        // First module: only the extern declaration.
        let first = context.create_module("first");
        let fpm = new_fpm(&first);
        let mut codegen = Codegen::new(&context, &builder, &first, &fpm, &mut protos);
        let mut parser = Parser::new(Lexer::new(&b"extern sin(x)"[..]));
        codegen.compile_extern(parser.parse_extern().unwrap());
        assert!(protos.contains_key("sin"));

        // Second module: the call must re-synthesize the declaration from
        // the registry.
        let second = context.create_module("second");
        let fpm = new_fpm(&second);
        let mut codegen = Codegen::new(&context, &builder, &second, &fpm, &mut protos);
        let mut parser = Parser::new(Lexer::new(&b"sin(0)"[..]));
        let fun = parser.parse_top_level_expr().unwrap();
        codegen.compile_function(&fun, parser.ops_mut()).unwrap();

        assert!(second.get_function("sin").is_some());
        assert!(second.get_function(crate::ANONYMOUS_FUNCTION_NAME).is_some());
    }
}
