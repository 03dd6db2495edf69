//! Driver
//!
//! The read-lower-dispatch loop. Each top-level form is parsed and handed to
//! the lowerer: a `def` becomes a full function, an `extern` a declaration,
//! and a bare expression an anonymous nullary function. In JIT mode the
//! anonymous function is executed immediately and its module removed again
//! afterwards; in AOT mode everything accumulates in a single module that is
//! written to `output.o` at end of input.
//!
//! All interactive output (the `ready> ` prompt, trace lines, errors, and
//! evaluation results) goes to standard error, leaving standard out free.

use std::collections::HashMap;
use std::io::Read;
use std::mem;
use std::path::Path;

use thiserror::Error;
use tracing::trace;

use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::execution_engine::ExecutionEngine;
use inkwell::module::Module;
use inkwell::passes::PassManager;
use inkwell::targets::{
    CodeModel, FileType, InitializationConfig, RelocMode, Target, TargetMachine,
};
use inkwell::values::{AnyValue, FunctionValue};
use inkwell::OptimizationLevel;

use crate::ast::Prototype;
use crate::codegen::Codegen;
use crate::lexer::{Lexer, Token};
use crate::parser::Parser;
use crate::{runtime, ANONYMOUS_FUNCTION_NAME};

const OBJECT_FILE_NAME: &str = "output.o";

/// Infrastructure failures. User-level parse and lowering errors are
/// reported inline and never abort the loop; these do.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to create JIT execution engine: {0}")]
    CreateJit(String),

    #[error("no native target available: {0}")]
    Target(String),

    #[error("failed to write object file: {0}")]
    ObjectFile(String),
}

/// Execution mode of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Evaluate top-level expressions as they are entered.
    Jit,
    /// Accumulate everything into one module and write an object file.
    Object,
}

pub struct Driver<'ctx, R> {
    context: &'ctx Context,
    builder: Builder<'ctx>,
    parser: Parser<R>,
    protos: HashMap<String, Prototype>,
    module: Module<'ctx>,
    fpm: PassManager<FunctionValue<'ctx>>,
    jit: Option<ExecutionEngine<'ctx>>,
}

impl<'ctx, R: Read> Driver<'ctx, R> {
    pub fn new(context: &'ctx Context, source: R, mode: Mode) -> Result<Self, DriverError> {
        let parser = Parser::new(Lexer::new(source));

        let jit = match mode {
            Mode::Jit => {
                // MCJIT engines are created from a module; give this one an
                // empty anchor and feed it the real modules as they are
                // finished. The engine owns every module handed to it.
                let anchor = context.create_module("kaleido-jit");
                let engine = anchor
                    .create_jit_execution_engine(OptimizationLevel::None)
                    .map_err(|err| DriverError::CreateJit(err.to_string()))?;
                Some(engine)
            }
            Mode::Object => None,
        };

        let module = new_module(context, jit.as_ref());
        let fpm = new_function_pass_manager(&module);

        Ok(Self {
            context,
            builder: context.create_builder(),
            parser,
            protos: HashMap::new(),
            module,
            fpm,
            jit,
        })
    }

    /// Run the dispatch loop until end of input. In object mode the module
    /// is written out afterwards.
    pub fn run(&mut self) -> Result<(), DriverError> {
        loop {
            eprint!("ready> ");
            match self.parser.current() {
                Token::Eof => break,
                Token::Char(b';') => self.parser.advance(),
                Token::Def => self.handle_definition(),
                Token::Extern => self.handle_extern(),
                _ => self.handle_top_level_expression(),
            }
        }

        if self.jit.is_none() {
            self.emit_object_file()?;
        }
        Ok(())
    }

    fn handle_definition(&mut self) {
        let fun = match self.parser.parse_definition() {
            Ok(fun) => fun,
            Err(err) => {
                eprintln!("Error: {err}");
                self.parser.advance(); // skip one token and retry
                return;
            }
        };

        let mut codegen = Codegen::new(
            self.context,
            &self.builder,
            &self.module,
            &self.fpm,
            &mut self.protos,
        );
        match codegen.compile_function(&fun, self.parser.ops_mut()) {
            Ok(function) => {
                eprintln!("Parsed a function definition.");
                trace!("{}", function.print_to_string().to_string());
                self.retire_to_jit();
            }
            Err(err) => eprintln!("Error: {err}"),
        }
    }

    fn handle_extern(&mut self) {
        let proto = match self.parser.parse_extern() {
            Ok(proto) => proto,
            Err(err) => {
                eprintln!("Error: {err}");
                self.parser.advance(); // skip one token and retry
                return;
            }
        };

        let mut codegen = Codegen::new(
            self.context,
            &self.builder,
            &self.module,
            &self.fpm,
            &mut self.protos,
        );
        let function = codegen.compile_extern(proto);
        eprintln!("Parsed an extern");
        trace!("{}", function.print_to_string().to_string());
    }

    fn handle_top_level_expression(&mut self) {
        let fun = match self.parser.parse_top_level_expr() {
            Ok(fun) => fun,
            Err(err) => {
                eprintln!("Error: {err}");
                self.parser.advance(); // skip one token and retry
                return;
            }
        };

        // Object mode keeps a single module, so an earlier expression's
        // wrapper has to give way to the new one.
        if self.jit.is_none() {
            if let Some(prev) = self.module.get_function(ANONYMOUS_FUNCTION_NAME) {
                unsafe { prev.delete() };
            }
        }

        let mut codegen = Codegen::new(
            self.context,
            &self.builder,
            &self.module,
            &self.fpm,
            &mut self.protos,
        );
        match codegen.compile_function(&fun, self.parser.ops_mut()) {
            Ok(function) => {
                trace!("{}", function.print_to_string().to_string());
                if self.jit.is_some() {
                    self.evaluate_anonymous();
                }
            }
            Err(err) => eprintln!("Error: {err}"),
        }
    }

    /// Hand the current module over to the JIT (definitions stay resident
    /// for the rest of the session) and open a fresh one.
    fn retire_to_jit(&mut self) {
        if self.jit.is_none() {
            return;
        }
        let module = self.swap_module();
        if let Some(engine) = self.jit.as_ref() {
            if engine.add_module(&module).is_err() {
                eprintln!("Error: module already belongs to the JIT");
                return;
            }
            runtime::bind_shims(engine, &module);
        }
    }

    /// Execute `__anon_expr` in the current module, print the result, and
    /// release the module's code again.
    fn evaluate_anonymous(&mut self) {
        let module = self.swap_module();
        let Some(engine) = self.jit.as_ref() else {
            return;
        };

        if engine.add_module(&module).is_err() {
            eprintln!("Error: module already belongs to the JIT");
            return;
        }
        runtime::bind_shims(engine, &module);

        {
            let anon = unsafe {
                engine.get_function::<unsafe extern "C" fn() -> f64>(ANONYMOUS_FUNCTION_NAME)
            };
            match anon {
                Ok(anon) => {
                    let value = unsafe { anon.call() };
                    eprintln!("Evaluated to {value:.6}");
                }
                Err(err) => eprintln!("Error: {err}"),
            }
        }

        if let Err(err) = engine.remove_module(&module) {
            eprintln!("Error: {err}");
        }
        // Dropping the module here releases the expression's code.
    }

    /// Replace the current module (and its pass manager) with a fresh one.
    fn swap_module(&mut self) -> Module<'ctx> {
        let fresh = new_module(self.context, self.jit.as_ref());
        self.fpm = new_function_pass_manager(&fresh);
        mem::replace(&mut self.module, fresh)
    }

    /// Write the accumulated module to `output.o` for the host target.
    fn emit_object_file(&self) -> Result<(), DriverError> {
        Target::initialize_native(&InitializationConfig::default())
            .map_err(DriverError::Target)?;

        let triple = TargetMachine::get_default_triple();
        let target =
            Target::from_triple(&triple).map_err(|err| DriverError::Target(err.to_string()))?;
        let machine = target
            .create_target_machine(
                &triple,
                "generic",
                "",
                OptimizationLevel::Default,
                RelocMode::Default,
                CodeModel::Default,
            )
            .ok_or_else(|| {
                DriverError::Target(String::from("no target machine for the host triple"))
            })?;

        self.module.set_triple(&triple);
        self.module
            .set_data_layout(&machine.get_target_data().get_data_layout());

        machine
            .write_to_file(&self.module, FileType::Object, Path::new(OBJECT_FILE_NAME))
            .map_err(|err| DriverError::ObjectFile(err.to_string()))?;

        println!("Wrote {OBJECT_FILE_NAME}");
        Ok(())
    }
}

fn new_module<'ctx>(context: &'ctx Context, engine: Option<&ExecutionEngine<'ctx>>) -> Module<'ctx> {
    let module = context.create_module("kaleido");
    if let Some(engine) = engine {
        module.set_data_layout(&engine.get_target_data().get_data_layout());
    }
    module
}

/// The legacy per-function pass pipeline: mem2reg first so the entry-block
/// allocas become SSA registers, then the tutorial's peephole set.
fn new_function_pass_manager<'ctx>(module: &Module<'ctx>) -> PassManager<FunctionValue<'ctx>> {
    let fpm = PassManager::create(module);
    fpm.add_promote_memory_to_register_pass();
    fpm.add_instruction_combining_pass();
    fpm.add_reassociate_pass();
    fpm.add_gvn_pass();
    fpm.add_cfg_simplification_pass();
    fpm.initialize();
    fpm
}
