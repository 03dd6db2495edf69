//! Runtime shims callable from compiled code via `extern`.
//!
//! These are exported as `extern "C"` with stable symbol names so the JIT
//! can link calls to them. MCJIT cannot see symbols in the static image of
//! the host binary, so [`bind_shims`] maps any declared shim prototypes to
//! their host addresses on the execution engine.

use std::io::{self, Write};

use inkwell::execution_engine::ExecutionEngine;
use inkwell::module::Module;

/// Write the byte value of `x` to standard error.
#[no_mangle]
pub extern "C" fn putchard(x: f64) -> f64 {
    let _ = io::stderr().write_all(&[x as u8]);
    0.0
}

/// Write `x` followed by a newline to standard error.
#[no_mangle]
pub extern "C" fn printd(x: f64) -> f64 {
    let _ = writeln!(io::stderr(), "{x:.6}");
    0.0
}

// Keep the symbols alive even though nothing in the crate calls them.
#[used]
static RUNTIME_SHIMS: [extern "C" fn(f64) -> f64; 2] = [putchard, printd];

/// Map every shim the module declares to its host address.
pub fn bind_shims<'ctx>(engine: &ExecutionEngine<'ctx>, module: &Module<'ctx>) {
    let shims: [(&str, usize); 2] = [
        ("putchard", putchard as usize),
        ("printd", printd as usize),
    ];
    for (name, addr) in shims {
        if let Some(function) = module.get_function(name) {
            engine.add_global_mapping(&function, addr);
        }
    }
}
