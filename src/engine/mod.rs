//! Engine module - compilation, execution and judging of single jobs

pub mod checker;
pub mod compiler;
pub mod executor;
pub mod runner;

pub use checker::Checker;
pub use compiler::{
    compile_log_path, compile_solution, compile_with_dependencies, CompiledSolution, Compiler,
    ToolchainCompiler,
};
pub use executor::{Backend, ExecuteRequest, Executor};
pub use runner::{run_test, TestRun};
