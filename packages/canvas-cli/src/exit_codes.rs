//! Process exit codes shared by all subcommands.

pub const SUCCESS: i32 = 0;
/// Upload or processing failed
pub const EXECUTION_ERROR: i32 = 1;
/// Bad arguments, configuration or input files
pub const INPUT_ERROR: i32 = 2;
/// The destination stayed unreachable or refused the data
pub const TRANSPORT_ERROR: i32 = 3;
/// Some files were uploaded, others failed
pub const PARTIAL_FAILURE: i32 = 4;
/// Interrupted with Ctrl-C
pub const CANCELLED: i32 = 130;
