pub mod check_cmd;
pub mod run_cmd;
