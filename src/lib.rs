pub mod branches;
pub mod changes;
pub mod cli;
pub mod errors;
pub mod git;
pub mod import;
pub mod largefile;
pub mod mapper;
pub mod models;
pub mod p4;
pub mod runtime;
pub mod state;
pub mod submit;
pub mod users;
pub mod util;
