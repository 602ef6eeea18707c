#[macro_use]
pub mod util;

pub mod abstraction;
pub mod config;
pub mod discovery;
pub mod interestingness;
pub mod iwho;
pub mod predictors;
