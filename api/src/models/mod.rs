pub mod session;
pub mod social;
pub mod user;
pub mod visitor;
