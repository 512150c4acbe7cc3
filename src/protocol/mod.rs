pub mod parser;
pub mod tree;
pub mod types;
