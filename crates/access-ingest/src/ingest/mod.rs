pub mod decrypt;
pub mod hasher;
pub mod parser;
pub mod pipeline;
pub mod source;
