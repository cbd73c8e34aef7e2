//! Model-level components built from the lower-level modules.

pub mod quantizer;
