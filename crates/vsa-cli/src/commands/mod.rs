pub mod replay;
pub mod tool;
