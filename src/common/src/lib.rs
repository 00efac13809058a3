pub mod dbg;
pub mod decoder;
pub mod error;
pub mod ext;
